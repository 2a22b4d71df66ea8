use ahash::AHashMap;

use crate::{
    error::{ErrorKind, RunError, RunResult},
    node::{
        NodeKind, NodeRef, OpKind, Payload, make_any, make_list, param_annotation, param_is_variadic, repr,
        shallow_clone, type_repr,
    },
};

/// The seam shared by the evaluator and the type checker.
///
/// The structural matcher, overload resolution and the pattern matcher are
/// identical in both walkers except for how sub-expressions are evaluated
/// and whether refinement predicates actually run; this trait carries those
/// differences.
pub(crate) trait Walker {
    /// Evaluates a node in the current environment.
    fn eval(&mut self, node: &NodeRef) -> RunResult<NodeRef>;

    /// Evaluates a node with extra bindings layered over the current
    /// environment; used to resolve parameter annotations against a
    /// function's closure.
    fn eval_with_bindings(&mut self, node: &NodeRef, bindings: &AHashMap<String, NodeRef>) -> RunResult<NodeRef>;

    /// Calls a function value with already-evaluated arguments.
    fn call(&mut self, func: &NodeRef, args: Vec<NodeRef>) -> RunResult<NodeRef>;

    /// Binds a name in the current scope (pattern captures).
    fn bind(&mut self, name: &str, value: NodeRef);

    /// Removes a pattern capture again.
    fn unbind(&mut self, name: &str);

    /// Builds an error at the current position.
    fn err(&self, kind: ErrorKind, message: String) -> RunError;

    /// Records a node's position for subsequent diagnostics.
    fn note_position(&mut self, node: &NodeRef);

    /// Whether this walker is the abstract (type checking) one.
    fn checking(&self) -> bool;
}

/// Outcome of a structural match: a flag plus a diagnostic fragment for
/// the failure report.
#[derive(Debug, Clone)]
pub(crate) struct Match {
    pub ok: bool,
    pub message: String,
}

impl Match {
    pub fn passed() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Whether a node is an overload set (a `FuncList`, or a `PipeList` whose
/// members are all functions).
pub(crate) fn is_function_set(node: &NodeRef) -> bool {
    let n = node.borrow();
    match &n.payload {
        Payload::FuncList(items) => !items.is_empty(),
        Payload::PipeList(items) => {
            !items.is_empty() && items.iter().all(|i| i.borrow().kind() == NodeKind::Function)
        }
        _ => false,
    }
}

pub(crate) fn set_items(node: &NodeRef) -> Vec<NodeRef> {
    match &node.borrow().payload {
        Payload::FuncList(items) | Payload::PipeList(items) => items.clone(),
        _ => Vec::new(),
    }
}

/// Collapses a one-element union or overload set to its element.
pub(crate) fn unwrap_singleton(node: NodeRef) -> NodeRef {
    let single = match &node.borrow().payload {
        Payload::PipeList(items) | Payload::FuncList(items) if items.len() == 1 => Some(items[0].clone()),
        _ => None,
    };
    single.unwrap_or(node)
}

/// The declared type of a parameter node, evaluated. A missing annotation
/// is `any` (or `[any]` for a variadic slot); an empty list annotation gets
/// an `any` element pushed into it.
pub(crate) fn get_explicit_type<W: Walker>(
    w: &mut W,
    param: &NodeRef,
    closure: Option<&AHashMap<String, NodeRef>>,
) -> RunResult<NodeRef> {
    let result = match param_annotation(param) {
        Some(ann) => match closure {
            Some(bindings) => w.eval_with_bindings(&ann, bindings)?,
            None => w.eval(&ann)?,
        },
        None => {
            if param_is_variadic(param) {
                make_list(vec![make_any().into_ref()], false).into_ref()
            } else {
                make_any().into_ref()
            }
        }
    };
    if let Payload::List(items) = &mut result.borrow_mut().payload
        && items.is_empty()
    {
        items.push(make_any().into_ref());
    }
    Ok(result)
}

/// Literal value equality for scalar kinds.
pub(crate) fn match_values(a: &NodeRef, b: &NodeRef) -> bool {
    let (a, b) = (a.borrow(), b.borrow());
    match (&a.payload, &b.payload) {
        (Payload::Int(x), Payload::Int(y)) => x == y,
        (Payload::Float(x), Payload::Float(y)) => x == y,
        (Payload::Bool(x), Payload::Bool(y)) => x == y,
        (Payload::Str(x), Payload::Str(y)) => x == y,
        _ => false,
    }
}

/// Canonicalizes a union: sort alternatives by kind ordinal, then drop
/// alternatives structurally equal to an earlier one.
pub(crate) fn sort_and_unique<W: Walker>(w: &mut W, items: &mut Vec<NodeRef>) -> RunResult<()> {
    items.sort_by_key(|n| n.borrow().kind());
    let mut unique: Vec<NodeRef> = Vec::with_capacity(items.len());
    'outer: for item in items.drain(..) {
        for kept in &unique {
            if match_types(w, kept, &item, true)?.ok {
                continue 'outer;
            }
        }
        unique.push(item);
    }
    *items = unique;
    Ok(())
}

/// The structural matcher (the single source of type compatibility).
///
/// Decides whether `b` satisfies the type `a`. Rules apply in order, first
/// match wins; see the individual branches.
pub(crate) fn match_types<W: Walker>(w: &mut W, a: &NodeRef, b: &NodeRef, match_name: bool) -> RunResult<Match> {
    w.note_position(b);

    let a_kind = a.borrow().kind();
    let b_kind = b.borrow().kind();

    // any / the `type` kind match everything
    if a_kind == NodeKind::Any || b_kind == NodeKind::Any || a_kind == NodeKind::TypeMarker {
        return Ok(Match::passed());
    }

    // named object discipline
    if match_name && a_kind == NodeKind::Object && b_kind == NodeKind::Object {
        let a_name = a.borrow().meta.name.clone();
        let b_name = b.borrow().meta.name.clone();
        if !b_name.is_empty() && a_name != b_name {
            return Ok(Match::failed(String::new()));
        }
    }

    // overload set on the type side: resolve, then match the winner
    if is_function_set(a) {
        let chosen = match_function(w, a, &[b.clone()])?;
        return match_types(w, &chosen, b, match_name);
    }

    if a_kind == NodeKind::Function && is_function_set(b) {
        for alt in set_items(b) {
            if match_types(w, a, &alt, match_name)?.ok {
                return Ok(Match::passed());
            }
        }
        return Ok(Match::failed(format!(
            "Cannot match against ambiguous function '{}'",
            repr(b)
        )));
    }

    // refinement: a predicate used as a type
    if a_kind == NodeKind::Function && b_kind != NodeKind::Function {
        return match_refinement(w, a, b, match_name);
    }

    if a_kind == NodeKind::PipeList {
        if b_kind == NodeKind::PipeList {
            let mut a_items = set_items(a);
            let mut b_items = set_items(b);
            sort_and_unique(w, &mut a_items)?;
            sort_and_unique(w, &mut b_items)?;
            for b_alt in &b_items {
                let mut any = false;
                for a_alt in &a_items {
                    if match_types(w, a_alt, b_alt, match_name)?.ok {
                        stamp_nominal_tag(a_alt, b_alt);
                        any = true;
                        break;
                    }
                }
                if !any {
                    return Ok(Match::failed(String::new()));
                }
            }
            return Ok(Match::passed());
        }

        let mut message = String::new();
        for a_alt in set_items(a) {
            let result = match_types(w, &a_alt, b, match_name)?;
            if result.ok {
                stamp_nominal_tag(&a_alt, b);
                return Ok(Match::passed());
            }
            message = result.message;
        }
        return Ok(Match::failed(message));
    }

    if a_kind != b_kind {
        return Ok(Match::failed(String::new()));
    }

    // literal types constrain the value itself
    let a_is_literal = a.borrow().meta.is_literal;
    if a_is_literal
        && !matches!(
            a_kind,
            NodeKind::List | NodeKind::Object | NodeKind::Function | NodeKind::PartialOp
        )
    {
        if !match_values(a, b) {
            return Ok(Match::failed(format!(
                "Literal type '{}' does not match value '{}'",
                repr(a),
                repr(b)
            )));
        }
        return Ok(Match::passed());
    }

    match a_kind {
        NodeKind::List => match_list(w, a, b, match_name),
        NodeKind::Object => match_object(w, a, b, match_name),
        NodeKind::Function => match_function_shape(w, a, b, match_name),
        _ => Ok(Match::passed()),
    }
}

/// Transfers a nominal tag from a matched named alternative onto the value.
fn stamp_nominal_tag(alternative: &NodeRef, value: &NodeRef) {
    let tag = {
        let alt = alternative.borrow();
        let is_named_type = match &alt.payload {
            Payload::Object { is_type, .. } => *is_type,
            _ => false,
        };
        if is_named_type && !alt.meta.name.is_empty() {
            Some(alt.meta.name.clone())
        } else {
            None
        }
    };
    if let Some(name) = tag {
        value.borrow_mut().meta.name = name;
    }
}

fn match_refinement<W: Walker>(w: &mut W, a: &NodeRef, b: &NodeRef, match_name: bool) -> RunResult<Match> {
    let (params, args, closure, name, body) = {
        let n = a.borrow();
        let Payload::Function(func) = &n.payload else {
            return Ok(Match::failed(String::new()));
        };
        (
            func.params.clone(),
            func.args.clone(),
            func.closure.clone(),
            func.name.clone(),
            func.body.clone(),
        )
    };

    // The refinement takes the value through its single remaining hole.
    let hole = if params.len() == 1 {
        0
    } else {
        let holes: Vec<usize> = args
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.is_none().then_some(i))
            .collect();
        match holes.as_slice() {
            [only] => *only,
            _ => return Ok(Match::failed("Refinement type function must have one parameter".to_owned())),
        }
    };

    let param = &params[hole];
    if param.borrow().id_name().is_none() {
        return Err(w.err(
            ErrorKind::TypeError,
            "Refinement type function must have one basic parameter".to_owned(),
        ));
    }

    let param_type = get_explicit_type(w, param, Some(&closure))?;
    if !match_types(w, &param_type, b, match_name)?.ok {
        return Ok(Match::failed(String::new()));
    }

    // At check time the refinement body never runs; the shape check above
    // is the whole contract.
    if w.checking() {
        return Ok(Match::passed());
    }

    let arg = w.eval(b)?;
    let verdict = w.call(a, vec![arg.clone()])?;
    if verdict.borrow().as_bool() == Some(true) {
        return Ok(Match::passed());
    }

    let base = format!("Value '{}' does not match refinement type '{name}'", repr(&arg));
    if let Some(message) = refinement_message(w, &body)? {
        return Ok(Match::failed(format!("{base} - {message}")));
    }
    Ok(Match::failed(base))
}

/// A refinement may open with a string block (`{ "message" }`) that
/// becomes the failure diagnostic.
fn refinement_message<W: Walker>(w: &mut W, body: &NodeRef) -> RunResult<Option<String>> {
    let candidate = {
        let b = body.borrow();
        match &b.payload {
            Payload::Block(nodes) => nodes.first().and_then(|first| {
                let f = first.borrow();
                match &f.payload {
                    Payload::Block(inner) if inner.len() == 1 => Some(inner[0].clone()),
                    _ => None,
                }
            }),
            _ => None,
        }
    };
    let Some(candidate) = candidate else {
        return Ok(None);
    };
    let value = w.eval(&candidate)?;
    let message = value.borrow().as_str().map(str::to_owned);
    Ok(message)
}

fn match_list<W: Walker>(w: &mut W, a: &NodeRef, b: &NodeRef, match_name: bool) -> RunResult<Match> {
    let a_len = match &a.borrow().payload {
        Payload::List(items) => items.len(),
        _ => 0,
    };
    if a_len > 1 {
        return Err(w.err(
            ErrorKind::TypeError,
            "List type cannot contain more than one type - did you mean to separate the types with the pipe operator '|'?"
                .to_owned(),
        ));
    }
    if a_len == 0 {
        if let Payload::List(items) = &mut a.borrow_mut().payload {
            items.push(make_any().into_ref());
        }
        return Ok(Match::passed());
    }

    let element_type = match &a.borrow().payload {
        Payload::List(items) => items[0].clone(),
        _ => unreachable!(),
    };
    if element_type.borrow().kind() == NodeKind::Any {
        return Ok(Match::passed());
    }

    let b_items = match &b.borrow().payload {
        Payload::List(items) => items.clone(),
        _ => Vec::new(),
    };
    for item in &b_items {
        let result = match_types(w, &element_type, item, match_name)?;
        if !result.ok {
            return Ok(result);
        }
    }
    Ok(Match::passed())
}

fn match_object<W: Walker>(w: &mut W, a: &NodeRef, b: &NodeRef, match_name: bool) -> RunResult<Match> {
    if !a.borrow().meta.is_literal {
        // the bare `object` carrier matches any object
        return Ok(Match::passed());
    }

    let a_props = match &a.borrow().payload {
        Payload::Object { properties, .. } => properties.clone(),
        _ => return Ok(Match::failed(String::new())),
    };
    let b_props = match &b.borrow().payload {
        Payload::Object { properties, .. } => properties.clone(),
        _ => return Ok(Match::failed(String::new())),
    };

    for key in b_props.keys() {
        if !a_props.contains_key(key) {
            return Ok(Match::failed(String::new()));
        }
    }
    for (key, a_prop) in &a_props {
        let Some(b_prop) = b_props.get(key) else {
            if a_prop.required {
                return Ok(Match::failed(String::new()));
            }
            continue;
        };
        let result = match_types(w, &a_prop.value, &b_prop.value, match_name)?;
        if !result.ok {
            return Ok(result);
        }
    }
    Ok(Match::passed())
}

fn match_function_shape<W: Walker>(w: &mut W, a: &NodeRef, b: &NodeRef, match_name: bool) -> RunResult<Match> {
    if !a.borrow().meta.is_literal {
        // the bare `function` carrier matches any function
        return Ok(Match::passed());
    }

    let (a_params, a_ret, a_closure) = {
        let n = a.borrow();
        let Payload::Function(f) = &n.payload else {
            return Ok(Match::failed(String::new()));
        };
        (f.params.clone(), f.return_type.clone(), f.closure.clone())
    };
    let (b_params, b_ret, b_closure) = {
        let n = b.borrow();
        let Payload::Function(f) = &n.payload else {
            return Ok(Match::failed(String::new()));
        };
        (f.params.clone(), f.return_type.clone(), f.closure.clone())
    };

    if a_params.len() != b_params.len() {
        return Ok(Match::failed(String::new()));
    }
    for (a_param, b_param) in a_params.iter().zip(&b_params) {
        if a_param.borrow().kind() != b_param.borrow().kind() {
            return Ok(Match::failed(String::new()));
        }
        let a_type = get_explicit_type(w, a_param, Some(&a_closure))?;
        let b_type = get_explicit_type(w, b_param, Some(&b_closure))?;
        // parameter types are invariant here
        let result = match_types(w, &a_type, &b_type, match_name)?;
        if !result.ok {
            return Ok(result);
        }
    }

    let a_ret = a_ret.unwrap_or_else(|| make_any().into_ref());
    let b_ret = b_ret.unwrap_or_else(|| make_any().into_ref());
    match_types(w, &a_ret, &b_ret, match_name)
}

/// Resolves an overload set against a tuple of argument values.
///
/// Candidates are tried in declaration order. An exact-arity match (every
/// hole filled) wins immediately; partial-application candidates are
/// collected, and the scan must end with exactly one of them. An `Any`
/// argument is reserved for the final (widest) overload so dispatch stays
/// deterministic on unknowns.
pub(crate) fn match_function<W: Walker>(w: &mut W, set: &NodeRef, args: &[NodeRef]) -> RunResult<NodeRef> {
    if set.borrow().kind() == NodeKind::Function {
        return Ok(shallow_clone(set));
    }

    let candidates = set_items(set);
    if candidates.len() == 1 {
        return Ok(shallow_clone(&candidates[0]));
    }

    let mut potentials: Vec<NodeRef> = Vec::new();
    let last = candidates.len().saturating_sub(1);

    'candidates: for (index, candidate) in candidates.iter().enumerate() {
        let (params, arg_slots, closure) = {
            let n = candidate.borrow();
            let Payload::Function(f) = &n.payload else {
                continue;
            };
            (f.params.clone(), f.args.clone(), f.closure.clone())
        };

        if args.len() > params.len() {
            continue;
        }

        for (i, arg) in args.iter().enumerate() {
            let param_type = unwrap_singleton(get_explicit_type(w, &params[i], Some(&closure))?);
            if arg.borrow().kind() == NodeKind::Any && index < last {
                continue 'candidates;
            }
            if !match_types(w, &param_type, arg, true)?.ok {
                continue 'candidates;
            }
        }

        let holes = arg_slots.iter().filter(|slot| slot.is_none()).count();
        if args.len() == holes {
            return Ok(shallow_clone(candidate));
        }
        potentials.push(candidate.clone());
    }

    match potentials.as_slice() {
        [] => {
            let mut signatures = String::new();
            for candidate in &candidates {
                let name = match &candidate.borrow().payload {
                    Payload::Function(f) => f.name.clone(),
                    _ => String::new(),
                };
                signatures.push_str(&format!("{name}: {}\n", type_repr(candidate)));
            }
            let mut args_str = String::from("[ ");
            for arg in args {
                args_str.push_str(&type_repr(arg));
                args_str.push(' ');
            }
            args_str.push(']');
            Err(w.err(
                ErrorKind::RuntimeError,
                format!("Cannot find matching function definition for args {args_str}. Defined functions are:\n\n{signatures}"),
            ))
        }
        [single] => Ok(shallow_clone(single)),
        many => {
            let mut signatures = String::new();
            for candidate in many {
                let name = match &candidate.borrow().payload {
                    Payload::Function(f) => f.name.clone(),
                    _ => String::new(),
                };
                signatures.push_str(&format!("{name}: {}\n", type_repr(candidate)));
            }
            Err(w.err(
                ErrorKind::RuntimeError,
                format!(
                    "Ambiguous function call - there are {} potential functions this call could refer to:\n\n{signatures}",
                    many.len()
                ),
            ))
        }
    }
}

/// The pattern matcher. Binds captures through the walker as a side
/// effect; the caller clears them once the arm finishes.
pub(crate) fn match_pattern<W: Walker>(w: &mut W, pattern: &NodeRef, value: &NodeRef) -> RunResult<bool> {
    // range pattern: a..b matches numerics in [a, b)
    if pattern.borrow().op_kind() == Some(OpKind::DoubleDot) {
        let (left, right) = {
            let p = pattern.borrow();
            (p.left.clone(), p.right.clone())
        };
        let (Some(left), Some(right)) = (left, right) else {
            return Ok(false);
        };
        let lo = w.eval(&left)?;
        let hi = w.eval(&right)?;
        let v = value.borrow();
        return Ok(match (&v.payload, lo.borrow().as_int(), hi.borrow().as_int()) {
            (Payload::Int(x), Some(lo), Some(hi)) => *x >= lo && *x < hi,
            (Payload::Float(x), Some(lo), Some(hi)) => *x >= lo as f64 && *x < hi as f64,
            _ => false,
        });
    }

    let p_kind = pattern.borrow().kind();

    if p_kind == NodeKind::List {
        return match_list_pattern(w, pattern, value);
    }

    let is_anonymous_object = p_kind == NodeKind::Object && pattern.borrow().meta.name.is_empty();
    if is_anonymous_object {
        if value.borrow().kind() != NodeKind::Object {
            return Ok(false);
        }
        let p_props = match &pattern.borrow().payload {
            Payload::Object { properties, .. } => properties.clone(),
            _ => return Ok(false),
        };
        let v_props = match &value.borrow().payload {
            Payload::Object { properties, .. } => properties.clone(),
            _ => return Ok(false),
        };
        for (key, p_prop) in &p_props {
            let Some(v_prop) = v_props.get(key) else {
                return Ok(false);
            };
            let candidate = if p_prop.value.borrow().op_kind() == Some(OpKind::TripleDot) {
                p_prop.value.clone()
            } else {
                w.eval(&p_prop.value)?
            };
            if !match_pattern(w, &candidate, &v_prop.value)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    Ok(match_types(w, pattern, value, true)?.ok)
}

fn match_list_pattern<W: Walker>(w: &mut W, pattern: &NodeRef, value: &NodeRef) -> RunResult<bool> {
    if value.borrow().kind() != NodeKind::List {
        return Ok(false);
    }
    let p_items = match &pattern.borrow().payload {
        Payload::List(items) => items.clone(),
        _ => return Ok(false),
    };
    let v_items = match &value.borrow().payload {
        Payload::List(items) => items.clone(),
        _ => return Ok(false),
    };

    // at most one `...rest` splice splits the pattern into a prefix and a
    // suffix around a bound tail
    let splice = p_items
        .iter()
        .position(|p| p.borrow().op_kind() == Some(OpKind::TripleDot));

    let (prefix, suffix) = match splice {
        Some(at) => (&p_items[..at], &p_items[at + 1..]),
        None => {
            if p_items.len() != v_items.len() {
                return Ok(false);
            }
            (&p_items[..], &p_items[..0])
        }
    };

    if v_items.len() < prefix.len() + suffix.len() {
        return Ok(false);
    }

    for (p, v) in prefix.iter().zip(&v_items) {
        if !match_element_pattern(w, p, v)? {
            return Ok(false);
        }
    }
    let tail_start = v_items.len() - suffix.len();
    for (p, v) in suffix.iter().zip(&v_items[tail_start..]) {
        if !match_element_pattern(w, p, v)? {
            return Ok(false);
        }
    }

    if let Some(at) = splice {
        let rest: Vec<NodeRef> = v_items[prefix.len()..tail_start].to_vec();
        let binder = p_items[at].borrow().right.clone();
        if let Some(binder) = binder
            && let Some(name) = binder.borrow().id_name()
        {
            w.bind(name, make_list(rest, true).into_ref());
        }
    }
    Ok(true)
}

fn match_element_pattern<W: Walker>(w: &mut W, element: &NodeRef, value: &NodeRef) -> RunResult<bool> {
    let id = element.borrow().id_name().map(str::to_owned);
    if let Some(name) = id {
        if name != "_" {
            w.bind(&name, value.clone());
        }
        return Ok(true);
    }
    if element.borrow().kind() == NodeKind::Block {
        let computed = w.eval(element)?;
        return match_pattern(w, &computed, value);
    }
    match_pattern(w, element, value)
}

/// The structural type of a value: lists collapse to their canonical
/// element union, objects to property-type maps (keeping the nominal tag),
/// functions become their own type, everything else becomes the kind
/// carrier.
pub(crate) fn shape_of<W: Walker>(w: &mut W, node: &NodeRef) -> RunResult<NodeRef> {
    let kind = node.borrow().kind();
    match kind {
        NodeKind::List => {
            let items = match &node.borrow().payload {
                Payload::List(items) => items.clone(),
                _ => unreachable!(),
            };
            if items.is_empty() {
                return Ok(make_list(vec![make_any().into_ref()], true).into_ref());
            }
            let mut element_types = Vec::with_capacity(items.len());
            for item in &items {
                element_types.push(shape_of(w, item)?);
            }
            sort_and_unique(w, &mut element_types)?;
            let element = if element_types.len() == 1 {
                element_types.pop().expect("one element")
            } else {
                crate::node::make_pipe_list(element_types).into_ref()
            };
            Ok(make_list(vec![element], true).into_ref())
        }
        NodeKind::Object => {
            let (properties, name) = {
                let n = node.borrow();
                let Payload::Object { properties, .. } = &n.payload else {
                    unreachable!()
                };
                (properties.clone(), n.meta.name.clone())
            };
            let mut prop_types = indexmap::IndexMap::with_capacity(properties.len());
            for (key, prop) in &properties {
                prop_types.insert(
                    key.clone(),
                    crate::node::Property {
                        required: prop.required,
                        value: shape_of(w, &prop.value)?,
                    },
                );
            }
            let result = crate::node::make_object(true).into_ref();
            {
                let mut r = result.borrow_mut();
                r.meta.name = name;
                if let Payload::Object { properties, is_type } = &mut r.payload {
                    *properties = prop_types;
                    *is_type = true;
                }
            }
            Ok(result)
        }
        NodeKind::Function => {
            let result = shallow_clone(node);
            {
                let mut r = result.borrow_mut();
                r.meta.is_literal = false;
                if let Payload::Function(f) = &mut r.payload {
                    f.is_type = true;
                }
            }
            Ok(result)
        }
        _ => {
            let result = shallow_clone(node);
            if !node.borrow().meta.is_type {
                result.borrow_mut().meta.is_literal = false;
            }
            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        eval::Evaluator,
        io::NoPrint,
        node::{FunctionData, Node, make_bool, make_empty, make_int, make_string},
        run::{Session, parse_source},
        scope::Scope,
    };

    fn with_walker<T>(f: impl FnOnce(&mut Evaluator<'_>) -> T) -> T {
        let mut out = NoPrint;
        let session = Session::new(String::new(), "builtins.gl".to_owned());
        let mut walker = Evaluator::new("test.gl", Scope::new(), session, &mut out);
        f(&mut walker)
    }

    fn int_carrier() -> NodeRef {
        make_int(0, false).into_ref()
    }

    fn string_carrier() -> NodeRef {
        make_string("", false).into_ref()
    }

    /// A one-parameter function whose parameter carries the given type.
    fn unary_function(name: &str, annotation: Option<NodeRef>) -> NodeRef {
        let param = Node::new(Payload::Id {
            name: "x".to_owned(),
            annotation,
        })
        .into_ref();
        Node::new(Payload::Function(FunctionData {
            name: name.to_owned(),
            params: vec![param],
            args: vec![None],
            body: make_empty(true).into_ref(),
            return_type: None,
            closure: ahash::AHashMap::new(),
            default_indices: Vec::new(),
            is_type: false,
        }))
        .into_ref()
    }

    #[test]
    fn matcher_is_reflexive() {
        with_walker(|w| {
            for node in [
                int_carrier(),
                string_carrier(),
                make_int(5, true).into_ref(),
                make_bool(true, true).into_ref(),
                make_list(vec![int_carrier()], true).into_ref(),
            ] {
                assert!(match_types(w, &node, &node, true).unwrap().ok, "{}", repr(&node));
            }
        });
    }

    #[test]
    fn matcher_is_transitive_for_carriers() {
        with_walker(|w| {
            let a = make_any().into_ref();
            let b = int_carrier();
            let c = make_int(3, true).into_ref();
            assert!(match_types(w, &a, &b, true).unwrap().ok);
            assert!(match_types(w, &b, &c, true).unwrap().ok);
            assert!(match_types(w, &a, &c, true).unwrap().ok);
        });
    }

    #[test]
    fn literal_types_constrain_values() {
        with_walker(|w| {
            let five = make_int(5, true).into_ref();
            let six = make_int(6, true).into_ref();
            assert!(match_types(w, &five, &five, true).unwrap().ok);
            let result = match_types(w, &five, &six, true).unwrap();
            assert!(!result.ok);
            assert!(result.message.contains("Literal type"));
        });
    }

    #[test]
    fn unions_canonicalize_identically() {
        with_walker(|w| {
            let mut first = vec![string_carrier(), int_carrier(), int_carrier()];
            let mut second = vec![int_carrier(), string_carrier()];
            sort_and_unique(w, &mut first).unwrap();
            sort_and_unique(w, &mut second).unwrap();
            let kinds = |items: &[NodeRef]| items.iter().map(|n| n.borrow().kind()).collect::<Vec<_>>();
            assert_eq!(kinds(&first), kinds(&second));
            assert_eq!(first.len(), 2);
        });
    }

    #[test]
    fn union_membership() {
        with_walker(|w| {
            let union = crate::node::make_pipe_list(vec![int_carrier(), string_carrier()]).into_ref();
            assert!(match_types(w, &union, &make_int(1, true).into_ref(), true).unwrap().ok);
            assert!(match_types(w, &union, &make_string("a", true).into_ref(), true).unwrap().ok);
            assert!(!match_types(w, &union, &make_bool(true, true).into_ref(), true).unwrap().ok);
        });
    }

    #[test]
    fn list_types_subsume_every_element() {
        with_walker(|w| {
            let ints = make_list(vec![int_carrier()], false).into_ref();
            let good = make_list(vec![make_int(1, true).into_ref(), make_int(2, true).into_ref()], true).into_ref();
            let bad = make_list(vec![make_int(1, true).into_ref(), make_string("x", true).into_ref()], true).into_ref();
            assert!(match_types(w, &ints, &good, true).unwrap().ok);
            assert!(!match_types(w, &ints, &bad, true).unwrap().ok);
        });
    }

    #[test]
    fn overload_resolution_is_deterministic() {
        with_walker(|w| {
            let set = crate::node::make_func_list(vec![
                unary_function("first", Some(int_carrier())),
                unary_function("second", Some(string_carrier())),
            ])
            .into_ref();
            let arg = make_string("a", true).into_ref();
            for _ in 0..3 {
                let chosen = match_function(w, &set, std::slice::from_ref(&arg)).unwrap();
                let name = match &chosen.borrow().payload {
                    Payload::Function(f) => f.name.clone(),
                    _ => String::new(),
                };
                assert_eq!(name, "second");
            }
        });
    }

    #[test]
    fn unresolvable_overloads_report_signatures() {
        with_walker(|w| {
            let set = crate::node::make_func_list(vec![
                unary_function("a", Some(int_carrier())),
                unary_function("b", Some(string_carrier())),
            ])
            .into_ref();
            let arg = make_bool(true, true).into_ref();
            let err = match_function(w, &set, std::slice::from_ref(&arg)).unwrap_err();
            assert!(err.to_string().contains("Cannot find matching function definition"));
        });
    }

    #[test]
    fn pattern_bindings_are_idempotent() {
        with_walker(|w| {
            let pattern = parse_source("pattern.gl", "[a, ...rest]").unwrap().remove(0);
            let value = parse_source("value.gl", "[1, 2, 3]").unwrap().remove(0);
            let value = w.eval(&value).unwrap();

            for _ in 0..2 {
                assert!(match_pattern(w, &pattern, &value).unwrap());
                let a = w.scope.get("a").unwrap();
                assert_eq!(a.borrow().as_int(), Some(1));
                let rest = w.scope.get("rest").unwrap();
                let Payload::List(items) = &rest.borrow().payload else {
                    panic!("expected rest list");
                };
                assert_eq!(items.len(), 2);
            }
        });
    }

    #[test]
    fn wildcards_and_splices_match_lists() {
        with_walker(|w| {
            let pattern = parse_source("p.gl", "[_, 2, ...tail]").unwrap().remove(0);
            let value = parse_source("v.gl", "[9, 2, 3, 4]").unwrap().remove(0);
            let value = w.eval(&value).unwrap();
            assert!(match_pattern(w, &pattern, &value).unwrap());

            let mismatch = parse_source("v2.gl", "[9, 5]").unwrap().remove(0);
            let mismatch = w.eval(&mismatch).unwrap();
            assert!(!match_pattern(w, &pattern, &mismatch).unwrap());
        });
    }
}

/// Names bound by a pattern, so a match arm can clean up after itself.
pub(crate) fn pattern_binding_names(pattern: &NodeRef) -> Vec<String> {
    let mut names = Vec::new();
    if let Payload::List(items) = &pattern.borrow().payload {
        for item in items {
            let i = item.borrow();
            if let Some(name) = i.id_name() {
                if name != "_" {
                    names.push(name.to_owned());
                }
            } else if i.op_kind() == Some(OpKind::TripleDot)
                && let Some(binder) = &i.right
                && let Some(name) = binder.borrow().id_name()
            {
                names.push(name.to_owned());
            }
        }
    }
    names
}
