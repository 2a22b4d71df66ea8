use crate::{
    error::{ErrorKind, RunResult},
    node::{
        NodeKind, NodeRef, OpKind, Payload, make_any, make_bool, make_empty, make_float, make_int, make_list,
        make_object, make_pipe_list, make_string, param_name, repr, shallow_clone, type_repr,
    },
    walker::{
        get_explicit_type, match_pattern, match_types, pattern_binding_names, shape_of, sort_and_unique,
    },
};

use super::{Typechecker, clear_scalar_literal};

/// Whole-function return inference.
///
/// Walks the body with parameters bound to their declared types, collects
/// every `ret` path plus the final expression, canonicalizes the union and
/// reconciles it with an explicit annotation. The result is stored as the
/// function's return type.
pub(crate) fn type_func(tc: &mut Typechecker, node: &NodeRef) -> RunResult<()> {
    let (name, params, closure, body, declared_ret) = {
        let n = node.borrow();
        let Payload::Function(f) = &n.payload else {
            return Ok(());
        };
        (
            f.name.clone(),
            f.params.clone(),
            f.closure.clone(),
            f.body.clone(),
            f.return_type.clone(),
        )
    };

    // already on the inference chain: the recorded type stands
    if tc.file_chain.iter().skip(1).any(|segment| segment == &name) {
        return Ok(());
    }

    let func_scope = crate::scope::Scope::new();
    for (key, value) in &closure {
        func_scope.insert(key.clone(), value.clone());
    }

    // parameters contribute their declared types
    for param in &params {
        let mut declared = get_explicit_type(tc, param, Some(&closure))?;

        let needs_shape = {
            let d = declared.borrow();
            matches!(&d.payload, Payload::Object { is_type, .. } if !is_type)
        };
        if needs_shape {
            declared = shape_of(tc, &declared)?;
        }
        if declared.borrow().kind() == NodeKind::PipeList {
            let members = crate::walker::set_items(&declared);
            let mut reshaped = Vec::with_capacity(members.len());
            for member in members {
                let literal_object = matches!(&member.borrow().payload, Payload::Object { is_type, .. } if !is_type);
                reshaped.push(if literal_object { shape_of(tc, &member)? } else { member });
            }
            declared = make_pipe_list(reshaped).into_ref();
        }
        let is_refinement = matches!(&declared.borrow().payload, Payload::Function(f) if f.is_type);
        if is_refinement {
            let inner = {
                let d = declared.borrow();
                let Payload::Function(f) = &d.payload else { unreachable!() };
                f.params.first().cloned()
            };
            if let Some(inner) = inner {
                declared = get_explicit_type(tc, &inner, Some(&closure))?;
            }
        }

        let self_type = shallow_clone(&declared);
        declared.borrow_mut().meta.allowed_type = Some(self_type);
        if let Some(binding) = param_name(param) {
            func_scope.insert(binding, declared);
        }
    }

    let saved_scope = std::mem::replace(&mut tc.scope, func_scope);
    tc.file_chain.push(name.clone());

    let outcome: RunResult<Vec<NodeRef>> = (|| {
        let statements = match &body.borrow().payload {
            Payload::Block(items) => items.clone(),
            _ => vec![body.clone()],
        };
        let mut returns = Vec::new();
        collect_returns(tc, &statements, true, &mut returns)?;

        // a terminal branch without an else can fall through
        let trailing_if = statements
            .iter()
            .filter(|s| !s.borrow().is_op(OpKind::Semicolon))
            .next_back()
            .is_some_and(|last| {
                matches!(
                    last.borrow().kind(),
                    NodeKind::IfStatement | NodeKind::IfBlock
                )
            });
        if trailing_if || returns.is_empty() {
            returns.push(make_empty(false).into_ref());
        }
        Ok(returns)
    })();

    tc.file_chain.pop();
    tc.scope = saved_scope;
    let mut returns = outcome?;

    // canonicalize: literals collapse, `any` swallows the union
    for ret in &returns {
        clear_scalar_literal(ret);
        let is_empty_collection = {
            let r = ret.borrow();
            match &r.payload {
                Payload::List(items) => items.is_empty(),
                Payload::Object { properties, .. } => properties.is_empty(),
                _ => false,
            }
        };
        if is_empty_collection {
            ret.borrow_mut().meta.is_literal = false;
        }
    }
    if returns.iter().any(|r| r.borrow().kind() == NodeKind::Any) {
        returns = vec![make_any().into_ref()];
    }
    sort_and_unique(tc, &mut returns)?;

    let inferred = match returns.len() {
        0 => make_empty(false).into_ref(),
        1 => returns.pop().expect("one return"),
        _ => make_pipe_list(returns).into_ref(),
    };

    if let Some(declared) = declared_ret {
        let outcome = match_types(tc, &declared, &inferred, true)?;
        if !outcome.ok {
            return Err(tc.error(
                ErrorKind::TypeError,
                format!(
                    "Function '{name}' expects to return a value of type '{}' but instead returns value of type '{}'",
                    type_repr(&declared),
                    type_repr(&inferred)
                ),
            ));
        }
    }

    if let Payload::Function(f) = &mut node.borrow_mut().payload {
        f.return_type = Some(inferred);
    }
    Ok(())
}

/// Gathers the type of every return path through a statement list.
///
/// Explicit `ret` values always count; when `tail` is set, the final
/// statement's value counts too. Branching constructs recurse so each arm
/// contributes its own paths.
fn collect_returns(tc: &mut Typechecker, statements: &[NodeRef], tail: bool, out: &mut Vec<NodeRef>) -> RunResult<()> {
    let filtered: Vec<NodeRef> = statements
        .iter()
        .filter(|s| !s.borrow().is_op(OpKind::Semicolon))
        .cloned()
        .collect();
    let len = filtered.len();

    for (i, statement) in filtered.iter().enumerate() {
        let last = tail && i + 1 == len;
        let kind = statement.borrow().kind();

        match kind {
            NodeKind::Keyword => {
                let is_ret = matches!(&statement.borrow().payload, Payload::Keyword(k) if k == "ret");
                if is_ret {
                    let value = statement.borrow().right.clone();
                    let value = match value {
                        Some(v) => tc.check_node(&v)?,
                        None => make_empty(false).into_ref(),
                    };
                    out.push(value);
                } else {
                    tc.check_node(statement)?;
                }
            }
            NodeKind::IfStatement => {
                let (cond, body) = {
                    let n = statement.borrow();
                    let Payload::IfStatement { cond, body } = &n.payload else {
                        unreachable!()
                    };
                    (cond.clone(), body.clone())
                };
                let saved = tc.scope.clone();
                tc.scope = saved.child();
                let result = (|| {
                    tc.check_node(&cond)?;
                    apply_narrowing(tc, &cond, true)?;
                    let inner = match &body.borrow().payload {
                        Payload::Block(items) => items.clone(),
                        _ => vec![body.clone()],
                    };
                    collect_returns(tc, &inner, last, out)
                })();
                tc.scope = saved;
                result?;
            }
            NodeKind::IfBlock => {
                let cases = {
                    let n = statement.borrow();
                    let Payload::IfBlock { cases } = &n.payload else { unreachable!() };
                    cases.clone()
                };
                for case in &cases {
                    let pair = {
                        let c = case.borrow();
                        if c.op_kind() == Some(OpKind::Colon) {
                            Some((c.left.clone(), c.right.clone()))
                        } else {
                            None
                        }
                    };
                    let saved = tc.scope.clone();
                    tc.scope = saved.child();
                    let result = (|| {
                        let body = match pair {
                            Some((Some(cond), Some(body))) => {
                                if cond.borrow().id_name() != Some("else") {
                                    tc.check_node(&cond)?;
                                }
                                body
                            }
                            _ => case.clone(),
                        };
                        let inner = match &body.borrow().payload {
                            Payload::Block(items) => items.clone(),
                            _ => vec![body.clone()],
                        };
                        collect_returns(tc, &inner, last, out)
                    })();
                    tc.scope = saved;
                    result?;
                }
            }
            NodeKind::MatchBlock => {
                let parts = check_match_parts(tc, statement)?;
                for part in parts {
                    if part.borrow().kind() == NodeKind::Return {
                        let inner = part.borrow().right.clone();
                        out.push(inner.unwrap_or_else(|| make_empty(false).into_ref()));
                    } else if last {
                        out.push(part);
                    }
                }
            }
            _ => {
                let value = tc.check_node(statement)?;
                if value.borrow().kind() == NodeKind::Return {
                    let inner = value.borrow().right.clone();
                    out.push(inner.unwrap_or_else(|| make_empty(false).into_ref()));
                } else if last {
                    out.push(value);
                }
            }
        }
    }
    Ok(())
}

/// Narrowing on `typeof(x) == "kind"` guards.
///
/// When an `if` condition has that shape, the guarded body sees `x` at the
/// named kind. In `strict` mode (the definition-time walk, where the
/// parameter still carries its declared union) an impossible narrowing is
/// an error; in lenient mode (call-site re-walks over specialized
/// parameters) it just marks the branch dead.
///
/// Returns `None` when the condition is not a narrowing guard, and
/// otherwise whether the narrowing is possible.
pub(crate) fn apply_narrowing(tc: &mut Typechecker, cond: &NodeRef, strict: bool) -> RunResult<Option<bool>> {
    let probe = {
        let c = cond.borrow();
        if c.op_kind() != Some(OpKind::EqEq) {
            return Ok(None);
        }
        let left = c.left.clone();
        let right = c.right.clone();
        match (left, right) {
            (Some(left), Some(right)) => {
                let call = {
                    let l = left.borrow();
                    match &l.payload {
                        Payload::FuncCall { name, args, .. }
                            if matches!(name.as_str(), "typeof" | "type" | "__type__") =>
                        {
                            args.first().and_then(|a| a.borrow().id_name().map(str::to_owned))
                        }
                        _ => None,
                    }
                };
                let kind_name = right.borrow().as_str().map(str::to_owned);
                match (call, kind_name) {
                    (Some(var), Some(kind)) => Some((var, kind)),
                    _ => None,
                }
            }
            _ => None,
        }
    };

    let Some((var_name, kind_name)) = probe else {
        return Ok(None);
    };

    let narrowed = match kind_name.as_str() {
        "int" => make_int(0, false).into_ref(),
        "float" => make_float(0.0, false).into_ref(),
        "bool" => make_bool(false, false).into_ref(),
        "string" => make_string("", false).into_ref(),
        "object" => make_object(false).into_ref(),
        "list" => make_list(vec![make_any().into_ref()], false).into_ref(),
        "null" | "empty" => make_empty(false).into_ref(),
        _ => return Ok(None),
    };

    let Some(var) = tc.scope.get(&var_name) else {
        return Ok(None);
    };
    let possible = match_types(tc, &var, &narrowed, true)?;
    if !possible.ok {
        if strict {
            return Err(tc.error(
                ErrorKind::TypeError,
                format!(
                    "Parameter '{var_name}' can only be of type '{}'",
                    type_repr(&var)
                ),
            ));
        }
        return Ok(Some(false));
    }
    tc.scope.insert(var_name, narrowed);
    Ok(Some(true))
}

/// Match checking with exhaustiveness: a union-typed discriminant
/// re-checks the block once per alternative, a non-literal boolean needs
/// both truth values covered, and list discriminants need an empty case.
/// Returns the raw parts (which may include `Return` nodes from `ret`
/// inside arms).
pub(crate) fn check_match_parts(tc: &mut Typechecker, node: &NodeRef) -> RunResult<Vec<NodeRef>> {
    let (value_node, cases) = {
        let n = node.borrow();
        let Payload::MatchBlock { value, cases } = &n.payload else {
            unreachable!()
        };
        (value.clone(), cases.clone())
    };
    let value = tc.check_node(&value_node)?;
    let name_hint = value_node.borrow().id_name().map(str::to_owned);

    let value_type = shape_of(tc, &value)?;

    if value_type.borrow().kind() == NodeKind::PipeList {
        // every alternative must find a covering case
        let mut parts = Vec::new();
        for alternative in crate::walker::set_items(&value_type) {
            alternative.borrow_mut().meta.is_type = true;
            parts.extend(match_cases(tc, &alternative, &cases, name_hint.as_deref())?);
        }
        return Ok(parts);
    }

    if value_type.borrow().kind() == NodeKind::List {
        let has_empty_case = cases.iter().any(|case| {
            let c = case.borrow();
            if c.op_kind() != Some(OpKind::Colon) {
                return true;
            }
            c.left.as_ref().is_some_and(|pattern| {
                let p = pattern.borrow();
                matches!(&p.payload, Payload::List(items) if items.is_empty())
                    || matches!(p.id_name(), Some("_" | "else"))
            })
        });
        if !has_empty_case {
            tc.note_position_of(node);
            return Err(tc.error(ErrorKind::TypeError, "Missing empty case for type 'list'"));
        }
    }

    let is_open_bool = value.borrow().kind() == NodeKind::Bool && !value.borrow().meta.is_literal;
    if is_open_bool {
        let mut parts = Vec::new();
        for truth in [true, false] {
            let literal = make_bool(truth, true).into_ref();
            parts.extend(match_cases(tc, &literal, &cases, name_hint.as_deref())?);
        }
        return Ok(parts);
    }

    match_cases(tc, &value, &cases, name_hint.as_deref())
}

fn match_cases(
    tc: &mut Typechecker,
    value: &NodeRef,
    cases: &[NodeRef],
    name_hint: Option<&str>,
) -> RunResult<Vec<NodeRef>> {
    let mut parts = Vec::new();

    for case in cases {
        let pair = {
            let c = case.borrow();
            if c.op_kind() == Some(OpKind::Colon) {
                Some((c.left.clone(), c.right.clone()))
            } else {
                None
            }
        };

        let Some((Some(pattern), Some(body))) = pair else {
            let result = tc.check_case_body(case)?;
            clear_scalar_literal(&result);
            parts.push(result);
            continue;
        };

        let wildcard = matches!(pattern.borrow().id_name(), Some("_" | "else"));
        let resolved = if wildcard {
            None
        } else if pattern.borrow().id_name().is_some() {
            Some(tc.check_node(&pattern)?)
        } else {
            Some(pattern.clone())
        };

        let matched = match &resolved {
            None => true,
            Some(p) => match_pattern(tc, p, value)?,
        };
        if !matched {
            continue;
        }

        // the matched discriminant narrows inside the arm
        if let Some(hint) = name_hint {
            tc.scope.insert(hint.to_owned(), value.clone());
        }
        let result = tc.check_case_body(&body)?;
        clear_scalar_literal(&result);
        if let Some(p) = &resolved {
            for bound in pattern_binding_names(p) {
                tc.scope.remove(&bound);
            }
        }
        parts.push(result);
    }

    if parts.is_empty() {
        return Err(tc.error(
            ErrorKind::TypeError,
            format!("Missing match case for type '{}'", repr(value)),
        ));
    }
    Ok(parts)
}

/// The expression-level view of a match block: the canonical union of its
/// arm results, control nodes stripped.
pub(crate) fn check_match(tc: &mut Typechecker, node: &NodeRef) -> RunResult<NodeRef> {
    let parts = check_match_parts(tc, node)?;
    let mut values = Vec::with_capacity(parts.len());
    for part in parts {
        match part.borrow().kind() {
            NodeKind::Return => {
                if let Some(inner) = part.borrow().right.clone() {
                    values.push(inner);
                }
            }
            NodeKind::Break | NodeKind::Continue => {}
            _ => values.push(part.clone()),
        }
    }
    sort_and_unique(tc, &mut values)?;
    match values.len() {
        0 => Ok(make_empty(false).into_ref()),
        1 => Ok(values.pop().expect("one value")),
        _ => Ok(make_pipe_list(values).into_ref()),
    }
}

impl Typechecker {
    fn note_position_of(&mut self, node: &NodeRef) {
        let n = node.borrow();
        self.line = n.line;
        self.column = n.column;
    }
}
