use crate::{
    builtins::Builtin,
    error::{ErrorKind, RunResult},
    node::{
        Node, NodeKind, NodeRef, OpKind, Payload, Property, make_any, make_bool, make_float, make_int, make_list,
        repr, shallow_clone,
    },
};

use super::Evaluator;

/// Numeric view of a scalar operand; bools count as 0/1.
enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(node: &NodeRef) -> Option<Num> {
    let n = node.borrow();
    match n.payload {
        Payload::Int(v) => Some(Num::Int(v)),
        Payload::Float(v) => Some(Num::Float(v)),
        Payload::Bool(v) => Some(Num::Int(i64::from(v))),
        _ => None,
    }
}

impl Evaluator<'_> {
    fn operands(&mut self, node: &NodeRef) -> RunResult<(NodeRef, NodeRef)> {
        let (left, right) = {
            let n = node.borrow();
            (n.left.clone().expect("operand"), n.right.clone().expect("operand"))
        };
        let left = self.eval_node(&left)?;
        let right = self.eval_node(&right)?;
        Ok((left, right))
    }

    fn unsupported(&self, node: &NodeRef, left: &NodeRef, right: &NodeRef) -> crate::error::RunError {
        self.error(
            ErrorKind::RuntimeError,
            format!("Cannot perform '{}' on {} and {}", repr(node), repr(left), repr(right)),
        )
    }

    pub(crate) fn eval_add(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left, right) = self.operands(node)?;

        // null is the identity for every operator
        if left.borrow().kind() == NodeKind::Empty {
            return Ok(right);
        }
        if right.borrow().kind() == NodeKind::Empty {
            return Ok(left);
        }
        if is_abstract(&left) || is_abstract(&right) {
            return Ok(self.stamp_node(make_any()));
        }

        if let (Some(a), Some(b)) = (as_num(&left), as_num(&right)) {
            // bool+bool and int+bool stay integral like the other cross
            // products
            let result = match (a, b) {
                (Num::Int(x), Num::Int(y)) => make_int(x.wrapping_add(y), true),
                (Num::Int(x), Num::Float(y)) => make_float(x as f64 + y, true),
                (Num::Float(x), Num::Int(y)) => make_float(x + y as f64, true),
                (Num::Float(x), Num::Float(y)) => make_float(x + y, true),
            };
            return Ok(self.stamp_node(result));
        }

        let (lk, rk) = (left.borrow().kind(), right.borrow().kind());
        match (lk, rk) {
            // string concatenation, with numeric stringification
            (NodeKind::String, NodeKind::String) => {
                let joined = format!("{}{}", left.borrow().as_str().unwrap_or(""), right.borrow().as_str().unwrap_or(""));
                Ok(self.stamp_node(crate::node::make_string(joined, true)))
            }
            (NodeKind::String, NodeKind::Int | NodeKind::Float | NodeKind::Bool) => {
                let joined = format!("{}{}", left.borrow().as_str().unwrap_or(""), repr(&right));
                Ok(self.stamp_node(crate::node::make_string(joined, true)))
            }
            (NodeKind::Int | NodeKind::Float | NodeKind::Bool, NodeKind::String) => {
                let joined = format!("{}{}", repr(&left), right.borrow().as_str().unwrap_or(""));
                Ok(self.stamp_node(crate::node::make_string(joined, true)))
            }
            // list + list concatenates; element + list prepends; list +
            // element appends
            (NodeKind::List, NodeKind::List) => {
                let mut items = list_items(&left);
                items.extend(list_items(&right));
                let result = self.stamp_node(make_list(items, true));
                result.borrow_mut().meta.is_literal = left.borrow().meta.is_literal;
                Ok(result)
            }
            (NodeKind::List, _) => {
                let mut items = list_items(&left);
                items.push(right);
                Ok(self.stamp_node(make_list(items, true)))
            }
            (_, NodeKind::List) => {
                let mut items = vec![left];
                items.extend(list_items(&right));
                Ok(self.stamp_node(make_list(items, true)))
            }
            // object merge, right side wins on key collisions
            (NodeKind::Object, NodeKind::Object) => {
                let mut merged = object_props(&left);
                for (key, prop) in object_props(&right) {
                    merged.insert(key, prop);
                }
                let result = self.stamp_node(crate::node::make_object(true));
                if let Payload::Object { properties, .. } = &mut result.borrow_mut().payload {
                    *properties = merged;
                }
                Ok(result)
            }
            _ => Err(self.unsupported(node, &left, &right)),
        }
    }

    pub(crate) fn eval_sub(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left, right) = self.operands(node)?;
        if left.borrow().kind() == NodeKind::Empty {
            return Ok(right);
        }
        if right.borrow().kind() == NodeKind::Empty {
            return Ok(left);
        }
        if is_abstract(&left) || is_abstract(&right) {
            return Ok(self.stamp_node(make_any()));
        }
        match (as_num(&left), as_num(&right)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => Ok(self.stamp_node(make_int(x.wrapping_sub(y), true))),
            (Some(Num::Int(x)), Some(Num::Float(y))) => Ok(self.stamp_node(make_float(x as f64 - y, true))),
            (Some(Num::Float(x)), Some(Num::Int(y))) => Ok(self.stamp_node(make_float(x - y as f64, true))),
            (Some(Num::Float(x)), Some(Num::Float(y))) => Ok(self.stamp_node(make_float(x - y, true))),
            _ => Err(self.unsupported(node, &left, &right)),
        }
    }

    pub(crate) fn eval_mul(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left, right) = self.operands(node)?;
        if left.borrow().kind() == NodeKind::Empty {
            return Ok(right);
        }
        if right.borrow().kind() == NodeKind::Empty {
            return Ok(left);
        }
        if is_abstract(&left) || is_abstract(&right) {
            return Ok(self.stamp_node(make_any()));
        }

        let (lk, rk) = (left.borrow().kind(), right.borrow().kind());
        // string/list repetition by an integer count
        if lk == NodeKind::String && rk == NodeKind::Int {
            return self.repeat_string(&left, &right);
        }
        if lk == NodeKind::Int && rk == NodeKind::String {
            return self.repeat_string(&right, &left);
        }
        if lk == NodeKind::List && rk == NodeKind::Int {
            return self.repeat_list(&left, &right);
        }
        if lk == NodeKind::Int && rk == NodeKind::List {
            return self.repeat_list(&right, &left);
        }

        match (as_num(&left), as_num(&right)) {
            (Some(Num::Int(x)), Some(Num::Int(y))) => Ok(self.stamp_node(make_int(x.wrapping_mul(y), true))),
            (Some(Num::Int(x)), Some(Num::Float(y))) => Ok(self.stamp_node(make_float(x as f64 * y, true))),
            (Some(Num::Float(x)), Some(Num::Int(y))) => Ok(self.stamp_node(make_float(x * y as f64, true))),
            (Some(Num::Float(x)), Some(Num::Float(y))) => Ok(self.stamp_node(make_float(x * y, true))),
            _ => Err(self.unsupported(node, &left, &right)),
        }
    }

    fn repeat_string(&mut self, s: &NodeRef, count: &NodeRef) -> RunResult<NodeRef> {
        let count = count.borrow().as_int().unwrap_or(0).max(0) as usize;
        let text = s.borrow().as_str().unwrap_or("").repeat(count);
        Ok(self.stamp_node(crate::node::make_string(text, true)))
    }

    fn repeat_list(&mut self, list: &NodeRef, count: &NodeRef) -> RunResult<NodeRef> {
        let count = count.borrow().as_int().unwrap_or(0).max(0) as usize;
        let items = list_items(list);
        let mut repeated = Vec::with_capacity(items.len() * count);
        for _ in 0..count {
            repeated.extend(items.iter().map(shallow_clone));
        }
        Ok(self.stamp_node(make_list(repeated, true)))
    }

    pub(crate) fn eval_div(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left, right) = self.operands(node)?;
        if left.borrow().kind() == NodeKind::Empty {
            return Ok(right);
        }
        if right.borrow().kind() == NodeKind::Empty {
            return Ok(left);
        }
        if is_abstract(&left) || is_abstract(&right) {
            return Ok(self.stamp_node(make_any()));
        }
        // division always produces a float
        let (Some(a), Some(b)) = (as_num(&left), as_num(&right)) else {
            return Err(self.unsupported(node, &left, &right));
        };
        let x = match a {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        };
        let y = match b {
            Num::Int(v) => v as f64,
            Num::Float(v) => v,
        };
        if y == 0.0 {
            return Err(self.error(ErrorKind::RuntimeError, "Division by zero"));
        }
        Ok(self.stamp_node(make_float(x / y, true)))
    }

    pub(crate) fn eval_mod(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left, right) = self.operands(node)?;
        if left.borrow().kind() == NodeKind::Empty {
            return Ok(right);
        }
        if right.borrow().kind() == NodeKind::Empty {
            return Ok(left);
        }
        if is_abstract(&left) || is_abstract(&right) {
            return Ok(self.stamp_node(make_any()));
        }
        if left.borrow().kind() == NodeKind::Int && right.borrow().as_int() == Some(0) {
            return Err(self.error(ErrorKind::RuntimeError, "Division by zero"));
        }
        let result = {
            let (l, r) = (left.borrow(), right.borrow());
            match (&l.payload, &r.payload) {
                (Payload::Int(x), Payload::Int(y)) => Some(make_int(x.wrapping_rem(*y), true)),
                (Payload::Int(x), Payload::Float(y)) => Some(make_float((*x as f64) % y, true)),
                (Payload::Float(x), Payload::Int(y)) => Some(make_float(x % (*y as f64), true)),
                (Payload::Float(x), Payload::Float(y)) => Some(make_float(x % y, true)),
                _ => None,
            }
        };
        match result {
            Some(value) => Ok(self.stamp_node(value)),
            None => Err(self.unsupported(node, &left, &right)),
        }
    }

    /// Unary `+`/`-`. Minus negates numerics and reverses strings and
    /// lists.
    pub(crate) fn eval_sign(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (op, operand) = {
            let n = node.borrow();
            (n.op_kind().expect("sign op"), n.right.clone().expect("operand"))
        };
        let value = self.eval_node(&operand)?;
        if value.borrow().kind() == NodeKind::Any {
            return Ok(self.stamp_node(make_any()));
        }
        if op == OpKind::Pos {
            let kind = value.borrow().kind();
            return match kind {
                NodeKind::Int | NodeKind::Float => Ok(value.clone()),
                NodeKind::Bool => {
                    let b = value.borrow().as_bool().unwrap_or(false);
                    Ok(self.stamp_node(make_int(i64::from(b), true)))
                }
                _ => Err(self.error(
                    ErrorKind::RuntimeError,
                    format!("Cannot perform '+' on {}", repr(&value)),
                )),
            };
        }

        let result = {
            let v = value.borrow();
            match &v.payload {
                Payload::Int(x) => Some(make_int(-x, true)),
                Payload::Float(x) => Some(make_float(-x, true)),
                Payload::Bool(b) => Some(make_int(-i64::from(*b), true)),
                Payload::Str(s) => Some(crate::node::make_string(s.chars().rev().collect::<String>(), true)),
                Payload::List(items) => Some(make_list(items.iter().rev().cloned().collect(), true)),
                _ => None,
            }
        };
        match result {
            Some(node) => Ok(self.stamp_node(node)),
            None => Err(self.error(
                ErrorKind::RuntimeError,
                format!("Cannot perform '-' on {}", repr(&value)),
            )),
        }
    }

    pub(crate) fn eval_not(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let operand = node.borrow().right.clone().expect("operand");
        let value = self.eval_node(&operand)?;
        let result = {
            let v = value.borrow();
            match &v.payload {
                Payload::Bool(b) => Some(make_bool(!b, true)),
                Payload::Empty => Some(make_bool(true, true)),
                Payload::Any => Some(make_any()),
                _ => None,
            }
        };
        match result {
            Some(node) => Ok(self.stamp_node(node)),
            None => Err(self.error(
                ErrorKind::RuntimeError,
                format!("Cannot perform '!' on {}", repr(&value)),
            )),
        }
    }

    pub(crate) fn eval_comparison(&mut self, node: &NodeRef, op: OpKind) -> RunResult<NodeRef> {
        let (left, right) = self.operands(node)?;
        if left.borrow().kind() == NodeKind::Any || right.borrow().kind() == NodeKind::Any {
            return Ok(self.stamp_node(make_any()));
        }

        if matches!(op, OpKind::EqEq | OpKind::NotEq) {
            let equal = values_equal(&left, &right);
            let flag = if op == OpKind::EqEq { equal } else { !equal };
            return Ok(self.stamp_node(make_bool(flag, true)));
        }

        // ordering: numeric cross products and lexicographic strings;
        // anything else compares false
        let string_ordering = {
            let (l, r) = (left.borrow(), right.borrow());
            match (&l.payload, &r.payload) {
                (Payload::Str(a), Payload::Str(b)) => Some(a.cmp(b)),
                _ => None,
            }
        };
        let ordering = string_ordering.or_else(|| match (as_num(&left), as_num(&right)) {
            (Some(a), Some(b)) => {
                let x = match a {
                    Num::Int(v) => v as f64,
                    Num::Float(v) => v,
                };
                let y = match b {
                    Num::Int(v) => v as f64,
                    Num::Float(v) => v,
                };
                x.partial_cmp(&y)
            }
            _ => None,
        });

        let flag = match ordering {
            Some(ordering) => match op {
                OpKind::Lt => ordering.is_lt(),
                OpKind::Gt => ordering.is_gt(),
                OpKind::LtEq => ordering.is_le(),
                OpKind::GtEq => ordering.is_ge(),
                _ => unreachable!(),
            },
            None => false,
        };
        Ok(self.stamp_node(make_bool(flag, true)))
    }

    pub(crate) fn eval_logical(&mut self, node: &NodeRef, op: OpKind) -> RunResult<NodeRef> {
        let (left_node, right_node) = {
            let n = node.borrow();
            (n.left.clone().expect("operand"), n.right.clone().expect("operand"))
        };
        let left = self.eval_node(&left_node)?;
        if left.borrow().kind() == NodeKind::Any {
            return Ok(self.stamp_node(make_any()));
        }
        let left_truth = left
            .borrow()
            .as_bool()
            .ok_or_else(|| self.error(ErrorKind::RuntimeError, format!("Cannot perform '{}' on {}", repr(node), repr(&left))))?;

        // short-circuit on the left operand
        match op {
            OpKind::And if !left_truth => return Ok(self.stamp_node(make_bool(false, true))),
            OpKind::Or if left_truth => return Ok(self.stamp_node(make_bool(true, true))),
            _ => {}
        }

        let right = self.eval_node(&right_node)?;
        if right.borrow().kind() == NodeKind::Any {
            return Ok(self.stamp_node(make_any()));
        }
        let right_truth = right
            .borrow()
            .as_bool()
            .ok_or_else(|| self.error(ErrorKind::RuntimeError, format!("Cannot perform '{}' on {}", repr(node), repr(&right))))?;
        Ok(self.stamp_node(make_bool(right_truth, true)))
    }

    /// `a..b` eagerly materializes the integer list, descending when
    /// `a > b`.
    pub(crate) fn eval_range(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left, right) = self.operands(node)?;
        let (Some(start), Some(end)) = (left.borrow().as_int(), right.borrow().as_int()) else {
            return Err(self.error(
                ErrorKind::RuntimeError,
                "Range operator expects both operands to be integer types",
            ));
        };

        let values: Vec<NodeRef> = if start <= end {
            (start..end).map(|i| make_int(i, true).into_ref()).collect()
        } else {
            let mut out = Vec::with_capacity((start - end) as usize);
            let mut i = start;
            while i > end {
                out.push(make_int(i, true).into_ref());
                i -= 1;
            }
            out
        };

        let result = self.stamp_node(make_list(values, true));
        let element = make_int(0, false).into_ref();
        result.borrow_mut().meta.allowed_type = Some(make_list(vec![element], true).into_ref());
        Ok(result)
    }

    /// The injection operator `>>`: feeds the left value into the
    /// right-hand function, partial operator or built-in call.
    pub(crate) fn eval_inject(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left_node, right_node) = {
            let n = node.borrow();
            (n.left.clone().expect("operand"), n.right.clone().expect("operand"))
        };
        let left = self.eval_node(&left_node)?;

        // Built-in name or built-in call head: the injected value(s) are
        // appended to the argument list before dispatch.
        let right_builtin = {
            let r = right_node.borrow();
            match &r.payload {
                Payload::Id { name, .. } => Builtin::from_name(name).map(|b| (b, Vec::new())),
                Payload::FuncCall { name, args, .. } => Builtin::from_name(name).map(|b| (b, args.clone())),
                _ => None,
            }
        };
        if let Some((builtin, mut args)) = right_builtin {
            args.extend(injected_values(&left));
            return self.call_builtin(builtin, &args);
        }

        let call_shape = {
            let r = right_node.borrow();
            match &r.payload {
                Payload::FuncCall { name, args, .. } => Some((name.clone(), args.clone())),
                _ => None,
            }
        };
        if let Some((name, args)) = call_shape {
            let func = self
                .scope
                .get(&name)
                .ok_or_else(|| self.error(ErrorKind::RuntimeError, format!("Function '{name}' is undefined")))?;
            let mut full_args = args;
            full_args.extend(injected_values(&left));
            return self.eval_function_call(&func, &full_args);
        }

        let right = self.eval_node(&right_node)?;
        let right_kind = right.borrow().kind();

        if right_kind == NodeKind::PartialOp {
            return self.inject_into_partial(&left, &right);
        }

        if right_kind == NodeKind::Function || right_kind == NodeKind::FuncList {
            let target = crate::walker::unwrap_singleton(right.clone());
            if target.borrow().kind() == NodeKind::Function {
                return self.inject_into_function(&left, &target);
            }
            // A genuine overload set dispatches on the injected values.
            let args = injected_values(&left);
            return self.eval_function_call(&right, &args);
        }

        Err(self.error(
            ErrorKind::RuntimeError,
            format!("Cannot perform operation '>>' on '{}' and '{}'", repr(&left), repr(&right)),
        ))
    }

    fn inject_into_partial(&mut self, left: &NodeRef, partial: &NodeRef) -> RunResult<NodeRef> {
        let result = shallow_clone(partial);
        let (l_empty, r_empty) = {
            let p = result.borrow();
            (
                p.left.as_ref().is_some_and(|n| n.borrow().kind() == NodeKind::Empty),
                p.right.as_ref().is_some_and(|n| n.borrow().kind() == NodeKind::Empty),
            )
        };

        if left.borrow().kind() == NodeKind::CommaList {
            let elements = match &left.borrow().payload {
                Payload::CommaList(items) => items.clone(),
                _ => unreachable!(),
            };
            if elements.len() != 2 {
                return Err(self.error(
                    ErrorKind::RuntimeError,
                    "Cannot inject more than 2 values into a partial operator",
                ));
            }
            if !(l_empty && r_empty) {
                return Err(self.error(
                    ErrorKind::RuntimeError,
                    "Cannot inject multiple values into a partial operator with one missing operand",
                ));
            }
            {
                let mut r = result.borrow_mut();
                r.left = Some(elements[0].clone());
                r.right = Some(elements[1].clone());
                let data = match &r.payload {
                    Payload::PartialOp(data) => Some(data.clone()),
                    _ => None,
                };
                if let Some(data) = data {
                    r.payload = Payload::Op(data);
                }
            }
            return self.eval_node(&result);
        }

        {
            let mut r = result.borrow_mut();
            if l_empty {
                r.left = Some(left.clone());
            } else if r_empty {
                r.right = Some(left.clone());
            }
            let complete = !r.left.as_ref().is_some_and(|n| n.borrow().kind() == NodeKind::Empty)
                && !r.right.as_ref().is_some_and(|n| n.borrow().kind() == NodeKind::Empty);
            if complete {
                let data = match &r.payload {
                    Payload::PartialOp(data) => Some(data.clone()),
                    _ => None,
                };
                if let Some(data) = data {
                    r.payload = Payload::Op(data);
                }
            }
        }
        self.eval_node(&result)
    }

    fn inject_into_function(&mut self, left: &NodeRef, func: &NodeRef) -> RunResult<NodeRef> {
        let (name, mut slots) = {
            let f = func.borrow();
            let Payload::Function(data) = &f.payload else { unreachable!() };
            (data.name.clone(), data.args.clone())
        };
        if slots.is_empty() {
            return Err(self.error(
                ErrorKind::RuntimeError,
                format!("Function '{name}' expects 0 arguments, and cannot be injected"),
            ));
        }

        for value in injected_values(left) {
            let mut index = 0;
            while slots[index].is_some() {
                index += 1;
                if index >= slots.len() {
                    return Err(self.error(ErrorKind::RuntimeError, "Injecting too many arguments into a function"));
                }
            }
            slots[index] = Some(value);
        }

        // Re-run the call with the filled slots flattened back into
        // positional arguments.
        let call_target = shallow_clone(func);
        if let Payload::Function(data) = &mut call_target.borrow_mut().payload {
            data.args = vec![None; slots.len()];
        }
        let flat: Vec<NodeRef> = slots.into_iter().flatten().collect();
        self.eval_function_call(&call_target, &flat)
    }

    fn stamp_node(&self, node: Node) -> NodeRef {
        node.at(self.line, self.column).into_ref()
    }
}

fn is_abstract(node: &NodeRef) -> bool {
    matches!(node.borrow().kind(), NodeKind::Any | NodeKind::PipeList)
}

fn list_items(node: &NodeRef) -> Vec<NodeRef> {
    match &node.borrow().payload {
        Payload::List(items) => items.clone(),
        _ => Vec::new(),
    }
}

fn object_props(node: &NodeRef) -> indexmap::IndexMap<String, Property> {
    match &node.borrow().payload {
        Payload::Object { properties, .. } => properties.clone(),
        _ => indexmap::IndexMap::new(),
    }
}

/// The values a pipe injects: the elements of a comma tuple, or the single
/// value itself.
pub(super) fn injected_values(left: &NodeRef) -> Vec<NodeRef> {
    match &left.borrow().payload {
        Payload::CommaList(items) => items.clone(),
        _ => vec![left.clone()],
    }
}

/// Structural equality used by `==`: scalar value equality, element-wise
/// lists, key-wise objects; anything cross-kind is unequal.
pub(crate) fn values_equal(a: &NodeRef, b: &NodeRef) -> bool {
    let (an, bn) = (a.borrow(), b.borrow());
    match (&an.payload, &bn.payload) {
        (Payload::Int(x), Payload::Int(y)) => x == y,
        (Payload::Float(x), Payload::Float(y)) => x == y,
        (Payload::Int(x), Payload::Float(y)) | (Payload::Float(y), Payload::Int(x)) => (*x as f64) == *y,
        (Payload::Bool(x), Payload::Bool(y)) => x == y,
        (Payload::Bool(x), Payload::Int(y)) | (Payload::Int(y), Payload::Bool(x)) => i64::from(*x) == *y,
        (Payload::Str(x), Payload::Str(y)) => x == y,
        (Payload::Empty, Payload::Empty) => true,
        (Payload::List(xs), Payload::List(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Payload::Object { properties: xs, .. }, Payload::Object { properties: ys, .. }) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| values_equal(&x.value, &y.value)))
        }
        (Payload::Range { start: s1, end: e1 }, Payload::Range { start: s2, end: e2 }) => s1 == s2 && e1 == e2,
        _ => false,
    }
}
