use crate::{
    error::{ErrorKind, RunResult},
    node::{
        NodeKind, NodeRef, OpKind, Payload, Property, make_any, make_bool, make_empty, make_int, make_list,
        make_object, make_pipe_list, make_string, repr, shallow_clone,
    },
    walker::{match_types, sort_and_unique, unwrap_singleton},
};

use super::Evaluator;

impl Evaluator<'_> {
    /// Member access `.`, polymorphic over lists, strings, objects,
    /// functions, unions and `any`.
    pub(crate) fn eval_dot(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left_node, right) = {
            let n = node.borrow();
            (n.left.clone().expect("target"), n.right.clone().expect("accessor"))
        };
        let left = self.eval_node(&left_node)?;

        let left_kind = left.borrow().kind();
        match left_kind {
            NodeKind::Any => Ok(self.stamp_value(make_any())),
            NodeKind::Function | NodeKind::FuncList if matches!(right.borrow().payload, Payload::List(_)) => {
                // calling the result of a call: `f(1)[2]`
                let args = match &right.borrow().payload {
                    Payload::List(items) => items.clone(),
                    _ => unreachable!(),
                };
                self.eval_function_call(&left, &args)
            }
            NodeKind::PipeList => self.pipe_member(&left, &right),
            NodeKind::List => self.list_member(&left, &right, node),
            NodeKind::String => self.string_member(&left, &right, node),
            NodeKind::Object => self.object_member(&left, &right),
            NodeKind::Function => self.function_member(&left, &right),
            _ => Err(self.error(
                ErrorKind::RuntimeError,
                format!(
                    "Cannot perform operation '.' on '{}' and '{}'",
                    repr(&left),
                    repr(&right)
                ),
            )),
        }
    }

    fn stamp_value(&self, node: crate::node::Node) -> NodeRef {
        node.at(self.line, self.column).into_ref()
    }

    /// Evaluates a single-element bracket accessor to an integer index.
    fn accessor_index(&mut self, accessor: &NodeRef) -> RunResult<i64> {
        let items = match &accessor.borrow().payload {
            Payload::List(items) => items.clone(),
            _ => Vec::new(),
        };
        if items.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "List accessor expects one value"));
        }
        let index = self.eval_node(&items[0])?;
        index
            .borrow()
            .as_int()
            .ok_or_else(|| self.error(ErrorKind::RuntimeError, "List accessor expects an integer"))
    }

    fn index_error(&self, len: usize, index: i64) -> crate::error::RunError {
        self.error(
            ErrorKind::RuntimeError,
            format!("List index out of range: List size is {len} but provided index is {index}"),
        )
    }

    // -- union distribution -- //

    fn pipe_member(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let items = match &left.borrow().payload {
            Payload::PipeList(items) => items.clone(),
            _ => unreachable!(),
        };

        if matches!(right.borrow().payload, Payload::List(_)) {
            let index = self.accessor_index(right)?;
            if index < 0 || index as usize >= items.len() {
                return Err(self.index_error(items.len(), index));
            }
            return Ok(items[index as usize].clone());
        }

        // `(A | B).x` distributes into `A.x | B.x`, deduplicated.
        let mut results = Vec::with_capacity(items.len());
        for item in &items {
            let access = self.stamp_value(crate::node::Node::new(Payload::Op(crate::node::OpData::new(
                ".",
                OpKind::Dot,
            ))));
            {
                let mut a = access.borrow_mut();
                a.left = Some(item.clone());
                a.right = Some(right.clone());
            }
            results.push(self.eval_dot(&access)?);
        }
        sort_and_unique(self, &mut results)?;
        if results.len() == 1 {
            return Ok(results.pop().expect("one result"));
        }
        Ok(self.stamp_value(make_pipe_list(results)))
    }

    // -- lists -- //

    fn list_member(&mut self, left: &NodeRef, right: &NodeRef, dot: &NodeRef) -> RunResult<NodeRef> {
        let right_shape = {
            let r = right.borrow();
            match &r.payload {
                Payload::List(_) => Shape::Index,
                Payload::Id { name, .. } => Shape::Property(name.clone()),
                Payload::FuncCall { name, args, .. } => Shape::Method(name.clone(), args.clone()),
                _ => Shape::Other,
            }
        };

        match right_shape {
            Shape::Index => {
                let items = list_items(left);
                let index = self.accessor_index(right)?;
                if index < 0 || index as usize >= items.len() {
                    return Err(self.index_error(items.len(), index));
                }
                Ok(items[index as usize].clone())
            }
            Shape::Property(name) => self.list_property(left, &name, dot),
            Shape::Method(name, args) => self.list_method(left, &name, &args),
            Shape::Other | Shape::Computed(_) => Err(self.error(
                ErrorKind::RuntimeError,
                format!("Cannot perform operation '.' on '{}' and '{}'", repr(left), repr(right)),
            )),
        }
    }

    fn list_property(&mut self, left: &NodeRef, name: &str, dot: &NodeRef) -> RunResult<NodeRef> {
        let items = list_items(left);
        match name {
            "length" => Ok(self.stamp_value(make_int(items.len() as i64, true))),
            "first" => items
                .first()
                .cloned()
                .ok_or_else(|| self.index_error(0, 0)),
            "last" => items
                .last()
                .cloned()
                .ok_or_else(|| self.index_error(0, -1)),
            "empty" => Ok(self.stamp_value(make_bool(items.is_empty(), true))),
            _ => Err(self.error(
                ErrorKind::RuntimeError,
                format!("Cannot perform operation '.' on '{}' and '{}'", repr(left), repr(dot)),
            )),
        }
    }

    fn list_method(&mut self, left: &NodeRef, name: &str, args: &[NodeRef]) -> RunResult<NodeRef> {
        match name {
            "map" | "flatmap" | "filter" | "foreach" => self.list_iterate(left, name, args),
            "sort" => self.list_sort(left, args),
            "flatten" => self.list_flatten(left, args),
            "append" => self.list_append(left, args),
            "prepend" => self.list_prepend(left, args),
            "insert" => self.list_insert(left, args),
            "remove" => self.list_remove(left, args),
            "clear" => {
                self.expect_arity("clear", args, 0)?;
                if let Payload::List(items) = &mut left.borrow_mut().payload {
                    items.clear();
                }
                Ok(left.clone())
            }
            "subsection" => self.list_subsection(left, args),
            _ => Err(self.error(
                ErrorKind::RuntimeError,
                format!("List built-in '{name}' does not exist"),
            )),
        }
    }

    fn expect_arity(&self, name: &str, args: &[NodeRef], arity: usize) -> RunResult<()> {
        if args.len() != arity {
            return Err(self.error(
                ErrorKind::RuntimeError,
                format!("List built-in '{name}' expects {arity} arguments"),
            ));
        }
        Ok(())
    }

    /// Calls a `map`/`filter`-style callback for one element. The callback
    /// is a unary, `(elem, idx)` or `(elem, idx, self)` function, or a
    /// partial operator the element is injected into.
    fn run_callback(&mut self, func: &NodeRef, elem: &NodeRef, index: usize, list: &NodeRef) -> RunResult<NodeRef> {
        if func.borrow().kind() == NodeKind::PartialOp {
            return self.inject_element(elem, func);
        }
        if func.borrow().kind() == NodeKind::FuncList {
            // an overload set dispatches on the element alone
            return self.eval_function_call(func, std::slice::from_ref(elem));
        }
        let param_count = match &func.borrow().payload {
            Payload::Function(f) => f.params.len(),
            _ => 0,
        };
        let index_node = self.stamp_value(make_int(index as i64, true));
        let args: Vec<NodeRef> = match param_count {
            1 => vec![elem.clone()],
            2 => vec![elem.clone(), index_node],
            3 => vec![elem.clone(), index_node, list.clone()],
            _ => {
                return Err(self.error(
                    ErrorKind::RuntimeError,
                    "List built-in expects function argument to have 1, 2 or 3 parameters",
                ));
            }
        };
        self.eval_function_call(func, &args)
    }

    fn inject_element(&mut self, elem: &NodeRef, partial: &NodeRef) -> RunResult<NodeRef> {
        let inject = self.stamp_value(crate::node::Node::new(Payload::Op(crate::node::OpData::new(
            ">>",
            OpKind::Inject,
        ))));
        {
            let mut i = inject.borrow_mut();
            i.left = Some(elem.clone());
            i.right = Some(partial.clone());
        }
        self.eval_inject(&inject)
    }

    fn callback_argument(&mut self, name: &str, args: &[NodeRef]) -> RunResult<NodeRef> {
        self.expect_arity(name, args, 1)?;
        let func = unwrap_singleton(self.eval_node(&args[0])?);
        let kind = func.borrow().kind();
        if kind != NodeKind::Function && kind != NodeKind::PartialOp && kind != NodeKind::FuncList {
            return Err(self.error(
                ErrorKind::RuntimeError,
                format!("List built-in '{name}' expects argument to be a function or a partial operator"),
            ));
        }
        Ok(func)
    }

    fn list_iterate(&mut self, left: &NodeRef, name: &str, args: &[NodeRef]) -> RunResult<NodeRef> {
        let func = self.callback_argument(name, args)?;
        let items = list_items(left);
        let mut collected = Vec::with_capacity(items.len());

        for (index, elem) in items.iter().enumerate() {
            let result = self.run_callback(&func, elem, index, left)?;
            match name {
                "map" => collected.push(result),
                "flatmap" => match &result.borrow().payload {
                    Payload::List(inner) => collected.extend(inner.iter().cloned()),
                    _ => collected.push(result.clone()),
                },
                "filter" => {
                    if result.borrow().as_bool() == Some(true) {
                        collected.push(elem.clone());
                    }
                }
                "foreach" => {}
                _ => unreachable!(),
            }
        }

        if name == "foreach" {
            return Ok(self.stamp_value(make_empty(true)));
        }
        let result = self.stamp_value(make_list(collected, true));
        result.borrow_mut().meta.is_literal = left.borrow().meta.is_literal;
        let shape = self.get_type(&result)?;
        result.borrow_mut().meta.allowed_type = Some(shape);
        Ok(result)
    }

    fn list_sort(&mut self, left: &NodeRef, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() > 1 {
            return Err(self.error(ErrorKind::RuntimeError, "List built-in 'sort' expects 0 or 1 arguments"));
        }
        let items = list_items(left);

        // Sort on precomputed keys so a key function runs once per element.
        let mut keyed: Vec<(NodeRef, NodeRef)> = Vec::with_capacity(items.len());
        if args.is_empty() {
            for item in &items {
                keyed.push((item.clone(), item.clone()));
            }
        } else {
            let func = unwrap_singleton(self.eval_node(&args[0])?);
            if func.borrow().kind() != NodeKind::Function {
                return Err(self.error(
                    ErrorKind::RuntimeError,
                    "List built-in 'sort' expects argument to be a function",
                ));
            }
            for item in &items {
                let key = self.eval_function_call(&func, std::slice::from_ref(item))?;
                keyed.push((key, item.clone()));
            }
        }

        keyed.sort_by(|(a, _), (b, _)| compare_for_sort(a, b));
        let sorted: Vec<NodeRef> = keyed.into_iter().map(|(_, item)| item).collect();
        if let Payload::List(items) = &mut left.borrow_mut().payload {
            *items = sorted;
        }
        Ok(left.clone())
    }

    fn list_flatten(&mut self, left: &NodeRef, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() > 1 {
            return Err(self.error(
                ErrorKind::RuntimeError,
                "List built-in 'flatten' expects 0 or 1 arguments",
            ));
        }
        let deep = if args.is_empty() {
            false
        } else {
            self.eval_node(&args[0])?
                .borrow()
                .as_bool()
                .ok_or_else(|| self.error(ErrorKind::RuntimeError, "List built-in 'flatten' expects a boolean argument"))?
        };
        let result = self.stamp_value(make_list(flatten_items(left, deep), true));
        result.borrow_mut().meta.is_literal = left.borrow().meta.is_literal;
        Ok(result)
    }

    /// The recorded element type of a list, defaulting to `any`.
    fn list_element_type(&mut self, left: &NodeRef) -> NodeRef {
        let recorded = left.borrow().meta.allowed_type.clone();
        match recorded {
            Some(t) => match &t.borrow().payload {
                Payload::List(items) => items.first().cloned().unwrap_or_else(|| make_any().into_ref()),
                Payload::Any => t.clone(),
                _ => make_any().into_ref(),
            },
            None => {
                let elem = make_any().into_ref();
                left.borrow_mut().meta.allowed_type = Some(make_list(vec![elem.clone()], true).into_ref());
                elem
            }
        }
    }

    fn check_element(&mut self, left: &NodeRef, value: &NodeRef) -> RunResult<()> {
        let element_type = self.list_element_type(left);
        let outcome = match_types(self, &element_type, value, true)?;
        if !outcome.ok {
            return Err(self.error(
                ErrorKind::TypeError,
                format!(
                    "Cannot append element of type '{}' to list of type {}",
                    crate::node::type_repr(value),
                    left.borrow()
                        .meta
                        .allowed_type
                        .as_ref()
                        .map(crate::node::type_repr)
                        .unwrap_or_else(|| "[ any ]".to_owned())
                ),
            ));
        }
        Ok(())
    }

    fn list_append(&mut self, left: &NodeRef, args: &[NodeRef]) -> RunResult<NodeRef> {
        self.expect_arity("append", args, 1)?;
        let value = self.eval_node(&args[0])?;
        self.check_element(left, &value)?;
        if let Payload::List(items) = &mut left.borrow_mut().payload {
            items.push(value);
        }
        Ok(left.clone())
    }

    fn list_prepend(&mut self, left: &NodeRef, args: &[NodeRef]) -> RunResult<NodeRef> {
        self.expect_arity("prepend", args, 1)?;
        let value = self.eval_node(&args[0])?;
        self.check_element(left, &value)?;
        if let Payload::List(items) = &mut left.borrow_mut().payload {
            items.insert(0, value);
        }
        Ok(left.clone())
    }

    fn list_insert(&mut self, left: &NodeRef, args: &[NodeRef]) -> RunResult<NodeRef> {
        self.expect_arity("insert", args, 2)?;
        let index = self
            .eval_node(&args[0])?
            .borrow()
            .as_int()
            .ok_or_else(|| self.error(ErrorKind::RuntimeError, "List built-in 'insert' expects an integer index"))?;
        let value = self.eval_node(&args[1])?;
        self.check_element(left, &value)?;
        let len = list_items(left).len();
        if index < 0 || index as usize > len {
            return Err(self.index_error(len, index));
        }
        if let Payload::List(items) = &mut left.borrow_mut().payload {
            items.insert(index as usize, value);
        }
        Ok(left.clone())
    }

    fn list_remove(&mut self, left: &NodeRef, args: &[NodeRef]) -> RunResult<NodeRef> {
        self.expect_arity("remove", args, 1)?;
        let index = self
            .eval_node(&args[0])?
            .borrow()
            .as_int()
            .ok_or_else(|| self.error(ErrorKind::RuntimeError, "List built-in 'remove' expects an integer index"))?;
        let len = list_items(left).len();
        if index < 0 || index as usize >= len {
            return Err(self.index_error(len, index));
        }
        if let Payload::List(items) = &mut left.borrow_mut().payload {
            items.remove(index as usize);
        }
        Ok(left.clone())
    }

    fn list_subsection(&mut self, left: &NodeRef, args: &[NodeRef]) -> RunResult<NodeRef> {
        self.expect_arity("subsection", args, 2)?;
        let start = self
            .eval_node(&args[0])?
            .borrow()
            .as_int()
            .ok_or_else(|| self.error(ErrorKind::RuntimeError, "List built-in 'subsection' expects integer bounds"))?;
        let end = self
            .eval_node(&args[1])?
            .borrow()
            .as_int()
            .ok_or_else(|| self.error(ErrorKind::RuntimeError, "List built-in 'subsection' expects integer bounds"))?;
        let items = list_items(left);
        if start < 0 || end < start || end as usize > items.len() {
            return Err(self.index_error(items.len(), end));
        }
        let section = items[start as usize..end as usize].to_vec();
        Ok(self.stamp_value(make_list(section, true)))
    }

    // -- strings -- //

    fn string_member(&mut self, left: &NodeRef, right: &NodeRef, dot: &NodeRef) -> RunResult<NodeRef> {
        let right_shape = {
            let r = right.borrow();
            match &r.payload {
                Payload::List(_) => Shape::Index,
                Payload::Id { name, .. } => Shape::Property(name.clone()),
                Payload::FuncCall { name, args, .. } => Shape::Method(name.clone(), args.clone()),
                _ => Shape::Other,
            }
        };
        let text = left.borrow().as_str().unwrap_or_default().to_owned();
        let chars: Vec<char> = text.chars().collect();

        match right_shape {
            Shape::Index => {
                let index = self.accessor_index(right)?;
                if index < 0 || index as usize >= chars.len() {
                    return Err(self.index_error(chars.len(), index));
                }
                Ok(self.stamp_value(make_string(chars[index as usize].to_string(), true)))
            }
            Shape::Property(name) => match name.as_str() {
                "length" => Ok(self.stamp_value(make_int(chars.len() as i64, true))),
                "first" => chars
                    .first()
                    .map(|c| self.stamp_value(make_string(c.to_string(), true)))
                    .ok_or_else(|| self.index_error(0, 0)),
                "last" => chars
                    .last()
                    .map(|c| self.stamp_value(make_string(c.to_string(), true)))
                    .ok_or_else(|| self.index_error(0, -1)),
                "empty" => Ok(self.stamp_value(make_bool(chars.is_empty(), true))),
                "is_alpha" => Ok(self.stamp_value(make_bool(
                    !chars.is_empty() && chars.iter().all(|c| c.is_alphabetic()),
                    true,
                ))),
                "is_digit" => Ok(self.stamp_value(make_bool(
                    !chars.is_empty() && chars.iter().all(|c| c.is_ascii_digit()),
                    true,
                ))),
                _ => Err(self.error(
                    ErrorKind::RuntimeError,
                    format!("String does not contain built-in property '{name}'"),
                )),
            },
            Shape::Method(name, args) => self.string_method(left, &text, &name, &args),
            Shape::Other | Shape::Computed(_) => Err(self.error(
                ErrorKind::RuntimeError,
                format!("Cannot perform operation '.' on '{}' and '{}'", repr(left), repr(dot)),
            )),
        }
    }

    fn string_method(&mut self, left: &NodeRef, text: &str, name: &str, args: &[NodeRef]) -> RunResult<NodeRef> {
        let string_arg = |this: &mut Self, i: usize| -> RunResult<String> {
            let value = this.eval_node(&args[i])?;
            let out = value.borrow().as_str().map(str::to_owned);
            out.ok_or_else(|| {
                this.error(
                    ErrorKind::RuntimeError,
                    format!("String built-in '{name}' expects a string argument"),
                )
            })
        };
        let int_arg = |this: &mut Self, i: usize| -> RunResult<i64> {
            let value = this.eval_node(&args[i])?;
            let out = value.borrow().as_int();
            out.ok_or_else(|| {
                this.error(
                    ErrorKind::RuntimeError,
                    format!("String built-in '{name}' expects an integer argument"),
                )
            })
        };

        match (name, args.len()) {
            ("chars", 0) => {
                let items = text
                    .chars()
                    .map(|c| make_string(c.to_string(), true).into_ref())
                    .collect();
                Ok(self.stamp_value(make_list(items, true)))
            }
            ("lower", 0) => Ok(self.stamp_value(make_string(text.to_lowercase(), true))),
            ("upper", 0) => Ok(self.stamp_value(make_string(text.to_uppercase(), true))),
            ("trim", 0) => Ok(self.stamp_value(make_string(text.trim().to_owned(), true))),
            ("split", 0) => {
                let items = text
                    .split_whitespace()
                    .map(|part| make_string(part.to_owned(), true).into_ref())
                    .collect();
                Ok(self.stamp_value(make_list(items, true)))
            }
            ("split", 1) => {
                let separator = string_arg(self, 0)?;
                let items: Vec<NodeRef> = if separator.is_empty() {
                    text.chars().map(|c| make_string(c.to_string(), true).into_ref()).collect()
                } else {
                    text.split(&separator)
                        .map(|part| make_string(part.to_owned(), true).into_ref())
                        .collect()
                };
                Ok(self.stamp_value(make_list(items, true)))
            }
            ("append", 1) => {
                let suffix = string_arg(self, 0)?;
                self.mutate_string(left, |s| s.push_str(&suffix));
                Ok(left.clone())
            }
            ("prepend", 1) => {
                let prefix = string_arg(self, 0)?;
                self.mutate_string(left, |s| *s = format!("{prefix}{s}"));
                Ok(left.clone())
            }
            ("insert", 2) => {
                let index = int_arg(self, 0)?;
                let insert = string_arg(self, 1)?;
                let chars: Vec<char> = text.chars().collect();
                if index < 0 || index as usize > chars.len() {
                    return Err(self.index_error(chars.len(), index));
                }
                let mut out: String = chars[..index as usize].iter().collect();
                out.push_str(&insert);
                out.extend(&chars[index as usize..]);
                self.mutate_string(left, |s| *s = out.clone());
                Ok(left.clone())
            }
            ("replace_at", 2) => {
                let index = int_arg(self, 0)?;
                let replacement = string_arg(self, 1)?;
                let mut chars: Vec<char> = text.chars().collect();
                if index < 0 || index as usize >= chars.len() {
                    return Err(self.index_error(chars.len(), index));
                }
                chars.splice(index as usize..=index as usize, replacement.chars());
                let out: String = chars.into_iter().collect();
                self.mutate_string(left, |s| *s = out.clone());
                Ok(left.clone())
            }
            ("remove", 1) => {
                let index = int_arg(self, 0)?;
                let mut chars: Vec<char> = text.chars().collect();
                if index < 0 || index as usize >= chars.len() {
                    return Err(self.index_error(chars.len(), index));
                }
                chars.remove(index as usize);
                let out: String = chars.into_iter().collect();
                self.mutate_string(left, |s| *s = out.clone());
                Ok(left.clone())
            }
            ("replace", 2) => {
                let from = string_arg(self, 0)?;
                let to = string_arg(self, 1)?;
                Ok(self.stamp_value(make_string(text.replacen(&from, &to, 1), true)))
            }
            ("replace_all", 2) => {
                let from = string_arg(self, 0)?;
                let to = string_arg(self, 1)?;
                Ok(self.stamp_value(make_string(text.replace(&from, &to), true)))
            }
            ("subsection", 2) => {
                let start = int_arg(self, 0)?;
                let end = int_arg(self, 1)?;
                let chars: Vec<char> = text.chars().collect();
                if start < 0 || end < start || end as usize > chars.len() {
                    return Err(self.index_error(chars.len(), end));
                }
                let section: String = chars[start as usize..end as usize].iter().collect();
                Ok(self.stamp_value(make_string(section, true)))
            }
            _ => Err(self.error(
                ErrorKind::RuntimeError,
                format!("String does not contain built-in function '{name}'"),
            )),
        }
    }

    fn mutate_string(&self, left: &NodeRef, f: impl FnOnce(&mut String)) {
        if let Payload::Str(s) = &mut left.borrow_mut().payload {
            f(s);
        }
    }

    // -- objects -- //

    fn object_member(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let right_shape = {
            let r = right.borrow();
            match &r.payload {
                Payload::List(items) => Shape::Computed(items.clone()),
                Payload::Id { name, .. } => Shape::Property(name.clone()),
                Payload::FuncCall { name, args, .. } => Shape::Method(name.clone(), args.clone()),
                _ => Shape::Other,
            }
        };

        match right_shape {
            Shape::Computed(items) => {
                if items.len() != 1 {
                    return Err(self.error(ErrorKind::RuntimeError, "Object accessor expects one value"));
                }
                let key = self.eval_node(&items[0])?;
                let key = key
                    .borrow()
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| self.error(ErrorKind::RuntimeError, "Object accessor expects value of type string"))?;
                let found = match &left.borrow().payload {
                    Payload::Object { properties, .. } => properties.get(&key).map(|p| p.value.clone()),
                    _ => None,
                };
                Ok(found.unwrap_or_else(|| self.stamp_value(make_empty(true))))
            }
            Shape::Property(name) => self.object_property(left, &name),
            Shape::Method(name, args) => self.object_method(left, &name, &args),
            Shape::Other | Shape::Index => Err(self.error(
                ErrorKind::RuntimeError,
                format!("Cannot perform operation '.' on '{}' and '{}'", repr(left), repr(right)),
            )),
        }
    }

    fn object_property(&mut self, left: &NodeRef, name: &str) -> RunResult<NodeRef> {
        let properties = match &left.borrow().payload {
            Payload::Object { properties, .. } => properties.clone(),
            _ => unreachable!(),
        };

        match name {
            "_keys" => {
                let keys = properties
                    .keys()
                    .map(|k| make_string(k.clone(), true).into_ref())
                    .collect();
                Ok(self.stamp_value(make_list(keys, true)))
            }
            "_values" => {
                let values = properties.values().map(|p| p.value.clone()).collect();
                Ok(self.stamp_value(make_list(values, true)))
            }
            "_items" => {
                let mut items = Vec::with_capacity(properties.len());
                for (key, prop) in &properties {
                    let entry = self.stamp_value(make_object(true));
                    if let Payload::Object { properties, .. } = &mut entry.borrow_mut().payload {
                        properties.insert("key".to_owned(), Property::required(make_string(key.clone(), true).into_ref()));
                        properties.insert("value".to_owned(), Property::required(prop.value.clone()));
                    }
                    items.push(entry);
                }
                Ok(self.stamp_value(make_list(items, true)))
            }
            _ => Ok(properties
                .get(name)
                .map(|p| p.value.clone())
                .unwrap_or_else(|| self.stamp_value(make_empty(true)))),
        }
    }

    fn object_method(&mut self, left: &NodeRef, name: &str, args: &[NodeRef]) -> RunResult<NodeRef> {
        match name {
            "delete" => {
                if args.len() != 1 {
                    return Err(self.error(ErrorKind::RuntimeError, "Object function 'delete' expects 1 argument"));
                }
                let key = self.eval_node(&args[0])?;
                let key = key
                    .borrow()
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        self.error(
                            ErrorKind::RuntimeError,
                            "Object function 'delete' expects an argument of type string",
                        )
                    })?;
                if let Payload::Object { properties, .. } = &mut left.borrow_mut().payload {
                    properties.shift_remove(&key);
                }
                Ok(left.clone())
            }
            "clear" => {
                if !args.is_empty() {
                    return Err(self.error(ErrorKind::RuntimeError, "Object function 'clear' expects 0 arguments"));
                }
                if let Payload::Object { properties, .. } = &mut left.borrow_mut().payload {
                    properties.clear();
                }
                Ok(left.clone())
            }
            "add" => {
                if args.len() != 2 {
                    return Err(self.error(ErrorKind::RuntimeError, "Object function 'add' expects 2 arguments"));
                }
                let key = self.eval_node(&args[0])?;
                let value = self.eval_node(&args[1])?;
                let key = key
                    .borrow()
                    .as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        self.error(
                            ErrorKind::RuntimeError,
                            "Object function 'add' expects name argument to be of type string",
                        )
                    })?;
                if let Payload::Object { properties, .. } = &mut left.borrow_mut().payload {
                    properties.insert(key, Property::required(value));
                }
                Ok(left.clone())
            }
            _ => {
                // fall through to a function-valued property
                let func = match &left.borrow().payload {
                    Payload::Object { properties, .. } => properties.get(name).map(|p| p.value.clone()),
                    _ => None,
                };
                let func = func.ok_or_else(|| {
                    self.error(
                        ErrorKind::RuntimeError,
                        format!("Function '{name}' does not exist on object"),
                    )
                })?;
                self.eval_function_call(&func, args)
            }
        }
    }

    // -- functions -- //

    fn function_member(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let right_shape = {
            let r = right.borrow();
            match &r.payload {
                Payload::Id { name, .. } => Shape::Property(name.clone()),
                Payload::FuncCall { name, args, .. } => Shape::Method(name.clone(), args.clone()),
                _ => Shape::Other,
            }
        };

        match right_shape {
            Shape::Method(name, args) if name == "patch" => self.function_patch(left, &args),
            Shape::Method(name, _) => Err(self.error(
                ErrorKind::RuntimeError,
                format!("Function does not contain built-in function '{name}'"),
            )),
            Shape::Property(name) => self.function_property(left, &name),
            _ => Err(self.error(
                ErrorKind::RuntimeError,
                format!("Cannot perform operation '.' on '{}' and '{}'", repr(left), repr(right)),
            )),
        }
    }

    /// `f.patch(body)` appends expressions to the function's block,
    /// promoting a single-expression body to a block first.
    fn function_patch(&mut self, left: &NodeRef, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Function built-in 'patch' expects 1 argument"));
        }

        {
            let body = {
                let l = left.borrow();
                let Payload::Function(f) = &l.payload else { unreachable!() };
                f.body.clone()
            };
            let is_block = matches!(body.borrow().payload, Payload::Block(_));
            if !is_block {
                let wrapped = shallow_clone(&body);
                body.borrow_mut().payload = Payload::Block(vec![wrapped]);
            }
        }

        let patch = &args[0];
        let additions = match &patch.borrow().payload {
            Payload::Block(nodes) => nodes.clone(),
            _ => vec![patch.clone()],
        };
        {
            let l = left.borrow();
            let Payload::Function(f) = &l.payload else { unreachable!() };
            if let Payload::Block(nodes) = &mut f.body.borrow_mut().payload {
                nodes.extend(additions);
            }
        }
        Ok(left.clone())
    }

    fn function_property(&mut self, left: &NodeRef, name: &str) -> RunResult<NodeRef> {
        let data = {
            let l = left.borrow();
            let Payload::Function(f) = &l.payload else { unreachable!() };
            f.clone()
        };
        match name {
            "name" => Ok(self.stamp_value(make_string(data.name, true))),
            "params" => {
                let mut names = Vec::with_capacity(data.params.len());
                for param in &data.params {
                    let base = crate::node::param_name(param).unwrap_or_default();
                    let shown = if crate::node::param_is_variadic(param) {
                        format!("...{base}")
                    } else {
                        base
                    };
                    names.push(make_string(shown, true).into_ref());
                }
                Ok(self.stamp_value(make_list(names, true)))
            }
            "args" => {
                let filled: Vec<NodeRef> = data.args.into_iter().flatten().collect();
                Ok(self.stamp_value(make_list(filled, true)))
            }
            _ => Err(self.error(
                ErrorKind::RuntimeError,
                format!("Function does not contain built-in property '{name}'"),
            )),
        }
    }
}

enum Shape {
    Index,
    Computed(Vec<NodeRef>),
    Property(String),
    Method(String, Vec<NodeRef>),
    Other,
}

fn list_items(node: &NodeRef) -> Vec<NodeRef> {
    match &node.borrow().payload {
        Payload::List(items) => items.clone(),
        _ => Vec::new(),
    }
}

fn flatten_items(list: &NodeRef, deep: bool) -> Vec<NodeRef> {
    let items = list_items(list);
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if item.borrow().kind() == NodeKind::List {
            if deep {
                out.extend(flatten_items(&item, true));
            } else {
                out.extend(list_items(&item));
            }
        } else {
            out.push(item);
        }
    }
    out
}

/// Infallible comparison for `sort`: numbers and strings order naturally,
/// everything else keeps its relative position.
fn compare_for_sort(a: &NodeRef, b: &NodeRef) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    let (an, bn) = (a.borrow(), b.borrow());
    match (&an.payload, &bn.payload) {
        (Payload::Int(x), Payload::Int(y)) => x.cmp(y),
        (Payload::Float(x), Payload::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Payload::Int(x), Payload::Float(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Payload::Float(x), Payload::Int(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Payload::Str(x), Payload::Str(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}
