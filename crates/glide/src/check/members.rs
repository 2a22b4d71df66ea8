use crate::{
    builtins::Builtin,
    error::{ErrorKind, RunResult},
    node::{
        Node, NodeKind, NodeRef, OpKind, Payload, make_any, make_bool, make_empty, make_float, make_int, make_list,
        make_object, make_pipe_list, make_string, repr, shallow_clone,
    },
    run,
    walker::{get_explicit_type, match_types, shape_of, sort_and_unique, unwrap_singleton},
};

use super::Typechecker;

enum Accessor {
    Index(Vec<NodeRef>),
    Property(String),
    Method(String, Vec<NodeRef>),
    Other,
}

fn accessor_of(right: &NodeRef) -> Accessor {
    let r = right.borrow();
    match &r.payload {
        Payload::List(items) => Accessor::Index(items.clone()),
        Payload::Id { name, .. } => Accessor::Property(name.clone()),
        Payload::FuncCall { name, args, .. } => Accessor::Method(name.clone(), args.clone()),
        _ => Accessor::Other,
    }
}

impl Typechecker {
    /// Abstract member access: the same vocabulary as the evaluator, with
    /// kind carriers for results.
    pub(crate) fn check_dot(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left_node, right) = {
            let n = node.borrow();
            (n.left.clone().expect("target"), n.right.clone().expect("accessor"))
        };
        let left = self.check_node(&left_node)?;

        let left_kind = left.borrow().kind();
        match left_kind {
            NodeKind::Any => Ok(make_any().into_ref()),
            NodeKind::Function | NodeKind::FuncList if matches!(right.borrow().payload, Payload::List(_)) => {
                let args = match &right.borrow().payload {
                    Payload::List(items) => items.clone(),
                    _ => unreachable!(),
                };
                self.check_function_call(&left, &args)
            }
            NodeKind::PipeList => self.check_pipe_member(&left, &right),
            NodeKind::List => self.check_list_member(&left, &right),
            NodeKind::String => self.check_string_member(&left, &right),
            NodeKind::Object => self.check_object_member(&left, &right),
            NodeKind::Function => self.check_function_member(&left, &right),
            _ => Err(self.error(
                ErrorKind::TypeError,
                format!(
                    "Cannot perform operation '.' on '{}' and '{}'",
                    repr(&left),
                    repr(&right)
                ),
            )),
        }
    }

    fn check_pipe_member(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let items = match &left.borrow().payload {
            Payload::PipeList(items) => items.clone(),
            _ => unreachable!(),
        };
        let mut results = Vec::with_capacity(items.len());
        for item in &items {
            let access = Node::new(Payload::Op(crate::node::OpData::new(".", OpKind::Dot)))
                .at(self.line, self.column)
                .into_ref();
            {
                let mut a = access.borrow_mut();
                a.left = Some(item.clone());
                a.right = Some(right.clone());
            }
            results.push(self.check_dot(&access)?);
        }
        sort_and_unique(self, &mut results)?;
        if results.len() == 1 {
            return Ok(results.pop().expect("one result"));
        }
        Ok(make_pipe_list(results).into_ref())
    }

    /// The element type a checked list value carries.
    fn element_type(&self, list: &NodeRef) -> NodeRef {
        match &list.borrow().payload {
            Payload::List(items) => items.first().cloned().unwrap_or_else(|| make_any().into_ref()),
            _ => make_any().into_ref(),
        }
    }

    fn check_list_member(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        match accessor_of(right) {
            Accessor::Index(items) => {
                if items.len() != 1 {
                    return Err(self.error(ErrorKind::RuntimeError, "List accessor expects one value"));
                }
                let index = self.check_node(&items[0])?;
                let kind = index.borrow().kind();
                if !matches!(kind, NodeKind::Int | NodeKind::Any) {
                    return Err(self.error(ErrorKind::TypeError, "List accessor expects an integer"));
                }
                Ok(self.element_type(left))
            }
            Accessor::Property(name) => match name.as_str() {
                "length" => Ok(make_int(0, false).into_ref()),
                "first" | "last" => Ok(self.element_type(left)),
                "empty" => Ok(make_bool(false, false).into_ref()),
                _ => Err(self.error(
                    ErrorKind::TypeError,
                    format!("Cannot perform operation '.' on '{}' and '{name}'", repr(left)),
                )),
            },
            Accessor::Method(name, args) => self.check_list_method(left, &name, &args),
            Accessor::Other => Err(self.error(
                ErrorKind::TypeError,
                format!("Cannot perform operation '.' on '{}' and '{}'", repr(left), repr(right)),
            )),
        }
    }

    fn check_list_method(&mut self, left: &NodeRef, name: &str, args: &[NodeRef]) -> RunResult<NodeRef> {
        match name {
            "map" | "flatmap" => {
                let produced = self.check_callback(left, name, args)?;
                let element = match &produced.borrow().payload {
                    Payload::List(items) if name == "flatmap" => {
                        items.first().cloned().unwrap_or_else(|| make_any().into_ref())
                    }
                    _ => produced.clone(),
                };
                super::clear_scalar_literal(&element);
                Ok(make_list(vec![element], true).into_ref())
            }
            "filter" => {
                self.check_callback(left, name, args)?;
                Ok(shallow_clone(left))
            }
            "foreach" => {
                self.check_callback(left, name, args)?;
                Ok(make_empty(false).into_ref())
            }
            "sort" => {
                if args.len() > 1 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "List built-in 'sort' expects 0 or 1 arguments",
                    ));
                }
                if let Some(arg) = args.first() {
                    let func = unwrap_singleton(self.check_node(arg)?);
                    let kind = func.borrow().kind();
                    if !matches!(kind, NodeKind::Function | NodeKind::FuncList | NodeKind::Any) {
                        return Err(self.error(
                            ErrorKind::TypeError,
                            "List built-in 'sort' expects argument to be a function",
                        ));
                    }
                }
                Ok(shallow_clone(left))
            }
            "flatten" => {
                if args.len() > 1 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "List built-in 'flatten' expects 0 or 1 arguments",
                    ));
                }
                Ok(make_list(vec![make_any().into_ref()], true).into_ref())
            }
            "append" | "prepend" => {
                if args.len() != 1 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        format!("List built-in '{name}' expects 1 arguments"),
                    ));
                }
                let value = self.check_node(&args[0])?;
                self.check_element_against(left, &value)?;
                Ok(shallow_clone(left))
            }
            "insert" => {
                if args.len() != 2 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "List built-in 'insert' expects 2 arguments",
                    ));
                }
                self.expect_int_ish(&args[0], "insert")?;
                let value = self.check_node(&args[1])?;
                self.check_element_against(left, &value)?;
                Ok(shallow_clone(left))
            }
            "remove" => {
                if args.len() != 1 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "List built-in 'remove' expects 1 arguments",
                    ));
                }
                self.expect_int_ish(&args[0], "remove")?;
                Ok(shallow_clone(left))
            }
            "clear" => Ok(shallow_clone(left)),
            "subsection" => {
                if args.len() != 2 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "List built-in 'subsection' expects 2 arguments",
                    ));
                }
                self.expect_int_ish(&args[0], "subsection")?;
                self.expect_int_ish(&args[1], "subsection")?;
                Ok(shallow_clone(left))
            }
            _ => Err(self.error(
                ErrorKind::TypeError,
                format!("List built-in '{name}' does not exist"),
            )),
        }
    }

    /// Type-checks a map/filter-style callback against the element type and
    /// returns the callback's result type.
    fn check_callback(&mut self, left: &NodeRef, name: &str, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 1 {
            return Err(self.error(
                ErrorKind::RuntimeError,
                format!("List built-in '{name}' expects 1 argument"),
            ));
        }
        let func = unwrap_singleton(self.check_node(&args[0])?);
        let element = self.element_type(left);

        match func.borrow().kind() {
            NodeKind::PartialOp => {
                let filled = shallow_clone(&func);
                {
                    let mut f = filled.borrow_mut();
                    let l_empty = f.left.as_ref().is_some_and(|n| n.borrow().kind() == NodeKind::Empty);
                    if l_empty {
                        f.left = Some(element.clone());
                    } else {
                        f.right = Some(element.clone());
                    }
                    let data = match &f.payload {
                        Payload::PartialOp(data) => Some(data.clone()),
                        _ => None,
                    };
                    if let Some(data) = data {
                        f.payload = Payload::Op(data);
                    }
                }
                self.check_node(&filled)
            }
            NodeKind::Function | NodeKind::FuncList => {
                let param_count = match &func.borrow().payload {
                    Payload::Function(f) => f.params.len(),
                    _ => 1,
                };
                let index = make_int(0, false).into_ref();
                let call_args: Vec<NodeRef> = match param_count {
                    1 => vec![element],
                    2 => vec![element, index],
                    3 => vec![element, index, left.clone()],
                    _ => {
                        return Err(self.error(
                            ErrorKind::TypeError,
                            format!("List built-in '{name}' expects function argument to have 1, 2 or 3 parameters"),
                        ));
                    }
                };
                self.check_function_call(&func, &call_args)
            }
            NodeKind::Any => Ok(make_any().into_ref()),
            _ => Err(self.error(
                ErrorKind::TypeError,
                format!("List built-in '{name}' expects argument to be a function or a partial operator"),
            )),
        }
    }

    fn check_element_against(&mut self, left: &NodeRef, value: &NodeRef) -> RunResult<()> {
        let element = self.element_type(left);
        let outcome = match_types(self, &element, value, true)?;
        if !outcome.ok {
            return Err(self.error(
                ErrorKind::TypeError,
                format!(
                    "Cannot append element of type '{}' to list of type {}",
                    crate::node::type_repr(value),
                    crate::node::type_repr(left)
                ),
            ));
        }
        Ok(())
    }

    fn expect_int_ish(&mut self, arg: &NodeRef, name: &str) -> RunResult<()> {
        let value = self.check_node(arg)?;
        let kind = value.borrow().kind();
        if !matches!(kind, NodeKind::Int | NodeKind::Any) {
            return Err(self.error(
                ErrorKind::TypeError,
                format!("List built-in '{name}' expects an integer index"),
            ));
        }
        Ok(())
    }

    fn check_string_member(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let string = || make_string("", false).into_ref();
        let boolean = || make_bool(false, false).into_ref();
        let string_list = || make_list(vec![make_string("", false).into_ref()], true).into_ref();

        match accessor_of(right) {
            Accessor::Index(items) => {
                if items.len() != 1 {
                    return Err(self.error(ErrorKind::RuntimeError, "List accessor expects one value"));
                }
                self.expect_int_ish(&items[0], "accessor")?;
                Ok(string())
            }
            Accessor::Property(name) => match name.as_str() {
                "length" => Ok(make_int(0, false).into_ref()),
                "first" | "last" => Ok(string()),
                "empty" | "is_alpha" | "is_digit" => Ok(boolean()),
                _ => Err(self.error(
                    ErrorKind::TypeError,
                    format!("String does not contain built-in property '{name}'"),
                )),
            },
            Accessor::Method(name, args) => match name.as_str() {
                "chars" | "split" => {
                    for arg in &args {
                        self.check_node(arg)?;
                    }
                    Ok(string_list())
                }
                "lower" | "upper" | "trim" | "append" | "prepend" | "insert" | "replace_at" | "remove"
                | "replace" | "replace_all" | "subsection" => {
                    for arg in &args {
                        self.check_node(arg)?;
                    }
                    Ok(string())
                }
                _ => Err(self.error(
                    ErrorKind::TypeError,
                    format!("String does not contain built-in function '{name}'"),
                )),
            },
            Accessor::Other => Err(self.error(
                ErrorKind::TypeError,
                format!("Cannot perform operation '.' on '{}' and '{}'", repr(left), repr(right)),
            )),
        }
    }

    fn check_object_member(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let properties = match &left.borrow().payload {
            Payload::Object { properties, .. } => properties.clone(),
            _ => unreachable!(),
        };

        match accessor_of(right) {
            Accessor::Index(items) => {
                if items.len() != 1 {
                    return Err(self.error(ErrorKind::RuntimeError, "Object accessor expects one value"));
                }
                let key = self.check_node(&items[0])?;
                let kind = key.borrow().kind();
                if kind == NodeKind::Any {
                    return Ok(make_any().into_ref());
                }
                if kind != NodeKind::String {
                    return Err(self.error(
                        ErrorKind::TypeError,
                        "Object accessor expects value of type string",
                    ));
                }
                match key.borrow().as_str().and_then(|k| properties.get(k)) {
                    Some(prop) => Ok(prop.value.clone()),
                    None => Ok(make_empty(false).into_ref()),
                }
            }
            Accessor::Property(name) => match name.as_str() {
                "_keys" => Ok(make_list(vec![make_string("", false).into_ref()], true).into_ref()),
                "_values" => {
                    let mut value_types: Vec<NodeRef> = properties.values().map(|p| p.value.clone()).collect();
                    sort_and_unique(self, &mut value_types)?;
                    let element = match value_types.len() {
                        0 => make_any().into_ref(),
                        1 => value_types.pop().expect("one type"),
                        _ => make_pipe_list(value_types).into_ref(),
                    };
                    Ok(make_list(vec![element], true).into_ref())
                }
                "_items" => Ok(make_list(vec![make_object(false).into_ref()], true).into_ref()),
                _ => match properties.get(&name) {
                    Some(prop) => {
                        // a refinement-valued property reads as its
                        // parameter's type
                        let is_refinement =
                            matches!(&prop.value.borrow().payload, Payload::Function(f) if f.is_type);
                        if is_refinement {
                            let first = {
                                let v = prop.value.borrow();
                                let Payload::Function(f) = &v.payload else { unreachable!() };
                                f.params.first().cloned()
                            };
                            if let Some(first) = first {
                                return get_explicit_type(self, &first, None);
                            }
                        }
                        Ok(prop.value.clone())
                    }
                    None => Ok(make_empty(false).into_ref()),
                },
            },
            Accessor::Method(name, args) => match name.as_str() {
                "delete" | "add" | "clear" => {
                    for arg in &args {
                        self.check_node(arg)?;
                    }
                    Ok(shallow_clone(left))
                }
                _ => {
                    let func = properties.get(&name).map(|p| p.value.clone()).ok_or_else(|| {
                        self.error(
                            ErrorKind::TypeError,
                            format!("Function '{name}' does not exist on object"),
                        )
                    })?;
                    self.check_function_call(&func, &args)
                }
            },
            Accessor::Other => Err(self.error(
                ErrorKind::TypeError,
                format!("Cannot perform operation '.' on '{}' and '{}'", repr(left), repr(right)),
            )),
        }
    }

    fn check_function_member(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        match accessor_of(right) {
            Accessor::Method(name, _) if name == "patch" => Ok(left.clone()),
            Accessor::Method(name, _) => Err(self.error(
                ErrorKind::TypeError,
                format!("Function does not contain built-in function '{name}'"),
            )),
            Accessor::Property(name) => match name.as_str() {
                "name" => Ok(make_string("", false).into_ref()),
                "params" => Ok(make_list(vec![make_string("", false).into_ref()], true).into_ref()),
                "args" => Ok(make_list(vec![make_any().into_ref()], true).into_ref()),
                _ => Err(self.error(
                    ErrorKind::TypeError,
                    format!("Function does not contain built-in property '{name}'"),
                )),
            },
            _ => Err(self.error(
                ErrorKind::TypeError,
                format!("Cannot perform operation '.' on '{}' and '{}'", repr(left), repr(right)),
            )),
        }
    }

    // -- abstract built-ins -- //

    pub(crate) fn check_builtin(&mut self, builtin: Builtin, args: &[NodeRef]) -> RunResult<NodeRef> {
        match builtin {
            Builtin::Exit => {
                if args.len() > 1 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'exit' expects 0 or 1 arguments",
                    ));
                }
                if let Some(arg) = args.first() {
                    let value = self.check_node(arg)?;
                    let kind = value.borrow().kind();
                    if !matches!(kind, NodeKind::Int | NodeKind::Any) {
                        return Err(self.error(
                            ErrorKind::TypeError,
                            "Built-in function 'exit' expects an integer argument",
                        ));
                    }
                }
                Ok(make_empty(false).into_ref())
            }
            Builtin::Error => {
                if args.len() != 2 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'error' expects 2 arguments",
                    ));
                }
                for arg in args {
                    let value = self.check_node(arg)?;
                    let kind = value.borrow().kind();
                    if !matches!(kind, NodeKind::String | NodeKind::Any) {
                        return Err(self.error(
                            ErrorKind::TypeError,
                            "Built-in function 'error' expects 2 string arguments",
                        ));
                    }
                }
                Ok(make_empty(false).into_ref())
            }
            Builtin::Range => {
                if args.len() != 2 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'range' expects 2 arguments",
                    ));
                }
                for arg in args {
                    let value = self.check_node(arg)?;
                    let kind = value.borrow().kind();
                    if !matches!(kind, NodeKind::Int | NodeKind::Any) {
                        return Err(self.error(
                            ErrorKind::TypeError,
                            "Built-in function 'range' expects 2 integer arguments",
                        ));
                    }
                }
                Ok(Node::new(Payload::Range { start: 0, end: 0 }).non_literal().into_ref())
            }
            Builtin::Print => {
                if args.is_empty() {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'print' expects at least one argument",
                    ));
                }
                for arg in args {
                    self.check_node(arg)?;
                }
                Ok(make_empty(false).into_ref())
            }
            Builtin::Delete => {
                for arg in args {
                    let name = {
                        let a = arg.borrow();
                        match &a.payload {
                            Payload::Id { name, .. } => Some(name.clone()),
                            Payload::Str(s) => Some(s.clone()),
                            _ => None,
                        }
                    };
                    match name {
                        Some(name) => self.scope.remove(&name),
                        None => {
                            return Err(self.error(
                                ErrorKind::RuntimeError,
                                "Built-in function 'delete' expects arguments to be either identifiers or strings",
                            ));
                        }
                    }
                }
                Ok(make_empty(false).into_ref())
            }
            Builtin::Time => Ok(make_int(0, false).into_ref()),
            Builtin::Import => {
                if args.len() != 1 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'import' expects 1 argument",
                    ));
                }
                let path = self.check_node(&args[0])?;
                let literal = {
                    let p = path.borrow();
                    if p.meta.is_literal {
                        p.as_str().map(str::to_owned)
                    } else {
                        None
                    }
                };
                match literal {
                    Some(path) => run::import_module_for_check(self, &path),
                    // a dynamic path can only be trusted at run time
                    None => Ok(make_object(false).into_ref()),
                }
            }
            Builtin::Read => {
                self.check_string_args(args, 1, "read")?;
                Ok(make_string("", false).into_ref())
            }
            Builtin::Write => {
                self.check_string_args(args, 2, "write")?;
                Ok(make_string("", false).into_ref())
            }
            Builtin::Append => {
                self.check_string_args(args, 2, "append")?;
                Ok(make_string("", false).into_ref())
            }
            Builtin::ToInt => {
                self.check_castable(args, "to_int")?;
                Ok(make_int(0, false).into_ref())
            }
            Builtin::ToFloat => {
                self.check_castable(args, "to_float")?;
                Ok(make_float(0.0, false).into_ref())
            }
            Builtin::ToString => {
                if args.len() != 1 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'to_string' expects one argument",
                    ));
                }
                self.check_node(&args[0])?;
                Ok(make_string("", false).into_ref())
            }
            Builtin::TypeOf => {
                if args.len() != 1 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'type' expects one argument",
                    ));
                }
                self.check_node(&args[0])?;
                Ok(make_string("", false).into_ref())
            }
            Builtin::Shape => {
                if args.len() != 1 {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'shape' expects one argument",
                    ));
                }
                let value = self.check_node(&args[0])?;
                shape_of(self, &value)
            }
        }
    }

    fn check_string_args(&mut self, args: &[NodeRef], arity: usize, name: &str) -> RunResult<()> {
        if args.len() != arity {
            return Err(self.error(
                ErrorKind::RuntimeError,
                format!("Built-in function '{name}' expects {arity} arguments"),
            ));
        }
        for arg in args {
            let value = self.check_node(arg)?;
            let kind = value.borrow().kind();
            if !matches!(kind, NodeKind::String | NodeKind::Any) {
                return Err(self.error(
                    ErrorKind::TypeError,
                    format!("Built-in function '{name}' expects string arguments"),
                ));
            }
        }
        Ok(())
    }

    fn check_castable(&mut self, args: &[NodeRef], name: &str) -> RunResult<()> {
        if args.len() != 1 {
            return Err(self.error(
                ErrorKind::RuntimeError,
                format!("Built-in function '{name}' expects one argument"),
            ));
        }
        let value = self.check_node(&args[0])?;
        let kind = value.borrow().kind();
        if !matches!(
            kind,
            NodeKind::Int | NodeKind::Float | NodeKind::Bool | NodeKind::String | NodeKind::Any
        ) {
            return Err(self.error(
                ErrorKind::TypeError,
                format!("Unable to cast '{}' to a number", repr(&value)),
            ));
        }
        Ok(())
    }
}
