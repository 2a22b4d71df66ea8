mod infer;
mod members;

use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    builtins::Builtin,
    error::{ErrorKind, GlideError, RunError, RunResult},
    node::{
        FunctionData, Node, NodeKind, NodeRef, OpKind, Payload, Property, make_any, make_bool, make_empty,
        make_float, make_func_list, make_int, make_list, make_object, make_pipe_list, make_string, param_annotation,
        param_is_variadic, param_name, repr, shallow_clone, type_repr,
    },
    run::Session,
    scope::Scope,
    walker::{
        Walker, get_explicit_type, match_function, match_types, shape_of, sort_and_unique, unwrap_singleton,
    },
};

/// The abstract interpreter: walks the same AST as the evaluator, but with
/// literal values standing in for their kinds.
///
/// Structure mirrors the evaluator: one instance per file, scopes pushed
/// for blocks and swapped for calls. Where the evaluator produces values,
/// the checker produces type nodes; where the evaluator would trap at run
/// time, the checker reports before anything runs.
pub(crate) struct Typechecker {
    pub(crate) file_chain: SmallVec<[String; 4]>,
    pub(crate) scope: Scope,
    pub(crate) line: u32,
    pub(crate) column: u32,
    pub(crate) session: Rc<Session>,
}

impl Typechecker {
    pub fn new(file_name: &str, scope: Scope, session: Rc<Session>) -> Self {
        Self {
            file_chain: smallvec::smallvec![file_name.to_owned()],
            scope,
            line: 1,
            column: 1,
            session,
        }
    }

    pub(crate) fn error(&self, kind: ErrorKind, message: impl Into<String>) -> RunError {
        GlideError::new(kind, self.file_chain.clone(), self.line, self.column, message.into()).into()
    }

    fn stamp(&self, node: Node) -> NodeRef {
        node.at(self.line, self.column).into_ref()
    }

    /// Checks a whole file's statements.
    pub(crate) fn check(&mut self, nodes: &[NodeRef]) -> RunResult<()> {
        for node in nodes {
            if node.borrow().is_op(OpKind::Semicolon) {
                continue;
            }
            {
                let n = node.borrow();
                self.line = n.line;
                self.column = n.column;
            }
            self.check_node(node)?;
        }
        Ok(())
    }

    pub(crate) fn check_nodes(&mut self, nodes: &[NodeRef]) -> RunResult<NodeRef> {
        let mut result = self.stamp(make_empty(false));
        for node in nodes {
            if node.borrow().is_op(OpKind::Semicolon) {
                continue;
            }
            result = self.check_node(node)?;
            if matches!(
                result.borrow().kind(),
                NodeKind::Return | NodeKind::Break | NodeKind::Continue
            ) {
                return Ok(result);
            }
        }
        Ok(result)
    }

    pub(crate) fn check_node(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        {
            let n = node.borrow();
            if n.line != 0 {
                self.line = n.line;
                self.column = n.column;
            }
        }

        let kind = node.borrow().kind();
        match kind {
            NodeKind::Return => {
                let inner = node.borrow().right.clone();
                match inner {
                    Some(inner) => self.check_node(&inner),
                    None => Ok(self.stamp(make_empty(false))),
                }
            }
            NodeKind::Int | NodeKind::Float | NodeKind::Bool | NodeKind::String | NodeKind::Empty | NodeKind::Any => {
                Ok(shallow_clone(node))
            }
            NodeKind::Object => self.check_object_literal(node),
            NodeKind::Block => self.check_block(node),
            NodeKind::List => self.check_list_literal(node),
            NodeKind::CommaList => self.check_comma_list(node),
            NodeKind::PipeList => self.check_pipe_list(node),
            NodeKind::Id => self.check_identifier(node),
            NodeKind::Copy => {
                let target = node.borrow().right.clone();
                match target {
                    Some(target) => self.check_node(&target),
                    None => Ok(shallow_clone(node)),
                }
            }
            NodeKind::Op => self.check_op(node),
            NodeKind::PartialOp => Ok(shallow_clone(node)),
            NodeKind::Function => self.check_function_literal(node),
            NodeKind::FuncCall => self.check_call_node(node),
            NodeKind::IfStatement => self.check_if_statement(node),
            NodeKind::IfBlock => self.check_if_block(node),
            NodeKind::MatchBlock => self.check_match_block(node),
            NodeKind::WhileLoop => self.check_while_loop(node),
            NodeKind::ForLoop => self.check_for_loop(node),
            NodeKind::Keyword => self.check_keyword(node),
            NodeKind::Range | NodeKind::TypeMarker => Ok(shallow_clone(node)),
            _ => Ok(node.clone()),
        }
    }

    fn check_op(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let op = node.borrow().op_kind().expect("op payload");
        match op {
            OpKind::Inject => self.check_inject(node),
            OpKind::DoubleDot => self.check_range(node),
            OpKind::Plus | OpKind::Minus | OpKind::Star | OpKind::Slash | OpKind::Percent => {
                self.check_arith(node, op)
            }
            OpKind::Pos | OpKind::Neg => self.check_sign(node),
            OpKind::Not => self.check_not(node),
            OpKind::Lt | OpKind::Gt | OpKind::LtEq | OpKind::GtEq | OpKind::EqEq | OpKind::NotEq => {
                self.check_comparison(node)
            }
            OpKind::And | OpKind::Or => self.check_logical(node),
            OpKind::Dot => self.check_dot(node),
            OpKind::Equal => self.check_assignment(node),
            OpKind::PlusEq | OpKind::MinusEq => {
                // compound assignment types like the desugared form
                let (left_node, right_node) = operand_pair(node);
                let arith = if op == OpKind::PlusEq { OpKind::Plus } else { OpKind::Minus };
                let left = self.check_node(&left_node)?;
                let right = self.check_node(&right_node)?;
                let sum = self.combine_arith(node, &left, &right, arith)?;
                let assign = self.stamp(Node::new(Payload::Op(crate::node::OpData::new("=", OpKind::Equal))));
                {
                    let mut a = assign.borrow_mut();
                    a.left = Some(left_node);
                    a.right = Some(sum);
                }
                self.check_assignment(&assign)
            }
            _ => Ok(node.clone()),
        }
    }

    // -- literals -- //

    fn check_list_literal(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        // A non-literal list node is the bare `list` carrier.
        if !node.borrow().meta.is_literal {
            return Ok(self.stamp(make_list(vec![make_any().into_ref()], false)));
        }
        let items = match &node.borrow().payload {
            Payload::List(items) => items.clone(),
            _ => unreachable!(),
        };
        let mut element_types = Vec::with_capacity(items.len());
        for item in &items {
            let checked = self.check_node(item)?;
            clear_scalar_literal(&checked);
            element_types.push(checked);
        }
        sort_and_unique(self, &mut element_types)?;

        let element = match element_types.len() {
            0 => make_any().into_ref(),
            1 => element_types.pop().expect("one element"),
            _ => self.stamp(make_pipe_list(element_types)),
        };
        Ok(self.stamp(make_list(vec![element], true)))
    }

    fn check_comma_list(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let items = match &node.borrow().payload {
            Payload::CommaList(items) => items.clone(),
            _ => unreachable!(),
        };
        if items.len() == 1 {
            return self.check_node(&items[0]);
        }
        let mut checked = Vec::with_capacity(items.len());
        for item in &items {
            checked.push(self.check_node(item)?);
        }
        let result = shallow_clone(node);
        result.borrow_mut().payload = Payload::CommaList(checked);
        Ok(result)
    }

    fn check_pipe_list(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let items = match &node.borrow().payload {
            Payload::PipeList(items) => items.clone(),
            _ => unreachable!(),
        };
        let mut checked = Vec::with_capacity(items.len());
        for item in &items {
            checked.push(self.check_node(item)?);
        }
        let result = shallow_clone(node);
        result.borrow_mut().payload = Payload::PipeList(checked);
        Ok(result)
    }

    fn check_object_literal(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let result = shallow_clone(node);
        if !result.borrow().meta.is_literal {
            return Ok(result);
        }
        let properties = match &result.borrow().payload {
            Payload::Object { properties, .. } => properties.clone(),
            _ => unreachable!(),
        };

        // Data properties first, written straight back so method bodies
        // (checked below, closing over `this`) see sibling types rather
        // than literal payloads.
        for (key, prop) in &properties {
            let is_callable = matches!(
                prop.value.borrow().payload,
                Payload::Function(_) | Payload::FuncList(_)
            );
            if is_callable {
                continue;
            }
            let value = self.check_node(&prop.value)?;
            clear_scalar_literal(&value);
            if let Payload::Object { properties, .. } = &mut result.borrow_mut().payload {
                properties.insert(
                    key.clone(),
                    Property {
                        required: prop.required,
                        value,
                    },
                );
            }
        }

        for (key, prop) in &properties {
            let is_callable = matches!(
                prop.value.borrow().payload,
                Payload::Function(_) | Payload::FuncList(_)
            );
            if !is_callable {
                continue;
            }
            if let Payload::Function(func) = &mut prop.value.borrow_mut().payload {
                func.closure.insert("this".to_owned(), result.clone());
            }
            if let Payload::FuncList(items) = &prop.value.borrow().payload {
                for item in items {
                    if let Payload::Function(func) = &mut item.borrow_mut().payload {
                        func.closure.insert("this".to_owned(), result.clone());
                    }
                }
            }
            let value = self.check_node(&prop.value)?;
            if let Payload::Object { properties, .. } = &mut result.borrow_mut().payload {
                properties.insert(
                    key.clone(),
                    Property {
                        required: prop.required,
                        value,
                    },
                );
            }
        }
        Ok(result)
    }

    fn check_block(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let items = match &node.borrow().payload {
            Payload::Block(items) => items.clone(),
            _ => unreachable!(),
        };
        if items.is_empty() {
            return Ok(self.stamp(make_object(true)));
        }
        let saved = self.scope.clone();
        self.scope = saved.child();
        let result = self.check_nodes(&items);
        self.scope = saved;
        result
    }

    fn check_identifier(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (name, annotation) = {
            let n = node.borrow();
            let Payload::Id { name, annotation } = &n.payload else {
                unreachable!()
            };
            (name.clone(), annotation.clone())
        };

        let Some(var) = self.scope.get(&name) else {
            if let Some(annotation) = annotation {
                let explicit = self.check_node(&annotation)?;
                if explicit.borrow().kind() == NodeKind::TypeMarker {
                    let value = self.stamp(make_object(true));
                    {
                        let mut v = value.borrow_mut();
                        v.meta.name.clone_from(&name);
                        v.meta.allowed_type = Some(explicit);
                        if let Payload::Object { is_type, .. } = &mut v.payload {
                            *is_type = true;
                        }
                    }
                    self.scope.insert(name, value.clone());
                    return Ok(value);
                }
            }
            return Err(self.error(ErrorKind::RuntimeError, format!("Undefined variable '{name}'")));
        };

        // `x::T` on a defined name reads as a cast assertion.
        if let Some(annotation) = annotation {
            let explicit = self.check_node(&annotation)?;
            let recorded = var
                .borrow()
                .meta
                .allowed_type
                .clone()
                .unwrap_or_else(|| make_any().into_ref());
            let outcome = match_types(self, &recorded, &explicit, true)?;
            if !outcome.ok {
                return Err(self.error(
                    ErrorKind::TypeError,
                    format!(
                        "Cannot cast type from '{}' to '{}'",
                        type_repr(&recorded),
                        type_repr(&explicit)
                    ),
                ));
            }
            let content = explicit.borrow().clone();
            *var.borrow_mut() = content;
            var.borrow_mut().meta.allowed_type = Some(explicit);
        }

        Ok(unwrap_singleton(var))
    }

    /// Function definition: capture the closure, then run whole-function
    /// return inference.
    fn check_function_literal(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (params, args, name, is_literal) = {
            let n = node.borrow();
            let Payload::Function(f) = &n.payload else { unreachable!() };
            (f.params.clone(), f.args.clone(), f.name.clone(), n.meta.is_literal)
        };

        let mut checked_args = Vec::with_capacity(args.len());
        for slot in &args {
            match slot {
                Some(default) => checked_args.push(Some(self.check_node(default)?)),
                None => checked_args.push(None),
            }
        }

        let mut marks_type = false;
        for param in &params {
            if param_name(param).as_deref() == Some("__type") {
                marks_type = true;
            }
            // resolve annotations once so dispatch sees evaluated types
            if let Some(ann) = param_annotation(param) {
                let resolved = self.check_node(&ann)?;
                set_param_annotation(param, resolved);
            }
        }

        let snapshot = self.scope.snapshot();
        {
            let mut n = node.borrow_mut();
            let Payload::Function(f) = &mut n.payload else { unreachable!() };
            f.args = checked_args;
            if marks_type {
                f.is_type = true;
            }
            for (key, value) in snapshot {
                f.closure.insert(key, value);
            }
        }

        let self_entry = {
            let n = node.borrow();
            let Payload::Function(f) = &n.payload else { unreachable!() };
            f.closure.get(&name).cloned()
        };
        let self_value = match self_entry {
            Some(existing) if existing.borrow().kind() == NodeKind::FuncList => {
                let copy = shallow_clone(&existing);
                if let Payload::FuncList(items) = &mut copy.borrow_mut().payload {
                    items.push(node.clone());
                }
                copy
            }
            Some(existing) => existing,
            None => node.clone(),
        };
        {
            let mut n = node.borrow_mut();
            let Payload::Function(f) = &mut n.payload else { unreachable!() };
            f.closure.insert(name, self_value);
        }

        if !is_literal {
            return Ok(node.clone());
        }

        infer::type_func(self, node)?;

        let is_type = {
            let n = node.borrow();
            let Payload::Function(f) = &n.payload else { unreachable!() };
            f.is_type
        };
        if is_type {
            // a refinement evaluates, as a type, to its parameter's type
            let first = {
                let n = node.borrow();
                let Payload::Function(f) = &n.payload else { unreachable!() };
                f.params.first().cloned()
            };
            if let Some(first) = first {
                return get_explicit_type(self, &first, None);
            }
        }
        Ok(node.clone())
    }

    // -- calls -- //

    fn check_call_node(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (name, caller, args) = {
            let n = node.borrow();
            let Payload::FuncCall { name, caller, args } = &n.payload else {
                unreachable!()
            };
            (name.clone(), caller.clone(), args.clone())
        };

        if let Some(builtin) = Builtin::from_name(&name) {
            return self.check_builtin(builtin, &args);
        }

        let func = match self.scope.get(&name) {
            Some(found) => found,
            None => {
                let fallback = caller.as_ref().filter(|c| {
                    let c = c.borrow();
                    matches!(c.payload, Payload::Function(_)) || c.op_kind() == Some(OpKind::Dot)
                });
                match fallback {
                    Some(caller) => self.check_node(caller)?,
                    None => {
                        return Err(self.error(ErrorKind::RuntimeError, format!("Function '{name}' is undefined")));
                    }
                }
            }
        };

        self.check_function_call(&func, &args)
    }

    /// Per-call-site checking: resolve the overload, clone it so the
    /// specialization stays local, bind argument types, re-walk the body.
    pub(crate) fn check_function_call(&mut self, function: &NodeRef, raw_args: &[NodeRef]) -> RunResult<NodeRef> {
        let func_kind = function.borrow().kind();

        if func_kind == NodeKind::Any {
            return Ok(self.stamp(make_any()));
        }
        if func_kind == NodeKind::PipeList && !crate::walker::is_function_set(function) {
            return Err(self.error(
                ErrorKind::RuntimeError,
                "Malformed function call - variable is not a function".to_owned(),
            ));
        }
        if func_kind == NodeKind::PipeList {
            // a union of functions produces the union of results
            let mut results = Vec::new();
            for member in crate::walker::set_items(function) {
                let member = clone_func(&member);
                results.push(self.check_function_call(&member, raw_args)?);
            }
            sort_and_unique(self, &mut results)?;
            if results.len() == 1 {
                return Ok(results.pop().expect("one result"));
            }
            return Ok(self.stamp(make_pipe_list(results)));
        }

        if !matches!(func_kind, NodeKind::Function | NodeKind::FuncList) {
            return Err(self.error(
                ErrorKind::RuntimeError,
                "Malformed function call - variable is not a function".to_owned(),
            ));
        }

        // evaluate argument types once
        let mut positional: Vec<NodeRef> = Vec::new();
        let mut keywords: Vec<(String, NodeRef)> = Vec::new();
        for arg in raw_args {
            let keyword = {
                let a = arg.borrow();
                if a.op_kind() == Some(OpKind::Colon) {
                    a.left
                        .as_ref()
                        .and_then(|l| l.borrow().id_name().map(str::to_owned))
                        .map(|name| (name, a.right.clone()))
                } else {
                    None
                }
            };
            match keyword {
                Some((name, Some(value))) => keywords.push((name, self.check_node(&value)?)),
                _ => positional.push(self.check_node(arg)?),
            }
        }

        let func = if func_kind == NodeKind::Function {
            shallow_clone(function)
        } else {
            match_function(self, function, &positional)?
        };
        let func = clone_func(&func);

        // A non-literal function type only promises its return type.
        if !func.borrow().meta.is_literal {
            let ret = {
                let n = func.borrow();
                let Payload::Function(f) = &n.payload else { unreachable!() };
                f.return_type.clone()
            };
            return Ok(ret.unwrap_or_else(|| self.stamp(make_any())));
        }

        let data = {
            let n = func.borrow();
            let Payload::Function(f) = &n.payload else {
                return Err(self.error(
                    ErrorKind::RuntimeError,
                    "Malformed function call - variable is not a function".to_owned(),
                ));
            };
            f.clone()
        };
        let FunctionData {
            name,
            params,
            args: mut slots,
            body,
            return_type,
            closure,
            default_indices,
            ..
        } = data;

        // bind positionally with the evaluator's slot-skipping rules
        let mut position = 0usize;
        let mut iter = positional.iter();
        while let Some(value) = iter.next() {
            if position >= params.len() {
                return Err(self.error(
                    ErrorKind::RuntimeError,
                    format!(
                        "Function '{name}' expects {} arguments, but {} were provided",
                        slots.len(),
                        positional.len()
                    ),
                ));
            }
            if param_is_variadic(&params[position]) {
                let mut rest = vec![value.clone()];
                rest.extend(iter.by_ref().cloned());
                slots[position] = Some(self.stamp(make_list(rest, true)));
                break;
            }
            while position < slots.len() && slots[position].is_some() && !default_indices.contains(&position) {
                position += 1;
            }
            if position >= slots.len() {
                return Err(self.error(
                    ErrorKind::RuntimeError,
                    format!(
                        "Function '{name}' expects {} arguments, but {} were provided",
                        slots.len(),
                        positional.len()
                    ),
                ));
            }
            slots[position] = Some(value.clone());
            position += 1;
        }
        for (key, value) in keywords {
            let index = params.iter().position(|p| param_name(p).as_deref() == Some(&key));
            match index {
                Some(index) => slots[index] = Some(value),
                None => {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        format!("Parameter '{key}' does not exist on function '{name}'"),
                    ));
                }
            }
        }

        if slots.iter().any(Option::is_none) {
            let partial = shallow_clone(&func);
            if let Payload::Function(f) = &mut partial.borrow_mut().payload {
                f.args = slots;
            }
            return Ok(partial);
        }

        // call environment: built-ins, then closure, then parameters
        let call_scope = Scope::new();
        for builtin_name in self.session.builtins_names.borrow().iter() {
            if let Some(value) = self.scope.get(builtin_name) {
                call_scope.insert(builtin_name.clone(), value);
            }
        }
        for (key, value) in &closure {
            call_scope.insert(key.clone(), value.clone());
        }

        for (i, param) in params.iter().enumerate() {
            let value = slots[i].clone().expect("all holes filled");
            if let Some(binding) = param_name(param) {
                call_scope.insert(binding, value.clone());
            }

            let param_type = {
                let saved = std::mem::replace(&mut self.scope, call_scope.clone());
                let result = get_explicit_type(self, param, None);
                self.scope = saved;
                result?
            };

            let value_is_refinement = match &value.borrow().payload {
                Payload::Function(f) => f.is_type,
                _ => false,
            };
            let outcome = if value_is_refinement {
                match_types(self, &value, &param_type, true)?
            } else {
                match_types(self, &param_type, &value, true)?
            };
            if !outcome.ok {
                return Err(self.error(
                    ErrorKind::ArgTypeError,
                    format!(
                        "Function '{name}': Cannot assign value of type '{}' to parameter of type '{}'. {}",
                        repr(&value),
                        repr(&param_type),
                        outcome.message
                    ),
                ));
            }

            // specialize the clone's parameter to this argument's type
            let arg_type = {
                let refined = match &value.borrow().payload {
                    Payload::Function(f) if f.is_type => f.params.first().and_then(param_annotation),
                    _ => None,
                };
                refined.unwrap_or_else(|| value.clone())
            };
            clear_scalar_literal(&arg_type);
            set_param_annotation(param, arg_type);
        }

        // recursion guard: a name already on the call chain resolves to
        // its recorded return type instead of recursing
        if self.file_chain.iter().skip(1).any(|segment| segment == &name) {
            return Ok(return_type.unwrap_or_else(|| self.stamp(make_any())));
        }

        if self.session.enter_call().is_err() {
            return Err(self.error(
                ErrorKind::RuntimeError,
                format!("Maximum call depth of {} exceeded", crate::run::MAX_CALL_DEPTH),
            ));
        }
        let saved_scope = std::mem::replace(&mut self.scope, call_scope);
        self.file_chain.push(name);

        let result: RunResult<NodeRef> = (|| {
            let body_items = match &body.borrow().payload {
                Payload::Block(items) => Some(items.clone()),
                _ => None,
            };
            let result = match body_items {
                Some(items) => self.check_nodes(&items)?,
                None => self.check_node(&body)?,
            };
            if result.borrow().kind() == NodeKind::Return {
                let inner = result.borrow().right.clone();
                return Ok(inner.unwrap_or_else(|| make_empty(false).into_ref()));
            }
            Ok(result)
        })();

        self.file_chain.pop();
        self.scope = saved_scope;
        self.session.leave_call();

        let result = result?;
        if let Payload::Function(f) = &mut func.borrow_mut().payload {
            f.return_type = Some(result.clone());
        }
        Ok(result)
    }

    // -- operators, abstractly -- //

    fn check_arith(&mut self, node: &NodeRef, op: OpKind) -> RunResult<NodeRef> {
        let (left_node, right_node) = operand_pair(node);
        let left = self.check_node(&left_node)?;
        let right = self.check_node(&right_node)?;
        self.combine_arith(node, &left, &right, op)
    }

    /// Kind-level operator combination; invalid pairs fail at check time.
    fn combine_arith(&mut self, node: &NodeRef, left: &NodeRef, right: &NodeRef, op: OpKind) -> RunResult<NodeRef> {
        let (lk, rk) = (left.borrow().kind(), right.borrow().kind());

        if lk == NodeKind::Empty {
            return Ok(right.clone());
        }
        if rk == NodeKind::Empty {
            return Ok(left.clone());
        }
        if lk == NodeKind::Any || rk == NodeKind::Any || lk == NodeKind::PipeList || rk == NodeKind::PipeList {
            return Ok(self.stamp(make_any()));
        }

        let numeric = |k: NodeKind| matches!(k, NodeKind::Int | NodeKind::Float | NodeKind::Bool);

        let result = match op {
            OpKind::Plus => match (lk, rk) {
                _ if numeric(lk) && numeric(rk) => {
                    if lk == NodeKind::Float || rk == NodeKind::Float {
                        Some(self.stamp(make_float(0.0, false)))
                    } else {
                        Some(self.stamp(make_int(0, false)))
                    }
                }
                (NodeKind::String, _) if numeric(rk) || rk == NodeKind::String => {
                    Some(self.stamp(make_string("", false)))
                }
                (_, NodeKind::String) if numeric(lk) => Some(self.stamp(make_string("", false))),
                (NodeKind::List, NodeKind::List) => Some(self.merge_list_types(left, right)?),
                (NodeKind::List, _) => Some(self.widen_list_type(left, right)?),
                (_, NodeKind::List) => Some(self.widen_list_type(right, left)?),
                (NodeKind::Object, NodeKind::Object) => {
                    let mut merged = match &left.borrow().payload {
                        Payload::Object { properties, .. } => properties.clone(),
                        _ => indexmap::IndexMap::new(),
                    };
                    if let Payload::Object { properties, .. } = &right.borrow().payload {
                        for (key, prop) in properties {
                            merged.insert(key.clone(), prop.clone());
                        }
                    }
                    let result = self.stamp(make_object(true));
                    if let Payload::Object { properties, .. } = &mut result.borrow_mut().payload {
                        *properties = merged;
                    }
                    Some(result)
                }
                _ => None,
            },
            OpKind::Minus => {
                if numeric(lk) && numeric(rk) {
                    if lk == NodeKind::Float || rk == NodeKind::Float {
                        Some(self.stamp(make_float(0.0, false)))
                    } else {
                        Some(self.stamp(make_int(0, false)))
                    }
                } else {
                    None
                }
            }
            OpKind::Star => match (lk, rk) {
                (NodeKind::String, NodeKind::Int) | (NodeKind::Int, NodeKind::String) => {
                    Some(self.stamp(make_string("", false)))
                }
                (NodeKind::List, NodeKind::Int) => Some(shallow_clone(left)),
                (NodeKind::Int, NodeKind::List) => Some(shallow_clone(right)),
                _ if numeric(lk) && numeric(rk) => {
                    if lk == NodeKind::Float || rk == NodeKind::Float {
                        Some(self.stamp(make_float(0.0, false)))
                    } else {
                        Some(self.stamp(make_int(0, false)))
                    }
                }
                _ => None,
            },
            OpKind::Slash => {
                if numeric(lk) && numeric(rk) {
                    Some(self.stamp(make_float(0.0, false)))
                } else {
                    None
                }
            }
            OpKind::Percent => match (lk, rk) {
                (NodeKind::Int, NodeKind::Int) => Some(self.stamp(make_int(0, false))),
                _ if numeric(lk) && numeric(rk) => Some(self.stamp(make_float(0.0, false))),
                _ => None,
            },
            _ => None,
        };

        result.ok_or_else(|| {
            self.error(
                ErrorKind::TypeError,
                format!("Cannot perform '{}' on {} and {}", repr(node), repr(left), repr(right)),
            )
        })
    }

    fn merge_list_types(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let mut elements = Vec::new();
        for side in [left, right] {
            if let Payload::List(items) = &side.borrow().payload {
                elements.extend(items.iter().cloned());
            }
        }
        sort_and_unique(self, &mut elements)?;
        let element = match elements.len() {
            0 => make_any().into_ref(),
            1 => elements.pop().expect("one element"),
            _ => self.stamp(make_pipe_list(elements)),
        };
        Ok(self.stamp(make_list(vec![element], true)))
    }

    fn widen_list_type(&mut self, list: &NodeRef, extra: &NodeRef) -> RunResult<NodeRef> {
        let mut elements = match &list.borrow().payload {
            Payload::List(items) => items.clone(),
            _ => Vec::new(),
        };
        let extra_type = shape_of(self, extra)?;
        elements.push(extra_type);
        sort_and_unique(self, &mut elements)?;
        let element = match elements.len() {
            0 => make_any().into_ref(),
            1 => elements.pop().expect("one element"),
            _ => self.stamp(make_pipe_list(elements)),
        };
        Ok(self.stamp(make_list(vec![element], true)))
    }

    fn check_sign(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let operand = node.borrow().right.clone().expect("operand");
        let value = self.check_node(&operand)?;
        let kind = value.borrow().kind();
        match kind {
            NodeKind::Int | NodeKind::Bool => Ok(self.stamp(make_int(0, false))),
            NodeKind::Float => Ok(self.stamp(make_float(0.0, false))),
            NodeKind::String | NodeKind::List => Ok(value),
            NodeKind::Any => Ok(self.stamp(make_any())),
            _ => Err(self.error(
                ErrorKind::TypeError,
                format!("Cannot perform '{}' on {}", repr(node), repr(&value)),
            )),
        }
    }

    fn check_not(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let operand = node.borrow().right.clone().expect("operand");
        let value = self.check_node(&operand)?;
        let kind = value.borrow().kind();
        match kind {
            NodeKind::Bool | NodeKind::Empty => Ok(self.stamp(make_bool(false, false))),
            NodeKind::Any => Ok(self.stamp(make_any())),
            _ => Err(self.error(
                ErrorKind::TypeError,
                format!("Cannot perform '!' on {}", repr(&value)),
            )),
        }
    }

    fn check_comparison(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left_node, right_node) = operand_pair(node);
        self.check_node(&left_node)?;
        self.check_node(&right_node)?;
        Ok(self.stamp(make_bool(false, false)))
    }

    fn check_logical(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left_node, right_node) = operand_pair(node);
        for side in [left_node, right_node] {
            let value = self.check_node(&side)?;
            let kind = value.borrow().kind();
            if !matches!(kind, NodeKind::Bool | NodeKind::Any) {
                return Err(self.error(
                    ErrorKind::TypeError,
                    format!("Cannot perform '{}' on {}", repr(node), repr(&value)),
                ));
            }
        }
        Ok(self.stamp(make_bool(false, false)))
    }

    fn check_range(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left_node, right_node) = operand_pair(node);
        for side in [left_node, right_node] {
            let value = self.check_node(&side)?;
            let kind = value.borrow().kind();
            if !matches!(kind, NodeKind::Int | NodeKind::Any) {
                return Err(self.error(
                    ErrorKind::TypeError,
                    "Range operator expects both operands to be integer types",
                ));
            }
        }
        Ok(self.stamp(make_list(vec![make_int(0, false).into_ref()], true)))
    }

    fn check_keyword(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let keyword = match &node.borrow().payload {
            Payload::Keyword(k) => k.clone(),
            _ => unreachable!(),
        };
        match keyword.as_str() {
            "break" => Ok(self.stamp(Node::new(Payload::Break))),
            "continue" => Ok(self.stamp(Node::new(Payload::Continue))),
            "ret" => {
                let value = node.borrow().right.clone();
                let value = match value {
                    Some(v) => self.check_node(&v)?,
                    None => self.stamp(make_empty(false)),
                };
                let ret = self.stamp(Node::new(Payload::Return));
                ret.borrow_mut().right = Some(value);
                Ok(ret)
            }
            other => Err(self.error(ErrorKind::RuntimeError, format!("Unexpected keyword '{other}'"))),
        }
    }

    // -- assignment -- //

    fn check_assignment(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left, right) = {
            let n = node.borrow();
            (n.left.clone().expect("target"), n.right.clone().expect("value"))
        };

        if left.borrow().id_name().is_some() {
            return self.assign_identifier_type(&left, &right);
        }
        if matches!(left.borrow().payload, Payload::List(_)) {
            let items = match &left.borrow().payload {
                Payload::List(items) => items.clone(),
                _ => unreachable!(),
            };
            if items.len() != 1 {
                return Err(self.error(ErrorKind::RuntimeError, "Dynamic variable creation list expects 1 argument"));
            }
            let key = self.check_node(&items[0])?;
            if key.borrow().kind() != NodeKind::String && key.borrow().kind() != NodeKind::Any {
                return Err(self.error(
                    ErrorKind::RuntimeError,
                    "Dynamic variable creation list expects 1 string argument",
                ));
            }
            let value = self.check_node(&right)?;
            // a literal key is knowable now; a computed one only at run time
            let literal_key = {
                let k = key.borrow();
                if k.meta.is_literal { k.as_str().map(str::to_owned) } else { None }
            };
            if let Some(name) = literal_key {
                self.scope.insert(name, shallow_clone(&value));
            }
            return Ok(value);
        }
        if left.borrow().op_kind() == Some(OpKind::Dot) {
            return self.assign_member_type(&left, &right);
        }

        self.check_node(&right)
    }

    fn assign_identifier_type(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let (name, annotation) = {
            let l = left.borrow();
            let Payload::Id { name, annotation } = &l.payload else {
                unreachable!()
            };
            (name.clone(), annotation.clone())
        };
        let existing = self.scope.get(&name);
        let value = self.check_node(right)?;

        let Some(var) = existing else {
            let Some(annotation) = annotation else {
                if value.borrow().meta.allowed_type.is_none() {
                    let inferred = shape_of(self, &value)?;
                    value.borrow_mut().meta.allowed_type = Some(inferred);
                }
                if matches!(value.borrow().payload, Payload::Function(_)) {
                    let val = shallow_clone(&value);
                    if let Payload::Function(f) = &mut val.borrow_mut().payload {
                        f.name.clone_from(&name);
                    }
                    let set = self.stamp(make_func_list(vec![val.clone()]));
                    self.scope.insert(name, set);
                    return Ok(val);
                }
                let val = shallow_clone(&value);
                self.scope.insert(name, val.clone());
                return Ok(val);
            };

            let explicit = self.check_node(&annotation)?;
            if explicit.borrow().kind() == NodeKind::TypeMarker {
                let mut v = value.borrow_mut();
                v.meta.name.clone_from(&name);
                match &mut v.payload {
                    Payload::Object { is_type, .. } => *is_type = true,
                    Payload::Function(f) => f.is_type = true,
                    _ => {}
                }
            }
            if let Payload::Function(f) = &mut explicit.borrow_mut().payload {
                f.is_type = true;
            }

            let outcome = match_types(self, &explicit, &value, true)?;
            if !outcome.ok {
                return Err(self.error(
                    ErrorKind::TypeError,
                    format!(
                        "Cannot assign value of type '{}' to variable of type '{}'. {}",
                        repr(&value),
                        repr(&explicit),
                        outcome.message
                    ),
                ));
            }

            let val = shallow_clone(&value);
            {
                let mut v = val.borrow_mut();
                v.meta.allowed_type = Some(explicit);
                if let Payload::Function(f) = &mut v.payload {
                    f.name.clone_from(&name);
                }
            }
            self.scope.insert(name, val.clone());
            return Ok(val);
        };

        if let Some(annotation) = &annotation {
            let is_any = annotation.borrow().kind() == NodeKind::Any;
            if !is_any {
                return Err(self.error(
                    ErrorKind::TypeError,
                    format!("Cannot re-assign type of variable '{name}'"),
                ));
            }
            var.borrow_mut().meta.allowed_type = Some(annotation.clone());
        }

        if var.borrow().kind() == NodeKind::FuncList && value.borrow().kind() == NodeKind::Function {
            let entry = shallow_clone(&value);
            if let Payload::Function(f) = &mut entry.borrow_mut().payload {
                f.name.clone_from(&name);
            }
            if let Payload::FuncList(items) = &mut var.borrow_mut().payload {
                items.push(entry.clone());
            }
            self.scope.insert(name, var);
            return Ok(entry);
        }

        let allowed = var
            .borrow()
            .meta
            .allowed_type
            .clone()
            .unwrap_or_else(|| make_any().into_ref());
        if allowed.borrow().kind() != NodeKind::Any {
            let outcome = match_types(self, &allowed, &value, true)?;
            if !outcome.ok {
                return Err(self.error(
                    ErrorKind::TypeError,
                    format!(
                        "Cannot assign value of type '{}' to variable of type '{}'. {}",
                        repr(&value),
                        repr(&allowed),
                        outcome.message
                    ),
                ));
            }
        }

        let val = shallow_clone(&value);
        val.borrow_mut().meta.allowed_type = Some(allowed);
        let content = val.borrow().clone();
        *var.borrow_mut() = content;
        Ok(val)
    }

    fn assign_member_type(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let (object_node, accessor) = {
            let l = left.borrow();
            (l.left.clone().expect("object"), l.right.clone().expect("accessor"))
        };
        let object = self.check_node(&object_node)?;
        let value = self.check_node(right)?;

        if object.borrow().kind() != NodeKind::Object {
            // element assignment through lists narrows nothing
            return Ok(value);
        }

        let prop_name = {
            let a = accessor.borrow();
            match &a.payload {
                Payload::Id { name, .. } => Some(name.clone()),
                _ => None,
            }
        };
        let Some(prop_name) = prop_name else {
            return Ok(value);
        };

        let declared = match &object.borrow().payload {
            Payload::Object { properties, .. } => properties.get(&prop_name).map(|p| p.value.clone()),
            _ => None,
        };
        if let Some(declared) = &declared {
            let declared_kind = declared.borrow().kind();
            let value_is_func = value.borrow().kind() == NodeKind::Function;
            if (declared_kind == NodeKind::Function || declared_kind == NodeKind::FuncList) && value_is_func {
                // overload growth is fine
            } else {
                let outcome = match_types(self, declared, &value, true)?;
                if !outcome.ok {
                    return Err(self.error(
                        ErrorKind::TypeError,
                        format!(
                            "Cannot assign value of type '{}' to object property of type '{}'",
                            type_repr(&value),
                            repr(declared)
                        ),
                    ));
                }
            }
        }

        clear_scalar_literal(&value);
        if let Payload::Object { properties, .. } = &mut object.borrow_mut().payload {
            properties.insert(prop_name, Property::required(value.clone()));
        }
        Ok(value)
    }

    // -- control flow -- //

    fn check_if_statement(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (cond, body) = {
            let n = node.borrow();
            let Payload::IfStatement { cond, body } = &n.payload else {
                unreachable!()
            };
            (cond.clone(), body.clone())
        };

        let saved = self.scope.clone();
        self.scope = saved.child();

        let result = (|| {
            let value = self.check_node(&cond)?;
            let kind = value.borrow().kind();
            if !matches!(kind, NodeKind::Bool | NodeKind::Any) {
                return Err(self.error(ErrorKind::TypeError, "If statement expects a boolean conditional"));
            }
            // a guard this specialization can never satisfy makes the body
            // dead code; skip it rather than checking the impossible
            if infer::apply_narrowing(self, &cond, false)? == Some(false) {
                return Ok(self.stamp(make_empty(false)));
            }
            let items = match &body.borrow().payload {
                Payload::Block(items) => items.clone(),
                _ => vec![body.clone()],
            };
            self.check_nodes(&items)
        })();

        self.scope = saved;
        result
    }

    fn check_if_block(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let cases = {
            let n = node.borrow();
            let Payload::IfBlock { cases } = &n.payload else { unreachable!() };
            cases.clone()
        };

        let saved = self.scope.clone();
        self.scope = saved.child();
        let result = (|| {
            let mut results = Vec::new();
            for case in &cases {
                let pair = {
                    let c = case.borrow();
                    if c.op_kind() == Some(OpKind::Colon) {
                        Some((c.left.clone(), c.right.clone()))
                    } else {
                        None
                    }
                };
                let outcome = match pair {
                    Some((Some(cond), Some(body))) => {
                        if cond.borrow().id_name() != Some("else") {
                            let value = self.check_node(&cond)?;
                            let kind = value.borrow().kind();
                            if !matches!(kind, NodeKind::Bool | NodeKind::Any) {
                                return Err(self.error(
                                    ErrorKind::TypeError,
                                    "If block case expects a boolean conditional",
                                ));
                            }
                        }
                        self.check_case_body(&body)?
                    }
                    _ => self.check_case_body(case)?,
                };
                results.push(outcome);
                self.scope.clear_local();
            }
            sort_and_unique(self, &mut results)?;
            match results.len() {
                0 => Ok(self.stamp(make_empty(false))),
                1 => Ok(results.pop().expect("one result")),
                _ => Ok(self.stamp(make_pipe_list(results))),
            }
        })();
        self.scope = saved;
        result
    }

    pub(crate) fn check_case_body(&mut self, body: &NodeRef) -> RunResult<NodeRef> {
        let items = match &body.borrow().payload {
            Payload::Block(items) => Some(items.clone()),
            _ => None,
        };
        match items {
            Some(items) => self.check_nodes(&items),
            None => self.check_node(body),
        }
    }

    fn check_match_block(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        infer::check_match(self, node)
    }

    fn check_while_loop(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (cond, body) = {
            let n = node.borrow();
            let Payload::WhileLoop { cond, body } = &n.payload else {
                unreachable!()
            };
            (cond.clone(), body.clone())
        };
        let value = self.check_node(&cond)?;
        let kind = value.borrow().kind();
        if !matches!(kind, NodeKind::Bool | NodeKind::Any) {
            return Err(self.error(ErrorKind::TypeError, "While loop expects a boolean conditional"));
        }
        let items = match &body.borrow().payload {
            Payload::Block(items) => items.clone(),
            _ => vec![body.clone()],
        };
        let saved = self.scope.clone();
        self.scope = saved.child();
        let result = self.check_nodes(&items);
        self.scope = saved;
        let value = result?;
        if value.borrow().kind() == NodeKind::Return {
            return Ok(value);
        }
        Ok(self.stamp(make_empty(false)))
    }

    fn check_for_loop(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (init, body) = {
            let n = node.borrow();
            let Payload::ForLoop { init, body } = &n.payload else { unreachable!() };
            (init.clone(), body.clone())
        };
        let init_items = match &init.borrow().payload {
            Payload::List(items) => items.clone(),
            _ => unreachable!(),
        };
        let iter = self.check_node(&init_items[0])?;
        let iter_kind = iter.borrow().kind();
        if !matches!(iter_kind, NodeKind::List | NodeKind::Range | NodeKind::Any) {
            return Err(self.error(
                ErrorKind::TypeError,
                "For loop initialiser expects iterator of type list or range",
            ));
        }

        let element_type = match iter_kind {
            NodeKind::List => match &iter.borrow().payload {
                Payload::List(items) => items.first().cloned().unwrap_or_else(|| make_any().into_ref()),
                _ => make_any().into_ref(),
            },
            NodeKind::Range => make_int(0, false).into_ref(),
            _ => make_any().into_ref(),
        };

        let saved = self.scope.clone();
        self.scope = saved.child();
        if let Some(index) = init_items.get(1).and_then(|n| n.borrow().id_name().map(str::to_owned)) {
            self.scope.insert(index, make_int(0, false).into_ref());
        }
        if let Some(elem) = init_items.get(2).and_then(|n| n.borrow().id_name().map(str::to_owned)) {
            self.scope.insert(elem, element_type);
        }
        let items = match &body.borrow().payload {
            Payload::Block(items) => items.clone(),
            _ => vec![body.clone()],
        };
        let result = self.check_nodes(&items);
        self.scope = saved;
        let value = result?;
        if value.borrow().kind() == NodeKind::Return {
            return Ok(value);
        }
        Ok(self.stamp(make_empty(false)))
    }

    // -- injection -- //

    fn check_inject(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left_node, right_node) = operand_pair(node);
        let left = self.check_node(&left_node)?;

        let right_builtin = {
            let r = right_node.borrow();
            match &r.payload {
                Payload::Id { name, .. } => Builtin::from_name(name).map(|b| (b, Vec::new())),
                Payload::FuncCall { name, args, .. } => Builtin::from_name(name).map(|b| (b, args.clone())),
                _ => None,
            }
        };
        if let Some((builtin, mut args)) = right_builtin {
            args.extend(injected(&left));
            return self.check_builtin(builtin, &args);
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
            full_args.extend(injected(&left));
            return self.check_function_call(&func, &full_args);
        }

        let right = self.check_node(&right_node)?;
        let right_kind = right.borrow().kind();

        if right_kind == NodeKind::PartialOp {
            let filled = shallow_clone(&right);
            {
                let mut f = filled.borrow_mut();
                let l_empty = f.left.as_ref().is_some_and(|n| n.borrow().kind() == NodeKind::Empty);
                let r_empty = f.right.as_ref().is_some_and(|n| n.borrow().kind() == NodeKind::Empty);
                if l_empty {
                    f.left = Some(left.clone());
                } else if r_empty {
                    f.right = Some(left.clone());
                }
                let complete = !f.left.as_ref().is_some_and(|n| n.borrow().kind() == NodeKind::Empty)
                    && !f.right.as_ref().is_some_and(|n| n.borrow().kind() == NodeKind::Empty);
                if complete {
                    let data = match &f.payload {
                        Payload::PartialOp(data) => Some(data.clone()),
                        _ => None,
                    };
                    if let Some(data) = data {
                        f.payload = Payload::Op(data);
                    }
                }
            }
            return self.check_node(&filled);
        }

        if matches!(right_kind, NodeKind::Function | NodeKind::FuncList) {
            let args = injected(&left);
            return self.check_function_call(&right, &args);
        }
        if right_kind == NodeKind::Any {
            return Ok(self.stamp(make_any()));
        }

        Err(self.error(
            ErrorKind::TypeError,
            format!("Cannot perform operation '>>' on '{}' and '{}'", repr(&left), repr(&right)),
        ))
    }
}

fn operand_pair(node: &NodeRef) -> (NodeRef, NodeRef) {
    let n = node.borrow();
    (
        n.left.clone().unwrap_or_else(|| make_empty(true).into_ref()),
        n.right.clone().unwrap_or_else(|| make_empty(true).into_ref()),
    )
}

fn injected(left: &NodeRef) -> Vec<NodeRef> {
    match &left.borrow().payload {
        Payload::CommaList(items) => items.clone(),
        _ => vec![left.clone()],
    }
}

/// Scalars lose their literal payloads when they become types.
pub(crate) fn clear_scalar_literal(node: &NodeRef) {
    let keep = matches!(
        node.borrow().kind(),
        NodeKind::List | NodeKind::Object | NodeKind::Function | NodeKind::PipeList | NodeKind::FuncList
    );
    if !keep {
        node.borrow_mut().meta.is_literal = false;
    }
}

fn set_param_annotation(param: &NodeRef, annotation: NodeRef) {
    let target = {
        let p = param.borrow();
        match p.op_kind() {
            Some(OpKind::Equal) => p.left.clone(),
            Some(OpKind::TripleDot) => p.right.clone(),
            _ => None,
        }
    };
    let id = target.unwrap_or_else(|| param.clone());
    if let Payload::Id { annotation: slot, .. } = &mut id.borrow_mut().payload {
        *slot = Some(annotation);
    }
}

/// Clones an overload-set entry so per-call-site parameter specialization
/// never leaks back into the set.
pub(crate) fn clone_func(func: &NodeRef) -> NodeRef {
    if !func.borrow().meta.is_literal {
        return func.clone();
    }
    let data = {
        let n = func.borrow();
        let Payload::Function(f) = &n.payload else {
            return func.clone();
        };
        f.clone()
    };

    let params = data
        .params
        .iter()
        .map(|param| {
            let copy = shallow_clone(param);
            let mut c = copy.borrow_mut();
            if let Some(left) = &c.left {
                c.left = Some(shallow_clone(left));
            }
            if let Some(right) = &c.right {
                c.right = Some(shallow_clone(right));
            }
            drop(c);
            copy
        })
        .collect();

    let cloned = FunctionData {
        name: data.name,
        params,
        args: data.args.iter().map(|slot| slot.as_ref().map(shallow_clone)).collect(),
        body: shallow_clone(&data.body),
        return_type: data.return_type.as_ref().map(shallow_clone),
        closure: data.closure,
        default_indices: data.default_indices,
        is_type: data.is_type,
    };
    let result = shallow_clone(func);
    result.borrow_mut().payload = Payload::Function(cloned);
    result
}

impl Walker for Typechecker {
    fn eval(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        self.check_node(node)
    }

    fn eval_with_bindings(&mut self, node: &NodeRef, bindings: &AHashMap<String, NodeRef>) -> RunResult<NodeRef> {
        let saved = self.scope.clone();
        self.scope = saved.child();
        self.scope.extend(bindings);
        let result = self.check_node(node);
        self.scope = saved;
        result
    }

    fn call(&mut self, func: &NodeRef, args: Vec<NodeRef>) -> RunResult<NodeRef> {
        self.check_function_call(func, &args)
    }

    fn bind(&mut self, name: &str, value: NodeRef) {
        self.scope.insert(name.to_owned(), value);
    }

    fn unbind(&mut self, name: &str) {
        self.scope.remove(name);
    }

    fn err(&self, kind: ErrorKind, message: String) -> RunError {
        self.error(kind, message)
    }

    fn note_position(&mut self, node: &NodeRef) {
        let n = node.borrow();
        if n.line != 0 {
            self.line = n.line;
            self.column = n.column;
        }
    }

    fn checking(&self) -> bool {
        true
    }
}
