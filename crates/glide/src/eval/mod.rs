mod host;
mod members;
mod ops;

use std::rc::Rc;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    builtins::Builtin,
    error::{ErrorKind, GlideError, RunError, RunResult},
    io::PrintWriter,
    node::{
        FunctionData, Node, NodeKind, NodeRef, OpKind, Payload, Property, make_any, make_empty, make_func_list,
        make_int, make_list, make_object, param_is_variadic, param_name, repr, shallow_clone,
    },
    run::Session,
    scope::Scope,
    walker::{
        Walker, get_explicit_type, match_function, match_pattern, match_types, pattern_binding_names,
        unwrap_singleton,
    },
};

/// The concrete interpreter: walks a parsed AST producing values.
///
/// One evaluator instance walks an entire file. Scopes are pushed for
/// blocks and loop bodies and swapped wholesale for function calls (a call
/// sees built-ins, the callee's closure and its parameters, not the
/// caller's locals). `out` receives everything `print` writes.
pub(crate) struct Evaluator<'w> {
    pub(crate) file_chain: SmallVec<[String; 4]>,
    pub(crate) scope: Scope,
    pub(crate) line: u32,
    pub(crate) column: u32,
    pub(crate) session: Rc<Session>,
    pub(crate) out: &'w mut dyn PrintWriter,
}

/// A call-site argument after evaluation.
pub(crate) enum CallArg {
    Positional(NodeRef),
    Keyword(String, NodeRef),
}

impl<'w> Evaluator<'w> {
    pub fn new(file_name: &str, scope: Scope, session: Rc<Session>, out: &'w mut dyn PrintWriter) -> Self {
        Self {
            file_chain: smallvec::smallvec![file_name.to_owned()],
            scope,
            line: 1,
            column: 1,
            session,
            out,
        }
    }

    pub(crate) fn error(&self, kind: ErrorKind, message: impl Into<String>) -> RunError {
        GlideError::new(kind, self.file_chain.clone(), self.line, self.column, message.into()).into()
    }

    fn stamp(&self, node: Node) -> NodeRef {
        node.at(self.line, self.column).into_ref()
    }

    /// Evaluates a sequence of statements, short-circuiting on control
    /// nodes. Statement separators are skipped.
    pub(crate) fn eval_nodes(&mut self, nodes: &[NodeRef]) -> RunResult<NodeRef> {
        let mut result = self.stamp(make_empty(true));
        for node in nodes {
            if node.borrow().is_op(OpKind::Semicolon) {
                continue;
            }
            result = self.eval_node(node)?;
            if matches!(
                result.borrow().kind(),
                NodeKind::Return | NodeKind::Break | NodeKind::Continue
            ) {
                return Ok(result);
            }
        }
        Ok(result)
    }

    /// Evaluates a whole file's statements for their effects.
    pub(crate) fn evaluate(&mut self, nodes: &[NodeRef]) -> RunResult<()> {
        for node in nodes {
            if node.borrow().is_op(OpKind::Semicolon) {
                continue;
            }
            {
                let n = node.borrow();
                self.line = n.line;
                self.column = n.column;
            }
            self.eval_node(node)?;
        }
        Ok(())
    }

    pub(crate) fn eval_node(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        {
            let n = node.borrow();
            if n.line != 0 {
                self.line = n.line;
                self.column = n.column;
            }
        }

        let kind = node.borrow().kind();
        match kind {
            NodeKind::Int | NodeKind::Float | NodeKind::Bool | NodeKind::String | NodeKind::Empty | NodeKind::Any => {
                Ok(shallow_clone(node))
            }
            NodeKind::Object => self.eval_object_literal(node),
            NodeKind::Block => self.eval_block(node),
            NodeKind::List => self.eval_list_literal(node),
            NodeKind::CommaList => self.eval_comma_list(node),
            NodeKind::PipeList => self.eval_pipe_list(node),
            NodeKind::Id => self.eval_identifier(node),
            NodeKind::Copy => {
                let target = node.borrow().right.clone();
                match target {
                    Some(target) => {
                        let value = self.eval_node(&target)?;
                        Ok(deep_copy(&value))
                    }
                    None => Ok(shallow_clone(node)),
                }
            }
            NodeKind::Op => self.eval_op(node),
            NodeKind::PartialOp => Ok(shallow_clone(node)),
            NodeKind::Function => self.eval_function_literal(node),
            NodeKind::FuncCall => self.eval_call_node(node),
            NodeKind::IfStatement => self.eval_if_statement(node),
            NodeKind::IfBlock => self.eval_if_block(node),
            NodeKind::MatchBlock => self.eval_match_block(node),
            NodeKind::WhileLoop => self.eval_while_loop(node),
            NodeKind::ForLoop => self.eval_for_loop(node),
            NodeKind::Keyword => self.eval_keyword(node),
            NodeKind::Range | NodeKind::TypeMarker => Ok(shallow_clone(node)),
            _ => Ok(node.clone()),
        }
    }

    fn eval_op(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let op = node.borrow().op_kind().expect("op payload");
        match op {
            OpKind::Inject => self.eval_inject(node),
            OpKind::DoubleDot => self.eval_range(node),
            OpKind::Plus => self.eval_add(node),
            OpKind::Minus => self.eval_sub(node),
            OpKind::Star => self.eval_mul(node),
            OpKind::Slash => self.eval_div(node),
            OpKind::Percent => self.eval_mod(node),
            OpKind::Pos | OpKind::Neg => self.eval_sign(node),
            OpKind::Not => self.eval_not(node),
            OpKind::Lt | OpKind::Gt | OpKind::LtEq | OpKind::GtEq | OpKind::EqEq | OpKind::NotEq => {
                self.eval_comparison(node, op)
            }
            OpKind::And | OpKind::Or => self.eval_logical(node, op),
            OpKind::Dot => self.eval_dot(node),
            OpKind::Equal => self.eval_assignment(node),
            OpKind::PlusEq | OpKind::MinusEq => self.eval_compound_assignment(node, op),
            _ => Ok(node.clone()),
        }
    }

    // -- literals and names -- //

    fn eval_list_literal(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let items = match &node.borrow().payload {
            Payload::List(items) => items.clone(),
            _ => unreachable!(),
        };
        let mut evaluated = Vec::with_capacity(items.len());
        for item in &items {
            evaluated.push(self.eval_node(item)?);
        }
        let result = shallow_clone(node);
        result.borrow_mut().payload = Payload::List(evaluated);
        Ok(result)
    }

    fn eval_comma_list(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let items = match &node.borrow().payload {
            Payload::CommaList(items) => items.clone(),
            _ => unreachable!(),
        };
        // A one-element tuple is just its element.
        if items.len() == 1 {
            return self.eval_node(&items[0]);
        }
        let mut evaluated = Vec::with_capacity(items.len());
        for item in &items {
            evaluated.push(self.eval_node(item)?);
        }
        let result = shallow_clone(node);
        result.borrow_mut().payload = Payload::CommaList(evaluated);
        Ok(result)
    }

    fn eval_pipe_list(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let items = match &node.borrow().payload {
            Payload::PipeList(items) => items.clone(),
            _ => unreachable!(),
        };
        let mut evaluated = Vec::with_capacity(items.len());
        for item in &items {
            evaluated.push(self.eval_node(item)?);
        }
        let result = shallow_clone(node);
        result.borrow_mut().payload = Payload::PipeList(evaluated);
        Ok(result)
    }

    fn eval_identifier(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let name = node.borrow().id_name().map(str::to_owned).expect("identifier");
        if let Some(found) = self.scope.get(&name) {
            return Ok(unwrap_singleton(found));
        }

        // An undefined identifier annotated with the `type` marker declares
        // a fresh named object type.
        let annotation = match &node.borrow().payload {
            Payload::Id { annotation, .. } => annotation.clone(),
            _ => None,
        };
        if let Some(annotation) = annotation {
            let explicit = self.eval_node(&annotation)?;
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

        Err(self.error(ErrorKind::RuntimeError, format!("Undefined variable '{name}'")))
    }

    fn eval_object_literal(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let result = shallow_clone(node);
        if !result.borrow().meta.is_literal {
            return Ok(result);
        }

        let properties = match &result.borrow().payload {
            Payload::Object { properties, .. } => properties.clone(),
            _ => unreachable!(),
        };

        let mut evaluated = indexmap::IndexMap::with_capacity(properties.len());
        for (key, prop) in &properties {
            // Methods close over the object they live on.
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
            let value = self.eval_node(&prop.value)?;
            evaluated.insert(
                key.clone(),
                Property {
                    required: prop.required,
                    value,
                },
            );
        }

        if let Payload::Object { properties, .. } = &mut result.borrow_mut().payload {
            *properties = evaluated;
        }
        Ok(result)
    }

    fn eval_block(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let items = match &node.borrow().payload {
            Payload::Block(items) => items.clone(),
            _ => unreachable!(),
        };
        // `{}` is the empty object, not an empty block.
        if items.is_empty() {
            return Ok(self.stamp(make_object(true)));
        }
        let saved = self.scope.clone();
        self.scope = saved.child();
        let result = self.eval_nodes(&items);
        self.scope = saved;
        result
    }

    /// Evaluating a function node captures its closure: the enclosing
    /// scope's innermost table plus a self-reference under the function's
    /// own name (upgraded alongside an existing overload set).
    fn eval_function_literal(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        // Definition-time work on the shared node: evaluate default
        // arguments and parameter annotations once.
        let (params, args) = {
            let n = node.borrow();
            let Payload::Function(f) = &n.payload else { unreachable!() };
            (f.params.clone(), f.args.clone())
        };

        let mut evaluated_args = Vec::with_capacity(args.len());
        for slot in &args {
            match slot {
                Some(default) => evaluated_args.push(Some(self.eval_node(default)?)),
                None => evaluated_args.push(None),
            }
        }

        let mut marks_type = false;
        for param in &params {
            if param_name(param).as_deref() == Some("__type") {
                marks_type = true;
            }
        }

        let snapshot = self.scope.snapshot();
        let name = {
            let n = node.borrow();
            let Payload::Function(f) = &n.payload else { unreachable!() };
            f.name.clone()
        };

        {
            let mut n = node.borrow_mut();
            let Payload::Function(f) = &mut n.payload else { unreachable!() };
            f.args = evaluated_args;
            if marks_type {
                f.is_type = true;
            }
            for (key, value) in snapshot {
                f.closure.insert(key, value);
            }
        }

        // Self-reference for recursion; joins an existing overload set.
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

        Ok(node.clone())
    }

    // -- calls -- //

    fn eval_call_node(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (name, caller, args) = {
            let n = node.borrow();
            let Payload::FuncCall { name, caller, args } = &n.payload else {
                unreachable!()
            };
            (name.clone(), caller.clone(), args.clone())
        };

        if let Some(builtin) = Builtin::from_name(&name) {
            return self.call_builtin(builtin, &args);
        }

        let func = match self.scope.get(&name) {
            Some(found) => found,
            None => {
                let fallback = caller.as_ref().filter(|c| {
                    let c = c.borrow();
                    matches!(c.payload, Payload::Function(_)) || c.op_kind() == Some(OpKind::Dot)
                });
                match fallback {
                    Some(caller) => self.eval_node(caller)?,
                    None => {
                        return Err(self.error(ErrorKind::RuntimeError, format!("Function '{name}' is undefined")));
                    }
                }
            }
        };

        self.eval_function_call(&func, &args)
    }

    pub(crate) fn eval_call_args(&mut self, raw_args: &[NodeRef]) -> RunResult<Vec<CallArg>> {
        let mut out = Vec::with_capacity(raw_args.len());
        for arg in raw_args {
            let keyword = {
                let a = arg.borrow();
                if a.op_kind() == Some(OpKind::Colon) {
                    let name = a
                        .left
                        .as_ref()
                        .and_then(|l| l.borrow().id_name().map(str::to_owned));
                    name.map(|n| (n, a.right.clone()))
                } else {
                    None
                }
            };
            match keyword {
                Some((name, Some(value))) => {
                    let value = self.eval_node(&value)?;
                    out.push(CallArg::Keyword(name, value));
                }
                _ => {
                    let value = self.eval_node(arg)?;
                    out.push(CallArg::Positional(value));
                }
            }
        }
        Ok(out)
    }

    /// Calls a function value. `raw_args` are the unevaluated
    /// call-site argument nodes (already-evaluated values also work, since
    /// values evaluate to themselves).
    pub(crate) fn eval_function_call(&mut self, function: &NodeRef, raw_args: &[NodeRef]) -> RunResult<NodeRef> {
        let func_kind = function.borrow().kind();
        if !matches!(func_kind, NodeKind::Function | NodeKind::FuncList | NodeKind::PipeList) {
            return Err(self.error(
                ErrorKind::RuntimeError,
                "Malformed function call - variable is not a function".to_owned(),
            ));
        }

        let args = self.eval_call_args(raw_args)?;
        let positional: Vec<NodeRef> = args
            .iter()
            .filter_map(|a| match a {
                CallArg::Positional(v) => Some(v.clone()),
                CallArg::Keyword(..) => None,
            })
            .collect();

        let func = if func_kind == NodeKind::Function {
            shallow_clone(function)
        } else {
            match_function(self, function, &positional)?
        };

        self.invoke(&func, &args)
    }

    fn invoke(&mut self, func: &NodeRef, args: &[CallArg]) -> RunResult<NodeRef> {
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

        // -- argument binding: positional, variadic, defaults, keywords -- //

        let mut position = 0usize;
        let mut arg_iter = args.iter();
        while let Some(arg) = arg_iter.next() {
            match arg {
                CallArg::Keyword(key, value) => {
                    let index = params.iter().position(|p| param_name(p).as_deref() == Some(key));
                    match index {
                        Some(index) => slots[index] = Some(value.clone()),
                        None => {
                            return Err(self.error(
                                ErrorKind::RuntimeError,
                                format!("Parameter '{key}' does not exist on function '{name}'"),
                            ));
                        }
                    }
                }
                CallArg::Positional(value) => {
                    if position >= params.len() {
                        return Err(self.error(
                            ErrorKind::RuntimeError,
                            format!(
                                "Function '{name}' expects {} arguments, but {} were provided",
                                slots.len(),
                                args.len()
                            ),
                        ));
                    }
                    if param_is_variadic(&params[position]) {
                        // The variadic slot swallows this and every
                        // remaining positional argument.
                        let mut rest = vec![value.clone()];
                        for later in arg_iter.by_ref() {
                            if let CallArg::Positional(v) = later {
                                rest.push(v.clone());
                            }
                        }
                        slots[position] = Some(self.stamp(make_list(rest, true)));
                        break;
                    }
                    // Skip forward over slots already holding a non-default
                    // value; a default slot may be overridden positionally.
                    while position < slots.len()
                        && slots[position].is_some()
                        && !default_indices.contains(&position)
                    {
                        position += 1;
                    }
                    if position >= slots.len() {
                        return Err(self.error(
                            ErrorKind::RuntimeError,
                            format!(
                                "Function '{name}' expects {} arguments, but {} were provided",
                                slots.len(),
                                args.len()
                            ),
                        ));
                    }
                    slots[position] = Some(value.clone());
                    position += 1;
                }
            }
        }

        // Unfilled holes mean partial application: hand back the function.
        if slots.iter().any(Option::is_none) {
            let partial = shallow_clone(func);
            if let Payload::Function(f) = &mut partial.borrow_mut().payload {
                f.args = slots;
            }
            return Ok(partial);
        }

        // -- call environment -- //

        let call_scope = Scope::new();
        for builtin_name in self.session.builtins_names.borrow().iter() {
            if let Some(value) = self.scope.get(builtin_name) {
                call_scope.insert(builtin_name.clone(), value);
            }
        }
        for (key, value) in &closure {
            // Larger overload sets beat smaller ones for the same name.
            if value.borrow().kind() == NodeKind::FuncList {
                let keep_existing = call_scope.get(key).is_some_and(|existing| {
                    let old_len = match &existing.borrow().payload {
                        Payload::FuncList(items) => items.len(),
                        _ => 0,
                    };
                    let new_len = match &value.borrow().payload {
                        Payload::FuncList(items) => items.len(),
                        _ => 0,
                    };
                    old_len >= new_len
                });
                if keep_existing {
                    continue;
                }
            }
            call_scope.insert(key.clone(), value.clone());
        }

        // Bind parameters and type-check every bound argument.
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
            if let Payload::Function(f) = &mut param_type.borrow_mut().payload {
                f.is_type = true;
            }

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
        }

        // -- execute -- //

        if self.session.enter_call().is_err() {
            return Err(self.error(
                ErrorKind::RuntimeError,
                format!("Maximum call depth of {} exceeded", crate::run::MAX_CALL_DEPTH),
            ));
        }
        let saved_scope = std::mem::replace(&mut self.scope, call_scope);
        self.file_chain.push(name);

        let result = self.run_function_body(&body, return_type.as_ref());

        self.file_chain.pop();
        self.scope = saved_scope;
        self.session.leave_call();
        result
    }

    fn run_function_body(&mut self, body: &NodeRef, return_type: Option<&NodeRef>) -> RunResult<NodeRef> {
        let body_items = match &body.borrow().payload {
            Payload::Block(items) => Some(items.clone()),
            _ => None,
        };

        let result = match body_items {
            Some(items) => {
                let mut value = self.stamp(make_empty(true));
                for item in &items {
                    if item.borrow().is_op(OpKind::Semicolon) {
                        continue;
                    }
                    value = self.eval_node(item)?;
                    if value.borrow().kind() == NodeKind::Return {
                        let inner = value.borrow().right.clone().unwrap_or_else(|| make_empty(true).into_ref());
                        value = inner;
                        break;
                    }
                }
                value
            }
            None => self.eval_node(body)?,
        };

        if let Some(ret) = return_type
            && ret.borrow().kind() != NodeKind::Empty
        {
            result.borrow_mut().meta.allowed_type = Some(ret.clone());
        }
        Ok(result)
    }

    // -- control flow -- //

    fn eval_if_statement(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (cond, body) = {
            let n = node.borrow();
            let Payload::IfStatement { cond, body } = &n.payload else {
                unreachable!()
            };
            (cond.clone(), body.clone())
        };
        let cond = self.eval_node(&cond)?;
        let truth = cond
            .borrow()
            .as_bool()
            .ok_or_else(|| self.error(ErrorKind::RuntimeError, "If statement expects a boolean conditional"))?;
        if !truth {
            return Ok(self.stamp(make_empty(true)));
        }
        let items = match &body.borrow().payload {
            Payload::Block(items) => items.clone(),
            _ => vec![body.clone()],
        };
        let saved = self.scope.clone();
        self.scope = saved.child();
        let result = self.eval_nodes(&items);
        self.scope = saved;
        result
    }

    fn eval_if_block(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let cases = {
            let n = node.borrow();
            let Payload::IfBlock { cases } = &n.payload else { unreachable!() };
            cases.clone()
        };

        let saved = self.scope.clone();
        self.scope = saved.child();
        let result = self.run_if_block_cases(&cases);
        self.scope = saved;
        result
    }

    fn run_if_block_cases(&mut self, cases: &[NodeRef]) -> RunResult<NodeRef> {
        for case in cases {
            let pair = {
                let c = case.borrow();
                if c.op_kind() == Some(OpKind::Colon) {
                    Some((c.left.clone(), c.right.clone()))
                } else {
                    None
                }
            };

            let Some((Some(cond), Some(body))) = pair else {
                // A trailing bare expression is the else arm.
                return self.eval_case_body(case);
            };

            if cond.borrow().id_name() == Some("else") {
                return self.eval_case_body(&body);
            }

            let value = self.eval_node(&cond)?;
            let truth = value
                .borrow()
                .as_bool()
                .ok_or_else(|| self.error(ErrorKind::RuntimeError, "If block case expects a boolean conditional"))?;
            if truth {
                return self.eval_case_body(&body);
            }
            self.scope.clear_local();
        }
        Ok(self.stamp(make_empty(true)))
    }

    fn eval_case_body(&mut self, body: &NodeRef) -> RunResult<NodeRef> {
        let items = match &body.borrow().payload {
            Payload::Block(items) => Some(items.clone()),
            _ => None,
        };
        match items {
            Some(items) => self.eval_nodes(&items),
            None => self.eval_node(body),
        }
    }

    fn eval_match_block(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (value_node, cases) = {
            let n = node.borrow();
            let Payload::MatchBlock { value, cases } = &n.payload else {
                unreachable!()
            };
            (value.clone(), cases.clone())
        };
        let value = self.eval_node(&value_node)?;

        for case in &cases {
            let pair = {
                let c = case.borrow();
                if c.op_kind() == Some(OpKind::Colon) {
                    Some((c.left.clone(), c.right.clone()))
                } else {
                    None
                }
            };
            let Some((Some(pattern), Some(body))) = pair else {
                return self.eval_case_body(case);
            };

            // `_` and `else` arms match unconditionally.
            let wildcard = matches!(pattern.borrow().id_name(), Some("_" | "else"));
            let resolved = if wildcard {
                None
            } else if pattern.borrow().id_name().is_some() {
                Some(self.eval_node(&pattern)?)
            } else {
                Some(pattern.clone())
            };

            let matched = match &resolved {
                None => true,
                Some(p) => match_pattern(self, p, &value)?,
            };
            if matched {
                let result = self.eval_case_body(&body)?;
                if let Some(p) = &resolved {
                    for bound in pattern_binding_names(p) {
                        self.scope.remove(&bound);
                    }
                }
                return Ok(result);
            }
        }

        {
            let n = node.borrow();
            self.line = n.line;
            self.column = n.column;
        }
        Err(self.error(
            ErrorKind::RuntimeError,
            format!("Missing match case for type '{}'", repr(&value)),
        ))
    }

    fn eval_while_loop(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (cond, body) = {
            let n = node.borrow();
            let Payload::WhileLoop { cond, body } = &n.payload else {
                unreachable!()
            };
            (cond.clone(), body.clone())
        };
        let first = self.eval_node(&cond)?;
        if first.borrow().as_bool().is_none() {
            return Err(self.error(ErrorKind::RuntimeError, "While loop expects a boolean conditional"));
        }
        let items = match &body.borrow().payload {
            Payload::Block(items) => items.clone(),
            _ => vec![body.clone()],
        };

        let saved = self.scope.clone();
        self.scope = saved.child();
        let result = loop {
            let check = self.eval_node(&cond);
            let truth = match check {
                Ok(v) => v.borrow().as_bool() == Some(true),
                Err(e) => {
                    self.scope = saved.clone();
                    return Err(e);
                }
            };
            if !truth {
                break Ok(self.stamp(make_empty(true)));
            }
            match self.eval_nodes(&items) {
                Ok(value) => match value.borrow().kind() {
                    NodeKind::Break => break Ok(self.stamp(make_empty(true))),
                    NodeKind::Continue => {}
                    NodeKind::Return => break Ok(value.clone()),
                    _ => {}
                },
                Err(e) => break Err(e),
            }
            self.scope.clear_local();
        };
        self.scope = saved;
        result
    }

    fn eval_for_loop(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (init, body) = {
            let n = node.borrow();
            let Payload::ForLoop { init, body } = &n.payload else { unreachable!() };
            (init.clone(), body.clone())
        };
        let init_items = match &init.borrow().payload {
            Payload::List(items) => items.clone(),
            _ => unreachable!(),
        };
        let iter = self.eval_node(&init_items[0])?;

        enum Iteration {
            Items(Vec<NodeRef>),
            Span(i64, i64),
        }
        let iteration = {
            let i = iter.borrow();
            match &i.payload {
                Payload::List(items) => Iteration::Items(items.clone()),
                Payload::Range { start, end } => Iteration::Span(*start, *end),
                _ => {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "For loop initialiser expects iterator of type list or range",
                    ));
                }
            }
        };

        let index_name = init_items.get(1).map(|n| {
            n.borrow()
                .id_name()
                .map(str::to_owned)
                .ok_or_else(|| self.error(ErrorKind::RuntimeError, "For loop initialiser expects index argument to be an identifier"))
        });
        let index_name = match index_name {
            Some(Ok(name)) => Some(name),
            Some(Err(e)) => return Err(e),
            None => None,
        };
        let elem_name = init_items.get(2).map(|n| {
            n.borrow()
                .id_name()
                .map(str::to_owned)
                .ok_or_else(|| self.error(ErrorKind::RuntimeError, "For loop initialiser expects element argument to be an identifier"))
        });
        let elem_name = match elem_name {
            Some(Ok(name)) => Some(name),
            Some(Err(e)) => return Err(e),
            None => None,
        };

        let items = match &body.borrow().payload {
            Payload::Block(items) => items.clone(),
            _ => vec![body.clone()],
        };

        let (begin, end) = match &iteration {
            Iteration::Items(items) => (0, items.len() as i64),
            Iteration::Span(start, end) => (*start, *end),
        };

        let saved = self.scope.clone();
        self.scope = saved.child();
        let mut outcome = Ok(());
        let mut returned = None;
        for i in begin..end {
            let index_node = self.stamp(make_int(i, true));
            if let Some(name) = &index_name {
                self.scope.insert(name.clone(), index_node.clone());
            }
            if let Some(name) = &elem_name {
                let element = match &iteration {
                    Iteration::Items(items) => items[i as usize].clone(),
                    Iteration::Span(..) => index_node.clone(),
                };
                self.scope.insert(name.clone(), element);
            }

            match self.eval_nodes(&items) {
                Ok(value) => match value.borrow().kind() {
                    NodeKind::Break => break,
                    NodeKind::Continue => {}
                    NodeKind::Return => {
                        returned = Some(value.clone());
                        break;
                    }
                    _ => {}
                },
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
            self.scope.clear_local();
        }
        self.scope = saved;
        outcome?;
        Ok(returned.unwrap_or_else(|| self.stamp(make_empty(true))))
    }

    fn eval_keyword(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
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
                    Some(v) => self.eval_node(&v)?,
                    None => self.stamp(make_empty(true)),
                };
                let ret = self.stamp(Node::new(Payload::Return));
                ret.borrow_mut().right = Some(value);
                Ok(ret)
            }
            other => Err(self.error(ErrorKind::RuntimeError, format!("Unexpected keyword '{other}'"))),
        }
    }

    // -- assignment -- //

    fn eval_compound_assignment(&mut self, node: &NodeRef, op: OpKind) -> RunResult<NodeRef> {
        let (left, right) = {
            let n = node.borrow();
            (n.left.clone().expect("operand"), n.right.clone().expect("operand"))
        };
        let op_node = self.stamp(Node::new(Payload::Op(crate::node::OpData::new(
            if op == OpKind::PlusEq { "+" } else { "-" },
            if op == OpKind::PlusEq { OpKind::Plus } else { OpKind::Minus },
        ))));
        {
            let mut o = op_node.borrow_mut();
            o.left = Some(left.clone());
            o.right = Some(right);
        }
        let sum = if op == OpKind::PlusEq {
            self.eval_add(&op_node)?
        } else {
            self.eval_sub(&op_node)?
        };
        let assign = self.stamp(Node::new(Payload::Op(crate::node::OpData::new("=", OpKind::Equal))));
        {
            let mut a = assign.borrow_mut();
            a.left = Some(left);
            a.right = Some(sum);
        }
        self.eval_assignment(&assign)
    }

    fn eval_assignment(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        let (left, right) = {
            let n = node.borrow();
            (n.left.clone().expect("target"), n.right.clone().expect("value"))
        };

        if left.borrow().id_name().is_some() {
            return self.assign_identifier(&left, &right);
        }
        if matches!(left.borrow().payload, Payload::List(_)) {
            return self.assign_computed_name(&left, &right);
        }
        if left.borrow().op_kind() == Some(OpKind::Dot) {
            return self.assign_member(&left, &right);
        }

        // Fallback: overwrite whatever node the target evaluates to.
        let target = self.eval_node(&left)?;
        let value = self.eval_node(&right)?;
        let content = value.borrow().clone();
        *target.borrow_mut() = content;
        Ok(target)
    }

    fn assign_identifier(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let (name, annotation) = {
            let l = left.borrow();
            let Payload::Id { name, annotation } = &l.payload else {
                unreachable!()
            };
            (name.clone(), annotation.clone())
        };
        let existing = self.scope.get(&name);
        let value = self.eval_node(right)?;

        let Some(var) = existing else {
            return self.bind_new_identifier(&name, annotation, &value);
        };

        // Re-annotation of an existing binding is forbidden.
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

        // Another function under the same name extends the overload set.
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
        {
            let mut v = val.borrow_mut();
            v.meta.allowed_type = Some(allowed);
            if let Payload::Function(f) = &mut v.payload {
                f.name.clone_from(&name);
            }
        }
        // Mutate in place so aliases observe the new value.
        let content = val.borrow().clone();
        *var.borrow_mut() = content;
        Ok(val)
    }

    fn bind_new_identifier(
        &mut self,
        name: &str,
        annotation: Option<NodeRef>,
        value: &NodeRef,
    ) -> RunResult<NodeRef> {
        let Some(annotation) = annotation else {
            let val = shallow_clone(value);
            if val.borrow().meta.allowed_type.is_none() {
                let inferred = self.get_type(&val)?;
                val.borrow_mut().meta.allowed_type = Some(inferred);
            }
            if matches!(val.borrow().payload, Payload::Function(_)) {
                if let Payload::Function(f) = &mut val.borrow_mut().payload {
                    f.name = name.to_owned();
                }
                let set = self.stamp(make_func_list(vec![val.clone()]));
                self.scope.insert(name.to_owned(), set);
                return Ok(val);
            }
            self.scope.insert(name.to_owned(), val.clone());
            return Ok(val);
        };

        if value.borrow().meta.allowed_type.is_none() {
            let inferred = self.get_type(value)?;
            value.borrow_mut().meta.allowed_type = Some(inferred);
        }

        let explicit = self.eval_node(&annotation)?;

        // `Name::type = value` declares a named type.
        if explicit.borrow().kind() == NodeKind::TypeMarker {
            let mut v = value.borrow_mut();
            v.meta.name = name.to_owned();
            match &mut v.payload {
                Payload::Object { is_type, .. } => *is_type = true,
                Payload::Function(f) => f.is_type = true,
                _ => {}
            }
        }
        if let Payload::Function(f) = &mut explicit.borrow_mut().payload {
            f.is_type = true;
        }

        if value.borrow().meta.name.is_empty() {
            let inherited = {
                let e = explicit.borrow();
                match &e.payload {
                    Payload::Function(f) => Some(f.name.clone()),
                    Payload::Object { .. } => Some(e.meta.name.clone()),
                    _ => None,
                }
            };
            if let Some(inherited) = inherited {
                value.borrow_mut().meta.name = inherited;
            }
        }

        let outcome = match_types(self, &explicit, value, true)?;
        if !outcome.ok {
            value.borrow_mut().meta.name.clear();
            return Err(self.error(
                ErrorKind::TypeError,
                format!(
                    "Cannot assign value of type '{}' to variable of type '{}'. {}",
                    repr(value),
                    repr(&explicit),
                    outcome.message
                ),
            ));
        }

        let val = shallow_clone(value);
        {
            let mut v = val.borrow_mut();
            v.meta.allowed_type = Some(explicit);
            if let Payload::Function(f) = &mut v.payload {
                f.name = name.to_owned();
            }
        }
        self.scope.insert(name.to_owned(), val.clone());
        Ok(val)
    }

    fn assign_computed_name(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let items = match &left.borrow().payload {
            Payload::List(items) => items.clone(),
            _ => unreachable!(),
        };
        if items.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Dynamic variable creation list expects 1 argument"));
        }
        let name = self.eval_node(&items[0])?;
        let name = name
            .borrow()
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| self.error(ErrorKind::RuntimeError, "Dynamic variable creation list expects 1 string argument"))?;
        let value = self.eval_node(right)?;
        self.scope.insert(name, shallow_clone(&value));
        Ok(value)
    }

    fn assign_member(&mut self, left: &NodeRef, right: &NodeRef) -> RunResult<NodeRef> {
        let (object_node, accessor) = {
            let l = left.borrow();
            (l.left.clone().expect("object"), l.right.clone().expect("accessor"))
        };
        let object = self.eval_node(&object_node)?;
        let value = self.eval_node(right)?;

        if object.borrow().kind() != NodeKind::Object {
            // Assignment through an element access mutates the shared node.
            let target = self.eval_node(left)?;
            let content = value.borrow().clone();
            *target.borrow_mut() = content;
            return Ok(target);
        }

        enum Key {
            Name(String),
            Computed(NodeRef),
        }
        let key = {
            let a = accessor.borrow();
            match &a.payload {
                Payload::Id { name, .. } => Key::Name(name.clone()),
                Payload::List(items) if !items.is_empty() => Key::Computed(items[0].clone()),
                Payload::List(_) => {
                    return Err(self.error(ErrorKind::RuntimeError, "Cannot assign an empty property name"));
                }
                _ => {
                    return Err(self.error(ErrorKind::RuntimeError, "Property name must be of type string"));
                }
            }
        };
        let prop_name = match key {
            Key::Name(name) => name,
            Key::Computed(expr) => {
                let key = self.eval_node(&expr)?;
                let resolved = {
                    let k = key.borrow();
                    match &k.payload {
                        Payload::Any => None,
                        Payload::Str(s) => Some(s.clone()),
                        _ => {
                            return Err(self.error(ErrorKind::RuntimeError, "Property name must be of type string"));
                        }
                    }
                };
                match resolved {
                    Some(name) => name,
                    None => return Ok(make_any().into_ref()),
                }
            }
        };

        let current = match &object.borrow().payload {
            Payload::Object { properties, .. } => properties.get(&prop_name).map(|p| p.value.clone()),
            _ => None,
        };

        if let Some(current) = &current {
            // Two functions on the same property become an overload set.
            let current_kind = current.borrow().kind();
            let value_is_func = value.borrow().kind() == NodeKind::Function;
            if current_kind == NodeKind::FuncList && value_is_func {
                if let Payload::Function(f) = &mut value.borrow_mut().payload {
                    f.name.clone_from(&prop_name);
                }
                if let Payload::FuncList(items) = &mut current.borrow_mut().payload {
                    items.push(value.clone());
                }
                return Ok(current.clone());
            }
            if current_kind == NodeKind::Function && value_is_func {
                if let Payload::Function(f) = &mut value.borrow_mut().payload {
                    f.name.clone_from(&prop_name);
                }
                let set = self.stamp(make_func_list(vec![current.clone(), value.clone()]));
                if let Payload::Object { properties, .. } = &mut object.borrow_mut().payload {
                    properties.insert(prop_name, Property::required(set.clone()));
                }
                return Ok(set);
            }

            // Enforce the recorded property type, if the object has one.
            let declared = {
                let o = object.borrow();
                o.meta.allowed_type.as_ref().and_then(|t| match &t.borrow().payload {
                    Payload::Object { properties, .. } => properties.get(&prop_name).map(|p| p.value.clone()),
                    _ => None,
                })
            };
            if let Some(declared) = declared {
                let outcome = match_types(self, &declared, &value, true)?;
                if !outcome.ok {
                    return Err(self.error(
                        ErrorKind::TypeError,
                        format!(
                            "Cannot assign value of type '{}' to object property of type '{}'",
                            crate::node::type_repr(&value),
                            repr(&declared)
                        ),
                    ));
                }
            }
        }

        if value.borrow().meta.allowed_type.is_none() {
            let recorded = {
                let o = object.borrow();
                o.meta.allowed_type.as_ref().and_then(|t| match &t.borrow().payload {
                    Payload::Object { properties, .. } => properties.get(&prop_name).map(|p| p.value.clone()),
                    _ => None,
                })
            };
            let inferred = match recorded {
                Some(t) => t,
                None => self.get_type(&value)?,
            };
            value.borrow_mut().meta.allowed_type = Some(inferred);
        }

        if let Payload::Object { properties, .. } = &mut object.borrow_mut().payload {
            properties.insert(prop_name.clone(), Property::required(value.clone()));
        }

        // Record the new property's shape on the object's type.
        let needs_type = object.borrow().meta.allowed_type.is_none();
        if needs_type {
            object.borrow_mut().meta.allowed_type = Some(make_object(false).into_ref());
        }
        let value_type = value.borrow().meta.allowed_type.clone();
        if let Some(object_type) = object.borrow().meta.allowed_type.clone()
            && let Payload::Object { properties, .. } = &mut object_type.borrow_mut().payload
            && let Some(value_type) = value_type
        {
            properties.insert(prop_name, Property::required(value_type));
        }

        Ok(value)
    }

    // -- shape extraction -- //

    /// The structural type of a value (what `shape` returns and what gets
    /// recorded as a binding's inferred `allowed_type`).
    pub(crate) fn get_type(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        crate::walker::shape_of(self, node)
    }
}

/// Recursive clone for the `#` copy operator: lists and objects are
/// duplicated element by element, everything else is a shallow copy.
pub(crate) fn deep_copy(node: &NodeRef) -> NodeRef {
    let copy = shallow_clone(node);
    let replacement = {
        let c = copy.borrow();
        match &c.payload {
            Payload::List(items) => Some(Payload::List(items.iter().map(deep_copy).collect())),
            Payload::Object { properties, is_type } => {
                let mut copied = indexmap::IndexMap::with_capacity(properties.len());
                for (key, prop) in properties {
                    copied.insert(
                        key.clone(),
                        Property {
                            required: prop.required,
                            value: deep_copy(&prop.value),
                        },
                    );
                }
                Some(Payload::Object {
                    properties: copied,
                    is_type: *is_type,
                })
            }
            _ => None,
        }
    };
    if let Some(payload) = replacement {
        copy.borrow_mut().payload = payload;
    }
    copy
}

impl Walker for Evaluator<'_> {
    fn eval(&mut self, node: &NodeRef) -> RunResult<NodeRef> {
        self.eval_node(node)
    }

    fn eval_with_bindings(&mut self, node: &NodeRef, bindings: &AHashMap<String, NodeRef>) -> RunResult<NodeRef> {
        let saved = self.scope.clone();
        self.scope = saved.child();
        self.scope.extend(bindings);
        let result = self.eval_node(node);
        self.scope = saved;
        result
    }

    fn call(&mut self, func: &NodeRef, args: Vec<NodeRef>) -> RunResult<NodeRef> {
        self.eval_function_call(func, &args)
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
        false
    }
}
