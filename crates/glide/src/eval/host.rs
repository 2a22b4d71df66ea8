use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    builtins::Builtin,
    error::{ErrorKind, RunError, RunResult},
    node::{NodeRef, Payload, make_empty, make_float, make_int, make_string, repr},
    run,
};

use super::Evaluator;

impl Evaluator<'_> {
    /// Dispatches a host built-in call. Arguments arrive unevaluated, the
    /// way the call site wrote them; most built-ins evaluate them, but
    /// `delete` needs the raw identifiers.
    pub(crate) fn call_builtin(&mut self, builtin: Builtin, args: &[NodeRef]) -> RunResult<NodeRef> {
        match builtin {
            Builtin::Exit => self.builtin_exit(args),
            Builtin::Error => self.builtin_error(args),
            Builtin::Range => self.builtin_range(args),
            Builtin::Print => self.builtin_print(args),
            Builtin::Delete => self.builtin_delete(args),
            Builtin::Time => self.builtin_time(args),
            Builtin::Import => self.builtin_import(args),
            Builtin::Read => self.builtin_read(args),
            Builtin::Write => self.builtin_write(args, false),
            Builtin::Append => self.builtin_write(args, true),
            Builtin::ToInt => self.builtin_to_int(args),
            Builtin::ToFloat => self.builtin_to_float(args),
            Builtin::ToString => self.builtin_to_string(args),
            Builtin::TypeOf => self.builtin_type(args),
            Builtin::Shape => self.builtin_shape(args),
        }
    }

    fn builtin_exit(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() > 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'exit' expects 0 or 1 arguments"));
        }
        let code = match args.first() {
            Some(arg) => {
                let value = self.eval_node(arg)?;
                let code = value.borrow().as_int();
                code.ok_or_else(|| {
                    self.error(ErrorKind::RuntimeError, "Built-in function 'exit' expects an integer argument")
                })?
            }
            None => 0,
        };
        Err(RunError::Exit(code as i32))
    }

    fn builtin_error(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 2 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'error' expects 2 arguments"));
        }
        let kind = self.eval_node(&args[0])?;
        let message = self.eval_node(&args[1])?;
        let (kind, message) = {
            let (k, m) = (kind.borrow(), message.borrow());
            match (k.as_str(), m.as_str()) {
                (Some(k), Some(m)) => (k.to_owned(), m.to_owned()),
                _ => {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'error' expects 2 string arguments",
                    ));
                }
            }
        };
        Err(self.error(ErrorKind::RuntimeError, format!("[{kind}] {message}")))
    }

    fn builtin_range(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 2 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'range' expects 2 arguments"));
        }
        let start = self.eval_node(&args[0])?;
        let end = self.eval_node(&args[1])?;
        let (Some(start), Some(end)) = (start.borrow().as_int(), end.borrow().as_int()) else {
            return Err(self.error(
                ErrorKind::RuntimeError,
                "Built-in function 'range' expects 2 integer arguments",
            ));
        };
        Ok(crate::node::Node::new(Payload::Range { start, end })
            .at(self.line, self.column)
            .into_ref())
    }

    fn builtin_print(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.is_empty() {
            return Err(self.error(
                ErrorKind::RuntimeError,
                "Built-in function 'print' expects at least one argument",
            ));
        }
        for arg in args {
            let value = self.eval_node(arg)?;
            self.out.write(&repr(&value));
        }
        Ok(make_empty(true).into_ref())
    }

    fn builtin_delete(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        for arg in args {
            let name = {
                let a = arg.borrow();
                match &a.payload {
                    Payload::Id { name, .. } => Some(name.clone()),
                    Payload::Str(s) => Some(s.clone()),
                    _ => None,
                }
            };
            let Some(name) = name else {
                return Err(self.error(
                    ErrorKind::RuntimeError,
                    "Built-in function 'delete' expects arguments to be either identifiers or strings",
                ));
            };
            self.scope.remove(&name);
        }
        Ok(make_empty(true).into_ref())
    }

    fn builtin_time(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if !args.is_empty() {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'time' expects 0 arguments"));
        }
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(make_int(millis, true).into_ref())
    }

    fn builtin_import(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'import' expects 1 argument"));
        }
        let path = self.eval_node(&args[0])?;
        let path = {
            let p = path.borrow();
            match p.as_str() {
                Some(s) => s.to_owned(),
                None => {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'import' expects 1 string argument",
                    ));
                }
            }
        };
        run::import_module(self, &path)
    }

    fn builtin_read(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'read' expects one argument"));
        }
        let path = self.eval_node(&args[0])?;
        let path = {
            let p = path.borrow();
            match p.as_str() {
                Some(s) => s.to_owned(),
                None => {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        "Built-in function 'read' expects one string argument",
                    ));
                }
            }
        };
        // The handle opens and closes within this call.
        let content = std::fs::read_to_string(&path)
            .map_err(|err| self.error(ErrorKind::RuntimeError, format!("Unable to read file '{path}': {err}")))?;
        Ok(make_string(content, true).into_ref())
    }

    fn builtin_write(&mut self, args: &[NodeRef], append: bool) -> RunResult<NodeRef> {
        let name = if append { "append" } else { "write" };
        if args.len() != 2 {
            return Err(self.error(
                ErrorKind::RuntimeError,
                format!("Built-in function '{name}' expects 2 arguments"),
            ));
        }
        let path_node = self.eval_node(&args[0])?;
        let value = self.eval_node(&args[1])?;
        let (path, content) = {
            let (p, v) = (path_node.borrow(), value.borrow());
            match (p.as_str(), v.as_str()) {
                (Some(p), Some(v)) => (p.to_owned(), v.to_owned()),
                _ => {
                    return Err(self.error(
                        ErrorKind::RuntimeError,
                        format!("Built-in function '{name}' expects 2 string arguments"),
                    ));
                }
            }
        };

        let result = if append {
            use std::io::Write as _;
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| file.write_all(content.as_bytes()))
        } else {
            std::fs::write(&path, content.as_bytes())
        };
        result.map_err(|err| self.error(ErrorKind::RuntimeError, format!("Unable to write file '{path}': {err}")))?;
        Ok(path_node)
    }

    fn builtin_to_int(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'to_int' expects one argument"));
        }
        let value = self.eval_node(&args[0])?;
        let result = {
            let v = value.borrow();
            match &v.payload {
                Payload::Bool(b) => Some(make_int(i64::from(*b), true)),
                Payload::Int(x) => Some(make_int(*x, true)),
                Payload::Float(x) => Some(make_int(*x as i64, true)),
                Payload::Str(s) => {
                    // a single non-digit character casts to its code point
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) if !c.is_ascii_digit() => Some(make_int(i64::from(u32::from(c)), true)),
                        _ => s.parse::<i64>().ok().map(|x| make_int(x, true)),
                    }
                }
                Payload::Any => Some(make_int(0, false)),
                _ => None,
            }
        };
        match result {
            Some(node) => Ok(node.at(self.line, self.column).into_ref()),
            None => Err(self.error(
                ErrorKind::TypeError,
                format!("Unable to cast '{}' to an integer", repr(&value)),
            )),
        }
    }

    fn builtin_to_float(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'to_float' expects one argument"));
        }
        let value = self.eval_node(&args[0])?;
        let result = {
            let v = value.borrow();
            match &v.payload {
                Payload::Bool(b) => Some(make_float(f64::from(u8::from(*b)), true)),
                Payload::Float(x) => Some(make_float(*x, true)),
                Payload::Int(x) => Some(make_float(*x as f64, true)),
                Payload::Str(s) => s.parse::<f64>().ok().map(|x| make_float(x, true)),
                Payload::Any => Some(make_float(0.0, false)),
                _ => None,
            }
        };
        match result {
            Some(node) => Ok(node.at(self.line, self.column).into_ref()),
            None => Err(self.error(
                ErrorKind::TypeError,
                format!("Unable to cast '{}' to a float", repr(&value)),
            )),
        }
    }

    fn builtin_to_string(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'to_string' expects one argument"));
        }
        let value = self.eval_node(&args[0])?;
        let text = repr(&value);
        Ok(make_string(text, true).into_ref())
    }

    fn builtin_type(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'type' expects one argument"));
        }
        let value = self.eval_node(&args[0])?;
        let name = {
            let v = value.borrow();
            match &v.payload {
                Payload::Str(_) => "string".to_owned(),
                Payload::Int(_) => "int".to_owned(),
                Payload::Float(_) => "float".to_owned(),
                Payload::Bool(_) => "bool".to_owned(),
                Payload::List(_) => "list".to_owned(),
                Payload::PipeList(_) => "pipe_list".to_owned(),
                Payload::CommaList(_) => "comma_list".to_owned(),
                Payload::Object { .. } => "object".to_owned(),
                Payload::Range { .. } => "range".to_owned(),
                Payload::Function(_) | Payload::FuncList(_) => "function".to_owned(),
                Payload::Op(data) => format!("op<{}>", data.symbol),
                Payload::PartialOp(data) => format!("__op<{}>__", data.symbol),
                Payload::Empty => "empty".to_owned(),
                Payload::Any => "any".to_owned(),
                _ => "<no type repr>".to_owned(),
            }
        };
        Ok(make_string(name, true).into_ref())
    }

    fn builtin_shape(&mut self, args: &[NodeRef]) -> RunResult<NodeRef> {
        if args.len() != 1 {
            return Err(self.error(ErrorKind::RuntimeError, "Built-in function 'shape' expects one argument"));
        }
        let value = self.eval_node(&args[0])?;
        self.get_type(&value)
    }
}
