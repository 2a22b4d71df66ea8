use smallvec::smallvec;

use crate::{
    error::{ErrorKind, GlideError, RunError, RunResult},
    node::{
        FunctionData, Node, NodeKind, NodeRef, OpKind, Payload, Property, TokenKind, make_empty, make_func_list,
        make_object,
    },
};

/// Names that can never head a function call or an index expression.
const KEYWORDS: &[&str] = &["ret", "break", "continue", "if", "for", "while", "match"];

/// Converts the flat atom buffer into an AST.
///
/// The parser is a sequence of rewriting passes over the shared buffer, one
/// per precedence level, applied innermost-bracket first: parsing a
/// parenthesis/list/block recursively runs the full pass sequence on the
/// interior while the delimiters are still in place, so partial-operator
/// detection can see them as boundaries.
pub(crate) struct Parser {
    file_name: String,
    nodes: Vec<NodeRef>,
    index: usize,
    line: u32,
    column: u32,
}

impl Parser {
    pub fn new(file_name: &str, atoms: Vec<NodeRef>) -> Self {
        Self {
            file_name: file_name.to_owned(),
            nodes: atoms,
            index: 0,
            line: 1,
            column: 1,
        }
    }

    /// Parses the whole buffer, returning top-level statements.
    pub fn parse(mut self) -> RunResult<Vec<NodeRef>> {
        self.parse_range(TokenKind::Eof, 1)?;
        // Strip the sentinels and statement separators.
        self.nodes.retain(|n| {
            let n = n.borrow();
            !n.is_token(TokenKind::Sof) && !n.is_token(TokenKind::Eof) && !n.is_op(OpKind::Semicolon)
        });
        Ok(self.nodes)
    }

    // -- buffer primitives -- //

    fn current(&self) -> NodeRef {
        self.nodes[self.index].clone()
    }

    fn advance(&mut self, n: isize) {
        let next = self.index as isize + n;
        let max = self.nodes.len() as isize - 1;
        self.index = next.clamp(0, max) as usize;
        let node = self.nodes[self.index].borrow();
        self.line = node.line;
        self.column = node.column;
    }

    fn peek(&self, n: isize) -> NodeRef {
        let at = self.index as isize + n;
        let max = self.nodes.len() as isize - 1;
        self.nodes[at.clamp(0, max) as usize].clone()
    }

    fn reset(&mut self, n: usize) {
        self.index = n;
        let node = self.nodes[n].borrow();
        self.line = node.line;
        self.column = node.column;
    }

    fn remove(&mut self, at: usize) -> NodeRef {
        self.nodes.remove(at)
    }

    fn at_end(&self, end: TokenKind) -> bool {
        let node = self.nodes[self.index].borrow();
        node.is_token(end) || node.is_token(TokenKind::Eof)
    }

    fn error(&self, message: impl Into<String>) -> RunError {
        GlideError::new(
            ErrorKind::SyntaxError,
            smallvec![self.file_name.clone()],
            self.line,
            self.column,
            message.into(),
        )
        .into()
    }

    // -- boundary predicates used for partial-operator detection -- //

    fn is_start_boundary(node: &NodeRef) -> bool {
        let n = node.borrow();
        matches!(
            n.payload,
            Payload::Token(TokenKind::Sof | TokenKind::LParen | TokenKind::LBrace | TokenKind::LBracket)
        )
    }

    fn is_end_boundary(node: &NodeRef) -> bool {
        let n = node.borrow();
        matches!(
            n.payload,
            Payload::Token(TokenKind::Eof | TokenKind::RParen | TokenKind::RBrace | TokenKind::RBracket)
        )
    }

    fn is_underscore(node: &NodeRef) -> bool {
        node.borrow().id_name() == Some("_")
    }

    fn is_childless_binary_op(node: &NodeRef) -> bool {
        let n = node.borrow();
        match &n.payload {
            Payload::Op(data) => data.is_binary && (n.left.is_none() || n.right.is_none()),
            _ => false,
        }
    }

    // -- the pass driver -- //

    /// Runs every pass over `[start, end-token)`, in precedence order.
    fn parse_range(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.pass_type_names(end, start);
        self.pass_parens(end, start)?;
        self.pass_lists(end, start)?;
        self.pass_blocks(end, start)?;
        self.pass_control_forms(end, start)?;
        self.pass_object_literals(end, start)?;
        self.pass_function_calls(end, start)?;
        self.pass_bracket_access(end, start);
        self.pass_bin(end, start, &[OpKind::DoubleDot])?;
        self.pass_bin(end, start, &[OpKind::Dot])?;
        self.pass_copy(end, start)?;
        self.pass_triple_dot(end, start);
        self.pass_unary_sign(end, start);
        self.pass_not(end, start);
        self.pass_bin(end, start, &[OpKind::Percent])?;
        self.pass_bin(end, start, &[OpKind::Star, OpKind::Slash])?;
        self.pass_bin(end, start, &[OpKind::Plus, OpKind::Minus])?;
        self.pass_bin(end, start, &[OpKind::Lt, OpKind::Gt])?;
        self.pass_bin(end, start, &[OpKind::EqEq, OpKind::NotEq, OpKind::LtEq, OpKind::GtEq])?;
        self.pass_bin(end, start, &[OpKind::And, OpKind::Or])?;
        self.pass_bin(end, start, &[OpKind::Question])?;
        self.pass_annotations(end, start)?;
        self.pass_bin(end, start, &[OpKind::Inject])?;
        self.pass_function_defs(end, start)?;
        self.pass_bin(end, start, &[OpKind::Pipe])?;
        self.pass_flatten(end, start, OpKind::Pipe);
        self.pass_bin(end, start, &[OpKind::Colon])?;
        self.pass_bin(end, start, &[OpKind::Comma])?;
        self.pass_flatten(end, start, OpKind::Comma);
        self.pass_keywords(end, start);
        self.pass_bin(end, start, &[OpKind::PlusEq, OpKind::MinusEq])?;
        self.pass_bin(end, start, &[OpKind::Equal])?;
        self.check_dangling(end, start)?;
        Ok(())
    }

    /// Replaces the reserved type-name identifiers with their kind carriers.
    fn pass_type_names(&mut self, end: TokenKind, start: usize) {
        self.reset(start);
        while !self.at_end(end) {
            let replacement = {
                let node = self.current();
                let n = node.borrow();
                match n.id_name() {
                    Some("int") => Some(Payload::Int(0)),
                    Some("float") => Some(Payload::Float(0.0)),
                    Some("string") => Some(Payload::Str(String::new())),
                    Some("bool") => Some(Payload::Bool(false)),
                    Some("list") => Some(Payload::List(Vec::new())),
                    Some("object") => Some(Payload::Object {
                        properties: indexmap::IndexMap::new(),
                        is_type: true,
                    }),
                    Some("function") => Some(Payload::Function(FunctionData {
                        name: "lambda".to_owned(),
                        params: Vec::new(),
                        args: Vec::new(),
                        body: make_empty(true).into_ref(),
                        return_type: Some(Node::new(Payload::Any).non_literal().into_ref()),
                        closure: ahash::AHashMap::new(),
                        default_indices: Vec::new(),
                        is_type: false,
                    })),
                    Some("type") => Some(Payload::TypeMarker),
                    Some("any") => Some(Payload::Any),
                    Some("null") => Some(Payload::Empty),
                    _ => None,
                }
            };
            if let Some(payload) = replacement {
                let (line, column) = (self.line, self.column);
                self.nodes[self.index] = Node::new(payload).non_literal().at(line, column).into_ref();
            }
            self.advance(1);
        }
    }

    /// Collapses `( … )` groups.
    ///
    /// A group after a callable head or a control keyword becomes a
    /// `CommaList` argument/condition container; a multi-element group stays
    /// a `CommaList` value (the injection tuple); a one-element group in any
    /// other position is plain precedence grouping and splices inline.
    fn pass_parens(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            if self.current().borrow().is_token(TokenKind::LParen) {
                self.parse_paren()?;
            }
            self.advance(1);
        }
        Ok(())
    }

    fn parse_paren(&mut self) -> RunResult<()> {
        let open = self.index;
        let (line, column) = (self.line, self.column);
        self.advance(1);
        self.parse_range(TokenKind::RParen, open + 1)?;

        // Walk forward to the matching close token.
        self.reset(open + 1);
        while !self.at_end(TokenKind::RParen) {
            self.advance(1);
        }
        if !self.current().borrow().is_token(TokenKind::RParen) {
            self.reset(open);
            return Err(self.error("Missing ')' while parsing parentheses"));
        }
        let close = self.index;

        let mut items: Vec<NodeRef> = self.nodes.drain(open + 1..close).collect();
        // The interior is fully parsed: at most one expression remains, a
        // CommaList if the source had top-level commas.
        let items = match items.len() {
            0 => Vec::new(),
            1 => {
                let single = items.pop().expect("one interior node");
                match &single.borrow().payload {
                    Payload::CommaList(elems) => elems.clone(),
                    _ => vec![single.clone()],
                }
            }
            _ => {
                self.reset(open);
                return Err(self.error("Parenthesized expression must reduce to a single value"));
            }
        };

        // Close token now sits right after the open one.
        self.remove(open + 1);

        let prev = if open == 0 { None } else { Some(self.nodes[open - 1].clone()) };
        let prev_is_callable = prev.as_ref().is_some_and(|p| {
            let p = p.borrow();
            match &p.payload {
                Payload::Id { name, .. } => !KEYWORDS.contains(&name.as_str()),
                Payload::Function(_) | Payload::FuncCall { .. } => true,
                Payload::Op(data) => data.op == OpKind::Dot && p.left.is_some() && p.right.is_some(),
                _ => false,
            }
        });
        let prev_is_conditional = prev.as_ref().is_some_and(|p| {
            matches!(p.borrow().id_name(), Some("if" | "while" | "match"))
        });

        if prev_is_callable || prev_is_conditional || items.len() != 1 {
            if items.is_empty() && !prev_is_callable {
                self.reset(open);
                return Err(self.error("Empty parentheses"));
            }
            self.nodes[open] = Node::new(Payload::CommaList(items)).at(line, column).into_ref();
        } else {
            self.nodes[open] = items.into_iter().next().expect("one item");
        }
        self.reset(open);
        Ok(())
    }

    /// Collapses `[ … ]` into `List` nodes, flattening one comma level.
    fn pass_lists(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            if self.current().borrow().is_token(TokenKind::LBracket) {
                self.parse_list()?;
            }
            self.advance(1);
        }
        Ok(())
    }

    fn parse_list(&mut self) -> RunResult<()> {
        let open = self.index;
        let (line, column) = (self.line, self.column);
        self.advance(1);
        self.parse_range(TokenKind::RBracket, open + 1)?;

        self.reset(open + 1);
        while !self.at_end(TokenKind::RBracket) {
            self.advance(1);
        }
        if !self.current().borrow().is_token(TokenKind::RBracket) {
            self.reset(open);
            return Err(self.error("Missing ']' while parsing list"));
        }
        let close = self.index;

        let interior: Vec<NodeRef> = self.nodes.drain(open + 1..close).collect();
        let mut items = Vec::with_capacity(interior.len());
        for node in interior {
            let flattened = match &node.borrow().payload {
                Payload::CommaList(elems) => Some(elems.clone()),
                _ => None,
            };
            match flattened {
                Some(elems) => items.extend(elems),
                None => items.push(node.clone()),
            }
        }

        self.remove(open + 1);
        let mut list = Node::new(Payload::List(items)).at(line, column);
        list.meta.is_literal = true;
        self.nodes[open] = list.into_ref();
        self.reset(open);
        Ok(())
    }

    /// Collapses `{ … }` into `Block` nodes.
    fn pass_blocks(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            if self.current().borrow().is_token(TokenKind::LBrace) {
                self.parse_block()?;
            }
            self.advance(1);
        }
        Ok(())
    }

    fn parse_block(&mut self) -> RunResult<()> {
        let open = self.index;
        let (line, column) = (self.line, self.column);
        self.advance(1);
        self.parse_range(TokenKind::RBrace, open + 1)?;

        self.reset(open + 1);
        while !self.at_end(TokenKind::RBrace) {
            self.advance(1);
        }
        if !self.current().borrow().is_token(TokenKind::RBrace) {
            self.reset(open);
            return Err(self.error("Missing '}' while parsing block"));
        }
        let close = self.index;

        let interior: Vec<NodeRef> = self.nodes.drain(open + 1..close).collect();
        self.remove(open + 1);
        self.nodes[open] = Node::new(Payload::Block(interior)).at(line, column).into_ref();
        self.reset(open);
        Ok(())
    }

    /// Rewrites `if`/`match`/`for`/`while` identifier sequences into their
    /// control nodes.
    fn pass_control_forms(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            let keyword = self.current().borrow().id_name().map(str::to_owned);
            match keyword.as_deref() {
                Some("if") => self.parse_if()?,
                Some("match") => self.parse_match()?,
                Some("for") => self.parse_for()?,
                Some("while") => self.parse_while()?,
                _ => {}
            }
            self.advance(1);
        }
        Ok(())
    }

    fn conditional_of(&mut self, container: &NodeRef, what: &str) -> RunResult<NodeRef> {
        match &container.borrow().payload {
            Payload::CommaList(items) if items.len() == 1 => Ok(items[0].clone()),
            _ => Err(self.error(format!("{what} expects a boolean conditional"))),
        }
    }

    fn parse_if(&mut self) -> RunResult<()> {
        let (line, column) = (self.line, self.column);
        let next = self.peek(1);

        if matches!(next.borrow().payload, Payload::Block(_)) {
            let cases = match &next.borrow().payload {
                Payload::Block(nodes) => nodes
                    .iter()
                    .filter(|n| !n.borrow().is_op(OpKind::Semicolon))
                    .cloned()
                    .collect(),
                _ => unreachable!(),
            };
            self.remove(self.index + 1);
            self.nodes[self.index] = Node::new(Payload::IfBlock { cases }).at(line, column).into_ref();
            return Ok(());
        }

        if matches!(next.borrow().payload, Payload::CommaList(_)) {
            let cond = self.conditional_of(&next, "If statement")?;
            let body = self.peek(2);
            if !matches!(body.borrow().payload, Payload::Block(_)) {
                return Err(self.error("If statement body must be a block"));
            }
            self.remove(self.index + 2);
            self.remove(self.index + 1);
            self.nodes[self.index] = Node::new(Payload::IfStatement { cond, body }).at(line, column).into_ref();
        }
        Ok(())
    }

    fn parse_match(&mut self) -> RunResult<()> {
        let (line, column) = (self.line, self.column);
        let next = self.peek(1);
        if !matches!(next.borrow().payload, Payload::CommaList(_)) {
            return Ok(());
        }
        let value = self.conditional_of(&next, "Match statement")?;
        let body = self.peek(2);
        let cases = match &body.borrow().payload {
            Payload::Block(nodes) => nodes
                .iter()
                .filter(|n| !n.borrow().is_op(OpKind::Semicolon))
                .cloned()
                .collect::<Vec<_>>(),
            _ => return Err(self.error("Match statement body must be a block")),
        };
        self.remove(self.index + 2);
        self.remove(self.index + 1);
        self.nodes[self.index] = Node::new(Payload::MatchBlock { value, cases }).at(line, column).into_ref();
        Ok(())
    }

    fn parse_for(&mut self) -> RunResult<()> {
        let (line, column) = (self.line, self.column);
        let init = self.peek(1);
        let body = self.peek(2);
        let init_len = match &init.borrow().payload {
            Payload::List(items) => items.len(),
            _ => return Err(self.error("Incorrect for loop syntax, missing initializer list")),
        };
        if init_len == 0 {
            return Err(self.error("Incorrect for loop syntax, empty initializer list"));
        }
        if init_len > 3 {
            return Err(self.error(
                "Incorrect for loop syntax, too many arguments in initializer list - maximum arguments count is 3 [iterator index value]",
            ));
        }
        if !matches!(body.borrow().payload, Payload::Block(_)) {
            return Err(self.error("Incorrect for loop syntax, missing loop body"));
        }
        self.remove(self.index + 2);
        self.remove(self.index + 1);
        self.nodes[self.index] = Node::new(Payload::ForLoop { init, body }).at(line, column).into_ref();
        Ok(())
    }

    fn parse_while(&mut self) -> RunResult<()> {
        let (line, column) = (self.line, self.column);
        let next = self.peek(1);
        if !matches!(next.borrow().payload, Payload::CommaList(_)) {
            return Err(self.error("Incorrect while loop syntax, missing conditional"));
        }
        let cond = self.conditional_of(&next, "While loop")?;
        let body = self.peek(2);
        if !matches!(body.borrow().payload, Payload::Block(_)) {
            return Err(self.error("Incorrect while loop syntax, missing loop body"));
        }
        self.remove(self.index + 2);
        self.remove(self.index + 1);
        self.nodes[self.index] = Node::new(Payload::WhileLoop { cond, body }).at(line, column).into_ref();
        Ok(())
    }

    /// Converts a block whose entries are `key: value` pairs into an object
    /// literal. Comma-joined entries and `?`-marked optional keys are
    /// unpacked here; duplicate function-valued keys merge into an overload
    /// set.
    fn pass_object_literals(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            let entries = {
                let node = self.current();
                let n = node.borrow();
                match &n.payload {
                    Payload::Block(items) => {
                        let mut flat = Vec::new();
                        for item in items {
                            match &item.borrow().payload {
                                Payload::CommaList(elems) => flat.extend(elems.iter().cloned()),
                                Payload::Op(data) if data.op == OpKind::Semicolon => {}
                                _ => flat.push(item.clone()),
                            }
                        }
                        let first_is_pair = flat.first().is_some_and(|f| f.borrow().op_kind() == Some(OpKind::Colon));
                        if first_is_pair { Some(flat) } else { None }
                    }
                    _ => None,
                }
            };

            if let Some(entries) = entries {
                let object = self.build_object(&entries)?;
                let (line, column) = (self.line, self.column);
                self.nodes[self.index] = object.at(line, column).into_ref();
            }
            self.advance(1);
        }
        Ok(())
    }

    fn build_object(&mut self, entries: &[NodeRef]) -> RunResult<Node> {
        let mut object = make_object(true);
        let Payload::Object { properties, .. } = &mut object.payload else {
            unreachable!()
        };

        for entry in entries {
            let e = entry.borrow();
            if e.op_kind() != Some(OpKind::Colon) {
                return Err(self.error("Object must contain properties"));
            }
            let (mut key_node, value) = (
                e.left.clone().ok_or_else(|| self.error("Object must contain properties"))?,
                e.right.clone().ok_or_else(|| self.error("Object must contain properties"))?,
            );

            // `key?: value` arrives as a partial `?` on the key side.
            let mut required = true;
            let optional_inner = {
                let k = key_node.borrow();
                if k.op_kind() == Some(OpKind::Question) {
                    k.left.clone()
                } else {
                    None
                }
            };
            if let Some(inner) = optional_inner {
                key_node = inner;
                required = false;
            }

            let key = {
                let k = key_node.borrow();
                match &k.payload {
                    Payload::Id { name, .. } => name.clone(),
                    Payload::Str(s) => s.clone(),
                    _ => return Err(self.error("Object properties must be either identifiers or strings")),
                }
            };

            if let Payload::Function(func) = &mut value.borrow_mut().payload {
                func.name.clone_from(&key);
            }

            // Duplicate function keys build an overload set in declaration order.
            if let Some(existing) = properties.get_mut(&key) {
                let merged = {
                    let old = existing.value.clone();
                    let old_kind = old.borrow().kind();
                    let new_is_func = matches!(value.borrow().payload, Payload::Function(_));
                    match (old_kind, new_is_func) {
                        (NodeKind::Function, true) => Some(make_func_list(vec![old, value.clone()]).into_ref()),
                        (NodeKind::FuncList, true) => {
                            if let Payload::FuncList(items) = &mut old.borrow_mut().payload {
                                items.push(value.clone());
                            }
                            Some(old)
                        }
                        _ => None,
                    }
                };
                match merged {
                    Some(value) => existing.value = value,
                    None => *existing = Property { required, value: value.clone() },
                }
            } else {
                properties.insert(key, Property { required, value: value.clone() });
            }
        }
        Ok(object)
    }

    /// Rewrites a callable head followed by an argument container into a
    /// `FuncCall` node.
    fn pass_function_calls(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            let head = self.current();
            let next = self.peek(1);

            let head_name = {
                let h = head.borrow();
                match &h.payload {
                    Payload::Id { name, .. } if !KEYWORDS.contains(&name.as_str()) => Some(name.clone()),
                    Payload::Function(func) => Some(func.name.clone()),
                    Payload::FuncCall { name, .. } => Some(name.clone()),
                    Payload::Op(data) if data.op == OpKind::Dot && h.left.is_some() && h.right.is_some() => {
                        Some(String::new())
                    }
                    _ => None,
                }
            };

            if let Some(name) = head_name {
                let args = match &next.borrow().payload {
                    Payload::CommaList(items) => Some(items.clone()),
                    _ => None,
                };
                if let Some(args) = args {
                    let (line, column) = (self.line, self.column);
                    self.remove(self.index + 1);
                    self.nodes[self.index] = Node::new(Payload::FuncCall {
                        name,
                        caller: Some(head),
                        args,
                    })
                    .at(line, column)
                    .into_ref();
                    continue;
                }
            }
            self.advance(1);
        }
        Ok(())
    }

    /// Inserts a member-access dot between a value head and a bracket
    /// accessor, so `xs[0]`, `obj["k"]` and chains like `xs[0][1]` parse as
    /// computed member access.
    fn pass_bracket_access(&mut self, end: TokenKind, start: usize) {
        self.reset(start);
        while !self.at_end(end) {
            let head = self.current();
            let indexable = {
                let h = head.borrow();
                match &h.payload {
                    Payload::Id { name, .. } => !KEYWORDS.contains(&name.as_str()),
                    Payload::FuncCall { .. } => true,
                    _ => false,
                }
            };
            if indexable {
                while matches!(self.peek(1).borrow().payload, Payload::List(_)) {
                    let dot = Node::new(Payload::Op(crate::node::OpData::new(".", OpKind::Dot)))
                        .at(self.line, self.column)
                        .into_ref();
                    self.nodes.insert(self.index + 1, dot);
                    self.advance(2);
                }
            }
            self.advance(1);
        }
    }

    /// Generic binary-operator pass with partial-operator detection.
    fn pass_bin(&mut self, end: TokenKind, start: usize, ops: &[OpKind]) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            let is_target = {
                let n = self.current();
                let n = n.borrow();
                matches!(&n.payload, Payload::Op(data) if ops.contains(&data.op))
            };
            if is_target {
                self.parse_bin_op()?;
            }
            self.advance(1);
        }
        Ok(())
    }

    fn parse_bin_op(&mut self) -> RunResult<()> {
        let current = self.current();
        {
            let c = current.borrow();
            if c.left.is_some() || c.right.is_some() {
                return Ok(());
            }
        }
        let op = current.borrow().op_kind().expect("binary pass visits operators");

        // `_` marks a partial-operator hole only next to value operators;
        // next to `,`/`:`/`|`/`=` it is the wildcard pattern identifier.
        let hole_friendly = matches!(
            op,
            OpKind::Plus
                | OpKind::Minus
                | OpKind::Star
                | OpKind::Slash
                | OpKind::Percent
                | OpKind::Lt
                | OpKind::Gt
                | OpKind::LtEq
                | OpKind::GtEq
                | OpKind::EqEq
                | OpKind::NotEq
                | OpKind::And
                | OpKind::Or
        );

        let prev = self.peek(-1);
        let prev_is_hole = Self::is_underscore(&prev) && hole_friendly;
        if Self::is_start_boundary(&prev) || prev_is_hole || Self::is_childless_binary_op(&prev) {
            Self::to_partial(&current);
            current.borrow_mut().left = Some(make_empty(true).into_ref());
            if prev_is_hole {
                self.remove(self.index - 1);
                self.advance(-1);
            }
        }

        let next = self.peek(1);
        let next_is_hole = Self::is_underscore(&next) && hole_friendly;
        if Self::is_end_boundary(&next) || next_is_hole || Self::is_childless_binary_op(&next) {
            Self::to_partial(&current);
            current.borrow_mut().right = Some(make_empty(true).into_ref());
            if next_is_hole {
                self.remove(self.index + 1);
            }
        }

        let is_partial = matches!(current.borrow().payload, Payload::PartialOp(_));
        if is_partial {
            if current.borrow().right.is_none() {
                let operand = self.remove(self.index + 1);
                current.borrow_mut().right = Some(operand);
            }
            if current.borrow().left.is_none() {
                let operand = self.remove(self.index - 1);
                current.borrow_mut().left = Some(operand);
                self.advance(-1);
            }
        } else {
            let right = self.remove(self.index + 1);
            let left = self.remove(self.index - 1);
            {
                let mut c = current.borrow_mut();
                c.left = Some(left);
                c.right = Some(right);
            }
            self.advance(-1);
        }

        self.validate_bin_op(&current, op)
    }

    fn to_partial(node: &NodeRef) {
        let mut n = node.borrow_mut();
        if let Payload::Op(data) = &n.payload {
            n.payload = Payload::PartialOp(data.clone());
        }
    }

    fn validate_bin_op(&mut self, current: &NodeRef, op: OpKind) -> RunResult<()> {
        let (left, right, is_partial) = {
            let c = current.borrow();
            (
                c.left.clone().expect("bound operand"),
                c.right.clone().expect("bound operand"),
                matches!(c.payload, Payload::PartialOp(_)),
            )
        };

        // A partial as the left operand only makes sense for `:` (optional
        // object properties); as the right operand only for `=` and `>>`.
        if matches!(left.borrow().payload, Payload::PartialOp(_)) && op != OpKind::Colon {
            return Err(self.error(format!(
                "Left hand operand of '{}' cannot be a partial operator",
                crate::node::repr(current)
            )));
        }
        if matches!(right.borrow().payload, Payload::PartialOp(_))
            && !is_partial
            && op != OpKind::Equal
            && op != OpKind::Inject
        {
            return Err(self.error(format!(
                "Right hand operand of '{}' cannot be a partial operator",
                crate::node::repr(current)
            )));
        }

        if op == OpKind::Equal && !is_partial {
            let left_ok = {
                let l = left.borrow();
                l.id_name().is_some() || l.op_kind() == Some(OpKind::Dot) || matches!(l.payload, Payload::List(_))
            };
            if !left_ok {
                return Err(self.error(format!(
                    "Invalid left operand of operator '{}'",
                    crate::node::repr(current)
                )));
            }

            // Name functions after the binding they land in. Objects keep
            // an empty nominal tag; only a typed assignment names them.
            if let Some(name) = left.borrow().id_name().map(str::to_owned)
                && let Payload::Function(func) = &mut right.borrow_mut().payload
            {
                func.name = name;
            }
        }
        Ok(())
    }

    /// Deep-copy prefix: `#x`.
    fn pass_copy(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            let is_hash = self.current().borrow().op_kind() == Some(OpKind::Hash);
            if is_hash {
                let next = self.peek(1);
                if Self::is_end_boundary(&next) {
                    return Err(self.error("Operator '#' cannot have an empty right operand"));
                }
                if next.borrow().id_name().is_none() {
                    return Err(self.error("Unexpected right operand for operator '#'"));
                }
                let target = self.remove(self.index + 1);
                let current = self.current();
                let mut c = current.borrow_mut();
                c.payload = Payload::Copy;
                c.right = Some(target);
            }
            self.advance(1);
        }
        Ok(())
    }

    /// Unary `+`/`-` where the operand position makes a binary reading
    /// impossible.
    fn pass_unary_sign(&mut self, end: TokenKind, start: usize) {
        self.reset(start);
        while !self.at_end(end) {
            let current = self.current();
            let applies = {
                let c = current.borrow();
                c.right.is_none() && matches!(c.op_kind(), Some(OpKind::Plus | OpKind::Minus))
            };
            if applies {
                let prev = self.peek(-1);
                let prev_childless_op = {
                    let p = prev.borrow();
                    matches!(p.payload, Payload::Op(_)) && p.left.is_none() && p.right.is_none()
                };
                let prefix_position = Self::is_start_boundary(&prev)
                    || prev.borrow().id_name() == Some("ret")
                    || prev_childless_op;
                let next = self.peek(1);
                if prefix_position && !Self::is_end_boundary(&next) {
                    let operand = self.remove(self.index + 1);
                    let mut c = current.borrow_mut();
                    if let Payload::Op(data) = &mut c.payload {
                        data.op = if data.op == OpKind::Plus { OpKind::Pos } else { OpKind::Neg };
                        data.is_binary = false;
                    }
                    c.right = Some(operand);
                }
            }
            self.advance(1);
        }
    }

    /// Splice markers: `...rest` binds the trailing identifier.
    fn pass_triple_dot(&mut self, end: TokenKind, start: usize) {
        self.reset(start);
        while !self.at_end(end) {
            let current = self.current();
            let applies = {
                let c = current.borrow();
                c.right.is_none() && c.op_kind() == Some(OpKind::TripleDot)
            };
            if applies && self.peek(1).borrow().id_name().is_some() {
                let target = self.remove(self.index + 1);
                current.borrow_mut().right = Some(target);
            }
            self.advance(1);
        }
    }

    /// Unary `!`.
    fn pass_not(&mut self, end: TokenKind, start: usize) {
        self.reset(start);
        while !self.at_end(end) {
            let current = self.current();
            let applies = {
                let c = current.borrow();
                c.right.is_none() && c.op_kind() == Some(OpKind::Exclamation)
            };
            if applies && !Self::is_end_boundary(&self.peek(1)) {
                let operand = self.remove(self.index + 1);
                let mut c = current.borrow_mut();
                if let Payload::Op(data) = &mut c.payload {
                    data.op = OpKind::Not;
                    data.is_binary = false;
                }
                c.right = Some(operand);
            }
            self.advance(1);
        }
    }

    /// `::` type annotations: attach the type node to the preceding
    /// identifier (or splice target), or form a params/return-type pair for
    /// function definitions.
    fn pass_annotations(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            let applies = {
                let c = self.current();
                let c = c.borrow();
                matches!(&c.payload, Payload::Op(data) if data.op == OpKind::DoubleColon) && c.left.is_none()
            };
            if applies {
                self.parse_annotation()?;
            }
            self.advance(1);
        }
        Ok(())
    }

    fn parse_annotation(&mut self) -> RunResult<()> {
        let prev = self.peek(-1);
        let type_node = self.peek(1);
        type_node.borrow_mut().meta.is_type = true;

        enum Target {
            Id,
            Splice,
            ParamList,
        }
        let target = {
            let p = prev.borrow();
            if p.id_name().is_some() {
                Target::Id
            } else if p.op_kind() == Some(OpKind::TripleDot) {
                Target::Splice
            } else if matches!(p.payload, Payload::List(_)) {
                Target::ParamList
            } else {
                return Err(self.error("Cannot assign type here"));
            }
        };

        match target {
            Target::Id => {
                if let Payload::Id { annotation, .. } = &mut prev.borrow_mut().payload {
                    *annotation = Some(type_node);
                }
                self.remove(self.index + 1);
                self.remove(self.index);
                self.advance(-1);
            }
            Target::Splice => {
                let id = prev.borrow().right.clone();
                if let Some(id) = id
                    && let Payload::Id { annotation, .. } = &mut id.borrow_mut().payload
                {
                    *annotation = Some(type_node);
                }
                self.remove(self.index + 1);
                self.remove(self.index);
                self.advance(-1);
            }
            Target::ParamList => {
                // `[params]::T => body` keeps the `::` node as the pair the
                // function-definition pass consumes.
                let current = self.current();
                self.remove(self.index + 1);
                let left = self.remove(self.index - 1);
                self.advance(-1);
                let mut c = current.borrow_mut();
                c.left = Some(left);
                c.right = Some(type_node);
            }
        }
        Ok(())
    }

    /// `params => body` function definitions.
    fn pass_function_defs(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        while !self.at_end(end) {
            let applies = {
                let c = self.current();
                let c = c.borrow();
                matches!(&c.payload, Payload::Op(data) if data.op == OpKind::Arrow) && c.left.is_none()
            };
            if applies {
                self.parse_function_def()?;
            }
            self.advance(1);
        }
        Ok(())
    }

    fn parse_function_def(&mut self) -> RunResult<()> {
        let params_node = self.peek(-1);
        let body = self.peek(1);
        let (line, column) = (self.line, self.column);

        let (params, return_type) = {
            let p = params_node.borrow();
            match &p.payload {
                Payload::List(items) => (items.clone(), None),
                Payload::Id { .. } => (vec![params_node.clone()], None),
                Payload::Op(data) if data.op == OpKind::DoubleColon => {
                    let list = p.left.clone().ok_or_else(|| self.error("Malformed function definition expression"))?;
                    let ret = p.right.clone();
                    let items = match &list.borrow().payload {
                        Payload::List(items) => items.clone(),
                        _ => return Err(self.error("Malformed function definition expression")),
                    };
                    (items, ret)
                }
                _ => return Err(self.error("Malformed function definition expression")),
            }
        };

        // Default-valued parameters pre-fill their argument slots; the
        // defaults evaluate when the function value is constructed.
        let mut args: Vec<Option<NodeRef>> = Vec::with_capacity(params.len());
        let mut default_indices = Vec::new();
        for (i, param) in params.iter().enumerate() {
            let default = {
                let p = param.borrow();
                if p.op_kind() == Some(OpKind::Equal) { p.right.clone() } else { None }
            };
            if default.is_some() {
                default_indices.push(i);
            }
            args.push(default);
        }

        let func = Node::new(Payload::Function(FunctionData {
            name: "lambda".to_owned(),
            params,
            args,
            body,
            return_type,
            closure: ahash::AHashMap::new(),
            default_indices,
            is_type: false,
        }))
        .at(line, column);

        self.remove(self.index + 1);
        self.remove(self.index - 1);
        self.advance(-1);
        self.nodes[self.index] = func.into_ref();
        Ok(())
    }

    /// Flattens nested `,`/`|` operator chains into their list nodes.
    fn pass_flatten(&mut self, end: TokenKind, start: usize, op: OpKind) {
        self.reset(start);
        while !self.at_end(end) {
            let current = self.current();
            let applies = current.borrow().op_kind() == Some(op)
                && matches!(current.borrow().payload, Payload::Op(_));
            if applies {
                let mut items = Vec::new();
                Self::flatten_chain(&current, op, &mut items);
                let payload = if op == OpKind::Comma {
                    Payload::CommaList(items)
                } else {
                    Payload::PipeList(items)
                };
                let mut c = current.borrow_mut();
                c.payload = payload;
                if op == OpKind::Pipe {
                    c.meta.is_literal = false;
                }
                c.left = None;
                c.right = None;
            }
            self.advance(1);
        }
    }

    fn flatten_chain(node: &NodeRef, op: OpKind, out: &mut Vec<NodeRef>) {
        let (left, right) = {
            let n = node.borrow();
            (n.left.clone(), n.right.clone())
        };
        for child in [left, right].into_iter().flatten() {
            let is_same_chain = {
                let c = child.borrow();
                matches!(&c.payload, Payload::Op(data) if data.op == op)
            };
            if is_same_chain {
                Self::flatten_chain(&child, op, out);
            } else {
                out.push(child);
            }
        }
    }

    /// `ret`/`break`/`continue` keyword statements.
    fn pass_keywords(&mut self, end: TokenKind, start: usize) {
        self.reset(start);
        while !self.at_end(end) {
            let name = self.current().borrow().id_name().map(str::to_owned);
            if let Some(name) = name
                && matches!(name.as_str(), "ret" | "break" | "continue")
            {
                let current = self.current();
                if name == "ret" {
                    let next = self.peek(1);
                    let next_ends = Self::is_end_boundary(&next) || next.borrow().is_op(OpKind::Semicolon);
                    let value = if next_ends {
                        make_empty(true).into_ref()
                    } else {
                        self.remove(self.index + 1)
                    };
                    current.borrow_mut().right = Some(value);
                }
                current.borrow_mut().payload = Payload::Keyword(name);
            }
            self.advance(1);
        }
    }

    /// After all passes, anything still carrying a stray close token means
    /// unbalanced brackets.
    fn check_dangling(&mut self, end: TokenKind, start: usize) -> RunResult<()> {
        self.reset(start);
        loop {
            let node = self.current();
            let stray = {
                let n = node.borrow();
                if n.is_token(end) || n.is_token(TokenKind::Eof) {
                    break;
                }
                if Self::is_end_boundary(&node) {
                    Some(token_name(&n.payload))
                } else {
                    None
                }
            };
            if let Some(name) = stray {
                return Err(self.error(format!("Dangling '{name}'")));
            }
            if self.index + 1 >= self.nodes.len() {
                break;
            }
            self.advance(1);
        }
        Ok(())
    }
}

fn token_name(payload: &Payload) -> &'static str {
    match payload {
        Payload::Token(TokenKind::RParen) => ")",
        Payload::Token(TokenKind::RBrace) => "}",
        Payload::Token(TokenKind::RBracket) => "]",
        _ => "<token>",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::node::repr;

    fn parse_source(source: &str) -> Vec<NodeRef> {
        let atoms = Lexer::new("test.gl", source).tokenize().unwrap();
        Parser::new("test.gl", atoms).parse().unwrap()
    }

    fn parse_one(source: &str) -> NodeRef {
        let nodes = parse_source(source);
        assert_eq!(nodes.len(), 1, "expected one statement for {source:?}");
        nodes[0].clone()
    }

    #[test]
    fn arithmetic_precedence() {
        let node = parse_one("1 + 2 * 3");
        let n = node.borrow();
        assert_eq!(n.op_kind(), Some(OpKind::Plus));
        assert_eq!(n.left.as_ref().unwrap().borrow().as_int(), Some(1));
        assert_eq!(n.right.as_ref().unwrap().borrow().op_kind(), Some(OpKind::Star));
    }

    #[test]
    fn grouping_overrides_precedence() {
        let node = parse_one("(1 + 2) * 3");
        let n = node.borrow();
        assert_eq!(n.op_kind(), Some(OpKind::Star));
        assert_eq!(n.left.as_ref().unwrap().borrow().op_kind(), Some(OpKind::Plus));
    }

    #[test]
    fn call_with_args() {
        let node = parse_one("f(2, 3)");
        let n = node.borrow();
        let Payload::FuncCall { name, args, .. } = &n.payload else {
            panic!("expected call, got {:?}", n.payload);
        };
        assert_eq!(name, "f");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn call_with_no_args() {
        let node = parse_one("f()");
        let Payload::FuncCall { args, .. } = &node.borrow().payload else {
            panic!("expected call");
        };
        assert!(args.is_empty());
    }

    #[test]
    fn list_literal_flattens_commas() {
        let node = parse_one("[1, 2, 3]");
        let Payload::List(items) = &node.borrow().payload else {
            panic!("expected list");
        };
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn function_definition() {
        let node = parse_one("[x::int y::int] => x + y");
        let Payload::Function(func) = &node.borrow().payload else {
            panic!("expected function");
        };
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.args, vec![None, None]);
    }

    #[test]
    fn function_with_return_annotation() {
        let node = parse_one("[x]::int => x");
        let Payload::Function(func) = &node.borrow().payload else {
            panic!("expected function");
        };
        assert!(func.return_type.is_some());
    }

    #[test]
    fn assignment_names_functions() {
        let node = parse_one("add = [x y] => x + y");
        let n = node.borrow();
        assert_eq!(n.op_kind(), Some(OpKind::Equal));
        let right = n.right.as_ref().unwrap();
        let Payload::Function(func) = &right.borrow().payload else {
            panic!("expected function");
        };
        assert_eq!(func.name, "add");
    }

    #[test]
    fn if_statement_and_if_block() {
        let node = parse_one("if (x > 1) { y = 2 }");
        assert!(matches!(node.borrow().payload, Payload::IfStatement { .. }));

        let node = parse_one("if { x: 1; y: 2 }");
        let Payload::IfBlock { cases } = &node.borrow().payload else {
            panic!("expected if block");
        };
        assert_eq!(cases.len(), 2);
    }

    #[test]
    fn match_block_with_range_patterns() {
        let node = parse_one("match (v) { 0..10: \"low\"; _: \"hi\" }");
        let Payload::MatchBlock { cases, .. } = &node.borrow().payload else {
            panic!("expected match block");
        };
        assert_eq!(cases.len(), 2);
        // The wildcard case keeps `_` as its pattern.
        let last = cases[1].borrow();
        assert_eq!(last.op_kind(), Some(OpKind::Colon));
        assert_eq!(last.left.as_ref().unwrap().borrow().id_name(), Some("_"));
    }

    #[test]
    fn for_loop_forms() {
        let node = parse_one("for [xs, i, x] { x }");
        assert!(matches!(node.borrow().payload, Payload::ForLoop { .. }));
    }

    #[test]
    fn object_literal_with_commas() {
        let node = parse_one("{ n: 0, inc: [] => 1 }");
        let n = node.borrow();
        let Payload::Object { properties, .. } = &n.payload else {
            panic!("expected object, got {:?}", n.payload);
        };
        assert_eq!(properties.len(), 2);
        let Payload::Function(func) = &properties["inc"].value.borrow().payload else {
            panic!("expected function property");
        };
        assert_eq!(func.name, "inc");
    }

    #[test]
    fn optional_object_property() {
        let node = parse_one("{ a: 1, b?: 2 }");
        let Payload::Object { properties, .. } = &node.borrow().payload else {
            panic!("expected object");
        };
        assert!(properties["a"].required);
        assert!(!properties["b"].required);
    }

    #[test]
    fn duplicate_function_properties_form_overload_set() {
        let node = parse_one("{ f: [x::int] => x, f: [x::string] => x }");
        let Payload::Object { properties, .. } = &node.borrow().payload else {
            panic!("expected object");
        };
        let Payload::FuncList(items) = &properties["f"].value.borrow().payload else {
            panic!("expected overload set");
        };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn bracket_access_becomes_dot() {
        let node = parse_one("xs[0]");
        let n = node.borrow();
        assert_eq!(n.op_kind(), Some(OpKind::Dot));
        assert!(matches!(n.right.as_ref().unwrap().borrow().payload, Payload::List(_)));
    }

    #[test]
    fn method_call_chain() {
        let node = parse_one("ls.filter(f).map(g)");
        let n = node.borrow();
        assert_eq!(n.op_kind(), Some(OpKind::Dot));
        // Left-associative: ((ls.filter(f)).map(g))
        let left = n.left.as_ref().unwrap();
        assert_eq!(left.borrow().op_kind(), Some(OpKind::Dot));
        assert!(matches!(
            n.right.as_ref().unwrap().borrow().payload,
            Payload::FuncCall { .. }
        ));
    }

    #[test]
    fn partial_operator_detection() {
        let node = parse_one("(_ + 1)");
        let n = node.borrow();
        assert!(matches!(n.payload, Payload::PartialOp(_)));
        assert!(matches!(n.left.as_ref().unwrap().borrow().payload, Payload::Empty));
        assert_eq!(n.right.as_ref().unwrap().borrow().as_int(), Some(1));
    }

    #[test]
    fn partial_repr() {
        let node = parse_one("(_ * 2)");
        assert_eq!(repr(&node), "...*");
    }

    #[test]
    fn pipe_list_types() {
        let node = parse_one("x::(int | string) = y");
        let n = node.borrow();
        assert_eq!(n.op_kind(), Some(OpKind::Equal));
        let left = n.left.as_ref().unwrap();
        let Payload::Id { annotation, .. } = &left.borrow().payload else {
            panic!("expected id");
        };
        let annotation = annotation.as_ref().unwrap();
        assert!(matches!(annotation.borrow().payload, Payload::PipeList(_)));
    }

    #[test]
    fn variadic_params() {
        let node = parse_one("[...args] => args");
        let Payload::Function(func) = &node.borrow().payload else {
            panic!("expected function");
        };
        assert!(crate::node::param_is_variadic(&func.params[0]));
        assert_eq!(crate::node::param_name(&func.params[0]), Some("args".to_owned()));
    }

    #[test]
    fn default_params_prefill_args() {
        let node = parse_one("[x y = 2] => x");
        let Payload::Function(func) = &node.borrow().payload else {
            panic!("expected function");
        };
        assert!(func.args[0].is_none());
        assert!(func.args[1].is_some());
        assert_eq!(func.default_indices, vec![1]);
    }

    #[test]
    fn keyword_returns() {
        let nodes = parse_source("ret 1 + 2");
        let n = nodes[0].borrow();
        assert!(matches!(&n.payload, Payload::Keyword(k) if k == "ret"));
        assert_eq!(n.right.as_ref().unwrap().borrow().op_kind(), Some(OpKind::Plus));
    }

    #[test]
    fn type_annotation_attaches_to_id() {
        let node = parse_one("x::int = 1");
        let left = node.borrow().left.clone().unwrap();
        let Payload::Id { annotation, .. } = &left.borrow().payload else {
            panic!("expected id");
        };
        let ann = annotation.as_ref().unwrap();
        assert_eq!(ann.borrow().kind(), NodeKind::Int);
        assert!(!ann.borrow().meta.is_literal);
    }

    #[test]
    fn injection_operator() {
        let node = parse_one("(2, 3) >> f");
        let n = node.borrow();
        assert_eq!(n.op_kind(), Some(OpKind::Inject));
        assert!(matches!(n.left.as_ref().unwrap().borrow().payload, Payload::CommaList(_)));
    }

    #[test]
    fn dangling_bracket_is_syntax_error() {
        let atoms = Lexer::new("test.gl", "1 + 2)").tokenize().unwrap();
        let err = Parser::new("test.gl", atoms).parse().unwrap_err();
        assert!(err.to_string().contains("SyntaxError"));
    }

    #[test]
    fn nested_calls() {
        let node = parse_one("print(f(2, 3))");
        let Payload::FuncCall { name, args, .. } = &node.borrow().payload else {
            panic!("expected call");
        };
        assert_eq!(name, "print");
        assert!(matches!(args[0].borrow().payload, Payload::FuncCall { .. }));
    }
}
