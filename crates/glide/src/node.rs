use std::{cell::RefCell, fmt::Write as _, rc::Rc};

use ahash::AHashMap;
use indexmap::IndexMap;

/// Shared handle to a node.
///
/// Every node in the interpreter is reference counted and interior-mutable:
/// the same design the source language semantics require, where closures,
/// scopes and values alias each other freely and mutation through one alias
/// is visible through all others. Cycles (a closure capturing the function
/// that owns it) are permitted and simply live until process exit.
pub(crate) type NodeRef = Rc<RefCell<Node>>;

/// Creates a fresh shared handle from a shallow copy of `node`.
///
/// Children remain shared, matching copy-construction of a node in the
/// reference semantics: the copy has its own payload slots but aliases the
/// same child nodes.
pub(crate) fn shallow_clone(node: &NodeRef) -> NodeRef {
    Rc::new(RefCell::new(node.borrow().clone()))
}

/// Fieldless discriminant of a node.
///
/// The variant order is load-bearing: union types (`PipeList`) are
/// canonicalized by sorting alternatives on this ordinal, so any two
/// semantically equal unions render identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum NodeKind {
    Int,
    Float,
    String,
    Bool,
    Id,
    Op,
    PartialOp,
    Empty,
    Any,
    Block,
    List,
    Object,
    Function,
    CommaList,
    PipeList,
    FuncList,
    ForLoop,
    WhileLoop,
    Range,
    IfStatement,
    IfBlock,
    MatchBlock,
    Keyword,
    FuncCall,
    Return,
    Break,
    Continue,
    Copy,
    TypeMarker,
    Token,
}

impl NodeKind {
    /// The kind name used in diagnostics and by the `type` built-in.
    pub fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Id => "id",
            Self::Op => "op",
            Self::PartialOp => "partial_op",
            Self::Empty => "empty",
            Self::Any => "any",
            Self::Block => "block",
            Self::List => "list",
            Self::Object => "object",
            Self::Function => "function",
            Self::CommaList => "comma_list",
            Self::PipeList => "pipe_list",
            Self::FuncList => "func_list",
            Self::ForLoop => "for_loop",
            Self::WhileLoop => "while_loop",
            Self::Range => "range",
            Self::IfStatement => "if_statement",
            Self::IfBlock => "if_block",
            Self::MatchBlock => "match_block",
            Self::Keyword => "keyword",
            Self::FuncCall => "func_call",
            Self::Return => "return",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Copy => "copy",
            Self::TypeMarker => "type",
            Self::Token => "token",
        }
    }
}

/// Operator discriminant carried by `Op` and `PartialOp` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OpKind {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusEq,
    MinusEq,
    EqEq,
    NotEq,
    LtEq,
    GtEq,
    Lt,
    Gt,
    And,
    Or,
    Equal,
    Dot,
    DoubleDot,
    TripleDot,
    DoubleColon,
    Colon,
    Comma,
    Pipe,
    Semicolon,
    Question,
    Exclamation,
    Hash,
    /// The injection operator `>>`.
    Inject,
    /// The function definition operator `=>`.
    Arrow,
    /// Unary plus, rewritten from `Plus` by the parser.
    Pos,
    /// Unary minus, rewritten from `Minus` by the parser.
    Neg,
    /// Logical not, rewritten from `Exclamation` by the parser.
    Not,
}

/// Operator payload: the source symbol plus its resolved kind.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct OpData {
    pub symbol: String,
    pub op: OpKind,
    pub is_binary: bool,
}

impl OpData {
    pub fn new(symbol: impl Into<String>, op: OpKind) -> Self {
        Self {
            symbol: symbol.into(),
            op,
            is_binary: true,
        }
    }
}

/// Bracket and sentinel atoms consumed by the parser passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Sof,
    Eof,
}

/// One property of an object: its value and whether the key is required
/// when the object is used as a structural type.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Property {
    pub required: bool,
    pub value: NodeRef,
}

impl Property {
    pub fn required(value: NodeRef) -> Self {
        Self { required: true, value }
    }

    pub fn optional(value: NodeRef) -> Self {
        Self { required: false, value }
    }
}

/// Function payload.
///
/// `args` mirrors `params` positionally; a `None` slot is a hole awaiting a
/// value. A function with remaining holes after a call is returned as-is,
/// which is what partial application means here. `closure` is the snapshot
/// of the defining scope taken when the function node is evaluated.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FunctionData {
    pub name: String,
    pub params: Vec<NodeRef>,
    pub args: Vec<Option<NodeRef>>,
    pub body: NodeRef,
    pub return_type: Option<NodeRef>,
    pub closure: AHashMap<String, NodeRef>,
    pub default_indices: Vec<usize>,
    /// Marks a predicate usable as a refinement type.
    pub is_type: bool,
}

/// Kind-specific payload of a node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Id {
        name: String,
        annotation: Option<NodeRef>,
    },
    Empty,
    Any,
    /// The `type` kind marker; a value annotated with it becomes a named type.
    TypeMarker,
    Op(OpData),
    PartialOp(OpData),
    /// Deep-copy prefix `#x`; the target sits in `right`.
    Copy,
    List(Vec<NodeRef>),
    CommaList(Vec<NodeRef>),
    PipeList(Vec<NodeRef>),
    FuncList(Vec<NodeRef>),
    Block(Vec<NodeRef>),
    Object {
        properties: IndexMap<String, Property>,
        is_type: bool,
    },
    Function(FunctionData),
    FuncCall {
        name: String,
        caller: Option<NodeRef>,
        args: Vec<NodeRef>,
    },
    IfStatement {
        cond: NodeRef,
        body: NodeRef,
    },
    IfBlock {
        cases: Vec<NodeRef>,
    },
    MatchBlock {
        value: NodeRef,
        cases: Vec<NodeRef>,
    },
    ForLoop {
        init: NodeRef,
        body: NodeRef,
    },
    WhileLoop {
        cond: NodeRef,
        body: NodeRef,
    },
    Range {
        start: i64,
        end: i64,
    },
    /// A control keyword (`ret`, `break`, `continue`); the returned
    /// expression, if any, sits in `right`.
    Keyword(String),
    Return,
    Break,
    Continue,
    Token(TokenKind),
}

impl Payload {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Int(_) => NodeKind::Int,
            Self::Float(_) => NodeKind::Float,
            Self::Bool(_) => NodeKind::Bool,
            Self::Str(_) => NodeKind::String,
            Self::Id { .. } => NodeKind::Id,
            Self::Empty => NodeKind::Empty,
            Self::Any => NodeKind::Any,
            Self::TypeMarker => NodeKind::TypeMarker,
            Self::Op(_) => NodeKind::Op,
            Self::PartialOp(_) => NodeKind::PartialOp,
            Self::Copy => NodeKind::Copy,
            Self::List(_) => NodeKind::List,
            Self::CommaList(_) => NodeKind::CommaList,
            Self::PipeList(_) => NodeKind::PipeList,
            Self::FuncList(_) => NodeKind::FuncList,
            Self::Block(_) => NodeKind::Block,
            Self::Object { .. } => NodeKind::Object,
            Self::Function(_) => NodeKind::Function,
            Self::FuncCall { .. } => NodeKind::FuncCall,
            Self::IfStatement { .. } => NodeKind::IfStatement,
            Self::IfBlock { .. } => NodeKind::IfBlock,
            Self::MatchBlock { .. } => NodeKind::MatchBlock,
            Self::ForLoop { .. } => NodeKind::ForLoop,
            Self::WhileLoop { .. } => NodeKind::WhileLoop,
            Self::Range { .. } => NodeKind::Range,
            Self::Keyword(_) => NodeKind::Keyword,
            Self::Return => NodeKind::Return,
            Self::Break => NodeKind::Break,
            Self::Continue => NodeKind::Continue,
            Self::Token(_) => NodeKind::Token,
        }
    }
}

/// Type metadata attached to every node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TypeMeta {
    /// Whether this node carries a concrete value (`true`) or only stands
    /// for its shape (`false`, the type view).
    pub is_literal: bool,
    /// Declared or inferred type of this value.
    pub allowed_type: Option<NodeRef>,
    /// Nominal tag for typed objects and refinements.
    pub name: String,
    /// Marks a node that stands for a type rather than a value.
    pub is_type: bool,
}

impl Default for TypeMeta {
    fn default() -> Self {
        Self {
            is_literal: true,
            allowed_type: None,
            name: String::new(),
            is_type: false,
        }
    }
}

/// The universal carrier: source syntax, runtime values and types are all
/// nodes. `left`/`right` hold operator operands and unary targets.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Node {
    pub payload: Payload,
    pub line: u32,
    pub column: u32,
    pub left: Option<NodeRef>,
    pub right: Option<NodeRef>,
    pub meta: TypeMeta,
}

impl Node {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            line: 1,
            column: 1,
            left: None,
            right: None,
            meta: TypeMeta::default(),
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn non_literal(mut self) -> Self {
        self.meta.is_literal = false;
        self
    }

    pub fn into_ref(self) -> NodeRef {
        Rc::new(RefCell::new(self))
    }

    pub fn kind(&self) -> NodeKind {
        self.payload.kind()
    }

    /// The operator kind, for `Op` and `PartialOp` payloads.
    pub fn op_kind(&self) -> Option<OpKind> {
        match &self.payload {
            Payload::Op(data) | Payload::PartialOp(data) => Some(data.op),
            _ => None,
        }
    }

    pub fn is_op(&self, op: OpKind) -> bool {
        matches!(&self.payload, Payload::Op(data) if data.op == op)
    }

    pub fn is_token(&self, token: TokenKind) -> bool {
        matches!(self.payload, Payload::Token(t) if t == token)
    }

    pub fn id_name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Id { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.payload {
            Payload::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.payload {
            Payload::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.payload {
            Payload::Str(v) => Some(v),
            _ => None,
        }
    }
}

// -- factory helpers -- //

pub(crate) fn make_int(value: i64, literal: bool) -> Node {
    let mut node = Node::new(Payload::Int(value));
    node.meta.is_literal = literal;
    node
}

pub(crate) fn make_float(value: f64, literal: bool) -> Node {
    let mut node = Node::new(Payload::Float(value));
    node.meta.is_literal = literal;
    node
}

pub(crate) fn make_bool(value: bool, literal: bool) -> Node {
    let mut node = Node::new(Payload::Bool(value));
    node.meta.is_literal = literal;
    node
}

pub(crate) fn make_string(value: impl Into<String>, literal: bool) -> Node {
    let mut node = Node::new(Payload::Str(value.into()));
    node.meta.is_literal = literal;
    node
}

pub(crate) fn make_empty(literal: bool) -> Node {
    let mut node = Node::new(Payload::Empty);
    node.meta.is_literal = literal;
    node
}

pub(crate) fn make_any() -> Node {
    Node::new(Payload::Any).non_literal()
}

pub(crate) fn make_list(nodes: Vec<NodeRef>, literal: bool) -> Node {
    let mut node = Node::new(Payload::List(nodes));
    node.meta.is_literal = literal;
    node
}

pub(crate) fn make_pipe_list(nodes: Vec<NodeRef>) -> Node {
    Node::new(Payload::PipeList(nodes)).non_literal()
}

pub(crate) fn make_func_list(nodes: Vec<NodeRef>) -> Node {
    Node::new(Payload::FuncList(nodes))
}

pub(crate) fn make_object(literal: bool) -> Node {
    let mut node = Node::new(Payload::Object {
        properties: IndexMap::new(),
        is_type: false,
    });
    node.meta.is_literal = literal;
    node
}

// -- parameter shape helpers -- //

/// The binding name of a parameter node.
///
/// Parameters come in three shapes: a plain identifier, `name = default`
/// (an `Equal` op with the identifier on the left) and `...name` (a
/// `TripleDot` op with the identifier on the right).
pub(crate) fn param_name(param: &NodeRef) -> Option<String> {
    let param = param.borrow();
    if let Some(name) = param.id_name() {
        return Some(name.to_owned());
    }
    match param.op_kind() {
        Some(OpKind::Equal) => param.left.as_ref().and_then(|l| l.borrow().id_name().map(str::to_owned)),
        Some(OpKind::TripleDot) => param.right.as_ref().and_then(|r| r.borrow().id_name().map(str::to_owned)),
        _ => None,
    }
}

/// The declared type annotation of a parameter node, unevaluated.
pub(crate) fn param_annotation(param: &NodeRef) -> Option<NodeRef> {
    let target = {
        let p = param.borrow();
        match p.op_kind() {
            Some(OpKind::Equal) => p.left.clone(),
            Some(OpKind::TripleDot) => p.right.clone(),
            _ => None,
        }
    };
    match target {
        Some(id) => id_annotation(&id),
        None => id_annotation(param),
    }
}

fn id_annotation(id: &NodeRef) -> Option<NodeRef> {
    match &id.borrow().payload {
        Payload::Id { annotation, .. } => annotation.clone(),
        _ => None,
    }
}

/// Whether a parameter node is the variadic `...name` form.
pub(crate) fn param_is_variadic(param: &NodeRef) -> bool {
    param.borrow().op_kind() == Some(OpKind::TripleDot)
}

// -- rendering -- //

fn quote_if_string(node: &NodeRef) -> String {
    let n = node.borrow();
    if matches!(n.payload, Payload::Str(_)) && n.meta.is_literal {
        format!("\"{}\"", repr(node))
    } else {
        repr(node)
    }
}

/// Value rendering used in diagnostics and by `to_string`.
///
/// Literal aggregates recurse; type-view nodes render their kind name,
/// except named objects and refinements which render by name.
pub(crate) fn repr(node: &NodeRef) -> String {
    let n = node.borrow();
    match &n.payload {
        Payload::Id { name, .. } => name.clone(),
        Payload::TypeMarker => {
            if n.meta.name.is_empty() {
                "type".to_owned()
            } else {
                n.meta.name.clone()
            }
        }
        Payload::Bool(v) => {
            if !n.meta.is_literal {
                "bool".to_owned()
            } else if *v {
                "true".to_owned()
            } else {
                "false".to_owned()
            }
        }
        Payload::Int(v) => {
            if n.meta.is_literal {
                v.to_string()
            } else {
                "int".to_owned()
            }
        }
        Payload::Float(v) => {
            if n.meta.is_literal {
                format!("{v:.6}")
            } else {
                "float".to_owned()
            }
        }
        Payload::Str(v) => {
            if n.meta.is_literal {
                v.clone()
            } else {
                "string".to_owned()
            }
        }
        Payload::Op(data) => data.symbol.clone(),
        Payload::PartialOp(data) => format!("...{}", data.symbol),
        Payload::Empty => "null".to_owned(),
        Payload::Any => "any".to_owned(),
        Payload::List(items) => {
            if !n.meta.is_literal {
                return "list".to_owned();
            }
            let mut out = String::from("[ ");
            for item in items {
                out.push_str(&quote_if_string(item));
                out.push(' ');
            }
            out.push(']');
            out
        }
        Payload::CommaList(items) => {
            let mut out = String::from("( ");
            for item in items {
                out.push_str(&repr(item));
                out.push(' ');
            }
            out.push(')');
            out
        }
        Payload::PipeList(items) | Payload::FuncList(items) => items
            .iter()
            .map(repr)
            .collect::<Vec<_>>()
            .join(" | "),
        Payload::Object { properties, .. } => {
            if !n.meta.is_literal {
                return "object".to_owned();
            }
            if !n.meta.name.is_empty() {
                return n.meta.name.clone();
            }
            let mut out = String::from("{\n");
            for (key, prop) in properties {
                let _ = writeln!(out, "  {key}: {}", repr(&prop.value));
            }
            out.push('}');
            out
        }
        Payload::Function(func) => {
            if !n.meta.is_literal {
                return "function".to_owned();
            }
            if func.is_type && func.name != "lambda" {
                return func.name.clone();
            }
            function_signature(func)
        }
        Payload::Range { start, end } => format!("({start}, {end})"),
        Payload::Block(_) => "{ block }".to_owned(),
        _ => "<no repr>".to_owned(),
    }
}

/// Like `repr` but collapses literal payloads to their kind.
pub(crate) fn type_repr(node: &NodeRef) -> String {
    let n = node.borrow();
    match &n.payload {
        Payload::Id { name, .. } => name.clone(),
        Payload::Bool(_) => "bool".to_owned(),
        Payload::Int(_) => "int".to_owned(),
        Payload::Float(_) => "float".to_owned(),
        Payload::Str(_) => "string".to_owned(),
        Payload::Op(data) => data.symbol.clone(),
        Payload::PartialOp(data) => format!("_{}_", data.symbol),
        Payload::Empty => "null".to_owned(),
        Payload::Any => "any".to_owned(),
        Payload::List(items) => {
            // Render the element type set, preferring the recorded type.
            let mut types = std::collections::BTreeSet::new();
            let source = n
                .meta
                .allowed_type
                .as_ref()
                .and_then(|t| match &t.borrow().payload {
                    Payload::List(elems) => Some(elems.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| items.clone());
            for elem in &source {
                types.insert(type_repr(elem));
            }
            let mut out = String::from("[ ");
            let count = types.len();
            for (i, t) in types.iter().enumerate() {
                out.push_str(t);
                out.push(' ');
                if i + 1 != count {
                    out.push_str("| ");
                }
            }
            out.push(']');
            out
        }
        Payload::CommaList(_) => "comma_list".to_owned(),
        Payload::PipeList(items) | Payload::FuncList(items) => items
            .iter()
            .map(repr)
            .collect::<Vec<_>>()
            .join(" | "),
        Payload::Object { properties, .. } => {
            if !n.meta.name.is_empty() {
                return n.meta.name.clone();
            }
            let mut out = String::from("{\n");
            for (key, prop) in properties {
                let _ = writeln!(out, "  {key}: {}", repr(&prop.value));
            }
            out.push('}');
            out
        }
        Payload::Function(func) => {
            if func.is_type && func.name != "lambda" {
                return func.name.clone();
            }
            function_signature(func)
        }
        Payload::Range { start, end } => format!("({start}, {end})"),
        Payload::Block(_) => "{ block }".to_owned(),
        _ => "<no repr>".to_owned(),
    }
}

/// Renders `[ p1::T1 p2::T2 ] => R` for a function.
fn function_signature(func: &FunctionData) -> String {
    let mut out = String::from("[ ");
    for param in &func.params {
        let name = param_name(param).unwrap_or_default();
        let prefix = if param_is_variadic(param) { "..." } else { "" };
        let annotation = param_annotation_repr(param);
        let _ = write!(out, "{prefix}{name}::{annotation} ");
    }
    out.push_str("] => ");
    match &func.return_type {
        Some(ret) => out.push_str(&type_repr(ret)),
        None => out.push_str("any"),
    }
    out
}

fn param_annotation_repr(param: &NodeRef) -> String {
    match param_annotation(param) {
        Some(t) => repr(&t),
        None => "any".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_ref(v: i64) -> NodeRef {
        make_int(v, true).into_ref()
    }

    #[test]
    fn literal_reprs() {
        assert_eq!(repr(&int_ref(7)), "7");
        assert_eq!(repr(&make_float(2.5, true).into_ref()), "2.500000");
        assert_eq!(repr(&make_bool(true, true).into_ref()), "true");
        assert_eq!(repr(&make_string("hi", true).into_ref()), "hi");
        assert_eq!(repr(&make_empty(true).into_ref()), "null");
    }

    #[test]
    fn type_view_reprs() {
        assert_eq!(repr(&make_int(0, false).into_ref()), "int");
        assert_eq!(repr(&make_string("", false).into_ref()), "string");
        assert_eq!(repr(&make_list(vec![], false).into_ref()), "list");
    }

    #[test]
    fn list_repr_quotes_strings() {
        let list = make_list(vec![int_ref(1), make_string("a", true).into_ref()], true).into_ref();
        assert_eq!(repr(&list), "[ 1 \"a\" ]");
    }

    #[test]
    fn pipe_list_repr_joins_alternatives() {
        let union = make_pipe_list(vec![make_int(0, false).into_ref(), make_string("", false).into_ref()]).into_ref();
        assert_eq!(repr(&union), "int | string");
    }

    #[test]
    fn shallow_clone_shares_children() {
        let child = int_ref(1);
        let list = make_list(vec![child.clone()], true).into_ref();
        let copy = shallow_clone(&list);
        child.borrow_mut().payload = Payload::Int(2);
        let Payload::List(items) = &copy.borrow().payload else {
            panic!("expected list");
        };
        assert_eq!(items[0].borrow().as_int(), Some(2));
    }

    #[test]
    fn kind_ordering_is_stable() {
        assert!(NodeKind::Int < NodeKind::Float);
        assert!(NodeKind::Bool < NodeKind::List);
        assert!(NodeKind::List < NodeKind::Object);
    }
}
