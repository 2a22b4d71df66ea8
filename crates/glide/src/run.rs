//! Public interface for running Glide code, and the pipeline plumbing the
//! built-ins bootstrap and `import` recurse through.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    check::Typechecker,
    error::{ErrorKind, GlideError, RunError, RunResult},
    eval::Evaluator,
    io::{NoPrint, PrintWriter, StdPrint},
    lexer::Lexer,
    node::{NodeRef, Property, make_object},
    parser::Parser,
    scope::Scope,
};

/// Maximum supported call nesting. The tree walker recurses on the native
/// stack, so the interpreter enforces an explicit bound and reports a
/// RuntimeError instead of overflowing; the bound is sized to stay within
/// a 2 MiB thread stack.
pub const MAX_CALL_DEPTH: usize = 300;

/// The bootstrap source compiled into the crate; `glide.json` can point at
/// a replacement file.
pub const DEFAULT_BUILTINS: &str = include_str!("../../../builtins/builtins.gl");
pub const DEFAULT_BUILTINS_NAME: &str = "builtins/builtins.gl";

/// State shared by every walker in one run: the bootstrap source, the
/// names it defines (excluded from imports) and the call-depth counter.
pub(crate) struct Session {
    pub builtins_source: String,
    pub builtins_name: String,
    pub builtins_names: RefCell<Vec<String>>,
    depth: Cell<usize>,
}

impl Session {
    pub fn new(builtins_source: String, builtins_name: String) -> Rc<Self> {
        Rc::new(Self {
            builtins_source,
            builtins_name,
            builtins_names: RefCell::new(Vec::new()),
            depth: Cell::new(0),
        })
    }

    pub fn enter_call(&self) -> Result<(), ()> {
        let depth = self.depth.get();
        if depth >= MAX_CALL_DEPTH {
            return Err(());
        }
        self.depth.set(depth + 1);
        Ok(())
    }

    pub fn leave_call(&self) {
        let depth = self.depth.get();
        self.depth.set(depth.saturating_sub(1));
    }
}

/// Lex + parse one source text.
pub(crate) fn parse_source(file_name: &str, source: &str) -> RunResult<Vec<NodeRef>> {
    let atoms = Lexer::new(file_name, source).tokenize()?;
    Parser::new(file_name, atoms).parse()
}

/// Runs the bootstrap through both walkers, populating the given scopes
/// and recording the built-in name list on the session.
fn load_builtins(
    session: &Rc<Session>,
    check_scope: &Scope,
    eval_scope: &Scope,
    out: &mut dyn PrintWriter,
) -> RunResult<()> {
    let name = session.builtins_name.clone();
    let source = session.builtins_source.clone();
    let ast = parse_source(&name, &source)?;

    let mut checker = Typechecker::new(&name, check_scope.clone(), session.clone());
    checker.check(&ast)?;

    let mut evaluator = Evaluator::new(&name, eval_scope.clone(), session.clone(), out);
    evaluator.evaluate(&ast)?;

    let mut names = eval_scope.local_names();
    names.extend(crate::builtins::Builtin::host_names());
    names.sort();
    names.dedup();
    *session.builtins_names.borrow_mut() = names;
    Ok(())
}

/// Primary interface for running Glide code.
///
/// # Example
/// ```
/// use glide::{CollectStringPrint, Runner};
///
/// let runner = Runner::new("print(1 + 2 * 3)".to_owned(), "example.gl");
/// let mut out = CollectStringPrint::new();
/// runner.run(&mut out).unwrap();
/// assert_eq!(out.output(), "7");
/// ```
pub struct Runner {
    code: String,
    file_name: String,
    builtins_source: String,
    builtins_name: String,
}

impl Runner {
    /// Creates a runner over the given source, using the compiled-in
    /// bootstrap.
    #[must_use]
    pub fn new(code: String, file_name: &str) -> Self {
        Self {
            code,
            file_name: file_name.to_owned(),
            builtins_source: DEFAULT_BUILTINS.to_owned(),
            builtins_name: DEFAULT_BUILTINS_NAME.to_owned(),
        }
    }

    /// Replaces the bootstrap source (what `glide.json` selects).
    #[must_use]
    pub fn with_builtins(mut self, source: String, name: &str) -> Self {
        self.builtins_source = source;
        self.builtins_name = name.to_owned();
        self
    }

    /// Returns the code this runner was built over.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Lex, parse, type-check, evaluate. Output from `print` goes to
    /// `out`; the first failure of any phase is returned.
    pub fn run(&self, out: &mut impl PrintWriter) -> RunResult<()> {
        let session = Session::new(self.builtins_source.clone(), self.builtins_name.clone());
        let ast = parse_source(&self.file_name, &self.code)?;

        let check_scope = Scope::new();
        let eval_scope = Scope::new();
        load_builtins(&session, &check_scope, &eval_scope, out)?;

        let mut checker = Typechecker::new(&self.file_name, check_scope, session.clone());
        checker.check(&ast)?;

        let mut evaluator = Evaluator::new(&self.file_name, eval_scope, session, out);
        evaluator.evaluate(&ast)
    }

    /// Runs to completion, printing to stdout.
    pub fn run_stdout(&self) -> RunResult<()> {
        self.run(&mut StdPrint)
    }

    /// Skips the checker; used by tests probing pure runtime behavior.
    pub fn run_unchecked(&self, out: &mut impl PrintWriter) -> RunResult<()> {
        let session = Session::new(self.builtins_source.clone(), self.builtins_name.clone());
        let ast = parse_source(&self.file_name, &self.code)?;

        let check_scope = Scope::new();
        let eval_scope = Scope::new();
        load_builtins(&session, &check_scope, &eval_scope, out)?;

        let mut evaluator = Evaluator::new(&self.file_name, eval_scope, session, out);
        evaluator.evaluate(&ast)
    }
}

fn wrap_import_error(chain: smallvec::SmallVec<[String; 4]>, line: u32, column: u32, err: RunError) -> RunError {
    match err {
        RunError::Exit(code) => RunError::Exit(code),
        RunError::Fatal(inner) => {
            // the inner report keeps its own location; the outer frame
            // records where the import happened
            GlideError::new(ErrorKind::ImportError, chain, line, column, inner.to_string()).into()
        }
    }
}

/// Reads all top-level bindings of `scope` that the bootstrap did not
/// define into an export object.
fn exports_of(scope: &Scope, builtins_names: &[String]) -> NodeRef {
    let object = make_object(true).into_ref();
    if let crate::node::Payload::Object { properties, .. } = &mut object.borrow_mut().payload {
        let mut names = scope.local_names();
        names.sort();
        for name in names {
            if builtins_names.contains(&name) {
                continue;
            }
            if let Some(value) = scope.get(&name) {
                properties.insert(name, Property::required(value));
            }
        }
    }
    object
}

/// `import(path)` at run time: the full pipeline over another file with
/// the same bootstrap, exporting its top-level bindings.
pub(crate) fn import_module(ev: &mut Evaluator<'_>, path: &str) -> RunResult<NodeRef> {
    let chain = ev.file_chain.clone();
    let (line, column) = (ev.line, ev.column);

    let source = std::fs::read_to_string(path).map_err(|err| {
        ev.error(ErrorKind::ImportError, format!("Unable to read import '{path}': {err}"))
    })?;

    let session = Session::new(ev.session.builtins_source.clone(), ev.session.builtins_name.clone());
    let result = (|| {
        let ast = parse_source(path, &source)?;
        let check_scope = Scope::new();
        let eval_scope = Scope::new();
        load_builtins(&session, &check_scope, &eval_scope, &mut NoPrint)?;

        let mut checker = Typechecker::new(path, check_scope, session.clone());
        checker.check(&ast)?;

        let mut evaluator = Evaluator::new(path, eval_scope.clone(), session.clone(), &mut *ev.out);
        evaluator.evaluate(&ast)?;
        Ok(eval_scope)
    })();

    match result {
        Ok(eval_scope) => Ok(exports_of(&eval_scope, &session.builtins_names.borrow())),
        Err(err) => Err(wrap_import_error(chain, line, column, err)),
    }
}

/// `import(path)` at check time: the imported file is checked and run (so
/// its exported symbols carry values the checker can type), silently.
pub(crate) fn import_module_for_check(tc: &mut Typechecker, path: &str) -> RunResult<NodeRef> {
    let chain = tc.file_chain.clone();
    let (line, column) = (tc.line, tc.column);

    let source = std::fs::read_to_string(path).map_err(|err| {
        tc.error(ErrorKind::ImportError, format!("Unable to read import '{path}': {err}"))
    })?;

    let session = Session::new(tc.session.builtins_source.clone(), tc.session.builtins_name.clone());
    let result = (|| {
        let ast = parse_source(path, &source)?;
        let check_scope = Scope::new();
        let eval_scope = Scope::new();
        load_builtins(&session, &check_scope, &eval_scope, &mut NoPrint)?;

        let mut checker = Typechecker::new(path, check_scope.clone(), session.clone());
        checker.check(&ast)?;
        Ok(check_scope)
    })();

    match result {
        Ok(check_scope) => Ok(exports_of(&check_scope, &session.builtins_names.borrow())),
        Err(err) => Err(wrap_import_error(chain, line, column, err)),
    }
}
