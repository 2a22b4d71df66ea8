use glide::{CollectStringPrint, RunError, Runner};

fn run_err(source: &str) -> RunError {
    let runner = Runner::new(source.to_owned(), "test.gl");
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).expect_err("expected a failure")
}

#[test]
fn reports_are_single_line_with_location() {
    let err = run_err("z = [1] - 2").to_string();
    assert!(err.starts_with("TypeError in 'test.gl' @ (1,"), "{err}");
    assert!(!err.trim().contains('\n'), "{err}");
}

#[test]
fn reports_carry_the_function_chain() {
    let err = run_err("f = [] => { q }\nf()").to_string();
    assert!(err.contains("in 'test.gl/f'"), "{err}");
    assert!(err.contains("Undefined variable 'q'"), "{err}");
}

#[test]
fn reports_point_at_the_failing_line() {
    let err = run_err("x = 1\ny = 2\nz = [1] - 2").to_string();
    assert!(err.contains("@ (3,"), "{err}");
}

#[test]
fn undefined_variables_are_runtime_errors() {
    let err = run_err("print(q)").to_string();
    assert!(err.starts_with("RuntimeError"), "{err}");
}

#[test]
fn unbalanced_brackets_are_syntax_errors() {
    let err = run_err("x = (1").to_string();
    assert!(err.starts_with("SyntaxError"), "{err}");
    assert!(err.contains("Missing ')'"), "{err}");

    let err = run_err("x = 1 + 2)").to_string();
    assert!(err.starts_with("SyntaxError"), "{err}");
    assert!(err.contains("Dangling"), "{err}");
}

#[test]
fn exit_unwinds_with_its_status() {
    let err = run_err("exit(3)");
    assert!(matches!(err, RunError::Exit(3)));
    assert_eq!(err.exit_code(), 3);

    let err = run_err("exit(300)");
    assert_eq!(err.exit_code(), 44);
}

#[test]
fn exit_stops_later_statements() {
    let runner = Runner::new("print(1)\nexit(0)\nprint(2)".to_owned(), "test.gl");
    let mut out = CollectStringPrint::new();
    let err = runner.run(&mut out).expect_err("expected exit");
    assert_eq!(err.exit_code(), 0);
    assert_eq!(out.output(), "1");
}

#[test]
fn the_error_builtin_aborts_with_its_tag() {
    let err = run_err("error(\"ConfigError\", \"missing key\")").to_string();
    assert!(err.starts_with("RuntimeError"), "{err}");
    assert!(err.contains("[ConfigError] missing key"), "{err}");
}

#[test]
fn runaway_recursion_is_bounded() {
    let err = run_err("loop = [n::int] => loop(n + 1)\nloop(0)").to_string();
    assert!(err.contains("Maximum call depth"), "{err}");
}

#[test]
fn import_failures_are_import_errors() {
    let err = run_err("m = import(\"no/such/module.gl\")").to_string();
    assert!(err.starts_with("ImportError"), "{err}");
}
