use glide::{CollectStringPrint, Runner};
use pretty_assertions::assert_eq;

fn run(source: &str) -> String {
    let runner = Runner::new(source.to_owned(), "test.gl");
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap_or_else(|err| panic!("unexpected failure: {err}"));
    out.into_output()
}

fn run_err(source: &str) -> (String, String) {
    let runner = Runner::new(source.to_owned(), "test.gl");
    let mut out = CollectStringPrint::new();
    let err = runner.run(&mut out).expect_err("expected a failure");
    (err.to_string(), out.into_output())
}

#[test]
fn arithmetic_precedence_prints_seven() {
    assert_eq!(run("x = 1 + 2 * 3\nprint(x)"), "7");
}

#[test]
fn typed_dispatch_accepts_matching_arguments() {
    let source = "f = [x::int y::int] => x + y\nprint(f(2, 3))";
    assert_eq!(run(source), "5");
}

#[test]
fn typed_dispatch_rejects_mismatched_arguments() {
    // the checker rejects the call before anything runs
    let source = "f = [x::int y::int] => x + y\nprint(f(2, 3))\nprint(f(\"a\", \"b\"))";
    let (err, out) = run_err(source);
    assert!(err.contains("ArgTypeError"), "{err}");
    assert!(err.contains("'f'"), "{err}");
    assert_eq!(out, "");
}

#[test]
fn filter_then_map_pipeline() {
    let source = "ls = [1, 2, 3, 4]\nprint(ls.filter([x] => x % 2 == 0).map([x] => x * x) == [4, 16])";
    assert_eq!(run(source), "true");
}

#[test]
fn refinement_type_rejects_at_assignment() {
    let source = "Positive = [x::int] => x > 0\ny::Positive = -3";
    let (err, _) = run_err(source);
    assert!(err.contains("TypeError"), "{err}");
    assert!(err.contains("Positive"), "{err}");
}

#[test]
fn refinement_type_accepts_satisfying_values() {
    let source = "Positive = [x::int] => x > 0\ny::Positive = 3\nprint(y)";
    assert_eq!(run(source), "3");
}

#[test]
fn object_methods_mutate_through_this() {
    let source = "counter = { n: 0, inc: [] => { this.n = this.n + 1 } }\ncounter.inc()\ncounter.inc()\nprint(counter.n)";
    assert_eq!(run(source), "2");
}

#[test]
fn match_ranges_classify_values() {
    let source = "classify = [v] => match (v) { 0..10: \"low\"; 10..100: \"mid\"; _: \"hi\" }\nprint(classify(42))\nprint(classify(7))\nprint(classify(500))";
    assert_eq!(run(source), "midlowhi");
}

#[test]
fn closures_capture_enclosing_parameters() {
    let source = "f = [x] => { [y] => x + y }\ng = f(10)\nprint(g(5))";
    assert_eq!(run(source), "15");
}

#[test]
fn closures_survive_their_definers() {
    // g stays valid after f's call frame is gone and f is rebound
    let source = "f = [x] => { [y] => x + y }\ng = f(10)\nf = 0\nprint(g(5))";
    assert_eq!(run(source), "15");
}

#[test]
fn repr_round_trips_for_literals() {
    assert_eq!(run("print(to_string(42))"), "42");
    assert_eq!(run("print(to_string(true))"), "true");
    assert_eq!(run("print(to_string(null))"), "null");
    assert_eq!(run("print(to_string(2.5))"), "2.500000");
    // and feeding the rendering back through the pipeline re-yields the value
    assert_eq!(run("print(42)"), "42");
    assert_eq!(run("print(2.500000)"), "2.500000");
}

#[test]
fn runtime_dispatch_aborts_between_statements() {
    // with the checker skipped, the evaluator runs the first call and
    // traps the second at argument binding
    let source = "f = [x::int y::int] => x + y\nprint(f(2, 3))\nprint(f(\"a\", \"b\"))";
    let runner = Runner::new(source.to_owned(), "test.gl");
    let mut out = CollectStringPrint::new();
    let err = runner.run_unchecked(&mut out).expect_err("expected a failure");
    assert!(err.to_string().contains("ArgTypeError"), "{err}");
    assert_eq!(out.output(), "5");
}

#[test]
fn checker_runs_before_the_evaluator() {
    // the first statement would print, but the second fails the checker,
    // so nothing runs at all
    let (err, out) = run_err("print(1)\nx = [1] - 2");
    assert!(err.contains("TypeError"), "{err}");
    assert_eq!(out, "");
}
