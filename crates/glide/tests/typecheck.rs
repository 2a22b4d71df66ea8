use glide::{CollectStringPrint, Runner};
use pretty_assertions::assert_eq;

fn run(source: &str) -> String {
    let runner = Runner::new(source.to_owned(), "test.gl");
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).unwrap_or_else(|err| panic!("unexpected failure: {err}"));
    out.into_output()
}

fn run_err(source: &str) -> String {
    let runner = Runner::new(source.to_owned(), "test.gl");
    let mut out = CollectStringPrint::new();
    runner.run(&mut out).expect_err("expected a failure").to_string()
}

// -- annotations -- //

#[test]
fn annotated_bindings_enforce_their_types() {
    assert_eq!(run("x::int = 1\nx = 2\nprint(x)"), "2");
    let err = run_err("x::int = 1\nx = \"s\"");
    assert!(err.contains("TypeError"), "{err}");
    assert!(err.contains("Cannot assign value"), "{err}");
}

#[test]
fn union_annotations_accept_every_alternative() {
    assert_eq!(run("x::(int | string) = 1\nx = \"s\"\nprint(x)"), "s");
    let err = run_err("x::(int | string) = 1\nx = true");
    assert!(err.contains("TypeError"), "{err}");
}

#[test]
fn re_annotation_is_forbidden() {
    let err = run_err("x = 1\nx::string = \"s\"");
    assert!(err.contains("Cannot re-assign type of variable 'x'"), "{err}");
}

#[test]
fn list_element_annotations_guard_append() {
    let err = run_err("xs::[int] = [1]\nxs.append(\"s\")");
    assert!(err.contains("Cannot append element of type 'string'"), "{err}");
}

// -- named object types -- //

#[test]
fn named_object_types_check_structurally() {
    let source = "Point::type = { x: int, y: int }\np::Point = { x: 1, y: 2 }\nprint(p.x + p.y)";
    assert_eq!(run(source), "3");
}

#[test]
fn named_object_types_reject_bad_shapes() {
    let err = run_err("Point::type = { x: int, y: int }\np::Point = { x: 1 }");
    assert!(err.contains("TypeError"), "{err}");
}

#[test]
fn optional_properties_may_be_absent() {
    let source = "Conf::type = { host: string, port?: int }\nc::Conf = { host: \"localhost\" }\nprint(c.host)";
    assert_eq!(run(source), "localhost");
}

// -- overloads -- //

#[test]
fn multiple_dispatch_picks_by_argument_shape() {
    let source = "speak = [x::int] => \"int\"\nspeak = [x::string] => \"string\"\nprint(speak(1))\nprint(speak(\"a\"))";
    assert_eq!(run(source), "intstring");
}

#[test]
fn widest_overload_comes_last() {
    let source = "f = [x::int] => \"i\"\nf = [x] => \"w\"\nprint(f(1))\nprint(f(\"a\"))";
    assert_eq!(run(source), "iw");
}

#[test]
fn unresolvable_calls_are_reported() {
    let err = run_err("h = [a::int] => a\nh = [a::string] => a\nx = h(true)");
    assert!(err.contains("Cannot find matching function definition"), "{err}");
}

#[test]
fn ambiguous_partial_applications_are_reported() {
    let err = run_err("g = [a b] => a\ng = [a c] => a\nx = g(1)");
    assert!(err.contains("Ambiguous function call"), "{err}");
}

// -- refinements -- //

#[test]
fn refinement_shape_mismatch_fails_at_check_time() {
    let err = run_err("Positive = [x::int] => x > 0\ny::Positive = \"s\"");
    assert!(err.contains("TypeError"), "{err}");
}

#[test]
fn refinement_message_blocks_decorate_failures() {
    let source = "Small = [x::int] => {\n    { \"must be below ten\" }\n    ret x < 10\n}\ny::Small = 42";
    let err = run_err(source);
    assert!(err.contains("Small"), "{err}");
    assert!(err.contains("must be below ten"), "{err}");
}

// -- narrowing -- //

#[test]
fn typeof_guards_narrow_union_parameters() {
    let source = "f = [x::(int | string)] => {\n    if (typeof(x) == \"string\") {\n        ret \"s\"\n    }\n    ret \"i\"\n}\nprint(f(1))\nprint(f(\"a\"))";
    assert_eq!(run(source), "is");
}

#[test]
fn impossible_narrowing_is_an_error() {
    let source = "g = [x::int] => {\n    if (typeof(x) == \"string\") { ret 1 }\n    ret 2\n}";
    let err = run_err(source);
    assert!(err.contains("can only be of type"), "{err}");
}

// -- return inference -- //

#[test]
fn declared_return_types_are_checked() {
    assert_eq!(run("f = [x::int]::int => x + 1\nprint(f(2))"), "3");
    let err = run_err("f = [x::int]::int => \"s\"");
    assert!(err.contains("expects to return a value of type"), "{err}");
}

#[test]
fn match_exhaustiveness_over_unions() {
    let err = run_err("f = [x::(int | string)] => match (x) { 0: \"zero\" }\ny = f(1)");
    assert!(err.contains("Missing match case"), "{err}");
}

#[test]
fn match_exhaustiveness_over_booleans() {
    let source = "f = [b::bool] => match (b) { true: 1; false: 0 }\nprint(f(true))";
    assert_eq!(run(source), "1");
    let err = run_err("f = [b::bool] => match (b) { true: 1 }\ny = f(true)");
    assert!(err.contains("Missing match case"), "{err}");
}

#[test]
fn match_on_lists_requires_an_empty_case() {
    let err = run_err("f = [xs::list] => match (xs) { [x]: x }\ny = f([1])");
    assert!(err.contains("Missing empty case for type 'list'"), "{err}");
}

// -- operators -- //

#[test]
fn unsupported_operand_pairs_fail_early() {
    let err = run_err("z = [1] - 2");
    assert!(err.contains("TypeError"), "{err}");
    assert!(err.contains("Cannot perform"), "{err}");
}

#[test]
fn conditionals_must_be_boolean() {
    let err = run_err("if (1) { print(1) }");
    assert!(err.contains("If statement expects a boolean conditional"), "{err}");
}

#[test]
fn casts_must_be_plausible() {
    let err = run_err("x = to_int([1])");
    assert!(err.contains("Unable to cast"), "{err}");
}
