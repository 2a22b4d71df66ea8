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

#[test]
fn write_append_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    let path = path.display();
    let source = format!("write(\"{path}\", \"hello\")\nappend(\"{path}\", \" world\")\nprint(read(\"{path}\"))");
    assert_eq!(run(&source), "hello world");
}

#[test]
fn write_truncates_existing_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");
    std::fs::write(&path, "old").unwrap();
    let path = path.display();
    assert_eq!(run(&format!("write(\"{path}\", \"new\")\nprint(read(\"{path}\"))")), "new");
}

#[test]
fn reading_a_missing_file_fails() {
    let err = run_err("print(read(\"definitely/not/here.txt\"))");
    assert!(err.contains("Unable to read file"), "{err}");
}

#[test]
fn imports_expose_module_bindings() {
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("lib.gl");
    std::fs::write(&module, "value = 42\nsum2 = [a::int b::int] => a + b\n").unwrap();
    let module = module.display();
    let source = format!("m = import(\"{module}\")\nprint(m.value)\nprint(m.sum2(1, 2))");
    assert_eq!(run(&source), "423");
}

#[test]
fn imports_exclude_builtin_names() {
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("lib.gl");
    std::fs::write(&module, "only = 1\n").unwrap();
    let module = module.display();
    // the bootstrap's own bindings (print, range, ...) must not leak into
    // the export object
    let source = format!("m = import(\"{module}\")\nprint(m._keys)");
    assert_eq!(run(&source), "[ \"only\" ]");
}

#[test]
fn failing_modules_surface_as_import_errors() {
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("broken.gl");
    std::fs::write(&module, "q\n").unwrap();
    let module = module.display();
    let err = run_err(&format!("m = import(\"{module}\")"));
    assert!(err.starts_with("ImportError"), "{err}");
    assert!(err.contains("Undefined variable 'q'"), "{err}");
}

#[test]
fn module_prints_reach_the_callers_writer() {
    let dir = tempfile::tempdir().unwrap();
    let module = dir.path().join("noisy.gl");
    std::fs::write(&module, "print(\"from module\")\n").unwrap();
    let module = module.display();
    assert_eq!(run(&format!("m = import(\"{module}\")")), "from module");
}
