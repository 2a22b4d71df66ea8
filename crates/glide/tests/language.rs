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

// -- operators -- //

#[test]
fn numeric_cross_products() {
    assert_eq!(run("print(2 + true)"), "3");
    assert_eq!(run("print(2.5 + 1)"), "3.500000");
    assert_eq!(run("print(7 % 3)"), "1");
    assert_eq!(run("print(1 / 2)"), "0.500000");
    assert_eq!(run("print(2 * 3 - 4)"), "2");
}

#[test]
fn null_is_the_identity_operand() {
    assert_eq!(run("print(null + 5)"), "5");
    assert_eq!(run("print(5 * null)"), "5");
}

#[test]
fn string_concatenation_and_repetition() {
    assert_eq!(run("print(\"a\" + \"b\")"), "ab");
    assert_eq!(run("print(\"n=\" + 3)"), "n=3");
    assert_eq!(run("print(\"ab\" * 3)"), "ababab");
}

#[test]
fn comparisons_and_logic() {
    assert_eq!(run("print(1 < 2)"), "true");
    assert_eq!(run("print(\"abc\" < \"abd\")"), "true");
    assert_eq!(run("print(1 == 1.0)"), "true");
    assert_eq!(run("print(1 == \"1\")"), "false");
    assert_eq!(run("print(true && false)"), "false");
    assert_eq!(run("print(false || true)"), "true");
    assert_eq!(run("print(!false)"), "true");
}

#[test]
fn logic_short_circuits_on_the_left() {
    // the right side would be a runtime failure if evaluated
    let source = "safe = [xs::list] => xs.empty || xs.first == 0\nprint(safe([]))";
    assert_eq!(run(source), "true");
}

#[test]
fn unary_minus_reverses_sequences() {
    assert_eq!(run("print(-\"abc\")"), "cba");
    assert_eq!(run("print(-[1, 2, 3])"), "[ 3 2 1 ]");
    assert_eq!(run("print(-(5))"), "-5");
}

#[test]
fn compound_assignment() {
    assert_eq!(run("x = 1\nx += 4\nx -= 2\nprint(x)"), "3");
}

#[test]
fn range_operator_materializes_lists() {
    assert_eq!(run("print(1..5)"), "[ 1 2 3 4 ]");
    assert_eq!(run("print(5..1)"), "[ 5 4 3 2 ]");
}

#[test]
fn copy_operator_is_deep() {
    let source = "xs = [[1], [2]]\nys = #xs\nys[0].append(9)\nprint(xs[0].length)\nprint(ys[0].length)";
    assert_eq!(run(source), "12");
}

// -- bindings -- //

#[test]
fn computed_binding_names() {
    assert_eq!(run("[\"answer\"] = 7\nprint(answer)"), "7");
}

#[test]
fn delete_removes_bindings() {
    assert_eq!(run("x = 1\ndelete(x)\nx = \"again\"\nprint(x)"), "again");
    let err = run_err("x = 1\ndelete(x)\nprint(x)");
    assert!(err.contains("Undefined variable 'x'"), "{err}");
}

#[test]
fn aliases_observe_in_place_mutation() {
    let source = "xs = [1, 2]\ngrow = [] => { xs.append(99) }\ngrow()\nprint(xs.length)";
    assert_eq!(run(source), "3");
}

// -- control flow -- //

#[test]
fn while_loops_accumulate() {
    let source = "i = 0\ntotal = 0\nwhile (i < 5) { total = total + i; i = i + 1 }\nprint(total)";
    assert_eq!(run(source), "10");
}

#[test]
fn for_loops_over_ranges_and_lists() {
    assert_eq!(
        run("total = 0\nfor [range(0, 5), i] { total = total + i }\nprint(total)"),
        "10"
    );
    assert_eq!(
        run("xs = [10, 20, 30]\ntotal = 0\nfor [xs, i, x] { total = total + x + i }\nprint(total)"),
        "63"
    );
}

#[test]
fn break_and_continue_unwind_correctly() {
    let source = "total = 0\nfor [range(0, 10), i] {\n    if (i == 3) { continue }\n    if (i == 5) { break }\n    total = total + i\n}\nprint(total)";
    assert_eq!(run(source), "7");
}

#[test]
fn return_escapes_loops_inside_functions() {
    let source = "find = [xs::list] => {\n    for [xs, i, x] {\n        if (x > 10) { ret x }\n    }\n    ret -1\n}\nprint(find([1, 22, 3]))\nprint(find([1, 2]))";
    assert_eq!(run(source), "22-1");
}

#[test]
fn if_block_selects_first_true_guard() {
    let source = "grade = [score::int] => if { score > 89: \"A\"; score > 79: \"B\"; else: \"C\" }\nprint(grade(95))\nprint(grade(80))\nprint(grade(10))";
    assert_eq!(run(source), "ABC");
}

// -- collections -- //

#[test]
fn list_properties_and_mutators() {
    let source = "xs = [1, 2, 3]\nprint(xs.length)\nprint(xs.first)\nprint(xs.last)\nprint(xs.empty)\nxs.append(4)\nxs.prepend(0)\nprint(xs)";
    assert_eq!(run(source), "313false[ 0 1 2 3 4 ]");
}

#[test]
fn list_insert_remove_clear_subsection() {
    let source = "xs = [1, 2, 4]\nxs.insert(2, 3)\nprint(xs)\nxs.remove(0)\nprint(xs)\nprint(xs.subsection(1, 3))\nxs.clear()\nprint(xs.empty)";
    assert_eq!(run(source), "[ 1 2 3 4 ][ 2 3 4 ][ 3 4 ]true");
}

#[test]
fn list_sort_and_flatten() {
    assert_eq!(run("print([3, 1, 2].sort())"), "[ 1 2 3 ]");
    assert_eq!(run("print([[1, 2], [3]].flatten())"), "[ 1 2 3 ]");
    assert_eq!(run("print([[1, [2]], [3]].flatten(true))"), "[ 1 2 3 ]");
}

#[test]
fn callbacks_receive_index_and_collection() {
    assert_eq!(run("print([10, 20].map([x i] => x + i))"), "[ 10 21 ]");
    assert_eq!(run("print([10, 20].map([x i self] => self.length))"), "[ 2 2 ]");
    assert_eq!(run("print([1, 2, 3].flatmap([x] => [x, x]))"), "[ 1 1 2 2 3 3 ]");
}

#[test]
fn partial_operators_drive_collection_callbacks() {
    assert_eq!(run("print([1, 2, 3].map(_ * 2))"), "[ 2 4 6 ]");
    assert_eq!(run("print([1, 2, 3, 4].filter(_ > 2))"), "[ 3 4 ]");
}

#[test]
fn list_indexing_and_element_assignment() {
    assert_eq!(run("xs = [1, 2, 3]\nprint(xs[1])"), "2");
    assert_eq!(run("xs = [1, 2, 3]\nxs[1] = 9\nprint(xs)"), "[ 1 9 3 ]");
    let err = run_err("xs = [1]\nprint(xs[5])");
    assert!(err.contains("List index out of range"), "{err}");
}

#[test]
fn string_properties_and_methods() {
    let source = "s = \"Hello World\"\nprint(s.length)\nprint(s.first)\nprint(s.last)\nprint(s.lower())\nprint(s.upper())";
    assert_eq!(run(source), "11Hdhello worldHELLO WORLD");
    assert_eq!(run("print(\"abc\".is_alpha)\nprint(\"12\".is_digit)"), "truetrue");
    assert_eq!(run("print(\"  pad  \".trim())"), "pad");
    assert_eq!(run("print(\"a,b,c\".split(\",\"))"), "[ \"a\" \"b\" \"c\" ]");
    assert_eq!(run("print(\"abc\".chars().length)"), "3");
    assert_eq!(run("print(\"abcabc\".replace(\"b\", \"x\"))"), "axcabc");
    assert_eq!(run("print(\"abcabc\".replace_all(\"b\", \"x\"))"), "axcaxc");
    assert_eq!(run("print(\"abcdef\".subsection(1, 4))"), "bcd");
    assert_eq!(run("print(\"abc\"[1])"), "b");
}

#[test]
fn object_properties_and_methods() {
    let source = "o = { a: 1, b: 2 }\nprint(o.a)\nprint(o[\"b\"])\nprint(o.missing)\no.add(\"c\", 3)\nprint(o._keys.length)\no.delete(\"a\")\nprint(o._keys.length)";
    assert_eq!(run(source), "12null32");
}

#[test]
fn object_items_expose_pairs() {
    let source = "o = { a: 1 }\nitem = o._items[0]\nprint(item.key)\nprint(item.value)";
    assert_eq!(run(source), "a1");
}

#[test]
fn object_merge_with_plus() {
    let source = "a = { x: 1 }\nb = { y: 2 }\nc = a + b\nprint(c.x)\nprint(c.y)";
    assert_eq!(run(source), "12");
}

// -- functions -- //

#[test]
fn variadic_parameters_collect_a_list() {
    assert_eq!(run("count = [...nums] => nums.length\nprint(count(1, 2, 3))"), "3");
}

#[test]
fn default_parameters_fill_missing_arguments() {
    let source = "f = [x y = 10] => x + y\nprint(f(5))\nprint(f(5, 1))";
    assert_eq!(run(source), "156");
}

#[test]
fn keyword_arguments_bind_by_name() {
    assert_eq!(run("f = [a b] => a - b\nprint(f(b: 1, a: 10))"), "9");
}

#[test]
fn partial_application_returns_the_function() {
    let source = "add = [a b] => a + b\nadd1 = add(1)\nprint(add1(5))\nprint(add1(10))";
    assert_eq!(run(source), "611");
}

#[test]
fn function_introspection() {
    let source = "f = [a b = 2] => a + b\nprint(f.name)\nprint(f.params)";
    assert_eq!(run(source), "f[ \"a\" \"b\" ]");
}

#[test]
fn patch_appends_to_a_function_body() {
    let source = "f = [x] => { y = x + 1 }\nf.patch({ y * 2 })\nprint(f(3))";
    assert_eq!(run(source), "8");
}

#[test]
fn recursion_terminates() {
    let source = "fact = [n::int] => {\n    if (n < 2) { ret 1 }\n    ret n * fact(n - 1)\n}\nprint(fact(5))";
    assert_eq!(run(source), "120");
}

// -- injection -- //

#[test]
fn injection_fills_partial_operators() {
    assert_eq!(run("print(4 >> (_ + 1))"), "5");
    assert_eq!(run("print(10 >> (_ - 1))"), "9");
    assert_eq!(run("print(3 >> (12 / _))"), "4.000000");
}

#[test]
fn injection_fills_function_holes() {
    let source = "add = [a b] => a + b\nprint(2 >> add(3))\nprint((2, 3) >> add)";
    assert_eq!(run(source), "55");
}

#[test]
fn comma_tuples_inject_two_holes() {
    assert_eq!(run("print((8, 2) >> (_ / _))"), "4.000000");
}

#[test]
fn injection_reaches_builtins() {
    assert_eq!(run("print(3.7 >> to_int())"), "3");
    assert_eq!(run("print(\"5\" >> to_int() >> (_ + 1))"), "6");
}
