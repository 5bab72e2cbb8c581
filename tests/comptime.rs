use chemical::processor::compile_source;

const SOURCE: &str = "\
@comptime
func square(x : int) : int { return x * x; }
func go() : int { return square(5); }
";

#[test]
fn residual_replaces_the_call_in_both_backends() {
    let compilation = compile_source(SOURCE, "comptime.ch");
    assert!(
        compilation.success(),
        "diagnostics: {:?}",
        compilation.diagnostics.iter().collect::<Vec<_>>()
    );
    let (c, _) = compilation.to_c();
    assert!(c.contains("return 25;"));
    assert!(!c.contains("square"), "comptime functions are not emitted");

    let (ir, _) = compilation.to_ir();
    assert!(ir.contains("ret i32 25"));
    assert!(!ir.contains("@square"));
}

#[test]
fn folded_branches_and_loops_evaluate() {
    let source = "\
@comptime
func fact(n : int) : int {
    var acc = 1;
    while (n > 1) { acc = acc * n; n = n - 1; }
    return acc;
}
func go() : int { return fact(5); }
";
    let compilation = compile_source(source, "comptime.ch");
    assert!(compilation.success());
    let (c, _) = compilation.to_c();
    assert!(c.contains("return 120;"));
}

#[test]
fn struct_residuals_fold_as_struct_values() {
    let source = "\
struct P { x : int; y : int; }
@comptime
func origin() : P { return P { x : 0, y : 0 }; }
func go() : void { var p = origin(); }
";
    let compilation = compile_source(source, "comptime.ch");
    assert!(compilation.success());
    let (c, _) = compilation.to_c();
    assert!(c.contains("P p = (P){ .x = 0, .y = 0 };"));
}
