use chemical::processor::compile_source;

const SOURCE: &str = "func main() : int { return 0; }";

#[test]
fn c_backend_emits_int_main_returning_zero() {
    let compilation = compile_source(SOURCE, "hello.ch");
    assert!(compilation.success());

    let (c, diagnostics) = compilation.to_c();
    assert!(!diagnostics.has_errors());
    assert!(c.contains("int main()"));
    assert!(c.contains("return 0;"));
    // the translation must stand on stdbool/stddef alone
    assert!(c.contains("#include <stdbool.h>"));
    assert!(c.contains("#include <stddef.h>"));
}

#[test]
fn ir_backend_emits_main_returning_zero() {
    let compilation = compile_source(SOURCE, "hello.ch");
    let (ir, diagnostics) = compilation.to_ir();
    assert!(!diagnostics.has_errors());
    assert!(ir.contains("define i32 @main()"));
    assert!(ir.contains("ret i32 0"));
}
