use chemical::processor::compile_source;

const CAPTURING: &str = "\
func go() : int {
    var x = 3;
    var f = [x](y : int) => x + y;
    return f(4);
}
";

#[test]
fn capture_struct_with_one_field_is_synthesised() {
    let compilation = compile_source(CAPTURING, "lambdas.ch");
    assert!(
        compilation.success(),
        "diagnostics: {:?}",
        compilation.diagnostics.iter().collect::<Vec<_>>()
    );
    let (c, _) = compilation.to_c();
    let capture = c
        .split("typedef struct lambda_cap_0 {")
        .nth(1)
        .expect("capture struct emitted");
    assert!(capture.starts_with("\n    int x;"));
}

#[test]
fn file_scope_function_takes_void_this() {
    let compilation = compile_source(CAPTURING, "lambdas.ch");
    let (c, _) = compilation.to_c();
    assert!(c.contains("int lambda_0(void* this, int y)"));
    // captured x reads through the cast environment
    assert!(c.contains("lambda_cap_0* __chx_cap = (lambda_cap_0*)this;"));
    assert!(c.contains("__chx_cap->x"));
}

#[test]
fn call_site_builds_fat_pointer_literal() {
    let compilation = compile_source(CAPTURING, "lambdas.ch");
    let (c, _) = compilation.to_c();
    assert!(c.contains(
        "typedef struct __chemical_fat_pointer__ { void* lambda; void* captured; } __chemical_fat_pointer__;"
    ));
    assert!(c.contains("(__chemical_fat_pointer__){ (void*)lambda_0, (void*)&__chx__lv__0 }"));
}

#[test]
fn call_through_fat_pointer_passes_env_first() {
    let compilation = compile_source(CAPTURING, "lambdas.ch");
    let (c, _) = compilation.to_c();
    assert!(c.contains("f.lambda"));
    assert!(c.contains("f.captured"));
    let (ir, _) = compilation.to_ir();
    assert!(ir.contains("define i32 @lambda_0(ptr %env, i32 %y)"));
}

#[test]
fn non_capturing_lambda_is_a_plain_function_pointer() {
    let source = "\
func go() : int {
    var f = [](y : int) => y * 2;
    return f(21);
}
";
    let compilation = compile_source(source, "lambdas.ch");
    assert!(compilation.success());
    let (c, _) = compilation.to_c();
    // no fat pointer involved; the variable holds the function directly
    assert!(c.contains("int lambda_0(int y)"));
    assert!(!c.contains("lambda_cap_0"));
    assert!(c.contains("f(21)"));
}
