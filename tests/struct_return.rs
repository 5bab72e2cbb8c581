use chemical::processor::compile_source;

const SOURCE: &str = "\
struct P { x : int; y : int; }
func mk(a : int, b : int) : P { return P { x : a, y : b }; }
func go() : void { var p = mk(3, 4); }
";

#[test]
fn callee_rewritten_to_out_pointer() {
    let compilation = compile_source(SOURCE, "struct_return.ch");
    assert!(compilation.success());
    let (c, _) = compilation.to_c();
    assert!(c.contains("void mk(P* __chx_struct_ret_param_xx, int a, int b)"));
    assert!(c.contains("*__chx_struct_ret_param_xx ="));
}

#[test]
fn call_site_synthesises_local_and_copies() {
    let compilation = compile_source(SOURCE, "struct_return.ch");
    let (c, _) = compilation.to_c();
    // synthesised local appears before the statement, the call is
    // rewritten to pass its address, p copies out of the temporary
    let lv_decl = c.find("P __chx__lv__0;").expect("synthesised local");
    let call = c.find("mk(&__chx__lv__0, 3, 4);").expect("rewritten call");
    let copy = c.find("P p = __chx__lv__0;").expect("copy into p");
    assert!(lv_decl < call && call < copy);
}

#[test]
fn every_ir_call_site_allocates_a_destination() {
    let compilation = compile_source(SOURCE, "struct_return.ch");
    let (ir, _) = compilation.to_ir();
    assert!(ir.contains("define void @mk(ptr %sret_ptr, i32 %a, i32 %b)"));
    // the destination alloca happens before the call that fills it
    let go_body = ir.split("define void @go()").nth(1).expect("go emitted");
    let alloca = go_body.find("alloca %struct.P").expect("destination alloca");
    let call = go_body.find("call void @mk(ptr").expect("call with address");
    assert!(alloca < call);
}
