use chemical::processor::compile_source;

// S7: a.b() returns a struct; both back-ends allocate a temporary for the
// call result, then address .c on that temporary, then call d.
const SOURCE: &str = "\
struct C { v : int; func d(self : *C) : int { return self->v; } }
struct B { c : C; }
struct A { n : int; func b(self : *A) : B { var out : B; return out; } }
func go() : int {
    var a : A;
    return a.b().c.d();
}
";

#[test]
fn c_backend_lifts_call_into_temporary() {
    let compilation = compile_source(SOURCE, "chains.ch");
    assert!(
        compilation.success(),
        "diagnostics: {:?}",
        compilation.diagnostics.iter().collect::<Vec<_>>()
    );
    let (c, _) = compilation.to_c();
    let go_body = c.split("int go()").nth(1).expect("go emitted");
    // b()'s result lands in a synthesised local before the statement
    let temp_decl = go_body.find("B __chx__lv__0;").expect("temporary declared");
    let call_b = go_body
        .find("A_b(&__chx__lv__0, &a);")
        .expect("b called with destination and receiver");
    // d is called on the address of .c taken from that temporary
    let call_d = go_body
        .find("C_d(&__chx__lv__0.c)")
        .expect("d called through the temporary's field");
    assert!(temp_decl < call_b && call_b < call_d);
}

#[test]
fn ir_backend_geps_off_the_lifted_temporary() {
    let compilation = compile_source(SOURCE, "chains.ch");
    let (ir, _) = compilation.to_ir();
    let go_body = ir.split("define i32 @go()").nth(1).expect("go emitted");
    let call_b = go_body.find("call void @A_b(ptr").expect("sret call to b");
    let gep_c = go_body
        .find("getelementptr %struct.B")
        .expect("field GEP on the temporary");
    let call_d = go_body.find("call i32 @C_d(ptr").expect("call to d");
    assert!(call_b < gep_c && gep_c < call_d);
}
