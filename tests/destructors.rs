use chemical::processor::compile_source;

const EARLY_RETURN: &str = "\
struct R { x : int; @destructor func delete(self : *R) : void { } }
func go(cond : bool) : void {
    var a : R;
    var b : R;
    if (cond) { return; }
}
";

#[test]
fn early_return_destroys_b_then_a_before_return() {
    let compilation = compile_source(EARLY_RETURN, "destructors.ch");
    assert!(compilation.success());
    let (c, _) = compilation.to_c();
    let body = c.split("if (cond)").nth(1).expect("if body present");
    let b = body.find("R_delete(&b);").expect("b destroyed on the path");
    let a = body.find("R_delete(&a);").expect("a destroyed on the path");
    let ret = body.find("return;").expect("return emitted");
    assert!(b < a, "reverse declaration order");
    assert!(a < ret, "strictly before the terminator");
}

#[test]
fn normal_exit_destroys_in_reverse_order() {
    let source = "\
struct R { x : int; @destructor func delete(self : *R) : void { } }
func go() : void { var a : R; var b : R; var c : R; }
";
    let compilation = compile_source(source, "destructors.ch");
    let (c, _) = compilation.to_c();
    let go_body = c.split("void go()").nth(1).expect("go emitted");
    let c_pos = go_body.find("R_delete(&c);").unwrap();
    let b_pos = go_body.find("R_delete(&b);").unwrap();
    let a_pos = go_body.find("R_delete(&a);").unwrap();
    assert!(c_pos < b_pos && b_pos < a_pos);
}

#[test]
fn transitive_member_gets_synthesised_destructor() {
    let source = "\
struct Inner { x : int; @destructor func delete(self : *Inner) : void { } }
struct Outer { inner : Inner; }
func go() : void { var o : Outer; }
";
    let compilation = compile_source(source, "destructors.ch");
    assert!(compilation.success());
    let (c, _) = compilation.to_c();
    // the synthesised Outer destructor destroys the Inner field
    assert!(c.contains("void Outer_delete(Outer* self)"));
    assert!(c.contains("Inner_delete(&self->inner);"));
    // and the local o is destroyed through it
    assert!(c.contains("Outer_delete(&o);"));
}

#[test]
fn array_locals_destroy_with_reverse_index_loop() {
    let source = "\
struct R { x : int; @destructor func delete(self : *R) : void { } }
func go() : void { var items : R[3]; }
";
    let compilation = compile_source(source, "destructors.ch");
    let (c, _) = compilation.to_c();
    assert!(c.contains("for (int __chx_i = 3 - 1; __chx_i >= 0; __chx_i--)"));
    assert!(c.contains("R_delete(&items[__chx_i]);"));
}

#[test]
fn return_inside_destructor_becomes_goto_cleanup() {
    let source = "\
struct Inner { x : int; @destructor func delete(self : *Inner) : void { } }
struct Outer {
    a : Inner;
    b : Inner;
    @destructor func delete(self : *Outer) : void { if (self.a.x > 0) { return; } }
}
";
    let compilation = compile_source(source, "destructors.ch");
    let (c, _) = compilation.to_c();
    assert!(c.contains("goto __chx__dstctr_clnup_blk__;"));
    let cleanup = c
        .split("__chx__dstctr_clnup_blk__:;")
        .nth(1)
        .expect("cleanup block appended");
    let b = cleanup.find("Inner_delete(&self->b);").unwrap();
    let a = cleanup.find("Inner_delete(&self->a);").unwrap();
    assert!(b < a, "fields destroy in reverse member order");
}
