use chemical::ast::Node;
use chemical::processor::compile_source;

const SOURCE: &str = "\
func add(a : int, b : int) : int { return a + b; }
func add(a : float, b : float) : float { return a + b; }
func go() : int { return add(1, 2); }
";

#[test]
fn resolver_folds_overloads_into_one_multi_function() {
    let compilation = compile_source(SOURCE, "overloads.ch");
    assert!(compilation.success());
    let file = compilation.module.files().first().unwrap();
    let multi_count = file
        .node_ids()
        .filter(|id| matches!(file.node(*id), Node::MultiFunction(_)))
        .count();
    assert_eq!(multi_count, 1, "a single MultiFunctionNode, never two entries");
}

#[test]
fn int_call_links_int_variant() {
    let compilation = compile_source(SOURCE, "overloads.ch");
    let (c, _) = compilation.to_c();
    assert!(c.contains("add__cmf_0(1, 2)"));
}

#[test]
fn float_call_links_float_variant() {
    let source = "\
func add(a : int, b : int) : int { return a + b; }
func add(a : float, b : float) : float { return a + b; }
func go() : float { return add(1.0, 2.0); }
";
    let compilation = compile_source(source, "overloads.ch");
    assert!(
        compilation.success(),
        "diagnostics: {:?}",
        compilation.diagnostics.iter().collect::<Vec<_>>()
    );
    let (c, _) = compilation.to_c();
    assert!(c.contains("add__cmf_1(1.0f, 2.0f)") || c.contains("add__cmf_1("));
}

#[test]
fn mixed_call_is_ambiguous() {
    let source = "\
func add(a : int, b : int) : int { return a + b; }
func add(a : float, b : float) : float { return a + b; }
func go() : int { return add(1, 2.0); }
";
    let compilation = compile_source(source, "overloads.ch");
    assert!(!compilation.success());
    assert!(compilation
        .diagnostics
        .iter()
        .any(|d| d.message.contains("ambiguous")));
}

#[test]
fn emitted_members_carry_cmf_suffixes() {
    let compilation = compile_source(SOURCE, "overloads.ch");
    let (c, _) = compilation.to_c();
    assert!(c.contains("int add__cmf_0(int a, int b)"));
    assert!(c.contains("float add__cmf_1(float a, float b)"));
}
