use chemical::ast::Node;
use chemical::processor::compile_source;

const SOURCE: &str = "\
struct Vec<T> { data : *T; len : int; }
func size<T>(v : Vec<T>) : int { return v.len; }
func go() : int {
    var a : Vec<int>;
    var b : Vec<float>;
    return size(a) + size(b);
}
";

#[test]
fn two_instantiations_register_two_iterations() {
    let compilation = compile_source(SOURCE, "generics.ch");
    assert!(
        compilation.success(),
        "diagnostics: {:?}",
        compilation.diagnostics.iter().collect::<Vec<_>>()
    );
    let file = compilation.module.files().first().unwrap();
    let def = file
        .node_ids()
        .find_map(|id| match file.node(id) {
            Node::StructDef(def) if def.name == "Vec" => Some(def.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(def.iterations.len(), 2);
    // iterations append, never reorder: int registered before float
    assert!(def.iterations[0][0].is_same(&chemical::ast::Type::int()));
}

#[test]
fn c_emission_mangles_with_cgf_suffixes() {
    let compilation = compile_source(SOURCE, "generics.ch");
    let (c, _) = compilation.to_c();
    assert!(c.contains("typedef struct Vec__cgf_0 {"));
    assert!(c.contains("typedef struct Vec__cgf_1 {"));
    assert!(c.contains("int size__cgf_0(Vec__cgf_0 v)"));
    assert!(c.contains("int size__cgf_1(Vec__cgf_1 v)"));
    assert!(c.contains("size__cgf_0(a)"));
    assert!(c.contains("size__cgf_1(b)"));
}

#[test]
fn emitted_symbols_differ_per_iteration() {
    let compilation = compile_source(SOURCE, "generics.ch");
    let (ir, _) = compilation.to_ir();
    let symbols: Vec<&str> = ir
        .lines()
        .filter(|l| l.starts_with("define"))
        .collect();
    let size_symbols: Vec<&&str> = symbols
        .iter()
        .filter(|l| l.contains("@size"))
        .collect();
    assert_eq!(size_symbols.len(), 2);
    assert!(size_symbols[0] != size_symbols[1], "mangled symbols differ");
}

#[test]
fn generic_field_types_substitute_per_iteration() {
    let compilation = compile_source(SOURCE, "generics.ch");
    let (c, _) = compilation.to_c();
    // Vec<int> carries int* data, Vec<float> carries float* data
    let int_def = c.split("typedef struct Vec__cgf_0 {").nth(1).unwrap();
    assert!(int_def.starts_with("\n    int* data;"));
    let float_def = c.split("typedef struct Vec__cgf_1 {").nth(1).unwrap();
    assert!(float_def.starts_with("\n    float* data;"));
}
