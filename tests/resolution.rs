use chemical::ast::{FileId, Module};
use chemical::converter::Converter;
use chemical::lexer::Lexer;
use chemical::processor::compile_source;
use chemical::resolver::Resolver;

const SOURCE: &str = "\
struct Vec<T> { data : *T; len : int; }
func size<T>(v : Vec<T>) : int { return v.len; }
func go() : int { var v : Vec<int>; return size(v); }
";

#[test]
fn resolving_twice_changes_nothing_observable() {
    let lexed = Lexer::new(SOURCE, "resolution.ch").lex();
    assert!(!lexed.diagnostics.has_errors());
    let converted = Converter::new(FileId(0), "resolution.ch").convert(&lexed.unit);
    let mut module = Module::new();
    let file = module.add_file(converted.file);

    let mut resolver = Resolver::new(&mut module);
    resolver.resolve_file(file);
    assert!(!resolver.diagnostics.has_errors());
    drop(resolver);
    let first = format!("{module:?}");

    let mut resolver = Resolver::new(&mut module);
    resolver.resolve_file(file);
    assert!(resolver.diagnostics.is_empty(), "no new diagnostics");
    drop(resolver);
    let second = format!("{module:?}");

    assert_eq!(first, second, "links are unchanged by the second run");
}

#[test]
fn unresolved_symbols_diagnose_and_stay_null() {
    let compilation = compile_source("func go() : int { return missing; }", "resolution.ch");
    assert!(!compilation.success());
    assert!(compilation
        .diagnostics
        .iter()
        .any(|d| d.message.contains("missing")));
}

#[test]
fn extension_function_reachable_through_receiver() {
    let source = "\
struct P { x : int; }
func (p : *P) double_x() : int { return p.x * 2; }
func go(p : P) : int { return p.double_x(); }
";
    let compilation = compile_source(source, "resolution.ch");
    assert!(
        compilation.success(),
        "diagnostics: {:?}",
        compilation.diagnostics.iter().collect::<Vec<_>>()
    );
    let (c, _) = compilation.to_c();
    assert!(c.contains("int P_double_x(P* p)"));
}

#[test]
fn extension_collision_with_field_errors() {
    let source = "\
struct P { x : int; }
func (p : *P) x() : int { return 0; }
";
    let compilation = compile_source(source, "resolution.ch");
    assert!(!compilation.success());
}

#[test]
fn implicit_constructor_wraps_argument() {
    let source = "\
struct Meters {
    raw : int;
    @constructor func make(v : int) : Meters { return Meters { raw : v }; }
}
func takes(m : Meters) : int { return m.raw; }
func go() : int { return takes(5); }
";
    let compilation = compile_source(source, "resolution.ch");
    assert!(
        compilation.success(),
        "diagnostics: {:?}",
        compilation.diagnostics.iter().collect::<Vec<_>>()
    );
    let (c, _) = compilation.to_c();
    // the argument 5 is rewritten into a constructor invocation
    assert!(c.contains("Meters_make(&__chx__lv__"));
    assert!(c.contains("takes(__chx__lv__"));
}
