use chemical::lexer::Lexer;

fn roundtrip(source: &str) {
    let result = Lexer::new(source, "roundtrip.ch").lex();
    assert!(
        !result.diagnostics.has_errors(),
        "unexpected errors for {source:?}: {:?}",
        result.diagnostics.iter().collect::<Vec<_>>()
    );
    // concatenating the textual forms of the tokens equals the source
    assert_eq!(result.unit.source_text(), source);
}

#[test]
fn accepted_sources_roundtrip_byte_for_byte() {
    roundtrip("func main() : int { return 0; }\n");
    roundtrip("// comment\nfunc main() : int {\n    /* block */ return 0;\n}\n");
    roundtrip("struct P { x : int; y : int; }\nvar p : P;\n");
    roundtrip(
        "struct Vec<T> { data : *T; len : int; }\nfunc size<T>(v : Vec<T>) : int { return v.len; }\n",
    );
    roundtrip("func go() : void { var f = [x](y : int) => x + y; }\n");
    roundtrip("func f() : void { a.b().c.d(); }\n");
    roundtrip("func f() : int { return cond ? 1 : 2; }\n");
    roundtrip("import \"lib.ch\" as lib;\nusing namespace util;\n");
    roundtrip("enum Color { Red, Green, Blue }\n");
    roundtrip(
        "func loop() : void { for (var i = 0; i < 10; i++) { continue; } do { break; } while (true); }\n",
    )
}

#[test]
fn every_byte_is_covered_by_exactly_one_leaf() {
    let source = "func main() : int {\n    var x = 1 + 2;\n    return x;\n}\n";
    let result = Lexer::new(source, "roundtrip.ch").lex();
    assert!(!result.diagnostics.has_errors());
    let tokens = result.tokens();
    // leaves are disjoint and contiguous: summed lengths match, and each
    // token starts where the previous one ended
    let total: usize = tokens.iter().map(|t| t.value.len()).sum();
    assert_eq!(total, source.len());
    let mut offset = 0;
    for token in &tokens {
        let expected = &source[offset..offset + token.value.len()];
        assert_eq!(token.value, expected);
        offset += token.value.len();
    }
}

#[test]
fn malformed_input_keeps_longest_valid_prefix() {
    let source = "func main() : int { return 0; }\n$";
    let result = Lexer::new(source, "roundtrip.ch").lex();
    assert!(result.diagnostics.has_errors());
    // the prefix still folded into a function compound
    assert_eq!(result.unit.source_text(), source);
}
