//! Hand-written lexer for Chemical source. The lexer emits a flat token
//! sequence which is simultaneously a CST: certain productions open a
//! compound span and close it on the matching closer, so the finished
//! stream folds directly into [`CstNode`]s. Trivia (whitespace, comments)
//! are preserved as tokens, keeping the tree lossless over the source.

mod token;

pub use token::*;

use std::path::PathBuf;

use log::trace;

use crate::cst::{CstKind, CstNode};
use crate::diagnostics::{Diagnostics, Position};
use crate::stream::SourceProvider;

/// Outcome of lexing one file: the unit CST plus everything diagnosed on
/// the way. On malformed input the unit holds the longest valid prefix.
#[derive(Debug)]
pub struct LexResult {
    pub unit: CstNode,
    pub diagnostics: Diagnostics,
}

impl LexResult {
    /// All leaf tokens of the unit in source order.
    pub fn tokens(&self) -> Vec<&Token> {
        let mut tokens = vec![];
        self.unit.collect_tokens(&mut tokens);
        tokens
    }
}

pub struct Lexer<'a> {
    provider: SourceProvider<'a>,
    file_path: PathBuf,
    /// Flat build list; compounds fold a suffix of it on span close.
    nodes: Vec<CstNode>,
    /// Open spans: kind plus the index into `nodes` where the span began.
    stack: Vec<(CstKind, usize)>,
    diagnostics: Diagnostics,
    // context modes; these toggle which compound kinds are legal
    inside_import: bool,
    inside_for_init: bool,
    inside_capture: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str, file_path: impl Into<PathBuf>) -> Self {
        Self {
            provider: SourceProvider::new(input),
            file_path: file_path.into(),
            nodes: vec![],
            stack: vec![],
            diagnostics: Diagnostics::new(),
            inside_import: false,
            inside_for_init: false,
            inside_capture: false,
        }
    }

    /// Lex a complete file. Produces the full token stream or the longest
    /// valid prefix plus diagnostics.
    pub fn lex(mut self) -> LexResult {
        while !self.provider.eof() {
            self.lex_trivia();
            if self.provider.eof() {
                break;
            }
            self.lex_top_level();
        }
        if !self.stack.is_empty() {
            let position = self.provider.position();
            self.error(position, "unexpected end of file inside an open span");
            while !self.stack.is_empty() {
                self.close_span();
            }
        }
        LexResult {
            unit: CstNode::Compound {
                kind: CstKind::Unit,
                children: self.nodes,
            },
            diagnostics: self.diagnostics,
        }
    }

    // ---- span plumbing -------------------------------------------------

    fn open_span(&mut self, kind: CstKind) {
        trace!("opening span {kind:?}");
        self.stack.push((kind, self.nodes.len()));
    }

    fn close_span(&mut self) {
        let Some((kind, start)) = self.stack.pop() else {
            return;
        };
        let children = self.nodes.split_off(start);
        self.nodes.push(CstNode::Compound { kind, children });
    }

    /// Drop the innermost open span, splicing its children into the parent.
    fn abandon_span(&mut self) {
        self.stack.pop();
    }

    fn emit(&mut self, kind: LexTokenType, value: impl Into<String>, position: Position) {
        self.nodes.push(CstNode::Leaf(Token::new(kind, value, position)));
    }

    fn error(&mut self, position: Position, message: impl Into<String>) {
        let file = self.file_path.clone();
        self.diagnostics.error(position, &file, message);
    }

    // ---- trivia --------------------------------------------------------

    fn lex_trivia(&mut self) {
        loop {
            let position = self.provider.position();
            let ws = self.provider.read_while(|c| c.is_ascii_whitespace());
            if !ws.is_empty() {
                self.emit(LexTokenType::Whitespace, ws, position);
                continue;
            }
            if self.provider.peek() == Some('/') {
                match self.provider.peek_at(1) {
                    Some('/') => {
                        let position = self.provider.position();
                        let text = self.provider.read_until('\n');
                        self.emit(LexTokenType::Comment, text, position);
                        continue;
                    }
                    Some('*') => {
                        self.lex_multiline_comment();
                        continue;
                    }
                    _ => {}
                }
            }
            break;
        }
    }

    fn lex_multiline_comment(&mut self) {
        let position = self.provider.position();
        let mut text = String::from("/*");
        self.provider.read();
        self.provider.read();
        loop {
            match self.provider.read() {
                None => {
                    self.error(position, "unterminated multiline comment");
                    break;
                }
                Some('*') if self.provider.peek() == Some('/') => {
                    self.provider.read();
                    text.push_str("*/");
                    break;
                }
                Some(c) => text.push(c),
            }
        }
        self.emit(LexTokenType::MultilineComment, text, position);
    }

    // ---- atomic tokens -------------------------------------------------

    fn lex_identifier_text(&mut self) -> Option<(String, Position)> {
        let position = self.provider.position();
        let first = self.provider.peek()?;
        if !first.is_ascii_alphabetic() && first != '_' {
            return None;
        }
        let text = self
            .provider
            .read_while(|c| c.is_ascii_alphanumeric() || c == '_');
        Some((text, position))
    }

    /// Emit an identifier-shaped token, classified into keyword, type
    /// keyword, bool, null or plain identifier.
    fn lex_word(&mut self) -> Option<(String, Position)> {
        let (text, position) = self.lex_identifier_text()?;
        let kind = classify_word(&text);
        self.emit(kind, text.clone(), position);
        Some((text, position))
    }

    fn lex_number(&mut self) {
        let position = self.provider.position();
        let mut text = self.provider.read_while(|c| c.is_ascii_digit());
        if self.provider.peek() == Some('.')
            && self
                .provider
                .peek_at(1)
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false)
        {
            text.push('.');
            self.provider.read();
            text.push_str(&self.provider.read_while(|c| c.is_ascii_digit()));
        }
        // suffixes and hex digits; the converter types the literal
        text.push_str(
            &self
                .provider
                .read_while(|c| c.is_ascii_alphanumeric()),
        );
        self.emit(LexTokenType::Number, text, position);
    }

    fn lex_string_literal(&mut self) {
        let position = self.provider.position();
        self.provider.read();
        match self.provider.read_escaping('"') {
            Some(inner) => {
                self.emit(LexTokenType::String, format!("\"{inner}\""), position);
            }
            None => {
                self.error(position, "unterminated string literal");
            }
        }
    }

    fn lex_char_literal(&mut self) {
        let position = self.provider.position();
        self.provider.read();
        match self.provider.read_escaping('\'') {
            Some(inner) => {
                self.emit(LexTokenType::Char, format!("'{inner}'"), position);
            }
            None => {
                self.error(position, "unterminated character literal");
            }
        }
    }

    fn lex_annotation(&mut self) {
        let position = self.provider.position();
        self.provider.read();
        match self.lex_identifier_text() {
            Some((name, _)) => {
                self.emit(LexTokenType::Annotation, format!("@{name}"), position);
            }
            None => self.error(position, "expected an annotation name after '@'"),
        }
    }

    /// Consume `expected` and emit it as a structural token. Reports and
    /// returns false when something else is next.
    fn expect(&mut self, expected: &str) -> bool {
        self.lex_trivia();
        let position = self.provider.position();
        if self.provider.increment(expected) {
            let kind = if expected.len() > 1 {
                LexTokenType::Operation
            } else {
                LexTokenType::CharOperator
            };
            self.emit(kind, expected, position);
            true
        } else {
            self.error(position, format!("expected '{expected}'"));
            false
        }
    }

    fn increment_emit(&mut self, lit: &str) -> bool {
        self.lex_trivia();
        let position = self.provider.position();
        if self.provider.increment(lit) {
            let kind = if lit.len() > 1 {
                LexTokenType::Operation
            } else {
                LexTokenType::CharOperator
            };
            self.emit(kind, lit, position);
            true
        } else {
            false
        }
    }

    fn peek_word(&mut self) -> Option<String> {
        self.lex_trivia();
        let saved = self.provider.save();
        let word = self.lex_identifier_text().map(|(text, _)| text);
        self.provider.restore(saved);
        word
    }

    fn peek_char(&mut self) -> Option<char> {
        self.lex_trivia();
        self.provider.peek()
    }

    /// Statement-scope recovery: swallow characters up to the next `;`
    /// (consumed) or `}` (left in place), emitting them as a raw token so
    /// the stream stays lossless.
    fn recover_statement(&mut self) {
        let position = self.provider.position();
        let mut raw = String::new();
        while let Some(c) = self.provider.peek() {
            if c == '}' {
                break;
            }
            self.provider.read();
            raw.push(c);
            if c == ';' {
                break;
            }
        }
        if !raw.is_empty() {
            self.emit(LexTokenType::Raw, raw, position);
        }
    }

    // ---- top level -----------------------------------------------------

    fn lex_top_level(&mut self) {
        let Some(word) = self.peek_word() else {
            match self.peek_char() {
                Some('@') => self.lex_annotation(),
                Some(c) => {
                    // stray operator: report and drop the single character
                    let position = self.provider.position();
                    self.provider.read();
                    self.error(position, format!("unexpected character '{c}'"));
                    self.emit(LexTokenType::Raw, c.to_string(), position);
                }
                None => {}
            }
            return;
        };
        match word.as_str() {
            "import" => self.lex_import(),
            "using" => self.lex_using(),
            "typealias" => self.lex_typealias(),
            "var" | "const" => self.lex_var_init(),
            "func" => self.lex_function(),
            "struct" => self.lex_struct_def(CstKind::StructDef),
            "union" => self.lex_struct_def(CstKind::UnionDef),
            "interface" => self.lex_interface(),
            "impl" => self.lex_impl(),
            "enum" => self.lex_enum(),
            "namespace" => self.lex_namespace(),
            _ => {
                let position = self.provider.position();
                self.error(position, format!("unexpected '{word}' at file scope"));
                self.recover_statement();
            }
        }
    }

    fn lex_import(&mut self) {
        self.open_span(CstKind::Import);
        self.inside_import = true;
        self.lex_word();
        self.lex_trivia();
        if self.provider.peek() == Some('"') {
            self.lex_string_literal();
        } else {
            let position = self.provider.position();
            self.error(position, "expected an import path string");
        }
        if self.peek_word().as_deref() == Some("as") {
            self.lex_word();
            self.lex_trivia();
            if self.lex_word().is_none() {
                let position = self.provider.position();
                self.error(position, "expected an identifier after 'as'");
            }
        }
        self.expect(";");
        self.inside_import = false;
        self.close_span();
    }

    fn lex_using(&mut self) {
        self.open_span(CstKind::Using);
        self.lex_word();
        if self.peek_word().as_deref() == Some("namespace") {
            self.lex_word();
        }
        self.lex_trivia();
        if self.lex_word().is_none() {
            let position = self.provider.position();
            self.error(position, "expected a name after 'using'");
        }
        while self.increment_emit("::") {
            self.lex_trivia();
            self.lex_word();
        }
        self.expect(";");
        self.close_span();
    }

    fn lex_typealias(&mut self) {
        self.open_span(CstKind::Typealias);
        self.lex_word();
        self.lex_trivia();
        self.lex_word();
        self.expect("=");
        self.lex_type();
        self.expect(";");
        self.close_span();
    }

    fn lex_var_init(&mut self) {
        self.open_span(CstKind::VarInit);
        self.lex_word(); // var | const
        self.lex_trivia();
        if self.lex_word().is_none() {
            let position = self.provider.position();
            self.error(position, "expected a variable name");
            self.recover_statement();
            self.close_span();
            return;
        }
        if self.increment_emit(":") {
            self.lex_type();
        }
        if self.increment_emit("=") {
            self.lex_expression();
        }
        self.expect(";");
        self.close_span();
    }

    fn lex_function(&mut self) {
        self.open_span(CstKind::Function);
        self.lex_word(); // func
        self.lex_trivia();
        // extension receiver: func (r: R) name(...)
        if self.provider.peek() == Some('(') {
            self.increment_emit("(");
            self.lex_function_param();
            self.expect(")");
        }
        self.lex_trivia();
        if self.lex_word().is_none() {
            let position = self.provider.position();
            self.error(position, "expected a function name");
            self.recover_statement();
            self.close_span();
            return;
        }
        if self.peek_char() == Some('<') {
            self.lex_generic_param_list();
        }
        self.expect("(");
        self.lex_trivia();
        if self.provider.peek() != Some(')') {
            loop {
                self.lex_trivia();
                let position = self.provider.position();
                if self.provider.increment("...") {
                    self.emit(LexTokenType::Operation, "...", position);
                    break;
                }
                self.lex_function_param();
                if !self.increment_emit(",") {
                    break;
                }
            }
        }
        self.expect(")");
        if self.increment_emit(":") {
            self.lex_type();
        }
        self.lex_trivia();
        if self.provider.peek() == Some('{') {
            self.lex_body();
        } else {
            self.expect(";");
        }
        self.close_span();
    }

    fn lex_function_param(&mut self) {
        self.open_span(CstKind::FunctionParam);
        self.lex_trivia();
        self.lex_word();
        self.expect(":");
        self.lex_type();
        self.close_span();
    }

    fn lex_generic_param_list(&mut self) {
        self.open_span(CstKind::GenericParamList);
        self.expect("<");
        loop {
            self.lex_trivia();
            if self.lex_word().is_none() {
                let position = self.provider.position();
                self.error(position, "expected a generic parameter name");
                break;
            }
            if !self.increment_emit(",") {
                break;
            }
        }
        self.expect(">");
        self.close_span();
    }

    fn lex_struct_def(&mut self, kind: CstKind) {
        self.open_span(kind);
        self.lex_word(); // struct | union
        self.lex_trivia();
        // named definition carries an identifier; unnamed members don't
        if self.provider.peek() != Some('{') {
            self.lex_word();
            if self.peek_char() == Some('<') {
                self.lex_generic_param_list();
            }
        }
        self.expect("{");
        loop {
            self.lex_trivia();
            match self.provider.peek() {
                None => {
                    let position = self.provider.position();
                    self.error(position, "unexpected end of file inside a definition");
                    break;
                }
                Some('}') => break,
                Some('@') => self.lex_annotation(),
                _ => {
                    let word = self.peek_word();
                    match word.as_deref() {
                        Some("func") => self.lex_function(),
                        Some("struct") => self.lex_struct_member_or_nested(CstKind::StructDef),
                        Some("union") => self.lex_struct_member_or_nested(CstKind::UnionDef),
                        Some(_) => self.lex_struct_member(),
                        None => {
                            let position = self.provider.position();
                            self.error(position, "expected a member declaration");
                            self.recover_statement();
                        }
                    }
                }
            }
        }
        self.expect("}");
        self.close_span();
    }

    /// `struct { ... } name;` member or nested named definition.
    fn lex_struct_member_or_nested(&mut self, kind: CstKind) {
        self.lex_struct_def(kind);
        self.lex_trivia();
        // unnamed member form carries a trailing name
        if self
            .provider
            .peek()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        {
            self.lex_word();
            self.expect(";");
        }
    }

    fn lex_struct_member(&mut self) {
        self.open_span(CstKind::StructMember);
        self.lex_word();
        self.expect(":");
        self.lex_type();
        if self.increment_emit("=") {
            self.lex_expression();
        }
        if !self.increment_emit(";") {
            self.increment_emit(",");
        }
        self.close_span();
    }

    fn lex_interface(&mut self) {
        self.open_span(CstKind::Interface);
        self.lex_word();
        self.lex_trivia();
        self.lex_word();
        self.expect("{");
        loop {
            self.lex_trivia();
            match self.provider.peek() {
                None | Some('}') => break,
                Some('@') => self.lex_annotation(),
                _ => {
                    if self.peek_word().as_deref() == Some("func") {
                        self.lex_function();
                    } else {
                        let position = self.provider.position();
                        self.error(position, "expected a function signature");
                        self.recover_statement();
                    }
                }
            }
        }
        self.expect("}");
        self.close_span();
    }

    fn lex_impl(&mut self) {
        self.open_span(CstKind::Impl);
        self.lex_word();
        self.lex_trivia();
        self.lex_word();
        if self.peek_word().as_deref() == Some("for") {
            self.lex_word();
            self.lex_trivia();
            self.lex_word();
        }
        self.expect("{");
        loop {
            self.lex_trivia();
            match self.provider.peek() {
                None | Some('}') => break,
                Some('@') => self.lex_annotation(),
                _ => {
                    if self.peek_word().as_deref() == Some("func") {
                        self.lex_function();
                    } else {
                        let position = self.provider.position();
                        self.error(position, "expected a function inside impl");
                        self.recover_statement();
                    }
                }
            }
        }
        self.expect("}");
        self.close_span();
    }

    fn lex_enum(&mut self) {
        self.open_span(CstKind::EnumDecl);
        self.lex_word();
        self.lex_trivia();
        self.lex_word();
        self.expect("{");
        loop {
            self.lex_trivia();
            match self.provider.peek() {
                None | Some('}') => break,
                _ => {
                    if self.lex_word().is_none() {
                        let position = self.provider.position();
                        self.error(position, "expected an enum member name");
                        break;
                    }
                    if !self.increment_emit(",") {
                        break;
                    }
                }
            }
        }
        self.expect("}");
        self.close_span();
    }

    fn lex_namespace(&mut self) {
        self.open_span(CstKind::Namespace);
        self.lex_word();
        self.lex_trivia();
        self.lex_word();
        self.expect("{");
        loop {
            self.lex_trivia();
            match self.provider.peek() {
                None | Some('}') => break,
                _ => self.lex_top_level(),
            }
        }
        self.expect("}");
        self.close_span();
    }

    // ---- statements ----------------------------------------------------

    fn lex_body(&mut self) {
        self.open_span(CstKind::Body);
        self.expect("{");
        loop {
            self.lex_trivia();
            match self.provider.peek() {
                None => {
                    let position = self.provider.position();
                    self.error(position, "unexpected end of file inside a block");
                    break;
                }
                Some('}') => break,
                _ => self.lex_statement(),
            }
        }
        self.expect("}");
        self.close_span();
    }

    fn lex_statement(&mut self) {
        if self.peek_char() == Some('@') {
            self.lex_annotation();
            return;
        }
        let Some(word) = self.peek_word() else {
            // expression statements and deref-assignments start with a
            // non-word character; everything else is a stray character
            match self.peek_char() {
                Some('*') => self.lex_assignment_or_expr(true),
                Some(c) => {
                    let position = self.provider.position();
                    self.provider.read();
                    self.error(position, format!("unexpected character '{c}'"));
                    self.emit(LexTokenType::Raw, c.to_string(), position);
                }
                None => {}
            }
            return;
        };
        match word.as_str() {
            "var" | "const" => self.lex_var_init(),
            "if" => self.lex_if(),
            "while" => self.lex_while(),
            "do" => self.lex_do_while(),
            "for" => self.lex_for(),
            "switch" => self.lex_switch(),
            "return" => self.lex_return(),
            "break" => self.lex_flow(CstKind::Break),
            "continue" => self.lex_flow(CstKind::Continue),
            "delete" => self.lex_delete(),
            "throw" => self.lex_throw(),
            "typealias" => self.lex_typealias(),
            "using" => self.lex_using(),
            "func" => self.lex_function(),
            "struct" => self.lex_struct_def(CstKind::StructDef),
            "union" => self.lex_struct_def(CstKind::UnionDef),
            _ => self.lex_assignment_or_expr(true),
        }
    }

    fn lex_if(&mut self) {
        self.open_span(CstKind::If);
        self.lex_word();
        self.expect("(");
        self.lex_expression();
        self.expect(")");
        self.lex_statement_or_body();
        loop {
            if self.peek_word().as_deref() != Some("else") {
                break;
            }
            self.lex_word();
            if self.peek_word().as_deref() == Some("if") {
                self.lex_word();
                self.expect("(");
                self.lex_expression();
                self.expect(")");
                self.lex_statement_or_body();
            } else {
                self.lex_statement_or_body();
                break;
            }
        }
        self.close_span();
    }

    fn lex_statement_or_body(&mut self) {
        self.lex_trivia();
        if self.provider.peek() == Some('{') {
            self.lex_body();
        } else {
            self.lex_statement();
        }
    }

    fn lex_while(&mut self) {
        self.open_span(CstKind::While);
        self.lex_word();
        self.expect("(");
        self.lex_expression();
        self.expect(")");
        self.lex_statement_or_body();
        self.close_span();
    }

    fn lex_do_while(&mut self) {
        self.open_span(CstKind::DoWhile);
        self.lex_word();
        self.lex_body();
        self.lex_trivia();
        if self.peek_word().as_deref() == Some("while") {
            self.lex_word();
        } else {
            let position = self.provider.position();
            self.error(position, "expected 'while' after a do block");
        }
        self.expect("(");
        self.lex_expression();
        self.expect(")");
        self.expect(";");
        self.close_span();
    }

    fn lex_for(&mut self) {
        self.open_span(CstKind::ForLoop);
        self.lex_word();
        self.expect("(");
        self.inside_for_init = true;
        match self.peek_word().as_deref() {
            Some("var") | Some("const") => self.lex_var_init(),
            _ => {
                let position = self.provider.position();
                self.error(position, "expected a variable initialisation in for");
                self.recover_statement();
            }
        }
        self.lex_expression();
        self.expect(";");
        self.lex_assignment_or_expr(false);
        self.inside_for_init = false;
        self.expect(")");
        self.lex_statement_or_body();
        self.close_span();
    }

    fn lex_switch(&mut self) {
        self.open_span(CstKind::Switch);
        self.lex_word();
        self.expect("(");
        self.lex_expression();
        self.expect(")");
        self.expect("{");
        loop {
            self.lex_trivia();
            match self.provider.peek() {
                None | Some('}') => break,
                _ => match self.peek_word().as_deref() {
                    Some("case") => {
                        self.lex_word();
                        self.lex_expression();
                        self.expect(":");
                    }
                    Some("default") => {
                        self.lex_word();
                        self.expect(":");
                    }
                    _ => self.lex_statement(),
                },
            }
        }
        self.expect("}");
        self.close_span();
    }

    fn lex_return(&mut self) {
        self.open_span(CstKind::Return);
        self.lex_word();
        self.lex_trivia();
        if self.provider.peek() != Some(';') {
            self.lex_expression();
        }
        self.expect(";");
        self.close_span();
    }

    fn lex_flow(&mut self, kind: CstKind) {
        self.open_span(kind);
        self.lex_word();
        self.expect(";");
        self.close_span();
    }

    fn lex_delete(&mut self) {
        self.open_span(CstKind::Delete);
        self.lex_word();
        self.lex_expression();
        self.expect(";");
        self.close_span();
    }

    fn lex_throw(&mut self) {
        self.open_span(CstKind::Throw);
        self.lex_word();
        self.lex_expression();
        self.expect(";");
        self.close_span();
    }

    /// Assignment, inc/dec or bare expression statement. When
    /// `with_semicolon` is false (for-loop increment position) the trailing
    /// `;` is not consumed.
    fn lex_assignment_or_expr(&mut self, with_semicolon: bool) {
        let start = self.nodes.len();
        self.lex_unary_or_chain();
        self.lex_trivia();
        let position = self.provider.position();
        if self.provider.increment("++") {
            let children = self.nodes.split_off(start);
            self.nodes.push(CstNode::Compound {
                kind: CstKind::IncDec,
                children,
            });
            self.push_into_last(Token::new(LexTokenType::Operation, "++", position));
        } else if self.provider.increment("--") {
            let children = self.nodes.split_off(start);
            self.nodes.push(CstNode::Compound {
                kind: CstKind::IncDec,
                children,
            });
            self.push_into_last(Token::new(LexTokenType::Operation, "--", position));
        } else if self.provider.peek() == Some('=') && self.provider.peek_at(1) != Some('=') {
            self.provider.read();
            let children = self.nodes.split_off(start);
            self.nodes.push(CstNode::Compound {
                kind: CstKind::Assignment,
                children,
            });
            self.push_into_last(Token::new(LexTokenType::CharOperator, "=", position));
            let inner_start = self.nodes.len();
            self.lex_expression();
            let value_nodes = self.nodes.split_off(inner_start);
            self.extend_last(value_nodes);
        }
        if with_semicolon {
            self.lex_trivia();
            let position = self.provider.position();
            if self.provider.increment_char(';') {
                let token = Token::new(LexTokenType::CharOperator, ";", position);
                self.push_into_last(token);
            } else {
                self.error(position, "expected ';' after a statement");
            }
        }
    }

    fn push_into_last(&mut self, token: Token) {
        if let Some(CstNode::Compound { children, .. }) = self.nodes.last_mut() {
            children.push(CstNode::Leaf(token));
        } else {
            self.nodes.push(CstNode::Leaf(token));
        }
    }

    fn extend_last(&mut self, nodes: Vec<CstNode>) {
        if let Some(CstNode::Compound { children, .. }) = self.nodes.last_mut() {
            children.extend(nodes);
        } else {
            self.nodes.extend(nodes);
        }
    }

    /// Left-hand sides: an access chain, possibly behind `*` dereferences.
    fn lex_unary_or_chain(&mut self) {
        self.lex_trivia();
        if self.provider.peek() == Some('*') {
            self.open_span(CstKind::Dereference);
            self.increment_emit("*");
            self.lex_unary_or_chain();
            self.close_span();
            return;
        }
        self.lex_access_chain();
    }

    // ---- values --------------------------------------------------------

    pub(crate) fn lex_expression(&mut self) {
        let start = self.nodes.len();
        self.lex_operand();
        let mut operands = 1usize;
        loop {
            self.lex_trivia();
            if self.peek_word().as_deref() == Some("as") {
                let children = self.nodes.split_off(start);
                self.nodes.push(CstNode::Compound {
                    kind: CstKind::CastValue,
                    children,
                });
                let cast_start = self.nodes.len();
                self.lex_word();
                self.lex_type();
                let tail = self.nodes.split_off(cast_start);
                self.extend_last(tail);
                continue;
            }
            let Some(op) = self.peek_binary_operator() else {
                break;
            };
            let position = self.provider.position();
            self.provider.increment(op);
            self.emit(
                if op.len() > 1 {
                    LexTokenType::Operation
                } else {
                    LexTokenType::CharOperator
                },
                op,
                position,
            );
            self.lex_operand();
            operands += 1;
        }
        if operands > 1 {
            let children = self.nodes.split_off(start);
            self.nodes.push(CstNode::Compound {
                kind: CstKind::Expression,
                children,
            });
        }
        // ternary binds loosest of all
        self.lex_trivia();
        if self.provider.peek() == Some('?') {
            let children = self.nodes.split_off(start);
            self.nodes.push(CstNode::Compound {
                kind: CstKind::TernaryValue,
                children,
            });
            let tail_start = self.nodes.len();
            self.expect("?");
            self.lex_expression();
            self.expect(":");
            self.lex_expression();
            let tail = self.nodes.split_off(tail_start);
            self.extend_last(tail);
        }
    }

    /// Binary operators, longest first. `<`/`>` are plain comparisons in
    /// value position; only type position opens a generic span.
    fn peek_binary_operator(&mut self) -> Option<&'static str> {
        self.lex_trivia();
        const OPS: &[&str] = &[
            "==", "!=", "<=", ">=", "&&", "||", "<<", ">>", "+", "-", "*", "/", "%", "<", ">",
            "&", "|", "^",
        ];
        let first = self.provider.peek()?;
        let second = self.provider.peek_at(1);
        for op in OPS {
            let bytes = op.as_bytes();
            if bytes[0] as char != first {
                continue;
            }
            if bytes.len() == 2 {
                if second == Some(bytes[1] as char) {
                    return Some(op);
                }
                continue;
            }
            // single-char: make sure we are not looking at `=` of `==` etc.
            match (first, second) {
                ('&', Some('&')) | ('|', Some('|')) | ('<', Some('<')) | ('>', Some('>')) => {
                    continue
                }
                _ => return Some(op),
            }
        }
        None
    }

    fn lex_operand(&mut self) {
        self.lex_trivia();
        let Some(c) = self.provider.peek() else {
            let position = self.provider.position();
            self.error(position, "expected a value");
            return;
        };
        match c {
            '-' => {
                self.open_span(CstKind::Negative);
                self.increment_emit("-");
                self.lex_operand();
                self.close_span();
            }
            '!' => {
                self.open_span(CstKind::Not);
                self.increment_emit("!");
                self.lex_operand();
                self.close_span();
            }
            '&' => {
                self.open_span(CstKind::AddrOf);
                self.increment_emit("&");
                self.lex_operand();
                self.close_span();
            }
            '*' => {
                self.open_span(CstKind::Dereference);
                self.increment_emit("*");
                self.lex_operand();
                self.close_span();
            }
            '(' => {
                self.open_span(CstKind::Expression);
                self.increment_emit("(");
                self.lex_expression();
                self.expect(")");
                self.close_span();
            }
            '[' => self.lex_lambda_or_array(),
            '"' => self.lex_string_literal(),
            '\'' => self.lex_char_literal(),
            '0'..='9' => self.lex_number(),
            _ => {
                match self.peek_word().as_deref() {
                    Some("sizeof") => {
                        self.open_span(CstKind::SizeOf);
                        self.lex_word();
                        self.expect("(");
                        self.lex_type();
                        self.expect(")");
                        self.close_span();
                    }
                    Some("true") | Some("false") | Some("null") => {
                        self.lex_word();
                    }
                    Some(_) => self.lex_access_chain(),
                    None => {
                        let position = self.provider.position();
                        self.provider.read();
                        self.error(position, format!("unexpected character '{c}' in a value"));
                        self.emit(LexTokenType::Raw, c.to_string(), position);
                    }
                }
            }
        }
    }

    /// `[captures](params) => body` or `[a, b, c]` array literal.
    fn lex_lambda_or_array(&mut self) {
        let saved = self.provider.save();
        let nodes_mark = self.nodes.len();
        // try the capture list; on anything unexpected fall back to array
        self.open_span(CstKind::Lambda);
        self.open_span(CstKind::CaptureList);
        self.inside_capture = true;
        self.increment_emit("[");
        let mut ok = true;
        loop {
            self.lex_trivia();
            match self.provider.peek() {
                Some(']') => break,
                Some('&') => {
                    self.increment_emit("&");
                    if self.lex_word().is_none() {
                        ok = false;
                        break;
                    }
                }
                _ => {
                    if self.lex_word().is_none() {
                        ok = false;
                        break;
                    }
                }
            }
            if !self.increment_emit(",") {
                break;
            }
        }
        self.lex_trivia();
        let close_position = self.provider.position();
        ok = ok && self.provider.increment_char(']');
        self.inside_capture = false;
        if ok {
            self.emit(LexTokenType::CharOperator, "]", close_position);
        }
        self.lex_trivia();
        if !ok || self.provider.peek() != Some('(') {
            // not a lambda: rewind and lex an array value instead
            self.abandon_span();
            self.abandon_span();
            self.nodes.truncate(nodes_mark);
            self.provider.restore(saved);
            self.lex_array_value();
            return;
        }
        self.close_span(); // capture list
        self.increment_emit("(");
        self.lex_trivia();
        if self.provider.peek() != Some(')') {
            loop {
                self.lex_function_param();
                if !self.increment_emit(",") {
                    break;
                }
            }
        }
        self.expect(")");
        self.expect("=>");
        self.lex_trivia();
        if self.provider.peek() == Some('{') {
            self.lex_body();
        } else {
            self.lex_expression();
        }
        self.close_span();
    }

    fn lex_array_value(&mut self) {
        self.open_span(CstKind::ArrayValue);
        self.increment_emit("[");
        self.lex_trivia();
        if self.provider.peek() != Some(']') {
            loop {
                self.lex_expression();
                if !self.increment_emit(",") {
                    break;
                }
            }
        }
        self.expect("]");
        self.close_span();
    }

    /// An access chain: identifier followed by `.` / `::` members, calls
    /// and index operators. A chain whose head is directly followed by `{`
    /// re-folds into a struct value.
    fn lex_access_chain(&mut self) {
        self.open_span(CstKind::AccessChain);
        self.lex_trivia();
        if self.lex_word().is_none() {
            let position = self.provider.position();
            self.error(position, "expected an identifier");
            self.abandon_span();
            return;
        }
        // struct value: `Point { x: 1 }` or `Vec<int> { ... }`
        if self.try_struct_value() {
            return;
        }
        loop {
            self.lex_trivia();
            if self.provider.peek() == Some('(') {
                self.lex_call_args();
                continue;
            }
            if self.provider.peek() == Some('<') && self.try_generic_call() {
                continue;
            }
            if self.provider.peek() == Some('[') {
                self.open_span(CstKind::IndexOp);
                self.increment_emit("[");
                self.lex_expression();
                self.expect("]");
                self.close_span();
                continue;
            }
            if self.provider.increment("::") {
                let position = self.provider.position();
                self.emit(LexTokenType::Operation, "::", position);
                self.lex_trivia();
                self.lex_word();
                continue;
            }
            if self.provider.peek() == Some('.') {
                self.increment_emit(".");
                self.lex_trivia();
                self.lex_word();
                continue;
            }
            break;
        }
        self.close_span();
    }

    fn lex_call_args(&mut self) {
        self.open_span(CstKind::FunctionCall);
        self.increment_emit("(");
        self.lex_trivia();
        if self.provider.peek() != Some(')') {
            loop {
                self.lex_expression();
                if !self.increment_emit(",") {
                    break;
                }
            }
        }
        self.expect(")");
        self.close_span();
    }

    /// `name<Type, ...>(args)` — explicit generic arguments on a call.
    /// Speculative: restores the stream when the `<` turns out to be a
    /// comparison.
    fn try_generic_call(&mut self) -> bool {
        let saved = self.provider.save();
        let mark = self.nodes.len();
        self.open_span(CstKind::FunctionCall);
        self.increment_emit("<");
        let mut ok = true;
        loop {
            if !self.lex_type_quiet() {
                ok = false;
                break;
            }
            if !self.increment_emit(",") {
                break;
            }
        }
        ok = ok && self.increment_emit(">");
        self.lex_trivia();
        ok = ok && self.provider.peek() == Some('(');
        if !ok {
            self.abandon_span();
            self.nodes.truncate(mark);
            self.provider.restore(saved);
            return false;
        }
        self.increment_emit("(");
        self.lex_trivia();
        if self.provider.peek() != Some(')') {
            loop {
                self.lex_expression();
                if !self.increment_emit(",") {
                    break;
                }
            }
        }
        self.expect(")");
        self.close_span();
        true
    }

    /// Struct value folding: called right after the head identifier of a
    /// chain was emitted. Only fires when `{` follows immediately, and
    /// never in contexts where a struct value compound is illegal.
    fn try_struct_value(&mut self) -> bool {
        if self.inside_import || self.inside_for_init || self.inside_capture {
            return false;
        }
        let saved = self.provider.save();
        let mark = self.nodes.len();
        // optional generic args on the struct name
        let mut has_generic = false;
        self.lex_trivia();
        if self.provider.peek() == Some('<') {
            self.open_span(CstKind::GenericType);
            self.increment_emit("<");
            let mut ok = true;
            loop {
                if !self.lex_type_quiet() {
                    ok = false;
                    break;
                }
                if !self.increment_emit(",") {
                    break;
                }
            }
            ok = ok && self.increment_emit(">");
            if !ok {
                self.abandon_span();
                self.nodes.truncate(mark);
                self.provider.restore(saved);
            } else {
                self.close_span();
                has_generic = true;
            }
        }
        self.lex_trivia();
        if self.provider.peek() != Some('{') {
            if has_generic {
                self.nodes.truncate(mark);
                self.provider.restore(saved);
            }
            return false;
        }
        // refold: the chain span becomes a struct value span
        let Some((CstKind::AccessChain, start)) = self.stack.pop() else {
            return false;
        };
        self.stack.push((CstKind::StructValue, start));
        self.increment_emit("{");
        loop {
            self.lex_trivia();
            match self.provider.peek() {
                None | Some('}') => break,
                _ => {
                    if self.lex_word().is_none() {
                        let position = self.provider.position();
                        self.error(position, "expected a field name");
                        break;
                    }
                    self.expect(":");
                    self.lex_expression();
                    if !self.increment_emit(",") {
                        break;
                    }
                }
            }
        }
        self.expect("}");
        self.close_span();
        true
    }

    // ---- types ---------------------------------------------------------

    fn lex_type(&mut self) {
        if !self.lex_type_quiet() {
            let position = self.provider.position();
            self.error(position, "expected a type");
        }
    }

    /// Lex a type without reporting; used from speculative positions.
    /// Returns false (leaving consumed nodes in place) when no type starts
    /// here.
    fn lex_type_quiet(&mut self) -> bool {
        self.lex_trivia();
        let Some(c) = self.provider.peek() else {
            return false;
        };
        let base_ok = match c {
            '*' => {
                self.open_span(CstKind::PointerType);
                self.increment_emit("*");
                let ok = self.lex_type_quiet();
                self.close_span();
                ok
            }
            '[' if self.provider.peek_at(1) == Some(']') => {
                // capturing function type: [](params) => ret
                self.open_span(CstKind::FunctionType);
                self.increment_emit("[");
                self.increment_emit("]");
                let ok = self.lex_function_type_tail();
                self.close_span();
                ok
            }
            '(' => {
                self.open_span(CstKind::FunctionType);
                let ok = self.lex_function_type_tail();
                self.close_span();
                ok
            }
            _ => {
                let Some(word) = self.peek_word() else {
                    return false;
                };
                if TYPE_KEYWORDS.contains(&word.as_str()) {
                    self.lex_word();
                    true
                } else if KEYWORDS.contains(&word.as_str()) {
                    false
                } else {
                    self.open_span(CstKind::ReferencedType);
                    self.lex_word();
                    while self.provider.increment("::") {
                        let position = self.provider.position();
                        self.emit(LexTokenType::Operation, "::", position);
                        self.lex_trivia();
                        self.lex_word();
                    }
                    self.close_span();
                    let base_index = self.nodes.len() - 1;
                    self.lex_trivia();
                    if self.provider.peek() == Some('<') {
                        // generic use: fold the referenced base into the span
                        self.stack.push((CstKind::GenericType, base_index));
                        self.increment_emit("<");
                        loop {
                            if !self.lex_type_quiet() {
                                let position = self.provider.position();
                                self.error(position, "expected a generic type argument");
                                break;
                            }
                            if !self.increment_emit(",") {
                                break;
                            }
                        }
                        self.expect(">");
                        self.close_span();
                    }
                    true
                }
            }
        };
        if !base_ok {
            return false;
        }
        // array suffix: T[] or T[4]
        loop {
            let base_index = self.nodes.len() - 1;
            self.lex_trivia();
            if self.provider.peek() == Some('[')
                && matches!(self.provider.peek_at(1), Some(']') | Some('0'..='9'))
            {
                self.stack.push((CstKind::ArrayType, base_index));
                self.increment_emit("[");
                self.lex_trivia();
                if self.provider.peek() != Some(']') {
                    self.lex_number();
                }
                self.expect("]");
                self.close_span();
            } else {
                break;
            }
        }
        true
    }

    fn lex_function_type_tail(&mut self) -> bool {
        if !self.increment_emit("(") {
            return false;
        }
        self.lex_trivia();
        if self.provider.peek() != Some(')') {
            loop {
                let position = self.provider.position();
                if self.provider.increment("...") {
                    self.emit(LexTokenType::Operation, "...", position);
                    break;
                }
                if !self.lex_type_quiet() {
                    return false;
                }
                if !self.increment_emit(",") {
                    break;
                }
            }
        }
        if !self.increment_emit(")") {
            return false;
        }
        if !self.increment_emit("=>") {
            return false;
        }
        self.lex_type_quiet()
    }
}

fn classify_word(text: &str) -> LexTokenType {
    match text {
        "true" | "false" => LexTokenType::Bool,
        "null" => LexTokenType::Null,
        "sizeof" => LexTokenType::Keyword,
        _ if TYPE_KEYWORDS.contains(&text) => LexTokenType::TypeKeyword,
        _ if KEYWORDS.contains(&text) => LexTokenType::Keyword,
        _ => LexTokenType::Identifier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cst::CstKind;

    fn lex(source: &str) -> LexResult {
        Lexer::new(source, "test.ch").lex()
    }

    fn roundtrip(source: &str) {
        let result = lex(source);
        assert!(
            !result.diagnostics.has_errors(),
            "unexpected errors: {:?}",
            result.diagnostics.iter().collect::<Vec<_>>()
        );
        assert_eq!(result.unit.source_text(), source);
    }

    #[test]
    fn test_roundtrip_function() {
        roundtrip("func main() : int {\n    return 0;\n}\n");
    }

    #[test]
    fn test_roundtrip_struct_and_var() {
        roundtrip("struct P { x : int; y : int; }\nvar p = mk(3, 4);\n");
    }

    #[test]
    fn test_roundtrip_comments_kept() {
        roundtrip("// leading\nfunc main() : int { return 0; /* done */ }\n");
    }

    #[test]
    fn test_roundtrip_generics_and_lambda() {
        roundtrip(
            "struct Vec<T> { data : *T; len : int; }\nfunc size<T>(v : Vec<T>) : int { return v.len; }\nfunc go() : void { var x = 3; var f = [x](y : int) => x + y; }\n",
        );
    }

    #[test]
    fn test_function_compound_produced() {
        let result = lex("func main() : int { return 0; }");
        let functions: Vec<_> = result
            .unit
            .children()
            .iter()
            .filter(|n| n.is_compound(CstKind::Function))
            .collect();
        assert_eq!(functions.len(), 1);
    }

    #[test]
    fn test_unterminated_string_reports_open_position() {
        let result = lex("var s = \"abc;\n");
        assert!(result.diagnostics.has_errors());
        let diagnostic = result.diagnostics.iter().next().unwrap();
        assert_eq!(diagnostic.position.column, 8);
    }

    #[test]
    fn test_stray_character_dropped() {
        let result = lex("func main() : int { return 0; } $");
        assert!(result.diagnostics.has_errors());
        // the stray character still shows up as a raw leaf
        let tokens = result.tokens();
        assert!(tokens.iter().any(|t| t.kind == LexTokenType::Raw));
    }

    #[test]
    fn test_access_chain_with_calls() {
        let result = lex("func f() : void { a.b().c.d(); }");
        assert!(!result.diagnostics.has_errors());
        let text = result.unit.source_text();
        assert!(text.contains("a.b().c.d()"));
    }

    #[test]
    fn test_array_value_not_lambda() {
        let result = lex("func f() : void { var a = [1, 2, 3]; }");
        assert!(!result.diagnostics.has_errors());
    }

    #[test]
    fn test_struct_value() {
        let result = lex("func f() : P { return P { x : 1, y : 2 }; }");
        assert!(!result.diagnostics.has_errors());
    }
}
