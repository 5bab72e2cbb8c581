use serde::{Deserialize, Serialize};

use crate::diagnostics::Position;

/// Closed set of lex token kinds. Compound CST kinds live in
/// [`crate::cst::CstKind`]; everything here is a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LexTokenType {
    /// Single character operator or punctuator, e.g. `+`, `;`, `{`.
    CharOperator,
    /// Multi character operator, e.g. `==`, `&&`, `=>`, `::`.
    Operation,
    /// Numeric literal, textual form only; typing happens in the converter.
    Number,
    /// String literal including quotes, interior escapes kept verbatim.
    String,
    /// Character literal including quotes.
    Char,
    /// `true` / `false`.
    Bool,
    /// `null`.
    Null,
    Identifier,
    /// Reserved word that is not a type keyword: `func`, `var`, `if`, ...
    Keyword,
    /// Builtin type name: `int`, `bool`, `void`, ...
    TypeKeyword,
    /// `@name` annotation marker.
    Annotation,
    /// `// ...` comment, text includes the slashes.
    Comment,
    /// `/* ... */` comment, text includes the delimiters.
    MultilineComment,
    /// Whitespace run. Kept so the CST stays lossless.
    Whitespace,
    /// Anything the lexer dropped during recovery.
    Raw,
}

impl LexTokenType {
    /// Whether the token's text carries meaning beyond marking structure.
    /// Structural markers still store their text for lossless round-trips.
    pub fn is_significant(self) -> bool {
        !matches!(
            self,
            LexTokenType::CharOperator
                | LexTokenType::Operation
                | LexTokenType::Whitespace
        )
    }

    /// Trivia never reaches the converter's working stacks.
    pub fn is_trivia(self) -> bool {
        matches!(
            self,
            LexTokenType::Whitespace | LexTokenType::Comment | LexTokenType::MultilineComment
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: LexTokenType,
    pub value: String,
    pub position: Position,
}

impl Token {
    pub fn new(kind: LexTokenType, value: impl Into<String>, position: Position) -> Self {
        Self {
            kind,
            value: value.into(),
            position,
        }
    }

    /// End position of this token, derived from its text. Only line breaks
    /// inside multiline comments and whitespace move the line.
    pub fn end_position(&self) -> Position {
        let mut line = self.position.line;
        let mut column = self.position.column;
        for c in self.value.chars() {
            if c == '\n' {
                line += 1;
                column = 0;
            } else {
                column += 1;
            }
        }
        Position::new(line, column)
    }
}

pub const KEYWORDS: &[&str] = &[
    "break", "case", "const", "continue", "default", "delete", "do", "else", "enum", "for",
    "func", "if", "impl", "import", "interface", "namespace", "return", "struct", "switch",
    "throw", "typealias", "union", "using", "var", "while", "as",
];

pub const TYPE_KEYWORDS: &[&str] = &[
    "any", "void", "bool", "char", "short", "ushort", "int", "uint", "long", "ulong", "bigint",
    "ubigint", "float", "double", "string",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_significance() {
        assert!(LexTokenType::Identifier.is_significant());
        assert!(LexTokenType::Number.is_significant());
        assert!(!LexTokenType::CharOperator.is_significant());
        assert!(!LexTokenType::Operation.is_significant());
    }

    #[test]
    fn test_end_position_spans_lines() {
        let token = Token::new(
            LexTokenType::MultilineComment,
            "/* a\nb */",
            Position::new(2, 4),
        );
        assert_eq!(token.end_position(), Position::new(3, 4));
    }
}
