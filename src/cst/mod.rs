//! Concrete syntax tree. Immutable after lexing ends; lossless over the
//! source text. Symbol servers and completion can work on this tree alone,
//! without the AST.

use serde::{Deserialize, Serialize};

use crate::diagnostics::Position;
use crate::lexer::Token;

/// Closed set of compound node kinds, mirroring AST concepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CstKind {
    Unit,
    // statements
    VarInit,
    Assignment,
    IncDec,
    Break,
    Continue,
    Return,
    Throw,
    Delete,
    Import,
    Typealias,
    Using,
    If,
    While,
    DoWhile,
    ForLoop,
    Switch,
    // structures
    Function,
    FunctionParam,
    GenericParamList,
    StructDef,
    StructMember,
    UnionDef,
    Interface,
    Impl,
    EnumDecl,
    Namespace,
    Body,
    // types
    PointerType,
    ArrayType,
    GenericType,
    FunctionType,
    ReferencedType,
    // values
    AccessChain,
    FunctionCall,
    IndexOp,
    Expression,
    Negative,
    Not,
    AddrOf,
    Dereference,
    CastValue,
    SizeOf,
    Lambda,
    CaptureList,
    StructValue,
    ArrayValue,
    TernaryValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CstNode {
    Leaf(Token),
    Compound { kind: CstKind, children: Vec<CstNode> },
}

impl CstNode {
    pub fn kind(&self) -> Option<CstKind> {
        match self {
            CstNode::Leaf(_) => None,
            CstNode::Compound { kind, .. } => Some(*kind),
        }
    }

    pub fn is_compound(&self, kind: CstKind) -> bool {
        self.kind() == Some(kind)
    }

    pub fn children(&self) -> &[CstNode] {
        match self {
            CstNode::Leaf(_) => &[],
            CstNode::Compound { children, .. } => children,
        }
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            CstNode::Leaf(token) => Some(token),
            CstNode::Compound { .. } => None,
        }
    }

    /// Position of the first leaf token under this node.
    pub fn start_position(&self) -> Position {
        match self {
            CstNode::Leaf(token) => token.position,
            CstNode::Compound { children, .. } => children
                .first()
                .map(CstNode::start_position)
                .unwrap_or_default(),
        }
    }

    /// End position of the last leaf token under this node.
    pub fn end_position(&self) -> Position {
        match self {
            CstNode::Leaf(token) => token.end_position(),
            CstNode::Compound { children, .. } => children
                .last()
                .map(CstNode::end_position)
                .unwrap_or_default(),
        }
    }

    /// All leaf tokens, in source order.
    pub fn collect_tokens<'a>(&'a self, out: &mut Vec<&'a Token>) {
        match self {
            CstNode::Leaf(token) => out.push(token),
            CstNode::Compound { children, .. } => {
                for child in children {
                    child.collect_tokens(out);
                }
            }
        }
    }

    /// Reconstruct the exact source text covered by this node.
    pub fn source_text(&self) -> String {
        let mut tokens = vec![];
        self.collect_tokens(&mut tokens);
        tokens.iter().map(|t| t.value.as_str()).collect()
    }

    pub fn accept<V: CstVisitor + ?Sized>(&self, visitor: &mut V) {
        match self {
            CstNode::Leaf(token) => visitor.visit_token(token),
            CstNode::Compound { kind, .. } => visitor.visit_compound(*kind, self),
        }
    }
}

/// Visitor over the CST, dispatching on compound kind. Every method has a
/// default that recurses, so implementations only override what they need.
pub trait CstVisitor {
    fn visit_token(&mut self, _token: &Token) {}

    fn visit_compound(&mut self, kind: CstKind, node: &CstNode) {
        match kind {
            CstKind::Function => self.visit_function(node),
            CstKind::StructDef => self.visit_struct_def(node),
            CstKind::VarInit => self.visit_var_init(node),
            CstKind::AccessChain => self.visit_access_chain(node),
            CstKind::Body => self.visit_body(node),
            _ => self.walk(node),
        }
    }

    fn visit_function(&mut self, node: &CstNode) {
        self.walk(node);
    }

    fn visit_struct_def(&mut self, node: &CstNode) {
        self.walk(node);
    }

    fn visit_var_init(&mut self, node: &CstNode) {
        self.walk(node);
    }

    fn visit_access_chain(&mut self, node: &CstNode) {
        self.walk(node);
    }

    fn visit_body(&mut self, node: &CstNode) {
        self.walk(node);
    }

    fn walk(&mut self, node: &CstNode) {
        for child in node.children() {
            child.accept(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::LexTokenType;

    fn leaf(value: &str, line: usize, column: usize) -> CstNode {
        CstNode::Leaf(Token::new(
            LexTokenType::Identifier,
            value,
            Position::new(line, column),
        ))
    }

    #[test]
    fn test_positions_cover_children() {
        let node = CstNode::Compound {
            kind: CstKind::AccessChain,
            children: vec![leaf("a", 0, 0), leaf("b", 0, 2)],
        };
        assert_eq!(node.start_position(), Position::new(0, 0));
        assert_eq!(node.end_position(), Position::new(0, 3));
    }

    #[test]
    fn test_source_text_concatenates_leaves() {
        let node = CstNode::Compound {
            kind: CstKind::Expression,
            children: vec![
                leaf("a", 0, 0),
                CstNode::Compound {
                    kind: CstKind::AccessChain,
                    children: vec![leaf("b", 0, 1)],
                },
            ],
        };
        assert_eq!(node.source_text(), "ab");
    }

    #[test]
    fn test_visitor_default_recurses() {
        struct Counter(usize);
        impl CstVisitor for Counter {
            fn visit_token(&mut self, _token: &Token) {
                self.0 += 1;
            }
        }

        let node = CstNode::Compound {
            kind: CstKind::Unit,
            children: vec![
                leaf("a", 0, 0),
                CstNode::Compound {
                    kind: CstKind::Body,
                    children: vec![leaf("b", 1, 0), leaf("c", 1, 1)],
                },
            ],
        };
        let mut counter = Counter(0);
        node.accept(&mut counter);
        assert_eq!(counter.0, 3);
    }
}
