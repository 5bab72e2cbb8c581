//! Visitor over the resolved AST. Dispatches on node variant; every
//! method defaults to recursing, so implementations override only what
//! they need. Child nodes are reached through the owning file's arena.

use super::node::Node;
use super::value::{ChainElement, Value};
use super::{FileAst, NodeId};

pub trait AstVisitor {
    fn visit_node(&mut self, file: &FileAst, id: NodeId) {
        walk_node(self, file, id);
    }

    fn visit_value(&mut self, file: &FileAst, value: &Value) {
        walk_value(self, file, value);
    }

    fn walk(&mut self, file: &FileAst, id: NodeId) {
        walk_node(self, file, id);
    }
}

impl FileAst {
    /// Walk the file's top-level nodes in source order.
    pub fn accept<V: AstVisitor + ?Sized>(&self, visitor: &mut V) {
        for id in &self.root {
            visitor.visit_node(self, *id);
        }
    }
}

pub fn walk_node<V: AstVisitor + ?Sized>(visitor: &mut V, file: &FileAst, id: NodeId) {
    match file.node(id) {
        Node::VarInit(init) => {
            if let Some(value) = &init.value {
                visitor.visit_value(file, value);
            }
        }
        Node::Assignment(stmt) => {
            if let Some(lhs) = &stmt.lhs {
                visitor.visit_value(file, lhs);
            }
            visitor.visit_value(file, &stmt.value);
        }
        Node::IncDec(stmt) => visitor.visit_value(file, &stmt.target),
        Node::If(stmt) => {
            visitor.visit_value(file, &stmt.condition);
            visitor.visit_node(file, stmt.then_body);
            for (condition, body) in &stmt.else_ifs {
                visitor.visit_value(file, condition);
                visitor.visit_node(file, *body);
            }
            if let Some(else_body) = stmt.else_body {
                visitor.visit_node(file, else_body);
            }
        }
        Node::While(stmt) => {
            visitor.visit_value(file, &stmt.condition);
            visitor.visit_node(file, stmt.body);
        }
        Node::DoWhile(stmt) => {
            visitor.visit_node(file, stmt.body);
            visitor.visit_value(file, &stmt.condition);
        }
        Node::ForLoop(stmt) => {
            visitor.visit_node(file, stmt.init);
            visitor.visit_value(file, &stmt.condition);
            visitor.visit_node(file, stmt.increment);
            visitor.visit_node(file, stmt.body);
        }
        Node::Switch(stmt) => {
            visitor.visit_value(file, &stmt.expression);
            for (value, body) in &stmt.cases {
                visitor.visit_value(file, value);
                visitor.visit_node(file, *body);
            }
            if let Some(default_case) = stmt.default_case {
                visitor.visit_node(file, default_case);
            }
        }
        Node::Return(stmt) => {
            if let Some(value) = &stmt.value {
                visitor.visit_value(file, value);
            }
        }
        Node::Throw(stmt) => visitor.visit_value(file, &stmt.value),
        Node::Delete(stmt) => visitor.visit_value(file, &stmt.value),
        Node::Function(decl) => {
            if let Some(body) = decl.body {
                visitor.visit_node(file, body);
            }
        }
        Node::ExtensionFunction(ext) => {
            if let Some(body) = ext.decl.body {
                visitor.visit_node(file, body);
            }
        }
        Node::StructDef(def) => {
            for member in &def.members {
                if let Some(default) = &member.default_value {
                    visitor.visit_value(file, default);
                }
            }
            for function in &def.functions {
                visitor.visit_node(file, *function);
            }
            for nested in &def.nested {
                visitor.visit_node(file, *nested);
            }
        }
        Node::UnionDef(def) => {
            for function in &def.functions {
                visitor.visit_node(file, *function);
            }
        }
        Node::Interface(def) => {
            for function in &def.functions {
                visitor.visit_node(file, *function);
            }
        }
        Node::Impl(def) => {
            for function in &def.functions {
                visitor.visit_node(file, *function);
            }
        }
        Node::Namespace(ns) => {
            for child in &ns.body {
                visitor.visit_node(file, *child);
            }
        }
        Node::Scope(scope) => {
            for child in &scope.body {
                visitor.visit_node(file, *child);
            }
        }
        _ => {}
    }
}

pub fn walk_value<V: AstVisitor + ?Sized>(visitor: &mut V, file: &FileAst, value: &Value) {
    match value {
        Value::Chain(chain) => {
            for element in &chain.elements {
                match element {
                    ChainElement::Index { index, .. } => visitor.visit_value(file, index),
                    ChainElement::Call { args, .. } => {
                        for arg in args {
                            visitor.visit_value(file, arg);
                        }
                    }
                    ChainElement::Identifier { .. } => {}
                }
            }
        }
        Value::Expression { lhs, rhs, .. } => {
            visitor.visit_value(file, lhs);
            visitor.visit_value(file, rhs);
        }
        Value::Negative { value, .. }
        | Value::Not { value, .. }
        | Value::AddrOf { value, .. }
        | Value::Dereference { value, .. }
        | Value::Cast { value, .. } => visitor.visit_value(file, value),
        Value::Ternary {
            condition,
            left,
            right,
            ..
        } => {
            visitor.visit_value(file, condition);
            visitor.visit_value(file, left);
            visitor.visit_value(file, right);
        }
        Value::Lambda(lambda) => visitor.visit_node(file, lambda.body),
        Value::StructValue(struct_value) => {
            for (_, field_value) in &struct_value.fields {
                visitor.visit_value(file, field_value);
            }
        }
        Value::ArrayValue { values, .. } => {
            for element in values {
                visitor.visit_value(file, element);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{FileId, Module};
    use crate::converter::Converter;
    use crate::lexer::Lexer;

    struct CallCounter(usize);

    impl AstVisitor for CallCounter {
        fn visit_value(&mut self, file: &FileAst, value: &Value) {
            if let Value::Chain(chain) = value {
                if chain.is_call() {
                    self.0 += 1;
                }
            }
            walk_value(self, file, value);
        }
    }

    #[test]
    fn test_visitor_reaches_nested_values() {
        let source =
            "func f() : int { if (g() > 0) { return h(); } return 0; }";
        let lexed = Lexer::new(source, "visit.ch").lex();
        let converted = Converter::new(FileId(0), "visit.ch").convert(&lexed.unit);
        let mut module = Module::new();
        let file = module.add_file(converted.file);

        let mut counter = CallCounter(0);
        module.file(file).accept(&mut counter);
        assert_eq!(counter.0, 2, "both calls found through the default walk");
    }
}
