//! CST → AST conversion. A single forward walk over the unit's compound
//! nodes folds each into typed AST nodes, values and types. Errors never
//! abort the walk: the converter allocates an error placeholder and moves
//! on, so later phases see a complete (if partially broken) file.

use std::path::PathBuf;

use log::trace;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::ast::{
    AccessChain, Annotation, BinaryOp, CapturedVariable, ChainElement, EnumDecl, ErrorNode,
    FileAst, FileId, ForLoop, FunctionDecl, FunctionParam, IfStmt, ImplDef, ImportStmt, IncDec,
    InterfaceDef, LambdaValue, NamespaceDecl, Node, NodeId, ReturnStmt, Scope, StructDef,
    StructMember, StructValue, SwitchStmt, ThrowStmt, Type, TypealiasStmt, UnionDef,
    UnnamedStruct, UnnamedUnion, UsingStmt, Value, VarInit, WhileLoop,
};
use crate::ast::node::{Assignment, DeleteStmt, DoWhileLoop, ExtensionFunction};
use crate::cst::{CstKind, CstNode};
use crate::diagnostics::{Diagnostics, Position};
use crate::lexer::{LexTokenType, Token};

static HEX_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0[xX][0-9a-fA-F]+$").unwrap());
static FLOAT_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+\.[0-9]+f$").unwrap());
static DOUBLE_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+\.[0-9]+$").unwrap());
static INT_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9]+(u|l|ul)?$").unwrap());

pub struct ConvertResult {
    pub file: FileAst,
    pub diagnostics: Diagnostics,
}

pub struct Converter {
    file: FileAst,
    file_path: PathBuf,
    diagnostics: Diagnostics,
    /// Annotations seen since the last declaration; attach to the next one.
    pending_annotations: Vec<Annotation>,
    next_call_id: u32,
    next_lambda_id: u32,
}

impl Converter {
    pub fn new(file_id: FileId, file_path: impl Into<PathBuf>) -> Self {
        let file_path = file_path.into();
        Self {
            file: FileAst::new(file_id, file_path.clone()),
            file_path,
            diagnostics: Diagnostics::new(),
            pending_annotations: vec![],
            next_call_id: 0,
            next_lambda_id: 0,
        }
    }

    pub fn convert(mut self, unit: &CstNode) -> ConvertResult {
        for child in unit.children() {
            if let Some(id) = self.convert_top_level(child) {
                self.file.root.push(id);
            }
        }
        ConvertResult {
            file: self.file,
            diagnostics: self.diagnostics,
        }
    }

    fn error(&mut self, position: Position, message: impl Into<String>) {
        let file = self.file_path.clone();
        self.diagnostics.error(position, &file, message);
    }

    fn error_node(&mut self, position: Position, message: impl Into<String>) -> NodeId {
        let message = message.into();
        self.error(position, message.clone());
        self.file.alloc(Node::Error(ErrorNode { message, position }))
    }

    fn take_annotations(&mut self) -> Vec<Annotation> {
        std::mem::take(&mut self.pending_annotations)
    }

    // ---- statements & declarations -------------------------------------

    fn convert_top_level(&mut self, node: &CstNode) -> Option<NodeId> {
        if let Some(token) = node.token() {
            if token.kind == LexTokenType::Annotation {
                self.pending_annotations.push(Annotation {
                    name: token.value.trim_start_matches('@').to_string(),
                    position: token.position,
                });
            }
            // trivia and recovery leftovers produce nothing
            return None;
        }
        trace!("converting top level {:?}", node.kind());
        self.convert_compound(node)
    }

    fn convert_compound(&mut self, node: &CstNode) -> Option<NodeId> {
        let kind = node.kind()?;
        let converted = match kind {
            CstKind::Import => self.convert_import(node),
            CstKind::Using => self.convert_using(node),
            CstKind::Typealias => self.convert_typealias(node),
            CstKind::VarInit => self.convert_var_init(node),
            CstKind::Function => self.convert_function(node),
            CstKind::StructDef => self.convert_struct_def(node),
            CstKind::UnionDef => self.convert_union_def(node),
            CstKind::Interface => self.convert_interface(node),
            CstKind::Impl => self.convert_impl(node),
            CstKind::EnumDecl => self.convert_enum(node),
            CstKind::Namespace => self.convert_namespace(node),
            CstKind::If => self.convert_if(node),
            CstKind::While => self.convert_while(node),
            CstKind::DoWhile => self.convert_do_while(node),
            CstKind::ForLoop => self.convert_for(node),
            CstKind::Switch => self.convert_switch(node),
            CstKind::Return => self.convert_return(node),
            CstKind::Break => Some(self.file.alloc(Node::Break {
                position: node.start_position(),
            })),
            CstKind::Continue => Some(self.file.alloc(Node::Continue {
                position: node.start_position(),
            })),
            CstKind::Throw => self.convert_throw(node),
            CstKind::Delete => self.convert_delete(node),
            CstKind::Assignment => self.convert_assignment(node),
            CstKind::IncDec => self.convert_inc_dec(node),
            CstKind::AccessChain | CstKind::Dereference => {
                // bare expression statement
                let position = node.start_position();
                let value = self.convert_value(node);
                Some(self.file.alloc(Node::Assignment(Assignment {
                    lhs: None,
                    value,
                    position,
                })))
            }
            other => {
                let position = node.start_position();
                Some(self.error_node(
                    position,
                    format!("unexpected {other:?} in statement position"),
                ))
            }
        };
        converted
    }

    fn convert_import(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let mut path = String::new();
        let mut as_identifier = None;
        let mut saw_as = false;
        for child in &children {
            if let Some(token) = child.token() {
                match token.kind {
                    LexTokenType::String => path = unquote(&token.value),
                    LexTokenType::Keyword if token.value == "as" => saw_as = true,
                    LexTokenType::Identifier if saw_as => {
                        as_identifier = Some(token.value.clone());
                    }
                    _ => {}
                }
            }
        }
        if path.is_empty() {
            return Some(self.error_node(position, "import is missing its path"));
        }
        Some(self.file.alloc(Node::Import(ImportStmt {
            path,
            as_identifier,
            resolved: None,
            position,
        })))
    }

    fn convert_using(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let mut path = vec![];
        let mut is_namespace = false;
        for child in &children {
            if let Some(token) = child.token() {
                match token.kind {
                    LexTokenType::Keyword if token.value == "namespace" => is_namespace = true,
                    LexTokenType::Identifier => path.push(token.value.clone()),
                    _ => {}
                }
            }
        }
        Some(self.file.alloc(Node::Using(UsingStmt {
            path,
            is_namespace,
            position,
        })))
    }

    fn convert_typealias(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let name = find_identifier(&children)?;
        let to = children
            .iter()
            .find(|c| is_type_node(c))
            .map(|c| self.convert_type(c))
            .unwrap_or(Type::Any);
        Some(self.file.alloc(Node::Typealias(TypealiasStmt {
            name,
            to,
            position,
        })))
    }

    fn convert_var_init(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let is_const = children
            .first()
            .and_then(|c| c.token())
            .map(|t| t.value == "const")
            .unwrap_or(false);
        let Some(name) = find_identifier(&children) else {
            return Some(self.error_node(position, "variable is missing its name"));
        };
        let declared_type = children
            .iter()
            .find(|c| is_type_node(c))
            .map(|c| self.convert_type(c));
        // the initialiser is the value node after `=`
        let mut value = None;
        let mut saw_assign = false;
        for child in &children {
            if let Some(token) = child.token() {
                if token.kind == LexTokenType::CharOperator && token.value == "=" {
                    saw_assign = true;
                    continue;
                }
            }
            if saw_assign && is_value_node(child) {
                value = Some(self.convert_value(child));
                break;
            }
        }
        let annotations = self.take_annotations();
        Some(self.file.alloc(Node::VarInit(VarInit {
            name,
            is_const,
            declared_type,
            value,
            annotations,
            position,
        })))
    }

    fn convert_function(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let annotations = self.take_annotations();

        let mut receiver = None;
        let mut name = None;
        let mut generic_params = vec![];
        let mut params = vec![];
        let mut is_variadic = false;
        let mut return_type = None;
        let mut body = None;
        let mut saw_colon = false;

        let mut index = 0;
        while index < children.len() {
            let child = children[index];
            match child {
                CstNode::Leaf(token) => match token.kind {
                    LexTokenType::Identifier if name.is_none() => {
                        name = Some(token.value.clone());
                    }
                    LexTokenType::CharOperator if token.value == ":" => saw_colon = true,
                    LexTokenType::Operation if token.value == "..." => is_variadic = true,
                    _ => {}
                },
                CstNode::Compound { kind, .. } => match kind {
                    CstKind::FunctionParam => {
                        let param = self.convert_function_param(child);
                        if name.is_none() {
                            // a parameter before the name: extension receiver
                            receiver = Some(param);
                        } else {
                            params.push(param);
                        }
                    }
                    CstKind::GenericParamList => {
                        generic_params = significant(child)
                            .iter()
                            .filter_map(|c| c.token())
                            .filter(|t| t.kind == LexTokenType::Identifier)
                            .map(|t| t.value.clone())
                            .collect();
                    }
                    CstKind::Body => {
                        body = Some(self.convert_body(child));
                    }
                    _ if saw_colon && return_type.is_none() && is_type_node(child) => {
                        return_type = Some(self.convert_type(child));
                    }
                    _ => {}
                },
            }
            // a bare type keyword return type arrives as a leaf
            if saw_colon && return_type.is_none() {
                if let Some(token) = child.token() {
                    if token.kind == LexTokenType::TypeKeyword {
                        return_type = Some(keyword_type(&token.value));
                    }
                }
            }
            index += 1;
        }

        let Some(name) = name else {
            return Some(self.error_node(position, "function is missing its name"));
        };
        let decl = FunctionDecl {
            name,
            generic_params,
            params,
            is_variadic,
            return_type: return_type.unwrap_or(Type::Void),
            body,
            annotations,
            iterations: vec![],
            position,
        };
        let node = match receiver {
            Some(receiver) => Node::ExtensionFunction(ExtensionFunction { receiver, decl }),
            None => Node::Function(decl),
        };
        Some(self.file.alloc(node))
    }

    fn convert_function_param(&mut self, node: &CstNode) -> FunctionParam {
        let children = significant(node);
        let position = node.start_position();
        let name = find_identifier(&children).unwrap_or_default();
        let param_type = children
            .iter()
            .find(|c| is_type_node(c))
            .map(|c| self.convert_type(c))
            .unwrap_or(Type::Any);
        FunctionParam {
            name,
            param_type,
            position,
        }
    }

    fn convert_struct_def(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let annotations = self.take_annotations();
        let name = find_identifier(&children);

        let mut generic_params = vec![];
        let mut members = vec![];
        let mut functions = vec![];
        let mut nested = vec![];

        let mut index = 0;
        while index < children.len() {
            let child = children[index];
            match child.kind() {
                Some(CstKind::GenericParamList) => {
                    generic_params = significant(child)
                        .iter()
                        .filter_map(|c| c.token())
                        .filter(|t| t.kind == LexTokenType::Identifier)
                        .map(|t| t.value.clone())
                        .collect();
                }
                Some(CstKind::StructMember) => {
                    members.push(self.convert_struct_member(child));
                }
                Some(CstKind::Function) => {
                    if let Some(id) = self.convert_function(child) {
                        functions.push(id);
                    }
                }
                Some(CstKind::StructDef) | Some(CstKind::UnionDef) => {
                    // unnamed member defs carry a trailing identifier leaf
                    let trailing = children
                        .get(index + 1)
                        .and_then(|c| c.token())
                        .filter(|t| t.kind == LexTokenType::Identifier)
                        .map(|t| t.value.clone());
                    if let Some(member_name) = trailing {
                        let id = self.convert_unnamed_member(child, member_name);
                        nested.push(id);
                        index += 1;
                    } else if let Some(id) = self.convert_compound(child) {
                        nested.push(id);
                    }
                }
                None => {
                    if let Some(token) = child.token() {
                        if token.kind == LexTokenType::Annotation {
                            self.pending_annotations.push(Annotation {
                                name: token.value.trim_start_matches('@').to_string(),
                                position: token.position,
                            });
                        }
                    }
                }
                _ => {}
            }
            index += 1;
        }

        match node.kind() {
            Some(CstKind::UnionDef) => Some(self.file.alloc(Node::UnionDef(UnionDef {
                name: name.unwrap_or_default(),
                members,
                functions,
                annotations,
                position,
            }))),
            _ => Some(self.file.alloc(Node::StructDef(StructDef {
                name: name.unwrap_or_default(),
                generic_params,
                members,
                functions,
                nested,
                annotations,
                iterations: vec![],
                position,
            }))),
        }
    }

    fn convert_union_def(&mut self, node: &CstNode) -> Option<NodeId> {
        self.convert_struct_def(node)
    }

    fn convert_unnamed_member(&mut self, node: &CstNode, member_name: String) -> NodeId {
        let children = significant(node);
        let position = node.start_position();
        let members = children
            .iter()
            .filter(|c| c.is_compound(CstKind::StructMember))
            .map(|c| self.convert_struct_member(c))
            .collect();
        match node.kind() {
            Some(CstKind::UnionDef) => self.file.alloc(Node::UnnamedUnion(UnnamedUnion {
                member_name,
                members,
                position,
            })),
            _ => self.file.alloc(Node::UnnamedStruct(UnnamedStruct {
                member_name,
                members,
                position,
            })),
        }
    }

    fn convert_struct_member(&mut self, node: &CstNode) -> StructMember {
        let children = significant(node);
        let position = node.start_position();
        let name = find_identifier(&children).unwrap_or_default();
        let member_type = children
            .iter()
            .find(|c| is_type_node(c))
            .map(|c| self.convert_type(c))
            .unwrap_or(Type::Any);
        let mut default_value = None;
        let mut saw_assign = false;
        for child in &children {
            if let Some(token) = child.token() {
                if token.kind == LexTokenType::CharOperator && token.value == "=" {
                    saw_assign = true;
                    continue;
                }
            }
            if saw_assign && is_value_node(child) {
                default_value = Some(self.convert_value(child));
                break;
            }
        }
        StructMember {
            name,
            member_type,
            default_value,
            position,
        }
    }

    fn convert_interface(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let name = find_identifier(&children)?;
        let functions = children
            .iter()
            .filter(|c| c.is_compound(CstKind::Function))
            .filter_map(|c| self.convert_function(c))
            .collect();
        Some(self.file.alloc(Node::Interface(InterfaceDef {
            name,
            functions,
            position,
        })))
    }

    fn convert_impl(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let mut names = children
            .iter()
            .filter_map(|c| c.token())
            .filter(|t| t.kind == LexTokenType::Identifier)
            .map(|t| t.value.clone());
        let Some(interface_name) = names.next() else {
            return Some(self.error_node(position, "impl is missing its interface name"));
        };
        let target_name = names.next();
        let functions = children
            .iter()
            .filter(|c| c.is_compound(CstKind::Function))
            .filter_map(|c| self.convert_function(c))
            .collect();
        Some(self.file.alloc(Node::Impl(ImplDef {
            interface_name,
            interface: None,
            target_name,
            target: None,
            functions,
            position,
        })))
    }

    fn convert_enum(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let mut identifiers = children
            .iter()
            .filter_map(|c| c.token())
            .filter(|t| t.kind == LexTokenType::Identifier)
            .map(|t| t.value.clone());
        let Some(name) = identifiers.next() else {
            return Some(self.error_node(position, "enum is missing its name"));
        };
        let members = identifiers.collect();
        Some(self.file.alloc(Node::Enum(EnumDecl {
            name,
            members,
            position,
        })))
    }

    fn convert_namespace(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let name = find_identifier(&children)?;
        let mut body = vec![];
        for child in &children {
            if child.kind().is_some() {
                if let Some(id) = self.convert_compound(child) {
                    body.push(id);
                }
            } else if let Some(token) = child.token() {
                if token.kind == LexTokenType::Annotation {
                    self.pending_annotations.push(Annotation {
                        name: token.value.trim_start_matches('@').to_string(),
                        position: token.position,
                    });
                }
            }
        }
        Some(self.file.alloc(Node::Namespace(NamespaceDecl {
            name,
            body,
            position,
        })))
    }

    fn convert_body(&mut self, node: &CstNode) -> NodeId {
        let position = node.start_position();
        let mut body = vec![];
        for child in node.children() {
            if let Some(token) = child.token() {
                if token.kind == LexTokenType::Annotation {
                    self.pending_annotations.push(Annotation {
                        name: token.value.trim_start_matches('@').to_string(),
                        position: token.position,
                    });
                }
                continue;
            }
            if let Some(id) = self.convert_compound(child) {
                body.push(id);
            }
        }
        self.file.alloc(Node::Scope(Scope { body, position }))
    }

    /// The statement-or-body position of `if`/`while`/`for`: a real body
    /// converts as-is, a single statement is wrapped into its own scope.
    fn convert_statement_or_body(&mut self, node: &CstNode) -> NodeId {
        if node.is_compound(CstKind::Body) {
            return self.convert_body(node);
        }
        let position = node.start_position();
        let body = self.convert_compound(node).into_iter().collect();
        self.file.alloc(Node::Scope(Scope { body, position }))
    }

    fn convert_if(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();

        // shape: if ( cond ) part { else if ( cond ) part }* { else part }?
        let mut conditions = vec![];
        let mut bodies = vec![];
        let mut else_body = None;
        let mut expecting_condition = true;
        let mut saw_else = false;

        let mut index = 0;
        while index < children.len() {
            let child = children[index];
            if let Some(token) = child.token() {
                match (token.kind, token.value.as_str()) {
                    (LexTokenType::Keyword, "else") => saw_else = true,
                    (LexTokenType::Keyword, "if") if saw_else => {
                        expecting_condition = true;
                        saw_else = false;
                    }
                    _ => {}
                }
                index += 1;
                continue;
            }
            if expecting_condition && is_value_node(child) {
                conditions.push(self.convert_value(child));
                expecting_condition = false;
            } else if saw_else {
                else_body = Some(self.convert_statement_or_body(child));
                saw_else = false;
            } else {
                bodies.push(self.convert_statement_or_body(child));
            }
            index += 1;
        }

        if conditions.is_empty() || bodies.is_empty() {
            return Some(self.error_node(position, "malformed if statement"));
        }
        let condition = conditions.remove(0);
        let then_body = bodies.remove(0);
        let else_ifs = conditions.into_iter().zip(bodies).collect();
        Some(self.file.alloc(Node::If(IfStmt {
            condition,
            then_body,
            else_ifs,
            else_body,
            position,
        })))
    }

    fn convert_while(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let condition = children
            .iter()
            .find(|c| is_value_node(c))
            .map(|c| self.convert_value(c))
            .unwrap_or(Value::Error { position });
        let body = children
            .iter()
            .rev()
            .find(|c| is_statement_node(c))
            .map(|c| self.convert_statement_or_body(c));
        let Some(body) = body else {
            return Some(self.error_node(position, "while is missing its body"));
        };
        Some(self.file.alloc(Node::While(WhileLoop {
            condition,
            body,
            position,
        })))
    }

    fn convert_do_while(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let body = children
            .iter()
            .find(|c| c.is_compound(CstKind::Body))
            .map(|c| self.convert_body(c));
        let condition = children
            .iter()
            .rev()
            .find(|c| is_value_node(c))
            .map(|c| self.convert_value(c))
            .unwrap_or(Value::Error { position });
        let Some(body) = body else {
            return Some(self.error_node(position, "do-while is missing its body"));
        };
        Some(self.file.alloc(Node::DoWhile(DoWhileLoop {
            body,
            condition,
            position,
        })))
    }

    fn convert_for(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();

        let init = children
            .iter()
            .find(|c| c.is_compound(CstKind::VarInit))
            .and_then(|c| self.convert_var_init(c));
        let condition = children
            .iter()
            .find(|c| is_value_node(c))
            .map(|c| self.convert_value(c))
            .unwrap_or(Value::Error { position });
        let increment = children
            .iter()
            .find(|c| {
                matches!(
                    c.kind(),
                    Some(CstKind::IncDec) | Some(CstKind::Assignment)
                )
            })
            .and_then(|c| self.convert_compound(c));
        let body = children
            .iter()
            .rev()
            .find(|c| is_statement_node(c) && !c.is_compound(CstKind::VarInit))
            .map(|c| self.convert_statement_or_body(c));

        let (Some(init), Some(increment), Some(body)) = (init, increment, body) else {
            return Some(self.error_node(position, "malformed for loop"));
        };
        Some(self.file.alloc(Node::ForLoop(ForLoop {
            init,
            condition,
            increment,
            body,
            position,
        })))
    }

    fn convert_switch(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();

        let mut expression = None;
        let mut cases: Vec<(Value, Vec<NodeId>)> = vec![];
        let mut default_stmts: Option<Vec<NodeId>> = None;
        let mut in_default = false;
        let mut saw_brace = false;
        let mut expecting_case_value = false;

        for child in &children {
            if let Some(token) = child.token() {
                match (token.kind, token.value.as_str()) {
                    (LexTokenType::Keyword, "case") => {
                        in_default = false;
                        expecting_case_value = true;
                    }
                    (LexTokenType::Keyword, "default") => {
                        in_default = true;
                        default_stmts = Some(vec![]);
                    }
                    (LexTokenType::CharOperator, "{") => saw_brace = true,
                    _ => {}
                }
                continue;
            }
            if !saw_brace {
                if expression.is_none() && is_value_node(child) {
                    expression = Some(self.convert_value(child));
                }
                continue;
            }
            if expecting_case_value && is_value_node(child) {
                let value = self.convert_value(child);
                cases.push((value, vec![]));
                expecting_case_value = false;
                continue;
            }
            // a statement belonging to the open case or default
            if let Some(id) = self.convert_compound(child) {
                if in_default {
                    if let Some(stmts) = &mut default_stmts {
                        stmts.push(id);
                    }
                } else if let Some((_, stmts)) = cases.last_mut() {
                    stmts.push(id);
                }
            }
        }

        let Some(expression) = expression else {
            return Some(self.error_node(position, "switch is missing its expression"));
        };
        let cases = cases
            .into_iter()
            .map(|(value, body)| {
                let scope_position = value.position();
                let scope = self.file.alloc(Node::Scope(Scope {
                    body,
                    position: scope_position,
                }));
                (value, scope)
            })
            .collect();
        let default_case = default_stmts.map(|body| {
            self.file.alloc(Node::Scope(Scope { body, position }))
        });
        Some(self.file.alloc(Node::Switch(SwitchStmt {
            expression,
            cases,
            default_case,
            position,
        })))
    }

    fn convert_return(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let value = children
            .iter()
            .find(|c| is_value_node(c))
            .map(|c| self.convert_value(c));
        Some(self.file.alloc(Node::Return(ReturnStmt { value, position })))
    }

    fn convert_throw(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let value = children
            .iter()
            .find(|c| is_value_node(c))
            .map(|c| self.convert_value(c))
            .unwrap_or(Value::Error { position });
        Some(self.file.alloc(Node::Throw(ThrowStmt { value, position })))
    }

    fn convert_delete(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let value = children
            .iter()
            .find(|c| is_value_node(c))
            .map(|c| self.convert_value(c))
            .unwrap_or(Value::Error { position });
        Some(self.file.alloc(Node::Delete(DeleteStmt { value, position })))
    }

    fn convert_assignment(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let mut values = children.iter().filter(|c| is_value_node(c));
        let lhs = values
            .next()
            .map(|c| self.convert_value(c))
            .unwrap_or(Value::Error { position });
        let value = values.next().map(|c| self.convert_value(c));
        Some(match value {
            Some(value) => self.file.alloc(Node::Assignment(Assignment {
                lhs: Some(lhs),
                value,
                position,
            })),
            // a lone chain is an expression statement
            None => self.file.alloc(Node::Assignment(Assignment {
                lhs: None,
                value: lhs,
                position,
            })),
        })
    }

    fn convert_inc_dec(&mut self, node: &CstNode) -> Option<NodeId> {
        let children = significant(node);
        let position = node.start_position();
        let target = children
            .iter()
            .find(|c| is_value_node(c))
            .map(|c| self.convert_value(c))
            .unwrap_or(Value::Error { position });
        let increment = children
            .iter()
            .filter_map(|c| c.token())
            .any(|t| t.value == "++");
        Some(self.file.alloc(Node::IncDec(IncDec {
            target,
            increment,
            position,
        })))
    }

    // ---- values --------------------------------------------------------

    pub(crate) fn convert_value(&mut self, node: &CstNode) -> Value {
        let position = node.start_position();
        if let Some(token) = node.token() {
            return self.convert_literal(token);
        }
        match node.kind() {
            Some(CstKind::AccessChain) => self.convert_access_chain(node),
            Some(CstKind::StructValue) => self.convert_struct_value(node),
            Some(CstKind::Expression) => self.convert_expression(node),
            Some(CstKind::Negative) => Value::Negative {
                value: Box::new(self.convert_operand_child(node)),
                position,
            },
            Some(CstKind::Not) => Value::Not {
                value: Box::new(self.convert_operand_child(node)),
                position,
            },
            Some(CstKind::AddrOf) => Value::AddrOf {
                value: Box::new(self.convert_operand_child(node)),
                position,
            },
            Some(CstKind::Dereference) => Value::Dereference {
                value: Box::new(self.convert_operand_child(node)),
                position,
            },
            Some(CstKind::CastValue) => self.convert_cast(node),
            Some(CstKind::SizeOf) => {
                let target = significant(node)
                    .iter()
                    .find(|c| is_type_node(c))
                    .map(|c| self.convert_type(c))
                    .unwrap_or(Type::Any);
                Value::SizeOf { target, position }
            }
            Some(CstKind::TernaryValue) => self.convert_ternary(node),
            Some(CstKind::Lambda) => self.convert_lambda(node),
            Some(CstKind::ArrayValue) => self.convert_array_value(node),
            _ => {
                self.error(position, "expected a value");
                Value::Error { position }
            }
        }
    }

    fn convert_operand_child(&mut self, node: &CstNode) -> Value {
        let position = node.start_position();
        significant(node)
            .iter()
            .find(|c| is_value_node(c))
            .map(|c| self.convert_value(c))
            .unwrap_or(Value::Error { position })
    }

    fn convert_literal(&mut self, token: &Token) -> Value {
        let position = token.position;
        match token.kind {
            LexTokenType::Number => self.convert_number(token),
            LexTokenType::String => Value::Str {
                value: unescape_text(&unquote(&token.value)),
                position,
            },
            LexTokenType::Char => {
                let inner = unescape_text(&unquote_char(&token.value));
                Value::Char {
                    value: inner.chars().next().unwrap_or('\0'),
                    position,
                }
            }
            LexTokenType::Bool => Value::Bool {
                value: token.value == "true",
                position,
            },
            LexTokenType::Null => Value::Null { position },
            LexTokenType::Identifier => Value::Identifier {
                name: token.value.clone(),
                linked: None,
                position,
            },
            _ => {
                self.error(position, format!("unexpected token '{}'", token.value));
                Value::Error { position }
            }
        }
    }

    /// Numeric literals carry their textual form out of the lexer; typing
    /// happens here, by classification.
    fn convert_number(&mut self, token: &Token) -> Value {
        let position = token.position;
        let text = token.value.as_str();
        if HEX_LITERAL.is_match(text) {
            let value = i64::from_str_radix(&text[2..], 16).unwrap_or(0);
            return Value::Int {
                value,
                num_bits: 32,
                unsigned: false,
                position,
            };
        }
        if FLOAT_LITERAL.is_match(text) {
            let value = text.trim_end_matches('f').parse().unwrap_or(0.0);
            return Value::Float { value, position };
        }
        if DOUBLE_LITERAL.is_match(text) {
            let value = text.parse().unwrap_or(0.0);
            return Value::Double { value, position };
        }
        if INT_LITERAL.is_match(text) {
            let digits: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
            let value = digits.parse().unwrap_or(0);
            let (num_bits, unsigned) = match text.trim_start_matches(|c: char| c.is_ascii_digit())
            {
                "u" => (32, true),
                "l" => (64, false),
                "ul" => (64, true),
                _ => (32, false),
            };
            return Value::Int {
                value,
                num_bits,
                unsigned,
                position,
            };
        }
        self.error(position, format!("malformed number literal '{text}'"));
        Value::Error { position }
    }

    fn convert_access_chain(&mut self, node: &CstNode) -> Value {
        let position = node.start_position();
        let mut elements = vec![];
        for child in significant(node) {
            match child {
                CstNode::Leaf(token) => match token.kind {
                    LexTokenType::Identifier => elements.push(ChainElement::Identifier {
                        name: token.value.clone(),
                        linked: None,
                        position: token.position,
                    }),
                    _ => {} // `.` and `::` markers
                },
                CstNode::Compound { kind, .. } => match kind {
                    CstKind::FunctionCall => {
                        let (args, generic_args) = self.convert_call_parts(child);
                        elements.push(ChainElement::Call {
                            args,
                            generic_args,
                            linked: None,
                            overload_index: None,
                            iteration: 0,
                            call_id: self.next_call_id,
                            position: child.start_position(),
                        });
                        self.next_call_id += 1;
                    }
                    CstKind::IndexOp => {
                        let index = significant(child)
                            .iter()
                            .find(|c| is_value_node(c))
                            .map(|c| self.convert_value(c))
                            .unwrap_or(Value::Error {
                                position: child.start_position(),
                            });
                        elements.push(ChainElement::Index {
                            index: Box::new(index),
                            position: child.start_position(),
                        });
                    }
                    _ => {}
                },
            }
        }
        if elements.len() == 1 {
            if let ChainElement::Identifier { name, position, .. } = &elements[0] {
                return Value::Identifier {
                    name: name.clone(),
                    linked: None,
                    position: *position,
                };
            }
        }
        Value::Chain(AccessChain { elements, position })
    }

    fn convert_call_parts(&mut self, node: &CstNode) -> (Vec<Value>, Vec<Type>) {
        let children = significant(node);
        let mut generic_args = vec![];
        let mut args = vec![];
        let mut in_types = false;
        for child in &children {
            if let Some(token) = child.token() {
                match token.value.as_str() {
                    "<" => in_types = true,
                    ">" => in_types = false,
                    _ => {
                        if in_types && token.kind == LexTokenType::TypeKeyword {
                            generic_args.push(keyword_type(&token.value));
                        }
                    }
                }
                continue;
            }
            if in_types {
                if is_type_node(child) {
                    generic_args.push(self.convert_type(child));
                }
            } else if is_value_node(child) {
                args.push(self.convert_value(child));
            }
        }
        (args, generic_args)
    }

    fn convert_struct_value(&mut self, node: &CstNode) -> Value {
        let position = node.start_position();
        let children = significant(node);
        let name = find_identifier(&children).unwrap_or_default();
        let generic = children
            .iter()
            .find(|c| c.is_compound(CstKind::GenericType));
        let base = Type::Referenced {
            name,
            linked: None,
        };
        let ref_type = match generic {
            Some(generic_node) => {
                let args = significant(generic_node)
                    .iter()
                    .filter(|c| is_type_node(c))
                    .map(|c| self.convert_type(c))
                    .collect::<Vec<_>>();
                let args = if args.is_empty() {
                    type_keyword_leaves(generic_node)
                } else {
                    args
                };
                Type::Generic {
                    base: Box::new(base),
                    args,
                    iteration: 0,
                }
            }
            None => base,
        };

        // fields alternate: identifier, ':', value
        let mut fields = vec![];
        let mut field_name: Option<String> = None;
        let mut saw_brace = false;
        for child in &children {
            if let Some(token) = child.token() {
                match (token.kind, token.value.as_str()) {
                    (LexTokenType::CharOperator, "{") => saw_brace = true,
                    (LexTokenType::Identifier, _) if saw_brace => {
                        field_name = Some(token.value.clone());
                    }
                    _ => {}
                }
                continue;
            }
            if saw_brace && is_value_node(child) {
                if let Some(name) = field_name.take() {
                    let value = self.convert_value(child);
                    fields.push((name, value));
                }
            }
        }
        Value::StructValue(StructValue {
            ref_type,
            fields,
            linked: None,
            position,
        })
    }

    /// Binary expressions arrive as a flat operand/operator sequence; the
    /// operator table resolves them here by precedence climbing.
    fn convert_expression(&mut self, node: &CstNode) -> Value {
        let position = node.start_position();
        let children = significant(node);
        // parenthesised group: ( inner )
        if children
            .first()
            .and_then(|c| c.token())
            .map(|t| t.value == "(")
            .unwrap_or(false)
        {
            return children
                .iter()
                .find(|c| is_value_node(c))
                .map(|c| self.convert_value(c))
                .unwrap_or(Value::Error { position });
        }

        enum Item {
            Operand(Value),
            Operator(BinaryOp),
        }
        let mut items = vec![];
        for child in &children {
            if let Some(token) = child.token() {
                if let Some(op) = BinaryOp::from_str(&token.value) {
                    items.push(Item::Operator(op));
                    continue;
                }
            }
            if is_value_node(child) {
                items.push(Item::Operand(self.convert_value(child)));
            } else if let Some(token) = child.token() {
                items.push(Item::Operand(self.convert_literal(token)));
            }
        }

        fn climb(
            items: &mut std::iter::Peekable<std::vec::IntoIter<Item>>,
            mut lhs: Value,
            min_prec: u8,
            position: Position,
        ) -> Value {
            while let Some(Item::Operator(op)) = items.peek() {
                let op = *op;
                if op.precedence() < min_prec {
                    break;
                }
                items.next();
                let mut rhs = match items.next() {
                    Some(Item::Operand(v)) => v,
                    _ => Value::Error { position },
                };
                while let Some(Item::Operator(next)) = items.peek() {
                    if next.precedence() > op.precedence() {
                        rhs = climb(items, rhs, op.precedence() + 1, position);
                    } else {
                        break;
                    }
                }
                lhs = Value::Expression {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                    op,
                    position,
                };
            }
            lhs
        }

        let mut iter = items.into_iter().peekable();
        let first = match iter.next() {
            Some(Item::Operand(v)) => v,
            _ => {
                self.error(position, "expression is missing its first operand");
                return Value::Error { position };
            }
        };
        climb(&mut iter, first, 0, position)
    }

    fn convert_cast(&mut self, node: &CstNode) -> Value {
        let position = node.start_position();
        let children = significant(node);
        // children: value-part..., `as`, type
        let mut split = None;
        for (i, child) in children.iter().enumerate() {
            if let Some(token) = child.token() {
                if token.kind == LexTokenType::Keyword && token.value == "as" {
                    split = Some(i);
                    break;
                }
            }
        }
        let Some(split) = split else {
            self.error(position, "malformed cast");
            return Value::Error { position };
        };
        let value = children[..split]
            .iter()
            .find(|c| is_value_node(c))
            .map(|c| self.convert_value(c))
            .unwrap_or(Value::Error { position });
        let target = children[split..]
            .iter()
            .find(|c| is_type_node(c))
            .map(|c| self.convert_type(c))
            .or_else(|| {
                children[split..]
                    .iter()
                    .filter_map(|c| c.token())
                    .find(|t| t.kind == LexTokenType::TypeKeyword)
                    .map(|t| keyword_type(&t.value))
            })
            .unwrap_or(Type::Any);
        Value::Cast {
            value: Box::new(value),
            target,
            position,
        }
    }

    fn convert_ternary(&mut self, node: &CstNode) -> Value {
        let position = node.start_position();
        let children = significant(node);
        let mut values = children
            .iter()
            .filter(|c| is_value_node(c))
            .map(|c| self.convert_value(c));
        let condition = values.next().unwrap_or(Value::Error { position });
        let left = values.next().unwrap_or(Value::Error { position });
        let right = values.next().unwrap_or(Value::Error { position });
        Value::Ternary {
            condition: Box::new(condition),
            left: Box::new(left),
            right: Box::new(right),
            position,
        }
    }

    /// Lambdas produce a non-capturing or capturing function value; the
    /// capture list is carried for the resolver to link and for the
    /// back-ends to synthesise the capture struct.
    fn convert_lambda(&mut self, node: &CstNode) -> Value {
        let position = node.start_position();
        let children = significant(node);

        let mut captures = vec![];
        if let Some(capture_list) = children
            .iter()
            .find(|c| c.is_compound(CstKind::CaptureList))
        {
            let capture_children = significant(capture_list);
            let mut by_pointer = false;
            for child in capture_children {
                if let Some(token) = child.token() {
                    match (token.kind, token.value.as_str()) {
                        (LexTokenType::CharOperator, "&") => by_pointer = true,
                        (LexTokenType::Identifier, _) => {
                            captures.push(CapturedVariable {
                                name: token.value.clone(),
                                by_pointer,
                                linked: None,
                                position: token.position,
                            });
                            by_pointer = false;
                        }
                        _ => {}
                    }
                }
            }
        }

        let params = children
            .iter()
            .filter(|c| c.is_compound(CstKind::FunctionParam))
            .map(|c| self.convert_function_param(c))
            .collect();

        let body = match children.iter().find(|c| c.is_compound(CstKind::Body)) {
            Some(body) => self.convert_body(body),
            None => {
                // expression-bodied: synthesise { return expr; }
                let expr = children
                    .iter()
                    .rev()
                    .find(|c| is_value_node(c))
                    .map(|c| self.convert_value(c))
                    .unwrap_or(Value::Error { position });
                let ret = self.file.alloc(Node::Return(ReturnStmt {
                    value: Some(expr),
                    position,
                }));
                self.file.alloc(Node::Scope(Scope {
                    body: vec![ret],
                    position,
                }))
            }
        };

        let lambda_id = self.next_lambda_id;
        self.next_lambda_id += 1;
        Value::Lambda(LambdaValue {
            params,
            captures,
            return_type: None,
            body,
            lambda_id,
            position,
        })
    }

    fn convert_array_value(&mut self, node: &CstNode) -> Value {
        let position = node.start_position();
        let values: Vec<Value> = significant(node)
            .iter()
            .filter(|c| is_value_node(c))
            .map(|c| self.convert_value(c))
            .collect();
        let size = Some(values.len() as u64);
        Value::ArrayValue {
            values,
            elem_type: None,
            size,
            position,
        }
    }

    // ---- types ---------------------------------------------------------

    /// Types are fully constructed eagerly; generic arguments land in a
    /// separate list on the use-site type.
    pub(crate) fn convert_type(&mut self, node: &CstNode) -> Type {
        if let Some(token) = node.token() {
            if token.kind == LexTokenType::TypeKeyword {
                return keyword_type(&token.value);
            }
            return Type::Any;
        }
        match node.kind() {
            Some(CstKind::PointerType) => {
                let inner = self.convert_type_child(node);
                Type::Pointer(Box::new(inner))
            }
            Some(CstKind::ArrayType) => {
                let children = significant(node);
                let elem = children
                    .first()
                    .map(|c| self.convert_type(c))
                    .unwrap_or(Type::Any);
                let size = children
                    .iter()
                    .filter_map(|c| c.token())
                    .find(|t| t.kind == LexTokenType::Number)
                    .and_then(|t| t.value.parse().ok());
                Type::Array {
                    elem_type: Box::new(elem),
                    size,
                }
            }
            Some(CstKind::GenericType) => {
                let children = significant(node);
                let base = children
                    .first()
                    .map(|c| self.convert_type(c))
                    .unwrap_or(Type::Any);
                let args = children[1..]
                    .iter()
                    .filter(|c| is_type_node(c))
                    .map(|c| self.convert_type(c))
                    .chain(
                        children[1..]
                            .iter()
                            .filter_map(|c| c.token())
                            .filter(|t| t.kind == LexTokenType::TypeKeyword)
                            .map(|t| keyword_type(&t.value)),
                    )
                    .collect();
                Type::Generic {
                    base: Box::new(base),
                    args,
                    iteration: 0,
                }
            }
            Some(CstKind::FunctionType) => {
                let children = significant(node);
                let is_capturing = children
                    .first()
                    .and_then(|c| c.token())
                    .map(|t| t.value == "[")
                    .unwrap_or(false);
                let mut params = vec![];
                let mut is_variadic = false;
                let mut return_type = Type::Void;
                let mut saw_arrow = false;
                for child in &children {
                    if let Some(token) = child.token() {
                        match (token.kind, token.value.as_str()) {
                            (LexTokenType::Operation, "=>") => saw_arrow = true,
                            (LexTokenType::Operation, "...") => is_variadic = true,
                            (LexTokenType::TypeKeyword, _) => {
                                if saw_arrow {
                                    return_type = keyword_type(&token.value);
                                } else {
                                    params.push(keyword_type(&token.value));
                                }
                            }
                            _ => {}
                        }
                        continue;
                    }
                    if is_type_node(child) {
                        if saw_arrow {
                            return_type = self.convert_type(child);
                        } else {
                            params.push(self.convert_type(child));
                        }
                    }
                }
                Type::Function {
                    params,
                    return_type: Box::new(return_type),
                    is_variadic,
                    is_capturing,
                }
            }
            Some(CstKind::ReferencedType) => {
                let name = significant(node)
                    .iter()
                    .filter_map(|c| c.token())
                    .filter(|t| t.kind == LexTokenType::Identifier)
                    .map(|t| t.value.clone())
                    .collect::<Vec<_>>()
                    .join("::");
                Type::Referenced { name, linked: None }
            }
            _ => Type::Any,
        }
    }

    fn convert_type_child(&mut self, node: &CstNode) -> Type {
        for child in significant(node) {
            if is_type_node(child) {
                return self.convert_type(child);
            }
            if let Some(token) = child.token() {
                if token.kind == LexTokenType::TypeKeyword {
                    return keyword_type(&token.value);
                }
            }
        }
        Type::Any
    }
}

// ---- free helpers ------------------------------------------------------

/// Children minus trivia leaves.
fn significant(node: &CstNode) -> Vec<&CstNode> {
    node.children()
        .iter()
        .filter(|c| match c.token() {
            Some(token) => !token.kind.is_trivia(),
            None => true,
        })
        .collect()
}

fn find_identifier(children: &[&CstNode]) -> Option<String> {
    children
        .iter()
        .filter_map(|c| c.token())
        .find(|t| t.kind == LexTokenType::Identifier)
        .map(|t| t.value.clone())
}

fn is_type_node(node: &CstNode) -> bool {
    matches!(
        node.kind(),
        Some(CstKind::PointerType)
            | Some(CstKind::ArrayType)
            | Some(CstKind::GenericType)
            | Some(CstKind::FunctionType)
            | Some(CstKind::ReferencedType)
    ) || node
        .token()
        .map(|t| t.kind == LexTokenType::TypeKeyword)
        .unwrap_or(false)
}

fn is_value_node(node: &CstNode) -> bool {
    match node.kind() {
        Some(kind) => matches!(
            kind,
            CstKind::AccessChain
                | CstKind::StructValue
                | CstKind::Expression
                | CstKind::Negative
                | CstKind::Not
                | CstKind::AddrOf
                | CstKind::Dereference
                | CstKind::CastValue
                | CstKind::SizeOf
                | CstKind::TernaryValue
                | CstKind::Lambda
                | CstKind::ArrayValue
                | CstKind::FunctionCall
        ),
        None => node
            .token()
            .map(|t| {
                matches!(
                    t.kind,
                    LexTokenType::Number
                        | LexTokenType::String
                        | LexTokenType::Char
                        | LexTokenType::Bool
                        | LexTokenType::Null
                )
            })
            .unwrap_or(false),
    }
}

fn is_statement_node(node: &CstNode) -> bool {
    matches!(
        node.kind(),
        Some(CstKind::Body)
            | Some(CstKind::VarInit)
            | Some(CstKind::Assignment)
            | Some(CstKind::IncDec)
            | Some(CstKind::If)
            | Some(CstKind::While)
            | Some(CstKind::DoWhile)
            | Some(CstKind::ForLoop)
            | Some(CstKind::Switch)
            | Some(CstKind::Return)
            | Some(CstKind::Break)
            | Some(CstKind::Continue)
            | Some(CstKind::Throw)
            | Some(CstKind::Delete)
            | Some(CstKind::AccessChain)
    )
}

fn keyword_type(text: &str) -> Type {
    match text {
        "any" => Type::Any,
        "void" => Type::Void,
        "bool" => Type::Bool,
        "char" => Type::Char,
        "short" => Type::IntN {
            num_bits: 16,
            unsigned: false,
        },
        "ushort" => Type::IntN {
            num_bits: 16,
            unsigned: true,
        },
        "int" => Type::int(),
        "uint" => Type::uint(),
        "long" => Type::long(),
        "ulong" => Type::ulong(),
        "bigint" => Type::IntN {
            num_bits: 128,
            unsigned: false,
        },
        "ubigint" => Type::IntN {
            num_bits: 128,
            unsigned: true,
        },
        "float" => Type::Float,
        "double" => Type::Double,
        "string" => Type::String,
        _ => Type::Any,
    }
}

fn unquote(text: &str) -> String {
    text.trim_matches('"').to_string()
}

fn unquote_char(text: &str) -> String {
    text.trim_matches('\'').to_string()
}

fn unescape_text(text: &str) -> String {
    unescape::unescape(text).unwrap_or_else(|| text.to_string())
}

/// Type keyword leaves directly inside a node (generic args like `<int>`).
fn type_keyword_leaves(node: &CstNode) -> Vec<Type> {
    significant(node)
        .iter()
        .filter_map(|c| c.token())
        .filter(|t| t.kind == LexTokenType::TypeKeyword)
        .map(|t| keyword_type(&t.value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn convert(source: &str) -> ConvertResult {
        let lexed = Lexer::new(source, "test.ch").lex();
        assert!(
            !lexed.diagnostics.has_errors(),
            "lexing failed: {:?}",
            lexed.diagnostics.iter().collect::<Vec<_>>()
        );
        Converter::new(FileId(0), "test.ch").convert(&lexed.unit)
    }

    #[test]
    fn test_convert_function() {
        let result = convert("func main() : int { return 0; }");
        assert!(!result.diagnostics.has_errors());
        assert_eq!(result.file.root.len(), 1);
        let Node::Function(decl) = result.file.node(result.file.root[0]) else {
            panic!("expected a function");
        };
        assert_eq!(decl.name, "main");
        assert!(decl.return_type.is_same(&Type::int()));
        assert!(decl.body.is_some());
    }

    #[test]
    fn test_convert_struct_with_generics() {
        let result = convert("struct Vec<T> { data : *T; len : int; }");
        let Node::StructDef(def) = result.file.node(result.file.root[0]) else {
            panic!("expected a struct");
        };
        assert_eq!(def.generic_params, vec!["T".to_string()]);
        assert_eq!(def.members.len(), 2);
        assert_eq!(def.members[0].name, "data");
        assert!(matches!(def.members[0].member_type, Type::Pointer(_)));
    }

    #[test]
    fn test_convert_precedence() {
        let result = convert("func f() : int { return 1 + 2 * 3; }");
        assert!(!result.diagnostics.has_errors());
        let Node::Function(decl) = result.file.node(result.file.root[0]) else {
            panic!();
        };
        let Node::Scope(scope) = result.file.node(decl.body.unwrap()) else {
            panic!();
        };
        let Node::Return(ret) = result.file.node(scope.body[0]) else {
            panic!();
        };
        let Some(Value::Expression { op, rhs, .. }) = &ret.value else {
            panic!("expected a binary expression");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            rhs.as_ref(),
            Value::Expression {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_convert_lambda_with_capture() {
        let result = convert("func f() : void { var x = 3; var g = [x](y : int) => x + y; }");
        assert!(!result.diagnostics.has_errors());
        let Node::Function(decl) = result.file.node(result.file.root[0]) else {
            panic!();
        };
        let Node::Scope(scope) = result.file.node(decl.body.unwrap()) else {
            panic!();
        };
        let Node::VarInit(init) = result.file.node(scope.body[1]) else {
            panic!();
        };
        let Some(Value::Lambda(lambda)) = &init.value else {
            panic!("expected a lambda");
        };
        assert_eq!(lambda.captures.len(), 1);
        assert_eq!(lambda.captures[0].name, "x");
        assert!(!lambda.captures[0].by_pointer);
        assert_eq!(lambda.params.len(), 1);
    }

    #[test]
    fn test_convert_annotations_attach() {
        let result = convert("@comptime\nfunc square(x : int) : int { return x * x; }");
        let Node::Function(decl) = result.file.node(result.file.root[0]) else {
            panic!();
        };
        assert!(decl.is_comptime());
    }

    #[test]
    fn test_convert_access_chain_with_call() {
        let result = convert("func f() : void { a.b().c.d(); }");
        assert!(!result.diagnostics.has_errors());
        let Node::Function(decl) = result.file.node(result.file.root[0]) else {
            panic!();
        };
        let Node::Scope(scope) = result.file.node(decl.body.unwrap()) else {
            panic!();
        };
        let Node::Assignment(stmt) = result.file.node(scope.body[0]) else {
            panic!();
        };
        let Value::Chain(chain) = &stmt.value else {
            panic!("expected a chain");
        };
        // a, b, call, c, d, call
        assert_eq!(chain.elements.len(), 6);
        assert!(matches!(chain.elements[2], ChainElement::Call { .. }));
        assert!(matches!(chain.elements[5], ChainElement::Call { .. }));
    }

    #[test]
    fn test_convert_number_forms() {
        let result = convert(
            "func f() : void { var a = 1; var b = 2u; var c = 3l; var d = 1.5; var e = 2.5f; }",
        );
        assert!(!result.diagnostics.has_errors());
    }

    #[test]
    fn test_error_placeholder_keeps_walking() {
        let result = convert("func f() : void { return 1; }\nfunc g() : int { return 2; }");
        assert_eq!(result.file.root.len(), 2);
    }

    #[test]
    fn test_struct_value() {
        let result = convert("func mk() : P { return P { x : 3, y : 4 }; }");
        assert!(!result.diagnostics.has_errors());
        let Node::Function(decl) = result.file.node(result.file.root[0]) else {
            panic!();
        };
        let Node::Scope(scope) = result.file.node(decl.body.unwrap()) else {
            panic!();
        };
        let Node::Return(ret) = result.file.node(scope.body[0]) else {
            panic!();
        };
        let Some(Value::StructValue(value)) = &ret.value else {
            panic!("expected a struct value");
        };
        assert_eq!(value.fields.len(), 2);
        assert_eq!(value.fields[0].0, "x");
    }
}
