//! Statements and declarations. Nodes live in a per-file arena
//! ([`super::FileAst`]); child nodes are referenced by [`NodeId`], values
//! and types are owned inline.

use serde::{Deserialize, Serialize};

use crate::diagnostics::Position;

use super::types::Type;
use super::value::Value;
use super::{Module, NodeId, NodeRef};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParam {
    pub name: String,
    pub param_type: Type,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarInit {
    pub name: String,
    pub is_const: bool,
    pub declared_type: Option<Type>,
    pub value: Option<Value>,
    pub annotations: Vec<Annotation>,
    pub position: Position,
}

impl VarInit {
    /// The variable's type: the declared one, else the initialiser's.
    pub fn known_type(&self, module: &Module) -> Option<Type> {
        if let Some(declared) = &self.declared_type {
            return Some(declared.clone());
        }
        self.value
            .as_ref()
            .and_then(|v| v.create_type(module))
            .map(|t| t.pure_type().into_owned())
    }
}

/// Assignment statement; `lhs: None` marks a bare expression statement
/// (a call chain evaluated for its effects).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub lhs: Option<Value>,
    pub value: Value,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncDec {
    pub target: Value,
    pub increment: bool,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfStmt {
    pub condition: Value,
    pub then_body: NodeId,
    pub else_ifs: Vec<(Value, NodeId)>,
    pub else_body: Option<NodeId>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhileLoop {
    pub condition: Value,
    pub body: NodeId,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoWhileLoop {
    pub body: NodeId,
    pub condition: Value,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForLoop {
    pub init: NodeId,
    pub condition: Value,
    pub increment: NodeId,
    pub body: NodeId,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchStmt {
    pub expression: Value,
    pub cases: Vec<(Value, NodeId)>,
    pub default_case: Option<NodeId>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnStmt {
    pub value: Option<Value>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrowStmt {
    pub value: Value,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStmt {
    pub value: Value,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStmt {
    pub path: String,
    pub as_identifier: Option<String>,
    /// Absolute path, filled by the import graph.
    pub resolved: Option<std::path::PathBuf>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypealiasStmt {
    pub name: String,
    pub to: Type,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsingStmt {
    pub path: Vec<String>,
    pub is_namespace: bool,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub generic_params: Vec<String>,
    pub params: Vec<FunctionParam>,
    pub is_variadic: bool,
    pub return_type: Type,
    /// Body scope; `None` for prototypes (interfaces, externs).
    pub body: Option<NodeId>,
    pub annotations: Vec<Annotation>,
    /// Monomorphic specialisations, appended on first reference, never
    /// reordered. Empty generic_params means a single implicit iteration.
    pub iterations: Vec<Vec<Type>>,
    pub position: Position,
}

impl FunctionDecl {
    pub fn has_annotation(&self, name: &str) -> bool {
        self.annotations.iter().any(|a| a.name == name)
    }

    pub fn is_comptime(&self) -> bool {
        self.has_annotation("comptime")
    }

    pub fn is_destructor(&self) -> bool {
        self.has_annotation("destructor")
    }

    pub fn is_constructor(&self) -> bool {
        self.has_annotation("constructor")
    }

    pub fn is_extern(&self) -> bool {
        self.has_annotation("extern")
    }

    pub fn is_generic(&self) -> bool {
        !self.generic_params.is_empty()
    }

    /// Number of concrete emissions for this declaration.
    pub fn emission_count(&self) -> usize {
        if self.is_generic() {
            self.iterations.len()
        } else {
            1
        }
    }

    pub fn create_value_type(&self) -> Type {
        Type::Function {
            params: self.params.iter().map(|p| p.param_type.clone()).collect(),
            return_type: Box::new(self.return_type.clone()),
            is_variadic: self.is_variadic,
            is_capturing: false,
        }
    }

    /// Whether a call with these argument types selects this declaration.
    pub fn satisfied_by(&self, arg_types: &[Option<Type>]) -> bool {
        if self.is_variadic {
            if arg_types.len() < self.params.len() {
                return false;
            }
        } else if arg_types.len() != self.params.len() {
            return false;
        }
        self.params.iter().zip(arg_types).all(|(param, arg)| {
            arg.as_ref()
                .map(|arg| param.param_type.satisfies(arg))
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionFunction {
    pub receiver: FunctionParam,
    pub decl: FunctionDecl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructMember {
    pub name: String,
    pub member_type: Type,
    pub default_value: Option<Value>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub generic_params: Vec<String>,
    pub members: Vec<StructMember>,
    /// Member functions, allocated in the arena.
    pub functions: Vec<NodeId>,
    /// Nested named or unnamed definitions.
    pub nested: Vec<NodeId>,
    pub annotations: Vec<Annotation>,
    pub iterations: Vec<Vec<Type>>,
    pub position: Position,
}

impl StructDef {
    pub fn member(&self, name: &str) -> Option<(usize, &StructMember)> {
        self.members
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == name)
    }

    pub fn is_generic(&self) -> bool {
        !self.generic_params.is_empty()
    }

    /// Find the destructor function among the members, if declared.
    pub fn destructor<'a>(&self, module: &'a Module, file: super::FileId) -> Option<(NodeId, &'a FunctionDecl)> {
        for id in &self.functions {
            if let Node::Function(decl) = module.node(NodeRef::new(file, *id)) {
                if decl.is_destructor() {
                    return Some((*id, decl));
                }
            }
        }
        None
    }

    /// Find the constructor function among the members, if declared.
    pub fn constructor<'a>(&self, module: &'a Module, file: super::FileId) -> Option<(NodeId, &'a FunctionDecl)> {
        for id in &self.functions {
            if let Node::Function(decl) = module.node(NodeRef::new(file, *id)) {
                if decl.is_constructor() {
                    return Some((*id, decl));
                }
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnionDef {
    pub name: String,
    pub members: Vec<StructMember>,
    pub functions: Vec<NodeId>,
    pub annotations: Vec<Annotation>,
    pub position: Position,
}

/// Anonymous struct definition in member position; the trailing name is
/// the member it declares on its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnnamedStruct {
    pub member_name: String,
    pub members: Vec<StructMember>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnnamedUnion {
    pub member_name: String,
    pub members: Vec<StructMember>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDef {
    pub name: String,
    pub functions: Vec<NodeId>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplDef {
    pub interface_name: String,
    pub interface: Option<NodeRef>,
    pub target_name: Option<String>,
    pub target: Option<NodeRef>,
    pub functions: Vec<NodeId>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDecl {
    pub name: String,
    pub members: Vec<String>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDecl {
    pub name: String,
    pub body: Vec<NodeId>,
    pub position: Position,
}

/// A sequence of statements with its own lexical scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub body: Vec<NodeId>,
    pub position: Position,
}

/// Resolver-internal stand-in for a set of overloaded functions sharing a
/// name in one scope. Calls dispatch to the member whose parameters are
/// satisfied by the actual argument types; ambiguity is an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiFunctionNode {
    pub name: String,
    pub functions: Vec<NodeRef>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNode {
    pub message: String,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    VarInit(VarInit),
    Assignment(Assignment),
    IncDec(IncDec),
    If(IfStmt),
    While(WhileLoop),
    DoWhile(DoWhileLoop),
    ForLoop(ForLoop),
    Switch(SwitchStmt),
    Break { position: Position },
    Continue { position: Position },
    Return(ReturnStmt),
    Throw(ThrowStmt),
    Delete(DeleteStmt),
    Import(ImportStmt),
    Typealias(TypealiasStmt),
    Using(UsingStmt),
    Function(FunctionDecl),
    ExtensionFunction(ExtensionFunction),
    StructDef(StructDef),
    UnionDef(UnionDef),
    UnnamedStruct(UnnamedStruct),
    UnnamedUnion(UnnamedUnion),
    Interface(InterfaceDef),
    Impl(ImplDef),
    Enum(EnumDecl),
    Namespace(NamespaceDecl),
    Scope(Scope),
    MultiFunction(MultiFunctionNode),
    Error(ErrorNode),
}

impl Node {
    pub fn position(&self) -> Position {
        match self {
            Node::VarInit(n) => n.position,
            Node::Assignment(n) => n.position,
            Node::IncDec(n) => n.position,
            Node::If(n) => n.position,
            Node::While(n) => n.position,
            Node::DoWhile(n) => n.position,
            Node::ForLoop(n) => n.position,
            Node::Switch(n) => n.position,
            Node::Break { position } | Node::Continue { position } => *position,
            Node::Return(n) => n.position,
            Node::Throw(n) => n.position,
            Node::Delete(n) => n.position,
            Node::Import(n) => n.position,
            Node::Typealias(n) => n.position,
            Node::Using(n) => n.position,
            Node::Function(n) => n.position,
            Node::ExtensionFunction(n) => n.decl.position,
            Node::StructDef(n) => n.position,
            Node::UnionDef(n) => n.position,
            Node::UnnamedStruct(n) => n.position,
            Node::UnnamedUnion(n) => n.position,
            Node::Interface(n) => n.position,
            Node::Impl(n) => n.position,
            Node::Enum(n) => n.position,
            Node::Namespace(n) => n.position,
            Node::Scope(n) => n.position,
            Node::MultiFunction(n) => n.position,
            Node::Error(n) => n.position,
        }
    }

    /// The name this node declares at its scope, if it declares one.
    pub fn declared_name(&self) -> Option<&str> {
        match self {
            Node::VarInit(n) => Some(&n.name),
            Node::Typealias(n) => Some(&n.name),
            Node::Function(n) => Some(&n.name),
            Node::ExtensionFunction(n) => Some(&n.decl.name),
            Node::StructDef(n) => Some(&n.name),
            Node::UnionDef(n) => Some(&n.name),
            Node::Interface(n) => Some(&n.name),
            Node::Enum(n) => Some(&n.name),
            Node::Namespace(n) => Some(&n.name),
            Node::MultiFunction(n) => Some(&n.name),
            _ => None,
        }
    }

    /// The value this node holds, for nodes that hold one.
    pub fn holding_value(&self) -> Option<&Value> {
        match self {
            Node::VarInit(n) => n.value.as_ref(),
            Node::Assignment(n) => Some(&n.value),
            Node::Return(n) => n.value.as_ref(),
            Node::Throw(n) => Some(&n.value),
            Node::Delete(n) => Some(&n.value),
            _ => None,
        }
    }

    /// The type of the held value's storage, for nodes that declare one.
    pub fn holding_value_type(&self) -> Option<&Type> {
        match self {
            Node::VarInit(n) => n.declared_type.as_ref(),
            Node::Typealias(n) => Some(&n.to),
            _ => None,
        }
    }

    /// Type a reference to this declaration evaluates to.
    pub fn create_value_type(&self, module: &Module) -> Option<Type> {
        match self {
            Node::VarInit(n) => n.known_type(module),
            Node::Function(n) => Some(n.create_value_type()),
            Node::ExtensionFunction(n) => Some(n.decl.create_value_type()),
            Node::Typealias(n) => Some(n.to.clone()),
            Node::Enum(_) => Some(Type::int()),
            _ => None,
        }
    }

    pub fn byte_size(&self, is_64bit: bool, module: &Module) -> u64 {
        match self {
            Node::StructDef(def) => def
                .members
                .iter()
                .map(|m| m.member_type.byte_size(is_64bit, module))
                .sum(),
            Node::UnionDef(def) => def
                .members
                .iter()
                .map(|m| m.member_type.byte_size(is_64bit, module))
                .max()
                .unwrap_or(0),
            Node::UnnamedStruct(def) => def
                .members
                .iter()
                .map(|m| m.member_type.byte_size(is_64bit, module))
                .sum(),
            Node::UnnamedUnion(def) => def
                .members
                .iter()
                .map(|m| m.member_type.byte_size(is_64bit, module))
                .max()
                .unwrap_or(0),
            Node::Typealias(alias) => alias.to.byte_size(is_64bit, module),
            Node::Enum(_) => 4,
            Node::VarInit(init) => init
                .known_type(module)
                .map(|t| t.byte_size(is_64bit, module))
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// A struct requires destruction when it declares a destructor or
    /// transitively contains a member whose type requires destruction.
    /// `file` is the file this node lives in; member functions share it.
    pub fn requires_destruction(&self, file: super::FileId, module: &Module) -> bool {
        match self {
            Node::StructDef(def) => {
                let declares = def.annotations.iter().any(|a| a.name == "destructor")
                    || def.destructor(module, file).is_some();
                declares
                    || def
                        .members
                        .iter()
                        .any(|m| m.member_type.requires_destruction(module))
            }
            Node::UnionDef(_) => false,
            Node::Typealias(alias) => alias.to.requires_destruction(module),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(params: Vec<Type>) -> FunctionDecl {
        FunctionDecl {
            name: "f".into(),
            generic_params: vec![],
            params: params
                .into_iter()
                .enumerate()
                .map(|(i, t)| FunctionParam {
                    name: format!("p{i}"),
                    param_type: t,
                    position: Position::default(),
                })
                .collect(),
            is_variadic: false,
            return_type: Type::Void,
            body: None,
            annotations: vec![],
            iterations: vec![],
            position: Position::default(),
        }
    }

    #[test]
    fn test_satisfied_by_exact() {
        let f = decl(vec![Type::int(), Type::Float]);
        assert!(f.satisfied_by(&[Some(Type::int()), Some(Type::Float)]));
        assert!(!f.satisfied_by(&[Some(Type::Float), Some(Type::Float)]));
        assert!(!f.satisfied_by(&[Some(Type::int())]));
    }

    #[test]
    fn test_satisfied_by_literal_widening() {
        let f = decl(vec![Type::long()]);
        let literal = Type::Literal(Box::new(Type::int()));
        assert!(f.satisfied_by(&[Some(literal)]));
    }

    #[test]
    fn test_annotations() {
        let mut f = decl(vec![]);
        f.annotations.push(Annotation {
            name: "comptime".into(),
            position: Position::default(),
        });
        assert!(f.is_comptime());
        assert!(!f.is_destructor());
    }
}
