//! The AST model: three closed sum types ([`Node`], [`Value`], [`Type`])
//! with explicit ownership edges. Nodes live in a per-file arena; parent
//! pointers and resolution links are arena-relative indices, so the graph
//! carries no ownership cycles and serialises by value.

pub mod generics;
pub mod node;
pub mod types;
pub mod value;
pub mod visitor;

pub use node::{
    Annotation, EnumDecl, ErrorNode, ExtensionFunction, ForLoop, FunctionDecl, FunctionParam,
    IfStmt, ImplDef, ImportStmt, IncDec, InterfaceDef, MultiFunctionNode, NamespaceDecl, Node,
    ReturnStmt, Scope, StructDef, StructMember, SwitchStmt, ThrowStmt, TypealiasStmt, UnionDef,
    UnnamedStruct, UnnamedUnion, UsingStmt, VarInit, WhileLoop,
};
pub use types::{Type, TypeKind, TypeRef};
pub use value::{
    AccessChain, BinaryOp, CapturedVariable, ChainElement, LambdaValue, StructValue, Value,
};
pub use visitor::AstVisitor;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Index of a node inside its file's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Index of a file inside the module being compiled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u32);

/// Cross-file node reference: the only currency for resolution links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub file: FileId,
    pub node: NodeId,
}

impl NodeRef {
    pub fn new(file: FileId, node: NodeId) -> Self {
        Self { file, node }
    }
}

/// Target of a resolved reference. Declarations are nodes; struct fields,
/// enum members and function parameters are addressed through their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Linked {
    Node(NodeRef),
    Field { owner: NodeRef, index: usize },
    EnumMember { owner: NodeRef, index: usize },
    /// Parameter of a function or extension function declaration. For
    /// extension functions index 0 is the receiver.
    Param { owner: NodeRef, index: usize },
    /// Parameter of a lambda, addressed through the lambda's body scope.
    /// Types of lambda params are tracked by the consumer's own scope
    /// maps, not recoverable from the link alone.
    LambdaParam { body: NodeRef, index: usize },
}

impl Linked {
    pub fn node_ref(&self) -> Option<NodeRef> {
        match self {
            Linked::Node(r) => Some(*r),
            _ => None,
        }
    }

    /// Type a value referencing this target evaluates to.
    pub fn value_type(&self, module: &Module) -> Option<Type> {
        match self {
            Linked::Node(r) => module.node(*r).create_value_type(module),
            Linked::Field { owner, index } => match module.node(*owner) {
                Node::StructDef(def) => {
                    Some(def.members.get(*index)?.member_type.clone())
                }
                Node::UnionDef(def) => Some(def.members.get(*index)?.member_type.clone()),
                Node::UnnamedStruct(def) => Some(def.members.get(*index)?.member_type.clone()),
                Node::UnnamedUnion(def) => Some(def.members.get(*index)?.member_type.clone()),
                _ => None,
            },
            Linked::EnumMember { .. } => Some(Type::int()),
            Linked::Param { owner, index } => match module.node(*owner) {
                Node::Function(decl) => Some(decl.params.get(*index)?.param_type.clone()),
                Node::ExtensionFunction(ext) => {
                    if *index == 0 {
                        Some(ext.receiver.param_type.clone())
                    } else {
                        Some(ext.decl.params.get(*index - 1)?.param_type.clone())
                    }
                }
                _ => None,
            },
            Linked::LambdaParam { .. } => None,
        }
    }
}

/// Per-file AST arena. The arena exclusively owns every node of the file;
/// `root` lists the top-level declarations in source order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileAst {
    pub file_id: FileId,
    pub file_path: PathBuf,
    nodes: Vec<Node>,
    parents: Vec<Option<NodeId>>,
    pub root: Vec<NodeId>,
}

impl FileAst {
    pub fn new(file_id: FileId, file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_id,
            file_path: file_path.into(),
            nodes: vec![],
            parents: vec![],
            root: vec![],
        }
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.parents.push(None);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.parents[id.0 as usize]
    }

    pub fn set_parent(&mut self, id: NodeId, parent: NodeId) {
        self.parents[id.0 as usize] = Some(parent);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    pub fn node_ref(&self, id: NodeId) -> NodeRef {
        NodeRef::new(self.file_id, id)
    }

    /// Drop every function body, keeping declarations only. Applied to
    /// cached import units once their own compilation is done.
    pub fn shrink_to_declarations(&mut self) {
        for node in &mut self.nodes {
            match node {
                Node::Function(decl) => decl.body = None,
                Node::ExtensionFunction(ext) => ext.decl.body = None,
                _ => {}
            }
        }
    }
}

/// All files of one compilation root, in import-graph topological order.
/// `node` panics on a dangling reference; links produced by the resolver
/// are always valid by construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    files: Vec<FileAst>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, mut file: FileAst) -> FileId {
        let id = FileId(self.files.len() as u32);
        file.file_id = id;
        self.files.push(file);
        id
    }

    pub fn file(&self, id: FileId) -> &FileAst {
        &self.files[id.0 as usize]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut FileAst {
        &mut self.files[id.0 as usize]
    }

    pub fn files(&self) -> &[FileAst] {
        &self.files
    }

    pub fn node(&self, r: NodeRef) -> &Node {
        self.files[r.file.0 as usize].node(r.node)
    }

    pub fn node_mut(&mut self, r: NodeRef) -> &mut Node {
        self.files[r.file.0 as usize].node_mut(r.node)
    }

    pub fn requires_destruction(&self, r: NodeRef) -> bool {
        self.node(r).requires_destruction(r.file, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Position;

    #[test]
    fn test_arena_alloc_and_parents() {
        let mut file = FileAst::new(FileId(0), "a.ch");
        let scope = file.alloc(Node::Scope(Scope {
            body: vec![],
            position: Position::default(),
        }));
        let ret = file.alloc(Node::Return(ReturnStmt {
            value: None,
            position: Position::default(),
        }));
        file.set_parent(ret, scope);
        assert_eq!(file.parent(ret), Some(scope));
        assert_eq!(file.parent(scope), None);
        assert_eq!(file.len(), 2);
    }

    #[test]
    fn test_shrink_drops_bodies() {
        let mut file = FileAst::new(FileId(0), "a.ch");
        let body = file.alloc(Node::Scope(Scope {
            body: vec![],
            position: Position::default(),
        }));
        let f = file.alloc(Node::Function(FunctionDecl {
            name: "f".into(),
            generic_params: vec![],
            params: vec![],
            is_variadic: false,
            return_type: Type::Void,
            body: Some(body),
            annotations: vec![],
            iterations: vec![],
            position: Position::default(),
        }));
        file.shrink_to_declarations();
        match file.node(f) {
            Node::Function(decl) => assert!(decl.body.is_none()),
            _ => unreachable!(),
        }
    }
}
