//! Symbol resolution. Two passes per file: `declare_top_level` inserts
//! every top-level declaration name, then `declare_and_link` walks bodies,
//! linking identifiers, access chains and types. Unresolved symbols leave
//! their links null and a diagnostic behind; downstream passes must check.
//!
//! Resolution is idempotent: running it twice over an already-resolved
//! file changes no links and reports no new diagnostics.

mod scope;

pub use scope::SymbolTable;

use std::collections::HashMap;
use std::path::PathBuf;

use log::{debug, trace};

use crate::ast::generics::{register_iteration, substitute};
use crate::ast::{
    AccessChain, CapturedVariable, ChainElement, FileId, FunctionDecl, FunctionParam, Linked,
    Module, MultiFunctionNode, Node, NodeId, NodeRef, ReturnStmt, Scope, Type, Value,
};
use crate::diagnostics::{Diagnostics, Position};

pub struct Resolver<'m> {
    module: &'m mut Module,
    table: SymbolTable,
    /// Merged namespace member maps; namespaces of the same name union
    /// their children, duplicates in the union are errors.
    namespaces: HashMap<String, HashMap<String, Linked>>,
    /// Extendable-members containers: struct → extension functions.
    extensions: HashMap<NodeRef, HashMap<String, NodeRef>>,
    /// Generic parameter names currently in scope (inside generic decls).
    generic_params: Vec<Vec<String>>,
    pub diagnostics: Diagnostics,
    current_file: FileId,
    file_path: PathBuf,
    /// Ids for resolver-synthesised calls (implicit constructors); counted
    /// down from the top to stay disjoint from converter-assigned ids.
    synthetic_call_id: u32,
}

impl<'m> Resolver<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Self {
            module,
            table: SymbolTable::new(),
            namespaces: HashMap::new(),
            extensions: HashMap::new(),
            generic_params: vec![],
            diagnostics: Diagnostics::new(),
            current_file: FileId(0),
            file_path: PathBuf::new(),
            synthetic_call_id: u32::MAX,
        }
    }

    /// Resolve one file: declare pass, link pass, destructor synthesis.
    /// Files must be fed in import-graph order.
    pub fn resolve_file(&mut self, file: FileId) {
        self.current_file = file;
        self.file_path = self.module.file(file).file_path.clone();
        debug!("resolving {}", self.file_path.display());
        self.declare_top_level(file);
        self.declare_and_link(file);
        self.synthesize_destructors(file);
    }

    fn error(&mut self, position: Position, message: impl Into<String>) {
        let file = self.file_path.clone();
        self.diagnostics.error(position, &file, message);
    }

    // ---- pass 1: declare top level -------------------------------------

    fn declare_top_level(&mut self, file: FileId) {
        let root = self.module.file(file).root.clone();
        for id in root {
            self.declare_node(NodeRef::new(file, id));
        }
    }

    fn declare_node(&mut self, node_ref: NodeRef) {
        let node = self.module.node(node_ref);
        let position = node.position();
        match node {
            Node::Function(decl) => {
                let name = decl.name.clone();
                self.declare_function(&name, node_ref, position);
            }
            Node::ExtensionFunction(ext) => {
                let name = ext.decl.name.clone();
                self.declare_function(&name, node_ref, position);
            }
            Node::Namespace(ns) => {
                let name = ns.name.clone();
                let body = ns.body.clone();
                self.merge_namespace(&name, node_ref, &body, position);
            }
            Node::Import(_) | Node::Using(_) | Node::Error(_) => {}
            other => {
                if let Some(name) = other.declared_name().map(str::to_string) {
                    self.declare_plain(&name, node_ref, position);
                }
            }
        }
    }

    fn declare_plain(&mut self, name: &str, node_ref: NodeRef, position: Position) {
        match self.table.lookup_global(name) {
            Some(Linked::Node(existing)) if existing == node_ref => {}
            Some(_) => {
                self.error(position, format!("'{name}' is already declared"));
            }
            None => {
                self.table.declare_global(name, Linked::Node(node_ref));
            }
        }
    }

    /// Overload folding: a second function under an already-owned name
    /// replaces the entry with a MultiFunctionNode holding both.
    fn declare_function(&mut self, name: &str, node_ref: NodeRef, position: Position) {
        match self.table.lookup_global(name) {
            None => {
                self.table.declare_global(name, Linked::Node(node_ref));
            }
            Some(Linked::Node(existing)) if existing == node_ref => {}
            Some(Linked::Node(existing)) => match self.module.node(existing) {
                Node::MultiFunction(multi) => {
                    if !multi.functions.contains(&node_ref) {
                        let Node::MultiFunction(multi) = self.module.node_mut(existing) else {
                            unreachable!()
                        };
                        multi.functions.push(node_ref);
                    }
                }
                Node::Function(_) | Node::ExtensionFunction(_) => {
                    let multi = Node::MultiFunction(MultiFunctionNode {
                        name: name.to_string(),
                        functions: vec![existing, node_ref],
                        position,
                    });
                    let multi_id = self.module.file_mut(self.current_file).alloc(multi);
                    let multi_ref = NodeRef::new(self.current_file, multi_id);
                    self.table.declare_global(name, Linked::Node(multi_ref));
                }
                _ => self.error(position, format!("'{name}' is already declared")),
            },
            Some(_) => self.error(position, format!("'{name}' is already declared")),
        }
    }

    fn merge_namespace(
        &mut self,
        name: &str,
        node_ref: NodeRef,
        body: &[NodeId],
        position: Position,
    ) {
        if self.table.lookup_global(name).is_none() {
            self.table.declare_global(name, Linked::Node(node_ref));
        }
        let members = self.namespaces.entry(name.to_string()).or_default();
        let mut duplicates = vec![];
        for id in body {
            let child_ref = NodeRef::new(node_ref.file, *id);
            let child = self.module.node(child_ref);
            let Some(child_name) = child.declared_name().map(str::to_string) else {
                continue;
            };
            match members.get(&child_name) {
                Some(Linked::Node(existing)) if *existing == child_ref => {}
                Some(_) => duplicates.push(child_name),
                None => {
                    members.insert(child_name, Linked::Node(child_ref));
                }
            }
        }
        for duplicate in duplicates {
            self.error(
                position,
                format!("namespace '{name}' already contains '{duplicate}'"),
            );
        }
    }

    // ---- pass 2: declare and link --------------------------------------

    fn declare_and_link(&mut self, file: FileId) {
        self.register_extensions(file);
        let root = self.module.file(file).root.clone();
        for id in root {
            self.resolve_node(id, None);
        }
    }

    /// Extension functions insert into the receiver type's container;
    /// collision with an existing field or function on the type errors.
    fn register_extensions(&mut self, file: FileId) {
        let root = self.module.file(file).root.clone();
        for id in root {
            let node_ref = NodeRef::new(file, id);
            let Node::ExtensionFunction(ext) = self.module.node(node_ref) else {
                continue;
            };
            let name = ext.decl.name.clone();
            let position = ext.decl.position;
            let receiver_type = ext.receiver.param_type.clone();
            let target_name = match receiver_type.pure_type().as_ref() {
                Type::Pointer(inner) => match inner.as_ref() {
                    Type::Referenced { name, .. } => name.clone(),
                    _ => continue,
                },
                Type::Referenced { name, .. } => name.clone(),
                _ => continue,
            };
            let Some(Linked::Node(target)) = self.table.lookup_global(&target_name) else {
                self.error(
                    position,
                    format!("cannot extend unknown type '{target_name}'"),
                );
                continue;
            };
            if let Node::StructDef(def) = self.module.node(target) {
                let collides = def.member(&name).is_some()
                    || def.functions.iter().any(|fid| {
                        matches!(
                            self.module.file(target.file).node(*fid),
                            Node::Function(f) if f.name == name
                        )
                    });
                if collides {
                    self.error(
                        position,
                        format!("'{target_name}' already has a member named '{name}'"),
                    );
                    continue;
                }
            }
            let existing = self
                .extensions
                .get(&target)
                .and_then(|container| container.get(&name))
                .copied();
            match existing {
                Some(existing) if existing == node_ref => {}
                Some(_) => {
                    self.error(
                        position,
                        format!("'{target_name}' already has an extension named '{name}'"),
                    );
                }
                None => {
                    self.extensions.entry(target).or_default().insert(name, node_ref);
                }
            }
        }
    }

    fn resolve_node(&mut self, id: NodeId, parent: Option<NodeId>) {
        let node_ref = NodeRef::new(self.current_file, id);
        if let Some(parent) = parent {
            self.module.file_mut(self.current_file).set_parent(id, parent);
        }
        trace!("resolving node {:?}", id);
        let mut node = self.module.node(node_ref).clone();
        match &mut node {
            Node::VarInit(init) => {
                if let Some(declared) = &mut init.declared_type {
                    self.resolve_type(declared);
                }
                if let Some(value) = &mut init.value {
                    self.resolve_value(value);
                }
                self.table.declare(init.name.clone(), Linked::Node(node_ref));
            }
            Node::Assignment(stmt) => {
                if let Some(lhs) = &mut stmt.lhs {
                    self.resolve_value(lhs);
                }
                self.resolve_value(&mut stmt.value);
            }
            Node::IncDec(stmt) => self.resolve_value(&mut stmt.target),
            Node::If(stmt) => {
                self.resolve_value(&mut stmt.condition);
                self.resolve_scope(stmt.then_body, id);
                for (condition, body) in &mut stmt.else_ifs {
                    self.resolve_value(condition);
                    let body = *body;
                    self.resolve_scope(body, id);
                }
                if let Some(else_body) = stmt.else_body {
                    self.resolve_scope(else_body, id);
                }
            }
            Node::While(stmt) => {
                self.resolve_value(&mut stmt.condition);
                self.resolve_scope(stmt.body, id);
            }
            Node::DoWhile(stmt) => {
                self.resolve_scope(stmt.body, id);
                self.resolve_value(&mut stmt.condition);
            }
            Node::ForLoop(stmt) => {
                self.table.enter_scope();
                self.resolve_node(stmt.init, Some(id));
                self.resolve_value(&mut stmt.condition);
                self.resolve_node(stmt.increment, Some(id));
                self.resolve_scope(stmt.body, id);
                self.table.exit_scope();
            }
            Node::Switch(stmt) => {
                self.resolve_value(&mut stmt.expression);
                for (value, body) in &mut stmt.cases {
                    self.resolve_value(value);
                    let body = *body;
                    self.resolve_scope(body, id);
                }
                if let Some(default_case) = stmt.default_case {
                    self.resolve_scope(default_case, id);
                }
            }
            Node::Return(stmt) => {
                if let Some(value) = &mut stmt.value {
                    self.resolve_value(value);
                }
            }
            Node::Throw(stmt) => self.resolve_value(&mut stmt.value),
            Node::Delete(stmt) => self.resolve_value(&mut stmt.value),
            Node::Function(decl) => {
                // nested functions declare into the enclosing frame; the
                // global frame was already filled by the declare pass
                if self.table.depth() > 1 {
                    self.table.declare(decl.name.clone(), Linked::Node(node_ref));
                }
                self.resolve_function_decl(decl, node_ref, None);
            }
            Node::ExtensionFunction(ext) => {
                self.resolve_type(&mut ext.receiver.param_type);
                let receiver = ext.receiver.clone();
                self.resolve_function_decl(&mut ext.decl, node_ref, Some(&receiver));
            }
            Node::StructDef(def) => {
                self.generic_params.push(def.generic_params.clone());
                for member in &mut def.members {
                    self.resolve_type(&mut member.member_type);
                    if let Some(default) = &mut member.default_value {
                        self.resolve_value(default);
                    }
                }
                for function in def.functions.clone() {
                    self.resolve_node(function, Some(id));
                }
                for nested in def.nested.clone() {
                    self.resolve_node(nested, Some(id));
                }
                self.generic_params.pop();
            }
            Node::UnionDef(def) => {
                for member in &mut def.members {
                    self.resolve_type(&mut member.member_type);
                }
                for function in def.functions.clone() {
                    self.resolve_node(function, Some(id));
                }
            }
            Node::UnnamedStruct(def) => {
                for member in &mut def.members {
                    self.resolve_type(&mut member.member_type);
                }
            }
            Node::UnnamedUnion(def) => {
                for member in &mut def.members {
                    self.resolve_type(&mut member.member_type);
                }
            }
            Node::Interface(def) => {
                for function in def.functions.clone() {
                    self.resolve_node(function, Some(id));
                }
            }
            Node::Impl(def) => {
                match self.table.lookup_global(&def.interface_name) {
                    Some(Linked::Node(r))
                        if matches!(self.module.node(r), Node::Interface(_)) =>
                    {
                        def.interface = Some(r);
                    }
                    _ => {
                        let position = def.position;
                        let name = def.interface_name.clone();
                        self.error(position, format!("unknown interface '{name}'"));
                    }
                }
                if let Some(target_name) = def.target_name.clone() {
                    match self.table.lookup_global(&target_name) {
                        Some(Linked::Node(r)) => def.target = Some(r),
                        _ => {
                            let position = def.position;
                            self.error(position, format!("unknown type '{target_name}'"));
                        }
                    }
                }
                for function in def.functions.clone() {
                    self.resolve_node(function, Some(id));
                }
            }
            Node::Namespace(ns) => {
                for child in ns.body.clone() {
                    self.resolve_node(child, Some(id));
                }
            }
            Node::Scope(_) => {
                self.resolve_scope(id, parent.unwrap_or(id));
                return; // resolve_scope already wrote the parent links
            }
            Node::Typealias(alias) => self.resolve_type(&mut alias.to),
            Node::Using(stmt) => {
                if stmt.is_namespace {
                    if let Some(first) = stmt.path.first().cloned() {
                        self.apply_using_namespace(&first, stmt.position);
                    }
                }
            }
            Node::Import(_)
            | Node::Enum(_)
            | Node::Break { .. }
            | Node::Continue { .. }
            | Node::MultiFunction(_)
            | Node::Error(_) => {}
        }
        *self.module.node_mut(node_ref) = node;
    }

    fn apply_using_namespace(&mut self, name: &str, position: Position) {
        match self.namespaces.get(name) {
            Some(members) => {
                let members: Vec<(String, Linked)> =
                    members.iter().map(|(n, l)| (n.clone(), *l)).collect();
                for (member_name, linked) in members {
                    self.table.declare(member_name, linked);
                }
            }
            None => self.error(position, format!("unknown namespace '{name}'")),
        }
    }

    fn resolve_function_decl(
        &mut self,
        decl: &mut FunctionDecl,
        node_ref: NodeRef,
        receiver: Option<&FunctionParam>,
    ) {
        self.generic_params.push(decl.generic_params.clone());
        for param in &mut decl.params {
            self.resolve_type(&mut param.param_type);
        }
        self.resolve_type(&mut decl.return_type);

        if let Some(body) = decl.body {
            self.table.enter_scope();
            if let Some(receiver) = receiver {
                self.table.declare(
                    receiver.name.clone(),
                    Linked::Param {
                        owner: node_ref,
                        index: 0,
                    },
                );
            }
            let offset = usize::from(receiver.is_some());
            for (index, param) in decl.params.iter().enumerate() {
                self.table.declare(
                    param.name.clone(),
                    Linked::Param {
                        owner: node_ref,
                        index: index + offset,
                    },
                );
            }
            self.resolve_scope(body, node_ref.node);
            self.table.exit_scope();
        }
        self.generic_params.pop();
    }

    /// Scopes push and pop on entry/exit; children get their parent set.
    fn resolve_scope(&mut self, scope_id: NodeId, parent: NodeId) {
        let scope_ref = NodeRef::new(self.current_file, scope_id);
        self.module
            .file_mut(self.current_file)
            .set_parent(scope_id, parent);
        let Node::Scope(scope) = self.module.node(scope_ref) else {
            return;
        };
        let body = scope.body.clone();
        self.table.enter_scope();
        for child in body {
            self.resolve_node(child, Some(scope_id));
        }
        self.table.exit_scope();
    }

    // ---- types ---------------------------------------------------------

    fn in_generic_params(&self, name: &str) -> bool {
        self.generic_params
            .iter()
            .any(|frame| frame.iter().any(|p| p == name))
    }

    fn is_concrete(&self, ty: &Type) -> bool {
        match ty {
            Type::Referenced { name, linked } => {
                linked.is_some() || !self.in_generic_params(name)
            }
            Type::Pointer(inner) | Type::Literal(inner) => self.is_concrete(inner),
            Type::Array { elem_type, .. } => self.is_concrete(elem_type),
            Type::Generic { base, args, .. } => {
                self.is_concrete(base) && args.iter().all(|a| self.is_concrete(a))
            }
            Type::Function {
                params,
                return_type,
                ..
            } => params.iter().all(|p| self.is_concrete(p)) && self.is_concrete(return_type),
            _ => true,
        }
    }

    pub fn resolve_type(&mut self, ty: &mut Type) {
        match ty {
            Type::Referenced { name, linked } => {
                if linked.is_some() || self.in_generic_params(name) {
                    return;
                }
                let target = if let Some((namespace, member)) = name.split_once("::") {
                    self.namespaces
                        .get(namespace)
                        .and_then(|members| members.get(member))
                        .copied()
                } else {
                    self.table.lookup(name)
                };
                match target {
                    Some(Linked::Node(r)) if is_type_declaration(self.module.node(r)) => {
                        *linked = Some(r);
                    }
                    _ => {
                        // leave the link null; lowering treats a visited
                        // null link as fatal for the function only
                        let name = name.clone();
                        self.error(Position::default(), format!("undefined type '{name}'"));
                    }
                }
            }
            Type::Pointer(inner) | Type::Literal(inner) => self.resolve_type(inner),
            Type::Array { elem_type, .. } => self.resolve_type(elem_type),
            Type::Function {
                params,
                return_type,
                ..
            } => {
                for param in params {
                    self.resolve_type(param);
                }
                self.resolve_type(return_type);
            }
            Type::Generic {
                base,
                args,
                iteration,
            } => {
                self.resolve_type(base);
                for arg in args.iter_mut() {
                    self.resolve_type(arg);
                }
                if args.iter().all(|a| self.is_concrete(a)) {
                    if let Some(target) = base.linked_node() {
                        *iteration = self.register_generic_usage(target, args.clone());
                    }
                }
            }
            Type::Struct(fields) | Type::Union(fields) => {
                for (_, field_type) in fields {
                    self.resolve_type(field_type);
                }
            }
            _ => {}
        }
    }

    /// Register a concrete argument snapshot on a generic declaration,
    /// returning the iteration index.
    pub fn register_generic_usage(&mut self, target: NodeRef, args: Vec<Type>) -> usize {
        match self.module.node_mut(target) {
            Node::StructDef(def) => register_iteration(&mut def.iterations, args),
            Node::Function(decl) => register_iteration(&mut decl.iterations, args),
            Node::ExtensionFunction(ext) => register_iteration(&mut ext.decl.iterations, args),
            _ => 0,
        }
    }

    // ---- values --------------------------------------------------------

    pub fn resolve_value(&mut self, value: &mut Value) {
        match value {
            Value::Identifier {
                name,
                linked,
                position,
            } => {
                if linked.is_some() {
                    return;
                }
                match self.table.lookup(name) {
                    Some(target) => *linked = Some(target),
                    None => {
                        let name = name.clone();
                        let position = *position;
                        self.error(position, format!("undefined symbol '{name}'"));
                    }
                }
            }
            Value::Chain(chain) => self.resolve_chain(chain),
            Value::Expression { lhs, rhs, .. } => {
                self.resolve_value(lhs);
                self.resolve_value(rhs);
            }
            Value::Negative { value, .. }
            | Value::Not { value, .. }
            | Value::AddrOf { value, .. }
            | Value::Dereference { value, .. } => self.resolve_value(value),
            Value::Cast { value, target, .. } => {
                self.resolve_value(value);
                self.resolve_type(target);
            }
            Value::SizeOf { target, .. } => self.resolve_type(target),
            Value::Ternary {
                condition,
                left,
                right,
                ..
            } => {
                self.resolve_value(condition);
                self.resolve_value(left);
                self.resolve_value(right);
            }
            Value::Lambda(lambda) => self.resolve_lambda(lambda),
            Value::StructValue(struct_value) => {
                self.resolve_type(&mut struct_value.ref_type);
                struct_value.linked = struct_value.ref_type.linked_node();
                if let Some(target) = struct_value.linked {
                    let Node::StructDef(def) = self.module.node(target) else {
                        let position = struct_value.position;
                        self.error(position, "struct value names a non-struct type");
                        return;
                    };
                    let unknown: Vec<String> = struct_value
                        .fields
                        .iter()
                        .filter(|(name, _)| def.member(name).is_none())
                        .map(|(name, _)| name.clone())
                        .collect();
                    for name in unknown {
                        let position = struct_value.position;
                        self.error(position, format!("unknown field '{name}'"));
                    }
                }
                for (_, field_value) in &mut struct_value.fields {
                    self.resolve_value(field_value);
                }
            }
            Value::ArrayValue {
                values, elem_type, ..
            } => {
                if let Some(elem_type) = elem_type {
                    self.resolve_type(elem_type);
                }
                for value in values {
                    self.resolve_value(value);
                }
            }
            _ => {}
        }
    }

    /// Captures link in the enclosing scope before the lambda's own frame
    /// is pushed; the body then resolves with parameters declared.
    fn resolve_lambda(&mut self, lambda: &mut crate::ast::LambdaValue) {
        for capture in &mut lambda.captures {
            self.resolve_capture(capture);
        }
        for param in &mut lambda.params {
            self.resolve_type(&mut param.param_type);
        }
        if let Some(return_type) = &mut lambda.return_type {
            self.resolve_type(return_type);
        }

        let body_ref = NodeRef::new(self.current_file, lambda.body);
        self.table.enter_scope();
        // captured variables stay visible inside the body under their
        // original links
        for capture in &lambda.captures {
            if let Some(linked) = capture.linked {
                self.table.declare(capture.name.clone(), linked);
            }
        }
        for (index, param) in lambda.params.iter().enumerate() {
            self.table.declare(
                param.name.clone(),
                Linked::LambdaParam {
                    body: body_ref,
                    index,
                },
            );
        }
        let body = lambda.body;
        self.resolve_scope(body, body);
        self.table.exit_scope();

        if lambda.return_type.is_none() {
            lambda.return_type = self.infer_scope_return_type(lambda.body, lambda);
        }
    }

    fn resolve_capture(&mut self, capture: &mut CapturedVariable) {
        if capture.linked.is_some() {
            return;
        }
        match self.table.lookup(&capture.name) {
            Some(target) => capture.linked = Some(target),
            None => {
                let name = capture.name.clone();
                let position = capture.position;
                self.error(position, format!("cannot capture undefined '{name}'"));
            }
        }
    }

    /// Expression-bodied lambdas get their return type from the single
    /// return's value; block-bodied ones fall back to void when no return
    /// carries a typed value.
    fn infer_scope_return_type(
        &self,
        scope_id: NodeId,
        lambda: &crate::ast::LambdaValue,
    ) -> Option<Type> {
        let scope_ref = NodeRef::new(self.current_file, scope_id);
        let Node::Scope(scope) = self.module.node(scope_ref) else {
            return Some(Type::Void);
        };
        for id in &scope.body {
            if let Node::Return(ReturnStmt {
                value: Some(value), ..
            }) = self.module.node(NodeRef::new(self.current_file, *id))
            {
                if let Some(t) = self.infer_value_type(value, lambda) {
                    return Some(t.pure_type().into_owned());
                }
            }
        }
        Some(Type::Void)
    }

    /// Like `Value::create_type`, but falls back to the lambda's own
    /// parameter list for identifiers whose links carry no type (lambda
    /// parameters are only typed through the enclosing lambda).
    fn infer_value_type(
        &self,
        value: &Value,
        lambda: &crate::ast::LambdaValue,
    ) -> Option<Type> {
        match value {
            Value::Identifier { name, .. } => {
                if let Some(param) = lambda.params.iter().find(|p| &p.name == name) {
                    return Some(param.param_type.clone());
                }
                value.create_type(self.module)
            }
            Value::Expression { lhs, rhs, op, .. } => {
                if op.is_comparison() || op.is_logical() {
                    return Some(Type::Bool);
                }
                let left = self.infer_value_type(lhs, lambda);
                match left {
                    Some(Type::Literal(_)) | None => self
                        .infer_value_type(rhs, lambda)
                        .or(left)
                        .map(|t| t.pure_type().into_owned()),
                    other => other,
                }
            }
            other => other.create_type(self.module),
        }
    }

    // ---- access chains -------------------------------------------------

    /// Chains link left-to-right; each element after the first resolves
    /// relative to the linked node of the previous element.
    fn resolve_chain(&mut self, chain: &mut AccessChain) {
        let mut prev_type: Option<Type> = None;
        let mut prev_linked: Option<Linked> = None;
        let mut namespace: Option<String> = None;

        for index in 0..chain.elements.len() {
            let kind = match &chain.elements[index] {
                ChainElement::Identifier { .. } => 0u8,
                ChainElement::Index { .. } => 1,
                ChainElement::Call { .. } => 2,
            };
            match kind {
                0 => {
                    let (name, position) = {
                        let ChainElement::Identifier { name, position, .. } =
                            &chain.elements[index]
                        else {
                            unreachable!()
                        };
                        (name.clone(), *position)
                    };
                    let resolved = if index == 0 {
                        self.table.lookup(&name)
                    } else if let Some(ns) = namespace.take() {
                        self.namespaces
                            .get(&ns)
                            .and_then(|members| members.get(name.as_str()))
                            .copied()
                    } else {
                        self.lookup_member(prev_type.as_ref(), prev_linked, &name)
                    };
                    match resolved {
                        Some(target) => {
                            if let ChainElement::Identifier { linked, .. } =
                                &mut chain.elements[index]
                            {
                                *linked = Some(target);
                            }
                            if let Linked::Node(r) = target {
                                if let Node::Namespace(ns) = self.module.node(r) {
                                    namespace = Some(ns.name.clone());
                                }
                            }
                            prev_type = target.value_type(self.module);
                            prev_linked = Some(target);
                        }
                        None => {
                            self.error(position, format!("undefined symbol '{name}'"));
                            return;
                        }
                    }
                }
                1 => {
                    if let ChainElement::Index { index: idx, .. } = &mut chain.elements[index] {
                        let idx: &mut Value = idx;
                        self.resolve_value(idx);
                    }
                    prev_type = prev_type.and_then(|t| match t.pure_type().into_owned() {
                        Type::Array { elem_type, .. } => Some(*elem_type),
                        Type::Pointer(inner) => Some(*inner),
                        _ => None,
                    });
                    prev_linked = prev_type
                        .as_ref()
                        .and_then(|t| t.linked_node())
                        .map(Linked::Node);
                }
                _ => {
                    let (resolved_type, resolved_linked) =
                        self.resolve_call(chain, index, prev_linked);
                    prev_type = resolved_type;
                    prev_linked = resolved_linked;
                }
            }
        }
    }

    /// Member lookup on the previous element: struct fields, member
    /// functions, extension functions, enum members.
    fn lookup_member(
        &self,
        prev_type: Option<&Type>,
        prev_linked: Option<Linked>,
        name: &str,
    ) -> Option<Linked> {
        // enum member access: Color::Red or Color.Red
        if let Some(Linked::Node(owner)) = prev_linked {
            if let Node::Enum(decl) = self.module.node(owner) {
                let index = decl.members.iter().position(|m| m == name)?;
                return Some(Linked::EnumMember { owner, index });
            }
        }
        let owner = match prev_type?.pure_type().as_ref() {
            Type::Pointer(inner) => inner.linked_node()?,
            other => other.linked_node()?,
        };
        match self.module.node(owner) {
            Node::StructDef(def) => {
                if let Some((index, _)) = def.member(name) {
                    return Some(Linked::Field { owner, index });
                }
                for fid in &def.functions {
                    if let Node::Function(f) = self.module.file(owner.file).node(*fid) {
                        if f.name == name {
                            return Some(Linked::Node(NodeRef::new(owner.file, *fid)));
                        }
                    }
                }
                self.extensions
                    .get(&owner)
                    .and_then(|map| map.get(name))
                    .map(|r| Linked::Node(*r))
            }
            Node::UnionDef(def) => def
                .members
                .iter()
                .position(|m| m.name == name)
                .map(|index| Linked::Field { owner, index }),
            Node::Typealias(alias) => {
                let linked = alias.to.linked_node()?;
                self.lookup_member(
                    Some(&Type::Referenced {
                        name: String::new(),
                        linked: Some(linked),
                    }),
                    Some(Linked::Node(linked)),
                    name,
                )
            }
            _ => None,
        }
    }

    /// Calls: overload selection on multi-functions, constructor
    /// invocation on struct targets, generic iteration registration,
    /// implicit constructor insertion on arguments.
    fn resolve_call(
        &mut self,
        chain: &mut AccessChain,
        index: usize,
        prev_linked: Option<Linked>,
    ) -> (Option<Type>, Option<Linked>) {
        // resolve arguments first (clone out to appease the borrow on chain)
        let ChainElement::Call { mut args, generic_args, call_id, position, .. } =
            chain.elements[index].clone()
        else {
            return (None, None);
        };
        let mut resolved_generic_args = generic_args;
        for arg in &mut args {
            self.resolve_value(arg);
        }
        for garg in &mut resolved_generic_args {
            self.resolve_type(garg);
        }
        let arg_types: Vec<Option<Type>> =
            args.iter().map(|a| a.create_type(self.module)).collect();

        let mut linked = prev_linked;
        let mut overload_index = None;
        let mut iteration = 0usize;
        let mut result_type = None;

        match prev_linked {
            Some(Linked::Node(target)) => match self.module.node(target).clone() {
                Node::MultiFunction(multi) => {
                    // satisfaction admits candidates; family-closeness
                    // ranks them, and a tie at the top is an error
                    let mut candidates = vec![];
                    for (i, func_ref) in multi.functions.iter().enumerate() {
                        if let Node::Function(decl) = self.module.node(*func_ref) {
                            if decl.satisfied_by(&arg_types) {
                                let score: u32 = decl
                                    .params
                                    .iter()
                                    .zip(&arg_types)
                                    .map(|(p, a)| match a {
                                        Some(a) => overload_score(&p.param_type, a),
                                        None => 0,
                                    })
                                    .sum();
                                candidates.push((score, i, *func_ref));
                            }
                        }
                    }
                    let best = candidates.iter().map(|(s, _, _)| *s).max();
                    match best {
                        None => {
                            let name = multi.name.clone();
                            self.error(
                                position,
                                format!("no overload of '{name}' matches these arguments"),
                            );
                        }
                        Some(top) => {
                            let mut winners =
                                candidates.iter().filter(|(s, _, _)| *s == top);
                            let first = winners.next();
                            if winners.next().is_some() {
                                let name = multi.name.clone();
                                self.error(position, format!("ambiguous call to '{name}'"));
                            } else if let Some((_, i, func_ref)) = first {
                                linked = Some(Linked::Node(*func_ref));
                                overload_index = Some(*i);
                                if let Node::Function(decl) = self.module.node(*func_ref) {
                                    result_type = Some(decl.return_type.clone());
                                }
                            }
                        }
                    }
                }
                Node::Function(decl) => {
                    let member_call = index >= 2;
                    if !member_call && !decl.satisfied_by(&arg_types) && !decl.is_variadic {
                        self.insert_implicit_constructors(&decl, &mut args, &arg_types);
                    }
                    if decl.is_generic() {
                        let type_args = if !resolved_generic_args.is_empty() {
                            resolved_generic_args.clone()
                        } else {
                            self.infer_generic_args(&decl, &arg_types)
                        };
                        if type_args.len() == decl.generic_params.len()
                            && type_args.iter().all(|t| self.is_concrete(t))
                        {
                            iteration = self.register_generic_usage(target, type_args.clone());
                            result_type = Some(substitute(
                                &decl.return_type,
                                &decl.generic_params,
                                &type_args,
                            ));
                        } else {
                            let name = decl.name.clone();
                            self.error(
                                position,
                                format!("cannot infer generic arguments of '{name}'"),
                            );
                        }
                    } else {
                        result_type = Some(decl.return_type.clone());
                    }
                }
                Node::ExtensionFunction(ext) => {
                    result_type = Some(ext.decl.return_type.clone());
                }
                Node::StructDef(def) => {
                    // constructor invocation; the value type is the struct
                    let mut struct_type = Type::Referenced {
                        name: def.name.clone(),
                        linked: Some(target),
                    };
                    if def.is_generic() && !resolved_generic_args.is_empty() {
                        iteration =
                            self.register_generic_usage(target, resolved_generic_args.clone());
                        struct_type = Type::Generic {
                            base: Box::new(struct_type),
                            args: resolved_generic_args.clone(),
                            iteration,
                        };
                    }
                    if def.constructor(self.module, target.file).is_none() {
                        let name = def.name.clone();
                        self.error(position, format!("'{name}' has no constructor"));
                    }
                    result_type = Some(struct_type);
                }
                Node::VarInit(_) => {
                    // function-typed storage; the fallback below types it
                }
                _ => {
                    self.error(position, "this value cannot be called");
                }
            },
            Some(Linked::Field { owner, index: field_index }) => {
                // calling through a field of function type
                if let Node::StructDef(def) = self.module.node(owner) {
                    if let Some(member) = def.members.get(field_index) {
                        if let Type::Function { return_type, .. } =
                            member.member_type.pure_type().as_ref()
                        {
                            result_type = Some((**return_type).clone());
                        } else {
                            self.error(position, "this field is not callable");
                        }
                    }
                }
            }
            Some(Linked::Param { .. }) | Some(Linked::LambdaParam { .. }) => {
                // calling a function-typed parameter; the type flows from
                // the parameter's declared function type
                if let Some(Type::Function { return_type, .. }) = prev_linked
                    .and_then(|l| l.value_type(self.module))
                    .map(|t| t.pure_type().into_owned())
                {
                    result_type = Some(*return_type);
                }
            }
            _ => {
                self.error(position, "this value cannot be called");
            }
        }

        // VarInit holding a lambda or function type is also callable
        if result_type.is_none() {
            if let Some(Linked::Node(target)) = prev_linked {
                if let Node::VarInit(_) = self.module.node(target) {
                    if let Some(Type::Function { return_type, .. }) = prev_linked
                        .and_then(|l| l.value_type(self.module))
                        .map(|t| t.pure_type().into_owned())
                    {
                        result_type = Some(*return_type);
                    }
                }
            }
        }

        let ChainElement::Call {
            args: out_args,
            generic_args: out_generic_args,
            linked: out_linked,
            overload_index: out_overload,
            iteration: out_iteration,
            call_id: out_call_id,
            ..
        } = &mut chain.elements[index]
        else {
            unreachable!()
        };
        *out_args = args;
        *out_generic_args = resolved_generic_args;
        *out_linked = linked;
        *out_overload = overload_index;
        *out_iteration = iteration;
        *out_call_id = call_id;

        (result_type, linked)
    }

    /// When passing `V` to a parameter of struct type `T` whose constructor
    /// accepts `V`, rewrite the argument into a constructor call.
    fn insert_implicit_constructors(
        &mut self,
        decl: &FunctionDecl,
        args: &mut [Value],
        arg_types: &[Option<Type>],
    ) {
        for (i, param) in decl.params.iter().enumerate() {
            let (Some(arg), Some(Some(arg_type))) = (args.get(i), arg_types.get(i)) else {
                continue;
            };
            if param.param_type.satisfies(arg_type) {
                continue;
            }
            let Some(struct_ref) = param.param_type.pure_type().linked_node() else {
                continue;
            };
            let Node::StructDef(def) = self.module.node(struct_ref) else {
                continue;
            };
            let Some((ctor_id, ctor)) = def.constructor(self.module, struct_ref.file) else {
                continue;
            };
            if !ctor.satisfied_by(&[Some(arg_type.clone())]) {
                continue;
            }
            let struct_name = def.name.clone();
            let ctor_ref = NodeRef::new(struct_ref.file, ctor_id);
            let position = arg.position();
            let call_id = self.synthetic_call_id;
            self.synthetic_call_id -= 1;
            debug!(
                "inserting implicit constructor '{struct_name}' around argument {i} of '{}'",
                decl.name
            );
            let original = std::mem::replace(&mut args[i], Value::Error { position });
            args[i] = Value::Chain(AccessChain {
                elements: vec![
                    ChainElement::Identifier {
                        name: struct_name,
                        linked: Some(Linked::Node(struct_ref)),
                        position,
                    },
                    ChainElement::Call {
                        args: vec![original],
                        generic_args: vec![],
                        linked: Some(Linked::Node(ctor_ref)),
                        overload_index: None,
                        iteration: 0,
                        call_id,
                        position,
                    },
                ],
                position,
            });
        }
    }

    /// Infer generic arguments by matching parameter types that name a
    /// generic parameter directly against the actual argument types.
    fn infer_generic_args(&self, decl: &FunctionDecl, arg_types: &[Option<Type>]) -> Vec<Type> {
        let mut inferred = vec![];
        for generic_param in &decl.generic_params {
            let mut found = None;
            for (param, arg_type) in decl.params.iter().zip(arg_types) {
                let Some(arg_type) = arg_type else { continue };
                if let Some(t) = match_generic(&param.param_type, generic_param, arg_type) {
                    found = Some(t);
                    break;
                }
            }
            if let Some(t) = found {
                inferred.push(t.pure_type().into_owned());
            }
        }
        inferred
    }

    // ---- destructor synthesis ------------------------------------------

    /// For every struct that requires destruction a destructor exists
    /// after resolution; structs that never declared one get an empty
    /// synthesised body (field destruction is emitted by the back-ends).
    fn synthesize_destructors(&mut self, file: FileId) {
        let ids: Vec<NodeId> = self.module.file(file).node_ids().collect();
        for id in ids {
            let node_ref = NodeRef::new(file, id);
            let Node::StructDef(def) = self.module.node(node_ref) else {
                continue;
            };
            if def.destructor(self.module, file).is_some() {
                continue;
            }
            let needs = def
                .members
                .iter()
                .any(|m| m.member_type.requires_destruction(self.module))
                || def.annotations.iter().any(|a| a.name == "destructor");
            if !needs {
                continue;
            }
            let name = def.name.clone();
            let position = def.position;
            debug!("synthesising destructor for struct '{name}'");
            let body = self.module.file_mut(file).alloc(Node::Scope(Scope {
                body: vec![],
                position,
            }));
            let dtor = self.module.file_mut(file).alloc(Node::Function(FunctionDecl {
                name: "delete".into(),
                generic_params: vec![],
                params: vec![FunctionParam {
                    name: "self".into(),
                    param_type: Type::Pointer(Box::new(Type::Referenced {
                        name: name.clone(),
                        linked: Some(node_ref),
                    })),
                    position,
                }],
                is_variadic: false,
                return_type: Type::Void,
                body: Some(body),
                annotations: vec![crate::ast::Annotation {
                    name: "destructor".into(),
                    position,
                }],
                iterations: vec![],
                position,
            }));
            let Node::StructDef(def) = self.module.node_mut(node_ref) else {
                unreachable!()
            };
            def.functions.push(dtor);
        }
    }
}

/// Closeness of one argument to one parameter: same numeric family (or a
/// structural match) scores, cross-family literal conversions don't.
fn overload_score(param: &Type, arg: &Type) -> u32 {
    let p = param.pure_type();
    let a = arg.pure_type();
    let int_family =
        |t: &Type| matches!(t, Type::IntN { .. } | Type::Bool | Type::Char);
    let float_family = |t: &Type| matches!(t, Type::Float | Type::Double);
    if int_family(&p) && int_family(&a) {
        1
    } else if float_family(&p) && float_family(&a) {
        1
    } else if p.is_same(&a) {
        1
    } else {
        0
    }
}

fn is_type_declaration(node: &Node) -> bool {
    matches!(
        node,
        Node::StructDef(_)
            | Node::UnionDef(_)
            | Node::UnnamedStruct(_)
            | Node::UnnamedUnion(_)
            | Node::Interface(_)
            | Node::Enum(_)
            | Node::Typealias(_)
    )
}

/// If `param_type` mentions `generic_param` in a position that pins it,
/// extract the matching piece of `arg_type`.
fn match_generic(param_type: &Type, generic_param: &str, arg_type: &Type) -> Option<Type> {
    match (param_type, arg_type.pure_type().as_ref()) {
        (Type::Referenced { name, .. }, concrete) if name == generic_param => {
            Some(concrete.clone())
        }
        (Type::Pointer(p), Type::Pointer(a)) => match_generic(p, generic_param, a),
        (
            Type::Array { elem_type: p, .. },
            Type::Array { elem_type: a, .. },
        ) => match_generic(p, generic_param, a),
        (Type::Generic { args: pa, .. }, Type::Generic { args: aa, .. }) => pa
            .iter()
            .zip(aa)
            .find_map(|(p, a)| match_generic(p, generic_param, a)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::FileAst;
    use crate::converter::Converter;
    use crate::lexer::Lexer;

    fn resolve_source(source: &str) -> (Module, Diagnostics) {
        let lexed = Lexer::new(source, "test.ch").lex();
        assert!(!lexed.diagnostics.has_errors());
        let converted = Converter::new(FileId(0), "test.ch").convert(&lexed.unit);
        assert!(!converted.diagnostics.has_errors());
        let mut module = Module::new();
        let file = module.add_file(converted.file);
        let mut resolver = Resolver::new(&mut module);
        resolver.resolve_file(file);
        let diagnostics = resolver.diagnostics.clone();
        (module, diagnostics)
    }

    fn file_ast(module: &Module) -> &FileAst {
        module.file(FileId(0))
    }

    #[test]
    fn test_overload_folding_single_multi_node() {
        let (module, diagnostics) = resolve_source(
            "func add(a : int, b : int) : int { return a + b; }\nfunc add(a : float, b : float) : float { return a + b; }\nfunc go() : int { return add(1, 2); }",
        );
        assert!(!diagnostics.has_errors());
        let multis: Vec<_> = file_ast(&module)
            .node_ids()
            .filter(|id| matches!(file_ast(&module).node(*id), Node::MultiFunction(_)))
            .collect();
        assert_eq!(multis.len(), 1, "exactly one MultiFunctionNode expected");
    }

    #[test]
    fn test_overload_selection_links_int_variant() {
        let (module, diagnostics) = resolve_source(
            "func add(a : int, b : int) : int { return a + b; }\nfunc add(a : float, b : float) : float { return a + b; }\nfunc go() : int { return add(1, 2); }",
        );
        assert!(!diagnostics.has_errors());
        // find go's return chain call and check the linked overload
        let file = file_ast(&module);
        let mut checked = false;
        for id in file.node_ids() {
            let Node::Function(decl) = file.node(id) else { continue };
            if decl.name != "go" {
                continue;
            }
            let Node::Scope(scope) = file.node(decl.body.unwrap()) else { panic!() };
            let Node::Return(ret) = file.node(scope.body[0]) else { panic!() };
            let Some(Value::Chain(chain)) = &ret.value else { panic!() };
            let Some(ChainElement::Call { linked, .. }) = chain.elements.last() else {
                panic!()
            };
            let Some(Linked::Node(target)) = linked else { panic!() };
            let Node::Function(target_decl) = module.node(*target) else { panic!() };
            assert!(target_decl.params[0].param_type.is_same(&Type::int()));
            checked = true;
        }
        assert!(checked);
    }

    #[test]
    fn test_ambiguous_overload_errors() {
        let (_, diagnostics) = resolve_source(
            "func add(a : int, b : double) : int { return a; }\nfunc add(a : long, b : double) : long { return a; }\nfunc go() : int { return add(1, 2.0); }",
        );
        assert!(diagnostics.has_errors());
        assert!(diagnostics
            .iter()
            .any(|d| d.message.contains("ambiguous")));
    }

    #[test]
    fn test_generic_struct_registers_iterations() {
        let (module, diagnostics) = resolve_source(
            "struct Vec<T> { data : *T; len : int; }\nfunc go() : void { var a : Vec<int>; var b : Vec<float>; var c : Vec<int>; }",
        );
        assert!(!diagnostics.has_errors());
        let file = file_ast(&module);
        let def = file
            .node_ids()
            .find_map(|id| match file.node(id) {
                Node::StructDef(def) => Some(def.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(def.iterations.len(), 2);
    }

    #[test]
    fn test_resolution_idempotent() {
        let source = "struct Vec<T> { data : *T; len : int; }\nfunc size<T>(v : Vec<T>) : int { return v.len; }\nfunc go() : int { var v : Vec<int>; return size(v); }";
        let lexed = Lexer::new(source, "test.ch").lex();
        let converted = Converter::new(FileId(0), "test.ch").convert(&lexed.unit);
        let mut module = Module::new();
        let file = module.add_file(converted.file);

        let mut resolver = Resolver::new(&mut module);
        resolver.resolve_file(file);
        assert!(!resolver.diagnostics.has_errors());
        drop(resolver);
        let snapshot = format!("{module:?}");

        let mut resolver = Resolver::new(&mut module);
        resolver.resolve_file(file);
        assert!(!resolver.diagnostics.has_errors());
        assert!(resolver.diagnostics.is_empty(), "second run must not diagnose");
        drop(resolver);
        assert_eq!(snapshot, format!("{module:?}"));
    }

    #[test]
    fn test_destructor_synthesised_transitively() {
        let (module, diagnostics) = resolve_source(
            "struct Inner { x : int; @destructor func delete(self : *Inner) : void { } }\nstruct Outer { inner : Inner; }",
        );
        assert!(!diagnostics.has_errors());
        let file = file_ast(&module);
        let outer_ref = file
            .node_ids()
            .find(|id| matches!(file.node(*id), Node::StructDef(d) if d.name == "Outer"))
            .map(|id| NodeRef::new(FileId(0), id))
            .unwrap();
        assert!(module.requires_destruction(outer_ref));
        let Node::StructDef(outer) = module.node(outer_ref) else { panic!() };
        assert!(outer.destructor(&module, FileId(0)).is_some());
    }

    #[test]
    fn test_undefined_symbol_leaves_null_link() {
        let (module, diagnostics) = resolve_source("func go() : int { return missing; }");
        assert!(diagnostics.has_errors());
        let file = file_ast(&module);
        for id in file.node_ids() {
            if let Node::Return(ret) = file.node(id) {
                if let Some(Value::Identifier { linked, .. }) = &ret.value {
                    assert!(linked.is_none());
                }
            }
        }
    }

    #[test]
    fn test_chain_links_struct_field() {
        let (module, diagnostics) = resolve_source(
            "struct P { x : int; y : int; }\nfunc get(p : P) : int { return p.x; }",
        );
        assert!(!diagnostics.has_errors());
        let file = file_ast(&module);
        let mut found = false;
        for id in file.node_ids() {
            if let Node::Return(ret) = file.node(id) {
                if let Some(Value::Chain(chain)) = &ret.value {
                    let ChainElement::Identifier { linked, .. } = &chain.elements[1] else {
                        panic!()
                    };
                    assert!(matches!(linked, Some(Linked::Field { index: 0, .. })));
                    found = true;
                }
            }
        }
        assert!(found);
    }
}
