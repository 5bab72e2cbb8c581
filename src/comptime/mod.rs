//! Compile-time evaluation. Functions annotated `@comptime` are run by a
//! small tree-walking interpreter producing a residual [`Value`] that both
//! back-ends splice in at the call site. Every call site evaluates at most
//! once per compilation; the residual is memoised by call-site identity.

use std::collections::HashMap;

use log::trace;

use crate::ast::{
    BinaryOp, ChainElement, FunctionDecl, Linked, Module, Node, NodeRef, Type, Value,
};
use crate::diagnostics::Position;

const MAX_LOOP_STEPS: usize = 100_000;
const MAX_CALL_DEPTH: usize = 64;

/// Compilation-wide evaluation state: the memoisation map, keyed by the
/// converter-assigned call-site id, written at most once per key. Threaded
/// explicitly; there is no global interpret scope.
#[derive(Debug, Default)]
pub struct ComptimeContext {
    memo: HashMap<u32, Value>,
}

impl ComptimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, call_id: u32) -> Option<&Value> {
        self.memo.get(&call_id)
    }
}

enum Flow {
    Normal,
    Return(Option<Value>),
    Break,
    Continue,
}

/// One lexical frame of interpreted bindings.
type Frame = HashMap<String, Value>;

pub struct ComptimeEvaluator<'m> {
    module: &'m Module,
    /// Number of actual (non-memoised) evaluations, for introspection.
    pub invocations: usize,
}

impl<'m> ComptimeEvaluator<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            invocations: 0,
        }
    }

    /// Residual for one call site. Memoised: a given call-site expression
    /// evaluates at most once per compilation.
    pub fn residual(
        &mut self,
        ctx: &mut ComptimeContext,
        call_id: u32,
        decl_ref: NodeRef,
        args: &[Value],
    ) -> Option<Value> {
        if let Some(cached) = ctx.memo.get(&call_id) {
            return Some(cached.clone());
        }
        let Node::Function(decl) = self.module.node(decl_ref) else {
            return None;
        };
        trace!("evaluating comptime call {} to '{}'", call_id, decl.name);
        self.invocations += 1;
        let residual = self.interpret_function(decl, decl_ref, args, 0)?;
        ctx.memo.insert(call_id, residual.clone());
        Some(residual)
    }

    fn interpret_function(
        &mut self,
        decl: &FunctionDecl,
        decl_ref: NodeRef,
        args: &[Value],
        depth: usize,
    ) -> Option<Value> {
        if depth > MAX_CALL_DEPTH {
            return None;
        }
        let mut scope: Vec<Frame> = vec![Frame::new()];
        for (param, arg) in decl.params.iter().zip(args) {
            let evaluated = self.eval(arg, &mut scope, depth)?;
            scope.last_mut().unwrap().insert(param.name.clone(), evaluated);
        }
        let body = decl.body?;
        match self.run_scope(NodeRef::new(decl_ref.file, body), &mut scope, depth)? {
            Flow::Return(value) => value,
            _ => None,
        }
    }

    fn run_scope(
        &mut self,
        scope_ref: NodeRef,
        scope: &mut Vec<Frame>,
        depth: usize,
    ) -> Option<Flow> {
        let Node::Scope(body) = self.module.node(scope_ref) else {
            return Some(Flow::Normal);
        };
        scope.push(Frame::new());
        for id in &body.body {
            let flow = self.run_statement(NodeRef::new(scope_ref.file, *id), scope, depth)?;
            if !matches!(flow, Flow::Normal) {
                scope.pop();
                return Some(flow);
            }
        }
        scope.pop();
        Some(Flow::Normal)
    }

    fn run_statement(
        &mut self,
        node_ref: NodeRef,
        scope: &mut Vec<Frame>,
        depth: usize,
    ) -> Option<Flow> {
        match self.module.node(node_ref) {
            Node::VarInit(init) => {
                let value = match &init.value {
                    Some(value) => self.eval(value, scope, depth)?,
                    None => Value::Null {
                        position: init.position,
                    },
                };
                scope.last_mut().unwrap().insert(init.name.clone(), value);
                Some(Flow::Normal)
            }
            Node::Assignment(stmt) => {
                let value = self.eval(&stmt.value, scope, depth)?;
                if let Some(Value::Identifier { name, .. }) = &stmt.lhs {
                    for frame in scope.iter_mut().rev() {
                        if frame.contains_key(name) {
                            frame.insert(name.clone(), value);
                            return Some(Flow::Normal);
                        }
                    }
                }
                Some(Flow::Normal)
            }
            Node::IncDec(stmt) => {
                if let Value::Identifier { name, .. } = &stmt.target {
                    let delta = if stmt.increment { 1 } else { -1 };
                    for frame in scope.iter_mut().rev() {
                        if let Some(Value::Int { value, .. }) = frame.get_mut(name) {
                            *value += delta;
                            break;
                        }
                    }
                }
                Some(Flow::Normal)
            }
            Node::If(stmt) => {
                if self.truthy(&stmt.condition, scope, depth)? {
                    return self.run_scope(
                        NodeRef::new(node_ref.file, stmt.then_body),
                        scope,
                        depth,
                    );
                }
                for (condition, body) in &stmt.else_ifs {
                    if self.truthy(condition, scope, depth)? {
                        return self.run_scope(NodeRef::new(node_ref.file, *body), scope, depth);
                    }
                }
                if let Some(else_body) = stmt.else_body {
                    return self.run_scope(NodeRef::new(node_ref.file, else_body), scope, depth);
                }
                Some(Flow::Normal)
            }
            Node::While(stmt) => {
                let mut steps = 0;
                while self.truthy(&stmt.condition, scope, depth)? {
                    steps += 1;
                    if steps > MAX_LOOP_STEPS {
                        return None;
                    }
                    match self.run_scope(NodeRef::new(node_ref.file, stmt.body), scope, depth)? {
                        Flow::Return(v) => return Some(Flow::Return(v)),
                        Flow::Break => break,
                        _ => {}
                    }
                }
                Some(Flow::Normal)
            }
            Node::Return(stmt) => {
                let value = match &stmt.value {
                    Some(value) => Some(self.eval(value, scope, depth)?),
                    None => None,
                };
                Some(Flow::Return(value))
            }
            Node::Break { .. } => Some(Flow::Break),
            Node::Continue { .. } => Some(Flow::Continue),
            Node::Scope(_) => self.run_scope(node_ref, scope, depth),
            _ => Some(Flow::Normal),
        }
    }

    fn truthy(&mut self, value: &Value, scope: &mut Vec<Frame>, depth: usize) -> Option<bool> {
        match self.eval(value, scope, depth)? {
            Value::Bool { value, .. } => Some(value),
            Value::Int { value, .. } => Some(value != 0),
            _ => None,
        }
    }

    fn lookup(&self, name: &str, scope: &[Frame]) -> Option<Value> {
        scope
            .iter()
            .rev()
            .find_map(|frame| frame.get(name).cloned())
    }

    fn eval(&mut self, value: &Value, scope: &mut Vec<Frame>, depth: usize) -> Option<Value> {
        match value {
            Value::Bool { .. }
            | Value::Char { .. }
            | Value::Int { .. }
            | Value::Float { .. }
            | Value::Double { .. }
            | Value::Str { .. }
            | Value::Null { .. } => Some(value.clone()),
            Value::Identifier { name, linked, .. } => {
                if let Some(local) = self.lookup(name, scope) {
                    return Some(local);
                }
                // fall back to const declarations
                if let Some(Linked::Node(r)) = linked {
                    if let Node::VarInit(init) = self.module.node(*r) {
                        if let Some(init_value) = &init.value {
                            return self.eval(init_value, scope, depth);
                        }
                    }
                }
                None
            }
            Value::Expression { lhs, rhs, op, .. } => {
                let left = self.eval(lhs, scope, depth)?;
                let right = self.eval(rhs, scope, depth)?;
                apply_binary(&left, &right, *op)
            }
            Value::Negative { value, .. } => match self.eval(value, scope, depth)? {
                Value::Int {
                    value,
                    num_bits,
                    unsigned,
                    position,
                } => Some(Value::Int {
                    value: -value,
                    num_bits,
                    unsigned,
                    position,
                }),
                Value::Double { value, position } => Some(Value::Double {
                    value: -value,
                    position,
                }),
                Value::Float { value, position } => Some(Value::Float {
                    value: -value,
                    position,
                }),
                _ => None,
            },
            Value::Not { value, .. } => match self.eval(value, scope, depth)? {
                Value::Bool { value, position } => Some(Value::Bool {
                    value: !value,
                    position,
                }),
                _ => None,
            },
            Value::Ternary {
                condition,
                left,
                right,
                ..
            } => {
                if self.truthy(condition, scope, depth)? {
                    self.eval(left, scope, depth)
                } else {
                    self.eval(right, scope, depth)
                }
            }
            Value::Cast { value, target, .. } => {
                let inner = self.eval(value, scope, depth)?;
                Some(cast_residual(inner, target))
            }
            Value::SizeOf { target, position } => Some(Value::Int {
                value: target.byte_size(true, self.module) as i64,
                num_bits: 64,
                unsigned: true,
                position: *position,
            }),
            Value::StructValue(struct_value) => {
                let mut fields = vec![];
                for (name, field_value) in &struct_value.fields {
                    fields.push((name.clone(), self.eval(field_value, scope, depth)?));
                }
                Some(Value::StructValue(crate::ast::StructValue {
                    ref_type: struct_value.ref_type.clone(),
                    fields,
                    linked: struct_value.linked,
                    position: struct_value.position,
                }))
            }
            Value::Chain(chain) => self.eval_chain(chain, scope, depth),
            _ => None,
        }
    }

    /// Residuals may themselves be access chains: field access on struct
    /// residuals and nested comptime calls both fold here.
    fn eval_chain(
        &mut self,
        chain: &crate::ast::AccessChain,
        scope: &mut Vec<Frame>,
        depth: usize,
    ) -> Option<Value> {
        let mut current: Option<Value> = None;
        for element in &chain.elements {
            match element {
                ChainElement::Identifier { name, linked, .. } => match &current {
                    None => {
                        current = Some(Value::Identifier {
                            name: name.clone(),
                            linked: *linked,
                            position: element.position(),
                        });
                        if let Some(local) = self.lookup(name, scope) {
                            current = Some(local);
                        }
                    }
                    Some(Value::StructValue(sv)) => {
                        let field = sv
                            .fields
                            .iter()
                            .find(|(field_name, _)| field_name == name)?;
                        current = Some(field.1.clone());
                    }
                    _ => return None,
                },
                ChainElement::Index { index, .. } => {
                    let idx = match self.eval(index, scope, depth)? {
                        Value::Int { value, .. } => value as usize,
                        _ => return None,
                    };
                    match &current {
                        Some(Value::ArrayValue { values, .. }) => {
                            current = Some(values.get(idx)?.clone());
                        }
                        _ => return None,
                    }
                }
                ChainElement::Call { args, linked, .. } => {
                    let Some(Linked::Node(decl_ref)) = linked else {
                        return None;
                    };
                    let Node::Function(decl) = self.module.node(*decl_ref) else {
                        return None;
                    };
                    let mut evaluated = vec![];
                    for arg in args {
                        evaluated.push(self.eval(arg, scope, depth)?);
                    }
                    self.invocations += 1;
                    current =
                        self.interpret_function(decl, *decl_ref, &evaluated, depth + 1);
                    current.as_ref()?;
                }
            }
        }
        current
    }
}

fn cast_residual(value: Value, target: &Type) -> Value {
    match (&value, target.pure_type().as_ref()) {
        (
            Value::Int { value, position, .. },
            Type::IntN { num_bits, unsigned },
        ) => Value::Int {
            value: *value,
            num_bits: *num_bits,
            unsigned: *unsigned,
            position: *position,
        },
        (Value::Int { value, position, .. }, Type::Double) => Value::Double {
            value: *value as f64,
            position: *position,
        },
        (Value::Double { value, position }, Type::Float) => Value::Float {
            value: *value as f32,
            position: *position,
        },
        _ => value,
    }
}

fn apply_binary(left: &Value, right: &Value, op: BinaryOp) -> Option<Value> {
    let position = left.position();
    match (left, right) {
        (Value::Int { value: a, num_bits, unsigned, .. }, Value::Int { value: b, .. }) => {
            apply_int(*a, *b, op, *num_bits, *unsigned, position)
        }
        (Value::Double { value: a, .. }, Value::Double { value: b, .. }) => {
            apply_double(*a, *b, op, position)
        }
        (Value::Float { value: a, .. }, Value::Float { value: b, .. }) => {
            apply_double(f64::from(*a), f64::from(*b), op, position).map(|v| match v {
                Value::Double { value, position } => Value::Float {
                    value: value as f32,
                    position,
                },
                other => other,
            })
        }
        (Value::Bool { value: a, .. }, Value::Bool { value: b, .. }) => match op {
            BinaryOp::And => Some(bool_value(*a && *b, position)),
            BinaryOp::Or => Some(bool_value(*a || *b, position)),
            BinaryOp::Eq => Some(bool_value(a == b, position)),
            BinaryOp::Ne => Some(bool_value(a != b, position)),
            _ => None,
        },
        _ => None,
    }
}

fn bool_value(value: bool, position: Position) -> Value {
    Value::Bool { value, position }
}

fn apply_int(
    a: i64,
    b: i64,
    op: BinaryOp,
    num_bits: u8,
    unsigned: bool,
    position: Position,
) -> Option<Value> {
    let int = |value: i64| Value::Int {
        value,
        num_bits,
        unsigned,
        position,
    };
    Some(match op {
        BinaryOp::Add => int(a.wrapping_add(b)),
        BinaryOp::Sub => int(a.wrapping_sub(b)),
        BinaryOp::Mul => int(a.wrapping_mul(b)),
        BinaryOp::Div => {
            if b == 0 {
                return None;
            }
            int(a / b)
        }
        BinaryOp::Mod => {
            if b == 0 {
                return None;
            }
            int(a % b)
        }
        BinaryOp::Shl => int(a << (b & 63)),
        BinaryOp::Shr => int(a >> (b & 63)),
        BinaryOp::BitAnd => int(a & b),
        BinaryOp::BitOr => int(a | b),
        BinaryOp::BitXor => int(a ^ b),
        BinaryOp::Eq => bool_value(a == b, position),
        BinaryOp::Ne => bool_value(a != b, position),
        BinaryOp::Lt => bool_value(a < b, position),
        BinaryOp::Le => bool_value(a <= b, position),
        BinaryOp::Gt => bool_value(a > b, position),
        BinaryOp::Ge => bool_value(a >= b, position),
        BinaryOp::And | BinaryOp::Or => return None,
    })
}

fn apply_double(a: f64, b: f64, op: BinaryOp, position: Position) -> Option<Value> {
    let double = |value: f64| Value::Double { value, position };
    Some(match op {
        BinaryOp::Add => double(a + b),
        BinaryOp::Sub => double(a - b),
        BinaryOp::Mul => double(a * b),
        BinaryOp::Div => double(a / b),
        BinaryOp::Eq => bool_value(a == b, position),
        BinaryOp::Ne => bool_value(a != b, position),
        BinaryOp::Lt => bool_value(a < b, position),
        BinaryOp::Le => bool_value(a <= b, position),
        BinaryOp::Gt => bool_value(a > b, position),
        BinaryOp::Ge => bool_value(a >= b, position),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::FileId;
    use crate::converter::Converter;
    use crate::lexer::Lexer;
    use crate::resolver::Resolver;

    fn build_module(source: &str) -> Module {
        let lexed = Lexer::new(source, "test.ch").lex();
        assert!(!lexed.diagnostics.has_errors());
        let converted = Converter::new(FileId(0), "test.ch").convert(&lexed.unit);
        let mut module = Module::new();
        let file = module.add_file(converted.file);
        let mut resolver = Resolver::new(&mut module);
        resolver.resolve_file(file);
        assert!(!resolver.diagnostics.has_errors());
        module
    }

    fn find_function(module: &Module, name: &str) -> NodeRef {
        let file = module.file(FileId(0));
        file.node_ids()
            .find(|id| matches!(file.node(*id), Node::Function(f) if f.name == name))
            .map(|id| NodeRef::new(FileId(0), id))
            .unwrap()
    }

    fn int_arg(value: i64) -> Value {
        Value::Int {
            value,
            num_bits: 32,
            unsigned: false,
            position: Position::default(),
        }
    }

    #[test]
    fn test_evaluate_simple_function() {
        let module = build_module(
            "@comptime\nfunc square(x : int) : int { return x * x; }",
        );
        let decl = find_function(&module, "square");
        let mut ctx = ComptimeContext::new();
        let mut evaluator = ComptimeEvaluator::new(&module);
        let residual = evaluator.residual(&mut ctx, 0, decl, &[int_arg(5)]).unwrap();
        assert!(matches!(residual, Value::Int { value: 25, .. }));
    }

    #[test]
    fn test_memoised_per_call_site() {
        let module = build_module(
            "@comptime\nfunc square(x : int) : int { return x * x; }",
        );
        let decl = find_function(&module, "square");
        let mut ctx = ComptimeContext::new();
        let mut evaluator = ComptimeEvaluator::new(&module);

        let first = evaluator.residual(&mut ctx, 7, decl, &[int_arg(3)]).unwrap();
        let second = evaluator.residual(&mut ctx, 7, decl, &[int_arg(3)]).unwrap();
        assert_eq!(first, second);
        assert_eq!(evaluator.invocations, 1, "one evaluation per call site");

        // a different call site evaluates again
        evaluator.residual(&mut ctx, 8, decl, &[int_arg(4)]).unwrap();
        assert_eq!(evaluator.invocations, 2);
    }

    #[test]
    fn test_loop_and_branch() {
        let module = build_module(
            "@comptime\nfunc fact(n : int) : int { var acc = 1; while (n > 1) { acc = acc * n; n = n - 1; } return acc; }",
        );
        let decl = find_function(&module, "fact");
        let mut ctx = ComptimeContext::new();
        let mut evaluator = ComptimeEvaluator::new(&module);
        let residual = evaluator.residual(&mut ctx, 0, decl, &[int_arg(5)]).unwrap();
        assert!(matches!(residual, Value::Int { value: 120, .. }));
    }

    #[test]
    fn test_struct_residual_field_access() {
        let module = build_module(
            "struct P { x : int; y : int; }\n@comptime\nfunc mk() : P { return P { x : 3, y : 4 }; }",
        );
        let decl = find_function(&module, "mk");
        let mut ctx = ComptimeContext::new();
        let mut evaluator = ComptimeEvaluator::new(&module);
        let residual = evaluator.residual(&mut ctx, 0, decl, &[]).unwrap();
        let Value::StructValue(sv) = residual else { panic!() };
        assert_eq!(sv.fields.len(), 2);
        assert!(matches!(sv.fields[0].1, Value::Int { value: 3, .. }));
    }
}
