//! Expression values. Values are exclusively owned by the node (or parent
//! value) holding them; `linked` back-references are arena-relative and
//! filled by the resolver.

use serde::{Deserialize, Serialize};

use crate::diagnostics::Position;

use super::node::{FunctionParam, Node};
use super::types::{Type, TypeRef};
use super::{Linked, Module, NodeId, NodeRef};

/// Binary operators, loosest first in the precedence table below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    pub fn from_str(text: &str) -> Option<BinaryOp> {
        Some(match text {
            "||" => BinaryOp::Or,
            "&&" => BinaryOp::And,
            "|" => BinaryOp::BitOr,
            "^" => BinaryOp::BitXor,
            "&" => BinaryOp::BitAnd,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Ne,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Le,
            ">" => BinaryOp::Gt,
            ">=" => BinaryOp::Ge,
            "<<" => BinaryOp::Shl,
            ">>" => BinaryOp::Shr,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Mod,
            _ => return None,
        })
    }

    /// Binding power for precedence climbing; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::BitOr => 3,
            BinaryOp::BitXor => 4,
            BinaryOp::BitAnd => 5,
            BinaryOp::Eq | BinaryOp::Ne => 6,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 7,
            BinaryOp::Shl | BinaryOp::Shr => 8,
            BinaryOp::Add | BinaryOp::Sub => 9,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 10,
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::Or | BinaryOp::And)
    }

    pub fn c_str(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::BitAnd => "&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

/// One segment of an access chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChainElement {
    Identifier {
        name: String,
        linked: Option<Linked>,
        position: Position,
    },
    Index {
        index: Box<Value>,
        position: Position,
    },
    Call {
        args: Vec<Value>,
        generic_args: Vec<Type>,
        /// The function (or multi-function member) this call resolved to.
        linked: Option<Linked>,
        /// Overload member index inside a multi-function, set on
        /// resolution.
        overload_index: Option<usize>,
        /// Registered generic iteration for this call site.
        iteration: usize,
        /// Converter-assigned identity; keys compile-time memoisation.
        call_id: u32,
        position: Position,
    },
}

impl ChainElement {
    pub fn position(&self) -> Position {
        match self {
            ChainElement::Identifier { position, .. }
            | ChainElement::Index { position, .. }
            | ChainElement::Call { position, .. } => *position,
        }
    }

    pub fn linked(&self) -> Option<Linked> {
        match self {
            ChainElement::Identifier { linked, .. } => *linked,
            ChainElement::Call { linked, .. } => *linked,
            ChainElement::Index { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessChain {
    pub elements: Vec<ChainElement>,
    pub position: Position,
}

impl AccessChain {
    /// The declaration the final element resolves to.
    pub fn linked(&self) -> Option<Linked> {
        for element in self.elements.iter().rev() {
            if let Some(linked) = element.linked() {
                return Some(linked);
            }
        }
        None
    }

    pub fn is_call(&self) -> bool {
        matches!(self.elements.last(), Some(ChainElement::Call { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedVariable {
    pub name: String,
    /// Captured by pointer when written `[&x]`, by value otherwise.
    pub by_pointer: bool,
    pub linked: Option<Linked>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LambdaValue {
    pub params: Vec<FunctionParam>,
    pub captures: Vec<CapturedVariable>,
    pub return_type: Option<Type>,
    /// Body scope, allocated into the file arena.
    pub body: NodeId,
    /// Unit-unique index used for emitted symbol names.
    pub lambda_id: u32,
    pub position: Position,
}

impl LambdaValue {
    pub fn is_capturing(&self) -> bool {
        !self.captures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructValue {
    /// Referenced or generic type naming the struct.
    pub ref_type: Type,
    pub fields: Vec<(String, Value)>,
    pub linked: Option<NodeRef>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool {
        value: bool,
        position: Position,
    },
    Char {
        value: char,
        position: Position,
    },
    Int {
        value: i64,
        num_bits: u8,
        unsigned: bool,
        position: Position,
    },
    Float {
        value: f32,
        position: Position,
    },
    Double {
        value: f64,
        position: Position,
    },
    Str {
        value: String,
        position: Position,
    },
    Null {
        position: Position,
    },
    Identifier {
        name: String,
        linked: Option<Linked>,
        position: Position,
    },
    Chain(AccessChain),
    Expression {
        lhs: Box<Value>,
        rhs: Box<Value>,
        op: BinaryOp,
        position: Position,
    },
    Negative {
        value: Box<Value>,
        position: Position,
    },
    Not {
        value: Box<Value>,
        position: Position,
    },
    AddrOf {
        value: Box<Value>,
        position: Position,
    },
    Dereference {
        value: Box<Value>,
        position: Position,
    },
    Cast {
        value: Box<Value>,
        target: Type,
        position: Position,
    },
    SizeOf {
        target: Type,
        position: Position,
    },
    Lambda(LambdaValue),
    StructValue(StructValue),
    ArrayValue {
        values: Vec<Value>,
        elem_type: Option<Type>,
        size: Option<u64>,
        position: Position,
    },
    Ternary {
        condition: Box<Value>,
        left: Box<Value>,
        right: Box<Value>,
        position: Position,
    },
    /// Stands for the hidden aggregate-return destination parameter.
    RetStructParam {
        position: Position,
    },
    /// Converter error placeholder; later phases skip it.
    Error {
        position: Position,
    },
}

impl Value {
    pub fn position(&self) -> Position {
        match self {
            Value::Bool { position, .. }
            | Value::Char { position, .. }
            | Value::Int { position, .. }
            | Value::Float { position, .. }
            | Value::Double { position, .. }
            | Value::Str { position, .. }
            | Value::Null { position }
            | Value::Identifier { position, .. }
            | Value::Expression { position, .. }
            | Value::Negative { position, .. }
            | Value::Not { position, .. }
            | Value::AddrOf { position, .. }
            | Value::Dereference { position, .. }
            | Value::Cast { position, .. }
            | Value::SizeOf { position, .. }
            | Value::ArrayValue { position, .. }
            | Value::Ternary { position, .. }
            | Value::RetStructParam { position }
            | Value::Error { position } => *position,
            Value::Chain(chain) => chain.position,
            Value::Lambda(lambda) => lambda.position,
            Value::StructValue(value) => value.position,
        }
    }

    /// Whether this value is of primitive (register-passable) shape.
    pub fn primitive(&self) -> bool {
        matches!(
            self,
            Value::Bool { .. }
                | Value::Char { .. }
                | Value::Int { .. }
                | Value::Float { .. }
                | Value::Double { .. }
                | Value::Str { .. }
                | Value::Null { .. }
                | Value::Negative { .. }
                | Value::Not { .. }
                | Value::AddrOf { .. }
                | Value::SizeOf { .. }
                | Value::Expression { .. }
        )
    }

    /// The declaration this value resolves to, if any.
    pub fn linked_node(&self) -> Option<Linked> {
        match self {
            Value::Identifier { linked, .. } => *linked,
            Value::Chain(chain) => chain.linked(),
            Value::StructValue(value) => value.linked.map(Linked::Node),
            Value::Cast { value, .. } | Value::Dereference { value, .. } => value.linked_node(),
            _ => None,
        }
    }

    /// Construct the value's type. Identifiers and chains consult their
    /// links; unresolved values yield `None`.
    pub fn create_type(&self, module: &Module) -> Option<Type> {
        match self {
            Value::Bool { .. } => Some(Type::Bool),
            Value::Char { .. } => Some(Type::Char),
            Value::Int {
                num_bits, unsigned, ..
            } => Some(Type::Literal(Box::new(Type::IntN {
                num_bits: *num_bits,
                unsigned: *unsigned,
            }))),
            Value::Float { .. } => Some(Type::Literal(Box::new(Type::Float))),
            Value::Double { .. } => Some(Type::Literal(Box::new(Type::Double))),
            Value::Str { .. } => Some(Type::String),
            Value::Null { .. } => Some(Type::Pointer(Box::new(Type::Void))),
            Value::Identifier { linked, .. } => linked.as_ref()?.value_type(module),
            Value::Chain(chain) => chain_type(chain, module),
            Value::Expression { lhs, rhs, op, .. } => {
                if op.is_comparison() || op.is_logical() {
                    return Some(Type::Bool);
                }
                let left = lhs.create_type(module)?;
                if matches!(left, Type::Literal(_)) {
                    rhs.create_type(module)
                } else {
                    Some(left)
                }
            }
            Value::Negative { value, .. } => value.create_type(module),
            Value::Not { .. } => Some(Type::Bool),
            Value::AddrOf { value, .. } => {
                Some(Type::Pointer(Box::new(value.create_type(module)?)))
            }
            Value::Dereference { value, .. } => match value.create_type(module)? {
                Type::Pointer(inner) => Some(*inner),
                _ => None,
            },
            Value::Cast { target, .. } => Some(target.clone()),
            Value::SizeOf { .. } => Some(Type::ulong()),
            Value::Lambda(lambda) => {
                let params = lambda
                    .params
                    .iter()
                    .map(|p| p.param_type.clone())
                    .collect();
                Some(Type::Function {
                    params,
                    return_type: Box::new(lambda.return_type.clone().unwrap_or(Type::Void)),
                    is_variadic: false,
                    is_capturing: lambda.is_capturing(),
                })
            }
            Value::StructValue(value) => Some(value.ref_type.clone()),
            Value::ArrayValue {
                values,
                elem_type,
                size,
                ..
            } => {
                let elem = match elem_type {
                    Some(t) => t.clone(),
                    None => values.first()?.create_type(module)?,
                };
                Some(Type::Array {
                    elem_type: Box::new(elem),
                    size: size.or(Some(values.len() as u64)),
                })
            }
            Value::Ternary { left, .. } => left.create_type(module),
            Value::RetStructParam { .. } => None,
            Value::Error { .. } => None,
        }
    }

    /// Borrow the base type where the value owns one, build it otherwise.
    pub fn get_base_type<'a>(&'a self, module: &Module) -> Option<TypeRef<'a>> {
        match self {
            Value::Cast { target, .. } => Some(TypeRef::Borrowed(target)),
            Value::SizeOf { .. } => Some(TypeRef::Owned(Type::ulong())),
            Value::StructValue(value) => Some(TypeRef::Borrowed(&value.ref_type)),
            other => other.create_type(module).map(TypeRef::Owned),
        }
    }
}

/// Type of the chain as a whole: the type of its last element.
fn chain_type(chain: &AccessChain, module: &Module) -> Option<Type> {
    let mut current: Option<Type> = None;
    for element in &chain.elements {
        current = match element {
            ChainElement::Identifier { linked, .. } => linked.as_ref()?.value_type(module),
            ChainElement::Index { .. } => match current?.pure_type().into_owned() {
                Type::Array { elem_type, .. } => Some(*elem_type),
                Type::Pointer(inner) => Some(*inner),
                _ => None,
            },
            ChainElement::Call {
                linked, iteration, ..
            } => {
                let linked = linked.as_ref()?;
                match linked.value_type(module)? {
                    Type::Function { return_type, .. } => {
                        Some(resolve_call_return(*return_type, *linked, *iteration, module))
                    }
                    // constructor invocation: the value type is the struct
                    other => Some(other),
                }
            }
        };
    }
    current
}

fn resolve_call_return(
    return_type: Type,
    linked: Linked,
    iteration: usize,
    module: &Module,
) -> Type {
    let Linked::Node(node_ref) = linked else {
        return return_type;
    };
    if let Node::Function(decl) = module.node(node_ref) {
        if !decl.generic_params.is_empty() {
            if let Some(args) = decl.iterations.get(iteration) {
                return super::generics::substitute(&return_type, &decl.generic_params, args);
            }
        }
    }
    return_type
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_ordering() {
        assert!(BinaryOp::Mul.precedence() > BinaryOp::Add.precedence());
        assert!(BinaryOp::Add.precedence() > BinaryOp::Lt.precedence());
        assert!(BinaryOp::Lt.precedence() > BinaryOp::And.precedence());
        assert!(BinaryOp::And.precedence() > BinaryOp::Or.precedence());
    }

    #[test]
    fn test_literal_int_type() {
        let value = Value::Int {
            value: 3,
            num_bits: 32,
            unsigned: false,
            position: Position::default(),
        };
        let module = Module::default();
        let t = value.create_type(&module).unwrap();
        assert!(matches!(t, Type::Literal(_)));
        assert!(t.is_same(&Type::int()));
    }

    #[test]
    fn test_comparison_yields_bool() {
        let module = Module::default();
        let value = Value::Expression {
            lhs: Box::new(Value::Int {
                value: 1,
                num_bits: 32,
                unsigned: false,
                position: Position::default(),
            }),
            rhs: Box::new(Value::Int {
                value: 2,
                num_bits: 32,
                unsigned: false,
                position: Position::default(),
            }),
            op: BinaryOp::Lt,
            position: Position::default(),
        };
        assert_eq!(value.create_type(&module), Some(Type::Bool));
    }
}
