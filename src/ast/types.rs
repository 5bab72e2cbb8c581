//! Semantic type representation. Types embedded in values and nodes are
//! exclusively owned; queries that may yield either a borrowed view or a
//! freshly built type return [`TypeRef`].

use std::fmt::Display;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use super::{Module, NodeRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    Any,
    Void,
    Bool,
    Char,
    IntN,
    Float,
    Double,
    String,
    Pointer,
    Array,
    Function,
    Referenced,
    Generic,
    Struct,
    Union,
    Literal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Any,
    Void,
    Bool,
    Char,
    /// Sized integer; `num_bits` is one of 8, 16, 32, 64, 128.
    IntN { num_bits: u8, unsigned: bool },
    Float,
    Double,
    String,
    Pointer(Box<Type>),
    Array {
        elem_type: Box<Type>,
        /// `None` when the size is unknown at the declaration site.
        size: Option<u64>,
    },
    Function {
        params: Vec<Type>,
        return_type: Box<Type>,
        is_variadic: bool,
        /// Capturing function types lower to fat pointers.
        is_capturing: bool,
    },
    /// A name written in source, linked to its declaring node after
    /// resolution.
    Referenced {
        name: String,
        linked: Option<NodeRef>,
    },
    /// A generic use-site: `base` is always a referenced type; `iteration`
    /// is the registered monomorphic specialisation index.
    Generic {
        base: Box<Type>,
        args: Vec<Type>,
        iteration: usize,
    },
    /// Anonymous struct type (unnamed members).
    Struct(Vec<(String, Type)>),
    /// Anonymous union type.
    Union(Vec<(String, Type)>),
    /// The type of an untyped literal, convertible to compatible siblings.
    Literal(Box<Type>),
}

impl Type {
    pub fn int() -> Type {
        Type::IntN {
            num_bits: 32,
            unsigned: false,
        }
    }

    pub fn uint() -> Type {
        Type::IntN {
            num_bits: 32,
            unsigned: true,
        }
    }

    pub fn long() -> Type {
        Type::IntN {
            num_bits: 64,
            unsigned: false,
        }
    }

    pub fn ulong() -> Type {
        Type::IntN {
            num_bits: 64,
            unsigned: true,
        }
    }

    pub fn kind(&self) -> TypeKind {
        match self {
            Type::Any => TypeKind::Any,
            Type::Void => TypeKind::Void,
            Type::Bool => TypeKind::Bool,
            Type::Char => TypeKind::Char,
            Type::IntN { .. } => TypeKind::IntN,
            Type::Float => TypeKind::Float,
            Type::Double => TypeKind::Double,
            Type::String => TypeKind::String,
            Type::Pointer(_) => TypeKind::Pointer,
            Type::Array { .. } => TypeKind::Array,
            Type::Function { .. } => TypeKind::Function,
            Type::Referenced { .. } => TypeKind::Referenced,
            Type::Generic { .. } => TypeKind::Generic,
            Type::Struct(_) => TypeKind::Struct,
            Type::Union(_) => TypeKind::Union,
            Type::Literal(_) => TypeKind::Literal,
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Type::Bool
                | Type::Char
                | Type::IntN { .. }
                | Type::Float
                | Type::Double
                | Type::Pointer(_)
                | Type::String
                | Type::Void
        ) || matches!(self, Type::Literal(inner) if inner.is_primitive())
    }

    /// Strip literal wrappers, yielding a borrowed view where possible.
    pub fn pure_type(&self) -> TypeRef<'_> {
        match self {
            Type::Literal(inner) => inner.pure_type(),
            other => TypeRef::Borrowed(other),
        }
    }

    /// The declaration this type resolves to, if any.
    pub fn linked_node(&self) -> Option<NodeRef> {
        match self {
            Type::Referenced { linked, .. } => *linked,
            Type::Generic { base, .. } => base.linked_node(),
            Type::Literal(inner) => inner.linked_node(),
            _ => None,
        }
    }

    /// Structural equality; literal wrappers and linked-ness are
    /// transparent, names of referenced types are not.
    pub fn is_same(&self, other: &Type) -> bool {
        match (self.pure_type().deref(), other.pure_type().deref()) {
            (Type::IntN { num_bits: a, unsigned: ua }, Type::IntN { num_bits: b, unsigned: ub }) => {
                a == b && ua == ub
            }
            (Type::Pointer(a), Type::Pointer(b)) => a.is_same(b),
            (
                Type::Array {
                    elem_type: a,
                    size: sa,
                },
                Type::Array {
                    elem_type: b,
                    size: sb,
                },
            ) => a.is_same(b) && (sa == sb || sa.is_none() || sb.is_none()),
            (
                Type::Function {
                    params: pa,
                    return_type: ra,
                    is_variadic: va,
                    is_capturing: ca,
                },
                Type::Function {
                    params: pb,
                    return_type: rb,
                    is_variadic: vb,
                    is_capturing: cb,
                },
            ) => {
                va == vb
                    && ca == cb
                    && ra.is_same(rb)
                    && pa.len() == pb.len()
                    && pa.iter().zip(pb).all(|(x, y)| x.is_same(y))
            }
            (Type::Referenced { name: a, linked: la }, Type::Referenced { name: b, linked: lb }) => {
                match (la, lb) {
                    (Some(la), Some(lb)) => la == lb,
                    _ => a == b,
                }
            }
            (
                Type::Generic {
                    base: ba, args: aa, ..
                },
                Type::Generic {
                    base: bb, args: ab, ..
                },
            ) => {
                ba.is_same(bb)
                    && aa.len() == ab.len()
                    && aa.iter().zip(ab).all(|(x, y)| x.is_same(y))
            }
            (Type::Struct(a), Type::Struct(b)) | (Type::Union(a), Type::Union(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((na, ta), (nb, tb))| na == nb && ta.is_same(tb))
            }
            (a, b) => a.kind() == b.kind(),
        }
    }

    /// Whether a parameter of this type accepts an argument of type
    /// `value_type`. Looser than [`Type::is_same`]: numeric literals flow
    /// into any numeric parameter, `any` accepts everything, pointers
    /// accept matching arrays. Overload selection ranks the candidates
    /// this lets through.
    pub fn satisfies(&self, value_type: &Type) -> bool {
        let this = self.pure_type();
        let value = value_type.pure_type();
        let value_is_literal = matches!(value_type, Type::Literal(_));
        match (this.deref(), value.deref()) {
            (Type::Any, _) => true,
            (p, a) if value_is_literal && is_numeric(p) && is_numeric(a) => true,
            (Type::IntN { .. }, Type::IntN { .. }) => this.is_same(&value),
            (Type::Double, Type::Float) | (Type::Double, Type::Double) => true,
            (Type::Float, Type::Float) => true,
            (Type::Pointer(elem), Type::Array { elem_type, .. }) => elem.is_same(elem_type),
            (Type::Pointer(a), Type::Pointer(b)) => {
                matches!(a.as_ref(), Type::Void) || a.is_same(b)
            }
            _ => this.is_same(&value),
        }
    }

    /// Size in bytes on the requested target width. Aggregates sum their
    /// member sizes without padding; both back-ends share the same answer,
    /// which is all the ABI requires of them.
    pub fn byte_size(&self, is_64bit: bool, module: &Module) -> u64 {
        let ptr = if is_64bit { 8 } else { 4 };
        match self {
            Type::Any | Type::Void => 0,
            Type::Bool | Type::Char => 1,
            Type::IntN { num_bits, .. } => u64::from(*num_bits) / 8,
            Type::Float => 4,
            Type::Double => 8,
            Type::String | Type::Pointer(_) => ptr,
            Type::Array { elem_type, size } => {
                elem_type.byte_size(is_64bit, module) * size.unwrap_or(0)
            }
            Type::Function { is_capturing, .. } => {
                if *is_capturing {
                    ptr * 2
                } else {
                    ptr
                }
            }
            Type::Referenced { linked, .. } => linked
                .map(|n| module.node(n).byte_size(is_64bit, module))
                .unwrap_or(0),
            Type::Generic { base, args, .. } => {
                // sized like the base with arguments substituted; generic
                // fields are pointer-sized only when they are pointers, so
                // delegate through the linked declaration
                let _ = args;
                base.byte_size(is_64bit, module)
            }
            Type::Struct(fields) => fields
                .iter()
                .map(|(_, t)| t.byte_size(is_64bit, module))
                .sum(),
            Type::Union(fields) => fields
                .iter()
                .map(|(_, t)| t.byte_size(is_64bit, module))
                .max()
                .unwrap_or(0),
            Type::Literal(inner) => inner.byte_size(is_64bit, module),
        }
    }

    /// Whether values of this type need destructor calls when they leave
    /// scope.
    pub fn requires_destruction(&self, module: &Module) -> bool {
        match self {
            Type::Referenced { linked: Some(n), .. } => {
                module.node(*n).requires_destruction(n.file, module)
            }
            Type::Generic { base, .. } => base.requires_destruction(module),
            Type::Array { elem_type, .. } => elem_type.requires_destruction(module),
            Type::Literal(inner) => inner.requires_destruction(module),
            Type::Struct(fields) | Type::Union(fields) => fields
                .iter()
                .any(|(_, t)| t.requires_destruction(module)),
            _ => false,
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Any => f.write_str("any"),
            Type::Void => f.write_str("void"),
            Type::Bool => f.write_str("bool"),
            Type::Char => f.write_str("char"),
            Type::IntN { num_bits, unsigned } => match (num_bits, unsigned) {
                (16, false) => f.write_str("short"),
                (16, true) => f.write_str("ushort"),
                (32, false) => f.write_str("int"),
                (32, true) => f.write_str("uint"),
                (64, false) => f.write_str("long"),
                (64, true) => f.write_str("ulong"),
                (128, false) => f.write_str("bigint"),
                (128, true) => f.write_str("ubigint"),
                (bits, false) => write!(f, "i{bits}"),
                (bits, true) => write!(f, "u{bits}"),
            },
            Type::Float => f.write_str("float"),
            Type::Double => f.write_str("double"),
            Type::String => f.write_str("string"),
            Type::Pointer(inner) => write!(f, "*{inner}"),
            Type::Array { elem_type, size } => match size {
                Some(size) => write!(f, "{elem_type}[{size}]"),
                None => write!(f, "{elem_type}[]"),
            },
            Type::Function {
                params,
                return_type,
                is_variadic,
                is_capturing,
            } => {
                if *is_capturing {
                    f.write_str("[]")?;
                }
                f.write_str("(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{p}")?;
                }
                if *is_variadic {
                    if !params.is_empty() {
                        f.write_str(", ")?;
                    }
                    f.write_str("...")?;
                }
                write!(f, ") => {return_type}")
            }
            Type::Referenced { name, .. } => f.write_str(name),
            Type::Generic { base, args, .. } => {
                write!(f, "{base}<")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(">")
            }
            Type::Struct(_) => f.write_str("struct"),
            Type::Union(_) => f.write_str("union"),
            Type::Literal(inner) => write!(f, "{inner}"),
        }
    }
}

fn is_numeric(ty: &Type) -> bool {
    matches!(ty, Type::IntN { .. } | Type::Float | Type::Double)
}

/// Either a borrowed view into an existing type or a freshly built one.
/// Freeing never depends on a runtime flag: dropping a `Borrowed` drops
/// nothing.
#[derive(Debug)]
pub enum TypeRef<'a> {
    Borrowed(&'a Type),
    Owned(Type),
}

impl TypeRef<'_> {
    pub fn into_owned(self) -> Type {
        match self {
            TypeRef::Borrowed(t) => t.clone(),
            TypeRef::Owned(t) => t,
        }
    }
}

impl Deref for TypeRef<'_> {
    type Target = Type;

    fn deref(&self) -> &Type {
        match self {
            TypeRef::Borrowed(t) => t,
            TypeRef::Owned(t) => t,
        }
    }
}

impl AsRef<Type> for TypeRef<'_> {
    fn as_ref(&self) -> &Type {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_same_collapses_literals() {
        let literal = Type::Literal(Box::new(Type::int()));
        assert!(literal.is_same(&Type::int()));
        assert!(!literal.is_same(&Type::long()));
    }

    #[test]
    fn test_satisfies_literal_int_widths() {
        let literal = Type::Literal(Box::new(Type::int()));
        assert!(Type::long().satisfies(&literal));
        assert!(!Type::long().satisfies(&Type::int()));
    }

    #[test]
    fn test_satisfies_pointer_from_array() {
        let array = Type::Array {
            elem_type: Box::new(Type::int()),
            size: Some(4),
        };
        let pointer = Type::Pointer(Box::new(Type::int()));
        assert!(pointer.satisfies(&array));
    }

    #[test]
    fn test_display() {
        let t = Type::Pointer(Box::new(Type::Generic {
            base: Box::new(Type::Referenced {
                name: "Vec".into(),
                linked: None,
            }),
            args: vec![Type::int()],
            iteration: 0,
        }));
        assert_eq!(t.to_string(), "*Vec<int>");
    }

    #[test]
    fn test_type_ref_borrow_and_own() {
        let t = Type::Bool;
        let borrowed = TypeRef::Borrowed(&t);
        assert_eq!(borrowed.kind(), TypeKind::Bool);
        let owned = TypeRef::Owned(Type::Double);
        assert_eq!(owned.into_owned(), Type::Double);
    }
}
