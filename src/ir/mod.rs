//! SSA-style IR. Instructions, basic blocks and functions render to a
//! textual form through `Display`, the same way the assembly back-end of
//! old renders its instruction stream. Semantics follow the LLVM shape:
//! explicit allocation, GEP-based addressing, typed calls, one terminator
//! per block.

mod builder;
mod lower;

pub use builder::{BlockId, FunctionBuilder};
pub use lower::{lower_module, IrLowering};

use std::fmt::Display;

#[derive(Debug, Clone, PartialEq)]
pub enum IrType {
    Void,
    I1,
    I8,
    I16,
    I32,
    I64,
    I128,
    F32,
    F64,
    /// Opaque pointer.
    Ptr,
    /// Named aggregate, `%struct.Name`.
    Struct(String),
    Array(Box<IrType>, u64),
    /// Two-field `{ ptr, ptr }` used for capturing lambdas.
    FatPointer,
}

impl IrType {
    pub fn is_void(&self) -> bool {
        matches!(self, IrType::Void)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, IrType::F32 | IrType::F64)
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            IrType::Struct(_) | IrType::Array(_, _) | IrType::FatPointer
        )
    }
}

impl Display for IrType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrType::Void => f.write_str("void"),
            IrType::I1 => f.write_str("i1"),
            IrType::I8 => f.write_str("i8"),
            IrType::I16 => f.write_str("i16"),
            IrType::I32 => f.write_str("i32"),
            IrType::I64 => f.write_str("i64"),
            IrType::I128 => f.write_str("i128"),
            IrType::F32 => f.write_str("float"),
            IrType::F64 => f.write_str("double"),
            IrType::Ptr => f.write_str("ptr"),
            IrType::Struct(name) => write!(f, "%struct.{name}"),
            IrType::Array(elem, size) => write!(f, "[{size} x {elem}]"),
            IrType::FatPointer => f.write_str("%__chemical_fat_pointer__"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IrValue {
    Temp(u32, IrType),
    /// Named function parameter, rendered `%name`.
    Param(String, IrType),
    Global(String, IrType),
    ConstInt(i64, IrType),
    ConstFloat(f64, IrType),
    ConstStr(String),
    Null,
    Undef(IrType),
}

impl IrValue {
    pub fn ty(&self) -> IrType {
        match self {
            IrValue::Temp(_, ty)
            | IrValue::Param(_, ty)
            | IrValue::Global(_, ty) => ty.clone(),
            IrValue::ConstInt(_, ty) | IrValue::ConstFloat(_, ty) => ty.clone(),
            IrValue::ConstStr(_) => IrType::Ptr,
            IrValue::Null => IrType::Ptr,
            IrValue::Undef(ty) => ty.clone(),
        }
    }
}

impl Display for IrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IrValue::Temp(index, _) => write!(f, "%t{index}"),
            IrValue::Param(name, _) => write!(f, "%{name}"),
            IrValue::Global(name, _) => write!(f, "@{name}"),
            IrValue::ConstInt(value, _) => write!(f, "{value}"),
            IrValue::ConstFloat(value, _) => write!(f, "{value:e}"),
            IrValue::ConstStr(text) => write!(f, "c\"{}\"", text.escape_default()),
            IrValue::Null => f.write_str("null"),
            IrValue::Undef(_) => f.write_str("undef"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Instruction {
    Alloca {
        dest: IrValue,
        ty: IrType,
    },
    Load {
        dest: IrValue,
        ty: IrType,
        addr: IrValue,
    },
    Store {
        value: IrValue,
        addr: IrValue,
    },
    /// `getelementptr` over an aggregate base.
    Gep {
        dest: IrValue,
        base_ty: IrType,
        addr: IrValue,
        indices: Vec<IrValue>,
    },
    BinOp {
        dest: IrValue,
        op: &'static str,
        lhs: IrValue,
        rhs: IrValue,
    },
    Cmp {
        dest: IrValue,
        op: &'static str,
        lhs: IrValue,
        rhs: IrValue,
    },
    Call {
        dest: Option<IrValue>,
        ret: IrType,
        callee: IrValue,
        args: Vec<IrValue>,
    },
    Cast {
        dest: IrValue,
        op: &'static str,
        value: IrValue,
        to: IrType,
    },
    Phi {
        dest: IrValue,
        ty: IrType,
        incoming: Vec<(IrValue, String)>,
    },
    Comment(String),
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Alloca { dest, ty } => write!(f, "  {dest} = alloca {ty}"),
            Instruction::Load { dest, ty, addr } => {
                write!(f, "  {dest} = load {ty}, ptr {addr}")
            }
            Instruction::Store { value, addr } => {
                write!(f, "  store {} {value}, ptr {addr}", value.ty())
            }
            Instruction::Gep {
                dest,
                base_ty,
                addr,
                indices,
            } => {
                write!(f, "  {dest} = getelementptr {base_ty}, ptr {addr}")?;
                for index in indices {
                    write!(f, ", {} {index}", index.ty())?;
                }
                Ok(())
            }
            Instruction::BinOp { dest, op, lhs, rhs } => {
                write!(f, "  {dest} = {op} {} {lhs}, {rhs}", lhs.ty())
            }
            Instruction::Cmp { dest, op, lhs, rhs } => {
                write!(f, "  {dest} = {op} {} {lhs}, {rhs}", lhs.ty())
            }
            Instruction::Call {
                dest,
                ret,
                callee,
                args,
            } => {
                f.write_str("  ")?;
                if let Some(dest) = dest {
                    write!(f, "{dest} = ")?;
                }
                write!(f, "call {ret} {callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} {arg}", arg.ty())?;
                }
                f.write_str(")")
            }
            Instruction::Cast {
                dest,
                op,
                value,
                to,
            } => write!(f, "  {dest} = {op} {} {value} to {to}", value.ty()),
            Instruction::Phi { dest, ty, incoming } => {
                write!(f, "  {dest} = phi {ty} ")?;
                for (i, (value, label)) in incoming.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "[ {value}, %{label} ]")?;
                }
                Ok(())
            }
            Instruction::Comment(text) => write!(f, "  ; {text}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Terminator {
    Ret(Option<IrValue>),
    Br(String),
    CondBr {
        cond: IrValue,
        then_label: String,
        else_label: String,
    },
    Unreachable,
}

impl Display for Terminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Terminator::Ret(None) => f.write_str("  ret void"),
            Terminator::Ret(Some(value)) => write!(f, "  ret {} {value}", value.ty()),
            Terminator::Br(label) => write!(f, "  br label %{label}"),
            Terminator::CondBr {
                cond,
                then_label,
                else_label,
            } => write!(
                f,
                "  br i1 {cond}, label %{then_label}, label %{else_label}"
            ),
            Terminator::Unreachable => f.write_str("  unreachable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub label: String,
    pub instructions: Vec<Instruction>,
    pub terminator: Option<Terminator>,
}

impl BasicBlock {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            instructions: vec![],
            terminator: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminator.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<(String, IrType)>,
    pub ret: IrType,
    pub blocks: Vec<BasicBlock>,
    pub is_declaration: bool,
}

impl Display for IrFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keyword = if self.is_declaration {
            "declare"
        } else {
            "define"
        };
        write!(f, "{keyword} {} @{}(", self.ret, self.name)?;
        for (i, (name, ty)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{ty} %{name}")?;
        }
        f.write_str(")")?;
        if self.is_declaration {
            return f.write_str("\n");
        }
        f.write_str(" {\n")?;
        for block in &self.blocks {
            writeln!(f, "{}:", block.label)?;
            for instruction in &block.instructions {
                writeln!(f, "{instruction}")?;
            }
            match &block.terminator {
                Some(terminator) => writeln!(f, "{terminator}")?,
                None => writeln!(f, "  unreachable")?,
            }
        }
        f.write_str("}\n")
    }
}

#[derive(Debug, Clone)]
pub struct IrStructDef {
    pub name: String,
    pub fields: Vec<IrType>,
}

impl Display for IrStructDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%struct.{} = type {{ ", self.name)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{field}")?;
        }
        f.write_str(" }")
    }
}

#[derive(Debug, Clone, Default)]
pub struct IrModule {
    pub structs: Vec<IrStructDef>,
    pub functions: Vec<IrFunction>,
}

impl IrModule {
    pub fn has_fat_pointer_use(&self) -> bool {
        self.functions.iter().any(|function| {
            function.params.iter().any(|(_, t)| *t == IrType::FatPointer)
                || function.blocks.iter().any(|b| {
                    b.instructions.iter().any(|i| match i {
                        Instruction::Alloca { ty, .. } => *ty == IrType::FatPointer,
                        Instruction::Gep { base_ty, .. } => *base_ty == IrType::FatPointer,
                        _ => false,
                    })
                })
        })
    }
}

impl Display for IrModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_fat_pointer_use() {
            writeln!(f, "%__chemical_fat_pointer__ = type {{ ptr, ptr }}")?;
        }
        for def in &self.structs {
            writeln!(f, "{def}")?;
        }
        if !self.structs.is_empty() {
            writeln!(f)?;
        }
        for function in &self.functions {
            writeln!(f, "{function}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_rendering() {
        assert_eq!(IrType::I32.to_string(), "i32");
        assert_eq!(IrType::Struct("P".into()).to_string(), "%struct.P");
        assert_eq!(
            IrType::Array(Box::new(IrType::I8), 16).to_string(),
            "[16 x i8]"
        );
    }

    #[test]
    fn test_instruction_rendering() {
        let inst = Instruction::Gep {
            dest: IrValue::Temp(3, IrType::Ptr),
            base_ty: IrType::Struct("P".into()),
            addr: IrValue::Temp(1, IrType::Ptr),
            indices: vec![
                IrValue::ConstInt(0, IrType::I32),
                IrValue::ConstInt(1, IrType::I32),
            ],
        };
        assert_eq!(
            inst.to_string(),
            "  %t3 = getelementptr %struct.P, ptr %t1, i32 0, i32 1"
        );
    }

    #[test]
    fn test_function_rendering() {
        let mut block = BasicBlock::new("entry");
        block.terminator = Some(Terminator::Ret(Some(IrValue::ConstInt(0, IrType::I32))));
        let function = IrFunction {
            name: "main".into(),
            params: vec![],
            ret: IrType::I32,
            blocks: vec![block],
            is_declaration: false,
        };
        let text = function.to_string();
        assert!(text.contains("define i32 @main()"));
        assert!(text.contains("ret i32 0"));
    }
}
