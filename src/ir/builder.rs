//! Function builder with the block state machine: *Open* → instructions →
//! *Terminated*. Emitting past a terminator is a no-op; `set_insert_point`
//! on a new block transitions back to *Open*.

use super::{BasicBlock, Instruction, IrFunction, IrType, IrValue, Terminator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId(pub usize);

#[derive(Debug)]
pub struct FunctionBuilder {
    function: IrFunction,
    current: usize,
    next_temp: u32,
    next_label: u32,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, params: Vec<(String, IrType)>, ret: IrType) -> Self {
        let function = IrFunction {
            name: name.into(),
            params,
            ret,
            blocks: vec![BasicBlock::new("entry")],
            is_declaration: false,
        };
        Self {
            function,
            current: 0,
            next_temp: 0,
            next_label: 0,
        }
    }

    pub fn finish(self) -> IrFunction {
        self.function
    }

    pub fn temp(&mut self, ty: IrType) -> IrValue {
        let value = IrValue::Temp(self.next_temp, ty);
        self.next_temp += 1;
        value
    }

    pub fn param(&self, index: usize) -> IrValue {
        let (name, ty) = &self.function.params[index];
        IrValue::Param(name.clone(), ty.clone())
    }

    pub fn create_block(&mut self, hint: &str) -> BlockId {
        let label = format!("{hint}{}", self.next_label);
        self.next_label += 1;
        self.function.blocks.push(BasicBlock::new(label));
        BlockId(self.function.blocks.len() - 1)
    }

    pub fn block_label(&self, block: BlockId) -> String {
        self.function.blocks[block.0].label.clone()
    }

    pub fn current_block(&self) -> BlockId {
        BlockId(self.current)
    }

    /// From *Terminated*, switching the insert point transitions the
    /// builder to *Open* on the new block.
    pub fn set_insert_point(&mut self, block: BlockId) {
        self.current = block.0;
    }

    pub fn is_terminated(&self) -> bool {
        self.function.blocks[self.current].is_terminated()
    }

    /// Append an instruction to the current block. A no-op after the block
    /// ended.
    pub fn emit(&mut self, instruction: Instruction) {
        let block = &mut self.function.blocks[self.current];
        if block.is_terminated() {
            return;
        }
        block.instructions.push(instruction);
    }

    /// Set the block terminator. Attempting to emit a second terminator
    /// after the block ended is a no-op.
    pub fn terminate(&mut self, terminator: Terminator) {
        let block = &mut self.function.blocks[self.current];
        if block.is_terminated() {
            return;
        }
        block.terminator = Some(terminator);
    }

    pub fn ret(&mut self, value: Option<IrValue>) {
        self.terminate(Terminator::Ret(value));
    }

    pub fn br(&mut self, target: BlockId) {
        let label = self.block_label(target);
        self.terminate(Terminator::Br(label));
    }

    pub fn cond_br(&mut self, cond: IrValue, then_block: BlockId, else_block: BlockId) {
        let then_label = self.block_label(then_block);
        let else_label = self.block_label(else_block);
        self.terminate(Terminator::CondBr {
            cond,
            then_label,
            else_label,
        });
    }

    pub fn alloca(&mut self, ty: IrType) -> IrValue {
        let dest = self.temp(IrType::Ptr);
        self.emit(Instruction::Alloca {
            dest: dest.clone(),
            ty,
        });
        dest
    }

    pub fn load(&mut self, ty: IrType, addr: IrValue) -> IrValue {
        let dest = self.temp(ty.clone());
        self.emit(Instruction::Load {
            dest: dest.clone(),
            ty,
            addr,
        });
        dest
    }

    pub fn store(&mut self, value: IrValue, addr: IrValue) {
        self.emit(Instruction::Store { value, addr });
    }

    pub fn gep(&mut self, base_ty: IrType, addr: IrValue, indices: Vec<IrValue>) -> IrValue {
        let dest = self.temp(IrType::Ptr);
        self.emit(Instruction::Gep {
            dest: dest.clone(),
            base_ty,
            addr,
            indices,
        });
        dest
    }

    pub fn call(
        &mut self,
        ret: IrType,
        callee: IrValue,
        args: Vec<IrValue>,
    ) -> Option<IrValue> {
        let dest = if ret.is_void() {
            None
        } else {
            Some(self.temp(ret.clone()))
        };
        self.emit(Instruction::Call {
            dest: dest.clone(),
            ret,
            callee,
            args,
        });
        dest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_terminator_is_noop() {
        let mut builder = FunctionBuilder::new("f", vec![], IrType::Void);
        builder.ret(None);
        assert!(builder.is_terminated());
        // the block already ended; this ret must not replace the first
        builder.terminate(Terminator::Unreachable);
        let function = builder.finish();
        assert!(matches!(
            function.blocks[0].terminator,
            Some(Terminator::Ret(None))
        ));
    }

    #[test]
    fn test_emit_after_terminator_is_noop() {
        let mut builder = FunctionBuilder::new("f", vec![], IrType::Void);
        builder.ret(None);
        builder.alloca(IrType::I32);
        let function = builder.finish();
        assert!(function.blocks[0].instructions.is_empty());
    }

    #[test]
    fn test_set_insert_point_reopens() {
        let mut builder = FunctionBuilder::new("f", vec![], IrType::Void);
        builder.ret(None);
        let next = builder.create_block("after");
        builder.set_insert_point(next);
        assert!(!builder.is_terminated());
        builder.alloca(IrType::I32);
        builder.ret(None);
        let function = builder.finish();
        assert_eq!(function.blocks[1].instructions.len(), 1);
    }
}
