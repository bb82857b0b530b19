//! The bytecode interpreter: a register machine stepping one instruction
//! at a time across pooled call frames.
//!
//! The interpreter holds a current-frame pointer (the top of its frame
//! stack). Each step fetches the instruction at the current pc, dispatches
//! on the opcode and, unless the instruction manipulated control flow,
//! advances the pc. CALL pushes a frame whose pc starts at 0; RETURN
//! restores the caller's pc from the popped frame's own return field.

pub mod opcode;
pub mod optimizer;

use std::time::Duration;

use crate::error::VmError;
use crate::frame::{Frame, FramePool};
use crate::function::FunctionRegistry;
use crate::gc::GcManager;
use crate::object::{
    array_elements, array_payload, array_payload_mut, callable_payload, callable_upvalues,
    grow_capacity, value_eq, value_string_bytes,
};
use crate::upvalue;
use crate::value::{Value, ValueKind, INLINE_STRING_MAX};

use opcode::{Instruction, Opcode};
use optimizer::{GcOptimizer, OptimizerConfig};

/// Sentinel for the host frame: RETURN hands every produced value back to
/// the caller of `execute` instead of a fixed result window.
const RETURN_ALL: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// CALL past this depth raises a stack-overflow error.
    pub max_call_depth: usize,
    /// Frames pre-built into the pool at runtime construction.
    pub frame_pool_initial: usize,
    pub optimizer: OptimizerConfig,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1000,
            frame_pool_initial: 8,
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl InterpreterConfig {
    /// Compatibility knob: a disabled optimizer applies refcount operations
    /// eagerly instead of batching them.
    pub fn without_optimizer(mut self) -> Self {
        self.optimizer.enabled = false;
        self
    }

    pub fn with_batch(mut self, batch_size: usize, flush_interval: Duration) -> Self {
        self.optimizer.batch_size = batch_size;
        self.optimizer.flush_interval = flush_interval;
        self
    }
}

pub struct Interpreter<'rt> {
    gc: &'rt GcManager,
    registry: &'rt FunctionRegistry,
    pool: &'rt FramePool,
    globals: &'rt mut Vec<Value>,
    config: &'rt InterpreterConfig,
    frames: Vec<Frame>,
    optimizer: Option<GcOptimizer>,
    finished: Option<Vec<Value>>,
}

impl<'rt> Interpreter<'rt> {
    pub fn new(
        gc: &'rt GcManager,
        registry: &'rt FunctionRegistry,
        pool: &'rt FramePool,
        globals: &'rt mut Vec<Value>,
        config: &'rt InterpreterConfig,
    ) -> Self {
        let optimizer = config
            .optimizer
            .enabled
            .then(|| GcOptimizer::new(&config.optimizer));
        Self {
            gc,
            registry,
            pool,
            globals,
            config,
            frames: Vec::new(),
            optimizer,
            finished: None,
        }
    }

    /// Run `function_id` with `args` to completion. Returns the values of
    /// the top-level RETURN.
    pub fn execute(&mut self, function_id: u32, args: &[Value]) -> Result<Vec<Value>, VmError> {
        let function = self
            .registry
            .get(function_id)
            .ok_or(VmError::UnknownFunction(function_id))?;
        let mut frame = self.pool.acquire(function, None, 0, 0, RETURN_ALL);
        for (index, &arg) in args.iter().enumerate() {
            if index >= frame.registers.len() {
                break;
            }
            self.gc.retain_value(arg);
            frame.registers[index] = arg;
        }
        self.frames.push(frame);

        let outcome = self.run();
        if outcome.is_err() {
            self.unwind();
        }
        outcome
    }

    fn run(&mut self) -> Result<Vec<Value>, VmError> {
        loop {
            if let Some(results) = self.finished.take() {
                return Ok(results);
            }
            self.step()?;
        }
    }

    /// One instruction. Errors bubble to `execute`; the interpreter never
    /// catches them.
    pub fn step(&mut self) -> Result<(), VmError> {
        let frame_index = self.frames.len() - 1;
        let (instruction, pc) = {
            let frame = &self.frames[frame_index];
            let function = frame.function.as_ref().expect("frame without function");
            if frame.pc >= function.instructions.len() {
                // falling off the end behaves as a bare RETURN
                (Instruction::abc(Opcode::Return, 0, 1, 0), frame.pc)
            } else {
                (function.instructions[frame.pc], frame.pc)
            }
        };
        let op = Opcode::from_u8(instruction.opcode)
            .ok_or(VmError::UnknownOpcode(instruction.opcode))?;
        let a = instruction.a;
        let b = instruction.b;
        let c = instruction.c;
        let bx = instruction.bx;

        let mut advance = true;
        match op {
            Opcode::Move | Opcode::GetLocal | Opcode::SetLocal => {
                let value = self.read_reg(frame_index, b, pc)?;
                self.write_reg(frame_index, a, value, pc)?;
            }
            Opcode::LoadK => {
                let frame = &self.frames[frame_index];
                let function = frame.function.as_ref().expect("frame without function");
                let constant = function
                    .constants
                    .get(bx as usize)
                    .copied()
                    .ok_or(VmError::MalformedInstruction { pc })?;
                self.write_reg(frame_index, a, constant, pc)?;
            }
            Opcode::Add => self.arith(frame_index, "+", a, b, c, pc)?,
            Opcode::Sub => self.arith(frame_index, "-", a, b, c, pc)?,
            Opcode::Mul => self.arith(frame_index, "*", a, b, c, pc)?,
            Opcode::Div => self.arith(frame_index, "/", a, b, c, pc)?,
            Opcode::Mod => self.arith(frame_index, "%", a, b, c, pc)?,
            Opcode::Neg => {
                let operand = self.read_reg(frame_index, b, pc)?;
                let result = match operand.kind() {
                    ValueKind::SmallInt => {
                        Value::number(-(operand.as_small_int().unwrap_or(0) as i64))
                    }
                    ValueKind::Double => Value::double(-operand.as_double().unwrap_or(0.0)),
                    kind => {
                        return Err(VmError::TypeMismatch {
                            op: "neg",
                            lhs: kind.name(),
                            rhs: kind.name(),
                        })
                    }
                };
                self.write_reg(frame_index, a, result, pc)?;
            }
            Opcode::Not => {
                let operand = self.read_reg(frame_index, b, pc)?;
                self.write_reg(frame_index, a, Value::bool(!operand.is_truthy()), pc)?;
            }
            Opcode::Eq => {
                let (lhs, rhs) = self.read_pair(frame_index, b, c, pc)?;
                self.write_reg(frame_index, a, Value::bool(value_eq(lhs, rhs)), pc)?;
            }
            Opcode::Neq => {
                let (lhs, rhs) = self.read_pair(frame_index, b, c, pc)?;
                self.write_reg(frame_index, a, Value::bool(!value_eq(lhs, rhs)), pc)?;
            }
            Opcode::Lt => self.compare(frame_index, "<", a, b, c, pc)?,
            Opcode::Gt => self.compare(frame_index, ">", a, b, c, pc)?,
            Opcode::Lte => self.compare(frame_index, "<=", a, b, c, pc)?,
            Opcode::Gte => self.compare(frame_index, ">=", a, b, c, pc)?,
            Opcode::Jump => {
                self.jump(frame_index, pc, bx)?;
                advance = false;
            }
            Opcode::JumpIfFalse => {
                let condition = self.read_reg(frame_index, a, pc)?;
                if !condition.is_truthy() {
                    self.jump(frame_index, pc, bx)?;
                    advance = false;
                }
            }
            Opcode::JumpIfTrue => {
                let condition = self.read_reg(frame_index, a, pc)?;
                if condition.is_truthy() {
                    self.jump(frame_index, pc, bx)?;
                    advance = false;
                }
            }
            Opcode::GetGlobal => {
                let index = bx as usize;
                let value = self
                    .globals
                    .get(index)
                    .copied()
                    .ok_or(VmError::UndefinedGlobal(index))?;
                self.write_reg(frame_index, a, value, pc)?;
            }
            Opcode::SetGlobal => {
                if bx < 0 {
                    return Err(VmError::MalformedInstruction { pc });
                }
                let index = bx as usize;
                let value = self.read_reg(frame_index, a, pc)?;
                if index >= self.globals.len() {
                    self.globals.resize(index + 1, Value::nil());
                }
                let old = self.globals[index];
                self.gc.retain_value(value);
                self.globals[index] = value;
                self.gc.release_value(old);
            }
            Opcode::Call => {
                self.call(frame_index, a, b, c, pc)?;
                advance = false;
            }
            Opcode::Return => {
                self.ret(frame_index, a, b, pc)?;
                advance = false;
            }
            Opcode::NewArray => {
                if b < 0 {
                    return Err(VmError::MalformedInstruction { pc });
                }
                self.flush_optimizer();
                let array = self.gc.alloc_array(b as u32, (b as u32).max(1))?;
                self.write_reg_owned(frame_index, a, array, pc)?;
            }
            Opcode::ArrayGet => self.array_get(frame_index, a, b, c, pc)?,
            Opcode::ArraySet => self.array_set(frame_index, a, b, c, pc)?,
            Opcode::ArrayLen => {
                let array = self.read_reg(frame_index, b, pc)?;
                if array.kind() != ValueKind::Array {
                    return Err(VmError::TypeMismatch {
                        op: "array_len",
                        lhs: array.type_name(),
                        rhs: "array",
                    });
                }
                let length = unsafe { array_payload(array.object_ptr()).length };
                self.write_reg(frame_index, a, Value::small_int(length as i32), pc)?;
            }
            Opcode::MakeClosure => {
                self.make_closure(frame_index, a, b, c, pc)?;
            }
            Opcode::GetUpvalue => {
                let cell = self.upvalue_cell(frame_index, b, pc)?;
                let value = unsafe {
                    if upvalue::is_open(cell) {
                        self.read_open_cell(cell)
                    } else {
                        upvalue::read_closed(cell)
                    }
                };
                self.write_reg(frame_index, a, value, pc)?;
            }
            Opcode::SetUpvalue => {
                let value = self.read_reg(frame_index, a, pc)?;
                let cell = self.upvalue_cell(frame_index, b, pc)?;
                unsafe {
                    if upvalue::is_open(cell) {
                        if let Some((owner, register)) = self.find_open_cell(cell) {
                            self.write_reg(owner, register as i32, value, pc)?;
                        }
                    } else {
                        self.flush_optimizer();
                        upvalue::write_closed(self.gc, cell, value);
                    }
                }
            }
            Opcode::CloseUpvalue => {
                if a < 0 {
                    return Err(VmError::MalformedInstruction { pc });
                }
                self.flush_optimizer();
                let gc = self.gc;
                self.frames[frame_index].close_upvalues_from(gc, a as u32);
            }
            Opcode::GcWriteBarrier => {
                // reserved: the barrier records traffic for a future
                // generational collector and has no effect today
                let _ = self.read_reg(frame_index, a, pc)?;
                if let Some(optimizer) = self.optimizer.as_mut() {
                    optimizer.note_write_barrier();
                }
            }
            Opcode::GcIncRef => {
                let value = self.read_reg(frame_index, a, pc)?;
                self.flush_optimizer();
                self.gc.retain_value(value);
            }
            Opcode::GcDecRef => {
                let value = self.read_reg(frame_index, a, pc)?;
                self.flush_optimizer();
                self.gc.release_value(value);
            }
            Opcode::GcCollect => {
                self.collect_now();
            }
            Opcode::GcCheck => {
                self.flush_optimizer();
                if self.gc.take_pending() || self.gc.needs_gc() {
                    self.collect_now();
                }
            }
            Opcode::GcPin => {
                let value = self.read_reg(frame_index, a, pc)?;
                if value.is_gc_managed() {
                    unsafe { (*value.object_ptr()).set_pinned(true) };
                }
            }
            Opcode::GcUnpin => {
                let value = self.read_reg(frame_index, a, pc)?;
                if value.is_gc_managed() {
                    unsafe { (*value.object_ptr()).set_pinned(false) };
                }
            }
            Opcode::Halt => {
                self.unwind();
                self.finished = Some(Vec::new());
                advance = false;
            }
        }

        if advance {
            self.frames[frame_index].pc += 1;
        }
        Ok(())
    }

    // ---- register plumbing ---------------------------------------------

    fn reg_index(&self, frame_index: usize, operand: i32, pc: usize) -> Result<usize, VmError> {
        let count = self.frames[frame_index].registers.len();
        if operand < 0 || operand as usize >= count {
            return Err(VmError::MalformedInstruction { pc });
        }
        Ok(operand as usize)
    }

    fn read_reg(&self, frame_index: usize, operand: i32, pc: usize) -> Result<Value, VmError> {
        let index = self.reg_index(frame_index, operand, pc)?;
        Ok(self.frames[frame_index].registers[index])
    }

    fn read_pair(
        &self,
        frame_index: usize,
        b: i32,
        c: i32,
        pc: usize,
    ) -> Result<(Value, Value), VmError> {
        Ok((
            self.read_reg(frame_index, b, pc)?,
            self.read_reg(frame_index, c, pc)?,
        ))
    }

    /// The assignment discipline for registers: the new value gains a
    /// reference before the old one loses its own.
    fn write_reg(
        &mut self,
        frame_index: usize,
        operand: i32,
        value: Value,
        pc: usize,
    ) -> Result<(), VmError> {
        let index = self.reg_index(frame_index, operand, pc)?;
        let old = self.frames[frame_index].registers[index];
        match self.optimizer.as_mut() {
            Some(optimizer) => {
                optimizer.retain(self.gc, value);
                optimizer.release(self.gc, old);
            }
            None => {
                self.gc.retain_value(value);
                self.gc.release_value(old);
            }
        }
        self.frames[frame_index].registers[index] = value;
        Ok(())
    }

    /// Store a value that already carries its creation reference (a fresh
    /// allocation): the old occupant is released, the new one is not
    /// re-incremented.
    fn write_reg_owned(
        &mut self,
        frame_index: usize,
        operand: i32,
        value: Value,
        pc: usize,
    ) -> Result<(), VmError> {
        let index = self.reg_index(frame_index, operand, pc)?;
        let old = self.frames[frame_index].registers[index];
        self.frames[frame_index].registers[index] = value;
        match self.optimizer.as_mut() {
            Some(optimizer) => optimizer.release(self.gc, old),
            None => self.gc.release_value(old),
        }
        Ok(())
    }

    fn flush_optimizer(&mut self) {
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.flush(self.gc);
        }
    }

    // ---- arithmetic and comparison -------------------------------------

    fn arith(
        &mut self,
        frame_index: usize,
        op: &'static str,
        a: i32,
        b: i32,
        c: i32,
        pc: usize,
    ) -> Result<(), VmError> {
        let (lhs, rhs) = self.read_pair(frame_index, b, c, pc)?;
        let result = match (lhs.kind(), rhs.kind()) {
            // fast path: i64 arithmetic, promoted to double on overflow of
            // the 31-bit inline range
            (ValueKind::SmallInt, ValueKind::SmallInt) => {
                let x = lhs.as_small_int().unwrap_or(0) as i64;
                let y = rhs.as_small_int().unwrap_or(0) as i64;
                match op {
                    "+" => Value::number(x + y),
                    "-" => Value::number(x - y),
                    "*" => Value::number(x * y),
                    "/" => {
                        if y == 0 {
                            return Err(VmError::DivisionByZero);
                        }
                        Value::number(x / y)
                    }
                    _ => {
                        if y == 0 {
                            return Err(VmError::DivisionByZero);
                        }
                        Value::number(x % y)
                    }
                }
            }
            (ValueKind::SmallInt | ValueKind::Double, ValueKind::SmallInt | ValueKind::Double) => {
                let x = lhs.as_number().unwrap_or(0.0);
                let y = rhs.as_number().unwrap_or(0.0);
                match op {
                    "+" => Value::double(x + y),
                    "-" => Value::double(x - y),
                    "*" => Value::double(x * y),
                    "/" => Value::double(x / y),
                    _ => Value::double(x % y),
                }
            }
            (ValueKind::String, ValueKind::String) if op == "+" => {
                return self.concat(frame_index, a, lhs, rhs, pc);
            }
            (l, r) => {
                return Err(VmError::TypeMismatch {
                    op,
                    lhs: l.name(),
                    rhs: r.name(),
                })
            }
        };
        self.write_reg(frame_index, a, result, pc)
    }

    fn concat(
        &mut self,
        frame_index: usize,
        a: i32,
        lhs: Value,
        rhs: Value,
        pc: usize,
    ) -> Result<(), VmError> {
        let mut bytes = Vec::with_capacity(
            value_string_bytes(&lhs).len() + value_string_bytes(&rhs).len(),
        );
        bytes.extend_from_slice(value_string_bytes(&lhs));
        bytes.extend_from_slice(value_string_bytes(&rhs));
        if bytes.len() <= INLINE_STRING_MAX {
            let text = std::str::from_utf8(&bytes).unwrap_or_default();
            let value = Value::small_string(text).unwrap_or_else(Value::nil);
            return self.write_reg(frame_index, a, value, pc);
        }
        self.flush_optimizer();
        let value = self.gc.alloc_string(&bytes)?;
        self.write_reg_owned(frame_index, a, value, pc)
    }

    fn compare(
        &mut self,
        frame_index: usize,
        op: &'static str,
        a: i32,
        b: i32,
        c: i32,
        pc: usize,
    ) -> Result<(), VmError> {
        let (lhs, rhs) = self.read_pair(frame_index, b, c, pc)?;
        let ordering = match (lhs.kind(), rhs.kind()) {
            (ValueKind::SmallInt | ValueKind::Double, ValueKind::SmallInt | ValueKind::Double) => {
                let x = lhs.as_number().unwrap_or(0.0);
                let y = rhs.as_number().unwrap_or(0.0);
                x.partial_cmp(&y)
            }
            (ValueKind::String, ValueKind::String) => {
                Some(value_string_bytes(&lhs).cmp(value_string_bytes(&rhs)))
            }
            (l, r) => {
                return Err(VmError::TypeMismatch {
                    op,
                    lhs: l.name(),
                    rhs: r.name(),
                })
            }
        };
        let result = match (ordering, op) {
            (Some(ordering), "<") => ordering.is_lt(),
            (Some(ordering), ">") => ordering.is_gt(),
            (Some(ordering), "<=") => ordering.is_le(),
            (Some(ordering), _) => ordering.is_ge(),
            // NaN comparisons are always false
            (None, _) => false,
        };
        self.write_reg(frame_index, a, Value::bool(result), pc)
    }

    fn jump(&mut self, frame_index: usize, pc: usize, bx: i32) -> Result<(), VmError> {
        let function_len = {
            let frame = &self.frames[frame_index];
            frame
                .function
                .as_ref()
                .map(|f| f.instructions.len())
                .unwrap_or(0)
        };
        let target = pc as i64 + bx as i64;
        if target < 0 || target as usize > function_len {
            return Err(VmError::MalformedInstruction { pc });
        }
        self.frames[frame_index].pc = target as usize;
        Ok(())
    }

    // ---- calls ----------------------------------------------------------

    fn call(&mut self, frame_index: usize, a: i32, b: i32, c: i32, pc: usize) -> Result<(), VmError> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(VmError::StackOverflow(self.frames.len()));
        }
        let callee = self.read_reg(frame_index, a, pc)?;
        let (function_id, cells) = match callee.kind() {
            ValueKind::Function => (callee.as_function_id().unwrap_or(0), Vec::new()),
            ValueKind::Callable => unsafe {
                let header = callee.object_ptr();
                let payload = callable_payload(header);
                (
                    payload.function_id,
                    callable_upvalues(header).to_vec(),
                )
            },
            kind => return Err(VmError::NotCallable(kind.name())),
        };
        let function = self
            .registry
            .get(function_id)
            .ok_or(VmError::UnknownFunction(function_id))?;
        if b < 1 || c < 0 {
            return Err(VmError::MalformedInstruction { pc });
        }
        let argc = (b - 1) as usize;
        let mut arguments = Vec::with_capacity(argc);
        for argument in 0..argc {
            arguments.push(self.read_reg(frame_index, a + 1 + argument as i32, pc)?);
        }

        // frame push is a safe point: drain buffered refcounts and honor a
        // pending background request
        self.flush_optimizer();
        if self.gc.take_pending() {
            self.collect_now();
        }

        let mut frame = self
            .pool
            .acquire(function, Some(frame_index), a as u32, pc + 1, c as u32);
        for (slot, &value) in arguments.iter().enumerate() {
            if slot >= frame.registers.len() {
                break;
            }
            self.gc.retain_value(value);
            frame.registers[slot] = value;
        }
        frame.upvalues = cells;
        self.frames.push(frame);
        Ok(())
    }

    fn ret(&mut self, frame_index: usize, a: i32, b: i32, pc: usize) -> Result<(), VmError> {
        if b < 1 {
            return Err(VmError::MalformedInstruction { pc });
        }
        let produced = (b - 1) as usize;
        let mut results = Vec::with_capacity(produced);
        for offset in 0..produced {
            results.push(self.read_reg(frame_index, a + offset as i32, pc)?);
        }

        // frame pop is a safe point
        self.flush_optimizer();

        let gc = self.gc;
        let mut popped = self.frames.pop().expect("return without a frame");
        popped.close_upvalues_from(gc, 0);

        match popped.caller {
            Some(caller_index) => {
                let expected = popped.expected_returns as usize;
                let base = popped.return_register as usize;
                if base + expected > self.frames[caller_index].registers.len() {
                    self.release_frame(popped);
                    return Err(VmError::MalformedInstruction { pc });
                }
                for slot in 0..expected {
                    let value = results.get(slot).copied().unwrap_or_else(Value::nil);
                    self.write_reg(
                        caller_index,
                        popped.return_register as i32 + slot as i32,
                        value,
                        pc,
                    )?;
                }
                self.frames[caller_index].pc = popped.return_pc;
            }
            None => {
                // hand the results to the host with a reference each
                for &value in &results {
                    gc.retain_value(value);
                }
                self.finished = Some(results);
            }
        }

        self.release_frame(popped);
        if self.gc.take_pending() {
            self.collect_now();
        }
        Ok(())
    }

    /// Drop all register references of a dead frame and return it to the
    /// pool.
    fn release_frame(&mut self, mut frame: Frame) {
        for index in 0..frame.registers.len() {
            let value = frame.registers[index];
            if value.is_gc_managed() {
                self.gc.release_value(value);
            }
            frame.registers[index] = Value::nil();
        }
        self.pool.release(frame);
    }

    /// Pop every live frame, releasing references. Used by HALT and error
    /// unwinding.
    fn unwind(&mut self) {
        self.flush_optimizer();
        let gc = self.gc;
        while let Some(mut frame) = self.frames.pop() {
            frame.close_upvalues_from(gc, 0);
            self.release_frame(frame);
        }
    }

    // ---- arrays ---------------------------------------------------------

    fn array_index(value: Value, length: u32) -> Result<i64, VmError> {
        let index = match value.kind() {
            ValueKind::SmallInt => value.as_small_int().unwrap_or(0) as i64,
            _ => {
                return Err(VmError::TypeMismatch {
                    op: "index",
                    lhs: value.type_name(),
                    rhs: "small_int",
                })
            }
        };
        if index < 0 || index >= u32::MAX as i64 {
            return Err(VmError::OutOfBounds { index, length });
        }
        Ok(index)
    }

    fn array_get(
        &mut self,
        frame_index: usize,
        a: i32,
        b: i32,
        c: i32,
        pc: usize,
    ) -> Result<(), VmError> {
        let array = self.read_reg(frame_index, b, pc)?;
        if array.kind() != ValueKind::Array {
            return Err(VmError::TypeMismatch {
                op: "array_get",
                lhs: array.type_name(),
                rhs: "array",
            });
        }
        let length = unsafe { array_payload(array.object_ptr()).length };
        let index = Self::array_index(self.read_reg(frame_index, c, pc)?, length)?;
        if index as u32 >= length {
            return Err(VmError::OutOfBounds { index, length });
        }
        let value = unsafe { *array_elements(array.object_ptr()).add(index as usize) };
        self.write_reg(frame_index, a, value, pc)
    }

    /// ARRAY_SET with write-triggered growth. A write past capacity
    /// rebuilds the array in an isolated allocation and hands the caller
    /// the new value through R(A); writes within capacity extend the live
    /// length in place.
    fn array_set(
        &mut self,
        frame_index: usize,
        a: i32,
        b: i32,
        c: i32,
        pc: usize,
    ) -> Result<(), VmError> {
        let array = self.read_reg(frame_index, a, pc)?;
        if array.kind() != ValueKind::Array {
            return Err(VmError::TypeMismatch {
                op: "array_set",
                lhs: array.type_name(),
                rhs: "array",
            });
        }
        let value = self.read_reg(frame_index, c, pc)?;
        let header = array.object_ptr();
        let (length, capacity) = unsafe {
            let payload = array_payload(header);
            (payload.length, payload.capacity)
        };
        let index = Self::array_index(self.read_reg(frame_index, b, pc)?, length)?;

        if (index as u32) < capacity {
            unsafe {
                let slot = array_elements(header).add(index as usize);
                let old = *slot;
                match self.optimizer.as_mut() {
                    Some(optimizer) => {
                        optimizer.retain(self.gc, value);
                        optimizer.release(self.gc, old);
                    }
                    None => {
                        self.gc.retain_value(value);
                        self.gc.release_value(old);
                    }
                }
                *slot = value;
                if index as u32 >= length {
                    array_payload_mut(header).length = index as u32 + 1;
                }
            }
            return Ok(());
        }

        // growth: rebuild into a strictly larger isolated allocation
        self.flush_optimizer();
        let new_capacity = grow_capacity(capacity, index as u32 + 1);
        let replacement = self.gc.alloc_array(index as u32 + 1, new_capacity)?;
        unsafe {
            let source = array_elements(header);
            let target = array_elements(replacement.object_ptr());
            for slot in 0..length as usize {
                let element = *source.add(slot);
                self.gc.retain_value(element);
                target.add(slot).write(element);
            }
            self.gc.retain_value(value);
            target.add(index as usize).write(value);
        }
        // the register write releases the old array, cascading its element
        // references
        self.write_reg_owned(frame_index, a, replacement, pc)
    }

    // ---- closures -------------------------------------------------------

    fn make_closure(
        &mut self,
        frame_index: usize,
        a: i32,
        b: i32,
        c: i32,
        pc: usize,
    ) -> Result<(), VmError> {
        let function_value = self.read_reg(frame_index, b, pc)?;
        let function_id = function_value
            .as_function_id()
            .ok_or(VmError::NotCallable(function_value.type_name()))?;
        if c < 0 {
            return Err(VmError::MalformedInstruction { pc });
        }
        self.flush_optimizer();
        let mut cells = Vec::with_capacity(c as usize);
        for capture in 0..c {
            let initial = self.read_reg(frame_index, b + 1 + capture, pc)?;
            match self.gc.alloc_closed_upvalue(initial) {
                Ok(cell) => cells.push(cell),
                Err(error) => {
                    for cell in cells {
                        self.gc.dec_ref(cell);
                    }
                    return Err(error);
                }
            }
        }
        match self.gc.alloc_callable(function_id, &cells) {
            Ok(callable) => self.write_reg_owned(frame_index, a, callable, pc),
            Err(error) => {
                for cell in cells {
                    self.gc.dec_ref(cell);
                }
                Err(error)
            }
        }
    }

    fn upvalue_cell(
        &self,
        frame_index: usize,
        b: i32,
        pc: usize,
    ) -> Result<*mut crate::header::GcHeader, VmError> {
        self.frames[frame_index]
            .upvalues
            .get(b.max(0) as usize)
            .copied()
            .filter(|cell| !cell.is_null() && b >= 0)
            .ok_or(VmError::MalformedInstruction { pc })
    }

    /// Resolve an open cell through the frame that owns it. Open cells only
    /// occur for captures made through the frame API; closure construction
    /// closes its cells immediately.
    fn find_open_cell(&self, cell: *mut crate::header::GcHeader) -> Option<(usize, u32)> {
        for (index, frame) in self.frames.iter().enumerate().rev() {
            if let Some(entry) = frame.open_upvalues.iter().find(|entry| entry.cell == cell) {
                return Some((index, entry.register));
            }
        }
        None
    }

    fn read_open_cell(&self, cell: *mut crate::header::GcHeader) -> Value {
        match self.find_open_cell(cell) {
            Some((frame_index, register)) => self.frames[frame_index].registers[register as usize],
            None => Value::nil(),
        }
    }

    // ---- collection -----------------------------------------------------

    /// Synchronous full collection with the live roots: every register of
    /// every active frame plus the globals vector.
    fn collect_now(&mut self) {
        self.flush_optimizer();
        let mut roots: Vec<Value> = Vec::new();
        for frame in &self.frames {
            roots.extend(frame.registers.iter().copied().filter(Value::is_gc_managed));
        }
        roots.extend(self.globals.iter().copied().filter(Value::is_gc_managed));
        self.gc.force_gc(&roots);
    }

    pub fn optimizer_stats(&self) -> Option<&crate::stats::OptimizerStats> {
        self.optimizer.as_ref().map(|optimizer| optimizer.stats())
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }
}
