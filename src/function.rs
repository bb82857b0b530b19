//! Immutable function objects and the process-wide registry.
//!
//! A function value carries a registry id only, which keeps it inline and
//! free of allocator traffic. The registry is a read-mostly map behind a
//! reader/writer lock.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use atomic::Ordering;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::interp::opcode::Instruction;
use crate::value::Value;

/// Optional debug mapping from instruction index to source line.
#[derive(Debug, Clone, Default)]
pub struct LineInfo {
    pub source: String,
    /// One entry per instruction.
    pub lines: Vec<u32>,
}

/// Immutable after construction: instructions, constant pool and metadata.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub param_count: u8,
    pub is_vararg: bool,
    /// Register file requirement; frames allocate at least this many slots.
    pub max_stack: u32,
    pub instructions: Vec<Instruction>,
    pub constants: Vec<Value>,
    pub line_info: Option<LineInfo>,
}

impl Function {
    pub fn builder() -> FunctionBuilder {
        FunctionBuilder::default()
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "<anonymous>"
        } else {
            &self.name
        }
    }
}

#[derive(Default)]
pub struct FunctionBuilder {
    name: String,
    param_count: u8,
    is_vararg: bool,
    max_stack: u32,
    instructions: Vec<Instruction>,
    constants: Vec<Value>,
    line_info: Option<LineInfo>,
}

impl FunctionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn param_count(mut self, count: u8) -> Self {
        self.param_count = count;
        self
    }

    pub fn is_vararg(mut self, value: bool) -> Self {
        self.is_vararg = value;
        self
    }

    pub fn max_stack(mut self, slots: u32) -> Self {
        self.max_stack = slots;
        self
    }

    /// Add a constant and return its pool index.
    pub fn constant(&mut self, value: Value) -> u32 {
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    pub fn instruction(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn instructions(mut self, instructions: Vec<Instruction>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn line_info(mut self, info: LineInfo) -> Self {
        self.line_info = Some(info);
        self
    }

    pub fn build(self) -> Function {
        Function {
            name: self.name,
            param_count: self.param_count,
            is_vararg: self.is_vararg,
            max_stack: self.max_stack,
            instructions: self.instructions,
            constants: self.constants,
            line_info: self.line_info,
        }
    }
}

/// Id-keyed function table. Read-mostly: executions resolve ids on every
/// CALL, registrations happen at load time.
pub struct FunctionRegistry {
    functions: RwLock<FxHashMap<u32, Arc<Function>>>,
    next_id: AtomicU32,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(FxHashMap::default()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn register(&self, function: Function) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.functions.write().insert(id, Arc::new(function));
        id
    }

    pub fn get(&self, id: u32) -> Option<Arc<Function>> {
        self.functions.read().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
