//! # lyra-vm
//!
//! The execution substrate of the Lyra agent scripting language: a tagged
//! 16-byte value representation, a tiered allocator (size classes, slabs,
//! direct mappings), a hybrid garbage collector (reference counting fused
//! with a mark-sweep backstop) and a register-based bytecode interpreter
//! with pooled call frames and first-class closures.
//!
//! Everything hangs off an explicit [`Runtime`] context; there is no
//! process-global state. Consumers assemble [`Function`] objects, register
//! them, and run them:
//!
//! ```
//! use lyra_vm::{Function, Instruction, Opcode, Runtime, Value};
//!
//! let runtime = Runtime::new();
//! let mut builder = Function::builder().name("sum").max_stack(3);
//! let k10 = builder.constant(Value::small_int(10));
//! let k20 = builder.constant(Value::small_int(20));
//! let function = builder
//!     .instruction(Instruction::abx(Opcode::LoadK, 0, k10 as i32))
//!     .instruction(Instruction::abx(Opcode::LoadK, 1, k20 as i32))
//!     .instruction(Instruction::abc(Opcode::Add, 2, 0, 1))
//!     .instruction(Instruction::abc(Opcode::Return, 2, 2, 0))
//!     .build();
//! let id = runtime.register_function(function);
//! let results = runtime.execute(id, vec![]).unwrap();
//! assert_eq!(results[0].as_small_int(), Some(30));
//! ```

pub mod allocator;
pub mod error;
pub mod frame;
pub mod function;
pub mod gc;
pub mod header;
pub mod interp;
pub mod object;
pub mod stats;
pub mod upvalue;
pub mod util;
pub mod value;

use std::sync::Arc;

use parking_lot::Mutex;

pub use allocator::AllocatorConfig;
pub use error::VmError;
pub use frame::FramePool;
pub use function::{Function, FunctionBuilder, FunctionRegistry, LineInfo};
pub use gc::{GcConfig, GcManager, WriteBarrierMode};
pub use interp::opcode::{Instruction, Opcode};
pub use interp::{Interpreter, InterpreterConfig};
pub use stats::{AllocationStats, GcStats, OptimizerStats};
pub use value::{Value, ValueKind};

/// Aggregated configuration of the three subsystems.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub allocator: AllocatorConfig,
    pub gc: GcConfig,
    pub interpreter: InterpreterConfig,
}

/// The runtime context: allocator + GC, function registry, globals and the
/// frame pool. Construct at entry, drop at exit; every API call goes
/// through it.
pub struct Runtime {
    gc: Arc<GcManager>,
    registry: FunctionRegistry,
    globals: Mutex<Vec<Value>>,
    pool: FramePool,
    interpreter_config: InterpreterConfig,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(mut config: RuntimeConfig) -> Self {
        // the GC's refcount batch size governs the interpreter-side buffer
        config.interpreter.optimizer.batch_size = config.gc.refcount_batch_size;
        let pool = FramePool::new(config.interpreter.frame_pool_initial);
        Self {
            gc: GcManager::new(config.allocator, config.gc),
            registry: FunctionRegistry::new(),
            globals: Mutex::new(Vec::new()),
            pool,
            interpreter_config: config.interpreter,
        }
    }

    /// Register a function and pin its heap constants as GC roots for the
    /// lifetime of the registry entry.
    pub fn register_function(&self, mut function: Function) -> u32 {
        for constant in function.constants.iter_mut() {
            constant.set_flag(value::FLAG_CONST);
            self.gc.root_value(*constant);
        }
        self.registry.register(function)
    }

    pub fn function(&self, id: u32) -> Option<Arc<Function>> {
        self.registry.get(id)
    }

    /// Run a registered function to completion and return the values of
    /// its top-level RETURN. Returned heap values carry a reference each
    /// and are registered as GC roots until handed back through
    /// [`Runtime::release_value`].
    pub fn execute(&self, function_id: u32, args: Vec<Value>) -> Result<Vec<Value>, VmError> {
        let mut globals = self.globals.lock();
        self.gc.mark_mutator(true);
        let result = {
            let mut interpreter = Interpreter::new(
                self.gc.as_ref(),
                &self.registry,
                &self.pool,
                &mut globals,
                &self.interpreter_config,
            );
            interpreter.execute(function_id, &args)
        };
        self.gc.mark_mutator(false);
        if let Ok(results) = &result {
            for value in results {
                self.gc.root_value(*value);
            }
        }
        result
    }

    // ---- value constructors --------------------------------------------

    /// String of any length: inline form when it fits, heap object
    /// otherwise.
    pub fn string(&self, text: &str) -> Result<Value, VmError> {
        match Value::small_string(text) {
            Some(inline) => Ok(inline),
            None => self.host_handle(self.gc.alloc_string(text.as_bytes())),
        }
    }

    /// Array initialized from `values` (each gains a reference).
    pub fn array(&self, values: &[Value]) -> Result<Value, VmError> {
        let array = self
            .gc
            .alloc_array(values.len() as u32, (values.len() as u32).max(1))?;
        unsafe {
            let slots = object::array_elements(array.object_ptr());
            for (index, &value) in values.iter().enumerate() {
                self.gc.retain_value(value);
                slots.add(index).write(value);
            }
        }
        self.host_handle(Ok(array))
    }

    /// Callable closing over `upvalues` (captured by value).
    pub fn callable(&self, function_id: u32, upvalues: &[Value]) -> Result<Value, VmError> {
        let mut cells = Vec::with_capacity(upvalues.len());
        for &value in upvalues {
            match self.gc.alloc_closed_upvalue(value) {
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
            Ok(callable) => self.host_handle(Ok(callable)),
            Err(error) => {
                for cell in cells {
                    self.gc.dec_ref(cell);
                }
                Err(error)
            }
        }
    }

    /// Bounded-depth safe copy (cycles and overdeep nesting become nil).
    pub fn deep_copy(&self, value: Value) -> Result<Value, VmError> {
        self.host_handle(self.gc.deep_copy(value))
    }

    /// Values held by the host are explicit GC roots: the tracer has no
    /// view of host stack slots, so a handle must keep its object out of
    /// the sweep until released.
    fn host_handle(&self, value: Result<Value, VmError>) -> Result<Value, VmError> {
        if let Ok(value) = &value {
            self.gc.root_value(*value);
        }
        value
    }

    pub fn retain_value(&self, value: Value) {
        self.gc.retain_value(value);
    }

    /// Drop a host handle: the value loses its root registration and its
    /// reference. Handles are tracked as a set, so releasing one of two
    /// handles to the same object unroots both; rc-managed interior
    /// references are unaffected.
    pub fn release_value(&self, value: Value) {
        if value.is_gc_managed() {
            self.gc.remove_root(value.object_ptr());
        }
        self.gc.release_value(value);
    }

    // ---- globals --------------------------------------------------------

    pub fn set_global(&self, index: usize, value: Value) {
        let mut globals = self.globals.lock();
        if index >= globals.len() {
            globals.resize(index + 1, Value::nil());
        }
        let old = globals[index];
        self.gc.retain_value(value);
        globals[index] = value;
        self.gc.release_value(old);
    }

    pub fn global(&self, index: usize) -> Option<Value> {
        self.globals.lock().get(index).copied()
    }

    // ---- GC controls ----------------------------------------------------

    /// Synchronous full collection. Globals are treated as roots; there are
    /// no live frames outside `execute`.
    pub fn force_gc(&self) {
        let roots: Vec<Value> = self
            .globals
            .lock()
            .iter()
            .copied()
            .filter(Value::is_gc_managed)
            .collect();
        self.gc.force_gc(&roots);
    }

    /// Non-blocking collection request, consumed by the background worker.
    pub fn trigger_gc(&self) {
        self.gc.trigger_gc();
    }

    /// Release empty pages and chunks back to the OS.
    pub fn compact(&self) -> usize {
        self.gc.compact()
    }

    pub fn gc(&self) -> &GcManager {
        self.gc.as_ref()
    }

    // ---- diagnostics ----------------------------------------------------

    pub fn allocation_stats(&self) -> AllocationStats {
        self.gc.allocation_stats()
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.gc_stats()
    }

    pub fn frame_pool(&self) -> &FramePool {
        &self.pool
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}
