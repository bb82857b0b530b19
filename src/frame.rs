//! Call frames and the frame pool.
//!
//! A frame owns its register file; registers are copied by value and their
//! reference counts move through the GC write helpers. Frames are recycled
//! through a pooled free list so a CALL does not hit the system allocator.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::function::Function;
use crate::header::GcHeader;
use crate::value::Value;

/// Register file floor; tiny functions still get this many slots.
pub const MIN_REGISTERS: usize = 16;

/// A cell created from this frame that still points into its register file.
#[derive(Clone, Copy)]
pub struct OpenUpvalue {
    pub register: u32,
    pub cell: *mut GcHeader,
}

pub struct Frame {
    pub function: Option<Arc<Function>>,
    pub pc: usize,
    pub registers: Vec<Value>,
    /// Index of the calling frame in the interpreter's frame stack.
    pub caller: Option<usize>,
    /// Destination register of the CALL instruction in the caller.
    pub return_register: u32,
    /// Caller pc to restore on RETURN; recorded at push time so RETURN
    /// never has to consult the caller's current pc.
    pub return_pc: usize,
    /// Result slots the CALL asked for.
    pub expected_returns: u32,
    /// Upvalue cells of the executing callable (borrowed, not owned).
    pub upvalues: Vec<*mut GcHeader>,
    /// Cells opened over this frame's registers; closed at teardown.
    pub open_upvalues: Vec<OpenUpvalue>,
}

impl Frame {
    fn empty() -> Self {
        Self {
            function: None,
            pc: 0,
            registers: Vec::new(),
            caller: None,
            return_register: 0,
            return_pc: 0,
            expected_returns: 0,
            upvalues: Vec::new(),
            open_upvalues: Vec::new(),
        }
    }

    /// Register file size for a function: its declared requirement, floored.
    pub fn register_count(function: &Function) -> usize {
        (function.max_stack as usize).max(MIN_REGISTERS)
    }
}

/// Recycles frames. `acquire` resizes and re-arms a pooled frame;
/// `release` expects the caller to have dropped register references and
/// resets everything to the pool invariant: all registers nil, pc 0, no
/// caller link.
pub struct FramePool {
    frames: Mutex<Vec<Frame>>,
}

impl FramePool {
    pub fn new(initial: usize) -> Self {
        let mut frames = Vec::with_capacity(initial);
        for _ in 0..initial {
            frames.push(Frame::empty());
        }
        Self {
            frames: Mutex::new(frames),
        }
    }

    pub fn acquire(
        &self,
        function: Arc<Function>,
        caller: Option<usize>,
        return_register: u32,
        return_pc: usize,
        expected_returns: u32,
    ) -> Frame {
        let mut frame = self.frames.lock().pop().unwrap_or_else(Frame::empty);
        let wanted = Frame::register_count(&function);
        if frame.registers.len() < wanted {
            frame.registers.resize(wanted, Value::nil());
        }
        frame.function = Some(function);
        frame.pc = 0;
        frame.caller = caller;
        frame.return_register = return_register;
        frame.return_pc = return_pc;
        frame.expected_returns = expected_returns;
        frame.upvalues.clear();
        frame.open_upvalues.clear();
        frame
    }

    pub fn release(&self, mut frame: Frame) {
        for register in frame.registers.iter_mut() {
            *register = Value::nil();
        }
        frame.function = None;
        frame.pc = 0;
        frame.caller = None;
        frame.return_register = 0;
        frame.return_pc = 0;
        frame.expected_returns = 0;
        frame.upvalues.clear();
        frame.open_upvalues.clear();
        self.frames.lock().push(frame);
    }

    pub fn pooled(&self) -> usize {
        self.frames.lock().len()
    }
}
