use crate::heap::Heap;
use crate::opcode::VarKind;
use crate::value::{SlotRef, Value};
use anyhow::{bail, ensure, Result};

const STACK_SIZE: usize = 100_000;
const MAX_FRAMES: usize = 10_000;

/// Metadata of one activation. Return addresses and bases live here, off the
/// value stack, so every operand slot always holds a classifiable `Value`.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub return_addr: Option<u32>,
    pub arg_base: usize,
    pub locals_base: usize,
    pub n_args: u32,
    pub n_locals: u32,
    pub is_closure: bool,
    pub closure: Option<u32>,
}

/// A call entered through CALL or CALLC, consumed by the BEGIN it lands on.
#[derive(Debug, Clone, Copy)]
pub struct PendingCall {
    pub return_addr: u32,
    pub is_closure: bool,
}

/// The evaluation stack: the zero-initialised global area, the operand
/// stack, and the frame records. The word capacity is fixed; running out in
/// either direction is a reported error, not a panic.
pub struct EvalStack {
    globals: Vec<Value>,
    values: Vec<Value>,
    frames: Vec<Frame>,
}

impl EvalStack {
    pub fn new(global_area_size: u32) -> Result<Self> {
        ensure!(
            (global_area_size as usize) < STACK_SIZE,
            "global area of {} words exceeds the {}-word stack",
            global_area_size,
            STACK_SIZE
        );
        // Resolution accepts an index equal to the declared size, so the
        // backing area carries one spare word past it.
        Ok(Self {
            globals: vec![Value::Int(0); global_area_size as usize + 1],
            values: Vec::new(),
            frames: Vec::new(),
        })
    }

    pub fn push(&mut self, value: Value) -> Result<()> {
        ensure!(
            self.globals.len() + self.values.len() < STACK_SIZE,
            "stack overflow"
        );
        self.values.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value> {
        match self.values.pop() {
            Some(value) => Ok(value),
            None => bail!("stack underflow"),
        }
    }

    pub fn top(&self) -> Result<Value> {
        match self.values.last() {
            Some(&value) => Ok(value),
            None => bail!("stack underflow"),
        }
    }

    /// The value `depth` slots below the top; depth 0 is the top itself.
    pub fn peek(&self, depth: usize) -> Result<Value> {
        ensure!(depth < self.values.len(), "stack underflow");
        Ok(self.values[self.values.len() - 1 - depth])
    }

    pub fn depth(&self) -> usize {
        self.values.len()
    }

    pub fn current_frame(&self) -> Result<&Frame> {
        match self.frames.last() {
            Some(frame) => Ok(frame),
            None => bail!("no active call frame"),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Enters a frame. The caller has already pushed the arguments (and, for
    /// a closure call, the closure reference beneath them); locals start as
    /// boxed zero so a collection never sees an uninitialised slot, and one
    /// extra zero seeds the return value.
    pub fn prologue(
        &mut self,
        pending: Option<PendingCall>,
        n_args: u32,
        n_locals: u32,
    ) -> Result<()> {
        ensure!(self.frames.len() < MAX_FRAMES, "call stack overflow");

        let (return_addr, is_closure) = match pending {
            Some(call) => (Some(call.return_addr), call.is_closure),
            None => (None, false),
        };

        let wanted = n_args as usize + is_closure as usize;
        let (arg_base, closure) = if return_addr.is_some() {
            ensure!(
                self.values.len() >= wanted,
                "stack underflow: call expects {} argument words, {} are present",
                wanted,
                self.values.len()
            );
            let arg_base = self.values.len() - n_args as usize;
            let closure = if is_closure {
                match self.values[arg_base - 1] {
                    Value::HeapRef(handle) => Some(handle),
                    other => bail!("closure slot holds {}, not a heap object", other),
                }
            } else {
                None
            };
            (arg_base, closure)
        } else {
            // The bootstrap frame: no caller, no argument window, and its
            // epilogue halts the machine.
            (self.values.len(), None)
        };

        ensure!(
            self.globals.len() + self.values.len() + n_locals as usize + 1 <= STACK_SIZE,
            "stack overflow"
        );
        let locals_base = self.values.len();
        for _ in 0..n_locals + 1 {
            self.values.push(Value::Int(0));
        }

        self.frames.push(Frame {
            return_addr,
            arg_base,
            locals_base,
            n_args,
            n_locals,
            is_closure,
            closure,
        });
        Ok(())
    }

    /// Leaves the current frame: the top becomes the return value, the
    /// arguments (and the closure slot, for closure frames) are discarded,
    /// and the caller's return address comes back. `None` means the sentinel
    /// frame was reached and the machine halts.
    pub fn epilogue(&mut self) -> Result<Option<u32>> {
        let Some(frame) = self.frames.pop() else {
            return Ok(None);
        };
        let result = self.pop()?;
        let floor = if frame.is_closure {
            frame.arg_base - 1
        } else {
            frame.arg_base
        };
        self.values.truncate(floor);
        self.push(result)?;
        Ok(frame.return_addr)
    }

    pub fn resolve(&self, kind: VarKind, index: u32) -> Result<SlotRef> {
        match kind {
            VarKind::Global => {
                ensure!(
                    (index as usize) < self.globals.len(),
                    "global index {} out of range (global area is {} words)",
                    index,
                    self.globals.len() - 1
                );
                Ok(SlotRef::Global(index))
            }
            VarKind::Local => {
                let frame = self.current_frame()?;
                ensure!(
                    index < frame.n_locals,
                    "local index {} out of range ({} locals)",
                    index,
                    frame.n_locals
                );
                Ok(SlotRef::Stack((frame.locals_base + index as usize) as u32))
            }
            VarKind::Argument => {
                let frame = self.current_frame()?;
                ensure!(
                    index < frame.n_args,
                    "argument index {} out of range ({} arguments)",
                    index,
                    frame.n_args
                );
                let slot = frame.arg_base + index as usize;
                ensure!(
                    slot < frame.locals_base,
                    "argument {} is outside the current frame",
                    index
                );
                Ok(SlotRef::Stack(slot as u32))
            }
            VarKind::Captured => {
                let frame = self.current_frame()?;
                match frame.closure {
                    Some(closure) => Ok(SlotRef::Captured { closure, index }),
                    None => bail!("the current frame has no closure"),
                }
            }
        }
    }

    pub fn load_slot(&self, slot: SlotRef, heap: &Heap) -> Result<Value> {
        match slot {
            SlotRef::Global(index) => Ok(self.globals[index as usize]),
            SlotRef::Stack(index) => match self.values.get(index as usize) {
                Some(&value) => Ok(value),
                None => bail!("stale stack reference S({})", index),
            },
            SlotRef::Captured { closure, index } => heap.captured(closure, index),
        }
    }

    pub fn store_slot(&mut self, slot: SlotRef, value: Value, heap: &mut Heap) -> Result<()> {
        match slot {
            SlotRef::Global(index) => {
                self.globals[index as usize] = value;
                Ok(())
            }
            SlotRef::Stack(index) => match self.values.get_mut(index as usize) {
                Some(cell) => {
                    *cell = value;
                    Ok(())
                }
                None => bail!("stale stack reference S({})", index),
            },
            SlotRef::Captured { closure, index } => heap.set_captured(closure, index, value),
        }
    }

    /// Every value the collector must treat as live: globals, operands, and
    /// the closure reference of each frame.
    pub fn roots(&self) -> impl Iterator<Item = Value> + '_ {
        self.globals
            .iter()
            .copied()
            .chain(self.values.iter().copied())
            .chain(
                self.frames
                    .iter()
                    .filter_map(|frame| frame.closure.map(Value::HeapRef)),
            )
    }
}
