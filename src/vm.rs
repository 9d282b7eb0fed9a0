use crate::bytefile::Bytefile;
use crate::heap::{Heap, HeapObject};
use crate::opcode::{opcode_name, BinOp, Instruction, Pattern, OP_BEGIN, OP_CBEGIN};
use crate::stack::{EvalStack, PendingCall};
use crate::tag_hash;
use crate::value::{unbox_int, Value};
use anyhow::{bail, ensure, Context, Result};
use std::io::{BufRead, Write};

enum Step {
    Continue,
    Stop,
}

/// The interpreter: the loaded image, the evaluation stack, the managed
/// heap, and the I/O the built-in calls talk to.
pub struct Machine<'io> {
    bytefile: Bytefile,
    stack: EvalStack,
    heap: Heap,
    pending: Option<PendingCall>,
    input: Box<dyn BufRead + 'io>,
    output: Box<dyn Write + 'io>,
}

impl Machine<'static> {
    pub fn new(bytefile: Bytefile) -> Result<Self> {
        Self::with_io(
            bytefile,
            std::io::BufReader::new(std::io::stdin()),
            std::io::stdout(),
        )
    }
}

impl<'io> Machine<'io> {
    pub fn with_io(
        bytefile: Bytefile,
        input: impl BufRead + 'io,
        output: impl Write + 'io,
    ) -> Result<Self> {
        let stack = EvalStack::new(bytefile.global_area_size())?;
        Ok(Self {
            bytefile,
            stack,
            heap: Heap::new(),
            pending: None,
            input: Box::new(input),
            output: Box::new(output),
        })
    }

    /// Fetch, decode, execute until the sentinel frame returns or a handler
    /// fails. The failure diagnostic carries the most recent LINE annotation
    /// and the offset and mnemonic of the failing instruction.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let at = self.bytefile.position();
            let step = self.step().with_context(|| self.diagnose(at))?;
            match step {
                Step::Continue => {}
                Step::Stop => return Ok(()),
            }
        }
    }

    fn diagnose(&self, at: usize) -> String {
        let name = self
            .bytefile
            .byte_at(at as u32)
            .map(opcode_name)
            .unwrap_or("UNKNOWN");
        if self.bytefile.line() == 0 {
            format!("while interpreting 0x{:04x}: {}", at, name)
        } else {
            format!(
                "while interpreting line {}, 0x{:04x}: {}",
                self.bytefile.line(),
                at,
                name
            )
        }
    }

    fn step(&mut self) -> Result<Step> {
        let instruction = Instruction::decode(&mut self.bytefile)?;
        match instruction {
            Instruction::Binop(op) => {
                let rhs = self.pop_int()?;
                let lhs = self.pop_int()?;
                self.stack.push(Value::Int(binop(op, lhs, rhs)?))?;
            }
            Instruction::Const(value) => {
                self.stack.push(Value::Int(value))?;
            }
            Instruction::String { offset } => {
                let bytes = self.bytefile.read_string(offset)?.as_bytes().to_vec();
                let handle = self.alloc(HeapObject::Str(bytes));
                self.stack.push(Value::HeapRef(handle))?;
            }
            Instruction::Sexp { tag, arity } => {
                let name = self.bytefile.read_string(tag)?.to_owned();
                let hash = unbox_int(tag_hash(&name));
                let fields = self.pop_many(arity)?;
                let handle = self.alloc(HeapObject::Sexp {
                    tag: hash,
                    name,
                    fields,
                });
                self.stack.push(Value::HeapRef(handle))?;
            }
            Instruction::Sti => bail!("unused opcode STI"),
            Instruction::Sta => {
                let value = self.stack.pop()?;
                let index = self.stack.pop()?;
                let container = self.stack.pop()?;
                let result = match index {
                    // An address pushed by LDA; the container operand is its
                    // duplicate and carries no information.
                    Value::Slot(slot) => {
                        self.stack.store_slot(slot, value, &mut self.heap)?;
                        value
                    }
                    Value::Int(index) => self.heap.sta(container, index, value)?,
                    other => bail!("store index is {}, not an integer or address", other),
                };
                self.stack.push(result)?;
            }
            Instruction::Jmp(target) => {
                self.bytefile.set_absolute(target)?;
            }
            Instruction::End | Instruction::Ret => match self.stack.epilogue()? {
                Some(addr) => self.bytefile.set_absolute(addr)?,
                None => return Ok(Step::Stop),
            },
            Instruction::Drop => {
                self.stack.pop()?;
            }
            Instruction::Dup => {
                let top = self.stack.top()?;
                self.stack.push(top)?;
            }
            Instruction::Swap => {
                let first = self.stack.pop()?;
                let second = self.stack.pop()?;
                self.stack.push(first)?;
                self.stack.push(second)?;
            }
            Instruction::Elem => {
                let index = self.pop_int()?;
                let container = self.stack.pop()?;
                let element = self.heap.elem(container, index)?;
                self.stack.push(element)?;
            }
            Instruction::Load(kind, index) => {
                let slot = self.stack.resolve(kind, index)?;
                let value = self.stack.load_slot(slot, &self.heap)?;
                self.stack.push(value)?;
            }
            Instruction::LoadAddr(kind, index) => {
                let slot = self.stack.resolve(kind, index)?;
                self.stack.push(Value::Slot(slot))?;
                self.stack.push(Value::Slot(slot))?;
            }
            Instruction::Store(kind, index) => {
                let value = self.stack.top()?;
                let slot = self.stack.resolve(kind, index)?;
                self.stack.store_slot(slot, value, &mut self.heap)?;
            }
            Instruction::CondJmp { on_nonzero, target } => {
                let value = self.pop_int()?;
                if (value != 0) == on_nonzero {
                    self.bytefile.set_absolute(target)?;
                }
            }
            Instruction::Begin { n_args, n_locals }
            | Instruction::CBegin { n_args, n_locals } => {
                let pending = self.pending.take();
                self.stack.prologue(pending, n_args, n_locals)?;
            }
            Instruction::Closure { entry, captures } => {
                let mut captured = Vec::with_capacity(captures.len());
                for (kind, index) in captures {
                    let slot = self.stack.resolve(kind, index)?;
                    captured.push(self.stack.load_slot(slot, &self.heap)?);
                }
                let handle = self.alloc(HeapObject::Closure { entry, captured });
                self.stack.push(Value::HeapRef(handle))?;
            }
            Instruction::CallClosure { n_args } => {
                let target = self.stack.peek(n_args as usize)?;
                let Value::HeapRef(handle) = target else {
                    bail!("closure call target is {}, not a closure", target);
                };
                let entry = self.heap.closure_entry(handle)?;
                let entry_op = self.bytefile.byte_at(entry)?;
                ensure!(
                    entry_op == OP_BEGIN || entry_op == OP_CBEGIN,
                    "closure entry 0x{:04x} starts with {}, not BEGIN or CBEGIN",
                    entry,
                    opcode_name(entry_op)
                );
                self.pending = Some(PendingCall {
                    return_addr: self.bytefile.position() as u32,
                    is_closure: true,
                });
                self.bytefile.set_absolute(entry)?;
            }
            Instruction::Call { target, n_args: _ } => {
                let entry_op = self.bytefile.byte_at(target)?;
                ensure!(
                    entry_op == OP_BEGIN,
                    "call target 0x{:04x} starts with {}, not BEGIN",
                    target,
                    opcode_name(entry_op)
                );
                self.pending = Some(PendingCall {
                    return_addr: self.bytefile.position() as u32,
                    is_closure: false,
                });
                self.bytefile.set_absolute(target)?;
            }
            Instruction::Tag { name, arity } => {
                let name = self.bytefile.read_string(name)?;
                let hash = unbox_int(tag_hash(name));
                let value = self.stack.pop()?;
                let matched = self.heap.tag_probe(value, hash, arity);
                self.stack.push(Value::from(matched))?;
            }
            Instruction::Array(size) => {
                let value = self.stack.pop()?;
                let matched = self.heap.array_probe(value, size);
                self.stack.push(Value::from(matched))?;
            }
            Instruction::Fail => {
                let first = self.stack.pop()?;
                let second = self.stack.pop()?;
                bail!("failure: {}, {}", first, second);
            }
            Instruction::Line(line) => {
                self.bytefile.set_line(line);
            }
            Instruction::Patt(pattern) => {
                let matched = match pattern {
                    Pattern::EqStr => {
                        let lhs = self.stack.pop()?;
                        let rhs = self.stack.pop()?;
                        self.heap.string_eq(lhs, rhs)
                    }
                    Pattern::String => self.heap.is_string(self.stack.pop()?),
                    Pattern::Array => self.heap.is_array(self.stack.pop()?),
                    Pattern::Sexp => self.heap.is_sexp(self.stack.pop()?),
                    Pattern::Boxed => {
                        matches!(self.stack.pop()?, Value::HeapRef(_))
                    }
                    Pattern::Unboxed => self.stack.pop()?.is_boxed_int(),
                    Pattern::Closure => self.heap.is_closure(self.stack.pop()?),
                };
                self.stack.push(Value::from(matched))?;
            }
            Instruction::CallRead => {
                write!(self.output, "> ")?;
                self.output.flush()?;
                let mut line = String::new();
                self.input.read_line(&mut line)?;
                let trimmed = line.trim();
                let value: i32 = trimmed
                    .parse()
                    .with_context(|| format!("invalid integer input {:?}", trimmed))?;
                self.stack.push(Value::Int(value))?;
            }
            Instruction::CallWrite => {
                let value = self.pop_int()?;
                writeln!(self.output, "{}", value)?;
                self.stack.push(Value::Int(0))?;
            }
            Instruction::CallLength => {
                let container = self.stack.pop()?;
                let length = self.heap.length(container)?;
                self.stack.push(Value::Int(length))?;
            }
            Instruction::CallString => {
                let value = self.stack.pop()?;
                let rendered = self.heap.render(value)?;
                let handle = self.alloc(HeapObject::Str(rendered.into_bytes()));
                self.stack.push(Value::HeapRef(handle))?;
            }
            Instruction::CallBarray(n) => {
                let fields = self.pop_many(n)?;
                let handle = self.alloc(HeapObject::Array(fields));
                self.stack.push(Value::HeapRef(handle))?;
            }
        }
        Ok(Step::Continue)
    }

    fn pop_int(&mut self) -> Result<i32> {
        match self.stack.pop()? {
            Value::Int(value) => Ok(value),
            other => bail!("expected a boxed integer, found {}", other),
        }
    }

    /// Pops `n` values; the topmost lands in the last slot.
    fn pop_many(&mut self, n: u32) -> Result<Vec<Value>> {
        let mut fields = vec![Value::Int(0); n as usize];
        for index in (0..n as usize).rev() {
            fields[index] = self.stack.pop()?;
        }
        Ok(fields)
    }

    /// Every allocation point may trigger a collection first; the operand
    /// stack holds only typed values, so the roots are always classifiable.
    fn alloc(&mut self, object: HeapObject) -> u32 {
        if self.heap.should_collect() {
            self.heap.collect(self.stack.roots());
        }
        match object {
            HeapObject::Str(bytes) => self.heap.alloc_string(&bytes),
            HeapObject::Array(fields) => self.heap.alloc_array(fields),
            HeapObject::Sexp { tag, name, fields } => {
                self.heap.alloc_sexp(tag, &name, fields)
            }
            HeapObject::Closure { entry, captured } => {
                self.heap.alloc_closure(entry, captured)
            }
            HeapObject::Free => unreachable!(),
        }
    }
}

fn binop(op: BinOp, lhs: i32, rhs: i32) -> Result<i32> {
    Ok(match op {
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::Div => {
            ensure!(rhs != 0, "division by zero");
            lhs.wrapping_div(rhs)
        }
        BinOp::Rem => {
            ensure!(rhs != 0, "division by zero");
            lhs.wrapping_rem(rhs)
        }
        BinOp::Lt => (lhs < rhs) as i32,
        BinOp::Le => (lhs <= rhs) as i32,
        BinOp::Gt => (lhs > rhs) as i32,
        BinOp::Ge => (lhs >= rhs) as i32,
        BinOp::Eq => (lhs == rhs) as i32,
        BinOp::Ne => (lhs != rhs) as i32,
        BinOp::And => (lhs != 0 && rhs != 0) as i32,
        BinOp::Or => (lhs != 0 || rhs != 0) as i32,
    })
}
