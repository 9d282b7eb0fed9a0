use crate::bytefile::Bytefile;
use anyhow::{bail, Result};
use std::fmt::{self, Display, Formatter};

pub const OP_BEGIN: u8 = 0x52;
pub const OP_CBEGIN: u8 = 0x53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    fn from_low_nibble(low: u8) -> Result<BinOp> {
        Ok(match low {
            0x1 => BinOp::Add,
            0x2 => BinOp::Sub,
            0x3 => BinOp::Mul,
            0x4 => BinOp::Div,
            0x5 => BinOp::Rem,
            0x6 => BinOp::Lt,
            0x7 => BinOp::Le,
            0x8 => BinOp::Gt,
            0x9 => BinOp::Ge,
            0xA => BinOp::Eq,
            0xB => BinOp::Ne,
            0xC => BinOp::And,
            0xD => BinOp::Or,
            _ => bail!("unknown binary operation 0x{:x}", low),
        })
    }
}

impl Display for BinOp {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let symbol = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        };
        write!(f, "{}", symbol)
    }
}

/// The four addressable variable spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    Global,
    Local,
    Argument,
    Captured,
}

impl VarKind {
    pub fn from_byte(byte: u8) -> Result<VarKind> {
        Ok(match byte {
            0x0 => VarKind::Global,
            0x1 => VarKind::Local,
            0x2 => VarKind::Argument,
            0x3 => VarKind::Captured,
            _ => bail!("unknown variable kind 0x{:x}", byte),
        })
    }
}

impl Display for VarKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let letter = match self {
            VarKind::Global => "G",
            VarKind::Local => "L",
            VarKind::Argument => "A",
            VarKind::Captured => "C",
        };
        write!(f, "{}", letter)
    }
}

/// The pattern probes of the PATT family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    EqStr,
    String,
    Array,
    Sexp,
    Boxed,
    Unboxed,
    Closure,
}

impl Pattern {
    fn from_low_nibble(low: u8) -> Result<Pattern> {
        Ok(match low {
            0x0 => Pattern::EqStr,
            0x1 => Pattern::String,
            0x2 => Pattern::Array,
            0x3 => Pattern::Sexp,
            0x4 => Pattern::Boxed,
            0x5 => Pattern::Unboxed,
            0x6 => Pattern::Closure,
            _ => bail!("unknown pattern kind 0x{:x}", low),
        })
    }

    fn name(self) -> &'static str {
        match self {
            Pattern::EqStr => "=str",
            Pattern::String => "#string",
            Pattern::Array => "#array",
            Pattern::Sexp => "#sexp",
            Pattern::Boxed => "#ref",
            Pattern::Unboxed => "#val",
            Pattern::Closure => "#fun",
        }
    }
}

/// One instruction, decoded together with all of its immediates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Binop(BinOp),
    Const(i32),
    String { offset: u32 },
    Sexp { tag: u32, arity: u32 },
    Sti,
    Sta,
    Jmp(u32),
    End,
    Ret,
    Drop,
    Dup,
    Swap,
    Elem,
    Load(VarKind, u32),
    LoadAddr(VarKind, u32),
    Store(VarKind, u32),
    CondJmp { on_nonzero: bool, target: u32 },
    Begin { n_args: u32, n_locals: u32 },
    CBegin { n_args: u32, n_locals: u32 },
    Closure { entry: u32, captures: Vec<(VarKind, u32)> },
    CallClosure { n_args: u32 },
    Call { target: u32, n_args: u32 },
    Tag { name: u32, arity: u32 },
    Array(u32),
    Fail,
    Line(u32),
    Patt(Pattern),
    CallRead,
    CallWrite,
    CallLength,
    CallString,
    CallBarray(u32),
}

impl Instruction {
    /// Decodes the opcode byte and every immediate at the cursor. Unknown
    /// bytes and truncated immediates fail here, before any handler runs.
    pub fn decode(bytefile: &mut Bytefile) -> Result<Instruction> {
        let byte = bytefile.next_u8()?;
        let low = byte & 0x0F;
        Ok(match byte {
            0x01..=0x0D => Instruction::Binop(BinOp::from_low_nibble(low)?),
            0x10 => Instruction::Const(bytefile.next_i32()?),
            0x11 => Instruction::String {
                offset: bytefile.next_u32()?,
            },
            0x12 => Instruction::Sexp {
                tag: bytefile.next_u32()?,
                arity: bytefile.next_u32()?,
            },
            0x13 => Instruction::Sti,
            0x14 => Instruction::Sta,
            0x15 => Instruction::Jmp(bytefile.next_u32()?),
            0x16 => Instruction::End,
            0x17 => Instruction::Ret,
            0x18 => Instruction::Drop,
            0x19 => Instruction::Dup,
            0x1A => Instruction::Swap,
            0x1B => Instruction::Elem,
            0x20..=0x23 => {
                Instruction::Load(VarKind::from_byte(low)?, bytefile.next_u32()?)
            }
            0x30..=0x33 => {
                Instruction::LoadAddr(VarKind::from_byte(low)?, bytefile.next_u32()?)
            }
            0x40..=0x43 => {
                Instruction::Store(VarKind::from_byte(low)?, bytefile.next_u32()?)
            }
            0x50 | 0x51 => Instruction::CondJmp {
                on_nonzero: low == 0x1,
                target: bytefile.next_u32()?,
            },
            0x52 => Instruction::Begin {
                n_args: bytefile.next_u32()?,
                n_locals: bytefile.next_u32()?,
            },
            0x53 => Instruction::CBegin {
                n_args: bytefile.next_u32()?,
                n_locals: bytefile.next_u32()?,
            },
            0x54 => {
                let entry = bytefile.next_u32()?;
                let n = bytefile.next_u32()?;
                let captures = bytefile
                    .closure_args(n)?
                    .into_iter()
                    .map(|(kind, index)| Ok((VarKind::from_byte(kind)?, index)))
                    .collect::<Result<Vec<_>>>()?;
                Instruction::Closure { entry, captures }
            }
            0x55 => Instruction::CallClosure {
                n_args: bytefile.next_u32()?,
            },
            0x56 => Instruction::Call {
                target: bytefile.next_u32()?,
                n_args: bytefile.next_u32()?,
            },
            0x57 => Instruction::Tag {
                name: bytefile.next_u32()?,
                arity: bytefile.next_u32()?,
            },
            0x58 => Instruction::Array(bytefile.next_u32()?),
            0x59 => Instruction::Fail,
            0x5A => Instruction::Line(bytefile.next_u32()?),
            0x60..=0x66 => Instruction::Patt(Pattern::from_low_nibble(low)?),
            0x70 => Instruction::CallRead,
            0x71 => Instruction::CallWrite,
            0x72 => Instruction::CallLength,
            0x73 => Instruction::CallString,
            0x74 => Instruction::CallBarray(bytefile.next_u32()?),
            _ => bail!("unknown opcode 0x{:02x}", byte),
        })
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Instruction::Binop(op) => write!(f, "BINOP {}", op),
            Instruction::Const(value) => write!(f, "CONST {}", value),
            Instruction::String { offset } => write!(f, "STRING {}", offset),
            Instruction::Sexp { tag, arity } => write!(f, "SEXP {} {}", tag, arity),
            Instruction::Sti => write!(f, "STI"),
            Instruction::Sta => write!(f, "STA"),
            Instruction::Jmp(target) => write!(f, "JMP 0x{:04x}", target),
            Instruction::End => write!(f, "END"),
            Instruction::Ret => write!(f, "RET"),
            Instruction::Drop => write!(f, "DROP"),
            Instruction::Dup => write!(f, "DUP"),
            Instruction::Swap => write!(f, "SWAP"),
            Instruction::Elem => write!(f, "ELEM"),
            Instruction::Load(kind, index) => write!(f, "LD {}({})", kind, index),
            Instruction::LoadAddr(kind, index) => write!(f, "LDA {}({})", kind, index),
            Instruction::Store(kind, index) => write!(f, "ST {}({})", kind, index),
            Instruction::CondJmp { on_nonzero, target } => {
                let suffix = if *on_nonzero { "nz" } else { "z" };
                write!(f, "CJMP{} 0x{:04x}", suffix, target)
            }
            Instruction::Begin { n_args, n_locals } => {
                write!(f, "BEGIN {} {}", n_args, n_locals)
            }
            Instruction::CBegin { n_args, n_locals } => {
                write!(f, "CBEGIN {} {}", n_args, n_locals)
            }
            Instruction::Closure { entry, captures } => {
                write!(f, "CLOSURE 0x{:04x}", entry)?;
                for (kind, index) in captures {
                    write!(f, " {}({})", kind, index)?;
                }
                Ok(())
            }
            Instruction::CallClosure { n_args } => write!(f, "CALLC {}", n_args),
            Instruction::Call { target, n_args } => {
                write!(f, "CALL 0x{:04x} {}", target, n_args)
            }
            Instruction::Tag { name, arity } => write!(f, "TAG {} {}", name, arity),
            Instruction::Array(size) => write!(f, "ARRAY {}", size),
            Instruction::Fail => write!(f, "FAIL"),
            Instruction::Line(line) => write!(f, "LINE {}", line),
            Instruction::Patt(pattern) => write!(f, "PATT {}", pattern.name()),
            Instruction::CallRead => write!(f, "CALL Lread"),
            Instruction::CallWrite => write!(f, "CALL Lwrite"),
            Instruction::CallLength => write!(f, "CALL Llength"),
            Instruction::CallString => write!(f, "CALL Lstring"),
            Instruction::CallBarray(n) => write!(f, "CALL Barray {}", n),
        }
    }
}

/// Mnemonic of an opcode byte, for diagnostics that cannot rely on a
/// successful decode.
pub fn opcode_name(byte: u8) -> &'static str {
    match byte {
        0x01..=0x0D => "BINOP",
        0x10 => "CONST",
        0x11 => "STRING",
        0x12 => "SEXP",
        0x13 => "STI",
        0x14 => "STA",
        0x15 => "JMP",
        0x16 => "END",
        0x17 => "RET",
        0x18 => "DROP",
        0x19 => "DUP",
        0x1A => "SWAP",
        0x1B => "ELEM",
        0x20..=0x23 => "LD",
        0x30..=0x33 => "LDA",
        0x40..=0x43 => "ST",
        0x50 => "CJMPz",
        0x51 => "CJMPnz",
        0x52 => "BEGIN",
        0x53 => "CBEGIN",
        0x54 => "CLOSURE",
        0x55 => "CALLC",
        0x56 => "CALL",
        0x57 => "TAG",
        0x58 => "ARRAY",
        0x59 => "FAIL",
        0x5A => "LINE",
        0x60..=0x66 => "PATT",
        0x70 => "CALL Lread",
        0x71 => "CALL Lwrite",
        0x72 => "CALL Llength",
        0x73 => "CALL Lstring",
        0x74 => "CALL Barray",
        _ => "UNKNOWN",
    }
}
