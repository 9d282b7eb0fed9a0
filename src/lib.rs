mod bytefile;
mod heap;
mod opcode;
mod stack;
mod value;
mod vm;

pub use self::{bytefile::*, heap::*, opcode::*, stack::*, value::*, vm::*};

/// Hash of an s-expression constructor name, in boxed form. The SEXP opcode
/// stamps the unboxed hash on the object and TAG compares against it; all
/// the opcodes observe is that the two agree.
pub fn tag_hash(name: &str) -> i32 {
    let mut hash: u32 = 0;
    for &byte in name.as_bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u32) & 0x3FFF_FFFF;
    }
    box_int(hash as i32)
}
