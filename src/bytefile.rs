use anyhow::{bail, ensure, Context, Result};
use std::fs;
use std::path::Path;

const HEADER_SIZE: usize = 12;

/// A loaded bytecode image.
///
/// The on-disk layout is three little-endian u32 counters (string pool bytes,
/// global area words, public symbol pairs), the public symbol table, the
/// string pool, and the remainder of the file as bytecode. The regions are
/// immutable after load; only the program cursor and the source-line
/// annotation move.
#[derive(Debug)]
pub struct Bytefile {
    string_pool: Vec<u8>,
    public_symbols: Vec<u32>,
    bytecode: Vec<u8>,
    global_area_size: u32,
    ip: usize,
    file_line: u32,
}

impl Bytefile {
    pub fn load(path: impl AsRef<Path>) -> Result<Bytefile> {
        let path = path.as_ref();
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read file: {}", path.display()))?;
        Self::parse(bytes)
            .with_context(|| format!("invalid bytecode image: {}", path.display()))
    }

    pub fn parse(bytes: Vec<u8>) -> Result<Bytefile> {
        ensure!(
            bytes.len() >= HEADER_SIZE,
            "file is {} bytes, shorter than the {}-byte header",
            bytes.len(),
            HEADER_SIZE
        );

        let string_pool_size = read_u32_at(&bytes, 0) as usize;
        let global_area_size = read_u32_at(&bytes, 4);
        let public_symbols_count = read_u32_at(&bytes, 8) as usize;
        let symbols_size = public_symbols_count
            .checked_mul(8)
            .unwrap_or(usize::MAX);

        let mut errors = Vec::new();
        let symbols_end = HEADER_SIZE.saturating_add(symbols_size);
        if symbols_end > bytes.len() {
            errors.push(format!(
                "public symbol table wants {} bytes, but only {} remain after the header",
                symbols_size,
                bytes.len() - HEADER_SIZE
            ));
        }
        let pool_end = symbols_end.saturating_add(string_pool_size);
        if symbols_end <= bytes.len() && pool_end > bytes.len() {
            errors.push(format!(
                "string pool wants {} bytes, but only {} remain after the symbol table",
                string_pool_size,
                bytes.len() - symbols_end
            ));
        }
        if pool_end >= bytes.len() {
            errors.push("bytecode region is empty".to_string());
        }
        if !errors.is_empty() {
            bail!("malformed image:\n  {}", errors.join("\n  "));
        }

        let public_symbols = bytes[HEADER_SIZE..symbols_end]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(Bytefile {
            string_pool: bytes[symbols_end..pool_end].to_vec(),
            public_symbols,
            bytecode: bytes[pool_end..].to_vec(),
            global_area_size,
            ip: 0,
            file_line: 0,
        })
    }

    pub fn global_area_size(&self) -> u32 {
        self.global_area_size
    }

    pub fn public_symbols(&self) -> &[u32] {
        &self.public_symbols
    }

    pub fn code_len(&self) -> usize {
        self.bytecode.len()
    }

    /// Current cursor offset into the bytecode.
    pub fn position(&self) -> usize {
        self.ip
    }

    pub fn line(&self) -> u32 {
        self.file_line
    }

    pub fn set_line(&mut self, line: u32) {
        self.file_line = line;
    }

    pub fn enough(&self, n: usize) -> bool {
        self.bytecode.len() - self.ip >= n
    }

    pub fn next_u8(&mut self) -> Result<u8> {
        let Some(&byte) = self.bytecode.get(self.ip) else {
            bail!("bytecode ends at 0x{:04x}", self.ip);
        };
        self.ip += 1;
        Ok(byte)
    }

    pub fn peek_u8(&self) -> Result<u8> {
        match self.bytecode.get(self.ip) {
            Some(&byte) => Ok(byte),
            None => bail!("bytecode ends at 0x{:04x}", self.ip),
        }
    }

    pub fn next_u32(&mut self) -> Result<u32> {
        ensure!(
            self.enough(4),
            "truncated operand at 0x{:04x}: wanted 4 bytes, {} remain",
            self.ip,
            self.bytecode.len() - self.ip
        );
        let word = read_u32_at(&self.bytecode, self.ip);
        self.ip += 4;
        Ok(word)
    }

    pub fn next_i32(&mut self) -> Result<i32> {
        Ok(self.next_u32()? as i32)
    }

    /// The null-terminated string starting at `offset` in the string pool.
    pub fn read_string(&self, offset: u32) -> Result<&str> {
        let start = offset as usize;
        ensure!(
            start < self.string_pool.len(),
            "string offset {} is outside the {}-byte string pool",
            offset,
            self.string_pool.len()
        );
        let tail = &self.string_pool[start..];
        let Some(end) = tail.iter().position(|&byte| byte == 0) else {
            bail!("string at offset {} is not null-terminated", offset);
        };
        std::str::from_utf8(&tail[..end])
            .with_context(|| format!("string at offset {} is not valid utf-8", offset))
    }

    /// Reads a u32 pool offset, then dereferences it.
    pub fn read_next_string(&mut self) -> Result<&str> {
        let offset = self.next_u32()?;
        self.read_string(offset)
    }

    /// Reads `n` closure-capture entries, each one variable-kind byte plus a
    /// four-byte index. The entries are packed with no alignment.
    pub fn closure_args(&mut self, n: u32) -> Result<Vec<(u8, u32)>> {
        let wanted = (n as usize).checked_mul(5).unwrap_or(usize::MAX);
        ensure!(
            self.enough(wanted),
            "truncated closure capture list at 0x{:04x}: wanted {} bytes, {} remain",
            self.ip,
            wanted,
            self.bytecode.len() - self.ip
        );
        let mut entries = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let kind = self.bytecode[self.ip];
            let index = read_u32_at(&self.bytecode, self.ip + 1);
            entries.push((kind, index));
            self.ip += 5;
        }
        Ok(entries)
    }

    pub fn set_absolute(&mut self, addr: u32) -> Result<()> {
        ensure!(
            (addr as usize) < self.bytecode.len(),
            "address 0x{:04x} is outside bytecode ({} bytes)",
            addr,
            self.bytecode.len()
        );
        self.ip = addr as usize;
        Ok(())
    }

    /// The opcode byte at an absolute address, without moving the cursor.
    pub fn byte_at(&self, addr: u32) -> Result<u8> {
        match self.bytecode.get(addr as usize) {
            Some(&byte) => Ok(byte),
            None => bail!(
                "address 0x{:04x} is outside bytecode ({} bytes)",
                addr,
                self.bytecode.len()
            ),
        }
    }
}

fn read_u32_at(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn image(pool: &[u8], globals: u32, symbols: &[u32], code: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(pool.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&globals.to_le_bytes());
        bytes.extend_from_slice(&((symbols.len() / 2) as u32).to_le_bytes());
        for symbol in symbols {
            bytes.extend_from_slice(&symbol.to_le_bytes());
        }
        bytes.extend_from_slice(pool);
        bytes.extend_from_slice(code);
        bytes
    }

    #[test]
    fn test_parse_regions() -> Result<()> {
        let bytes = image(b"hello\0", 3, &[7, 9], &[0x16, 0x10]);
        let bytefile = Bytefile::parse(bytes)?;
        assert_eq!(bytefile.global_area_size(), 3);
        assert_eq!(bytefile.public_symbols(), &[7, 9]);
        assert_eq!(bytefile.code_len(), 2);
        assert_eq!(bytefile.read_string(0)?, "hello");
        Ok(())
    }

    #[test]
    fn test_load_from_path() -> Result<()> {
        let bytes = image(b"", 0, &[], &[0x16]);
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&bytes)?;
        let bytefile = Bytefile::load(file.path())?;
        assert_eq!(bytefile.code_len(), 1);
        Ok(())
    }

    #[test]
    fn test_load_missing_file() {
        let error = Bytefile::load("/no/such/image.bc").unwrap_err();
        assert!(error.to_string().contains("failed to read file"));
    }

    #[test]
    fn test_truncated_header() {
        let error = Bytefile::parse(vec![1, 2, 3]).unwrap_err();
        assert!(error.to_string().contains("shorter"));
    }

    #[test]
    fn test_empty_bytecode_fails() {
        let bytes = image(b"x\0", 0, &[], &[]);
        let error = Bytefile::parse(bytes).unwrap_err();
        assert!(error.to_string().contains("bytecode region is empty"));
    }

    #[test]
    fn test_oversized_symbol_table_fails() {
        let mut bytes = image(b"", 0, &[], &[0x16]);
        bytes[8..12].copy_from_slice(&u32::MAX.to_le_bytes());
        let error = Bytefile::parse(bytes).unwrap_err();
        assert!(error.to_string().contains("public symbol table"));
    }

    #[test]
    fn test_oversized_string_pool_fails() {
        let mut bytes = image(b"ab\0", 0, &[], &[0x16]);
        bytes[0..4].copy_from_slice(&1000u32.to_le_bytes());
        let error = Bytefile::parse(bytes).unwrap_err();
        assert!(error.to_string().contains("string pool"));
    }

    #[test]
    fn test_cursor_reads() -> Result<()> {
        let code = [0x10, 0xFE, 0xFF, 0xFF, 0xFF, 0x42];
        let mut bytefile = Bytefile::parse(image(b"", 0, &[], &code))?;
        assert_eq!(bytefile.peek_u8()?, 0x10);
        assert_eq!(bytefile.next_u8()?, 0x10);
        assert_eq!(bytefile.next_i32()?, -2);
        assert_eq!(bytefile.position(), 5);
        assert_eq!(bytefile.next_u8()?, 0x42);
        assert!(bytefile.next_u8().is_err());
        assert!(bytefile.peek_u8().is_err());
        Ok(())
    }

    #[test]
    fn test_truncated_operand() -> Result<()> {
        let mut bytefile = Bytefile::parse(image(b"", 0, &[], &[0x10, 0x01]))?;
        bytefile.next_u8()?;
        let error = bytefile.next_u32().unwrap_err();
        assert!(error.to_string().contains("truncated"));
        Ok(())
    }

    #[test]
    fn test_read_next_string() -> Result<()> {
        let code = [4, 0, 0, 0];
        let mut bytefile = Bytefile::parse(image(b"one\0two\0", 0, &[], &code))?;
        assert_eq!(bytefile.read_next_string()?, "two");
        Ok(())
    }

    #[test]
    fn test_read_string_out_of_range() -> Result<()> {
        let bytefile = Bytefile::parse(image(b"ab\0", 0, &[], &[0x16]))?;
        assert!(bytefile.read_string(3).is_err());
        Ok(())
    }

    #[test]
    fn test_read_string_unterminated() {
        let mut bytes = image(b"", 0, &[], &[0x16]);
        bytes[0..4].copy_from_slice(&1u32.to_le_bytes());
        bytes.insert(12, b'a');
        bytes.push(0x16);
        let bytefile = Bytefile::parse(bytes).unwrap();
        assert!(bytefile
            .read_string(0)
            .unwrap_err()
            .to_string()
            .contains("null-terminated"));
    }

    #[test]
    fn test_closure_args() -> Result<()> {
        let code = [0x54, 1, 5, 0, 0, 0, 3, 2, 0, 0, 0, 0x16];
        let mut bytefile = Bytefile::parse(image(b"", 0, &[], &code))?;
        bytefile.next_u8()?;
        let entries = bytefile.closure_args(2)?;
        assert_eq!(entries, vec![(1, 5), (3, 2)]);
        assert_eq!(bytefile.next_u8()?, 0x16);
        Ok(())
    }

    #[test]
    fn test_set_absolute_bounds() -> Result<()> {
        let mut bytefile = Bytefile::parse(image(b"", 0, &[], &[0x16, 0x17]))?;
        bytefile.set_absolute(1)?;
        assert_eq!(bytefile.position(), 1);
        let error = bytefile.set_absolute(2).unwrap_err();
        assert!(error.to_string().contains("outside bytecode"));
        Ok(())
    }

    #[test]
    fn test_byte_at() -> Result<()> {
        let bytefile = Bytefile::parse(image(b"", 0, &[], &[0x52, 0x16]))?;
        assert_eq!(bytefile.byte_at(0)?, 0x52);
        assert!(bytefile.byte_at(2).is_err());
        Ok(())
    }
}
