//! Binary delta codec
//!
//! `diff` produces an edit script turning an old byte sequence into a new one;
//! `patch` replays it. Matching follows the rsync scheme: the old buffer is cut
//! into fixed `BLOCK_SIZE` blocks indexed by a rolling weak checksum, and the
//! new buffer is scanned byte by byte looking for verified block hits.
//!
//! Script layout (all integers are unsigned LEB128 varints):
//!
//! ```text
//! varint(new_len)
//! 0x01 varint(offset) varint(len)    copy `len` bytes of old starting at `offset`
//! 0x02 varint(len) <len bytes>       insert literal bytes
//! ```

use std::collections::HashMap;

use crate::error::{Result, VcsError};

/// Block size used to index the old buffer. Changing it changes the size of
/// produced scripts and therefore the diff/full storage decision.
pub const BLOCK_SIZE: usize = 32;

/// Candidate old offsets remembered per weak checksum
const MAX_CANDIDATES: usize = 8;

const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;

/// Encoded edit script
pub type EditScript = Vec<u8>;

/// Decoded script instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    Copy { offset: usize, len: usize },
    Insert(&'a [u8]),
}

/// Compute an edit script reconstructing `new` from `old`
pub fn diff(old: &[u8], new: &[u8]) -> EditScript {
    let mut encoder = ScriptEncoder::new(new.len());

    if old.len() < BLOCK_SIZE || new.len() < BLOCK_SIZE {
        encoder.insert(new);
        return encoder.finish();
    }

    let index = BlockIndex::build(old);
    let mut literal_start = 0;
    let mut pos = 0;
    let mut checksum = RollingChecksum::new(&new[..BLOCK_SIZE]);

    while pos + BLOCK_SIZE <= new.len() {
        if let Some((old_offset, forward_len)) = index.best_match(old, new, pos, checksum.value()) {
            // Pull the match back over bytes still pending as literal.
            let mut start_new = pos;
            let mut start_old = old_offset;
            while start_new > literal_start && start_old > 0 && new[start_new - 1] == old[start_old - 1] {
                start_new -= 1;
                start_old -= 1;
            }

            encoder.insert(&new[literal_start..start_new]);
            let end = pos + forward_len;
            encoder.copy(start_old, end - start_new);

            pos = end;
            literal_start = end;
            if pos + BLOCK_SIZE <= new.len() {
                checksum = RollingChecksum::new(&new[pos..pos + BLOCK_SIZE]);
            }
            continue;
        }

        if pos + BLOCK_SIZE < new.len() {
            checksum.roll(new[pos], new[pos + BLOCK_SIZE]);
        }
        pos += 1;
    }

    encoder.insert(&new[literal_start..]);
    encoder.finish()
}

/// Apply an edit script produced by [`diff`] to `old`
///
/// The result is only returned once the whole script has been validated and
/// replayed; a malformed script never yields partial output.
pub fn patch(old: &[u8], script: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ScriptReader::new(script);
    let target_len = reader.read_len()?;

    // The declared length is untrusted until the output matches it.
    let mut out = Vec::with_capacity(target_len.min(old.len().saturating_add(script.len())));

    while !reader.is_empty() {
        match reader.next_instruction()? {
            Instruction::Copy { offset, len } => {
                let end = offset
                    .checked_add(len)
                    .ok_or_else(|| corrupt("copy range overflows"))?;
                if end > old.len() {
                    return Err(corrupt(format!(
                        "copy {}..{} outside base of {} bytes",
                        offset,
                        end,
                        old.len()
                    )));
                }
                out.extend_from_slice(&old[offset..end]);
            }
            Instruction::Insert(bytes) => out.extend_from_slice(bytes),
        }
        if out.len() > target_len {
            return Err(corrupt("output exceeds declared length"));
        }
    }

    if out.len() != target_len {
        return Err(corrupt(format!(
            "output has {} bytes, script declares {}",
            out.len(),
            target_len
        )));
    }
    Ok(out)
}

/// Decode a script into its declared output length and instruction list
pub fn instructions(script: &[u8]) -> Result<(usize, Vec<Instruction<'_>>)> {
    let mut reader = ScriptReader::new(script);
    let target_len = reader.read_len()?;
    let mut list = Vec::new();
    while !reader.is_empty() {
        list.push(reader.next_instruction()?);
    }
    Ok((target_len, list))
}

fn corrupt(msg: impl Into<String>) -> VcsError {
    VcsError::CorruptPatch(msg.into())
}

/// rsync weak checksum over a fixed window
#[derive(Debug, Clone, Copy)]
struct RollingChecksum {
    a: u32,
    b: u32,
    window: u32,
}

impl RollingChecksum {
    fn new(block: &[u8]) -> Self {
        let window = block.len() as u32;
        let mut a = 0u32;
        let mut b = 0u32;
        for (i, &byte) in block.iter().enumerate() {
            a = a.wrapping_add(byte as u32);
            b = b.wrapping_add((window - i as u32) * byte as u32);
        }
        Self {
            a: a & 0xffff,
            b: b & 0xffff,
            window,
        }
    }

    fn roll(&mut self, out: u8, incoming: u8) {
        self.a = self.a.wrapping_sub(out as u32).wrapping_add(incoming as u32) & 0xffff;
        self.b = self
            .b
            .wrapping_sub(self.window.wrapping_mul(out as u32))
            .wrapping_add(self.a)
            & 0xffff;
    }

    fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }
}

/// Weak checksum -> block offsets in the old buffer
struct BlockIndex {
    blocks: HashMap<u32, Vec<usize>>,
}

impl BlockIndex {
    fn build(old: &[u8]) -> Self {
        let mut blocks: HashMap<u32, Vec<usize>> = HashMap::with_capacity(old.len() / BLOCK_SIZE);
        let mut offset = 0;
        while offset + BLOCK_SIZE <= old.len() {
            let key = RollingChecksum::new(&old[offset..offset + BLOCK_SIZE]).value();
            let slot = blocks.entry(key).or_default();
            if slot.len() < MAX_CANDIDATES {
                slot.push(offset);
            }
            offset += BLOCK_SIZE;
        }
        Self { blocks }
    }

    /// Longest verified match for the block of `new` at `pos`, as
    /// `(old offset, length)`
    fn best_match(&self, old: &[u8], new: &[u8], pos: usize, key: u32) -> Option<(usize, usize)> {
        let candidates = self.blocks.get(&key)?;
        let window = &new[pos..pos + BLOCK_SIZE];
        let mut best: Option<(usize, usize)> = None;

        for &offset in candidates {
            if &old[offset..offset + BLOCK_SIZE] != window {
                continue;
            }
            let len = BLOCK_SIZE + common_prefix(&old[offset + BLOCK_SIZE..], &new[pos + BLOCK_SIZE..]);
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((offset, len));
            }
        }
        best
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

struct ScriptEncoder {
    out: Vec<u8>,
    pending_copy: Option<(usize, usize)>,
}

impl ScriptEncoder {
    fn new(target_len: usize) -> Self {
        let mut out = Vec::new();
        write_varint(&mut out, target_len as u64);
        Self {
            out,
            pending_copy: None,
        }
    }

    fn copy(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        match self.pending_copy {
            Some((start, pending_len)) if start + pending_len == offset => {
                self.pending_copy = Some((start, pending_len + len));
            }
            _ => {
                self.flush_copy();
                self.pending_copy = Some((offset, len));
            }
        }
    }

    fn insert(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.flush_copy();
        self.out.push(OP_INSERT);
        write_varint(&mut self.out, bytes.len() as u64);
        self.out.extend_from_slice(bytes);
    }

    fn flush_copy(&mut self) {
        if let Some((offset, len)) = self.pending_copy.take() {
            self.out.push(OP_COPY);
            write_varint(&mut self.out, offset as u64);
            write_varint(&mut self.out, len as u64);
        }
    }

    fn finish(mut self) -> EditScript {
        self.flush_copy();
        self.out
    }
}

struct ScriptReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ScriptReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .data
                .get(self.pos)
                .ok_or_else(|| corrupt("truncated varint"))?;
            self.pos += 1;
            if shift == 63 && byte > 1 {
                return Err(corrupt("varint overflow"));
            }
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(corrupt("varint overflow"));
            }
        }
    }

    fn read_len(&mut self) -> Result<usize> {
        let value = self.read_varint()?;
        usize::try_from(value).map_err(|_| corrupt("length does not fit in memory"))
    }

    fn next_instruction(&mut self) -> Result<Instruction<'a>> {
        let op = self.data[self.pos];
        self.pos += 1;
        match op {
            OP_COPY => {
                let offset = self.read_len()?;
                let len = self.read_len()?;
                if len == 0 {
                    return Err(corrupt("zero-length copy"));
                }
                Ok(Instruction::Copy { offset, len })
            }
            OP_INSERT => {
                let len = self.read_len()?;
                if len == 0 {
                    return Err(corrupt("zero-length insert"));
                }
                let end = self
                    .pos
                    .checked_add(len)
                    .filter(|end| *end <= self.data.len())
                    .ok_or_else(|| corrupt("truncated insert literal"))?;
                let bytes = &self.data[self.pos..end];
                self.pos = end;
                Ok(Instruction::Insert(bytes))
            }
            other => Err(corrupt(format!("unknown opcode 0x{:02x}", other))),
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}
