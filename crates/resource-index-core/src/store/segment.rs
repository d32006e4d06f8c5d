//! Binary segment encoding.
//!
//! ```text
//! magic    8 bytes   "RIXSEG\0\x01"
//! dims     u32 LE
//! count    u32 LE
//! entries  count × { id_len u16, id, path_len u16, path, dims × f32 LE }
//! digest   32 bytes  SHA-256 of everything above
//! ```
//!
//! The trailing digest lets a reader tell a truncated or overwritten file
//! from a valid one instead of returning garbage vectors.

use sha2::{Digest, Sha256};

use super::SegmentEntry;

const MAGIC: &[u8; 8] = b"RIXSEG\0\x01";
const DIGEST_LEN: usize = 32;

/// Serialize entries into the segment file format.
pub fn encode(dims: usize, entries: &[SegmentEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + entries.len() * (dims * 4 + 64) + DIGEST_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(dims as u32).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        write_str(&mut out, &entry.chunk_id);
        write_str(&mut out, &entry.source_path);
        for v in &entry.vector {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    let digest = Sha256::digest(&out);
    out.extend_from_slice(&digest);
    out
}

/// Parse a segment file. The error string describes what is wrong.
pub fn decode(bytes: &[u8]) -> Result<(usize, Vec<SegmentEntry>), String> {
    if bytes.len() < MAGIC.len() + 8 + DIGEST_LEN {
        return Err(format!("file too short ({} bytes)", bytes.len()));
    }
    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
    if Sha256::digest(body).as_slice() != digest {
        return Err("checksum mismatch".to_string());
    }
    if &body[..MAGIC.len()] != MAGIC {
        return Err("bad magic header".to_string());
    }

    let mut reader = Reader {
        buf: body,
        pos: MAGIC.len(),
    };
    let dims = reader.u32()? as usize;
    let count = reader.u32()? as usize;
    let mut entries = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        let chunk_id = reader.string()?;
        let source_path = reader.string()?;
        let mut vector = Vec::with_capacity(dims);
        for _ in 0..dims {
            vector.push(f32::from_le_bytes(reader.array::<4>()?));
        }
        entries.push(SegmentEntry {
            chunk_id,
            source_path,
            vector,
        });
    }
    if reader.pos != body.len() {
        return Err(format!("{} trailing bytes", body.len() - reader.pos));
    }
    Ok((dims, entries))
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(u16::MAX as usize);
    out.extend_from_slice(&(len as u16).to_le_bytes());
    out.extend_from_slice(&bytes[..len]);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| format!("unexpected end of data at byte {}", self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn string(&mut self) -> Result<String, String> {
        let len = u16::from_le_bytes(self.array::<2>()?) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| "invalid UTF-8 in entry".to_string())
    }
}
