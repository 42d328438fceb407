//! Ahead-of-time IR cache.
//!
//! Compiled regions can be serialized (IR plus register allocation results)
//! and reused by later runs of the same guest binary. Compatibility is by
//! content hash: an entry only applies while the guest bytes it was
//! translated from are unchanged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use silex_ir::{OwnedIr, RegisterAllocationData};

#[derive(Serialize, Deserialize)]
pub struct AotEntry {
    pub guest_rip: u64,
    pub guest_length: u64,
    pub code_hash: [u8; 32],
    pub ir: OwnedIr,
    pub ra: Option<RegisterAllocationData>,
}

/// Magic + version framing for the on-disk stream.
const AOT_MAGIC: &[u8; 8] = b"SILEXAOT";
const AOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct AotFile {
    version: u32,
    entries: Vec<AotEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum AotError {
    #[error("not an AOT IR stream")]
    BadMagic,
    #[error("unsupported AOT version {0}")]
    BadVersion(u32),
    #[error("malformed AOT stream: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Hash the live guest bytes an entry was translated from.
pub fn hash_guest_code(rip: u64, length: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    if length != 0 {
        let bytes =
            unsafe { core::slice::from_raw_parts(rip as *const u8, length as usize) };
        hasher.update(bytes);
    }
    hasher.finalize().into()
}

/// Accumulates entries during execution; one writer per guest image.
#[derive(Default)]
pub struct AotIrWriter {
    entries: Vec<AotEntry>,
}

impl AotIrWriter {
    pub fn new() -> AotIrWriter {
        AotIrWriter::default()
    }

    pub fn append(&mut self, entry: AotEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the collected entries into the binary stream format.
    pub fn serialize(&self) -> Result<Vec<u8>, AotError> {
        // A borrowed mirror of `AotFile` avoids cloning the entries.
        #[derive(Serialize)]
        struct AotFileRef<'a> {
            version: u32,
            entries: &'a [AotEntry],
        }
        let mut out = Vec::new();
        out.extend_from_slice(AOT_MAGIC);
        let body = bincode::serialize(&AotFileRef {
            version: AOT_VERSION,
            entries: &self.entries,
        })?;
        out.extend_from_slice(&body);
        Ok(out)
    }
}

/// Parse a stream back into a per-RIP map ("AOTIRLoader" callback side).
pub fn load_aot_stream(bytes: &[u8]) -> Result<HashMap<u64, AotEntry>, AotError> {
    if bytes.len() < 8 || &bytes[0..8] != AOT_MAGIC {
        return Err(AotError::BadMagic);
    }
    let file: AotFile = bincode::deserialize(&bytes[8..])?;
    if file.version != AOT_VERSION {
        return Err(AotError::BadVersion(file.version));
    }
    Ok(file
        .entries
        .into_iter()
        .map(|entry| (entry.guest_rip, entry))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use silex_ir::{IrStore, IrStoreMut, Op, OpPayload, OpSize};

    fn sample_ir() -> OwnedIr {
        let mut ir = OwnedIr::new();
        let block = ir.alloc(OpPayload::scalar(
            Op::CodeBlock { begin: silex_ir::NodeId::INVALID, last: silex_ir::NodeId::INVALID },
            OpSize::I8,
        ));
        ir.set_block_head(block);
        ir.set_block_tail(block);
        ir
    }

    #[test]
    fn roundtrip_preserves_entries() {
        let code = [0x48u8, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xf4];
        let rip = code.as_ptr() as u64;

        let mut writer = AotIrWriter::new();
        writer.append(AotEntry {
            guest_rip: rip,
            guest_length: code.len() as u64,
            code_hash: hash_guest_code(rip, code.len() as u64),
            ir: sample_ir(),
            ra: None,
        });
        let stream = writer.serialize().expect("serialize");

        let loaded = load_aot_stream(&stream).expect("load");
        let entry = loaded.get(&rip).expect("entry present");
        assert_eq!(entry.guest_length, code.len() as u64);
        assert_eq!(entry.code_hash, hash_guest_code(rip, code.len() as u64));
        assert_eq!(entry.ir.count(), 2);
    }

    #[test]
    fn hash_tracks_code_changes() {
        let mut code = [0x90u8; 16];
        let rip = code.as_ptr() as u64;
        let before = hash_guest_code(rip, 16);
        code[3] = 0xcc;
        let after = hash_guest_code(rip, 16);
        assert_ne!(before, after);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(load_aot_stream(b"nonsense"), Err(AotError::BadMagic)));
        let mut bad = Vec::new();
        bad.extend_from_slice(AOT_MAGIC);
        bad.extend_from_slice(&[1, 2, 3]);
        assert!(load_aot_stream(&bad).is_err());
    }
}
