use std::io::Read;
use std::path::Path;

use sha2::Digest;
use sha2::Sha256;

const CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Lowercase hex sha256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

/// Lowercase hex sha256 of a file, read in chunks. Blocking; call through
/// `spawn_blocking` from async contexts.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex(&hasher.finalize()))
}

fn hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Bytes read off the wire together with the sha256 computed while reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashContainer {
    pub data: bytes::Bytes,
    pub hash: String,
}

impl HashContainer {
    pub fn new(data: bytes::Bytes) -> Self {
        let hash = hash_bytes(&data);
        Self { data, hash }
    }
}
