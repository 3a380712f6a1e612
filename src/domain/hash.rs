use std::fmt::Display;

use anyhow::anyhow;
use blake3::Hash;

/// Content hash of an uploaded audio file.
///
/// The object store names blobs by this hash, so uploading the same
/// recording twice lands on the same stored file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(pub Hash);

impl ContentHash {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> anyhow::Result<Self> {
        Hash::from_hex(hex)
            .map(Self)
            .map_err(|e| anyhow!("invalid content hash {hex}: {e}"))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
