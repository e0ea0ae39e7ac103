//! SHA3-256 helpers shared by blocks, contracts and the chain store

use sha3::{Digest, Sha3_256};

/// Hex encoded SHA3-256 digest
pub fn sha3_hex(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha3_known_vector() {
        assert_eq!(
            sha3_hex(b""),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }
}
