//! BLAKE3 hashing helpers

use palisade_core::Hash;

pub fn blake3_hash(data: &[u8]) -> Hash {
    Hash::from_bytes(*blake3::hash(data).as_bytes())
}

/// Default hash function
pub fn hash(data: &[u8]) -> Hash {
    blake3_hash(data)
}

/// Hash the concatenation of `parts`
pub fn hash_multiple(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    Hash::from_bytes(*hasher.finalize().as_bytes())
}

/// Transaction root of a block; `Hash::ZERO` for an empty block
pub fn merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::ZERO;
    }

    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                // odd leaf pairs with itself
                let right = pair.get(1).unwrap_or(&pair[0]);
                hash_multiple(&[pair[0].as_bytes(), right.as_bytes()])
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_multiple_is_concatenation() {
        assert_eq!(hash_multiple(&[b"pali", b"sade"]), hash(b"palisade"));
        assert_ne!(hash(b"palisade"), Hash::ZERO);
    }

    #[test]
    fn test_merkle_root() {
        let leaves = vec![hash(b"tx1"), hash(b"tx2"), hash(b"tx3")];
        let root = merkle_root(&leaves);
        assert_eq!(root, merkle_root(&leaves));
        assert_ne!(root, merkle_root(&leaves[..2]));
        assert_eq!(merkle_root(&leaves[..1]), leaves[0]);
        assert_eq!(merkle_root(&[]), Hash::ZERO);
    }
}
