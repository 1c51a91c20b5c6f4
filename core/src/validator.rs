//! Validator set entries as published by the staking layer

use crate::types::{Address, Amount, Height, PublicKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One staked validator
///
/// Created when a staking transaction confirms; `exit_height` is set once a
/// withdrawal confirms. Consensus only ever sees read-only snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSetEntry {
    pub packing_address: Address,
    pub reward_address: Address,
    pub public_key: PublicKey,
    pub deposit: Amount,
    pub join_height: Height,
    /// `None` while active; serialized as `-1`
    #[serde(with = "exit_height")]
    pub exit_height: Option<Height>,
}

impl ValidatorSetEntry {
    pub fn new(
        packing_address: Address,
        reward_address: Address,
        public_key: PublicKey,
        deposit: Amount,
        join_height: Height,
    ) -> Self {
        Self {
            packing_address,
            reward_address,
            public_key,
            deposit,
            join_height,
            exit_height: None,
        }
    }

    /// Whether the validator takes part in rounds anchored at `height`
    pub fn is_active_at(&self, height: Height) -> bool {
        self.join_height <= height && self.exit_height.map_or(true, |exit| exit > height)
    }
}

mod exit_height {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<Height>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(h) => serializer.serialize_i64(*h as i64),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Height>, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Ok(if raw < 0 { None } else { Some(raw as Height) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ValidatorSetEntry {
        ValidatorSetEntry::new(
            Address([1u8; 32]),
            Address([2u8; 32]),
            PublicKey([3u8; 32]),
            Amount::from_pal(20_000),
            10,
        )
    }

    #[test]
    fn test_activity_window() {
        let mut e = entry();
        assert!(!e.is_active_at(9));
        assert!(e.is_active_at(10));
        assert!(e.is_active_at(1_000_000));

        e.exit_height = Some(50);
        assert!(e.is_active_at(49));
        assert!(!e.is_active_at(50));
    }

    #[test]
    fn test_exit_height_json() {
        let active = entry();
        let json = serde_json::to_value(&active).unwrap();
        assert_eq!(json["exit_height"], -1);

        let mut exited = entry();
        exited.exit_height = Some(77);
        let restored: ValidatorSetEntry =
            serde_json::from_str(&serde_json::to_string(&exited).unwrap()).unwrap();
        assert_eq!(restored.exit_height, Some(77));
    }
}
