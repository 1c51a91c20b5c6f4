//! Round calculation
//!
//! A round gives every validator active at the anchor height exactly one
//! producer slot. The order is a pure function of the round index and the
//! validator set, so every honest node derives the same rotation.

use palisade_core::{Address, Height, PalisadeError, PalisadeResult, PublicKey, Timestamp, ValidatorSetEntry};
use palisade_crypto::hashing::hash_multiple;

/// A validator and its 1-based producer slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSlot {
    pub entry: ValidatorSetEntry,
    pub slot: u32,
}

/// One producer rotation
///
/// Immutable once built; schedule slips produce a delayed copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Round {
    pub index: u64,
    pub start_time: Timestamp,
    /// Milliseconds the schedule slipped behind `start_time`
    pub delay_ms: u64,
    pub slot_interval_ms: u64,
    pub anchor_height: Height,
    members: Vec<MemberSlot>,
    local: Option<MemberSlot>,
}

impl Round {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[MemberSlot] {
        &self.members
    }

    pub fn local_member(&self) -> Option<&MemberSlot> {
        self.local.as_ref()
    }

    pub fn local_slot(&self) -> Option<u32> {
        self.local.as_ref().map(|m| m.slot)
    }

    pub fn is_local_slot(&self, slot: u32) -> bool {
        self.local_slot() == Some(slot)
    }

    pub fn member_at(&self, slot: u32) -> Option<&MemberSlot> {
        let index = (slot as usize).checked_sub(1)?;
        self.members.get(index)
    }

    pub fn slot_of(&self, public_key: &PublicKey) -> Option<u32> {
        self.members
            .iter()
            .find(|m| &m.entry.public_key == public_key)
            .map(|m| m.slot)
    }

    pub fn contains(&self, public_key: &PublicKey) -> bool {
        self.slot_of(public_key).is_some()
    }

    pub fn slot_start(&self, slot: u32) -> Timestamp {
        let offset = self.slot_interval_ms * slot.saturating_sub(1) as u64;
        self.start_time.add_millis(self.delay_ms + offset)
    }

    pub fn slot_deadline(&self, slot: u32) -> Timestamp {
        self.slot_start(slot).add_millis(self.slot_interval_ms)
    }

    pub fn end_time(&self) -> Timestamp {
        self.start_time
            .add_millis(self.delay_ms + self.slot_interval_ms * self.members.len() as u64)
    }

    /// Copy of this round with `extra_ms` more delay
    pub fn delayed(&self, extra_ms: u64) -> Round {
        Round {
            delay_ms: self.delay_ms + extra_ms,
            ..self.clone()
        }
    }
}

/// Ordering key of a validator within round `index`
fn rotation_key(index: u64, address: &Address) -> [u8; 32] {
    *hash_multiple(&[&index.to_le_bytes(), address.as_bytes()]).as_bytes()
}

/// Compute round `index` from a validator snapshot
///
/// Members are the entries active at `anchor_height`, ordered by
/// `blake3(index_le || packing_address)` with the address breaking ties.
pub fn compute_round(
    snapshot: &[ValidatorSetEntry],
    index: u64,
    anchor_height: Height,
    anchor_time: Timestamp,
    slot_interval_ms: u64,
    local: Option<&Address>,
) -> PalisadeResult<Round> {
    let mut active: Vec<&ValidatorSetEntry> = snapshot.iter().filter(|e| e.is_active_at(anchor_height)).collect();
    if active.is_empty() {
        return Err(PalisadeError::NoRound(format!(
            "no validator active at height {}",
            anchor_height
        )));
    }

    active.sort_by(|a, b| {
        rotation_key(index, &a.packing_address)
            .cmp(&rotation_key(index, &b.packing_address))
            .then_with(|| a.packing_address.cmp(&b.packing_address))
    });
    active.dedup_by(|a, b| a.packing_address == b.packing_address);

    let members: Vec<MemberSlot> = active
        .into_iter()
        .enumerate()
        .map(|(i, entry)| MemberSlot {
            entry: entry.clone(),
            slot: i as u32 + 1,
        })
        .collect();

    let local = local.and_then(|address| members.iter().find(|m| &m.entry.packing_address == address).cloned());

    Ok(Round {
        index,
        start_time: anchor_time,
        delay_ms: 0,
        slot_interval_ms,
        anchor_height,
        members,
        local,
    })
}

/// Whether every slot of `round` has passed at `now`
pub fn is_expired(round: &Round, now: Timestamp, slot_interval_ms: u64) -> bool {
    let end = round
        .start_time
        .add_millis(round.delay_ms + slot_interval_ms * round.member_count() as u64);
    now > end
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::Amount;

    fn validators(count: u8) -> Vec<ValidatorSetEntry> {
        (1..=count)
            .map(|i| {
                ValidatorSetEntry::new(
                    Address([i; 32]),
                    Address([i; 32]),
                    PublicKey([i; 32]),
                    Amount::from_pal(20_000),
                    0,
                )
            })
            .collect()
    }

    #[test]
    fn test_rotation_is_deterministic() {
        let set = validators(7);
        let mut reversed = set.clone();
        reversed.reverse();

        let a = compute_round(&set, 5, 10, Timestamp::from_millis(0), 1_000, None).unwrap();
        let b = compute_round(&reversed, 5, 10, Timestamp::from_millis(0), 1_000, None).unwrap();
        assert_eq!(a.members(), b.members());
        assert_eq!(a.member_count(), 7);
        assert_eq!(a.members()[0].slot, 1);
        assert_eq!(a.members()[6].slot, 7);
    }

    #[test]
    fn test_rotation_changes_between_rounds() {
        let set = validators(7);
        let orders: Vec<Vec<Address>> = (0..8)
            .map(|i| {
                compute_round(&set, i, 0, Timestamp::from_millis(0), 1_000, None)
                    .unwrap()
                    .members()
                    .iter()
                    .map(|m| m.entry.packing_address)
                    .collect()
            })
            .collect();
        assert!(orders.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_only_active_members() {
        let mut set = validators(4);
        set[0].exit_height = Some(5);
        set[1].join_height = 20;

        let round = compute_round(&set, 1, 10, Timestamp::from_millis(0), 1_000, Some(&Address([1u8; 32]))).unwrap();
        assert_eq!(round.member_count(), 2);
        assert!(round.local_member().is_none());
        assert!(!round.contains(&PublicKey([1u8; 32])));
        assert!(round.contains(&PublicKey([3u8; 32])));
    }

    #[test]
    fn test_no_round_without_validators() {
        let result = compute_round(&[], 1, 0, Timestamp::from_millis(0), 1_000, None);
        assert!(matches!(result, Err(PalisadeError::NoRound(_))));
    }

    #[test]
    fn test_slot_schedule_and_expiry() {
        let set = validators(3);
        let local = Address([2u8; 32]);
        let round = compute_round(&set, 1, 0, Timestamp::from_millis(10_000), 1_000, Some(&local)).unwrap();

        let slot = round.local_slot().unwrap();
        assert!(round.is_local_slot(slot));
        assert_eq!(round.member_at(slot).unwrap().entry.packing_address, local);
        assert!(round.member_at(0).is_none());
        assert_eq!(round.slot_start(1), Timestamp::from_millis(10_000));
        assert_eq!(round.slot_deadline(3), Timestamp::from_millis(13_000));

        assert!(!is_expired(&round, Timestamp::from_millis(13_000), 1_000));
        assert!(is_expired(&round, Timestamp::from_millis(13_001), 1_000));

        let delayed = round.delayed(500);
        assert_eq!(delayed.slot_start(1), Timestamp::from_millis(10_500));
        assert!(!is_expired(&delayed, Timestamp::from_millis(13_001), 1_000));
        assert_eq!(delayed.end_time(), Timestamp::from_millis(13_500));
    }
}
