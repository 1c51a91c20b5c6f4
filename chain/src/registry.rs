//! Staked validator registry

use async_trait::async_trait;
use palisade_core::{
    Address, Amount, ChainId, Height, PalisadeError, PalisadeResult, ValidatorSetEntry, ValidatorSource,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Minimum deposit for a packing account
pub const MIN_DEPOSIT_PAL: u64 = 20_000;

/// Confirmed staking transaction as seen by the registry
#[derive(Debug, Clone)]
pub enum StakingEvent {
    Join(ValidatorSetEntry),
    Exit { packing_address: Address, height: Height },
}

/// The validator set, updated by confirmed staking transactions
///
/// Readers get a copy of the current set; every change bumps a version
/// published on a `watch` channel.
pub struct ValidatorRegistry {
    entries: RwLock<Vec<ValidatorSetEntry>>,
    min_deposit: Amount,
    version: watch::Sender<u64>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::with_validators(Vec::new())
    }

    pub fn with_validators(entries: Vec<ValidatorSetEntry>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            entries: RwLock::new(entries),
            min_deposit: Amount::from_pal(MIN_DEPOSIT_PAL),
            version,
        }
    }

    pub fn with_min_deposit(mut self, min_deposit: Amount) -> Self {
        self.min_deposit = min_deposit;
        self
    }

    /// Apply one confirmed staking event
    pub fn apply(&self, event: StakingEvent) -> PalisadeResult<()> {
        match event {
            StakingEvent::Join(entry) => {
                if entry.deposit < self.min_deposit {
                    return Err(PalisadeError::ValidatorSetError(format!(
                        "deposit {} below minimum {}",
                        entry.deposit, self.min_deposit
                    )));
                }
                let mut entries = self.entries.write();
                if entries
                    .iter()
                    .any(|e| e.packing_address == entry.packing_address && e.exit_height.is_none())
                {
                    return Err(PalisadeError::ValidatorSetError(format!(
                        "{} is already an active validator",
                        entry.packing_address
                    )));
                }
                info!(
                    "Validator {} joined at #{} with {}",
                    entry.packing_address, entry.join_height, entry.deposit
                );
                entries.push(entry);
            }
            StakingEvent::Exit { packing_address, height } => {
                let mut entries = self.entries.write();
                let entry = entries
                    .iter_mut()
                    .find(|e| e.packing_address == packing_address && e.exit_height.is_none())
                    .ok_or_else(|| PalisadeError::ValidatorSetError(format!("{} is not active", packing_address)))?;
                entry.exit_height = Some(height);
                info!("Validator {} exits at #{}", packing_address, height);
            }
        }
        self.version.send_modify(|v| *v += 1);
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<ValidatorSetEntry> {
        self.entries.read().clone()
    }

    pub fn active_at(&self, height: Height) -> Vec<ValidatorSetEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.is_active_at(height))
            .cloned()
            .collect()
    }

    pub fn get(&self, packing_address: &Address) -> Option<ValidatorSetEntry> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|e| &e.packing_address == packing_address)
            .cloned()
    }

    /// Change notifications; the value is a counter of applied events
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValidatorSource for ValidatorRegistry {
    async fn current_validators(&self, _chain_id: ChainId) -> PalisadeResult<Vec<ValidatorSetEntry>> {
        Ok(self.snapshot())
    }
}

pub type SharedValidatorRegistry = Arc<ValidatorRegistry>;

pub fn create_registry(entries: Vec<ValidatorSetEntry>) -> SharedValidatorRegistry {
    Arc::new(ValidatorRegistry::with_validators(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use palisade_core::PublicKey;

    fn entry(marker: u8, join_height: Height) -> ValidatorSetEntry {
        ValidatorSetEntry::new(
            Address([marker; 32]),
            Address([marker; 32]),
            PublicKey([marker; 32]),
            Amount::from_pal(MIN_DEPOSIT_PAL),
            join_height,
        )
    }

    #[test]
    fn test_join_and_exit() {
        let registry = ValidatorRegistry::new();
        let mut changes = registry.subscribe();

        registry.apply(StakingEvent::Join(entry(1, 0))).unwrap();
        registry.apply(StakingEvent::Join(entry(2, 5))).unwrap();
        assert_eq!(registry.active_at(3).len(), 1);
        assert_eq!(registry.active_at(5).len(), 2);

        registry
            .apply(StakingEvent::Exit {
                packing_address: Address([1u8; 32]),
                height: 10,
            })
            .unwrap();
        assert_eq!(registry.active_at(10).len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 3);
    }

    #[test]
    fn test_rejects_low_deposit_and_double_join() {
        let registry = ValidatorRegistry::new();
        let mut poor = entry(1, 0);
        poor.deposit = Amount::from_pal(10);
        assert!(registry.apply(StakingEvent::Join(poor)).is_err());

        registry.apply(StakingEvent::Join(entry(1, 0))).unwrap();
        assert!(registry.apply(StakingEvent::Join(entry(1, 3))).is_err());
        assert!(registry
            .apply(StakingEvent::Exit {
                packing_address: Address([9u8; 32]),
                height: 4
            })
            .is_err());
    }
}
