//! Contract lock bookkeeping.
//!
//! A contract is locked exactly once, when its producing sprint completes.
//! Locking is idempotent so resume replay can re-apply completed producers
//! safely. If a producer fails or is blocked, its contracts become
//! permanently `Unlockable` and every consumer is cascaded to `blocked` by
//! the coordinator.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::errors::{EpicError, Result};
use crate::model::Contract;

/// Runtime lock state of one contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractState {
    Unlocked,
    Locked,
    /// The producer reached `failed`/`blocked`; the contract can never lock.
    Unlockable,
}

pub struct ContractLockManager {
    // Per-entry locking in DashMap gives the single-writer-at-a-time
    // serialization the transition path requires.
    states: DashMap<String, ContractState>,
    contracts: HashMap<String, Contract>,
}

impl ContractLockManager {
    pub fn new(contracts: &[Contract]) -> Self {
        let states = DashMap::new();
        let mut by_name = HashMap::new();
        for contract in contracts {
            states.insert(contract.name.clone(), ContractState::Unlocked);
            by_name.insert(contract.name.clone(), contract.clone());
        }
        Self {
            states,
            contracts: by_name,
        }
    }

    pub fn state(&self, name: &str) -> Option<ContractState> {
        self.states.get(name).map(|s| *s)
    }

    pub fn is_unlocked(&self, name: &str) -> bool {
        matches!(self.state(name), Some(ContractState::Unlocked))
    }

    pub fn is_locked(&self, name: &str) -> bool {
        matches!(self.state(name), Some(ContractState::Locked))
    }

    /// Finalizes a contract after its producer completed. Idempotent: locking
    /// an already-locked contract is a no-op, which guards against replay
    /// during resume. Locking an `Unlockable` contract is a logic error.
    pub fn lock(&self, name: &str) -> Result<()> {
        let mut entry = self
            .states
            .get_mut(name)
            .ok_or_else(|| EpicError::structure_contract(
                format!("unknown contract '{}'", name),
                name,
            ))?;
        match *entry {
            ContractState::Unlocked => {
                *entry = ContractState::Locked;
                debug!(contract = name, "contract locked");
                Ok(())
            }
            ContractState::Locked => Ok(()),
            ContractState::Unlockable => Err(EpicError::internal(format!(
                "attempted to lock unlockable contract '{}'",
                name
            ))),
        }
    }

    /// Marks a contract as permanently unlockable after its producer failed
    /// or was blocked. Idempotent for replay.
    pub fn mark_unlockable(&self, name: &str) -> Result<()> {
        let mut entry = self
            .states
            .get_mut(name)
            .ok_or_else(|| EpicError::structure_contract(
                format!("unknown contract '{}'", name),
                name,
            ))?;
        match *entry {
            ContractState::Unlocked => {
                *entry = ContractState::Unlockable;
                warn!(contract = name, "contract marked unlockable");
                Ok(())
            }
            ContractState::Unlockable => Ok(()),
            ContractState::Locked => Err(EpicError::internal(format!(
                "attempted to invalidate already-locked contract '{}'",
                name
            ))),
        }
    }

    pub fn producer_of(&self, name: &str) -> Option<&str> {
        self.contracts.get(name).map(|c| c.producer.as_str())
    }

    pub fn consumers_of(&self, name: &str) -> &[String] {
        self.contracts
            .get(name)
            .map(|c| c.consumers.as_slice())
            .unwrap_or(&[])
    }

    /// All contract names, for reporting.
    pub fn contract_names(&self) -> Vec<String> {
        self.contracts.keys().cloned().collect()
    }
}
