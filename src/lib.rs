#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Consensus-backed primary lease.
//!
//! A single replicated record names the node currently allowed to accept
//! writes. [`manager::ConsensusLeaser`] turns leadership of the underlying
//! consensus engine into acquire/renew/release semantics, and
//! [`fsm::PrimaryStateMachine`] is the state machine the engine drives.

pub mod config;
pub mod consensus;
pub mod error;
pub mod fsm;
pub mod lease;
pub mod manager;
pub mod primary;
pub mod time;

pub mod test_utils;

pub use config::LeaseConfig;
pub use consensus::{Consensus, ConsensusError};
pub use error::{Error, Result};
pub use fsm::PrimaryStateMachine;
pub use lease::{ConsensusLease, Lease, LeaseStatus};
pub use manager::{ConsensusLeaser, Leaser};
pub use primary::{PrimaryInfo, PrimaryProvider, PrimaryRedirectInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub uuid::Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
