//! Execution environment for the obscura shuffling protocol.
//!
//! All state transitions for a given shuffling are driven by transaction
//! application in the ledger's single height-ordered sequence; instances
//! share no mutable state and are keyed strictly by shuffling id. Deadlines
//! are evaluated synchronously at each height, never by background timers,
//! so every node reaches identical accept/reject/blame outcomes from the
//! same committed data.

mod auth;
mod blame;
mod config;
mod ledger;
mod onion;
mod state;
mod state_transition;
mod store;

mod layer;
pub use layer::Layer;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

pub use auth::{authorizer_from_config, AllowAll, AllowList, Authorizer, DenyAll};
pub use blame::resolve;
pub use config::Config;
pub use ledger::{HoldingLedger, LedgerError, NATIVE_HOLDING};
pub use onion::{open_layer, seal_layer, wrap_onion, KeySeed, LayerError};
pub use state::{nonce, Adb, PrepareError, State, Status};
#[cfg(any(test, feature = "mocks"))]
pub use state::Memory;
pub use state_transition::{execute_state_transition, StateTransitionResult};
pub use store::{Lookup, NoFetch, PayloadFetcher, PayloadState, PrunableStore, StoredPayload};
