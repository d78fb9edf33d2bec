//! Error taxonomy for the shuffling protocol.
//!
//! The split matters for consensus: a [`ValidationError`] rejects a submission
//! before any state change, while a [`ProtocolViolation`] is only detectable
//! after a submission was accepted at face value and therefore triggers the
//! blame path instead of a rejection.

use thiserror::Error;

/// Rejected before any state change; the submitting transaction is not
/// applied to the shuffling instance.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("shuffling {0} not found")]
    UnknownShuffling(u64),
    #[error("shuffling id {0} already in use")]
    IdInUse(u64),
    #[error("shuffling {id} is in phase {phase}, expected {expected}")]
    WrongPhase {
        id: u64,
        phase: &'static str,
        expected: &'static str,
    },
    #[error("shuffling state hash doesn't match")]
    StaleStateHash,
    #[error("account is already registered for shuffling {0}")]
    AlreadyRegistered(u64),
    #[error("account is not registered for shuffling {0}")]
    NotRegistered(u64),
    #[error("registration for shuffling {0} has closed")]
    RegistrationClosed(u64),
    #[error("participant {index} is not currently assigned to act")]
    WrongTurn { index: u8 },
    #[error("participant {index} cannot advance from its current status")]
    StatusFinal { index: u8 },
    #[error("invalid participant count {got}, must be between {min} and {max}")]
    ParticipantCount { got: u8, min: u8, max: u8 },
    #[error("invalid registration period {got}, must be between 1 and {max}")]
    RegistrationPeriod { got: u64, max: u64 },
    #[error("invalid shuffling amount {0}")]
    Amount(u64),
    #[error("invalid number of encrypted blobs {got} for participant {index}, expected {expected}")]
    BlobCount {
        index: u8,
        got: usize,
        expected: usize,
    },
    #[error("invalid encrypted blob length {got}, expected {expected}")]
    BlobLength { got: usize, expected: usize },
    #[error("duplicate or unsorted encrypted blobs")]
    UnsortedBlobs,
    #[error("processing data has been pruned prematurely")]
    PayloadMissing,
    #[error("invalid number of recipients {got}, expected {expected}")]
    RecipientCount { got: usize, expected: usize },
    #[error("duplicate recipient accounts")]
    DuplicateRecipient,
    #[error("blame data hash doesn't match recorded processing data hash")]
    PayloadDigestMismatch,
    #[error("key seed already revealed for participant {index}")]
    AlreadyRevealed { index: u8 },
    #[error("insufficient holding {holding} balance: required {required}, available {available}")]
    InsufficientFunds {
        holding: u64,
        required: u64,
        available: u64,
    },
    #[error("account is not authorized to create shufflings")]
    NotAuthorized,
}

impl ValidationError {
    /// Stable numeric code carried on rejection events.
    pub fn code(&self) -> u16 {
        match self {
            Self::UnknownShuffling(_) => 1,
            Self::IdInUse(_) => 2,
            Self::WrongPhase { .. } => 3,
            Self::StaleStateHash => 4,
            Self::AlreadyRegistered(_) => 5,
            Self::NotRegistered(_) => 6,
            Self::RegistrationClosed(_) => 7,
            Self::WrongTurn { .. } => 8,
            Self::StatusFinal { .. } => 9,
            Self::ParticipantCount { .. } => 10,
            Self::RegistrationPeriod { .. } => 11,
            Self::Amount(_) => 12,
            Self::BlobCount { .. } => 13,
            Self::BlobLength { .. } => 14,
            Self::UnsortedBlobs => 15,
            Self::PayloadMissing => 16,
            Self::RecipientCount { .. } => 17,
            Self::DuplicateRecipient => 18,
            Self::PayloadDigestMismatch => 19,
            Self::AlreadyRevealed { .. } => 20,
            Self::InsufficientFunds { .. } => 21,
            Self::NotAuthorized => 22,
        }
    }
}

/// A structurally valid, accepted submission that fails the replay or
/// verification check. Recorded on-chain; triggers blame, not rejection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("participant {index} saw a recipient list that does not match the recorded digest")]
    RecipientDigestMismatch { id: u64, index: u8 },
    #[error("revealed key seed of participant {index} does not derive its registered shuffle key")]
    KeyRevealMismatch { id: u64, index: u8 },
    #[error("participant {index} did not reveal its key seed inside the blame window")]
    MissingReveal { id: u64, index: u8 },
    #[error("recorded submission of participant {index} diverges from the blame replay")]
    LayerDivergence { id: u64, index: u8 },
    #[error("participant {index} published a layer that does not decrypt")]
    UndecipherableLayer { id: u64, index: u8 },
    #[error("participant {index} accused without divergence")]
    FalseAccusation { id: u64, index: u8 },
}

impl ProtocolViolation {
    /// Index of the participant the violation attributes fault to.
    pub fn blamed(&self) -> u8 {
        match self {
            Self::RecipientDigestMismatch { index, .. }
            | Self::KeyRevealMismatch { index, .. }
            | Self::MissingReveal { index, .. }
            | Self::LayerDivergence { index, .. }
            | Self::UndecipherableLayer { index, .. }
            | Self::FalseAccusation { index, .. } => *index,
        }
    }
}

/// Deadline passed with the phase incomplete. Cancels with refunds and no
/// blame: non-submission alone cannot be attributed to a specific party.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("shuffling {id} timed out at height {height} in phase {phase}")]
pub struct TimeoutExpiry {
    pub id: u64,
    pub height: u64,
    pub phase: &'static str,
}

/// A prunable payload could not be located locally or via peers. Soft and
/// non-fatal: consensus depends only on the committed hash chain, never on
/// payload availability once the chain is complete.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DataUnavailable {
    #[error("payload for shuffling {id} participant {index} was pruned; only the digest remains")]
    Pruned { id: u64, index: u8 },
    #[error("payload for shuffling {id} participant {index} was never stored on this node")]
    NeverStored { id: u64, index: u8 },
}
