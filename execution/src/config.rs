use obscura_types::shuffling::{
    MAX_SHUFFLING_PARTICIPANTS, MAX_SHUFFLING_REGISTRATION_PERIOD, MIN_SHUFFLING_PARTICIPANTS,
};
use serde::{Deserialize, Serialize};

/// Chain parameters for the shuffling protocol.
///
/// These are consensus data: every node of a deployment must run with the
/// same values, fixed at genesis. Nothing here may vary per node, since
/// accept/reject/blame decisions depend on it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Smallest participant set a creation may ask for.
    pub min_participants: u8,
    /// Largest participant set a creation may ask for.
    pub max_participants: u8,
    /// Longest registration period, in blocks.
    pub max_registration_period: u64,
    /// Native-coin deposit locked per participant, forfeited on proven
    /// misbehavior.
    pub deposit: u64,
    /// Blocks the assignee has to submit its processing step.
    pub processing_window: u64,
    /// Blocks the participant set has to verify the recipient list.
    pub verification_window: u64,
    /// Blocks participants have to reveal key seeds once blame opens.
    pub blame_window: u64,
    /// Blocks a processing payload must be retained after confirmation
    /// before it may be pruned.
    pub retention_window: u64,
    /// Gate shuffling creation on the authorization strategy.
    pub permissioned: bool,
    /// Hex-encoded account keys allowed to create shufflings when
    /// `permissioned` is set.
    pub allowed_creators: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_participants: MIN_SHUFFLING_PARTICIPANTS,
            max_participants: MAX_SHUFFLING_PARTICIPANTS,
            max_registration_period: MAX_SHUFFLING_REGISTRATION_PERIOD,
            deposit: 1_000,
            processing_window: 100,
            verification_window: 720,
            blame_window: 720,
            retention_window: 1_440,
            permissioned: false,
            allowed_creators: Vec::new(),
        }
    }
}
