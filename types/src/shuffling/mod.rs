//! Shuffling domain types.
//!
//! One `Shuffling` is a single mixing instance: a fixed participant set swaps
//! equal-sized holdings so that no observer of the ledger can link a source
//! account to its recipient. Everything consensus-relevant about an instance
//! lives in these types; bulk encrypted payloads are referenced by digest and
//! held in the prunable data store.

mod codec;
mod payload;

pub use codec::{blob_encode_size, read_blob, read_bytes32, write_blob, write_bytes32};
pub use payload::ProcessingData;

use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::{
    ed25519::PublicKey,
    sha256::{Digest, Sha256},
    Hasher,
};

/// Minimum number of participants in a shuffling.
pub const MIN_SHUFFLING_PARTICIPANTS: u8 = 3;

/// Maximum number of participants in a shuffling.
pub const MAX_SHUFFLING_PARTICIPANTS: u8 = 30;

/// Maximum registration period in blocks.
pub const MAX_SHUFFLING_REGISTRATION_PERIOD: u64 = 10_080;

/// Length of one plaintext recipient entry (an account public key).
pub const RECIPIENT_LEN: usize = 32;

/// Bytes added by one onion layer: a 32-byte sender public key header plus a
/// 16-byte authentication tag.
pub const LAYER_OVERHEAD: usize = 48;

/// Shared attachment header size: 8-byte shuffling id + 32-byte state hash.
pub const ATTACHMENT_BASE_SIZE: usize = 40;

/// Upper bound on blobs in one processing submission.
pub const MAX_PROCESSING_BLOBS: usize = (MAX_SHUFFLING_PARTICIPANTS - 1) as usize;

/// Upper bound on a single encrypted blob.
pub const MAX_BLOB_LEN: usize =
    RECIPIENT_LEN + LAYER_OVERHEAD * (MAX_SHUFFLING_PARTICIPANTS as usize - 1);

/// Number of blobs the participant at `index` must submit: one fewer than the
/// remaining untouched layers. The shape of every intermediate submission is
/// a pure function of (participant count, index), so any deviation is locally
/// checkable.
pub fn expected_blob_count(participant_count: u8, index: u8) -> usize {
    (participant_count - index - 1) as usize
}

/// Uniform length of every blob in the submission at `index`.
pub fn expected_blob_len(participant_count: u8, index: u8) -> usize {
    RECIPIENT_LEN + LAYER_OVERHEAD * (participant_count - 1 - index) as usize
}

/// Seed of the state hash chain: the digest of the creation attachment.
pub fn initial_state_hash(creation_bytes: &[u8]) -> Digest {
    Sha256::hash(creation_bytes)
}

/// One link of the state hash chain: the previous value hashed together
/// with the accepted attachment's canonical bytes.
pub fn next_state_hash(previous: &Digest, attachment_bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_ref());
    hasher.update(attachment_bytes);
    hasher.finalize()
}

/// Fold an ordered attachment sequence into the chain's final digest.
pub fn fold_state_hash<'a>(
    creation_bytes: &[u8],
    attachments: impl IntoIterator<Item = &'a [u8]>,
) -> Digest {
    let mut hash = initial_state_hash(creation_bytes);
    for bytes in attachments {
        hash = next_state_hash(&hash, bytes);
    }
    hash
}

/// Phase of a shuffling instance. `Done` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Registration,
    Processing,
    Verification,
    Blame,
    Done,
    Cancelled,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Processing => "processing",
            Self::Verification => "verification",
            Self::Blame => "blame",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

impl Write for Phase {
    fn write(&self, writer: &mut impl BufMut) {
        let tag: u8 = match self {
            Self::Registration => 0,
            Self::Processing => 1,
            Self::Verification => 2,
            Self::Blame => 3,
            Self::Done => 4,
            Self::Cancelled => 5,
        };
        tag.write(writer);
    }
}

impl Read for Phase {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        match u8::read(reader)? {
            0 => Ok(Self::Registration),
            1 => Ok(Self::Processing),
            2 => Ok(Self::Verification),
            3 => Ok(Self::Blame),
            4 => Ok(Self::Done),
            5 => Ok(Self::Cancelled),
            tag => Err(Error::InvalidEnum(tag)),
        }
    }
}

/// Per-participant status. Only ever advances forward, except to `Blamed`,
/// which is terminal for the participant within this instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticipantStatus {
    Registered,
    Processed,
    Verified,
    Blamed,
}

impl ParticipantStatus {
    fn order(&self) -> u8 {
        match self {
            Self::Registered => 0,
            Self::Processed => 1,
            Self::Verified => 2,
            Self::Blamed => 3,
        }
    }

    pub fn can_become(&self, next: ParticipantStatus) -> bool {
        if *self == Self::Blamed {
            return false;
        }
        if next == Self::Blamed {
            return true;
        }
        next.order() > self.order()
    }
}

impl Write for ParticipantStatus {
    fn write(&self, writer: &mut impl BufMut) {
        self.order().write(writer);
    }
}

impl Read for ParticipantStatus {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        match u8::read(reader)? {
            0 => Ok(Self::Registered),
            1 => Ok(Self::Processed),
            2 => Ok(Self::Verified),
            3 => Ok(Self::Blamed),
            tag => Err(Error::InvalidEnum(tag)),
        }
    }
}

/// One mixing instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shuffling {
    pub id: u64,
    /// Holding being mixed; 0 is the native coin.
    pub holding_id: u64,
    /// Fixed per-participant amount.
    pub amount: u64,
    /// Required participant count, fixed at creation.
    pub participant_count: u8,
    /// Height at which registration closes.
    pub registration_deadline: u64,
    /// Deadline for the current phase or turn.
    pub phase_deadline: u64,
    pub phase: Phase,
    /// Cumulative commitment over every accepted attachment.
    pub state_hash: Digest,
    /// Account keys in registration order; this is the canonical turn order.
    pub participants: Vec<PublicKey>,
    /// Index of the participant expected to act next during processing.
    pub assignee: u8,
    /// Final plaintext recipient list, set by the distribution submission.
    /// Its order fixes the transfer order at finalize.
    pub recipients: Vec<PublicKey>,
    /// Digest of the final plaintext recipient list, once submitted.
    pub recipients_digest: Option<Digest>,
    /// Index that opened the blame path, if any.
    pub cancelling: Option<u8>,
}

impl Shuffling {
    pub fn registered(&self) -> u8 {
        self.participants.len() as u8
    }

    pub fn is_full(&self) -> bool {
        self.registered() == self.participant_count
    }

    pub fn participant_index(&self, account: &PublicKey) -> Option<u8> {
        self.participants
            .iter()
            .position(|p| p == account)
            .map(|i| i as u8)
    }

    /// Index of the last participant, the one that submits the plaintext
    /// recipient list instead of encrypted blobs.
    pub fn last_index(&self) -> u8 {
        self.participant_count - 1
    }

    pub fn verify_state_hash(&self, claimed: &Digest) -> bool {
        self.state_hash == *claimed
    }

    /// Advance the chain with the canonical bytes of an accepted attachment.
    pub fn advance_state_hash(&mut self, attachment_bytes: &[u8]) {
        self.state_hash = next_state_hash(&self.state_hash, attachment_bytes);
    }
}

impl Write for Shuffling {
    fn write(&self, writer: &mut impl BufMut) {
        self.id.write(writer);
        self.holding_id.write(writer);
        self.amount.write(writer);
        self.participant_count.write(writer);
        self.registration_deadline.write(writer);
        self.phase_deadline.write(writer);
        self.phase.write(writer);
        self.state_hash.write(writer);
        (self.participants.len() as u8).write(writer);
        for participant in &self.participants {
            participant.write(writer);
        }
        self.assignee.write(writer);
        (self.recipients.len() as u8).write(writer);
        for recipient in &self.recipients {
            recipient.write(writer);
        }
        match &self.recipients_digest {
            Some(digest) => {
                1u8.write(writer);
                digest.write(writer);
            }
            None => 0u8.write(writer),
        }
        match self.cancelling {
            Some(index) => {
                1u8.write(writer);
                index.write(writer);
            }
            None => 0u8.write(writer),
        }
    }
}

impl Read for Shuffling {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let id = u64::read(reader)?;
        let holding_id = u64::read(reader)?;
        let amount = u64::read(reader)?;
        let participant_count = u8::read(reader)?;
        let registration_deadline = u64::read(reader)?;
        let phase_deadline = u64::read(reader)?;
        let phase = Phase::read(reader)?;
        let state_hash = Digest::read(reader)?;
        let registered = u8::read(reader)? as usize;
        if registered > MAX_SHUFFLING_PARTICIPANTS as usize {
            return Err(Error::Invalid("Shuffling", "too many participants"));
        }
        let mut participants = Vec::with_capacity(registered);
        for _ in 0..registered {
            participants.push(PublicKey::read(reader)?);
        }
        let assignee = u8::read(reader)?;
        let recipient_count = u8::read(reader)? as usize;
        if recipient_count > MAX_SHUFFLING_PARTICIPANTS as usize {
            return Err(Error::Invalid("Shuffling", "too many recipients"));
        }
        let mut recipients = Vec::with_capacity(recipient_count);
        for _ in 0..recipient_count {
            recipients.push(PublicKey::read(reader)?);
        }
        let recipients_digest = match u8::read(reader)? {
            0 => None,
            1 => Some(Digest::read(reader)?),
            flag => return Err(Error::InvalidEnum(flag)),
        };
        let cancelling = match u8::read(reader)? {
            0 => None,
            1 => Some(u8::read(reader)?),
            flag => return Err(Error::InvalidEnum(flag)),
        };
        Ok(Self {
            id,
            holding_id,
            amount,
            participant_count,
            registration_deadline,
            phase_deadline,
            phase,
            state_hash,
            participants,
            assignee,
            recipients,
            recipients_digest,
            cancelling,
        })
    }
}

impl EncodeSize for Shuffling {
    fn encode_size(&self) -> usize {
        8 + 8
            + 8
            + 1
            + 8
            + 8
            + 1
            + 32
            + 1
            + self.participants.len() * 32
            + 1
            + 1
            + self.recipients.len() * 32
            + 1
            + self.recipients_digest.map_or(0, |_| 32)
            + 1
            + self.cancelling.map_or(0, |_| 1)
    }
}

/// One participant of a mixing instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Participant {
    pub account: PublicKey,
    /// x25519 public key the participant's onion layers are addressed to,
    /// supplied at registration.
    pub shuffle_key: [u8; 32],
    /// Dense registration index, 0..count-1.
    pub index: u8,
    pub status: ParticipantStatus,
    /// Digest of the participant's processing submission, once accepted.
    pub payload_digest: Option<Digest>,
    /// Key seed revealed during the blame window, if any.
    pub revealed_seed: Option<[u8; 32]>,
}

impl Participant {
    pub fn new(account: PublicKey, shuffle_key: [u8; 32], index: u8) -> Self {
        Self {
            account,
            shuffle_key,
            index,
            status: ParticipantStatus::Registered,
            payload_digest: None,
            revealed_seed: None,
        }
    }
}

impl Write for Participant {
    fn write(&self, writer: &mut impl BufMut) {
        self.account.write(writer);
        write_bytes32(&self.shuffle_key, writer);
        self.index.write(writer);
        self.status.write(writer);
        match &self.payload_digest {
            Some(digest) => {
                1u8.write(writer);
                digest.write(writer);
            }
            None => 0u8.write(writer),
        }
        match &self.revealed_seed {
            Some(seed) => {
                1u8.write(writer);
                write_bytes32(seed, writer);
            }
            None => 0u8.write(writer),
        }
    }
}

impl Read for Participant {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let account = PublicKey::read(reader)?;
        let shuffle_key = read_bytes32(reader)?;
        let index = u8::read(reader)?;
        let status = ParticipantStatus::read(reader)?;
        let payload_digest = match u8::read(reader)? {
            0 => None,
            1 => Some(Digest::read(reader)?),
            flag => return Err(Error::InvalidEnum(flag)),
        };
        let revealed_seed = match u8::read(reader)? {
            0 => None,
            1 => Some(read_bytes32(reader)?),
            flag => return Err(Error::InvalidEnum(flag)),
        };
        Ok(Self {
            account,
            shuffle_key,
            index,
            status,
            payload_digest,
            revealed_seed,
        })
    }
}

impl EncodeSize for Participant {
    fn encode_size(&self) -> usize {
        32 + 32
            + 1
            + 1
            + 1
            + self.payload_digest.map_or(0, |_| 32)
            + 1
            + self.revealed_seed.map_or(0, |_| 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_advances_forward() {
        use ParticipantStatus::*;
        assert!(Registered.can_become(Processed));
        assert!(Registered.can_become(Verified));
        assert!(Processed.can_become(Verified));
        assert!(!Processed.can_become(Registered));
        assert!(!Verified.can_become(Processed));
        // Blamed is reachable from anywhere and terminal.
        assert!(Registered.can_become(Blamed));
        assert!(Verified.can_become(Blamed));
        assert!(!Blamed.can_become(Registered));
        assert!(!Blamed.can_become(Verified));
        assert!(!Blamed.can_become(Blamed));
    }

    #[test]
    fn chain_fold_is_order_sensitive_and_deterministic() {
        let creation = b"creation".as_slice();
        let a = b"first".as_slice();
        let b = b"second".as_slice();

        let forward = fold_state_hash(creation, [a, b]);
        let again = fold_state_hash(creation, [a, b]);
        let reversed = fold_state_hash(creation, [b, a]);

        assert_eq!(forward, again);
        assert_ne!(forward, reversed);
        assert_eq!(fold_state_hash(creation, []), initial_state_hash(creation));
    }

    #[test]
    fn submission_shape_is_a_function_of_count_and_index() {
        // Three participants: 2 blobs, then 1 blob, then the plaintext list.
        assert_eq!(expected_blob_count(3, 0), 2);
        assert_eq!(expected_blob_count(3, 1), 1);
        assert_eq!(expected_blob_count(3, 2), 0);

        // Blob length loses exactly one layer of overhead per step.
        assert_eq!(expected_blob_len(3, 0), RECIPIENT_LEN + 2 * LAYER_OVERHEAD);
        assert_eq!(expected_blob_len(3, 1), RECIPIENT_LEN + LAYER_OVERHEAD);
        for index in 0..MAX_SHUFFLING_PARTICIPANTS - 1 {
            assert_eq!(
                expected_blob_len(MAX_SHUFFLING_PARTICIPANTS, index)
                    - expected_blob_len(MAX_SHUFFLING_PARTICIPANTS, index + 1),
                LAYER_OVERHEAD
            );
        }
    }
}
