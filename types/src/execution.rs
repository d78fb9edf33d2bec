use crate::shuffling::{
    read_blob, read_bytes32, write_blob, write_bytes32, Participant, ProcessingData, Shuffling,
    MAX_SHUFFLING_PARTICIPANTS,
};
use bytes::{Buf, BufMut};
use commonware_codec::{Encode, EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::{
    ed25519::{self, PublicKey},
    sha256::{Digest, Sha256},
    Digestible, Hasher, Signer, Verifier,
};
use commonware_utils::union;
use std::collections::BTreeMap;

pub const NAMESPACE: &[u8] = b"_OBSCURA";
pub const TRANSACTION_SUFFIX: &[u8] = b"_TX";

/// Maximum length of a rejection message carried on an event.
pub const MAX_MESSAGE_LENGTH: usize = 256;

#[inline]
pub fn transaction_namespace(namespace: &[u8]) -> Vec<u8> {
    union(namespace, TRANSACTION_SUFFIX)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub instruction: Instruction,

    pub public: ed25519::PublicKey,
    pub signature: ed25519::Signature,
}

impl Transaction {
    fn payload(nonce: &u64, instruction: &Instruction) -> Vec<u8> {
        let mut payload = Vec::new();
        nonce.write(&mut payload);
        instruction.write(&mut payload);

        payload
    }

    pub fn sign(private: &ed25519::PrivateKey, nonce: u64, instruction: Instruction) -> Self {
        let signature = private.sign(
            Some(&transaction_namespace(NAMESPACE)),
            &Self::payload(&nonce, &instruction),
        );

        Self {
            nonce,
            instruction,
            public: private.public_key(),
            signature,
        }
    }

    pub fn verify(&self) -> bool {
        self.public.verify(
            Some(&transaction_namespace(NAMESPACE)),
            &Self::payload(&self.nonce, &self.instruction),
            &self.signature,
        )
    }
}

impl Write for Transaction {
    fn write(&self, writer: &mut impl BufMut) {
        self.nonce.write(writer);
        self.instruction.write(writer);
        self.public.write(writer);
        self.signature.write(writer);
    }
}

impl Read for Transaction {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let nonce = u64::read(reader)?;
        let instruction = Instruction::read(reader)?;
        let public = ed25519::PublicKey::read(reader)?;
        let signature = ed25519::Signature::read(reader)?;

        Ok(Self {
            nonce,
            instruction,
            public,
            signature,
        })
    }
}

impl EncodeSize for Transaction {
    fn encode_size(&self) -> usize {
        self.nonce.encode_size()
            + self.instruction.encode_size()
            + self.public.encode_size()
            + self.signature.encode_size()
    }
}

impl Digestible for Transaction {
    type Digest = Digest;

    fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(self.nonce.to_be_bytes().as_ref());
        hasher.update(self.instruction.encode().as_ref());
        hasher.update(self.public.as_ref());
        // We don't include the signature as part of the digest (any valid
        // signature will be valid for the transaction)
        hasher.finalize()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Instruction {
    /// Credit a holding balance (dev/test faucet).
    /// Binary: [1] [holdingId:u64 BE] [amount:u64 BE]
    Deposit { holding_id: u64, amount: u64 },

    // Shuffling attachments (tags 10-15). Every attachment after creation
    // starts with the shared header: [shufflingId:u64 BE] [stateHash:32].
    /// Open a new shuffling and register the issuer as participant 0.
    /// Binary: [10] [id:u64 BE] [holdingId:u64 BE] [amount:u64 BE]
    ///         [participantCount:u8] [registrationPeriod:u64 BE] [shuffleKey:32]
    ShufflingCreation {
        id: u64,
        holding_id: u64,
        amount: u64,
        participant_count: u8,
        registration_period: u64,
        shuffle_key: [u8; 32],
    },

    /// Join an open shuffling.
    /// Binary: [11] [header] [shuffleKey:32]
    ShufflingRegistration {
        id: u64,
        state_hash: Digest,
        shuffle_key: [u8; 32],
    },

    /// Submit one processing step's encrypted blobs (or their digest).
    /// Binary: [12] [header] [ProcessingData]
    ShufflingProcessing {
        id: u64,
        state_hash: Digest,
        data: ProcessingData,
    },

    /// Last contributor's plaintext recipient list.
    /// Binary: [13] [header] [count:u8] [recipient:32]*
    ShufflingDistribution {
        id: u64,
        state_hash: Digest,
        recipients: Vec<PublicKey>,
    },

    /// Confirm the recipient list a participant independently decrypted.
    /// Binary: [14] [header] [count:u8] [recipient:32]*
    ShufflingVerification {
        id: u64,
        state_hash: Digest,
        recipients: Vec<PublicKey>,
    },

    /// Call for cancellation and reveal the sender's layer key seed.
    /// Binary: [15] [header] [payloadDigest:32] [keySeed:32]
    ShufflingCancellation {
        id: u64,
        state_hash: Digest,
        payload_digest: Digest,
        key_seed: [u8; 32],
    },
}

fn write_recipients(recipients: &[PublicKey], writer: &mut impl BufMut) {
    (recipients.len() as u8).write(writer);
    for recipient in recipients {
        recipient.write(writer);
    }
}

fn read_recipients(reader: &mut impl Buf) -> Result<Vec<PublicKey>, Error> {
    let count = u8::read(reader)? as usize;
    if count > MAX_SHUFFLING_PARTICIPANTS as usize {
        return Err(Error::Invalid("Instruction", "too many recipients"));
    }
    let mut recipients = Vec::with_capacity(count);
    for _ in 0..count {
        recipients.push(PublicKey::read(reader)?);
    }
    Ok(recipients)
}

impl Instruction {
    /// Shuffling instance the instruction addresses, if any.
    pub fn shuffling_id(&self) -> Option<u64> {
        match self {
            Self::Deposit { .. } => None,
            Self::ShufflingCreation { id, .. }
            | Self::ShufflingRegistration { id, .. }
            | Self::ShufflingProcessing { id, .. }
            | Self::ShufflingDistribution { id, .. }
            | Self::ShufflingVerification { id, .. }
            | Self::ShufflingCancellation { id, .. } => Some(*id),
        }
    }

    /// Canonical bytes committed to by the state hash chain.
    ///
    /// Processing payloads are committed in digest-only form so the chain is
    /// unaffected when blobs are pruned later.
    pub fn chain_bytes(&self) -> Vec<u8> {
        match self {
            Self::ShufflingProcessing {
                id,
                state_hash,
                data,
            } => Self::ShufflingProcessing {
                id: *id,
                state_hash: *state_hash,
                data: data.canonical(),
            }
            .encode()
            .to_vec(),
            _ => self.encode().to_vec(),
        }
    }
}

impl Write for Instruction {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Deposit { holding_id, amount } => {
                1u8.write(writer);
                holding_id.write(writer);
                amount.write(writer);
            }
            Self::ShufflingCreation {
                id,
                holding_id,
                amount,
                participant_count,
                registration_period,
                shuffle_key,
            } => {
                10u8.write(writer);
                id.write(writer);
                holding_id.write(writer);
                amount.write(writer);
                participant_count.write(writer);
                registration_period.write(writer);
                write_bytes32(shuffle_key, writer);
            }
            Self::ShufflingRegistration {
                id,
                state_hash,
                shuffle_key,
            } => {
                11u8.write(writer);
                id.write(writer);
                state_hash.write(writer);
                write_bytes32(shuffle_key, writer);
            }
            Self::ShufflingProcessing {
                id,
                state_hash,
                data,
            } => {
                12u8.write(writer);
                id.write(writer);
                state_hash.write(writer);
                data.write(writer);
            }
            Self::ShufflingDistribution {
                id,
                state_hash,
                recipients,
            } => {
                13u8.write(writer);
                id.write(writer);
                state_hash.write(writer);
                write_recipients(recipients, writer);
            }
            Self::ShufflingVerification {
                id,
                state_hash,
                recipients,
            } => {
                14u8.write(writer);
                id.write(writer);
                state_hash.write(writer);
                write_recipients(recipients, writer);
            }
            Self::ShufflingCancellation {
                id,
                state_hash,
                payload_digest,
                key_seed,
            } => {
                15u8.write(writer);
                id.write(writer);
                state_hash.write(writer);
                payload_digest.write(writer);
                write_bytes32(key_seed, writer);
            }
        }
    }
}

impl Read for Instruction {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let instruction = match u8::read(reader)? {
            1 => Self::Deposit {
                holding_id: u64::read(reader)?,
                amount: u64::read(reader)?,
            },
            10 => Self::ShufflingCreation {
                id: u64::read(reader)?,
                holding_id: u64::read(reader)?,
                amount: u64::read(reader)?,
                participant_count: u8::read(reader)?,
                registration_period: u64::read(reader)?,
                shuffle_key: read_bytes32(reader)?,
            },
            11 => Self::ShufflingRegistration {
                id: u64::read(reader)?,
                state_hash: Digest::read(reader)?,
                shuffle_key: read_bytes32(reader)?,
            },
            12 => Self::ShufflingProcessing {
                id: u64::read(reader)?,
                state_hash: Digest::read(reader)?,
                data: ProcessingData::read(reader)?,
            },
            13 => Self::ShufflingDistribution {
                id: u64::read(reader)?,
                state_hash: Digest::read(reader)?,
                recipients: read_recipients(reader)?,
            },
            14 => Self::ShufflingVerification {
                id: u64::read(reader)?,
                state_hash: Digest::read(reader)?,
                recipients: read_recipients(reader)?,
            },
            15 => Self::ShufflingCancellation {
                id: u64::read(reader)?,
                state_hash: Digest::read(reader)?,
                payload_digest: Digest::read(reader)?,
                key_seed: read_bytes32(reader)?,
            },
            tag => return Err(Error::InvalidEnum(tag)),
        };
        Ok(instruction)
    }
}

impl EncodeSize for Instruction {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Deposit { .. } => 8 + 8,
            Self::ShufflingCreation { .. } => 8 + 8 + 8 + 1 + 8 + 32,
            Self::ShufflingRegistration { .. } => 8 + 32 + 32,
            Self::ShufflingProcessing { data, .. } => 8 + 32 + data.encode_size(),
            Self::ShufflingDistribution { recipients, .. }
            | Self::ShufflingVerification { recipients, .. } => {
                8 + 32 + 1 + recipients.len() * 32
            }
            Self::ShufflingCancellation { .. } => 8 + 32 + 32 + 32,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Deposited {
        account: PublicKey,
        holding_id: u64,
        amount: u64,
    },
    ShufflingCreated {
        id: u64,
        issuer: PublicKey,
        holding_id: u64,
        amount: u64,
        participant_count: u8,
        registration_deadline: u64,
    },
    ShufflingRegistered {
        id: u64,
        account: PublicKey,
        index: u8,
    },
    ShufflingProcessingSubmitted {
        id: u64,
        index: u8,
        payload_digest: Digest,
        full_size: u64,
    },
    ShufflingDistributionSubmitted {
        id: u64,
        recipients_digest: Digest,
    },
    ShufflingVerified {
        id: u64,
        index: u8,
    },
    ShufflingBlameOpened {
        id: u64,
        accuser: u8,
    },
    ShufflingKeyRevealed {
        id: u64,
        index: u8,
    },
    ShufflingDone {
        id: u64,
        transfers: Vec<(PublicKey, u64)>,
    },
    ShufflingCancelled {
        id: u64,
        blamed: Option<u8>,
        forfeited: u64,
    },
    ShufflingRejected {
        account: PublicKey,
        id: u64,
        code: u16,
        message: String,
    },
}

impl Write for Event {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Deposited {
                account,
                holding_id,
                amount,
            } => {
                0u8.write(writer);
                account.write(writer);
                holding_id.write(writer);
                amount.write(writer);
            }
            Self::ShufflingCreated {
                id,
                issuer,
                holding_id,
                amount,
                participant_count,
                registration_deadline,
            } => {
                1u8.write(writer);
                id.write(writer);
                issuer.write(writer);
                holding_id.write(writer);
                amount.write(writer);
                participant_count.write(writer);
                registration_deadline.write(writer);
            }
            Self::ShufflingRegistered { id, account, index } => {
                2u8.write(writer);
                id.write(writer);
                account.write(writer);
                index.write(writer);
            }
            Self::ShufflingProcessingSubmitted {
                id,
                index,
                payload_digest,
                full_size,
            } => {
                3u8.write(writer);
                id.write(writer);
                index.write(writer);
                payload_digest.write(writer);
                full_size.write(writer);
            }
            Self::ShufflingDistributionSubmitted {
                id,
                recipients_digest,
            } => {
                4u8.write(writer);
                id.write(writer);
                recipients_digest.write(writer);
            }
            Self::ShufflingVerified { id, index } => {
                5u8.write(writer);
                id.write(writer);
                index.write(writer);
            }
            Self::ShufflingBlameOpened { id, accuser } => {
                6u8.write(writer);
                id.write(writer);
                accuser.write(writer);
            }
            Self::ShufflingKeyRevealed { id, index } => {
                7u8.write(writer);
                id.write(writer);
                index.write(writer);
            }
            Self::ShufflingDone { id, transfers } => {
                8u8.write(writer);
                id.write(writer);
                (transfers.len() as u8).write(writer);
                for (recipient, amount) in transfers {
                    recipient.write(writer);
                    amount.write(writer);
                }
            }
            Self::ShufflingCancelled {
                id,
                blamed,
                forfeited,
            } => {
                9u8.write(writer);
                id.write(writer);
                match blamed {
                    Some(index) => {
                        1u8.write(writer);
                        index.write(writer);
                    }
                    None => 0u8.write(writer),
                }
                forfeited.write(writer);
            }
            Self::ShufflingRejected {
                account,
                id,
                code,
                message,
            } => {
                10u8.write(writer);
                account.write(writer);
                id.write(writer);
                code.write(writer);
                write_blob(message.as_bytes(), writer);
            }
        }
    }
}

impl Read for Event {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let event = match u8::read(reader)? {
            0 => Self::Deposited {
                account: PublicKey::read(reader)?,
                holding_id: u64::read(reader)?,
                amount: u64::read(reader)?,
            },
            1 => Self::ShufflingCreated {
                id: u64::read(reader)?,
                issuer: PublicKey::read(reader)?,
                holding_id: u64::read(reader)?,
                amount: u64::read(reader)?,
                participant_count: u8::read(reader)?,
                registration_deadline: u64::read(reader)?,
            },
            2 => Self::ShufflingRegistered {
                id: u64::read(reader)?,
                account: PublicKey::read(reader)?,
                index: u8::read(reader)?,
            },
            3 => Self::ShufflingProcessingSubmitted {
                id: u64::read(reader)?,
                index: u8::read(reader)?,
                payload_digest: Digest::read(reader)?,
                full_size: u64::read(reader)?,
            },
            4 => Self::ShufflingDistributionSubmitted {
                id: u64::read(reader)?,
                recipients_digest: Digest::read(reader)?,
            },
            5 => Self::ShufflingVerified {
                id: u64::read(reader)?,
                index: u8::read(reader)?,
            },
            6 => Self::ShufflingBlameOpened {
                id: u64::read(reader)?,
                accuser: u8::read(reader)?,
            },
            7 => Self::ShufflingKeyRevealed {
                id: u64::read(reader)?,
                index: u8::read(reader)?,
            },
            8 => {
                let id = u64::read(reader)?;
                let count = u8::read(reader)? as usize;
                if count > MAX_SHUFFLING_PARTICIPANTS as usize {
                    return Err(Error::Invalid("Event", "too many transfers"));
                }
                let mut transfers = Vec::with_capacity(count);
                for _ in 0..count {
                    transfers.push((PublicKey::read(reader)?, u64::read(reader)?));
                }
                Self::ShufflingDone { id, transfers }
            }
            9 => {
                let id = u64::read(reader)?;
                let blamed = match u8::read(reader)? {
                    0 => None,
                    1 => Some(u8::read(reader)?),
                    flag => return Err(Error::InvalidEnum(flag)),
                };
                let forfeited = u64::read(reader)?;
                Self::ShufflingCancelled {
                    id,
                    blamed,
                    forfeited,
                }
            }
            10 => {
                let account = PublicKey::read(reader)?;
                let id = u64::read(reader)?;
                let code = u16::read(reader)?;
                let bytes = read_blob(reader, MAX_MESSAGE_LENGTH)?;
                let message = String::from_utf8(bytes)
                    .map_err(|_| Error::Invalid("Event", "invalid UTF-8 in message"))?;
                Self::ShufflingRejected {
                    account,
                    id,
                    code,
                    message,
                }
            }
            tag => return Err(Error::InvalidEnum(tag)),
        };
        Ok(event)
    }
}

impl EncodeSize for Event {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Deposited { .. } => 32 + 8 + 8,
            Self::ShufflingCreated { .. } => 8 + 32 + 8 + 8 + 1 + 8,
            Self::ShufflingRegistered { .. } => 8 + 32 + 1,
            Self::ShufflingProcessingSubmitted { .. } => 8 + 1 + 32 + 8,
            Self::ShufflingDistributionSubmitted { .. } => 8 + 32,
            Self::ShufflingVerified { .. } => 8 + 1,
            Self::ShufflingBlameOpened { .. } => 8 + 1,
            Self::ShufflingKeyRevealed { .. } => 8 + 1,
            Self::ShufflingDone { transfers, .. } => 8 + 1 + transfers.len() * (32 + 8),
            Self::ShufflingCancelled { blamed, .. } => 8 + 1 + blamed.map_or(0, |_| 1) + 8,
            Self::ShufflingRejected { message, .. } => 32 + 8 + 2 + 4 + message.len(),
        }
    }
}

/// Account state: only the replay-protection nonce; balances live under
/// [`Key::Holding`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
}

impl Write for Account {
    fn write(&self, writer: &mut impl BufMut) {
        self.nonce.write(writer);
    }
}

impl Read for Account {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            nonce: u64::read(reader)?,
        })
    }
}

impl EncodeSize for Account {
    fn encode_size(&self) -> usize {
        8
    }
}

/// Balance of one (account, holding) pair. `held` is owned by the shuffling
/// instance that locked it and is released only by finalize or cancel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HoldingBalance {
    pub available: u64,
    pub held: u64,
}

impl Write for HoldingBalance {
    fn write(&self, writer: &mut impl BufMut) {
        self.available.write(writer);
        self.held.write(writer);
    }
}

impl Read for HoldingBalance {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            available: u64::read(reader)?,
            held: u64::read(reader)?,
        })
    }
}

impl EncodeSize for HoldingBalance {
    fn encode_size(&self) -> usize {
        16
    }
}

/// Deadlines of every live shuffling instance, keyed by id. Drives the
/// per-height timeout sweep; an instance leaves the registry when it reaches
/// a terminal phase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Registry {
    pub deadlines: BTreeMap<u64, u64>,
}

impl Write for Registry {
    fn write(&self, writer: &mut impl BufMut) {
        (self.deadlines.len() as u32).write(writer);
        for (id, deadline) in &self.deadlines {
            id.write(writer);
            deadline.write(writer);
        }
    }
}

impl Read for Registry {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let count = u32::read(reader)? as usize;
        let mut deadlines = BTreeMap::new();
        for _ in 0..count {
            let id = u64::read(reader)?;
            let deadline = u64::read(reader)?;
            deadlines.insert(id, deadline);
        }
        Ok(Self { deadlines })
    }
}

impl EncodeSize for Registry {
    fn encode_size(&self) -> usize {
        4 + self.deadlines.len() * 16
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Account(PublicKey),
    Holding(PublicKey, u64),
    Shuffling(u64),
    ShufflingParticipant(u64, u8),
    ShufflingRegistry,
    FeeSink,
}

impl Write for Key {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Account(public) => {
                0u8.write(writer);
                public.write(writer);
            }
            Self::Holding(public, holding_id) => {
                1u8.write(writer);
                public.write(writer);
                holding_id.write(writer);
            }
            Self::Shuffling(id) => {
                2u8.write(writer);
                id.write(writer);
            }
            Self::ShufflingParticipant(id, index) => {
                3u8.write(writer);
                id.write(writer);
                index.write(writer);
            }
            Self::ShufflingRegistry => 4u8.write(writer),
            Self::FeeSink => 5u8.write(writer),
        }
    }
}

impl Read for Key {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let key = match u8::read(reader)? {
            0 => Self::Account(PublicKey::read(reader)?),
            1 => Self::Holding(PublicKey::read(reader)?, u64::read(reader)?),
            2 => Self::Shuffling(u64::read(reader)?),
            3 => Self::ShufflingParticipant(u64::read(reader)?, u8::read(reader)?),
            4 => Self::ShufflingRegistry,
            5 => Self::FeeSink,
            tag => return Err(Error::InvalidEnum(tag)),
        };
        Ok(key)
    }
}

impl EncodeSize for Key {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Account(_) => 32,
            Self::Holding(_, _) => 32 + 8,
            Self::Shuffling(_) => 8,
            Self::ShufflingParticipant(_, _) => 8 + 1,
            Self::ShufflingRegistry | Self::FeeSink => 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Value {
    Account(Account),
    Holding(HoldingBalance),
    Shuffling(Shuffling),
    ShufflingParticipant(Participant),
    ShufflingRegistry(Registry),
    FeeSink(u64),
    Commit { height: u64, start: u64 },
}

impl Write for Value {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Account(account) => {
                0u8.write(writer);
                account.write(writer);
            }
            Self::Holding(balance) => {
                1u8.write(writer);
                balance.write(writer);
            }
            Self::Shuffling(shuffling) => {
                2u8.write(writer);
                shuffling.write(writer);
            }
            Self::ShufflingParticipant(participant) => {
                3u8.write(writer);
                participant.write(writer);
            }
            Self::ShufflingRegistry(registry) => {
                4u8.write(writer);
                registry.write(writer);
            }
            Self::FeeSink(total) => {
                5u8.write(writer);
                total.write(writer);
            }
            Self::Commit { height, start } => {
                6u8.write(writer);
                height.write(writer);
                start.write(writer);
            }
        }
    }
}

impl Read for Value {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let value = match u8::read(reader)? {
            0 => Self::Account(Account::read(reader)?),
            1 => Self::Holding(HoldingBalance::read(reader)?),
            2 => Self::Shuffling(Shuffling::read(reader)?),
            3 => Self::ShufflingParticipant(Participant::read(reader)?),
            4 => Self::ShufflingRegistry(Registry::read(reader)?),
            5 => Self::FeeSink(u64::read(reader)?),
            6 => Self::Commit {
                height: u64::read(reader)?,
                start: u64::read(reader)?,
            },
            tag => return Err(Error::InvalidEnum(tag)),
        };
        Ok(value)
    }
}

impl EncodeSize for Value {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Account(account) => account.encode_size(),
            Self::Holding(balance) => balance.encode_size(),
            Self::Shuffling(shuffling) => shuffling.encode_size(),
            Self::ShufflingParticipant(participant) => participant.encode_size(),
            Self::ShufflingRegistry(registry) => registry.encode_size(),
            Self::FeeSink(_) => 8,
            Self::Commit { .. } => 16,
        }
    }
}

/// Entry of the append-only event log.
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Output {
    Transaction(Transaction),
    Event(Event),
    Commit { height: u64, start: u64 },
}

impl Write for Output {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Transaction(transaction) => {
                0u8.write(writer);
                transaction.write(writer);
            }
            Self::Event(event) => {
                1u8.write(writer);
                event.write(writer);
            }
            Self::Commit { height, start } => {
                2u8.write(writer);
                height.write(writer);
                start.write(writer);
            }
        }
    }
}

impl Read for Output {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let output = match u8::read(reader)? {
            0 => Self::Transaction(Transaction::read(reader)?),
            1 => Self::Event(Event::read(reader)?),
            2 => Self::Commit {
                height: u64::read(reader)?,
                start: u64::read(reader)?,
            },
            tag => return Err(Error::InvalidEnum(tag)),
        };
        Ok(output)
    }
}

impl EncodeSize for Output {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Transaction(transaction) => transaction.encode_size(),
            Self::Event(event) => event.encode_size(),
            Self::Commit { .. } => 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt as _};
    use proptest::prelude::*;

    fn keypair(seed: u64) -> (ed25519::PrivateKey, PublicKey) {
        let private = PrivateKey::from_seed(seed);
        let public = private.public_key();
        (private, public)
    }

    fn digest(bytes: &[u8]) -> Digest {
        Sha256::hash(bytes)
    }

    fn round_trip_instruction(instruction: Instruction) {
        let bytes = instruction.encode().to_vec();
        assert_eq!(bytes.len(), instruction.encode_size());
        let mut reader = bytes.as_slice();
        let decoded = Instruction::read(&mut reader).expect("decode");
        assert_eq!(decoded, instruction);
        assert_eq!(decoded.encode().to_vec(), bytes);
    }

    #[test]
    fn every_instruction_round_trips() {
        let (_, public) = keypair(1);
        for instruction in [
            Instruction::Deposit {
                holding_id: 3,
                amount: 10_000,
            },
            Instruction::ShufflingCreation {
                id: u64::MAX,
                holding_id: 0,
                amount: 1_000,
                participant_count: 5,
                registration_period: 720,
                shuffle_key: [3u8; 32],
            },
            Instruction::ShufflingRegistration {
                id: 8,
                state_hash: digest(b"h0"),
                shuffle_key: [4u8; 32],
            },
            Instruction::ShufflingProcessing {
                id: 8,
                state_hash: digest(b"h1"),
                data: ProcessingData::Present(vec![vec![1u8; 128], vec![2u8; 128]]),
            },
            Instruction::ShufflingProcessing {
                id: 8,
                state_hash: digest(b"h1"),
                data: ProcessingData::Hash(digest(b"pruned")),
            },
            Instruction::ShufflingDistribution {
                id: 8,
                state_hash: digest(b"h2"),
                recipients: vec![public.clone(), keypair(2).1, keypair(3).1],
            },
            Instruction::ShufflingVerification {
                id: 8,
                state_hash: digest(b"h3"),
                recipients: vec![public.clone(), keypair(2).1, keypair(3).1],
            },
            Instruction::ShufflingCancellation {
                id: 8,
                state_hash: digest(b"h4"),
                payload_digest: digest(b"payload"),
                key_seed: [5u8; 32],
            },
        ] {
            round_trip_instruction(instruction);
        }
    }

    #[test]
    fn chain_bytes_are_insensitive_to_pruning() {
        let blobs = vec![vec![7u8; 80], vec![8u8; 80]];
        let present = Instruction::ShufflingProcessing {
            id: 2,
            state_hash: digest(b"h"),
            data: ProcessingData::Present(blobs),
        };
        let pruned = Instruction::ShufflingProcessing {
            id: 2,
            state_hash: digest(b"h"),
            data: match &present {
                Instruction::ShufflingProcessing { data, .. } => data.canonical(),
                _ => unreachable!(),
            },
        };

        assert_eq!(present.chain_bytes(), pruned.chain_bytes());
        assert_ne!(present.encode().to_vec(), pruned.encode().to_vec());
    }

    #[test]
    fn transactions_sign_and_verify() {
        let (private, public) = keypair(42);
        let transaction = Transaction::sign(
            &private,
            7,
            Instruction::Deposit {
                holding_id: 0,
                amount: 500,
            },
        );
        assert_eq!(transaction.public, public);
        assert!(transaction.verify());

        let bytes = transaction.encode().to_vec();
        assert_eq!(bytes.len(), transaction.encode_size());
        let mut reader = bytes.as_slice();
        let decoded = Transaction::read(&mut reader).expect("decode");
        assert_eq!(decoded, transaction);
        assert!(decoded.verify());
        assert_eq!(decoded.digest(), transaction.digest());

        let mut tampered = decoded;
        tampered.nonce += 1;
        assert!(!tampered.verify());
    }

    #[test]
    fn events_round_trip() {
        let (_, public) = keypair(9);
        for event in [
            Event::Deposited {
                account: public.clone(),
                holding_id: 0,
                amount: 25,
            },
            Event::ShufflingCreated {
                id: 1,
                issuer: public.clone(),
                holding_id: 0,
                amount: 1_000,
                participant_count: 3,
                registration_deadline: 100,
            },
            Event::ShufflingRegistered {
                id: 1,
                account: public.clone(),
                index: 1,
            },
            Event::ShufflingProcessingSubmitted {
                id: 1,
                index: 0,
                payload_digest: digest(b"blobs"),
                full_size: 148,
            },
            Event::ShufflingDistributionSubmitted {
                id: 1,
                recipients_digest: digest(b"recipients"),
            },
            Event::ShufflingVerified { id: 1, index: 2 },
            Event::ShufflingBlameOpened { id: 1, accuser: 0 },
            Event::ShufflingKeyRevealed { id: 1, index: 1 },
            Event::ShufflingDone {
                id: 1,
                transfers: vec![(public.clone(), 1_000), (keypair(10).1, 1_000)],
            },
            Event::ShufflingCancelled {
                id: 1,
                blamed: Some(1),
                forfeited: 50,
            },
            Event::ShufflingCancelled {
                id: 1,
                blamed: None,
                forfeited: 0,
            },
            Event::ShufflingRejected {
                account: public,
                id: 1,
                code: 4,
                message: "shuffling state hash doesn't match".to_string(),
            },
        ] {
            let bytes = event.encode().to_vec();
            assert_eq!(bytes.len(), event.encode_size());
            let mut reader = bytes.as_slice();
            let decoded = Event::read(&mut reader).expect("decode");
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn keys_and_values_round_trip() {
        let (_, public) = keypair(3);
        for key in [
            Key::Account(public.clone()),
            Key::Holding(public.clone(), 7),
            Key::Shuffling(12),
            Key::ShufflingParticipant(12, 2),
            Key::ShufflingRegistry,
            Key::FeeSink,
        ] {
            let bytes = key.encode().to_vec();
            assert_eq!(bytes.len(), key.encode_size());
            let mut reader = bytes.as_slice();
            assert_eq!(Key::read(&mut reader).expect("decode"), key);
        }

        let mut registry = Registry::default();
        registry.deadlines.insert(12, 400);
        registry.deadlines.insert(13, 500);
        for value in [
            Value::Account(Account { nonce: 4 }),
            Value::Holding(HoldingBalance {
                available: 10,
                held: 5,
            }),
            Value::ShufflingRegistry(registry),
            Value::FeeSink(99),
            Value::Commit {
                height: 7,
                start: 21,
            },
        ] {
            let bytes = value.encode().to_vec();
            assert_eq!(bytes.len(), value.encode_size());
            let mut reader = bytes.as_slice();
            assert_eq!(Value::read(&mut reader).expect("decode"), value);
        }
    }

    proptest! {
        #[test]
        fn processing_round_trips_for_arbitrary_blobs(
            blobs in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..256), 1..8),
            id in any::<u64>(),
        ) {
            round_trip_instruction(Instruction::ShufflingProcessing {
                id,
                state_hash: Sha256::hash(&id.to_be_bytes()),
                data: ProcessingData::Present(blobs),
            });
        }

        #[test]
        fn instruction_decoding_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
            let mut reader = bytes.as_slice();
            let _ = Instruction::read(&mut reader);
        }
    }
}
