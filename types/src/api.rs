//! Structured (JSON) representation of shuffling attachments and instances.
//!
//! Mirrors the binary fields: 64-bit identifiers as decimal strings (the full
//! unsigned range survives JavaScript consumers), byte arrays as lowercase
//! hex, blob lists as nested arrays. Converting to a view and back reproduces
//! the original instruction exactly.

use crate::execution::Instruction;
use crate::shuffling::{ProcessingData, Shuffling};
use commonware_codec::ReadExt;
use commonware_cryptography::{ed25519::PublicKey, sha256::Digest};
use commonware_utils::{from_hex, hex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("instruction is not a shuffling attachment")]
    NotAnAttachment,
    #[error("invalid decimal identifier in field {0}")]
    BadIdentifier(&'static str),
    #[error("invalid hex in field {0}")]
    BadHex(&'static str),
    #[error("invalid length for field {0}")]
    BadLength(&'static str),
}

fn encode_u64(value: u64) -> String {
    value.to_string()
}

fn parse_u64(s: &str, field: &'static str) -> Result<u64, ApiError> {
    s.parse::<u64>().map_err(|_| ApiError::BadIdentifier(field))
}

fn parse_bytes32(s: &str, field: &'static str) -> Result<[u8; 32], ApiError> {
    let bytes = from_hex(s).ok_or(ApiError::BadHex(field))?;
    bytes.try_into().map_err(|_| ApiError::BadLength(field))
}

fn encode_digest(digest: &Digest) -> String {
    hex(digest.as_ref())
}

fn parse_digest(s: &str, field: &'static str) -> Result<Digest, ApiError> {
    let bytes = parse_bytes32(s, field)?;
    Digest::read(&mut bytes.as_slice()).map_err(|_| ApiError::BadLength(field))
}

fn encode_public_keys(keys: &[PublicKey]) -> Vec<String> {
    keys.iter().map(|key| hex(key.as_ref())).collect()
}

fn parse_public_keys(keys: &[String], field: &'static str) -> Result<Vec<PublicKey>, ApiError> {
    keys.iter()
        .map(|s| {
            let bytes = from_hex(s).ok_or(ApiError::BadHex(field))?;
            PublicKey::read(&mut bytes.as_slice()).map_err(|_| ApiError::BadLength(field))
        })
        .collect()
}

/// JSON form of one shuffling attachment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AttachmentView {
    #[serde(rename_all = "camelCase")]
    Creation {
        shuffling: String,
        holding: String,
        amount: String,
        participant_count: u8,
        registration_period: String,
        shuffle_key: String,
    },
    #[serde(rename_all = "camelCase")]
    Registration {
        shuffling: String,
        shuffling_state_hash: String,
        shuffle_key: String,
    },
    #[serde(rename_all = "camelCase")]
    Processing {
        shuffling: String,
        shuffling_state_hash: String,
        /// Hex blobs; absent once the payload has been pruned.
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Vec<String>>,
        /// Digest of the blobs; always present.
        hash: String,
    },
    #[serde(rename_all = "camelCase")]
    Distribution {
        shuffling: String,
        shuffling_state_hash: String,
        recipient_public_keys: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Verification {
        shuffling: String,
        shuffling_state_hash: String,
        recipient_public_keys: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Cancellation {
        shuffling: String,
        shuffling_state_hash: String,
        hash: String,
        key_seed: String,
    },
}

impl TryFrom<&Instruction> for AttachmentView {
    type Error = ApiError;

    fn try_from(instruction: &Instruction) -> Result<Self, Self::Error> {
        let view = match instruction {
            Instruction::ShufflingCreation {
                id,
                holding_id,
                amount,
                participant_count,
                registration_period,
                shuffle_key,
            } => Self::Creation {
                shuffling: encode_u64(*id),
                holding: encode_u64(*holding_id),
                amount: encode_u64(*amount),
                participant_count: *participant_count,
                registration_period: encode_u64(*registration_period),
                shuffle_key: hex(shuffle_key),
            },
            Instruction::ShufflingRegistration {
                id,
                state_hash,
                shuffle_key,
            } => Self::Registration {
                shuffling: encode_u64(*id),
                shuffling_state_hash: encode_digest(state_hash),
                shuffle_key: hex(shuffle_key),
            },
            Instruction::ShufflingProcessing {
                id,
                state_hash,
                data,
            } => Self::Processing {
                shuffling: encode_u64(*id),
                shuffling_state_hash: encode_digest(state_hash),
                data: data
                    .blobs()
                    .map(|blobs| blobs.iter().map(|b| hex(b)).collect()),
                hash: encode_digest(&data.digest()),
            },
            Instruction::ShufflingDistribution {
                id,
                state_hash,
                recipients,
            } => Self::Distribution {
                shuffling: encode_u64(*id),
                shuffling_state_hash: encode_digest(state_hash),
                recipient_public_keys: encode_public_keys(recipients),
            },
            Instruction::ShufflingVerification {
                id,
                state_hash,
                recipients,
            } => Self::Verification {
                shuffling: encode_u64(*id),
                shuffling_state_hash: encode_digest(state_hash),
                recipient_public_keys: encode_public_keys(recipients),
            },
            Instruction::ShufflingCancellation {
                id,
                state_hash,
                payload_digest,
                key_seed,
            } => Self::Cancellation {
                shuffling: encode_u64(*id),
                shuffling_state_hash: encode_digest(state_hash),
                hash: encode_digest(payload_digest),
                key_seed: hex(key_seed),
            },
            Instruction::Deposit { .. } => return Err(ApiError::NotAnAttachment),
        };
        Ok(view)
    }
}

impl TryFrom<&AttachmentView> for Instruction {
    type Error = ApiError;

    fn try_from(view: &AttachmentView) -> Result<Self, Self::Error> {
        let instruction = match view {
            AttachmentView::Creation {
                shuffling,
                holding,
                amount,
                participant_count,
                registration_period,
                shuffle_key,
            } => Self::ShufflingCreation {
                id: parse_u64(shuffling, "shuffling")?,
                holding_id: parse_u64(holding, "holding")?,
                amount: parse_u64(amount, "amount")?,
                participant_count: *participant_count,
                registration_period: parse_u64(registration_period, "registrationPeriod")?,
                shuffle_key: parse_bytes32(shuffle_key, "shuffleKey")?,
            },
            AttachmentView::Registration {
                shuffling,
                shuffling_state_hash,
                shuffle_key,
            } => Self::ShufflingRegistration {
                id: parse_u64(shuffling, "shuffling")?,
                state_hash: parse_digest(shuffling_state_hash, "shufflingStateHash")?,
                shuffle_key: parse_bytes32(shuffle_key, "shuffleKey")?,
            },
            AttachmentView::Processing {
                shuffling,
                shuffling_state_hash,
                data,
                hash,
            } => {
                let data = match data {
                    Some(blobs) => ProcessingData::Present(
                        blobs
                            .iter()
                            .map(|b| from_hex(b).ok_or(ApiError::BadHex("data")))
                            .collect::<Result<_, _>>()?,
                    ),
                    None => ProcessingData::Hash(parse_digest(hash, "hash")?),
                };
                Self::ShufflingProcessing {
                    id: parse_u64(shuffling, "shuffling")?,
                    state_hash: parse_digest(shuffling_state_hash, "shufflingStateHash")?,
                    data,
                }
            }
            AttachmentView::Distribution {
                shuffling,
                shuffling_state_hash,
                recipient_public_keys,
            } => Self::ShufflingDistribution {
                id: parse_u64(shuffling, "shuffling")?,
                state_hash: parse_digest(shuffling_state_hash, "shufflingStateHash")?,
                recipients: parse_public_keys(recipient_public_keys, "recipientPublicKeys")?,
            },
            AttachmentView::Verification {
                shuffling,
                shuffling_state_hash,
                recipient_public_keys,
            } => Self::ShufflingVerification {
                id: parse_u64(shuffling, "shuffling")?,
                state_hash: parse_digest(shuffling_state_hash, "shufflingStateHash")?,
                recipients: parse_public_keys(recipient_public_keys, "recipientPublicKeys")?,
            },
            AttachmentView::Cancellation {
                shuffling,
                shuffling_state_hash,
                hash,
                key_seed,
            } => Self::ShufflingCancellation {
                id: parse_u64(shuffling, "shuffling")?,
                state_hash: parse_digest(shuffling_state_hash, "shufflingStateHash")?,
                payload_digest: parse_digest(hash, "hash")?,
                key_seed: parse_bytes32(key_seed, "keySeed")?,
            },
        };
        Ok(instruction)
    }
}

/// Read-only JSON summary of a shuffling instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShufflingSummary {
    pub shuffling: String,
    pub holding: String,
    pub amount: String,
    pub participant_count: u8,
    pub registered: u8,
    pub phase: String,
    pub state_hash: String,
    pub registration_deadline: String,
    pub phase_deadline: String,
    pub participants: Vec<String>,
    pub assignee: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipients_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelling: Option<u8>,
}

impl From<&Shuffling> for ShufflingSummary {
    fn from(shuffling: &Shuffling) -> Self {
        Self {
            shuffling: encode_u64(shuffling.id),
            holding: encode_u64(shuffling.holding_id),
            amount: encode_u64(shuffling.amount),
            participant_count: shuffling.participant_count,
            registered: shuffling.registered(),
            phase: shuffling.phase.name().to_string(),
            state_hash: encode_digest(&shuffling.state_hash),
            registration_deadline: encode_u64(shuffling.registration_deadline),
            phase_deadline: encode_u64(shuffling.phase_deadline),
            participants: encode_public_keys(&shuffling.participants),
            assignee: shuffling.assignee,
            recipients_hash: shuffling.recipients_digest.as_ref().map(encode_digest),
            cancelling: shuffling.cancelling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt as _, Signer as _};
    use commonware_cryptography::{Hasher as _, Sha256};

    fn digest(bytes: &[u8]) -> Digest {
        Sha256::hash(bytes)
    }

    fn public(seed: u64) -> PublicKey {
        PrivateKey::from_seed(seed).public_key()
    }

    #[test]
    fn identifiers_survive_the_full_u64_range() {
        let instruction = Instruction::ShufflingCreation {
            id: u64::MAX,
            holding_id: u64::MAX - 1,
            amount: 1,
            participant_count: 3,
            registration_period: 100,
            shuffle_key: [7u8; 32],
        };
        let view = AttachmentView::try_from(&instruction).expect("view");
        if let AttachmentView::Creation { shuffling, holding, .. } = &view {
            assert_eq!(shuffling, "18446744073709551615");
            assert_eq!(holding, "18446744073709551614");
        } else {
            panic!("expected creation view");
        }
        let back = Instruction::try_from(&view).expect("instruction");
        assert_eq!(back, instruction);
    }

    #[test]
    fn every_attachment_round_trips_through_json() {
        let variants = vec![
            Instruction::ShufflingCreation {
                id: 11,
                holding_id: 0,
                amount: 5_000,
                participant_count: 3,
                registration_period: 720,
                shuffle_key: [1u8; 32],
            },
            Instruction::ShufflingRegistration {
                id: 11,
                state_hash: digest(b"h0"),
                shuffle_key: [2u8; 32],
            },
            Instruction::ShufflingProcessing {
                id: 11,
                state_hash: digest(b"h1"),
                data: ProcessingData::Present(vec![vec![3u8; 128], vec![4u8; 128]]),
            },
            Instruction::ShufflingProcessing {
                id: 11,
                state_hash: digest(b"h1"),
                data: ProcessingData::Hash(digest(b"pruned")),
            },
            Instruction::ShufflingDistribution {
                id: 11,
                state_hash: digest(b"h2"),
                recipients: vec![public(1), public(2), public(3)],
            },
            Instruction::ShufflingVerification {
                id: 11,
                state_hash: digest(b"h3"),
                recipients: vec![public(1), public(2), public(3)],
            },
            Instruction::ShufflingCancellation {
                id: 11,
                state_hash: digest(b"h4"),
                payload_digest: digest(b"payload"),
                key_seed: [9u8; 32],
            },
        ];

        for instruction in variants {
            let view = AttachmentView::try_from(&instruction).expect("view");
            let json = serde_json::to_string(&view).expect("serialize");
            let parsed: AttachmentView = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(parsed, view);
            let back = Instruction::try_from(&parsed).expect("instruction");
            assert_eq!(back, instruction);
        }
    }

    #[test]
    fn pruned_processing_omits_data_but_keeps_the_hash() {
        let present = Instruction::ShufflingProcessing {
            id: 1,
            state_hash: digest(b"h"),
            data: ProcessingData::Present(vec![vec![5u8; 64]]),
        };
        let pruned = Instruction::ShufflingProcessing {
            id: 1,
            state_hash: digest(b"h"),
            data: ProcessingData::Present(vec![vec![5u8; 64]]).canonical(),
        };

        let present_json =
            serde_json::to_value(AttachmentView::try_from(&present).expect("view")).expect("json");
        let pruned_json =
            serde_json::to_value(AttachmentView::try_from(&pruned).expect("view")).expect("json");

        assert!(present_json.get("data").is_some());
        assert!(pruned_json.get("data").is_none());
        assert_eq!(present_json["hash"], pruned_json["hash"]);
    }

    #[test]
    fn deposit_is_not_an_attachment() {
        let err = AttachmentView::try_from(&Instruction::Deposit {
            holding_id: 0,
            amount: 1,
        })
        .expect_err("not an attachment");
        assert_eq!(err, ApiError::NotAnAttachment);
    }
}
