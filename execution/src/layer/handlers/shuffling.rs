use super::super::*;
use crate::ledger::LedgerError;
use commonware_cryptography::{
    sha256::{Digest, Sha256},
    Hasher as _,
};
use obscura_types::error::{ProtocolViolation, ValidationError};
use obscura_types::shuffling::{
    expected_blob_count, expected_blob_len, initial_state_hash, ProcessingData,
};
use std::collections::BTreeSet;

pub(crate) fn recipients_digest(recipients: &[PublicKey]) -> Digest {
    let mut hasher = Sha256::new();
    for recipient in recipients {
        hasher.update(recipient.as_ref());
    }
    hasher.finalize()
}

/// Digest a participant with no accepted processing data attests to.
fn empty_payload_digest() -> Digest {
    Sha256::hash(&[])
}

impl<'a, S: State> Layer<'a, S> {
    // === Shuffling Handlers ===

    fn reject(&self, public: &PublicKey, id: u64, error: ValidationError) -> Vec<Event> {
        debug!(account = ?public, id, %error, "rejecting shuffling submission");
        vec![Event::ShufflingRejected {
            account: public.clone(),
            id,
            code: error.code(),
            message: error.to_string(),
        }]
    }

    /// Lock the shuffled amount plus the native deposit. Balances are
    /// pre-checked so a failed submission stages no writes.
    async fn hold_stake(
        &mut self,
        public: &PublicKey,
        holding_id: u64,
        amount: u64,
    ) -> Result<Option<ValidationError>> {
        let deposit = self.config.deposit;
        let unwrap_hold = |result: Result<(), LedgerError>| match result {
            Ok(()) => Ok(()),
            Err(LedgerError::Insufficient { .. }) => {
                bail!("hold failed after balance pre-check")
            }
            Err(LedgerError::State(err)) => Err(err),
        };

        if holding_id == NATIVE_HOLDING {
            let required = amount.saturating_add(deposit);
            let available = self.balance(public, NATIVE_HOLDING).await?.available;
            if available < required {
                return Ok(Some(ValidationError::InsufficientFunds {
                    holding: NATIVE_HOLDING,
                    required,
                    available,
                }));
            }
            unwrap_hold(self.hold(public, NATIVE_HOLDING, required).await)?;
        } else {
            let available = self.balance(public, holding_id).await?.available;
            if available < amount {
                return Ok(Some(ValidationError::InsufficientFunds {
                    holding: holding_id,
                    required: amount,
                    available,
                }));
            }
            let native = self.balance(public, NATIVE_HOLDING).await?.available;
            if native < deposit {
                return Ok(Some(ValidationError::InsufficientFunds {
                    holding: NATIVE_HOLDING,
                    required: deposit,
                    available: native,
                }));
            }
            unwrap_hold(self.hold(public, holding_id, amount).await)?;
            unwrap_hold(self.hold(public, NATIVE_HOLDING, deposit).await)?;
        }
        Ok(None)
    }

    pub(in crate::layer) async fn handle_shuffling_creation(
        &mut self,
        public: &PublicKey,
        instruction: &Instruction,
    ) -> Result<Vec<Event>> {
        let Instruction::ShufflingCreation {
            id,
            holding_id,
            amount,
            participant_count,
            registration_period,
            shuffle_key,
        } = instruction
        else {
            bail!("internal error: handle_shuffling_creation called with wrong instruction");
        };
        let (id, holding_id, amount) = (*id, *holding_id, *amount);
        let (participant_count, registration_period) = (*participant_count, *registration_period);

        if !self.authorizer.is_allowed(public) {
            return Ok(self.reject(public, id, ValidationError::NotAuthorized));
        }
        if self.load_shuffling(id).await?.is_some() {
            return Ok(self.reject(public, id, ValidationError::IdInUse(id)));
        }
        if participant_count < self.config.min_participants
            || participant_count > self.config.max_participants
        {
            return Ok(self.reject(
                public,
                id,
                ValidationError::ParticipantCount {
                    got: participant_count,
                    min: self.config.min_participants,
                    max: self.config.max_participants,
                },
            ));
        }
        if registration_period == 0 || registration_period > self.config.max_registration_period {
            return Ok(self.reject(
                public,
                id,
                ValidationError::RegistrationPeriod {
                    got: registration_period,
                    max: self.config.max_registration_period,
                },
            ));
        }
        if amount == 0 {
            return Ok(self.reject(public, id, ValidationError::Amount(amount)));
        }
        if let Some(error) = self.hold_stake(public, holding_id, amount).await? {
            return Ok(self.reject(public, id, error));
        }

        let registration_deadline = self.height + registration_period;
        let shuffling = Shuffling {
            id,
            holding_id,
            amount,
            participant_count,
            registration_deadline,
            phase_deadline: registration_deadline,
            phase: Phase::Registration,
            state_hash: initial_state_hash(&instruction.chain_bytes()),
            participants: vec![public.clone()],
            assignee: 0,
            recipients: Vec::new(),
            recipients_digest: None,
            cancelling: None,
        };
        self.insert(
            Key::ShufflingParticipant(id, 0),
            Value::ShufflingParticipant(Participant::new(public.clone(), *shuffle_key, 0)),
        );
        self.insert(Key::Shuffling(id), Value::Shuffling(shuffling));
        self.set_registry_deadline(id, registration_deadline).await?;

        debug!(id, participant_count, "shuffling created");
        Ok(vec![
            Event::ShufflingCreated {
                id,
                issuer: public.clone(),
                holding_id,
                amount,
                participant_count,
                registration_deadline,
            },
            Event::ShufflingRegistered {
                id,
                account: public.clone(),
                index: 0,
            },
        ])
    }

    pub(in crate::layer) async fn handle_shuffling_registration(
        &mut self,
        public: &PublicKey,
        instruction: &Instruction,
    ) -> Result<Vec<Event>> {
        let Instruction::ShufflingRegistration {
            id,
            state_hash,
            shuffle_key,
        } = instruction
        else {
            bail!("internal error: handle_shuffling_registration called with wrong instruction");
        };
        let id = *id;

        let Some(mut shuffling) = self.load_shuffling(id).await? else {
            return Ok(self.reject(public, id, ValidationError::UnknownShuffling(id)));
        };
        if shuffling.phase != Phase::Registration {
            return Ok(self.reject(
                public,
                id,
                ValidationError::WrongPhase {
                    id,
                    phase: shuffling.phase.name(),
                    expected: Phase::Registration.name(),
                },
            ));
        }
        if self.height >= shuffling.registration_deadline {
            return Ok(self.reject(public, id, ValidationError::RegistrationClosed(id)));
        }
        if !shuffling.verify_state_hash(state_hash) {
            return Ok(self.reject(public, id, ValidationError::StaleStateHash));
        }
        if shuffling.participant_index(public).is_some() {
            return Ok(self.reject(public, id, ValidationError::AlreadyRegistered(id)));
        }
        if let Some(error) = self
            .hold_stake(public, shuffling.holding_id, shuffling.amount)
            .await?
        {
            return Ok(self.reject(public, id, error));
        }

        let index = shuffling.registered();
        shuffling.participants.push(public.clone());
        shuffling.advance_state_hash(&instruction.chain_bytes());
        self.insert(
            Key::ShufflingParticipant(id, index),
            Value::ShufflingParticipant(Participant::new(public.clone(), *shuffle_key, index)),
        );

        if shuffling.is_full() {
            shuffling.phase = Phase::Processing;
            shuffling.assignee = 0;
            shuffling.phase_deadline = self.height + self.config.processing_window;
            self.set_registry_deadline(id, shuffling.phase_deadline).await?;
            debug!(id, "registration complete; processing begins");
        }
        self.insert(Key::Shuffling(id), Value::Shuffling(shuffling));

        Ok(vec![Event::ShufflingRegistered {
            id,
            account: public.clone(),
            index,
        }])
    }

    pub(in crate::layer) async fn handle_shuffling_processing(
        &mut self,
        public: &PublicKey,
        instruction: &Instruction,
    ) -> Result<Vec<Event>> {
        let Instruction::ShufflingProcessing {
            id,
            state_hash,
            data,
        } = instruction
        else {
            bail!("internal error: handle_shuffling_processing called with wrong instruction");
        };
        let id = *id;

        let Some(mut shuffling) = self.load_shuffling(id).await? else {
            return Ok(self.reject(public, id, ValidationError::UnknownShuffling(id)));
        };
        if shuffling.phase != Phase::Processing {
            return Ok(self.reject(
                public,
                id,
                ValidationError::WrongPhase {
                    id,
                    phase: shuffling.phase.name(),
                    expected: Phase::Processing.name(),
                },
            ));
        }
        let Some(index) = shuffling.participant_index(public) else {
            return Ok(self.reject(public, id, ValidationError::NotRegistered(id)));
        };
        // The last participant publishes the plaintext recipient list via a
        // distribution attachment, never encrypted blobs.
        if index != shuffling.assignee || index == shuffling.last_index() {
            return Ok(self.reject(public, id, ValidationError::WrongTurn { index }));
        }
        let mut participant = self
            .load_participant(id, index)
            .await?
            .with_context(|| format!("missing participant {index} of shuffling {id}"))?;
        if !participant
            .status
            .can_become(ParticipantStatus::Processed)
        {
            return Ok(self.reject(public, id, ValidationError::StatusFinal { index }));
        }
        if !shuffling.verify_state_hash(state_hash) {
            return Ok(self.reject(public, id, ValidationError::StaleStateHash));
        }
        let Some(blobs) = data.blobs() else {
            return Ok(self.reject(public, id, ValidationError::PayloadMissing));
        };
        let expected_count = expected_blob_count(shuffling.participant_count, index);
        if blobs.len() != expected_count {
            return Ok(self.reject(
                public,
                id,
                ValidationError::BlobCount {
                    index,
                    got: blobs.len(),
                    expected: expected_count,
                },
            ));
        }
        let expected_len = expected_blob_len(shuffling.participant_count, index);
        for blob in blobs {
            if blob.len() != expected_len {
                return Ok(self.reject(
                    public,
                    id,
                    ValidationError::BlobLength {
                        got: blob.len(),
                        expected: expected_len,
                    },
                ));
            }
        }
        if !blobs.windows(2).all(|pair| pair[0] < pair[1]) {
            return Ok(self.reject(public, id, ValidationError::UnsortedBlobs));
        }

        let payload_digest = data.digest();
        self.store.insert(id, index, blobs.to_vec(), self.height);
        participant.payload_digest = Some(payload_digest);
        participant.status = ParticipantStatus::Processed;
        self.insert(
            Key::ShufflingParticipant(id, index),
            Value::ShufflingParticipant(participant),
        );

        shuffling.advance_state_hash(&instruction.chain_bytes());
        shuffling.assignee = index + 1;
        shuffling.phase_deadline = self.height + self.config.processing_window;
        self.set_registry_deadline(id, shuffling.phase_deadline).await?;
        self.insert(Key::Shuffling(id), Value::Shuffling(shuffling));

        debug!(id, index, "processing step accepted");
        Ok(vec![Event::ShufflingProcessingSubmitted {
            id,
            index,
            payload_digest,
            full_size: data.full_size() as u64,
        }])
    }

    pub(in crate::layer) async fn handle_shuffling_distribution(
        &mut self,
        public: &PublicKey,
        instruction: &Instruction,
    ) -> Result<Vec<Event>> {
        let Instruction::ShufflingDistribution {
            id,
            state_hash,
            recipients,
        } = instruction
        else {
            bail!("internal error: handle_shuffling_distribution called with wrong instruction");
        };
        let id = *id;

        let Some(mut shuffling) = self.load_shuffling(id).await? else {
            return Ok(self.reject(public, id, ValidationError::UnknownShuffling(id)));
        };
        if shuffling.phase != Phase::Processing {
            return Ok(self.reject(
                public,
                id,
                ValidationError::WrongPhase {
                    id,
                    phase: shuffling.phase.name(),
                    expected: Phase::Processing.name(),
                },
            ));
        }
        let Some(index) = shuffling.participant_index(public) else {
            return Ok(self.reject(public, id, ValidationError::NotRegistered(id)));
        };
        if index != shuffling.assignee || index != shuffling.last_index() {
            return Ok(self.reject(public, id, ValidationError::WrongTurn { index }));
        }
        let mut participant = self
            .load_participant(id, index)
            .await?
            .with_context(|| format!("missing participant {index} of shuffling {id}"))?;
        if !participant
            .status
            .can_become(ParticipantStatus::Processed)
        {
            return Ok(self.reject(public, id, ValidationError::StatusFinal { index }));
        }
        if !shuffling.verify_state_hash(state_hash) {
            return Ok(self.reject(public, id, ValidationError::StaleStateHash));
        }
        if recipients.len() != shuffling.participant_count as usize {
            return Ok(self.reject(
                public,
                id,
                ValidationError::RecipientCount {
                    got: recipients.len(),
                    expected: shuffling.participant_count as usize,
                },
            ));
        }
        let unique: BTreeSet<&PublicKey> = recipients.iter().collect();
        if unique.len() != recipients.len() {
            return Ok(self.reject(public, id, ValidationError::DuplicateRecipient));
        }

        let digest = recipients_digest(recipients);
        participant.payload_digest = Some(digest);
        // The submitter's list trivially matches its own digest.
        participant.status = ParticipantStatus::Verified;
        self.insert(
            Key::ShufflingParticipant(id, index),
            Value::ShufflingParticipant(participant),
        );

        shuffling.advance_state_hash(&instruction.chain_bytes());
        shuffling.recipients = recipients.clone();
        shuffling.recipients_digest = Some(digest);
        shuffling.phase = Phase::Verification;
        shuffling.phase_deadline = self.height + self.config.verification_window;
        self.set_registry_deadline(id, shuffling.phase_deadline).await?;
        self.insert(Key::Shuffling(id), Value::Shuffling(shuffling));

        debug!(id, "recipient list published; verification begins");
        Ok(vec![
            Event::ShufflingDistributionSubmitted {
                id,
                recipients_digest: digest,
            },
            Event::ShufflingVerified { id, index },
        ])
    }

    pub(in crate::layer) async fn handle_shuffling_verification(
        &mut self,
        public: &PublicKey,
        instruction: &Instruction,
    ) -> Result<Vec<Event>> {
        let Instruction::ShufflingVerification {
            id,
            state_hash,
            recipients,
        } = instruction
        else {
            bail!("internal error: handle_shuffling_verification called with wrong instruction");
        };
        let id = *id;

        let Some(mut shuffling) = self.load_shuffling(id).await? else {
            return Ok(self.reject(public, id, ValidationError::UnknownShuffling(id)));
        };
        if shuffling.phase != Phase::Verification {
            return Ok(self.reject(
                public,
                id,
                ValidationError::WrongPhase {
                    id,
                    phase: shuffling.phase.name(),
                    expected: Phase::Verification.name(),
                },
            ));
        }
        let Some(index) = shuffling.participant_index(public) else {
            return Ok(self.reject(public, id, ValidationError::NotRegistered(id)));
        };
        let mut participant = self
            .load_participant(id, index)
            .await?
            .with_context(|| format!("missing participant {index} of shuffling {id}"))?;
        if !participant
            .status
            .can_become(ParticipantStatus::Verified)
        {
            return Ok(self.reject(public, id, ValidationError::StatusFinal { index }));
        }
        if !shuffling.verify_state_hash(state_hash) {
            return Ok(self.reject(public, id, ValidationError::StaleStateHash));
        }

        // Structurally valid: the submission is accepted and committed either
        // way. A digest mismatch is a protocol violation, not a rejection.
        shuffling.advance_state_hash(&instruction.chain_bytes());

        let computed = recipients_digest(recipients);
        if Some(computed) != shuffling.recipients_digest {
            let violation = ProtocolViolation::RecipientDigestMismatch { id, index };
            warn!(id, index, %violation, "verification mismatch; opening blame");
            shuffling.phase = Phase::Blame;
            shuffling.cancelling = Some(index);
            shuffling.phase_deadline = self.height + self.config.blame_window;
            self.set_registry_deadline(id, shuffling.phase_deadline).await?;
            self.insert(Key::Shuffling(id), Value::Shuffling(shuffling));
            return Ok(vec![Event::ShufflingBlameOpened { id, accuser: index }]);
        }

        participant.status = ParticipantStatus::Verified;
        self.insert(
            Key::ShufflingParticipant(id, index),
            Value::ShufflingParticipant(participant),
        );

        let mut all_verified = true;
        for i in 0..shuffling.participant_count {
            let status = self
                .load_participant(id, i)
                .await?
                .with_context(|| format!("missing participant {i} of shuffling {id}"))?
                .status;
            if status != ParticipantStatus::Verified {
                all_verified = false;
                break;
            }
        }

        let mut events = vec![Event::ShufflingVerified { id, index }];
        if all_verified {
            events.extend(self.finalize_shuffling(shuffling).await?);
        } else {
            self.insert(Key::Shuffling(id), Value::Shuffling(shuffling));
        }
        Ok(events)
    }

    pub(in crate::layer) async fn handle_shuffling_cancellation(
        &mut self,
        public: &PublicKey,
        instruction: &Instruction,
    ) -> Result<Vec<Event>> {
        let Instruction::ShufflingCancellation {
            id,
            state_hash,
            payload_digest,
            key_seed,
        } = instruction
        else {
            bail!("internal error: handle_shuffling_cancellation called with wrong instruction");
        };
        let id = *id;

        let Some(mut shuffling) = self.load_shuffling(id).await? else {
            return Ok(self.reject(public, id, ValidationError::UnknownShuffling(id)));
        };
        if !matches!(
            shuffling.phase,
            Phase::Processing | Phase::Verification | Phase::Blame
        ) {
            return Ok(self.reject(
                public,
                id,
                ValidationError::WrongPhase {
                    id,
                    phase: shuffling.phase.name(),
                    expected: Phase::Blame.name(),
                },
            ));
        }
        let Some(index) = shuffling.participant_index(public) else {
            return Ok(self.reject(public, id, ValidationError::NotRegistered(id)));
        };
        let mut participant = self
            .load_participant(id, index)
            .await?
            .with_context(|| format!("missing participant {index} of shuffling {id}"))?;
        if participant.revealed_seed.is_some() {
            return Ok(self.reject(public, id, ValidationError::AlreadyRevealed { index }));
        }
        if !shuffling.verify_state_hash(state_hash) {
            return Ok(self.reject(public, id, ValidationError::StaleStateHash));
        }
        // The reveal must attest to the exact processing data this
        // participant committed earlier (or to none at all).
        let expected = participant.payload_digest.unwrap_or_else(empty_payload_digest);
        if *payload_digest != expected {
            return Ok(self.reject(public, id, ValidationError::PayloadDigestMismatch));
        }

        participant.revealed_seed = Some(*key_seed);
        self.insert(
            Key::ShufflingParticipant(id, index),
            Value::ShufflingParticipant(participant),
        );

        shuffling.advance_state_hash(&instruction.chain_bytes());
        let mut events = vec![Event::ShufflingKeyRevealed { id, index }];
        if shuffling.phase != Phase::Blame {
            shuffling.phase = Phase::Blame;
            shuffling.cancelling = Some(index);
            shuffling.phase_deadline = self.height + self.config.blame_window;
            self.set_registry_deadline(id, shuffling.phase_deadline).await?;
            info!(id, accuser = index, "blame opened");
            events.push(Event::ShufflingBlameOpened { id, accuser: index });
        }

        let mut all_revealed = true;
        for i in 0..shuffling.participant_count {
            let revealed = match self.load_participant(id, i).await? {
                Some(participant) => participant.revealed_seed.is_some(),
                None => false,
            };
            if !revealed {
                all_revealed = false;
                break;
            }
        }

        if all_revealed {
            events.extend(self.resolve_blame(shuffling).await?);
        } else {
            self.insert(Key::Shuffling(id), Value::Shuffling(shuffling));
        }
        Ok(events)
    }
}
