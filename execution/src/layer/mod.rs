use crate::auth::Authorizer;
use crate::blame;
use crate::ledger::{HoldingLedger as _, NATIVE_HOLDING};
use crate::state::{load_account, validate_and_increment_nonce, PrepareError, State, Status};
use crate::store::PrunableStore;
use crate::Config;
use anyhow::{bail, Context as _, Result};
use commonware_cryptography::ed25519::PublicKey;
use obscura_types::error::TimeoutExpiry;
use obscura_types::execution::{Event, Instruction, Key, Output, Registry, Transaction, Value};
use obscura_types::shuffling::{Participant, ParticipantStatus, Phase, Shuffling};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

mod handlers;

/// Applies one height's transactions against a read-only state snapshot,
/// buffering every write until [`Layer::commit`].
pub struct Layer<'a, S: State> {
    state: &'a S,
    pending: BTreeMap<Key, Status>,

    store: &'a mut PrunableStore,
    config: &'a Config,
    authorizer: &'a dyn Authorizer,
    height: u64,
}

impl<'a, S: State> Layer<'a, S> {
    pub fn new(
        state: &'a S,
        store: &'a mut PrunableStore,
        config: &'a Config,
        authorizer: &'a dyn Authorizer,
        height: u64,
    ) -> Self {
        Self {
            state,
            pending: BTreeMap::new(),
            store,
            config,
            authorizer,
            height,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    fn insert(&mut self, key: Key, value: Value) {
        self.pending.insert(key, Status::Update(value));
    }

    pub(crate) async fn load_shuffling(&self, id: u64) -> Result<Option<Shuffling>> {
        Ok(match self.get(&Key::Shuffling(id)).await? {
            Some(Value::Shuffling(shuffling)) => Some(shuffling),
            _ => None,
        })
    }

    pub(crate) async fn load_participant(&self, id: u64, index: u8) -> Result<Option<Participant>> {
        Ok(match self.get(&Key::ShufflingParticipant(id, index)).await? {
            Some(Value::ShufflingParticipant(participant)) => Some(participant),
            _ => None,
        })
    }

    async fn load_registry(&self) -> Result<Registry> {
        Ok(match self.get(&Key::ShufflingRegistry).await? {
            Some(Value::ShufflingRegistry(registry)) => registry,
            _ => Registry::default(),
        })
    }

    async fn set_registry_deadline(&mut self, id: u64, deadline: u64) -> Result<()> {
        let mut registry = self.load_registry().await?;
        registry.deadlines.insert(id, deadline);
        self.insert(Key::ShufflingRegistry, Value::ShufflingRegistry(registry));
        Ok(())
    }

    async fn clear_registry(&mut self, id: u64) -> Result<()> {
        let mut registry = self.load_registry().await?;
        registry.deadlines.remove(&id);
        self.insert(Key::ShufflingRegistry, Value::ShufflingRegistry(registry));
        Ok(())
    }

    async fn prepare(&mut self, transaction: &Transaction) -> Result<(), PrepareError> {
        let mut account = load_account(self, &transaction.public)
            .await
            .map_err(PrepareError::State)?;
        validate_and_increment_nonce(&mut account, transaction.nonce)?;
        self.insert(
            Key::Account(transaction.public.clone()),
            Value::Account(account),
        );

        Ok(())
    }

    async fn handle_deposit(
        &mut self,
        public: &PublicKey,
        holding_id: u64,
        amount: u64,
    ) -> Result<Vec<Event>> {
        self.credit(public, holding_id, amount).await?;
        Ok(vec![Event::Deposited {
            account: public.clone(),
            holding_id,
            amount,
        }])
    }

    async fn apply(&mut self, transaction: &Transaction) -> Result<Vec<Event>> {
        let instruction = &transaction.instruction;
        let public = &transaction.public;

        match instruction {
            Instruction::Deposit { holding_id, amount } => {
                self.handle_deposit(public, *holding_id, *amount).await
            }
            Instruction::ShufflingCreation { .. } => {
                self.handle_shuffling_creation(public, instruction).await
            }
            Instruction::ShufflingRegistration { .. } => {
                self.handle_shuffling_registration(public, instruction).await
            }
            Instruction::ShufflingProcessing { .. } => {
                self.handle_shuffling_processing(public, instruction).await
            }
            Instruction::ShufflingDistribution { .. } => {
                self.handle_shuffling_distribution(public, instruction).await
            }
            Instruction::ShufflingVerification { .. } => {
                self.handle_shuffling_verification(public, instruction).await
            }
            Instruction::ShufflingCancellation { .. } => {
                self.handle_shuffling_cancellation(public, instruction).await
            }
        }
    }

    /// Force every instance whose deadline has arrived. Runs before the
    /// height's transactions, so a deadline equal to the current height
    /// cancels at exactly that height.
    pub async fn expire(&mut self) -> Result<Vec<Event>> {
        let registry = self.load_registry().await?;
        let due: Vec<u64> = registry
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= self.height)
            .map(|(id, _)| *id)
            .collect();

        let mut events = Vec::new();
        for id in due {
            let Some(shuffling) = self.load_shuffling(id).await? else {
                self.clear_registry(id).await?;
                continue;
            };
            match shuffling.phase {
                Phase::Registration | Phase::Processing | Phase::Verification => {
                    let timeout = TimeoutExpiry {
                        id,
                        height: self.height,
                        phase: shuffling.phase.name(),
                    };
                    info!(%timeout, "cancelling shuffling on deadline");
                    events.extend(self.cancel_shuffling(shuffling, None).await?);
                }
                Phase::Blame => {
                    // The reveal window closed; resolve over whatever seeds
                    // were revealed.
                    events.extend(self.resolve_blame(shuffling).await?);
                }
                Phase::Done | Phase::Cancelled => {
                    self.clear_registry(id).await?;
                }
            }
        }
        Ok(events)
    }

    /// Settle a completed instance: move each held amount to the recipient
    /// at the same position of the final plaintext list. Iteration order is
    /// the recipient-list order, never registration order, so the transfer
    /// sequence itself leaks no mapping.
    async fn finalize_shuffling(&mut self, mut shuffling: Shuffling) -> Result<Vec<Event>> {
        let id = shuffling.id;
        let recipients = shuffling.recipients.clone();
        if recipients.len() != shuffling.participant_count as usize {
            bail!("finalize without a complete recipient list (shuffling={id})");
        }

        let mut transfers = Vec::with_capacity(recipients.len());
        for (position, recipient) in recipients.iter().enumerate() {
            let source = shuffling.participants[position].clone();
            self.transfer_held(&source, shuffling.holding_id, recipient, shuffling.amount)
                .await
                .with_context(|| format!("distribute shuffling {id}"))?;
            self.release(&source, NATIVE_HOLDING, self.config.deposit)
                .await
                .with_context(|| format!("release deposit for shuffling {id}"))?;
            transfers.push((recipient.clone(), shuffling.amount));
        }

        shuffling.phase = Phase::Done;
        self.insert(Key::Shuffling(id), Value::Shuffling(shuffling));
        self.clear_registry(id).await?;
        info!(id, "shuffling done");
        Ok(vec![Event::ShufflingDone { id, transfers }])
    }

    /// Cancel an instance: refund every participant's held amount, refund
    /// deposits of everyone except the blamed participant, whose deposit is
    /// forfeited to the fee sink.
    async fn cancel_shuffling(
        &mut self,
        mut shuffling: Shuffling,
        blamed: Option<u8>,
    ) -> Result<Vec<Event>> {
        let id = shuffling.id;
        let mut forfeited = 0;
        for index in 0..shuffling.registered() {
            let account = shuffling.participants[index as usize].clone();
            self.release(&account, shuffling.holding_id, shuffling.amount)
                .await
                .with_context(|| format!("refund shuffling {id}"))?;
            if blamed == Some(index) {
                self.forfeit_held(&account, self.config.deposit)
                    .await
                    .with_context(|| format!("forfeit deposit for shuffling {id}"))?;
                forfeited = self.config.deposit;
                if let Some(mut participant) = self.load_participant(id, index).await? {
                    participant.status = ParticipantStatus::Blamed;
                    self.insert(
                        Key::ShufflingParticipant(id, index),
                        Value::ShufflingParticipant(participant),
                    );
                }
            } else {
                self.release(&account, NATIVE_HOLDING, self.config.deposit)
                    .await
                    .with_context(|| format!("refund deposit for shuffling {id}"))?;
            }
        }

        shuffling.phase = Phase::Cancelled;
        self.insert(Key::Shuffling(id), Value::Shuffling(shuffling));
        self.clear_registry(id).await?;
        Ok(vec![Event::ShufflingCancelled {
            id,
            blamed,
            forfeited,
        }])
    }

    /// Run the blame replay over recorded chain data and revealed seeds,
    /// then cancel with the verdict.
    pub(crate) async fn resolve_blame(&mut self, shuffling: Shuffling) -> Result<Vec<Event>> {
        let id = shuffling.id;
        let count = shuffling.participant_count;

        let mut participants = Vec::with_capacity(count as usize);
        for index in 0..count {
            let participant = self
                .load_participant(id, index)
                .await?
                .with_context(|| format!("missing participant {index} of shuffling {id}"))?;
            participants.push(participant);
        }

        let mut payloads: Vec<Option<Vec<Vec<u8>>>> = Vec::with_capacity(count as usize);
        for participant in participants.iter().take(count as usize - 1) {
            if participant.payload_digest.is_some() {
                // Inside the dispute window the payload must still be held;
                // the retention policy forbids pruning live instances.
                let blobs = self
                    .store
                    .replay_blobs(id, participant.index)
                    .map_err(|unavailable| anyhow::anyhow!(unavailable))
                    .with_context(|| format!("blame replay for shuffling {id}"))?;
                payloads.push(Some(blobs));
            } else {
                payloads.push(None);
            }
        }
        if shuffling.recipients.is_empty() {
            payloads.push(None);
        } else {
            payloads.push(Some(
                shuffling
                    .recipients
                    .iter()
                    .map(|recipient| recipient.as_ref().to_vec())
                    .collect(),
            ));
        }

        match blame::resolve(&shuffling, &participants, &payloads) {
            Some(violation) => {
                warn!(id, %violation, "blame resolved");
                let blamed = violation.blamed();
                self.cancel_shuffling(shuffling, Some(blamed)).await
            }
            None => self.cancel_shuffling(shuffling, None).await,
        }
    }

    pub async fn execute(
        &mut self,
        transactions: Vec<Transaction>,
    ) -> Result<(Vec<Output>, BTreeMap<PublicKey, u64>)> {
        let mut processed_nonces = BTreeMap::new();
        let mut outputs = Vec::new();

        for tx in transactions {
            match self.prepare(&tx).await {
                Ok(()) => {}
                Err(PrepareError::NonceMismatch { expected, got }) => {
                    debug!(
                        public = ?tx.public,
                        expected,
                        got,
                        "nonce mismatch; dropping transaction"
                    );
                    continue;
                }
                Err(PrepareError::State(err)) => {
                    return Err(err).context("state error during prepare");
                }
            }
            processed_nonces.insert(tx.public.clone(), tx.nonce.saturating_add(1));
            outputs.extend(self.apply(&tx).await?.into_iter().map(Output::Event));
            outputs.push(Output::Transaction(tx));
        }

        Ok((outputs, processed_nonces))
    }

    pub fn commit(self) -> Vec<(Key, Status)> {
        self.pending.into_iter().collect()
    }
}

impl<'a, S: State> State for Layer<'a, S> {
    async fn get(&self, key: &Key) -> Result<Option<Value>> {
        Ok(match self.pending.get(key) {
            Some(Status::Update(value)) => Some(value.clone()),
            Some(Status::Delete) => None,
            None => self.state.get(key).await?,
        })
    }

    async fn insert(&mut self, key: Key, value: Value) -> Result<()> {
        self.pending.insert(key, Status::Update(value));
        Ok(())
    }

    async fn delete(&mut self, key: &Key) -> Result<()> {
        self.pending.insert(key.clone(), Status::Delete);
        Ok(())
    }
}
