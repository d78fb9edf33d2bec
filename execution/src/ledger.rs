//! Hold/transfer/refund contract against per-(account, holding) balances.
//!
//! The shuffling core never mutates balances directly: funds are locked at
//! registration, and released by exactly one of finalize (transfer to a
//! recipient) or cancel (refund, with the deposit optionally forfeited).
//! Every operation either applies fully or signals why it cannot.

use crate::state::State;
use anyhow::{bail, Result};
use commonware_cryptography::ed25519::PublicKey;
use obscura_types::execution::{HoldingBalance, Key, Value};
use std::future::Future;

/// Holding id of the native coin.
pub const NATIVE_HOLDING: u64 = 0;

#[derive(Debug)]
pub enum LedgerError {
    Insufficient {
        holding: u64,
        required: u64,
        available: u64,
    },
    State(anyhow::Error),
}

pub trait HoldingLedger {
    /// Move `amount` from available to held. Fails atomically with an
    /// explicit insufficient-funds signal.
    fn hold(
        &mut self,
        account: &PublicKey,
        holding: u64,
        amount: u64,
    ) -> impl Future<Output = Result<(), LedgerError>>;

    /// Return `amount` of held funds to the owner's available balance.
    fn release(
        &mut self,
        account: &PublicKey,
        holding: u64,
        amount: u64,
    ) -> impl Future<Output = Result<()>>;

    /// Move `amount` of `from`'s held funds to `to`'s available balance.
    fn transfer_held(
        &mut self,
        from: &PublicKey,
        holding: u64,
        to: &PublicKey,
        amount: u64,
    ) -> impl Future<Output = Result<()>>;

    /// Forfeit `amount` of `from`'s held native funds to the fee sink.
    fn forfeit_held(
        &mut self,
        from: &PublicKey,
        amount: u64,
    ) -> impl Future<Output = Result<()>>;

    /// Credit available balance (issuance/faucet).
    fn credit(
        &mut self,
        account: &PublicKey,
        holding: u64,
        amount: u64,
    ) -> impl Future<Output = Result<()>>;

    fn balance(
        &self,
        account: &PublicKey,
        holding: u64,
    ) -> impl Future<Output = Result<HoldingBalance>>;
}

async fn load_balance<S: State>(
    state: &S,
    account: &PublicKey,
    holding: u64,
) -> Result<HoldingBalance> {
    Ok(
        match state.get(&Key::Holding(account.clone(), holding)).await? {
            Some(Value::Holding(balance)) => balance,
            _ => HoldingBalance::default(),
        },
    )
}

async fn store_balance<S: State>(
    state: &mut S,
    account: &PublicKey,
    holding: u64,
    balance: HoldingBalance,
) -> Result<()> {
    state
        .insert(Key::Holding(account.clone(), holding), Value::Holding(balance))
        .await
}

impl<S: State> HoldingLedger for S {
    async fn hold(
        &mut self,
        account: &PublicKey,
        holding: u64,
        amount: u64,
    ) -> Result<(), LedgerError> {
        let mut balance = load_balance(self, account, holding)
            .await
            .map_err(LedgerError::State)?;
        if balance.available < amount {
            return Err(LedgerError::Insufficient {
                holding,
                required: amount,
                available: balance.available,
            });
        }
        balance.available -= amount;
        balance.held += amount;
        store_balance(self, account, holding, balance)
            .await
            .map_err(LedgerError::State)
    }

    async fn release(&mut self, account: &PublicKey, holding: u64, amount: u64) -> Result<()> {
        let mut balance = load_balance(self, account, holding).await?;
        if balance.held < amount {
            bail!(
                "held balance underflow releasing {amount} of holding {holding} (held {})",
                balance.held
            );
        }
        balance.held -= amount;
        balance.available += amount;
        store_balance(self, account, holding, balance).await
    }

    async fn transfer_held(
        &mut self,
        from: &PublicKey,
        holding: u64,
        to: &PublicKey,
        amount: u64,
    ) -> Result<()> {
        let mut source = load_balance(self, from, holding).await?;
        if source.held < amount {
            bail!(
                "held balance underflow transferring {amount} of holding {holding} (held {})",
                source.held
            );
        }
        source.held -= amount;
        store_balance(self, from, holding, source).await?;

        let mut destination = load_balance(self, to, holding).await?;
        destination.available += amount;
        store_balance(self, to, holding, destination).await
    }

    async fn forfeit_held(&mut self, from: &PublicKey, amount: u64) -> Result<()> {
        let mut balance = load_balance(self, from, NATIVE_HOLDING).await?;
        if balance.held < amount {
            bail!(
                "held balance underflow forfeiting {amount} (held {})",
                balance.held
            );
        }
        balance.held -= amount;
        store_balance(self, from, NATIVE_HOLDING, balance).await?;

        let sink = match self.get(&Key::FeeSink).await? {
            Some(Value::FeeSink(total)) => total,
            _ => 0,
        };
        self.insert(Key::FeeSink, Value::FeeSink(sink + amount))
            .await
    }

    async fn credit(&mut self, account: &PublicKey, holding: u64, amount: u64) -> Result<()> {
        let mut balance = load_balance(self, account, holding).await?;
        balance.available += amount;
        store_balance(self, account, holding, balance).await
    }

    async fn balance(&self, account: &PublicKey, holding: u64) -> Result<HoldingBalance> {
        load_balance(self, account, holding).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Memory;
    use commonware_cryptography::{ed25519::PrivateKey, PrivateKeyExt as _, Signer as _};
    use commonware_runtime::{deterministic::Runner, Runner as _};

    fn public(seed: u64) -> PublicKey {
        PrivateKey::from_seed(seed).public_key()
    }

    #[test]
    fn hold_signals_insufficient_funds() {
        let executor = Runner::default();
        executor.start(|_| async move {
            let mut state = Memory::default();
            let alice = public(1);

            state.credit(&alice, NATIVE_HOLDING, 100).await.unwrap();
            match state.hold(&alice, NATIVE_HOLDING, 150).await {
                Err(LedgerError::Insufficient {
                    required,
                    available,
                    ..
                }) => {
                    assert_eq!(required, 150);
                    assert_eq!(available, 100);
                }
                other => panic!("expected insufficient funds, got {other:?}"),
            }

            // The failed hold left the balance untouched.
            let balance = state.balance(&alice, NATIVE_HOLDING).await.unwrap();
            assert_eq!(balance.available, 100);
            assert_eq!(balance.held, 0);
        });
    }

    #[test]
    fn hold_release_and_transfer_conserve_funds() {
        let executor = Runner::default();
        executor.start(|_| async move {
            let mut state = Memory::default();
            let alice = public(1);
            let bob = public(2);

            state.credit(&alice, 7, 1_000).await.unwrap();
            state.hold(&alice, 7, 400).await.unwrap();

            let balance = state.balance(&alice, 7).await.unwrap();
            assert_eq!(balance.available, 600);
            assert_eq!(balance.held, 400);

            state.release(&alice, 7, 100).await.unwrap();
            state.transfer_held(&alice, 7, &bob, 300).await.unwrap();

            let alice_balance = state.balance(&alice, 7).await.unwrap();
            let bob_balance = state.balance(&bob, 7).await.unwrap();
            assert_eq!(alice_balance.available, 700);
            assert_eq!(alice_balance.held, 0);
            assert_eq!(bob_balance.available, 300);
        });
    }

    #[test]
    fn forfeit_accrues_to_the_fee_sink() {
        let executor = Runner::default();
        executor.start(|_| async move {
            let mut state = Memory::default();
            let alice = public(1);

            state.credit(&alice, NATIVE_HOLDING, 500).await.unwrap();
            state.hold(&alice, NATIVE_HOLDING, 500).await.unwrap();
            state.forfeit_held(&alice, 500).await.unwrap();

            let balance = state.balance(&alice, NATIVE_HOLDING).await.unwrap();
            assert_eq!(balance.available, 0);
            assert_eq!(balance.held, 0);
            match state.get(&Key::FeeSink).await.unwrap() {
                Some(Value::FeeSink(total)) => assert_eq!(total, 500),
                other => panic!("expected fee sink, got {other:?}"),
            }
        });
    }

    #[test]
    fn releasing_more_than_held_is_an_invariant_violation() {
        let executor = Runner::default();
        executor.start(|_| async move {
            let mut state = Memory::default();
            let alice = public(1);

            state.credit(&alice, NATIVE_HOLDING, 100).await.unwrap();
            state.hold(&alice, NATIVE_HOLDING, 100).await.unwrap();
            assert!(state.release(&alice, NATIVE_HOLDING, 101).await.is_err());
        });
    }
}
