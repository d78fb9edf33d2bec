//! Test helpers: keypairs, databases, block execution, and an honest
//! shuffle-run builder.

use crate::onion::{open_layer, wrap_onion, KeySeed};
use crate::state_transition::{execute_state_transition, StateTransitionResult};
use crate::{Adb, Authorizer, Config, PrunableStore};
use commonware_cryptography::{
    ed25519::{PrivateKey, PublicKey},
    sha256::Sha256,
    PrivateKeyExt as _, Signer as _,
};
use commonware_runtime::{buffer::PoolRef, Clock, Metrics, Spawner, Storage};
use commonware_storage::{
    adb::{self, keyless},
    translator::EightCap,
};
use commonware_utils::{NZUsize, NZU64};
use obscura_types::execution::{Output, Transaction};
use rand::{rngs::StdRng, SeedableRng};

/// Creates an account keypair for Ed25519 signatures used by users
pub fn create_account_keypair(seed: u64) -> (PrivateKey, PublicKey) {
    let private = PrivateKey::from_seed(seed);
    let public = private.public_key();
    (private, public)
}

/// Creates a deterministic per-shuffling x25519 key seed
pub fn create_shuffle_seed(seed: u64) -> KeySeed {
    let mut rng = StdRng::seed_from_u64(seed);
    KeySeed::generate(&mut rng)
}

/// Creates state and events databases for testing
pub async fn create_adbs<E: Spawner + Metrics + Storage + Clock>(
    context: &E,
) -> (Adb<E, EightCap>, keyless::Keyless<E, Output, Sha256>) {
    let buffer_pool = PoolRef::new(NZUsize!(1024), NZUsize!(1024));

    let state = Adb::init(
        context.with_label("state"),
        adb::any::variable::Config {
            mmr_journal_partition: String::from("state-mmr-journal"),
            mmr_metadata_partition: String::from("state-mmr-metadata"),
            mmr_items_per_blob: NZU64!(1024),
            mmr_write_buffer: NZUsize!(1024),
            log_journal_partition: String::from("state-log-journal"),
            log_items_per_section: NZU64!(1024),
            log_write_buffer: NZUsize!(1024),
            log_compression: None,
            log_codec_config: (),
            locations_journal_partition: String::from("state-locations-journal"),
            locations_items_per_blob: NZU64!(1024),
            translator: EightCap,
            thread_pool: None,
            buffer_pool: buffer_pool.clone(),
        },
    )
    .await
    .expect("Failed to initialize state ADB");

    let events = keyless::Keyless::<_, Output, Sha256>::init(
        context.with_label("events"),
        keyless::Config {
            mmr_journal_partition: String::from("events-mmr-journal"),
            mmr_metadata_partition: String::from("events-mmr-metadata"),
            mmr_items_per_blob: NZU64!(1024),
            mmr_write_buffer: NZUsize!(1024),
            log_journal_partition: String::from("events-log-journal"),
            log_items_per_section: NZU64!(1024),
            log_write_buffer: NZUsize!(1024),
            log_compression: None,
            log_codec_config: (),
            locations_journal_partition: String::from("events-locations-journal"),
            locations_items_per_blob: NZU64!(1024),
            locations_write_buffer: NZUsize!(1024),
            thread_pool: None,
            buffer_pool,
        },
    )
    .await
    .expect("Failed to initialize events Keyless");

    (state, events)
}

/// Execute one block against the databases and sync the results.
#[allow(clippy::too_many_arguments)]
pub async fn execute_block<E: Spawner + Metrics + Storage + Clock>(
    state: &mut Adb<E, EightCap>,
    events: &mut keyless::Keyless<E, Output, Sha256>,
    store: &mut PrunableStore,
    config: &Config,
    authorizer: &dyn Authorizer,
    height: u64,
    txs: Vec<Transaction>,
) -> StateTransitionResult {
    let result =
        execute_state_transition(state, events, store, config, authorizer, height, txs)
            .await
            .expect("state transition");

    state.sync().await.expect("sync state");
    events.sync().await.expect("sync events");

    result
}

/// One participant of a scripted shuffle run.
pub struct ShuffleMember {
    pub private: PrivateKey,
    pub public: PublicKey,
    pub seed: KeySeed,
}

/// A fully honest shuffle run: deterministic keys, recipients, and the
/// encrypted submissions every participant would publish in turn.
pub struct HonestShuffle {
    pub id: u64,
    pub members: Vec<ShuffleMember>,
    pub recipients: Vec<PublicKey>,
}

impl HonestShuffle {
    pub fn new(id: u64, count: usize) -> Self {
        let members = (0..count)
            .map(|i| {
                let (private, public) = create_account_keypair(1 + i as u64);
                ShuffleMember {
                    private,
                    public,
                    seed: create_shuffle_seed(1_000 + i as u64),
                }
            })
            .collect();
        let recipients = (0..count)
            .map(|i| create_account_keypair(100 + i as u64).1)
            .collect();
        Self {
            id,
            members,
            recipients,
        }
    }

    /// Encrypted submissions `S_0 .. S_{count-2}`, each sorted and one blob
    /// smaller than its predecessor. The last participant publishes
    /// `self.recipients` in plaintext instead.
    pub fn submissions(&self) -> Vec<Vec<Vec<u8>>> {
        let count = self.members.len();
        // hops[i] is the shuffle key stripping at step i + 1.
        let hops: Vec<[u8; 32]> = self.members[1..].iter().map(|m| m.seed.public()).collect();
        let mut rng = StdRng::seed_from_u64(self.id);

        // Participant j's recipient entry rides in onion j; the onion built
        // for the final step survives to the single last blob.
        let mut current: Vec<(usize, Vec<u8>)> = (1..count)
            .map(|j| {
                let mut entry = [0u8; 32];
                entry.copy_from_slice(self.recipients[j].as_ref());
                (j, wrap_onion(&entry, &hops, self.id, &mut rng))
            })
            .collect();
        current.sort_by(|a, b| a.1.cmp(&b.1));

        let mut submissions = vec![current.iter().map(|(_, blob)| blob.clone()).collect()];
        for step in 1..=count - 2 {
            let seed = &self.members[step].seed;
            let mut next: Vec<(usize, Vec<u8>)> = current
                .iter()
                .map(|(j, blob)| {
                    (
                        *j,
                        open_layer(seed, self.id, step as u8, blob).expect("honest layer opens"),
                    )
                })
                .filter(|(j, _)| *j != step)
                .collect();
            next.sort_by(|a, b| a.1.cmp(&b.1));
            submissions.push(next.iter().map(|(_, blob)| blob.clone()).collect());
            current = next;
        }
        submissions
    }
}
