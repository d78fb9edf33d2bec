//! Prunable bulk-payload store.
//!
//! Encrypted blobs (and the final plaintext recipient list) are recorded here
//! rather than in consensus state: the state hash chain commits to their
//! digests, so the bytes themselves can be dropped once the retention window
//! has passed and the owning instance can no longer be disputed. Lookups
//! degrade to digest-only, never block, and never influence consensus.

use commonware_cryptography::{
    sha256::{Digest, Sha256},
    Hasher,
};
use obscura_types::error::DataUnavailable;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Where a stored payload's bytes currently are.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadState {
    /// Bytes held locally.
    Loaded(Vec<Vec<u8>>),
    /// Bytes not held locally but possibly fetchable from peers.
    Unloaded,
    /// Bytes deliberately discarded forever; only the digest remains.
    Pruned,
}

#[derive(Clone, Debug)]
pub struct StoredPayload {
    pub digest: Digest,
    pub state: PayloadState,
    /// Height of the block that confirmed the owning submission.
    pub confirmed_height: u64,
}

/// Answer to a payload lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Present(Vec<Vec<u8>>),
    DigestOnly(Digest),
    NeverStored,
}

/// Best-effort peer retrieval of an unloaded payload. The default
/// implementation never finds anything; absence must degrade to digest-only
/// rather than stall chain processing.
pub trait PayloadFetcher: Send + Sync {
    fn fetch(&self, shuffling_id: u64, index: u8) -> Option<Vec<Vec<u8>>>;
}

/// Fetcher for deployments without a peer payload service.
pub struct NoFetch;

impl PayloadFetcher for NoFetch {
    fn fetch(&self, _: u64, _: u8) -> Option<Vec<Vec<u8>>> {
        None
    }
}

fn payload_digest(blobs: &[Vec<u8>]) -> Digest {
    let mut hasher = Sha256::new();
    for blob in blobs {
        hasher.update(blob);
    }
    hasher.finalize()
}

pub struct PrunableStore {
    entries: BTreeMap<(u64, u8), StoredPayload>,
    fetcher: Box<dyn PayloadFetcher>,
}

impl PrunableStore {
    pub fn new(fetcher: Box<dyn PayloadFetcher>) -> Self {
        Self {
            entries: BTreeMap::new(),
            fetcher,
        }
    }

    /// Record a payload accepted at `height`.
    pub fn insert(&mut self, shuffling_id: u64, index: u8, blobs: Vec<Vec<u8>>, height: u64) {
        let digest = payload_digest(&blobs);
        self.entries.insert(
            (shuffling_id, index),
            StoredPayload {
                digest,
                state: PayloadState::Loaded(blobs),
                confirmed_height: height,
            },
        );
    }

    /// Record a digest for a payload this node never held (e.g. synced from a
    /// pruned peer).
    pub fn insert_digest_only(
        &mut self,
        shuffling_id: u64,
        index: u8,
        digest: Digest,
        height: u64,
    ) {
        self.entries.entry((shuffling_id, index)).or_insert(StoredPayload {
            digest,
            state: PayloadState::Unloaded,
            confirmed_height: height,
        });
    }

    pub fn digest(&self, shuffling_id: u64, index: u8) -> Option<Digest> {
        self.entries
            .get(&(shuffling_id, index))
            .map(|entry| entry.digest)
    }

    /// Look up a payload, attempting a bounded peer fetch for unloaded
    /// entries. A fetched payload is kept only if it matches the recorded
    /// digest.
    pub fn get(&mut self, shuffling_id: u64, index: u8) -> Lookup {
        let Some(entry) = self.entries.get_mut(&(shuffling_id, index)) else {
            return Lookup::NeverStored;
        };
        match &entry.state {
            PayloadState::Loaded(blobs) => Lookup::Present(blobs.clone()),
            PayloadState::Pruned => Lookup::DigestOnly(entry.digest),
            PayloadState::Unloaded => match self.fetcher.fetch(shuffling_id, index) {
                Some(blobs) if payload_digest(&blobs) == entry.digest => {
                    entry.state = PayloadState::Loaded(blobs.clone());
                    Lookup::Present(blobs)
                }
                Some(_) => {
                    debug!(shuffling_id, index, "fetched payload digest mismatch");
                    Lookup::DigestOnly(entry.digest)
                }
                None => Lookup::DigestOnly(entry.digest),
            },
        }
    }

    /// Payload bytes for blame replay. Unlike [`Self::get`], absence here is
    /// an error: replay is only attempted inside the retention window, where
    /// the bytes must still be available.
    pub fn replay_blobs(
        &mut self,
        shuffling_id: u64,
        index: u8,
    ) -> Result<Vec<Vec<u8>>, DataUnavailable> {
        match self.get(shuffling_id, index) {
            Lookup::Present(blobs) => Ok(blobs),
            Lookup::DigestOnly(_) => Err(DataUnavailable::Pruned {
                id: shuffling_id,
                index,
            }),
            Lookup::NeverStored => Err(DataUnavailable::NeverStored {
                id: shuffling_id,
                index,
            }),
        }
    }

    /// Drop blob bytes whose retention window has elapsed, keeping digests.
    /// Payloads of live instances (`active` ids) are never pruned: they may
    /// still be needed for dispute replay.
    pub fn prune(&mut self, height: u64, active: &BTreeSet<u64>, retention_window: u64) -> usize {
        let mut pruned = 0;
        for ((shuffling_id, index), entry) in self.entries.iter_mut() {
            if active.contains(shuffling_id) {
                continue;
            }
            if height < entry.confirmed_height.saturating_add(retention_window) {
                continue;
            }
            if matches!(entry.state, PayloadState::Loaded(_) | PayloadState::Unloaded) {
                entry.state = PayloadState::Pruned;
                pruned += 1;
                debug!(shuffling_id, index, height, "pruned shuffling payload");
            }
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedFetch(Vec<Vec<u8>>);

    impl PayloadFetcher for FixedFetch {
        fn fetch(&self, _: u64, _: u8) -> Option<Vec<Vec<u8>>> {
            Some(self.0.clone())
        }
    }

    fn blobs() -> Vec<Vec<u8>> {
        vec![vec![1u8; 64], vec![2u8; 64]]
    }

    #[test]
    fn lookup_distinguishes_present_pruned_and_never_stored() {
        let mut store = PrunableStore::new(Box::new(NoFetch));
        store.insert(1, 0, blobs(), 10);

        assert_eq!(store.get(1, 0), Lookup::Present(blobs()));
        assert_eq!(store.get(1, 1), Lookup::NeverStored);

        let pruned = store.prune(10_000, &BTreeSet::new(), 100);
        assert_eq!(pruned, 1);
        let digest = store.digest(1, 0).expect("digest survives pruning");
        assert_eq!(store.get(1, 0), Lookup::DigestOnly(digest));
        assert!(store.replay_blobs(1, 0).is_err());
    }

    #[test]
    fn retention_window_and_live_instances_block_pruning() {
        let mut store = PrunableStore::new(Box::new(NoFetch));
        store.insert(1, 0, blobs(), 100);
        store.insert(2, 0, blobs(), 100);

        // Inside the window: nothing prunes.
        assert_eq!(store.prune(150, &BTreeSet::new(), 100), 0);

        // Outside the window, but instance 2 is still live.
        let active = BTreeSet::from([2]);
        assert_eq!(store.prune(200, &active, 100), 1);
        assert!(matches!(store.get(1, 0), Lookup::DigestOnly(_)));
        assert_eq!(store.get(2, 0), Lookup::Present(blobs()));
    }

    #[test]
    fn unloaded_entries_fetch_and_verify_from_peers() {
        let expected = blobs();
        let digest = payload_digest(&expected);

        let mut store = PrunableStore::new(Box::new(FixedFetch(expected.clone())));
        store.insert_digest_only(1, 0, digest, 10);
        assert_eq!(store.get(1, 0), Lookup::Present(expected));

        // A fetcher returning the wrong bytes degrades to digest-only.
        let mut store = PrunableStore::new(Box::new(FixedFetch(vec![vec![9u8; 8]])));
        store.insert_digest_only(1, 0, digest, 10);
        assert_eq!(store.get(1, 0), Lookup::DigestOnly(digest));
        assert_eq!(
            store.replay_blobs(1, 0),
            Err(DataUnavailable::Pruned { id: 1, index: 0 })
        );
    }

    #[test]
    fn missing_peers_degrade_to_digest_only() {
        let digest = payload_digest(&blobs());
        let mut store = PrunableStore::new(Box::new(NoFetch));
        store.insert_digest_only(3, 1, digest, 10);
        assert_eq!(store.get(3, 1), Lookup::DigestOnly(digest));
    }
}
