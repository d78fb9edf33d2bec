//! Onion layer cipher for shuffling payloads.
//!
//! Each layer is `[sender public key: 32][ChaCha20-Poly1305 ciphertext]`,
//! keyed by x25519 between the sender key embedded in the header and the
//! stripping participant's registered shuffle key. Nonces derive from the
//! shuffling id and the strip step, so decryption is deterministic: anyone
//! holding a revealed key seed reproduces the exact plaintext a participant
//! saw, which is what makes blame replay third-party verifiable.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use commonware_cryptography::{Hasher, Sha256};
use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey as LayerPublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Bytes prepended to every layer: the sender's x25519 public key.
pub const LAYER_HEADER_LEN: usize = 32;

/// Poly1305 authentication tag length.
pub const LAYER_TAG_LEN: usize = 16;

const KEY_CONTEXT: &[u8] = b"obscura-shuffle-layer";

/// A participant's per-shuffling x25519 secret. Revealed on-chain during the
/// blame window; zeroized on drop until then.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeySeed([u8; 32]);

impl KeySeed {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// The shuffle public key registered on-chain.
    pub fn public(&self) -> [u8; 32] {
        let secret = StaticSecret::from(self.0);
        LayerPublicKey::from(&secret).to_bytes()
    }

    /// Copy of the raw seed, for a cancellation attachment.
    pub fn reveal(&self) -> [u8; 32] {
        self.0
    }

    fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

impl std::fmt::Debug for KeySeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySeed(..)")
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum LayerError {
    /// Blob shorter than one header plus tag.
    TooShort,
    /// Ciphertext does not authenticate under the derived key.
    Authentication,
}

fn layer_cipher(shared: &[u8; 32], shuffling_id: u64) -> ChaCha20Poly1305 {
    let mut hasher = Sha256::new();
    hasher.update(KEY_CONTEXT);
    hasher.update(shared);
    hasher.update(&shuffling_id.to_be_bytes());
    let digest = hasher.finalize();
    ChaCha20Poly1305::new(Key::from_slice(digest.as_ref()))
}

fn layer_nonce(shuffling_id: u64, step: u8) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&shuffling_id.to_be_bytes());
    nonce[8] = step;
    nonce
}

/// Encrypt one layer to the participant stripping at `step`.
pub fn seal_layer(
    sender: &StaticSecret,
    recipient_key: &[u8; 32],
    shuffling_id: u64,
    step: u8,
    plaintext: &[u8],
) -> Vec<u8> {
    let shared = sender
        .diffie_hellman(&LayerPublicKey::from(*recipient_key))
        .to_bytes();
    let cipher = layer_cipher(&shared, shuffling_id);
    let nonce = layer_nonce(shuffling_id, step);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("chacha20poly1305 encryption is infallible for in-memory buffers");

    let mut blob = Vec::with_capacity(LAYER_HEADER_LEN + ciphertext.len());
    blob.extend_from_slice(&LayerPublicKey::from(sender).to_bytes());
    blob.extend_from_slice(&ciphertext);
    blob
}

/// Strip one layer with the stripping participant's seed. Deterministic:
/// the same (seed, blob, id, step) always yields the same plaintext.
pub fn open_layer(
    seed: &KeySeed,
    shuffling_id: u64,
    step: u8,
    blob: &[u8],
) -> Result<Vec<u8>, LayerError> {
    if blob.len() < LAYER_HEADER_LEN + LAYER_TAG_LEN {
        return Err(LayerError::TooShort);
    }
    let mut sender_key = [0u8; 32];
    sender_key.copy_from_slice(&blob[..LAYER_HEADER_LEN]);

    let shared = seed
        .secret()
        .diffie_hellman(&LayerPublicKey::from(sender_key))
        .to_bytes();
    let cipher = layer_cipher(&shared, shuffling_id);
    let nonce = layer_nonce(shuffling_id, step);
    cipher
        .decrypt(Nonce::from_slice(&nonce), &blob[LAYER_HEADER_LEN..])
        .map_err(|_| LayerError::Authentication)
}

/// Wrap a recipient entry for strip steps `1..=hops.len()`, innermost layer
/// last. `hops[i]` is the shuffle key of the participant acting at step
/// `i + 1`. Each layer uses a fresh sender key so published blobs do not
/// identify their author.
pub fn wrap_onion<R: RngCore + CryptoRng>(
    entry: &[u8; 32],
    hops: &[[u8; 32]],
    shuffling_id: u64,
    rng: &mut R,
) -> Vec<u8> {
    let mut blob = entry.to_vec();
    for step in (1..=hops.len()).rev() {
        let sender = StaticSecret::random_from_rng(&mut *rng);
        blob = seal_layer(&sender, &hops[step - 1], shuffling_id, step as u8, &blob);
    }
    blob
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscura_types::shuffling::{LAYER_OVERHEAD, RECIPIENT_LEN};
    use rand::{rngs::StdRng, SeedableRng};

    fn seed(n: u64) -> KeySeed {
        let mut rng = StdRng::seed_from_u64(n);
        KeySeed::generate(&mut rng)
    }

    #[test]
    fn layer_overhead_matches_the_wire_constants() {
        assert_eq!(LAYER_HEADER_LEN + LAYER_TAG_LEN, LAYER_OVERHEAD);
    }

    #[test]
    fn onion_strips_layer_by_layer() {
        let mut rng = StdRng::seed_from_u64(7);
        let seeds: Vec<KeySeed> = (1..=3).map(seed).collect();
        let hops: Vec<[u8; 32]> = seeds.iter().map(|s| s.public()).collect();
        let entry = [9u8; 32];

        let mut blob = wrap_onion(&entry, &hops, 42, &mut rng);
        assert_eq!(blob.len(), RECIPIENT_LEN + 3 * LAYER_OVERHEAD);

        for (i, seed) in seeds.iter().enumerate() {
            blob = open_layer(seed, 42, (i + 1) as u8, &blob).expect("strip layer");
        }
        assert_eq!(blob, entry);
    }

    #[test]
    fn opening_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(8);
        let stripper = seed(1);
        let blob = wrap_onion(&[3u8; 32], &[stripper.public()], 7, &mut rng);

        let once = open_layer(&stripper, 7, 1, &blob).expect("open");
        let twice = open_layer(&stripper, 7, 1, &blob).expect("open");
        assert_eq!(once, twice);
    }

    #[test]
    fn wrong_seed_or_context_fails_authentication() {
        let mut rng = StdRng::seed_from_u64(9);
        let stripper = seed(1);
        let blob = wrap_onion(&[4u8; 32], &[stripper.public()], 7, &mut rng);

        assert_eq!(
            open_layer(&seed(2), 7, 1, &blob).unwrap_err(),
            LayerError::Authentication
        );
        // Wrong shuffling id or step changes the nonce/key derivation.
        assert_eq!(
            open_layer(&stripper, 8, 1, &blob).unwrap_err(),
            LayerError::Authentication
        );
        assert_eq!(
            open_layer(&stripper, 7, 2, &blob).unwrap_err(),
            LayerError::Authentication
        );
        assert_eq!(
            open_layer(&stripper, 7, 1, &blob[..40]).unwrap_err(),
            LayerError::TooShort
        );
    }
}
