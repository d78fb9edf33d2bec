use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::{
    sha256::{Digest, Sha256},
    Hasher,
};

use super::codec::{blob_encode_size, read_blob, write_blob};
use super::{ATTACHMENT_BASE_SIZE, MAX_BLOB_LEN, MAX_PROCESSING_BLOBS};

/// Payload of a processing attachment.
///
/// The bulk encrypted blobs live outside the core chain structure and may be
/// discarded after the retention window; the digest-only form is what every
/// node keeps forever and what the state hash chain commits to.
///
/// Wire layout: `[presence flag: u8]`, then either
/// `[blob count: u8][per blob: length u32 + bytes]` (flag = 1) or
/// `[digest: 32 bytes]` (flag = 0).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessingData {
    /// Blobs present, one per still-wrapped recipient entry.
    Present(Vec<Vec<u8>>),
    /// Blobs discarded or not yet fetched; only the digest remains.
    Hash(Digest),
}

impl ProcessingData {
    /// Digest committing to the blob sequence: the hash of all blobs
    /// concatenated in order.
    pub fn digest(&self) -> Digest {
        match self {
            Self::Present(blobs) => {
                let mut hasher = Sha256::new();
                for blob in blobs {
                    hasher.update(blob);
                }
                hasher.finalize()
            }
            Self::Hash(digest) => *digest,
        }
    }

    /// The blobs, when present.
    pub fn blobs(&self) -> Option<&[Vec<u8>]> {
        match self {
            Self::Present(blobs) => Some(blobs),
            Self::Hash(_) => None,
        }
    }

    /// Canonical digest-only form. This is the form the state hash chain is
    /// computed over, so pruning the blobs later never disturbs the chain.
    pub fn canonical(&self) -> Self {
        Self::Hash(self.digest())
    }

    /// Encoded size of the currently stored form, including the shared
    /// attachment header. Reflects pruning: a digest-only payload is smaller
    /// than the blobs it replaced.
    pub fn wire_size(&self) -> usize {
        ATTACHMENT_BASE_SIZE + self.encode_size()
    }

    /// Size before pruning, used by the fee model.
    ///
    /// Deliberately halved. Fee data already committed on existing chains
    /// depends on this exact value, so it must not be corrected even though
    /// it undercounts.
    pub fn full_size(&self) -> usize {
        let mut size = ATTACHMENT_BASE_SIZE;
        if let Self::Present(blobs) = self {
            size += 1;
            for blob in blobs {
                size += blob_encode_size(blob);
            }
        }
        size / 2
    }
}

impl Write for ProcessingData {
    fn write(&self, writer: &mut impl BufMut) {
        match self {
            Self::Present(blobs) => {
                1u8.write(writer);
                (blobs.len() as u8).write(writer);
                for blob in blobs {
                    write_blob(blob, writer);
                }
            }
            Self::Hash(digest) => {
                0u8.write(writer);
                digest.write(writer);
            }
        }
    }
}

impl Read for ProcessingData {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        match u8::read(reader)? {
            0 => Ok(Self::Hash(Digest::read(reader)?)),
            1 => {
                let count = u8::read(reader)? as usize;
                if count > MAX_PROCESSING_BLOBS {
                    return Err(Error::Invalid("ProcessingData", "too many blobs"));
                }
                let mut blobs = Vec::with_capacity(count);
                for _ in 0..count {
                    blobs.push(read_blob(reader, MAX_BLOB_LEN)?);
                }
                Ok(Self::Present(blobs))
            }
            flag => Err(Error::InvalidEnum(flag)),
        }
    }
}

impl EncodeSize for ProcessingData {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::Present(blobs) => 1 + blobs.iter().map(|b| blob_encode_size(b)).sum::<usize>(),
            Self::Hash(_) => 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn encode(data: &ProcessingData) -> Vec<u8> {
        let mut buf = BytesMut::new();
        data.write(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn digest_is_stable_across_pruning() {
        let data = ProcessingData::Present(vec![vec![1u8; 80], vec![2u8; 80]]);
        let pruned = data.canonical();
        assert_eq!(data.digest(), pruned.digest());
        assert_ne!(encode(&data), encode(&pruned));
    }

    #[test]
    fn wire_size_tracks_the_stored_form() {
        let data = ProcessingData::Present(vec![vec![0u8; 128]]);
        let pruned = data.canonical();
        assert_eq!(data.wire_size(), 40 + 1 + 1 + 4 + 128);
        assert_eq!(pruned.wire_size(), 40 + 1 + 32);
    }

    #[test]
    fn full_size_preserves_the_committed_halving() {
        let data = ProcessingData::Present(vec![vec![0u8; 128], vec![0u8; 128]]);
        assert_eq!(data.full_size(), (40 + 1 + 2 * (4 + 128)) / 2);
        // Digest-only payloads degrade to the bare header, halved.
        assert_eq!(data.canonical().full_size(), 20);
    }

    #[test]
    fn round_trip_both_forms() {
        for data in [
            ProcessingData::Present(vec![vec![9u8; 32], vec![10u8; 32]]),
            ProcessingData::Hash(Sha256::hash(b"payload")),
        ] {
            let bytes = encode(&data);
            let mut reader = bytes.as_slice();
            let decoded = ProcessingData::read(&mut reader).expect("decode");
            assert_eq!(decoded, data);
            assert_eq!(encode(&decoded), bytes);
            assert_eq!(decoded.encode_size(), bytes.len());
        }
    }

    #[test]
    fn read_rejects_oversized_blob_counts() {
        let mut buf = BytesMut::new();
        1u8.write(&mut buf);
        255u8.write(&mut buf);
        let mut reader = buf.as_ref();
        assert!(ProcessingData::read(&mut reader).is_err());
    }
}
