use bytes::{Buf, BufMut};
use commonware_codec::{Error, ReadExt, Write};

/// Helper to write a fixed 32-byte array.
pub fn write_bytes32(bytes: &[u8; 32], writer: &mut impl BufMut) {
    writer.put_slice(bytes);
}

/// Helper to read a fixed 32-byte array.
pub fn read_bytes32(reader: &mut impl Buf) -> Result<[u8; 32], Error> {
    if reader.remaining() < 32 {
        return Err(Error::EndOfBuffer);
    }
    let mut bytes = [0u8; 32];
    reader.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// Helper to write a byte blob as length-prefixed bytes.
pub fn write_blob(blob: &[u8], writer: &mut impl BufMut) {
    (blob.len() as u32).write(writer);
    writer.put_slice(blob);
}

/// Helper to read a length-prefixed byte blob.
pub fn read_blob(reader: &mut impl Buf, max_len: usize) -> Result<Vec<u8>, Error> {
    let len = u32::read(reader)? as usize;
    if len > max_len {
        return Err(Error::Invalid("Blob", "too long"));
    }
    if reader.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    let mut bytes = vec![0u8; len];
    reader.copy_to_slice(&mut bytes);
    Ok(bytes)
}

/// Helper to get the encoded size of a length-prefixed blob.
pub fn blob_encode_size(blob: &[u8]) -> usize {
    4 + blob.len()
}
