use std::hash::Hasher as _;
use std::io::{self, Read};
use twox_hash::XxHash64;

pub(crate) const PARTIAL_HASH_LENGTH: usize = 1024; // 1KB

/// XxHash64 of the first 1KB of a stream.
///
/// Cheap fingerprint stored alongside each observation so a later
/// verification pass can spot changed bytes without a full rehash.
pub fn partial_hash_reader(reader: impl Read) -> io::Result<u64> {
    let data = read_portion(reader)?;
    Ok(hash_data(&data))
}

fn read_portion(reader: impl Read) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(PARTIAL_HASH_LENGTH);
    reader
        .take(PARTIAL_HASH_LENGTH as u64)
        .read_to_end(&mut buffer)?;
    Ok(buffer)
}

pub fn hash_data(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}
