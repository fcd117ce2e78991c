//! Integrity digests and the hash records stored next to each artifact.
//!
//! A hash record is the SHA-256 of the artifact as 64 hex characters, the
//! way `sha256sum` prints it. Anything after the hex digits must be
//! whitespace, a NUL, or the end of the record.

use sha2::{Digest as _, Sha256};

pub const DIGEST_LEN: usize = 32;
pub const HASH_RECORD_LEN: usize = 2 * DIGEST_LEN;

pub type Digest = [u8; DIGEST_LEN];

pub fn digest(data: &[u8]) -> Digest {
    Sha256::digest(data).into()
}

/// Decodes a hash record. `record` may be longer than [`HASH_RECORD_LEN`];
/// `None` means the record is malformed.
pub fn parse_hash_record(record: &[u8]) -> Option<Digest> {
    let hex_digits = record.get(..HASH_RECORD_LEN)?;
    match record.get(HASH_RECORD_LEN) {
        None | Some(0) => {}
        Some(b) if b.is_ascii_whitespace() => {}
        Some(_) => return None,
    }

    let mut digest = [0u8; DIGEST_LEN];
    hex::decode_to_slice(hex_digits, &mut digest).ok()?;
    Some(digest)
}

/// Builds the hash record for `data`, NUL padded to `record_len` bytes.
#[cfg(feature = "alloc")]
pub fn hash_record(data: &[u8], record_len: usize) -> alloc::vec::Vec<u8> {
    assert!(record_len > HASH_RECORD_LEN);
    let mut record = hex::encode(digest(data)).into_bytes();
    record.push(b'\n');
    record.resize(record_len, 0);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &[u8] = b"e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn digest_matches_known_value() {
        let mut expected = [0u8; DIGEST_LEN];
        hex::decode_to_slice(EMPTY_SHA256, &mut expected).unwrap();
        assert_eq!(digest(b""), expected);
    }

    #[test]
    fn parses_sha256sum_output() {
        let mut line = EMPTY_SHA256.to_vec();
        line.extend_from_slice(b"  Image\n");
        assert_eq!(parse_hash_record(&line), Some(digest(b"")));

        assert_eq!(parse_hash_record(EMPTY_SHA256), Some(digest(b"")));

        let upper = EMPTY_SHA256.to_ascii_uppercase();
        assert_eq!(parse_hash_record(&upper), Some(digest(b"")));
    }

    #[test]
    fn rejects_malformed_records() {
        assert_eq!(parse_hash_record(&EMPTY_SHA256[..63]), None);
        assert_eq!(parse_hash_record(&[0u8; 512]), None);

        let mut long = EMPTY_SHA256.to_vec();
        long.push(b'0');
        assert_eq!(parse_hash_record(&long), None);

        let mut bad = EMPTY_SHA256.to_vec();
        bad[10] = b'g';
        assert_eq!(parse_hash_record(&bad), None);
    }

    #[test]
    fn hash_record_round_trips() {
        let record = hash_record(b"kernel", 512);
        assert_eq!(record.len(), 512);
        assert_eq!(record[HASH_RECORD_LEN], b'\n');
        assert_eq!(parse_hash_record(&record), Some(digest(b"kernel")));
    }
}
