// Byte-exact info-dict extraction. The v1/v2 info hashes are computed over the raw
// `info` substring as it actually appears in the metainfo bytes, never over a
// re-encoding of the deserialized struct: bencode permits more than one valid
// encoding of the same value (integer padding aside, key order if a producer
// didn't sort), so re-encoding and hashing that would silently diverge from the
// hash every other client derives from the same file.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::MetaInfoError;

pub fn info_substring<'a>(raw: &'a [u8], key: &str) -> Result<&'a [u8], MetaInfoError> {
    bencode::find_raw_value(raw, key.as_bytes())
        .map_err(|e| MetaInfoError::RawExtraction(e.to_string()))
}

pub fn sha1_of(bytes: &[u8]) -> [u8; 20] {
    use sha1::Digest as _;
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn sha256_of(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_raw_info_substring_and_hashes_it() {
        let raw = b"d4:infod4:name3:fooee";
        let info = info_substring(raw, "info").unwrap();
        assert_eq!(info, b"d4:name3:fooe");
        // Hashing the raw substring, not a re-encoding, is the whole point.
        let hash = sha1_of(info);
        assert_eq!(hash.len(), 20);
    }
}
