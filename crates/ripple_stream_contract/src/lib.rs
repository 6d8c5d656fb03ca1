use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::fmt;

pub const CONTRACT_ID: &str = "ripple.stream_cache";
pub const CONTRACT_VERSION: u16 = 1;

/// First bytes of every cache file.
pub const MAGIC: [u8; 8] = *b"RPLCACHE";

const HEADER_LEN: usize = MAGIC.len() + 2 + 4;

// Layout: MAGIC, version (u16 BE), manifest length (u32 BE), manifest JSON, stream bytes.

#[derive(Debug, Clone, PartialEq)]
pub struct CacheManifest {
    pub stream_len: usize,
    pub stream_sha256: String,
    /// Host-defined fields stored next to the contract fields.
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContractError {
    BadMagic,
    UnsupportedVersion(u16),
    Truncated,
    Manifest(String),
    LengthMismatch { expected: usize, actual: usize },
    FingerprintMismatch { expected: String, actual: String },
}

impl fmt::Display for ContractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractError::BadMagic => f.write_str("not a stream cache file"),
            ContractError::UnsupportedVersion(version) => {
                write!(f, "unsupported cache version {version}")
            }
            ContractError::Truncated => f.write_str("cache file is truncated"),
            ContractError::Manifest(message) => write!(f, "bad cache manifest: {message}"),
            ContractError::LengthMismatch { expected, actual } => {
                write!(f, "stream length {actual} does not match manifest {expected}")
            }
            ContractError::FingerprintMismatch { expected, actual } => {
                write!(f, "stream fingerprint {actual} does not match manifest {expected}")
            }
        }
    }
}

impl std::error::Error for ContractError {}

pub fn stream_fingerprint_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Serialises `stream` with its fingerprint and the host's extra manifest fields.
pub fn encode(stream: &[u8], extra: Map<String, Value>) -> Vec<u8> {
    let mut manifest = extra;
    manifest.insert("contract".to_string(), json!(CONTRACT_ID));
    manifest.insert("version".to_string(), json!(CONTRACT_VERSION));
    manifest.insert("stream_len".to_string(), json!(stream.len()));
    manifest.insert(
        "stream_sha256".to_string(),
        json!(stream_fingerprint_sha256(stream)),
    );
    let manifest = Value::Object(manifest).to_string();

    let mut out = Vec::with_capacity(HEADER_LEN + manifest.len() + stream.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&CONTRACT_VERSION.to_be_bytes());
    out.extend_from_slice(&(manifest.len() as u32).to_be_bytes());
    out.extend_from_slice(manifest.as_bytes());
    out.extend_from_slice(stream);
    out
}

/// Splits a cache file into its manifest and stream bytes, verifying length and fingerprint.
pub fn decode(bytes: &[u8]) -> Result<(CacheManifest, Vec<u8>), ContractError> {
    if bytes.len() < HEADER_LEN {
        return Err(if bytes.starts_with(&MAGIC[..bytes.len().min(MAGIC.len())]) {
            ContractError::Truncated
        } else {
            ContractError::BadMagic
        });
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(ContractError::BadMagic);
    }
    let version = u16::from_be_bytes([bytes[8], bytes[9]]);
    if version != CONTRACT_VERSION {
        return Err(ContractError::UnsupportedVersion(version));
    }
    let manifest_len = u32::from_be_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]) as usize;
    let manifest_end = HEADER_LEN
        .checked_add(manifest_len)
        .filter(|end| *end <= bytes.len())
        .ok_or(ContractError::Truncated)?;
    let manifest: Value = serde_json::from_slice(&bytes[HEADER_LEN..manifest_end])
        .map_err(|e| ContractError::Manifest(e.to_string()))?;
    let Value::Object(mut fields) = manifest else {
        return Err(ContractError::Manifest("manifest is not an object".to_string()));
    };
    if fields.get("contract").and_then(Value::as_str) != Some(CONTRACT_ID) {
        return Err(ContractError::Manifest("contract id mismatch".to_string()));
    }
    let stream_len = fields
        .get("stream_len")
        .and_then(Value::as_u64)
        .ok_or_else(|| ContractError::Manifest("missing stream_len".to_string()))?
        as usize;
    let stream_sha256 = fields
        .get("stream_sha256")
        .and_then(Value::as_str)
        .ok_or_else(|| ContractError::Manifest("missing stream_sha256".to_string()))?
        .to_string();

    let stream = &bytes[manifest_end..];
    if stream.len() != stream_len {
        return Err(ContractError::LengthMismatch {
            expected: stream_len,
            actual: stream.len(),
        });
    }
    let actual = stream_fingerprint_sha256(stream);
    if actual != stream_sha256 {
        return Err(ContractError::FingerprintMismatch {
            expected: stream_sha256,
            actual,
        });
    }
    for key in ["contract", "version", "stream_len", "stream_sha256"] {
        fields.remove(key);
    }
    Ok((
        CacheManifest {
            stream_len,
            stream_sha256,
            extra: fields,
        },
        stream.to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = stream_fingerprint_sha256(b"abc");
        assert_eq!(a.len(), 64);
        assert_eq!(
            a,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn extra_fields_survive_and_contract_fields_are_stripped() {
        let mut extra = Map::new();
        extra.insert("width".to_string(), json!(320));
        let file = encode(b"\x1bstream", extra);
        let (manifest, stream) = decode(&file).unwrap();
        assert_eq!(stream, b"\x1bstream");
        assert_eq!(manifest.stream_len, 7);
        assert_eq!(manifest.extra.get("width"), Some(&json!(320)));
        assert!(!manifest.extra.contains_key("contract"));
    }

    #[test]
    fn tampering_is_detected() {
        let mut file = encode(b"hello", Map::new());
        let last = file.len() - 1;
        file[last] = b'!';
        assert!(matches!(
            decode(&file),
            Err(ContractError::FingerprintMismatch { .. })
        ));
        file.push(b'x');
        assert!(matches!(decode(&file), Err(ContractError::LengthMismatch { .. })));
    }

    #[test]
    fn headers_are_checked() {
        assert_eq!(decode(b"RPL"), Err(ContractError::Truncated));
        assert_eq!(decode(b"nope, not a cache"), Err(ContractError::BadMagic));
        let mut file = encode(b"", Map::new());
        file[9] = 9;
        assert_eq!(decode(&file), Err(ContractError::UnsupportedVersion(9)));
    }
}
