//! Schema fingerprinting for deduplication
//!
//! The fingerprint covers the schema type, the canonical text and the
//! declared references. Two registrations share a schema ID exactly when
//! these three agree.

use crate::types::{SchemaReference, SchemaType};
use sha2::{Digest, Sha256};

/// Schema fingerprint for deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaFingerprint {
    /// SHA-256 hash (32 bytes)
    pub sha256: [u8; 32],
}

impl SchemaFingerprint {
    /// Compute fingerprint from a canonical schema and its references
    pub fn compute(
        schema_type: SchemaType,
        canonical: &str,
        references: &[SchemaReference],
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(schema_type.as_str().as_bytes());
        hasher.update([0u8]);
        // Length prefix keeps "ab"+"c" distinct from "a"+"bc"
        hasher.update((canonical.len() as u64).to_be_bytes());
        hasher.update(canonical.as_bytes());
        for reference in references {
            for part in [reference.name.as_str(), reference.subject.as_str()] {
                hasher.update((part.len() as u64).to_be_bytes());
                hasher.update(part.as_bytes());
            }
            hasher.update(reference.version.as_u32().to_be_bytes());
        }

        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&hasher.finalize());
        Self { sha256 }
    }

    /// Get SHA-256 fingerprint as hex string
    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }

    /// Create from hex-encoded SHA-256
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&bytes);
        Some(Self { sha256 })
    }
}

impl std::fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sha256_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let a = SchemaFingerprint::compute(SchemaType::Avro, "\"string\"", &[]);
        let b = SchemaFingerprint::compute(SchemaType::Avro, "\"string\"", &[]);
        assert_eq!(a, b);
        assert_eq!(a.sha256_hex().len(), 64);
    }

    #[test]
    fn test_fingerprint_covers_type_and_references() {
        let text = "{\"type\":\"string\"}";
        let avro = SchemaFingerprint::compute(SchemaType::Avro, text, &[]);
        let json = SchemaFingerprint::compute(SchemaType::Json, text, &[]);
        assert_ne!(avro, json);

        let with_ref = SchemaFingerprint::compute(
            SchemaType::Json,
            text,
            &[SchemaReference::new("other.json", "other", 1)],
        );
        let with_latest = SchemaFingerprint::compute(
            SchemaType::Json,
            text,
            &[SchemaReference::latest("other.json", "other")],
        );
        assert_ne!(json, with_ref);
        assert_ne!(with_ref, with_latest);
    }

    #[test]
    fn test_hex_round_trip() {
        let fp = SchemaFingerprint::compute(SchemaType::Protobuf, "syntax = \"proto3\";\n", &[]);
        assert_eq!(SchemaFingerprint::from_hex(&fp.sha256_hex()), Some(fp));
        assert_eq!(SchemaFingerprint::from_hex("abcd"), None);
        assert_eq!(SchemaFingerprint::from_hex("not hex"), None);
    }
}
