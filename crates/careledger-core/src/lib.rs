use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub mod anchors;
pub mod chain;
pub mod config;
pub mod constants;
pub mod error;
pub mod mine;
pub mod query;

pub use config::LedgerConfig;
pub use error::{LedgerError, Result};

/// Kinds of external records the ledger anchors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordType {
    Prescription,
    MedicalRecord,
    ConsentGrant,
    ConsentRevoke,
    Appointment,
    PatientRegistration,
    AuditLog,
    EmergencyAccess,
}

impl RecordType {
    pub const ALL: [RecordType; 8] = [
        RecordType::Prescription,
        RecordType::MedicalRecord,
        RecordType::ConsentGrant,
        RecordType::ConsentRevoke,
        RecordType::Appointment,
        RecordType::PatientRegistration,
        RecordType::AuditLog,
        RecordType::EmergencyAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Prescription => "PRESCRIPTION",
            RecordType::MedicalRecord => "MEDICAL_RECORD",
            RecordType::ConsentGrant => "CONSENT_GRANT",
            RecordType::ConsentRevoke => "CONSENT_REVOKE",
            RecordType::Appointment => "APPOINTMENT",
            RecordType::PatientRegistration => "PATIENT_REGISTRATION",
            RecordType::AuditLog => "AUDIT_LOG",
            RecordType::EmergencyAccess => "EMERGENCY_ACCESS",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_uppercase();
        RecordType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| LedgerError::InvalidInput(format!("unknown record type `{s}`")))
    }
}

/// The hashed fields of a block, everything except the nonce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_number: u64,
    pub previous_hash: String,
    pub data_hash: String,
    pub timestamp: DateTime<Utc>,
    pub record_type: RecordType,
    pub record_id: String,
}

impl BlockHeader {
    pub fn new(
        block_number: u64,
        previous_hash: impl Into<String>,
        data_hash: impl Into<String>,
        record_type: RecordType,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            block_number,
            previous_hash: previous_hash.into(),
            data_hash: data_hash.into(),
            timestamp: now_millis(),
            record_type,
            record_id: record_id.into(),
        }
    }

    /// Hash input is `number:prev:data:timestamp:nonce:type:id`; these are the
    /// text on either side of the nonce.
    pub fn preimage_parts(&self) -> (String, String) {
        let prefix = format!(
            "{}:{}:{}:{}:",
            self.block_number,
            self.previous_hash,
            self.data_hash,
            format_timestamp(&self.timestamp)
        );
        let suffix = format!(":{}:{}", self.record_type, self.record_id);
        (prefix, suffix)
    }

    pub fn hash_with_nonce(&self, nonce: u64) -> String {
        let (prefix, suffix) = self.preimage_parts();
        seal_hash(&prefix, nonce, &suffix)
    }

    pub fn seal(
        self,
        hash: String,
        nonce: u64,
        user_id: Option<String>,
        subject_id: Option<String>,
        metadata: BTreeMap<String, String>,
    ) -> Block {
        Block {
            block_number: self.block_number,
            previous_hash: self.previous_hash,
            data_hash: self.data_hash,
            hash,
            nonce,
            record_type: self.record_type,
            record_id: self.record_id,
            user_id,
            subject_id,
            metadata,
            timestamp: self.timestamp,
        }
    }
}

/// A committed ledger entry. Only the digest of the anchored payload is kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub block_number: u64,
    pub previous_hash: String,
    pub data_hash: String,
    pub hash: String,
    pub nonce: u64,
    pub record_type: RecordType,
    pub record_id: String,
    pub user_id: Option<String>,
    pub subject_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Block {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            block_number: self.block_number,
            previous_hash: self.previous_hash.clone(),
            data_hash: self.data_hash.clone(),
            timestamp: self.timestamp,
            record_type: self.record_type,
            record_id: self.record_id.clone(),
        }
    }

    /// Recomputes the block hash from the stored fields.
    pub fn compute_hash(&self) -> String {
        self.header().hash_with_nonce(self.nonce)
    }

    pub fn is_self_consistent(&self) -> bool {
        self.compute_hash() == self.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.block_number == 0
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn seal_hash(prefix: &str, nonce: u64, suffix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(suffix.as_bytes());
    hex::encode(hasher.finalize())
}

/// Current time at the millisecond precision that survives hashing.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// RFC 3339, UTC, milliseconds, `Z` suffix: `2024-05-01T09:30:00.123Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Digest of a caller payload. Strings are hashed as raw text; anything else
/// is hashed as compact JSON with object keys sorted at every depth.
pub fn hash_data<T: Serialize + ?Sized>(data: &T) -> Result<String> {
    let text = match serde_json::to_value(data)? {
        Value::String(s) => s,
        other => serde_json::to_string(&canonicalize(other))?,
    };
    Ok(sha256_hex(text.as_bytes()))
}

pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

pub mod pow {
    use super::{seal_hash, BlockHeader};
    use crate::error::{LedgerError, Result};

    pub fn leading_zero_digits(hash: &str) -> u32 {
        hash.bytes().take_while(|b| *b == b'0').count() as u32
    }

    pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
        leading_zero_digits(hash) >= difficulty
    }

    /// Tries nonces `1..=max_iterations` in order and returns the first
    /// `(hash, nonce)` whose hash starts with `difficulty` zero digits.
    pub fn mine(
        header: &BlockHeader,
        difficulty: u32,
        max_iterations: u64,
    ) -> Result<(String, u64)> {
        let (prefix, suffix) = header.preimage_parts();
        for nonce in 1..=max_iterations {
            let hash = seal_hash(&prefix, nonce, &suffix);
            if meets_difficulty(&hash, difficulty) {
                return Ok((hash, nonce));
            }
        }
        Err(LedgerError::MiningExhausted {
            block_number: header.block_number,
            attempts: max_iterations,
        })
    }
}
