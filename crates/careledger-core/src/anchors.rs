//! Payload builders for the workflows that anchor into the ledger.
//!
//! Each builder picks the integrity-relevant fields of a business record,
//! the record type, and the summary shown in listings. The business record
//! itself never reaches the ledger, only the digest of this payload.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{chain::AnchorContext, format_timestamp, now_millis, RecordType};

/// Everything [`crate::chain::Chain::anchor`] needs for one block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRequest {
    pub record_type: RecordType,
    pub record_id: String,
    pub payload: Value,
    #[serde(default)]
    pub context: AnchorContext,
}

impl AnchorRequest {
    pub fn new(record_type: RecordType, record_id: impl Into<String>, payload: Value) -> Self {
        Self {
            record_type,
            record_id: record_id.into(),
            payload,
            context: AnchorContext::default(),
        }
    }

    pub fn with_context(mut self, context: AnchorContext) -> Self {
        self.context = context;
        self
    }
}

pub trait IntoAnchor {
    fn into_anchor(self, actor_id: Option<String>) -> AnchorRequest;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionAnchor {
    pub id: String,
    pub prescription_number: String,
    pub patient_id: String,
    pub doctor_id: String,
    #[serde(default)]
    pub items: Vec<Value>,
    pub diagnosis: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl IntoAnchor for PrescriptionAnchor {
    fn into_anchor(self, actor_id: Option<String>) -> AnchorRequest {
        let created_at = self.created_at.unwrap_or_else(now_millis);
        let payload = json!({
            "prescription_number": self.prescription_number,
            "patient_id": self.patient_id,
            "doctor_id": self.doctor_id,
            "items": self.items,
            "diagnosis": self.diagnosis,
            "created_at": format_timestamp(&created_at),
        });
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "prescription_number".to_string(),
            self.prescription_number.clone(),
        );
        AnchorRequest::new(RecordType::Prescription, self.id, payload).with_context(AnchorContext {
            actor_id,
            subject_id: Some(self.patient_id),
            summary: Some(format!("Prescription {} for patient", self.prescription_number)),
            metadata,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MedicalRecordAnchor {
    pub id: String,
    pub patient_id: String,
    pub report_type: Option<String>,
    pub file_name: String,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl IntoAnchor for MedicalRecordAnchor {
    fn into_anchor(self, actor_id: Option<String>) -> AnchorRequest {
        let uploaded_at = self.uploaded_at.unwrap_or_else(now_millis);
        let payload = json!({
            "record_id": self.id,
            "patient_id": self.patient_id,
            "report_type": self.report_type,
            "file_name": self.file_name,
            "uploaded_at": format_timestamp(&uploaded_at),
        });
        let label = self.report_type.clone().unwrap_or_else(|| self.file_name.clone());
        let mut metadata = BTreeMap::new();
        if let Some(report_type) = &self.report_type {
            metadata.insert("report_type".to_string(), report_type.clone());
        }
        AnchorRequest::new(RecordType::MedicalRecord, self.id, payload).with_context(AnchorContext {
            actor_id,
            subject_id: Some(self.patient_id),
            summary: Some(format!("Medical record: {label}")),
            metadata,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentAction {
    Grant,
    Revoke,
}

impl ConsentAction {
    pub fn record_type(self) -> RecordType {
        match self {
            ConsentAction::Grant => RecordType::ConsentGrant,
            ConsentAction::Revoke => RecordType::ConsentRevoke,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConsentAction::Grant => "grant",
            ConsentAction::Revoke => "revoke",
        }
    }
}

/// A consent decision. Revocation is its own block; the grant block is
/// never touched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsentAnchor {
    pub id: String,
    pub patient_id: String,
    pub provider_id: String,
    pub consent_type: String,
    pub action: ConsentAction,
    pub actioned_at: Option<DateTime<Utc>>,
}

impl IntoAnchor for ConsentAnchor {
    fn into_anchor(self, actor_id: Option<String>) -> AnchorRequest {
        let actioned_at = self.actioned_at.unwrap_or_else(now_millis);
        let action = self.action.as_str();
        let payload = json!({
            "consent_id": self.id,
            "patient_id": self.patient_id,
            "provider_id": self.provider_id,
            "consent_type": self.consent_type,
            "action": action,
            "actioned_at": format_timestamp(&actioned_at),
        });
        let mut metadata = BTreeMap::new();
        metadata.insert("consent_type".to_string(), self.consent_type.clone());
        metadata.insert("action".to_string(), action.to_string());
        AnchorRequest::new(self.action.record_type(), self.id, payload).with_context(AnchorContext {
            actor_id,
            subject_id: Some(self.patient_id),
            summary: Some(format!("Consent {action}: {}", self.consent_type)),
            metadata,
        })
    }
}
