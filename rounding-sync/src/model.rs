//! Domain model for the rounding list
//!
//! One schema for every layer: the remote adapter, the local cache and the
//! listeners all see these types. Storage field names live in [`crate::schema`].

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::RoundingError;

/// Prefix of identifiers assigned to visits created while in local mode.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Composite `MRN|date` key; at most one live visit exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitKey(String);

impl VisitKey {
    pub fn new(mrn: &str, date: &str) -> Self {
        Self(format!("{}|{}", mrn.trim(), date.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VisitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Procedure workflow state of a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProcedureStatus {
    #[default]
    #[serde(rename = "To-Do")]
    ToDo,
    #[serde(rename = "In-Progress")]
    InProgress,
    #[serde(rename = "Completed")]
    Completed,
    #[serde(rename = "Post-Op")]
    PostOp,
}

impl ProcedureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcedureStatus::ToDo => "To-Do",
            ProcedureStatus::InProgress => "In-Progress",
            ProcedureStatus::Completed => "Completed",
            ProcedureStatus::PostOp => "Post-Op",
        }
    }
}

impl fmt::Display for ProcedureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcedureStatus {
    type Err = RoundingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "To-Do" => Ok(ProcedureStatus::ToDo),
            "In-Progress" => Ok(ProcedureStatus::InProgress),
            "Completed" => Ok(ProcedureStatus::Completed),
            "Post-Op" => Ok(ProcedureStatus::PostOp),
            other => Err(RoundingError::InvalidOperation(format!(
                "Unknown procedure status: {}",
                other
            ))),
        }
    }
}

/// Structured findings: coded findings plus free-form annotations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Findings {
    #[serde(default)]
    pub codes: Vec<String>,
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl Findings {
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty() && self.values.is_empty()
    }
}

/// One patient visit on one date.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientVisit {
    /// Remote item id, a `local-` id for visits created offline, or none before first save.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub room: String,
    pub date: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dob: String,
    pub mrn: String,
    #[serde(default)]
    pub hospital: String,
    #[serde(default)]
    pub findings: Findings,
    #[serde(default)]
    pub findings_text: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub supervising_md: String,
    #[serde(default)]
    pub pending: String,
    #[serde(default)]
    pub follow_up: String,
    #[serde(default)]
    pub priority: bool,
    #[serde(default)]
    pub procedure_status: ProcedureStatus,
    #[serde(default)]
    pub cpt_primary: String,
    #[serde(default)]
    pub icd_primary: String,
    #[serde(default)]
    pub charge_codes_secondary: Vec<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub last_updated: DateTime<Utc>,
}

impl PatientVisit {
    pub fn new(mrn: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            mrn: mrn.into(),
            date: date.into(),
            ..Default::default()
        }
    }

    pub fn visit_key(&self) -> VisitKey {
        VisitKey::new(&self.mrn, &self.date)
    }

    /// True when the remote store has never seen this visit.
    pub fn is_unsaved(&self) -> bool {
        match &self.id {
            None => true,
            Some(id) => id.is_empty() || id.starts_with(LOCAL_ID_PREFIX),
        }
    }
}

/// On-call coverage for one date.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnCallShift {
    #[serde(default)]
    pub id: Option<String>,
    pub date: String,
    pub provider: String,
    /// Comma separated list or free text.
    #[serde(default)]
    pub hospitals: String,
}

impl OnCallShift {
    pub fn new(date: impl Into<String>, provider: impl Into<String>, hospitals: impl Into<String>) -> Self {
        Self {
            id: None,
            date: date.into(),
            provider: provider.into(),
            hospitals: hospitals.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplianceMode {
    #[default]
    Relaxed,
    Strict,
}

impl ComplianceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceMode::Relaxed => "relaxed",
            ComplianceMode::Strict => "strict",
        }
    }

    /// Empty means relaxed; any value other than `relaxed` selects the stricter mode.
    pub fn parse_lenient(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("relaxed") {
            ComplianceMode::Relaxed
        } else {
            ComplianceMode::Strict
        }
    }
}

pub mod setting_keys {
    pub const ON_CALL: &str = "onCall";
    pub const HOSPITALS: &str = "hospitals";
    pub const COMPLIANCE_MODE: &str = "complianceMode";
}

/// Global settings, read by everyone and written by administrators.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    #[serde(default)]
    pub on_call: String,
    #[serde(default)]
    pub hospitals: String,
    #[serde(default)]
    pub compliance_mode: ComplianceMode,
    /// Keys this version does not know about, kept so they survive a round trip.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl GlobalSettings {
    pub fn set(&mut self, key: &str, value: &str) {
        match key {
            setting_keys::ON_CALL => self.on_call = value.to_string(),
            setting_keys::HOSPITALS => self.hospitals = value.to_string(),
            setting_keys::COMPLIANCE_MODE => self.compliance_mode = ComplianceMode::parse_lenient(value),
            other => {
                self.extra.insert(other.to_string(), value.to_string());
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            setting_keys::ON_CALL => Some(self.on_call.clone()),
            setting_keys::HOSPITALS => Some(self.hospitals.clone()),
            setting_keys::COMPLIANCE_MODE => Some(self.compliance_mode.as_str().to_string()),
            other => self.extra.get(other).cloned(),
        }
    }

    pub fn hospital_list(&self) -> Vec<String> {
        self.hospitals
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Authenticated user as seen by the core.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

impl Principal {
    pub fn new<I, S>(user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_any_role(&self, roles: &[&str]) -> bool {
        roles.iter().any(|role| self.has_role(role))
    }
}

/// What `SyncEngine::start` needs from the authentication provider.
#[derive(Debug)]
pub struct Credentials {
    pub principal: Principal,
    pub access_token: SecretString,
}

impl Credentials {
    pub fn new(principal: Principal, access_token: impl Into<String>) -> Self {
        Self {
            principal,
            access_token: SecretString::new(access_token.into()),
        }
    }
}
