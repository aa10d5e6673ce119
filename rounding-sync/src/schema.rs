//! Encode/decode boundary between domain types and list item fields
//!
//! Every list field name used anywhere in the crate is defined here. Values
//! that are absent in storage decode to the model defaults: empty text,
//! `false` for flags, `To-Do` for the procedure status.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::audit::AuditEntry;
use crate::model::{Findings, GlobalSettings, OnCallShift, PatientVisit, ProcedureStatus};

pub type FieldMap = serde_json::Map<String, Value>;

/// One row of a remote list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: String,
    pub fields: FieldMap,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
}

pub mod fields {
    pub const VISIT_KEY: &str = "VisitKey";
    pub const ROOM: &str = "Room";
    pub const DATE: &str = "Date";
    pub const NAME: &str = "Name";
    pub const DOB: &str = "DOB";
    pub const MRN: &str = "MRN";
    pub const HOSPITAL: &str = "Hospital";
    pub const FINDINGS_DATA: &str = "FindingsData";
    pub const FINDINGS_TEXT: &str = "FindingsText";
    pub const PLAN: &str = "Plan";
    pub const SUPERVISING_MD: &str = "SupervisingMD";
    pub const PENDING: &str = "Pending";
    pub const FOLLOW_UP: &str = "FollowUp";
    pub const PRIORITY: &str = "Priority";
    pub const PROCEDURE_STATUS: &str = "ProcedureStatus";
    pub const CPT_PRIMARY: &str = "CPTPrimary";
    pub const ICD_PRIMARY: &str = "ICDPrimary";
    pub const CHARGE_CODES_SECONDARY: &str = "ChargeCodesSecondary";
    pub const ARCHIVED: &str = "Archived";
    pub const MODIFIED: &str = "Modified";

    pub const PROVIDER: &str = "Provider";
    pub const HOSPITALS: &str = "Hospitals";

    pub const KEY: &str = "Key";
    pub const VALUE: &str = "Value";

    pub const TITLE: &str = "Title";
    pub const USER_IDENTITY: &str = "UserIdentity";
    pub const ACTION_TYPE: &str = "ActionType";
    pub const AFFECTED_RECORDS: &str = "AffectedRecords";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const DETAILS: &str = "Details";
}

const YES: &str = "Yes";
const NO: &str = "No";

fn text(map: &FieldMap, name: &str) -> String {
    match map.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn flag(map: &FieldMap, name: &str) -> bool {
    match map.get(name) {
        Some(Value::String(s)) => s.eq_ignore_ascii_case(YES),
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

fn yes_no(value: bool) -> Value {
    Value::String(if value { YES } else { NO }.to_string())
}

/// Strip a time component the store may have added to a plain date.
fn date_part(raw: &str) -> String {
    if let Some((day, _)) = raw.split_once('T') {
        if NaiveDate::parse_from_str(day, "%Y-%m-%d").is_ok() {
            return day.to_string();
        }
    }
    raw.to_string()
}

fn decode_findings(raw: &str) -> Findings {
    if raw.trim().is_empty() {
        return Findings::default();
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) if map.contains_key("codes") || map.contains_key("values") => {
            serde_json::from_value(Value::Object(map)).unwrap_or_default()
        }
        // Older rows stored only the annotation map; its keys are the codes.
        Ok(Value::Object(map)) => Findings {
            codes: map.keys().cloned().collect(),
            values: map.into_iter().collect(),
        },
        _ => {
            tracing::warn!("Ignoring unreadable findings payload");
            Findings::default()
        }
    }
}

fn decode_charge_codes(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if let Ok(codes) = serde_json::from_str::<Vec<String>>(raw) {
        return codes;
    }
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

fn decode_modified(item: &ListItem) -> DateTime<Utc> {
    item.last_modified
        .or_else(|| {
            DateTime::parse_from_rfc3339(&text(&item.fields, fields::MODIFIED))
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
        .unwrap_or_else(Utc::now)
}

pub fn encode_visit(visit: &PatientVisit) -> FieldMap {
    let findings = serde_json::to_string(&visit.findings).unwrap_or_else(|_| "{}".to_string());
    let charge_codes =
        serde_json::to_string(&visit.charge_codes_secondary).unwrap_or_else(|_| "[]".to_string());

    let mut map = FieldMap::new();
    map.insert(fields::VISIT_KEY.into(), Value::String(visit.visit_key().to_string()));
    map.insert(fields::ROOM.into(), Value::String(visit.room.clone()));
    map.insert(fields::DATE.into(), Value::String(visit.date.clone()));
    map.insert(fields::NAME.into(), Value::String(visit.name.clone()));
    map.insert(fields::DOB.into(), Value::String(visit.dob.clone()));
    map.insert(fields::MRN.into(), Value::String(visit.mrn.clone()));
    map.insert(fields::HOSPITAL.into(), Value::String(visit.hospital.clone()));
    map.insert(fields::FINDINGS_DATA.into(), Value::String(findings));
    map.insert(fields::FINDINGS_TEXT.into(), Value::String(visit.findings_text.clone()));
    map.insert(fields::PLAN.into(), Value::String(visit.plan.clone()));
    map.insert(fields::SUPERVISING_MD.into(), Value::String(visit.supervising_md.clone()));
    map.insert(fields::PENDING.into(), Value::String(visit.pending.clone()));
    map.insert(fields::FOLLOW_UP.into(), Value::String(visit.follow_up.clone()));
    map.insert(fields::PRIORITY.into(), yes_no(visit.priority));
    map.insert(
        fields::PROCEDURE_STATUS.into(),
        Value::String(visit.procedure_status.as_str().to_string()),
    );
    map.insert(fields::CPT_PRIMARY.into(), Value::String(visit.cpt_primary.clone()));
    map.insert(fields::ICD_PRIMARY.into(), Value::String(visit.icd_primary.clone()));
    map.insert(fields::CHARGE_CODES_SECONDARY.into(), Value::String(charge_codes));
    map.insert(fields::ARCHIVED.into(), yes_no(visit.archived));
    map
}

pub fn decode_visit(item: &ListItem) -> PatientVisit {
    let f = &item.fields;
    let status_raw = text(f, fields::PROCEDURE_STATUS);
    let procedure_status = if status_raw.trim().is_empty() {
        ProcedureStatus::default()
    } else {
        status_raw.parse().unwrap_or_else(|_| {
            tracing::warn!(item_id = %item.id, status = %status_raw, "Unknown procedure status, using To-Do");
            ProcedureStatus::default()
        })
    };

    PatientVisit {
        id: Some(item.id.clone()),
        room: text(f, fields::ROOM),
        date: date_part(&text(f, fields::DATE)),
        name: text(f, fields::NAME),
        dob: text(f, fields::DOB),
        mrn: text(f, fields::MRN),
        hospital: text(f, fields::HOSPITAL),
        findings: decode_findings(&text(f, fields::FINDINGS_DATA)),
        findings_text: text(f, fields::FINDINGS_TEXT),
        plan: text(f, fields::PLAN),
        supervising_md: text(f, fields::SUPERVISING_MD),
        pending: text(f, fields::PENDING),
        follow_up: text(f, fields::FOLLOW_UP),
        priority: flag(f, fields::PRIORITY),
        procedure_status,
        cpt_primary: text(f, fields::CPT_PRIMARY),
        icd_primary: text(f, fields::ICD_PRIMARY),
        charge_codes_secondary: decode_charge_codes(&text(f, fields::CHARGE_CODES_SECONDARY)),
        archived: flag(f, fields::ARCHIVED),
        last_updated: decode_modified(item),
    }
}

pub fn encode_shift(shift: &OnCallShift) -> FieldMap {
    let mut map = FieldMap::new();
    map.insert(fields::DATE.into(), Value::String(shift.date.clone()));
    map.insert(fields::PROVIDER.into(), Value::String(shift.provider.clone()));
    map.insert(fields::HOSPITALS.into(), Value::String(shift.hospitals.clone()));
    map
}

pub fn decode_shift(item: &ListItem) -> OnCallShift {
    OnCallShift {
        id: Some(item.id.clone()),
        date: date_part(&text(&item.fields, fields::DATE)),
        provider: text(&item.fields, fields::PROVIDER),
        hospitals: text(&item.fields, fields::HOSPITALS),
    }
}

pub fn encode_setting(key: &str, value: &str) -> FieldMap {
    let mut map = FieldMap::new();
    map.insert(fields::KEY.into(), Value::String(key.to_string()));
    map.insert(fields::VALUE.into(), Value::String(value.to_string()));
    map
}

/// Fold key/value rows into the settings record; rows without a key are skipped.
pub fn decode_settings(items: &[ListItem]) -> GlobalSettings {
    let mut settings = GlobalSettings::default();
    for item in items {
        let key = text(&item.fields, fields::KEY);
        if key.is_empty() {
            continue;
        }
        settings.set(&key, &text(&item.fields, fields::VALUE));
    }
    settings
}

pub fn encode_audit(entry: &AuditEntry) -> FieldMap {
    let mut map = FieldMap::new();
    map.insert(fields::TITLE.into(), Value::String(entry.action.clone()));
    map.insert(fields::USER_IDENTITY.into(), Value::String(entry.user.clone()));
    map.insert(fields::ACTION_TYPE.into(), Value::String(entry.action_type.as_str().to_string()));
    map.insert(fields::AFFECTED_RECORDS.into(), Value::String(entry.affected_records.clone()));
    map.insert(fields::TIMESTAMP.into(), Value::String(entry.timestamp.to_rfc3339()));
    map.insert(fields::DETAILS.into(), Value::String(entry.details.to_string()));
    map
}
