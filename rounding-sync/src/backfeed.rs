//! Backfeed: pre-fill a new visit from the patient's most recent one

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::model::{PatientVisit, ProcedureStatus};

/// Fields carried forward from a prior visit.
///
/// Findings, pending items and follow-up belong to the encounter they were
/// recorded in and are never part of this projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfeedVisit {
    pub room: String,
    pub name: String,
    pub dob: String,
    pub mrn: String,
    pub hospital: String,
    pub plan: String,
    pub supervising_md: String,
    pub priority: bool,
    pub procedure_status: ProcedureStatus,
    pub cpt_primary: String,
    pub icd_primary: String,
    pub charge_codes_secondary: Vec<String>,
    /// Date of the visit this projection was taken from
    pub last_visit_date: String,
}

impl From<&PatientVisit> for BackfeedVisit {
    fn from(visit: &PatientVisit) -> Self {
        Self {
            room: visit.room.clone(),
            name: visit.name.clone(),
            dob: visit.dob.clone(),
            mrn: visit.mrn.clone(),
            hospital: visit.hospital.clone(),
            plan: visit.plan.clone(),
            supervising_md: visit.supervising_md.clone(),
            priority: visit.priority,
            procedure_status: visit.procedure_status,
            cpt_primary: visit.cpt_primary.clone(),
            icd_primary: visit.icd_primary.clone(),
            charge_codes_secondary: visit.charge_codes_secondary.clone(),
            last_visit_date: visit.date.clone(),
        }
    }
}

impl BackfeedVisit {
    /// Start a new, unsaved visit on `date` from this projection.
    pub fn into_new_visit(self, date: impl Into<String>) -> PatientVisit {
        PatientVisit {
            room: self.room,
            name: self.name,
            dob: self.dob,
            mrn: self.mrn,
            hospital: self.hospital,
            plan: self.plan,
            supervising_md: self.supervising_md,
            priority: self.priority,
            procedure_status: self.procedure_status,
            cpt_primary: self.cpt_primary,
            icd_primary: self.icd_primary,
            charge_codes_secondary: self.charge_codes_secondary,
            ..PatientVisit::new(String::new(), date)
        }
    }
}

fn parse_visit_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%Y-%m-%d", "%m/%d/%Y", "%m/%d/%y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

/// Most recent visit for `mrn`, projected for pre-filling.
///
/// Dates that do not parse sort below every parsed date and among themselves
/// by their text.
pub fn previous_visit<'a, I>(visits: I, mrn: &str) -> Option<BackfeedVisit>
where
    I: IntoIterator<Item = &'a PatientVisit>,
{
    let mrn = mrn.trim();
    visits
        .into_iter()
        .filter(|visit| visit.mrn.trim() == mrn)
        .max_by_key(|visit| (parse_visit_date(&visit.date), visit.date.clone()))
        .map(BackfeedVisit::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visit(mrn: &str, date: &str) -> PatientVisit {
        let mut visit = PatientVisit::new(mrn, date);
        visit.room = format!("room-{}", date);
        visit.findings_text = "fever".into();
        visit.pending = "labs".into();
        visit.follow_up = "1 week".into();
        visit.plan = "continue".into();
        visit
    }

    #[test]
    fn test_picks_latest_date() {
        let visits = vec![
            visit("MRN1", "2024-01-05"),
            visit("MRN1", "2024-03-01"),
            visit("MRN2", "2024-06-01"),
            visit("MRN1", "2024-02-10"),
        ];

        let found = previous_visit(&visits, "MRN1").unwrap();
        assert_eq!(found.last_visit_date, "2024-03-01");
        assert_eq!(found.room, "room-2024-03-01");
        assert_eq!(found.plan, "continue");
    }

    #[test]
    fn test_mixed_date_formats_compare_as_dates() {
        let visits = vec![visit("MRN1", "12/31/2023"), visit("MRN1", "2024-01-02")];
        let found = previous_visit(&visits, "MRN1").unwrap();
        assert_eq!(found.last_visit_date, "2024-01-02");
    }

    #[test]
    fn test_unknown_mrn() {
        let visits = vec![visit("MRN1", "2024-01-05")];
        assert!(previous_visit(&visits, "MRN9").is_none());
    }

    #[test]
    fn test_projection_excludes_encounter_fields() {
        let visits = vec![visit("MRN1", "2024-01-05")];
        let json = serde_json::to_value(previous_visit(&visits, "MRN1").unwrap()).unwrap();
        let object = json.as_object().unwrap();

        for excluded in ["findings", "findingsText", "pending", "followUp", "date"] {
            assert!(!object.contains_key(excluded), "{} leaked", excluded);
        }
        assert_eq!(object["lastVisitDate"], "2024-01-05");
    }

    #[test]
    fn test_new_visit_gets_its_own_date() {
        let visits = vec![visit("MRN1", "2024-01-05")];
        let next = previous_visit(&visits, "MRN1").unwrap().into_new_visit("2024-01-06");
        assert_eq!(next.date, "2024-01-06");
        assert_eq!(next.mrn, "MRN1");
        assert!(next.is_unsaved());
        assert!(next.pending.is_empty());
    }
}
