//! Role checks and billing field masking

use crate::backfeed::BackfeedVisit;
use crate::error::{RoundingError, RoundingResult};
use crate::model::{PatientVisit, Principal};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_CLINICIAN: &str = "clinician";
pub const ROLE_BILLING: &str = "billing";

/// Placeholder shown instead of billing codes.
pub const REDACTION_MARKER: &str = "***";

/// Roles allowed to create and edit visits.
pub const EDITORS: &[&str] = &[ROLE_CLINICIAN, ROLE_ADMIN];
/// Roles allowed to see billing codes.
pub const BILLING_READERS: &[&str] = &[ROLE_BILLING, ROLE_ADMIN];

/// # Errors
///
/// `Unauthorized` when nobody is signed in.
pub fn require_principal(principal: Option<&Principal>) -> RoundingResult<&Principal> {
    principal.ok_or_else(|| RoundingError::Unauthorized("Not signed in".into()))
}

/// # Errors
///
/// `Unauthorized` without a principal, `Forbidden` when none of `roles` match.
pub fn require_any(principal: Option<&Principal>, roles: &[&str]) -> RoundingResult<()> {
    let principal = require_principal(principal)?;
    if principal.has_any_role(roles) {
        Ok(())
    } else {
        Err(RoundingError::Forbidden(format!("Requires one of: {}", roles.join(", "))))
    }
}

pub fn can_view_billing(principal: Option<&Principal>) -> bool {
    principal.is_some_and(|p| p.has_any_role(BILLING_READERS))
}

fn mask_codes(cpt: &mut String, icd: &mut String, secondary: &mut Vec<String>) {
    if !cpt.is_empty() {
        *cpt = REDACTION_MARKER.to_string();
    }
    if !icd.is_empty() {
        *icd = REDACTION_MARKER.to_string();
    }
    if !secondary.is_empty() {
        *secondary = vec![REDACTION_MARKER.to_string()];
    }
}

/// Copy of `visits` with CPT/ICD/secondary codes masked for callers
/// without billing access.
pub fn mask_billing(visits: &[PatientVisit], principal: Option<&Principal>) -> Vec<PatientVisit> {
    if can_view_billing(principal) {
        return visits.to_vec();
    }
    visits
        .iter()
        .map(|visit| {
            let mut masked = visit.clone();
            mask_codes(&mut masked.cpt_primary, &mut masked.icd_primary, &mut masked.charge_codes_secondary);
            masked
        })
        .collect()
}

pub fn mask_backfeed(mut visit: BackfeedVisit, principal: Option<&Principal>) -> BackfeedVisit {
    if !can_view_billing(principal) {
        mask_codes(&mut visit.cpt_primary, &mut visit.icd_primary, &mut visit.charge_codes_secondary);
    }
    visit
}

#[cfg(test)]
mod tests {
    use super::*;

    fn billed_visit() -> PatientVisit {
        let mut visit = PatientVisit::new("MRN1", "2024-01-01");
        visit.cpt_primary = "99223".into();
        visit.icd_primary = "N39.0".into();
        visit.charge_codes_secondary = vec!["99231".into(), "J18.9".into()];
        visit
    }

    #[test]
    fn test_require_any() {
        let clinician = Principal::new("u1", [ROLE_CLINICIAN]);
        assert!(require_any(Some(&clinician), EDITORS).is_ok());
        assert!(matches!(require_any(Some(&clinician), &[ROLE_ADMIN]), Err(RoundingError::Forbidden(_))));
        assert!(matches!(require_any(None, EDITORS), Err(RoundingError::Unauthorized(_))));
    }

    #[test]
    fn test_clinician_sees_masked_codes() {
        let clinician = Principal::new("u1", [ROLE_CLINICIAN]);
        let masked = mask_billing(&[billed_visit()], Some(&clinician));
        assert_eq!(masked[0].cpt_primary, REDACTION_MARKER);
        assert_eq!(masked[0].icd_primary, REDACTION_MARKER);
        assert_eq!(masked[0].charge_codes_secondary, vec![REDACTION_MARKER]);
    }

    #[test]
    fn test_billing_sees_codes() {
        let biller = Principal::new("u2", [ROLE_BILLING]);
        let visible = mask_billing(&[billed_visit()], Some(&biller));
        assert_eq!(visible[0], billed_visit());
    }

    #[test]
    fn test_backfeed_masking() {
        let clinician = Principal::new("u1", [ROLE_CLINICIAN]);
        let admin = Principal::new("u2", [ROLE_ADMIN]);
        let projection = BackfeedVisit::from(&billed_visit());

        let masked = mask_backfeed(projection.clone(), Some(&clinician));
        assert_eq!(masked.cpt_primary, REDACTION_MARKER);
        assert_eq!(masked.charge_codes_secondary, vec![REDACTION_MARKER]);
        assert_eq!(mask_backfeed(projection.clone(), Some(&admin)), projection);
    }
}
