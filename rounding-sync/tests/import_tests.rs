/// Rounding spreadsheet import through the sync engine
///
/// Parsing happens before any write, on-call rows need the admin role,
/// duplicates are reported and skipped.

use rounding_sync::access::{ROLE_ADMIN, ROLE_BILLING, ROLE_CLINICIAN};
use rounding_sync::store::ListKind;
use rounding_sync::{
    Credentials, ListStoreAdapter, LocalCache, MemoryListBackend, Principal, ProcedureStatus, RetryPolicy,
    RoundingError, SyncEngine, SyncMode, TracingAuditSink,
};
use std::sync::Arc;

const SAMPLE: &str = "\
\n\
\n\
\n\
Hospital,Date,Name,DOB,MRN,Dx,Plan,MD,Pending,Follow\n\
General Hospital\n\
101,2024-01-01,Jane Doe,1990-01-01,MRN123,Cough,Observe,Dr. Lee,,\n";

const WITH_ON_CALL: &str = "\
2024-01-01,Dr. Adams,General Hospital\n\
2024-01-02,,General Hospital\n\
2024-01-03,Dr. Baker,\"General Hospital, St. Mary\"\n\
Room,Date,Patient Name,DOB,MRN,Findings,Plan,Supervising MD,Pending,Follow-up\n\
General Hospital\n\
101,2024-01-01,Jane Doe,1990-01-01,MRN123,Cough,Observe,Dr. Lee,CBC,Clinic\n\
102,2024-01-01,John Roe,1985-05-05,MRN456,\"Fever, chills\",Cultures,Dr. Lee,,\n\
St. Mary\n\
7,2024-01-01,No Number,1970-01-01,,,,,,\n\
8,2024-01-01,Ann Poe,1960-06-06,MRN789,,,Dr. Kim,,\n";

async fn started(backend: &Arc<MemoryListBackend>, roles: &[&str]) -> SyncEngine {
    let store = Arc::new(ListStoreAdapter::new(backend.clone(), RetryPolicy::none()));
    let mut engine = SyncEngine::new(store, LocalCache::disabled(), Arc::new(TracingAuditSink));
    engine
        .start(Credentials::new(Principal::new("dr-lee", roles.iter().copied()), "token"))
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn test_sample_sheet_end_to_end() {
    let backend = Arc::new(MemoryListBackend::new());
    let mut engine = started(&backend, &[ROLE_CLINICIAN]).await;

    let report = engine.import_csv(SAMPLE).await.unwrap();
    assert_eq!(report.patients_parsed, 1);
    assert_eq!(report.patients_created, 1);
    assert_eq!(report.shifts_parsed, 0);
    assert!(report.duplicates.is_empty());

    assert_eq!(backend.items(ListKind::Patients).len(), 1);
    assert!(backend.items(ListKind::OnCall).is_empty());

    let patient = &engine.patients()[0];
    assert_eq!(patient.mrn, "MRN123");
    assert_eq!(patient.hospital, "General Hospital");
    assert_eq!(patient.room, "101");
    assert_eq!(patient.findings_text, "Cough");
    assert_eq!(patient.procedure_status, ProcedureStatus::ToDo);
    assert!(!patient.is_unsaved());
}

#[tokio::test]
async fn test_admin_import_saves_complete_shifts() {
    let backend = Arc::new(MemoryListBackend::new());
    let mut engine = started(&backend, &[ROLE_ADMIN]).await;

    let report = engine.import_csv(WITH_ON_CALL).await.unwrap();
    assert_eq!(report.shifts_parsed, 3);
    assert_eq!(report.shifts_saved, 2);
    assert_eq!(report.shifts_skipped, 1);
    assert_eq!(report.patients_created, 3);

    let providers: Vec<_> = engine.on_call_schedule().iter().map(|s| s.provider.as_str()).collect();
    assert_eq!(providers, vec!["Dr. Adams", "Dr. Baker"]);
    assert_eq!(engine.on_call_schedule()[1].hospitals, "General Hospital, St. Mary");

    let ann = engine.patients().iter().find(|p| p.mrn == "MRN789").unwrap();
    assert_eq!(ann.hospital, "St. Mary");
    let john = engine.patients().iter().find(|p| p.mrn == "MRN456").unwrap();
    assert_eq!(john.findings_text, "Fever, chills");
}

#[tokio::test]
async fn test_clinician_import_skips_on_call_rows() {
    let backend = Arc::new(MemoryListBackend::new());
    let mut engine = started(&backend, &[ROLE_CLINICIAN]).await;

    let report = engine.import_csv(WITH_ON_CALL).await.unwrap();
    assert_eq!(report.shifts_saved, 0);
    assert_eq!(report.shifts_skipped, 3);
    assert_eq!(report.patients_created, 3);
    assert!(backend.items(ListKind::OnCall).is_empty());
}

#[tokio::test]
async fn test_short_input_fails_before_any_write() {
    let backend = Arc::new(MemoryListBackend::new());
    let mut engine = started(&backend, &[ROLE_ADMIN]).await;
    backend.reset_calls();

    let result = engine.import_csv("2024-01-01,Dr. Adams,General\n\n\nRoom,MRN\n").await;
    assert!(matches!(result, Err(RoundingError::MalformedImport(_))));
    assert_eq!(backend.call_count(), 0);
    assert!(engine.patients().is_empty());
}

#[tokio::test]
async fn test_reimport_reports_duplicates() {
    let backend = Arc::new(MemoryListBackend::new());
    let mut engine = started(&backend, &[ROLE_CLINICIAN]).await;

    engine.import_csv(SAMPLE).await.unwrap();
    let report = engine.import_csv(SAMPLE).await.unwrap();

    assert_eq!(report.patients_created, 0);
    assert_eq!(report.duplicates, vec!["MRN123|2024-01-01".to_string()]);
    assert_eq!(backend.items(ListKind::Patients).len(), 1);
}

#[tokio::test]
async fn test_billing_role_cannot_import() {
    let backend = Arc::new(MemoryListBackend::new());
    let mut engine = started(&backend, &[ROLE_BILLING]).await;
    let result = engine.import_csv(SAMPLE).await;
    assert!(matches!(result, Err(RoundingError::Forbidden(_))));
}

#[tokio::test]
async fn test_local_mode_import_stays_local() {
    let backend = Arc::new(MemoryListBackend::new());
    backend.set_offline(true);
    let mut engine = started(&backend, &[ROLE_ADMIN]).await;
    assert_eq!(engine.mode(), SyncMode::Local);

    let report = engine.import_csv(WITH_ON_CALL).await.unwrap();
    assert_eq!(report.patients_created, 3);
    assert_eq!(report.shifts_saved, 2);
    assert!(engine.patients().iter().all(|p| p.is_unsaved()));
    assert!(backend.items(ListKind::Patients).is_empty());
}
