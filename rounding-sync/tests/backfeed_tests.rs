/// Backfeed lookup through the sync engine, connected and local

use rounding_sync::access::{REDACTION_MARKER, ROLE_BILLING, ROLE_CLINICIAN};
use rounding_sync::schema::encode_visit;
use rounding_sync::store::ListKind;
use rounding_sync::{
    Credentials, ListStoreAdapter, LocalCache, MemoryCacheBackend, MemoryListBackend, PatientVisit, Principal,
    ProcedureStatus, RetryPolicy, RoundingError, SyncEngine, SyncMode, TracingAuditSink,
};
use std::sync::Arc;

fn visit(mrn: &str, date: &str, plan: &str) -> PatientVisit {
    let mut visit = PatientVisit::new(mrn, date);
    visit.name = "Jane Doe".into();
    visit.room = "101".into();
    visit.plan = plan.into();
    visit.findings_text = format!("findings {}", date);
    visit.pending = "CBC".into();
    visit.cpt_primary = "99232".into();
    visit.procedure_status = ProcedureStatus::InProgress;
    visit
}

fn seeded_backend() -> Arc<MemoryListBackend> {
    let backend = Arc::new(MemoryListBackend::new());
    backend.seed(ListKind::Patients, encode_visit(&visit("MRN1", "2024-01-02", "older plan")));
    backend.seed(ListKind::Patients, encode_visit(&visit("MRN1", "2024-01-10", "latest plan")));
    backend.seed(ListKind::Patients, encode_visit(&visit("MRN2", "2024-01-11", "other patient")));
    backend
}

async fn started(backend: &Arc<MemoryListBackend>, roles: &[&str]) -> SyncEngine {
    let store = Arc::new(ListStoreAdapter::new(backend.clone(), RetryPolicy::none()));
    let cache = LocalCache::new(Arc::new(MemoryCacheBackend::new()));
    let mut engine = SyncEngine::new(store, cache, Arc::new(TracingAuditSink));
    engine
        .start(Credentials::new(Principal::new("dr-lee", roles.iter().copied()), "token"))
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn test_latest_visit_is_projected() {
    let backend = seeded_backend();
    let engine = started(&backend, &[ROLE_BILLING]).await;

    let previous = engine.get_previous_visit("MRN1").await.unwrap();
    assert_eq!(previous.last_visit_date, "2024-01-10");
    assert_eq!(previous.plan, "latest plan");
    assert_eq!(previous.cpt_primary, "99232");
    assert_eq!(previous.procedure_status, ProcedureStatus::InProgress);

    let next = previous.into_new_visit("2024-01-11");
    assert!(next.is_unsaved());
    assert!(next.findings_text.is_empty());
    assert!(next.pending.is_empty());
    assert_eq!(next.room, "101");
}

#[tokio::test]
async fn test_unknown_mrn_is_not_found() {
    let backend = seeded_backend();
    let engine = started(&backend, &[ROLE_CLINICIAN]).await;

    let result = engine.get_previous_visit("MRN-NEW").await;
    assert!(matches!(result, Err(RoundingError::NotFound(_))));
    let result = engine.get_previous_visit("   ").await;
    assert!(matches!(result, Err(RoundingError::InvalidOperation(_))));
}

#[tokio::test]
async fn test_clinician_gets_masked_codes() {
    let backend = seeded_backend();
    let engine = started(&backend, &[ROLE_CLINICIAN]).await;

    let previous = engine.get_previous_visit("MRN1").await.unwrap();
    assert_eq!(previous.cpt_primary, REDACTION_MARKER);
    assert_eq!(previous.plan, "latest plan");
}

#[tokio::test]
async fn test_local_mode_uses_loaded_visits() {
    let backend = seeded_backend();
    let mut engine = started(&backend, &[ROLE_BILLING]).await;
    backend.set_offline(true);
    engine.handle_offline();
    assert_eq!(engine.mode(), SyncMode::Local);
    backend.reset_calls();

    let previous = engine.get_previous_visit("MRN1").await.unwrap();
    assert_eq!(previous.last_visit_date, "2024-01-10");
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn test_lookup_requires_session() {
    let backend = seeded_backend();
    let store = Arc::new(ListStoreAdapter::new(backend.clone(), RetryPolicy::none()));
    let engine = SyncEngine::new(store, LocalCache::disabled(), Arc::new(TracingAuditSink));

    let result = engine.get_previous_visit("MRN1").await;
    assert!(matches!(result, Err(RoundingError::Unauthorized(_))));
}
