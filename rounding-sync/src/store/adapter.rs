use async_trait::async_trait;
use logger_redacted::hash_identifier;
use secrecy::{ExposeSecret, SecretString};

use super::{ListBackend, ListKind, ListQuery, PatientBatch, RemoteStore, RetryPolicy};
use crate::audit::{AuditEntry, AuditSink};
use crate::error::{RoundingError, RoundingResult};
use crate::model::{Credentials, GlobalSettings, OnCallShift, PatientVisit};
use crate::schema::{self, fields, FieldMap, ListItem};

/// [`RemoteStore`] over a list backend
///
/// Every backend call goes through the retry policy. Creates are guarded by a
/// `VisitKey` lookup so a second visit for the same MRN and date surfaces as
/// `Conflict` instead of a duplicate row.
pub struct ListStoreAdapter<B> {
    backend: B,
    retry: RetryPolicy,
}

impl<B: ListBackend> ListStoreAdapter<B> {
    pub fn new(backend: B, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn query(&self, list: ListKind, query: ListQuery) -> RoundingResult<Vec<ListItem>> {
        let backend = &self.backend;
        let query = &query;
        self.retry
            .run("query", move || backend.query(list, query))
            .await
    }

    async fn create(&self, list: ListKind, fields_map: FieldMap) -> RoundingResult<ListItem> {
        let backend = &self.backend;
        let fields_map = &fields_map;
        self.retry
            .run("create", move || backend.create(list, fields_map.clone()))
            .await
    }

    async fn update(&self, list: ListKind, id: &str, fields_map: FieldMap) -> RoundingResult<ListItem> {
        let backend = &self.backend;
        let fields_map = &fields_map;
        self.retry
            .run("update", move || backend.update(list, id, fields_map.clone()))
            .await
    }

    async fn delete(&self, list: ListKind, id: &str) -> RoundingResult<()> {
        let backend = &self.backend;
        self.retry
            .run("delete", move || backend.delete(list, id))
            .await
    }

    /// First row whose `field` equals `value`.
    async fn find_one(&self, list: ListKind, field: &str, value: &str) -> RoundingResult<Option<ListItem>> {
        let rows = self
            .query(list, ListQuery::all().filter_eq(field, value).top(1))
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Update when a row matches `field == value`, create otherwise.
    async fn upsert(&self, list: ListKind, field: &str, value: &str, fields_map: FieldMap) -> RoundingResult<ListItem> {
        match self.find_one(list, field, value).await? {
            Some(existing) => self.update(list, &existing.id, fields_map).await,
            None => self.create(list, fields_map).await,
        }
    }
}

#[async_trait]
impl<B: ListBackend> RemoteStore for ListStoreAdapter<B> {
    async fn authenticate(&self, credentials: &Credentials) -> RoundingResult<()> {
        let token = credentials.access_token.expose_secret();
        if token.trim().is_empty() {
            return Err(RoundingError::Unauthorized("Empty access token".into()));
        }
        self.backend.set_access_token(SecretString::new(token.clone()));
        tracing::debug!(
            user = %hash_identifier(&credentials.principal.user_id),
            "Remote store session authenticated"
        );
        Ok(())
    }

    async fn fetch_patients(&self, date: Option<&str>) -> RoundingResult<PatientBatch> {
        let query = match date {
            Some(date) => ListQuery::all().filter_eq(fields::DATE, date),
            None => ListQuery::all(),
        };
        let rows = self.query(ListKind::Patients, query).await?;
        let batch = PatientBatch::new(rows.iter().map(schema::decode_visit).collect());
        tracing::debug!(
            count = batch.patients.len(),
            last_updated_max = %batch.last_updated_max,
            "Fetched patients"
        );
        Ok(batch)
    }

    async fn fetch_patients_by_mrn(&self, mrn: &str) -> RoundingResult<Vec<PatientVisit>> {
        let query = ListQuery::all()
            .filter_eq(fields::MRN, mrn)
            .order_by_desc(fields::DATE);
        let rows = self.query(ListKind::Patients, query).await?;
        Ok(rows.iter().map(schema::decode_visit).collect())
    }

    async fn save_patient(&self, visit: &PatientVisit) -> RoundingResult<PatientVisit> {
        let key = visit.visit_key();
        let existing = self
            .find_one(ListKind::Patients, fields::VISIT_KEY, key.as_str())
            .await?;

        let item = if visit.is_unsaved() {
            if existing.is_some() {
                tracing::info!(mrn_hash = %hash_identifier(&visit.mrn), date = %visit.date, "Duplicate visit rejected");
                return Err(RoundingError::Conflict(format!("Patient already rounded on {}", visit.date)));
            }
            self.create(ListKind::Patients, schema::encode_visit(visit)).await?
        } else {
            let id = visit.id.as_deref().unwrap_or_default();
            if existing.as_ref().is_some_and(|row| row.id != id) {
                return Err(RoundingError::Conflict(format!("Patient already rounded on {}", visit.date)));
            }
            self.update(ListKind::Patients, id, schema::encode_visit(visit)).await?
        };

        tracing::debug!(mrn_hash = %hash_identifier(&visit.mrn), id = %item.id, "Saved patient visit");
        Ok(schema::decode_visit(&item))
    }

    async fn delete_patient(&self, id: &str) -> RoundingResult<()> {
        self.delete(ListKind::Patients, id).await
    }

    async fn fetch_on_call_schedule(&self) -> RoundingResult<Vec<OnCallShift>> {
        let rows = self.query(ListKind::OnCall, ListQuery::all()).await?;
        let mut shifts: Vec<OnCallShift> = rows.iter().map(schema::decode_shift).collect();
        shifts.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(shifts)
    }

    async fn save_on_call_shift(&self, shift: &OnCallShift) -> RoundingResult<OnCallShift> {
        let item = self
            .upsert(ListKind::OnCall, fields::DATE, &shift.date, schema::encode_shift(shift))
            .await?;
        Ok(schema::decode_shift(&item))
    }

    async fn delete_on_call_shift(&self, id: &str) -> RoundingResult<()> {
        self.delete(ListKind::OnCall, id).await
    }

    async fn fetch_settings(&self) -> RoundingResult<GlobalSettings> {
        let rows = self.query(ListKind::Settings, ListQuery::all()).await?;
        Ok(schema::decode_settings(&rows))
    }

    async fn save_setting(&self, key: &str, value: &str) -> RoundingResult<()> {
        self.upsert(ListKind::Settings, fields::KEY, key, schema::encode_setting(key, value))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<B: ListBackend> AuditSink for ListStoreAdapter<B> {
    async fn record(&self, entry: AuditEntry) -> RoundingResult<()> {
        self.create(ListKind::Audit, schema::encode_audit(&entry)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditActionType;
    use crate::model::Principal;
    use crate::store::MemoryListBackend;
    use std::sync::Arc;

    fn adapter() -> (Arc<MemoryListBackend>, ListStoreAdapter<Arc<MemoryListBackend>>) {
        let backend = Arc::new(MemoryListBackend::new());
        let adapter = ListStoreAdapter::new(backend.clone(), RetryPolicy::none());
        (backend, adapter)
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let (backend, adapter) = adapter();
        let mut visit = PatientVisit::new("MRN1", "2024-01-01");
        visit.room = "12".into();

        let saved = adapter.save_patient(&visit).await.unwrap();
        assert!(!saved.is_unsaved());

        let mut edited = saved.clone();
        edited.plan = "Discharge".into();
        let updated = adapter.save_patient(&edited).await.unwrap();

        assert_eq!(updated.id, saved.id);
        assert_eq!(updated.plan, "Discharge");
        assert_eq!(backend.items(ListKind::Patients).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_conflict_without_write() {
        let (backend, adapter) = adapter();
        adapter.save_patient(&PatientVisit::new("MRN1", "2024-01-01")).await.unwrap();
        let before = backend.items(ListKind::Patients);

        let mut duplicate = PatientVisit::new("MRN1", "2024-01-01");
        duplicate.id = Some("local-123".into());
        let err = adapter.save_patient(&duplicate).await.unwrap_err();

        assert!(err.is_conflict());
        assert!(err.to_string().contains("already rounded"));
        assert_eq!(backend.items(ListKind::Patients), before);
    }

    #[tokio::test]
    async fn test_fetch_patients_by_date_and_fingerprint() {
        let (_backend, adapter) = adapter();
        adapter.save_patient(&PatientVisit::new("MRN1", "2024-01-01")).await.unwrap();
        let second = adapter.save_patient(&PatientVisit::new("MRN2", "2024-01-02")).await.unwrap();

        let all = adapter.fetch_patients(None).await.unwrap();
        assert_eq!(all.patients.len(), 2);
        assert_eq!(all.last_updated_max, second.last_updated);

        let one_day = adapter.fetch_patients(Some("2024-01-01")).await.unwrap();
        assert_eq!(one_day.patients.len(), 1);
        assert_eq!(one_day.patients[0].mrn, "MRN1");
    }

    #[tokio::test]
    async fn test_shift_and_setting_upserts() {
        let (backend, adapter) = adapter();
        adapter.save_on_call_shift(&OnCallShift::new("2024-01-01", "Dr. A", "General")).await.unwrap();
        adapter.save_on_call_shift(&OnCallShift::new("2024-01-01", "Dr. B", "General")).await.unwrap();
        adapter.save_setting("onCall", "Dr. A").await.unwrap();
        adapter.save_setting("onCall", "Dr. B").await.unwrap();

        assert_eq!(backend.items(ListKind::OnCall).len(), 1);
        assert_eq!(backend.items(ListKind::Settings).len(), 1);
        let schedule = adapter.fetch_on_call_schedule().await.unwrap();
        assert_eq!(schedule[0].provider, "Dr. B");
        assert_eq!(adapter.fetch_settings().await.unwrap().on_call, "Dr. B");
    }

    #[tokio::test]
    async fn test_audit_rows_are_written() {
        let (backend, adapter) = adapter();
        let entry = AuditEntry::new(
            "Delete Patient",
            "admin-1",
            AuditActionType::Delete,
            "17",
            serde_json::json!({}),
        );
        adapter.record(entry).await.unwrap();

        let rows = backend.items(ListKind::Audit);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields.get(fields::ACTION_TYPE), Some(&serde_json::json!("DELETE")));
    }

    #[tokio::test]
    async fn test_empty_token_is_unauthorized() {
        let (_backend, adapter) = adapter();
        let credentials = Credentials::new(Principal::new("u1", ["clinician"]), "");
        let result = adapter.authenticate(&credentials).await;
        assert!(matches!(result, Err(RoundingError::Unauthorized(_))));
    }
}
