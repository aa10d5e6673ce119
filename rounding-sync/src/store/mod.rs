//! Remote store: the domain-level contract and the list backends behind it
//!
//! [`RemoteStore`] is what the sync engine talks to. [`ListStoreAdapter`]
//! implements it on top of any [`ListBackend`], translating domain operations
//! into list queries and mutations and applying the [`RetryPolicy`].

pub mod adapter;
pub mod graph;
pub mod memory;
pub mod retry;

pub use adapter::ListStoreAdapter;
pub use graph::GraphListBackend;
pub use memory::MemoryListBackend;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::RoundingResult;
use crate::model::{Credentials, GlobalSettings, OnCallShift, PatientVisit};
use crate::schema::{FieldMap, ListItem};

/// The lists the rounding app keeps in the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    Patients,
    OnCall,
    Settings,
    Audit,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Patients => "patients",
            ListKind::OnCall => "on_call",
            ListKind::Settings => "settings",
            ListKind::Audit => "audit",
        }
    }
}

/// Filter/sort parameters understood by every backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Field equality filters, combined with AND
    pub equals: Vec<(String, String)>,
    /// Field to sort on, descending
    pub order_by_desc: Option<String>,
    pub top: Option<usize>,
}

impl ListQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter_eq(mut self, field: &str, value: &str) -> Self {
        self.equals.push((field.to_string(), value.to_string()));
        self
    }

    pub fn order_by_desc(mut self, field: &str) -> Self {
        self.order_by_desc = Some(field.to_string());
        self
    }

    pub fn top(mut self, n: usize) -> Self {
        self.top = Some(n);
        self
    }
}

/// Low-level list/document store.
#[async_trait]
pub trait ListBackend: Send + Sync {
    async fn query(&self, list: ListKind, query: &ListQuery) -> RoundingResult<Vec<ListItem>>;

    async fn create(&self, list: ListKind, fields: FieldMap) -> RoundingResult<ListItem>;

    /// Overwrite the given fields of an existing item.
    async fn update(&self, list: ListKind, id: &str, fields: FieldMap) -> RoundingResult<ListItem>;

    async fn delete(&self, list: ListKind, id: &str) -> RoundingResult<()>;

    /// Bearer token for subsequent calls. Backends without auth ignore it.
    fn set_access_token(&self, _token: SecretString) {}
}

#[async_trait]
impl<B: ListBackend + ?Sized> ListBackend for Arc<B> {
    async fn query(&self, list: ListKind, query: &ListQuery) -> RoundingResult<Vec<ListItem>> {
        (**self).query(list, query).await
    }

    async fn create(&self, list: ListKind, fields: FieldMap) -> RoundingResult<ListItem> {
        (**self).create(list, fields).await
    }

    async fn update(&self, list: ListKind, id: &str, fields: FieldMap) -> RoundingResult<ListItem> {
        (**self).update(list, id, fields).await
    }

    async fn delete(&self, list: ListKind, id: &str) -> RoundingResult<()> {
        (**self).delete(list, id).await
    }

    fn set_access_token(&self, token: SecretString) {
        (**self).set_access_token(token);
    }
}

/// Result of a patient collection fetch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientBatch {
    pub patients: Vec<PatientVisit>,
    /// Change fingerprint: the newest `last_updated` in the batch, epoch when empty.
    pub last_updated_max: DateTime<Utc>,
}

impl PatientBatch {
    pub fn new(patients: Vec<PatientVisit>) -> Self {
        let last_updated_max = patients
            .iter()
            .map(|p| p.last_updated)
            .max()
            .unwrap_or_default();
        Self { patients, last_updated_max }
    }
}

/// Domain operations against the remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Hand the bearer token of a fresh session to the transport.
    async fn authenticate(&self, credentials: &Credentials) -> RoundingResult<()>;

    async fn fetch_patients(&self, date: Option<&str>) -> RoundingResult<PatientBatch>;

    /// All visits for one MRN, newest date first.
    async fn fetch_patients_by_mrn(&self, mrn: &str) -> RoundingResult<Vec<PatientVisit>>;

    /// Create when the visit is unsaved, update by id otherwise.
    ///
    /// # Errors
    ///
    /// `Conflict` when creating a visit whose `MRN|date` key already exists.
    async fn save_patient(&self, visit: &PatientVisit) -> RoundingResult<PatientVisit>;

    async fn delete_patient(&self, id: &str) -> RoundingResult<()>;

    async fn fetch_on_call_schedule(&self) -> RoundingResult<Vec<OnCallShift>>;

    /// Upsert keyed by the shift date.
    async fn save_on_call_shift(&self, shift: &OnCallShift) -> RoundingResult<OnCallShift>;

    async fn delete_on_call_shift(&self, id: &str) -> RoundingResult<()>;

    async fn fetch_settings(&self) -> RoundingResult<GlobalSettings>;

    /// Upsert keyed by the setting name.
    async fn save_setting(&self, key: &str, value: &str) -> RoundingResult<()>;
}
