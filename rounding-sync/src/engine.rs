//! Sync engine
//!
//! Owns the in-memory patient list, on-call schedule and settings, and
//! arbitrates between two operating modes:
//!
//! - `Connected`: mutations go to the remote store, followed by a reload.
//!   `poll_tick` re-fetches patients and only applies them when the change
//!   fingerprint moved.
//! - `Local`: mutations apply to memory and are written through to the local
//!   cache. Nothing is queued; the next successful remote load replaces
//!   local-only edits.
//!
//! Any transient failure during a refresh moves the engine to `Local` and
//! reloads the cache. Other failures propagate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logger_redacted::hash_identifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::access::{self, EDITORS, ROLE_ADMIN};
use crate::audit::{AuditActionType, AuditEntry, AuditSink};
use crate::backfeed::{self, BackfeedVisit};
use crate::cache::{CacheCollection, LocalCache};
use crate::error::{RoundingError, RoundingResult};
use crate::import::{self, ImportReport, ImportTarget, RemoteImportTarget};
use crate::model::{
    Credentials, GlobalSettings, OnCallShift, PatientVisit, Principal, ProcedureStatus, LOCAL_ID_PREFIX,
};
use crate::store::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Connected,
    #[default]
    Local,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Connected => f.write_str("connected"),
            SyncMode::Local => f.write_str("local"),
        }
    }
}

/// State change notifications, each carrying a snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Billing codes masked for the signed-in principal
    PatientsChanged(Vec<PatientVisit>),
    ScheduleChanged(Vec<OnCallShift>),
    SettingsChanged(GlobalSettings),
    ModeChanged {
        mode: SyncMode,
        /// Capture time of the cached data now being shown, when in local mode
        cached_at: Option<DateTime<Utc>>,
    },
}

/// Observer registered with [`SyncEngine::add_listener`].
pub trait SyncListener: Send + Sync {
    fn on_event(&self, event: &SyncEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

fn local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4())
}

pub struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    cache: LocalCache,
    audit: Arc<dyn AuditSink>,
    mode: SyncMode,
    principal: Option<Principal>,
    patients: Vec<PatientVisit>,
    schedule: Vec<OnCallShift>,
    settings: GlobalSettings,
    /// `last_updated_max` of the last applied remote batch
    fingerprint: Option<DateTime<Utc>>,
    cached_at: Option<DateTime<Utc>>,
    listeners: Vec<(ListenerId, Arc<dyn SyncListener>)>,
    next_listener: u64,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn RemoteStore>, cache: LocalCache, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            store,
            cache,
            audit,
            mode: SyncMode::Local,
            principal: None,
            patients: Vec::new(),
            schedule: Vec::new(),
            settings: GlobalSettings::default(),
            fingerprint: None,
            cached_at: None,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    // ---- accessors ----

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.principal.is_some()
    }

    pub fn patients(&self) -> &[PatientVisit] {
        &self.patients
    }

    /// Patients as the signed-in user may see them, billing codes masked
    /// for users without billing access.
    pub fn visible_patients(&self) -> Vec<PatientVisit> {
        access::mask_billing(&self.patients, self.principal.as_ref())
    }

    pub fn on_call_schedule(&self) -> &[OnCallShift] {
        &self.schedule
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    /// When the data shown in local mode was captured.
    pub fn cached_at(&self) -> Option<DateTime<Utc>> {
        self.cached_at
    }

    // ---- listeners ----

    pub fn add_listener(&mut self, listener: Arc<dyn SyncListener>) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, listener));
        id
    }

    /// Returns false when `id` was not registered.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    fn emit(&self, event: &SyncEvent) {
        for (_, listener) in &self.listeners {
            listener.on_event(event);
        }
    }

    fn set_mode(&mut self, mode: SyncMode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        if mode == SyncMode::Connected {
            self.cached_at = None;
        }
        tracing::info!(%mode, "Sync mode changed");
        self.emit(&SyncEvent::ModeChanged {
            mode,
            cached_at: self.cached_at,
        });
    }

    fn replace_patients(&mut self, patients: Vec<PatientVisit>) {
        self.patients = patients;
        self.emit_patients();
    }

    /// Listeners see the same billing masks as [`Self::visible_patients`].
    fn emit_patients(&self) {
        self.emit(&SyncEvent::PatientsChanged(self.visible_patients()));
    }

    fn replace_schedule(&mut self, schedule: Vec<OnCallShift>) {
        self.schedule = schedule;
        self.emit(&SyncEvent::ScheduleChanged(self.schedule.clone()));
    }

    fn replace_settings(&mut self, settings: GlobalSettings) {
        self.settings = settings;
        self.emit(&SyncEvent::SettingsChanged(self.settings.clone()));
    }

    // ---- lifecycle ----

    /// Begin a session: authenticate and load everything.
    ///
    /// A transient failure during the initial load leaves the engine in
    /// `Local` mode showing cached data.
    ///
    /// # Errors
    ///
    /// `Unauthorized` for rejected credentials, or any non-transient load failure.
    pub async fn start(&mut self, credentials: Credentials) -> RoundingResult<()> {
        self.store.authenticate(&credentials).await?;
        tracing::info!(
            user = %hash_identifier(&credentials.principal.user_id),
            "Starting sync session"
        );
        self.principal = Some(credentials.principal);

        match self.load_all().await {
            Ok(()) => {
                self.set_mode(SyncMode::Connected);
                Ok(())
            }
            Err(e) if e.is_transient() => {
                self.fall_back_to_cache(&e).await;
                Ok(())
            }
            Err(e) => {
                self.principal = None;
                Err(e)
            }
        }
    }

    /// End the session and drop in-memory state.
    pub fn stop(&mut self) {
        if self.principal.take().is_none() {
            return;
        }
        self.fingerprint = None;
        self.patients.clear();
        self.schedule.clear();
        self.settings = GlobalSettings::default();
        self.set_mode(SyncMode::Local);
        tracing::info!("Sync session stopped");
    }

    fn require_session(&self) -> RoundingResult<&Principal> {
        access::require_principal(self.principal.as_ref())
    }

    fn require_roles(&self, roles: &[&str]) -> RoundingResult<()> {
        access::require_any(self.principal.as_ref(), roles)
    }

    // ---- loading ----

    async fn load_all(&mut self) -> RoundingResult<()> {
        let batch = self.store.fetch_patients(None).await?;
        let schedule = self.store.fetch_on_call_schedule().await?;
        let settings = self.store.fetch_settings().await?;

        self.fingerprint = Some(batch.last_updated_max);
        self.replace_patients(batch.patients);
        self.replace_schedule(schedule);
        self.replace_settings(settings);
        self.persist_all().await;
        tracing::debug!(patients = self.patients.len(), shifts = self.schedule.len(), "Loaded remote data");
        Ok(())
    }

    async fn poll_patients(&mut self) -> RoundingResult<bool> {
        let batch = self.store.fetch_patients(None).await?;
        if self.fingerprint == Some(batch.last_updated_max) {
            tracing::debug!("Patient fingerprint unchanged");
            return Ok(false);
        }
        self.fingerprint = Some(batch.last_updated_max);
        self.replace_patients(batch.patients);
        self.cache.put(CacheCollection::Patients, &self.patients).await;
        Ok(true)
    }

    /// Reload from the remote store. A forced refresh, or any refresh while
    /// in `Local` mode, reloads every collection; otherwise only patients are
    /// fetched and applied when their fingerprint changed.
    ///
    /// Returns whether new data was applied.
    ///
    /// # Errors
    ///
    /// Non-transient remote failures. Transient ones switch to `Local` instead.
    pub async fn refresh(&mut self, force: bool) -> RoundingResult<bool> {
        self.require_session()?;
        let full = force || self.mode == SyncMode::Local;

        let result = if full {
            self.load_all().await.map(|()| true)
        } else {
            self.poll_patients().await
        };

        match result {
            Ok(changed) => {
                self.set_mode(SyncMode::Connected);
                Ok(changed)
            }
            Err(e) if e.is_transient() => {
                self.fall_back_to_cache(&e).await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Timer tick. Does nothing outside a connected session.
    ///
    /// # Errors
    ///
    /// Non-transient remote failures.
    pub async fn poll_tick(&mut self) -> RoundingResult<()> {
        if !self.is_started() || self.mode != SyncMode::Connected {
            return Ok(());
        }
        self.refresh(false).await.map(|_| ())
    }

    /// Connectivity lost.
    pub fn handle_offline(&mut self) {
        if self.mode == SyncMode::Connected {
            tracing::warn!("Network connectivity lost");
            self.fingerprint = None;
            self.cached_at = Some(Utc::now());
            self.set_mode(SyncMode::Local);
        }
    }

    /// Connectivity regained: reload everything.
    ///
    /// # Errors
    ///
    /// Non-transient remote failures.
    pub async fn handle_online(&mut self) -> RoundingResult<()> {
        if !self.is_started() {
            return Ok(());
        }
        tracing::info!("Network connectivity regained, reloading");
        self.refresh(true).await.map(|_| ())
    }

    /// Foreground focus regained: reload everything when connected.
    ///
    /// # Errors
    ///
    /// Non-transient remote failures.
    pub async fn handle_focus(&mut self) -> RoundingResult<()> {
        if !self.is_started() || self.mode != SyncMode::Connected {
            return Ok(());
        }
        self.refresh(true).await.map(|_| ())
    }

    async fn fall_back_to_cache(&mut self, cause: &RoundingError) {
        logger_redacted::redacted_warn!("Remote store unreachable, switching to local mode: {}", cause);
        self.fingerprint = None;
        self.load_from_cache().await;
        self.set_mode(SyncMode::Local);
    }

    /// Replace in-memory state with whatever the local cache holds.
    ///
    /// Returns false when the cache had nothing usable.
    pub async fn load_from_cache(&mut self) -> bool {
        let mut found = false;

        if let Some((patients, captured_at)) = self
            .cache
            .get_timed::<Vec<PatientVisit>>(CacheCollection::Patients)
            .await
        {
            self.cached_at = Some(captured_at);
            self.replace_patients(patients);
            found = true;
        }
        if let Some(schedule) = self.cache.get::<Vec<OnCallShift>>(CacheCollection::OnCallSchedule).await {
            self.replace_schedule(schedule);
            found = true;
        }
        if let Some(settings) = self.cache.get::<GlobalSettings>(CacheCollection::Settings).await {
            self.replace_settings(settings);
            found = true;
        }

        tracing::info!(found, patients = self.patients.len(), "Loaded local cache");
        found
    }

    async fn persist_all(&self) {
        self.cache.put(CacheCollection::Patients, &self.patients).await;
        self.cache.put(CacheCollection::OnCallSchedule, &self.schedule).await;
        self.cache.put(CacheCollection::Settings, &self.settings).await;
    }

    /// Reload after a successful remote write; failures only log.
    async fn reload_after_write(&mut self) {
        if let Err(e) = self.refresh(true).await {
            logger_redacted::redacted_warn!("Reload after write failed: {}", e);
        }
    }

    async fn audit(&self, action: &str, action_type: AuditActionType, affected: String, details: serde_json::Value) {
        let user = self.principal.as_ref().map(|p| p.user_id.clone()).unwrap_or_default();
        let entry = AuditEntry::new(action, user, action_type, affected, details);
        if let Err(e) = self.audit.record(entry).await {
            tracing::warn!(action, error = %e, "Failed to write audit entry");
        }
    }

    // ---- patients ----

    /// Create or update a visit.
    ///
    /// # Errors
    ///
    /// `Conflict` when another visit already uses the same MRN and date,
    /// `Forbidden` without the clinician or admin role, `NotFound` when
    /// updating an unknown visit in local mode, or the remote failure.
    pub async fn save_patient(&mut self, visit: PatientVisit) -> RoundingResult<PatientVisit> {
        self.require_roles(EDITORS)?;
        let creating = !self.patients.iter().any(|p| p.id.is_some() && p.id == visit.id);

        let saved = match self.mode {
            SyncMode::Connected => {
                let saved = self.store.save_patient(&visit).await?;
                self.reload_after_write().await;
                saved
            }
            SyncMode::Local => self.save_patient_local(visit).await?,
        };

        let (action, action_type) = if creating {
            ("Create Patient", AuditActionType::Create)
        } else {
            ("Update Patient", AuditActionType::Update)
        };
        self.audit(
            action,
            action_type,
            saved.visit_key().to_string(),
            serde_json::json!({ "id": saved.id, "mode": self.mode }),
        )
        .await;
        Ok(saved)
    }

    async fn save_patient_local(&mut self, mut visit: PatientVisit) -> RoundingResult<PatientVisit> {
        let key = visit.visit_key();
        let position = visit
            .id
            .as_ref()
            .and_then(|id| self.patients.iter().position(|p| p.id.as_ref() == Some(id)));

        let clash = self
            .patients
            .iter()
            .enumerate()
            .any(|(i, p)| Some(i) != position && p.visit_key() == key);
        if clash {
            return Err(RoundingError::Conflict(format!("Patient already rounded on {}", visit.date)));
        }

        visit.last_updated = Utc::now();
        match position {
            Some(index) => {
                if let Some(slot) = self.patients.get_mut(index) {
                    *slot = visit.clone();
                }
            }
            None if visit.is_unsaved() => {
                visit.id = Some(local_id());
                self.patients.push(visit.clone());
            }
            None => {
                return Err(RoundingError::NotFound(format!(
                    "Patient {}",
                    visit.id.as_deref().unwrap_or_default()
                )));
            }
        }

        self.cache.put(CacheCollection::Patients, &self.patients).await;
        self.emit_patients();
        Ok(visit)
    }

    /// Permanently remove a visit. Administrators only.
    ///
    /// # Errors
    ///
    /// `Forbidden` without the admin role, `NotFound`, or the remote failure.
    pub async fn delete_patient(&mut self, id: &str) -> RoundingResult<()> {
        self.require_roles(&[ROLE_ADMIN])?;
        let key = self
            .patients
            .iter()
            .find(|p| p.id.as_deref() == Some(id))
            .map(|p| p.visit_key().to_string())
            .unwrap_or_else(|| id.to_string());

        match self.mode {
            SyncMode::Connected => {
                self.store.delete_patient(id).await?;
                self.reload_after_write().await;
            }
            SyncMode::Local => {
                let before = self.patients.len();
                self.patients.retain(|p| p.id.as_deref() != Some(id));
                if self.patients.len() == before {
                    return Err(RoundingError::NotFound(format!("Patient {}", id)));
                }
                self.cache.put(CacheCollection::Patients, &self.patients).await;
                self.emit_patients();
            }
        }

        self.audit("Delete Patient", AuditActionType::Delete, key, serde_json::json!({ "id": id }))
            .await;
        Ok(())
    }

    fn find_patient(&self, id: &str) -> RoundingResult<PatientVisit> {
        self.patients
            .iter()
            .find(|p| p.id.as_deref() == Some(id))
            .cloned()
            .ok_or_else(|| RoundingError::NotFound(format!("Patient {}", id)))
    }

    /// Archive or restore a visit.
    ///
    /// # Errors
    ///
    /// As [`SyncEngine::save_patient`], plus `NotFound` for an unknown id.
    pub async fn set_archived(&mut self, id: &str, archived: bool) -> RoundingResult<PatientVisit> {
        let mut visit = self.find_patient(id)?;
        visit.archived = archived;
        self.save_patient(visit).await
    }

    /// Quick procedure status change.
    ///
    /// # Errors
    ///
    /// As [`SyncEngine::save_patient`], plus `NotFound` for an unknown id.
    pub async fn update_status(&mut self, id: &str, status: ProcedureStatus) -> RoundingResult<PatientVisit> {
        let mut visit = self.find_patient(id)?;
        visit.procedure_status = status;
        self.save_patient(visit).await
    }

    /// Most recent prior visit for `mrn`, projected for pre-filling.
    ///
    /// # Errors
    ///
    /// `NotFound` when the patient has no visits, `Unauthorized` without a
    /// session, `InvalidOperation` for an empty MRN.
    pub async fn get_previous_visit(&self, mrn: &str) -> RoundingResult<BackfeedVisit> {
        self.require_session()?;
        let mrn = mrn.trim();
        if mrn.is_empty() {
            return Err(RoundingError::InvalidOperation("MRN is required".into()));
        }

        let found = match self.mode {
            SyncMode::Connected => {
                let visits = self.store.fetch_patients_by_mrn(mrn).await?;
                backfeed::previous_visit(&visits, mrn)
            }
            SyncMode::Local => backfeed::previous_visit(&self.patients, mrn),
        };

        self.audit(
            "Backfeed Lookup",
            AuditActionType::Read,
            mrn.to_string(),
            serde_json::json!({ "found": found.is_some() }),
        )
        .await;

        found
            .map(|visit| access::mask_backfeed(visit, self.principal.as_ref()))
            .ok_or_else(|| RoundingError::NotFound("No previous visits found".into()))
    }

    // ---- on-call schedule ----

    /// Upsert the shift for its date. Administrators only.
    ///
    /// # Errors
    ///
    /// `Forbidden` without the admin role, `InvalidOperation` for a shift
    /// without a date, or the remote failure.
    pub async fn save_on_call_shift(&mut self, shift: OnCallShift) -> RoundingResult<OnCallShift> {
        self.require_roles(&[ROLE_ADMIN])?;
        if shift.date.trim().is_empty() {
            return Err(RoundingError::InvalidOperation("On-call shift needs a date".into()));
        }

        let saved = match self.mode {
            SyncMode::Connected => {
                let saved = self.store.save_on_call_shift(&shift).await?;
                self.reload_after_write().await;
                saved
            }
            SyncMode::Local => self.save_shift_local(shift).await,
        };

        self.audit(
            "Save On-Call Shift",
            AuditActionType::Update,
            saved.date.clone(),
            serde_json::json!({ "provider": saved.provider }),
        )
        .await;
        Ok(saved)
    }

    async fn save_shift_local(&mut self, mut shift: OnCallShift) -> OnCallShift {
        match self.schedule.iter_mut().find(|s| s.date == shift.date) {
            Some(existing) => {
                shift.id = existing.id.clone();
                *existing = shift.clone();
            }
            None => {
                shift.id = Some(local_id());
                self.schedule.push(shift.clone());
                self.schedule.sort_by(|a, b| a.date.cmp(&b.date));
            }
        }
        self.cache.put(CacheCollection::OnCallSchedule, &self.schedule).await;
        self.emit(&SyncEvent::ScheduleChanged(self.schedule.clone()));
        shift
    }

    /// # Errors
    ///
    /// `Forbidden` without the admin role, `NotFound`, or the remote failure.
    pub async fn delete_on_call_shift(&mut self, id: &str) -> RoundingResult<()> {
        self.require_roles(&[ROLE_ADMIN])?;

        match self.mode {
            SyncMode::Connected => {
                self.store.delete_on_call_shift(id).await?;
                self.reload_after_write().await;
            }
            SyncMode::Local => {
                let before = self.schedule.len();
                self.schedule.retain(|s| s.id.as_deref() != Some(id));
                if self.schedule.len() == before {
                    return Err(RoundingError::NotFound(format!("On-call shift {}", id)));
                }
                self.cache.put(CacheCollection::OnCallSchedule, &self.schedule).await;
                self.emit(&SyncEvent::ScheduleChanged(self.schedule.clone()));
            }
        }

        self.audit("Delete On-Call Shift", AuditActionType::Delete, id.to_string(), serde_json::json!({}))
            .await;
        Ok(())
    }

    // ---- settings ----

    /// # Errors
    ///
    /// `Forbidden` without the admin role, `InvalidOperation` for an empty
    /// key, or the remote failure.
    pub async fn save_setting(&mut self, key: &str, value: &str) -> RoundingResult<()> {
        self.require_roles(&[ROLE_ADMIN])?;
        if key.trim().is_empty() {
            return Err(RoundingError::InvalidOperation("Setting key is required".into()));
        }

        match self.mode {
            SyncMode::Connected => {
                self.store.save_setting(key, value).await?;
                self.reload_after_write().await;
            }
            SyncMode::Local => {
                let mut settings = self.settings.clone();
                settings.set(key, value);
                self.replace_settings(settings);
                self.cache.put(CacheCollection::Settings, &self.settings).await;
            }
        }

        self.audit(
            "Update Settings",
            AuditActionType::Update,
            key.to_string(),
            serde_json::json!({ "value": value }),
        )
        .await;
        Ok(())
    }

    // ---- import ----

    /// Parse a rounding spreadsheet and write its records.
    ///
    /// The text is fully parsed before anything is written. On-call rows are
    /// written only for administrators. Duplicate visits are reported, not
    /// fatal.
    ///
    /// # Errors
    ///
    /// `MalformedImport` before any write, `Forbidden` without the clinician
    /// or admin role, or the first non-conflict write failure.
    pub async fn import_csv(&mut self, text: &str) -> RoundingResult<ImportReport> {
        self.require_roles(EDITORS)?;
        let batch = import::parse_rounding_csv(text)?;
        let save_shifts = self.principal.as_ref().is_some_and(|p| p.has_role(ROLE_ADMIN));

        let report = match self.mode {
            SyncMode::Connected => {
                let store = Arc::clone(&self.store);
                let mut target = RemoteImportTarget::new(store.as_ref());
                let report = import::apply_import(&mut target, &batch, save_shifts).await?;
                self.reload_after_write().await;
                report
            }
            SyncMode::Local => {
                let mut target = LocalImportTarget { engine: self };
                import::apply_import(&mut target, &batch, save_shifts).await?
            }
        };

        self.audit(
            "Import CSV",
            AuditActionType::Create,
            format!("{} patients", report.patients_created),
            serde_json::to_value(&report).unwrap_or_default(),
        )
        .await;
        Ok(report)
    }
}

/// Import writes applied through the local-mode paths.
struct LocalImportTarget<'a> {
    engine: &'a mut SyncEngine,
}

#[async_trait]
impl ImportTarget for LocalImportTarget<'_> {
    async fn upsert_shift(&mut self, shift: &OnCallShift) -> RoundingResult<()> {
        self.engine.save_shift_local(shift.clone()).await;
        Ok(())
    }

    async fn create_patient(&mut self, visit: &PatientVisit) -> RoundingResult<()> {
        self.engine.save_patient_local(visit.clone()).await?;
        Ok(())
    }
}
