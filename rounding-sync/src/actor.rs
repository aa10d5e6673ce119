//! Background task that owns a [`SyncEngine`]
//!
//! The engine is driven from a single task: commands arrive over an mpsc
//! channel and the connected-mode poll runs off a `tokio::time::interval`.
//! Callers hold a cloneable [`SyncHandle`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backfeed::BackfeedVisit;
use crate::engine::{ListenerId, SyncEngine, SyncListener, SyncMode};
use crate::error::{RoundingError, RoundingResult};
use crate::import::ImportReport;
use crate::model::{Credentials, GlobalSettings, OnCallShift, PatientVisit, ProcedureStatus};

const COMMAND_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<RoundingResult<T>>;

enum Command {
    Start(Credentials, Reply<()>),
    Stop(Reply<()>),
    Refresh(bool, Reply<bool>),
    Offline(Reply<()>),
    Online(Reply<()>),
    Focus(Reply<()>),
    SavePatient(Box<PatientVisit>, Reply<PatientVisit>),
    DeletePatient(String, Reply<()>),
    SetArchived(String, bool, Reply<PatientVisit>),
    UpdateStatus(String, ProcedureStatus, Reply<PatientVisit>),
    PreviousVisit(String, Reply<BackfeedVisit>),
    SaveShift(OnCallShift, Reply<OnCallShift>),
    DeleteShift(String, Reply<()>),
    SaveSetting(String, String, Reply<()>),
    ImportCsv(String, Reply<ImportReport>),
    Snapshot(Reply<SyncSnapshot>),
    AddListener(Arc<dyn SyncListener>, Reply<ListenerId>),
    RemoveListener(ListenerId, Reply<bool>),
    Shutdown(oneshot::Sender<()>),
}

/// Point-in-time copy of engine state, billing codes already masked.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub mode: SyncMode,
    pub patients: Vec<PatientVisit>,
    pub on_call_schedule: Vec<OnCallShift>,
    pub settings: GlobalSettings,
    pub cached_at: Option<DateTime<Utc>>,
}

impl SyncSnapshot {
    fn of(engine: &SyncEngine) -> Self {
        Self {
            mode: engine.mode(),
            patients: engine.visible_patients(),
            on_call_schedule: engine.on_call_schedule().to_vec(),
            settings: engine.settings().clone(),
            cached_at: engine.cached_at(),
        }
    }
}

/// Cloneable front end to a running sync task.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
}

/// Spawn the engine task. `poll_interval` drives connected-mode polling.
pub fn spawn(engine: SyncEngine, poll_interval: Duration) -> (SyncHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let task = tokio::spawn(run(engine, rx, poll_interval));
    (SyncHandle { commands: tx }, task)
}

fn closed() -> RoundingError {
    RoundingError::InvalidOperation("Sync engine has shut down".into())
}

async fn run(mut engine: SyncEngine, mut commands: mpsc::Receiver<Command>, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    tracing::debug!(poll_secs = poll_interval.as_secs(), "Sync task running");

    let mut done = None;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Shutdown(reply)) => {
                    done = Some(reply);
                    break;
                }
                Some(command) => dispatch(&mut engine, command).await,
                None => break,
            },
            _ = ticker.tick() => {
                if let Err(e) = engine.poll_tick().await {
                    tracing::warn!(error = %logger_redacted::redact(&e.to_string()), "Poll failed");
                }
            }
        }
    }

    engine.stop();
    tracing::debug!("Sync task stopped");
    if let Some(reply) = done {
        let _ = reply.send(());
    }
}

async fn dispatch(engine: &mut SyncEngine, command: Command) {
    // A dropped reply receiver means the caller stopped waiting.
    match command {
        Command::Start(credentials, reply) => {
            let _ = reply.send(engine.start(credentials).await);
        }
        Command::Stop(reply) => {
            engine.stop();
            let _ = reply.send(Ok(()));
        }
        Command::Refresh(force, reply) => {
            let _ = reply.send(engine.refresh(force).await);
        }
        Command::Offline(reply) => {
            engine.handle_offline();
            let _ = reply.send(Ok(()));
        }
        Command::Online(reply) => {
            let _ = reply.send(engine.handle_online().await);
        }
        Command::Focus(reply) => {
            let _ = reply.send(engine.handle_focus().await);
        }
        Command::SavePatient(visit, reply) => {
            let _ = reply.send(engine.save_patient(*visit).await);
        }
        Command::DeletePatient(id, reply) => {
            let _ = reply.send(engine.delete_patient(&id).await);
        }
        Command::SetArchived(id, archived, reply) => {
            let _ = reply.send(engine.set_archived(&id, archived).await);
        }
        Command::UpdateStatus(id, status, reply) => {
            let _ = reply.send(engine.update_status(&id, status).await);
        }
        Command::PreviousVisit(mrn, reply) => {
            let _ = reply.send(engine.get_previous_visit(&mrn).await);
        }
        Command::SaveShift(shift, reply) => {
            let _ = reply.send(engine.save_on_call_shift(shift).await);
        }
        Command::DeleteShift(id, reply) => {
            let _ = reply.send(engine.delete_on_call_shift(&id).await);
        }
        Command::SaveSetting(key, value, reply) => {
            let _ = reply.send(engine.save_setting(&key, &value).await);
        }
        Command::ImportCsv(text, reply) => {
            let _ = reply.send(engine.import_csv(&text).await);
        }
        Command::Snapshot(reply) => {
            let _ = reply.send(Ok(SyncSnapshot::of(engine)));
        }
        Command::AddListener(listener, reply) => {
            let _ = reply.send(Ok(engine.add_listener(listener)));
        }
        Command::RemoveListener(id, reply) => {
            let _ = reply.send(Ok(engine.remove_listener(id)));
        }
        Command::Shutdown(reply) => {
            let _ = reply.send(());
        }
    }
}

impl SyncHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> RoundingResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }

    pub async fn start(&self, credentials: Credentials) -> RoundingResult<()> {
        self.call(|reply| Command::Start(credentials, reply)).await
    }

    pub async fn stop(&self) -> RoundingResult<()> {
        self.call(Command::Stop).await
    }

    pub async fn refresh(&self, force: bool) -> RoundingResult<bool> {
        self.call(|reply| Command::Refresh(force, reply)).await
    }

    pub async fn notify_offline(&self) -> RoundingResult<()> {
        self.call(Command::Offline).await
    }

    pub async fn notify_online(&self) -> RoundingResult<()> {
        self.call(Command::Online).await
    }

    pub async fn notify_focus(&self) -> RoundingResult<()> {
        self.call(Command::Focus).await
    }

    pub async fn save_patient(&self, visit: PatientVisit) -> RoundingResult<PatientVisit> {
        self.call(|reply| Command::SavePatient(Box::new(visit), reply)).await
    }

    pub async fn delete_patient(&self, id: impl Into<String>) -> RoundingResult<()> {
        let id = id.into();
        self.call(|reply| Command::DeletePatient(id, reply)).await
    }

    pub async fn set_archived(&self, id: impl Into<String>, archived: bool) -> RoundingResult<PatientVisit> {
        let id = id.into();
        self.call(|reply| Command::SetArchived(id, archived, reply)).await
    }

    pub async fn update_status(&self, id: impl Into<String>, status: ProcedureStatus) -> RoundingResult<PatientVisit> {
        let id = id.into();
        self.call(|reply| Command::UpdateStatus(id, status, reply)).await
    }

    pub async fn get_previous_visit(&self, mrn: impl Into<String>) -> RoundingResult<BackfeedVisit> {
        let mrn = mrn.into();
        self.call(|reply| Command::PreviousVisit(mrn, reply)).await
    }

    pub async fn save_on_call_shift(&self, shift: OnCallShift) -> RoundingResult<OnCallShift> {
        self.call(|reply| Command::SaveShift(shift, reply)).await
    }

    pub async fn delete_on_call_shift(&self, id: impl Into<String>) -> RoundingResult<()> {
        let id = id.into();
        self.call(|reply| Command::DeleteShift(id, reply)).await
    }

    pub async fn save_setting(&self, key: impl Into<String>, value: impl Into<String>) -> RoundingResult<()> {
        let (key, value) = (key.into(), value.into());
        self.call(|reply| Command::SaveSetting(key, value, reply)).await
    }

    pub async fn import_csv(&self, text: impl Into<String>) -> RoundingResult<ImportReport> {
        let text = text.into();
        self.call(|reply| Command::ImportCsv(text, reply)).await
    }

    pub async fn snapshot(&self) -> RoundingResult<SyncSnapshot> {
        self.call(Command::Snapshot).await
    }

    pub async fn add_listener(&self, listener: Arc<dyn SyncListener>) -> RoundingResult<ListenerId> {
        self.call(|reply| Command::AddListener(listener, reply)).await
    }

    pub async fn remove_listener(&self, id: ListenerId) -> RoundingResult<bool> {
        self.call(|reply| Command::RemoveListener(id, reply)).await
    }

    /// Stop the task and wait for it to finish. Idempotent.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}
