//! Workbook export to OneDrive

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::access;
use crate::audit::{AuditActionType, AuditEntry, AuditSink};
use crate::config::{ExportConfig, GraphConfig};
use crate::error::{RoundingError, RoundingResult};
use crate::model::Principal;
use crate::store::graph::{build_client, check_status};

/// Destination for exported files.
#[async_trait]
pub trait ExportTarget: Send + Sync {
    /// Store `bytes` at `path`, returning a location the user can open.
    async fn upload(&self, bytes: Vec<u8>, path: &str) -> RoundingResult<String>;
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    #[serde(rename = "webUrl", default)]
    web_url: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

/// The signed-in user's OneDrive, through Microsoft Graph
pub struct GraphDriveTarget {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<SecretString>>,
}

impl GraphDriveTarget {
    /// # Errors
    ///
    /// `Internal` if the HTTP client cannot be built.
    pub fn new(config: &GraphConfig) -> RoundingResult<Self> {
        Ok(Self {
            client: build_client(config.request_timeout())?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        })
    }

    pub fn set_access_token(&self, token: SecretString) {
        *self.token.write() = Some(token);
    }

    fn content_url(&self, path: &str) -> String {
        format!("{}/me/drive/root:{}:/content", self.base_url, path)
    }
}

#[async_trait]
impl ExportTarget for GraphDriveTarget {
    async fn upload(&self, bytes: Vec<u8>, path: &str) -> RoundingResult<String> {
        let request = {
            let token = self.token.read();
            let token = token
                .as_ref()
                .ok_or_else(|| RoundingError::Unauthorized("No access token".into()))?;
            self.client
                .put(self.content_url(path))
                .bearer_auth(token.expose_secret())
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes)
        };

        let response = check_status(request.send().await?).await?;
        let item: DriveItem = response.json().await?;
        Ok(item.web_url.or(item.id).unwrap_or_else(|| path.to_string()))
    }
}

/// Where an export landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    pub file_location: String,
    pub latest_location: String,
}

/// Uploads a workbook twice: once under its own name and once over the
/// "latest" copy, then writes one `EXPORT` audit entry.
pub struct Exporter {
    target: Arc<dyn ExportTarget>,
    audit: Arc<dyn AuditSink>,
    config: ExportConfig,
}

impl Exporter {
    pub fn new(target: Arc<dyn ExportTarget>, audit: Arc<dyn AuditSink>, config: ExportConfig) -> Self {
        Self { target, audit, config }
    }

    /// `Rounding List 2024-01-01 0930.xlsx`
    pub fn default_file_name(now: DateTime<Utc>) -> String {
        format!("Rounding List {}.xlsx", now.format("%Y-%m-%d %H%M"))
    }

    fn path_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.config.folder.trim_end_matches('/'), file_name)
    }

    /// # Errors
    ///
    /// `Unauthorized` when nobody is signed in, `InvalidOperation` for an
    /// empty payload or a bad file name, or the upload failure.
    pub async fn export(
        &self,
        principal: Option<&Principal>,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> RoundingResult<ExportOutcome> {
        let principal = access::require_principal(principal)?;
        if bytes.is_empty() {
            return Err(RoundingError::InvalidOperation("Nothing to export".into()));
        }
        let file_name = file_name.trim();
        if file_name.is_empty() || file_name.contains('/') {
            return Err(RoundingError::InvalidOperation(format!("Invalid export file name: {:?}", file_name)));
        }

        let size = bytes.len();
        let file_location = self.target.upload(bytes.clone(), &self.path_for(file_name)).await?;
        let latest_location = self
            .target
            .upload(bytes, &self.path_for(&self.config.latest_name))
            .await?;
        tracing::info!(file = %file_name, size, "Export uploaded");

        let entry = AuditEntry::new(
            "Export Rounding List",
            principal.user_id.clone(),
            AuditActionType::Export,
            file_name,
            serde_json::json!({ "size": size, "latest": self.config.latest_name }),
        );
        if let Err(e) = self.audit.record(entry).await {
            tracing::warn!(error = %e, "Failed to write export audit entry");
        }

        Ok(ExportOutcome { file_location, latest_location })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        uploads: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl ExportTarget for RecordingTarget {
        async fn upload(&self, bytes: Vec<u8>, path: &str) -> RoundingResult<String> {
            self.uploads.lock().push((path.to_string(), bytes.len()));
            Ok(format!("https://files.example{}", path))
        }
    }

    #[derive(Default)]
    struct RecordingAudit {
        entries: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait]
    impl AuditSink for RecordingAudit {
        async fn record(&self, entry: AuditEntry) -> RoundingResult<()> {
            self.entries.lock().push(entry);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_export_uploads_file_and_latest_copy() {
        let target = Arc::new(RecordingTarget::default());
        let audit = Arc::new(RecordingAudit::default());
        let exporter = Exporter::new(target.clone(), audit.clone(), ExportConfig::default());
        let principal = Principal::new("u1", [crate::access::ROLE_CLINICIAN]);

        let outcome = exporter
            .export(Some(&principal), vec![1, 2, 3], "Rounding List 2024-01-01 0930.xlsx")
            .await
            .unwrap();

        let uploads = target.uploads.lock().clone();
        assert_eq!(
            uploads,
            vec![
                ("/Clinical Rounding/Rounding List 2024-01-01 0930.xlsx".to_string(), 3),
                ("/Clinical Rounding/Rounding List - Latest.xlsx".to_string(), 3),
            ]
        );
        assert!(outcome.latest_location.ends_with("Latest.xlsx"));

        let entries = audit.entries.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action_type, AuditActionType::Export);
    }

    #[tokio::test]
    async fn test_export_requires_principal() {
        let exporter = Exporter::new(
            Arc::new(RecordingTarget::default()),
            Arc::new(RecordingAudit::default()),
            ExportConfig::default(),
        );
        let result = exporter.export(None, vec![1], "a.xlsx").await;
        assert!(matches!(result, Err(RoundingError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_drive_target_without_token() {
        let target = GraphDriveTarget::new(&GraphConfig::default()).unwrap();
        let result = target.upload(vec![1], "/Clinical Rounding/a.xlsx").await;
        assert!(matches!(result, Err(RoundingError::Unauthorized(_))));
    }

    #[test]
    fn test_default_file_name() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 9, 30, 0).unwrap();
        assert_eq!(Exporter::default_file_name(now), "Rounding List 2024-01-01 0930.xlsx");
    }
}
