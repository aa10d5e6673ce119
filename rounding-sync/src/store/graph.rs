//! Microsoft Graph list backend
//!
//! Talks to SharePoint lists through `/sites/{site}/lists/{list}/items`.
//! Query translation:
//! - `equals`        -> `$filter=fields/{name} eq '{value}'` (joined with `and`)
//! - `order_by_desc` -> `$orderby=fields/{name} desc`
//! - `top`           -> `$top={n}`
//!
//! Paged results are followed through `@odata.nextLink`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::header::RETRY_AFTER;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use async_trait::async_trait;

use super::{ListBackend, ListKind, ListQuery};
use crate::config::{GraphConfig, ListIds};
use crate::error::{RoundingError, RoundingResult};
use crate::schema::{FieldMap, ListItem};

// Graph refuses filters on non-indexed columns without this
const PREFER_NON_INDEXED: &str = "HonorNonIndexedQueriesWarningMayFailRandomly";

#[derive(Debug, Deserialize)]
struct GraphItem {
    id: String,
    #[serde(rename = "lastModifiedDateTime", default)]
    last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    fields: FieldMap,
}

impl From<GraphItem> for ListItem {
    fn from(item: GraphItem) -> Self {
        ListItem {
            id: item.id,
            fields: item.fields,
            last_modified: item.last_modified,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphPage {
    #[serde(default)]
    value: Vec<GraphItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// Map a non-success Graph response onto the error taxonomy.
pub(crate) async fn check_status(response: reqwest::Response) -> RoundingResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);

    // Graph echoes filter values in error bodies
    let body = response.text().await.unwrap_or_default();
    let message = logger_redacted::redact(&body);

    Err(match status.as_u16() {
        401 => RoundingError::Unauthorized(message),
        403 => RoundingError::Forbidden(message),
        404 => RoundingError::NotFound(message),
        409 => RoundingError::Conflict(message),
        429 => RoundingError::RateLimited { retry_after },
        code => RoundingError::Remote { status: code, message },
    })
}

/// Build the reqwest client shared by the Graph list and drive clients.
pub(crate) fn build_client(timeout: Duration) -> RoundingResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RoundingError::Internal(format!("Failed to create HTTP client: {}", e)))
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn filter_expression(query: &ListQuery) -> Option<String> {
    if query.equals.is_empty() {
        return None;
    }
    Some(
        query
            .equals
            .iter()
            .map(|(field, value)| format!("fields/{} eq {}", field, quote(value)))
            .collect::<Vec<_>>()
            .join(" and "),
    )
}

/// SharePoint list store reached through Microsoft Graph
pub struct GraphListBackend {
    client: reqwest::Client,
    base_url: String,
    site_id: String,
    lists: ListIds,
    token: RwLock<Option<SecretString>>,
}

impl GraphListBackend {
    /// # Errors
    ///
    /// `Internal` if the HTTP client cannot be built.
    pub fn new(config: &GraphConfig) -> RoundingResult<Self> {
        Ok(Self {
            client: build_client(config.request_timeout())?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            site_id: config.site_id.clone(),
            lists: config.lists.clone(),
            token: RwLock::new(None),
        })
    }

    fn items_url(&self, list: ListKind) -> RoundingResult<String> {
        let list_id = self.lists.get(list);
        if list_id.is_empty() {
            return Err(RoundingError::Config(format!("No list id configured for {}", list.as_str())));
        }
        Ok(format!("{}/sites/{}/lists/{}/items", self.base_url, self.site_id, list_id))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> RoundingResult<reqwest::RequestBuilder> {
        let token = self.token.read();
        match token.as_ref() {
            Some(token) => Ok(request.bearer_auth(token.expose_secret())),
            None => Err(RoundingError::Unauthorized("No access token".into())),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> RoundingResult<reqwest::Response> {
        let response = self.authorize(request)?.send().await?;
        check_status(response).await
    }
}

#[async_trait]
impl ListBackend for GraphListBackend {
    async fn query(&self, list: ListKind, query: &ListQuery) -> RoundingResult<Vec<ListItem>> {
        let mut params: Vec<(&str, String)> = vec![("expand", "fields".to_string())];
        if let Some(filter) = filter_expression(query) {
            params.push(("$filter", filter));
        }
        if let Some(field) = &query.order_by_desc {
            params.push(("$orderby", format!("fields/{} desc", field)));
        }
        if let Some(top) = query.top {
            params.push(("$top", top.to_string()));
        }

        let first = self
            .client
            .get(self.items_url(list)?)
            .header("Prefer", PREFER_NON_INDEXED)
            .query(&params);

        let mut items = Vec::new();
        let mut page: GraphPage = self.send(first).await?.json().await?;
        loop {
            items.extend(page.value.into_iter().map(ListItem::from));

            if query.top.is_some_and(|top| items.len() >= top) {
                break;
            }
            let Some(next) = page.next_link else { break };

            tracing::debug!(list = list.as_str(), fetched = items.len(), "Following next page");
            let request = self.client.get(next).header("Prefer", PREFER_NON_INDEXED);
            page = self.send(request).await?.json().await?;
        }

        if let Some(top) = query.top {
            items.truncate(top);
        }
        Ok(items)
    }

    async fn create(&self, list: ListKind, fields: FieldMap) -> RoundingResult<ListItem> {
        let request = self
            .client
            .post(self.items_url(list)?)
            .json(&json!({ "fields": fields }));
        let item: GraphItem = self.send(request).await?.json().await?;
        Ok(item.into())
    }

    async fn update(&self, list: ListKind, id: &str, fields: FieldMap) -> RoundingResult<ListItem> {
        let url = format!("{}/{}/fields", self.items_url(list)?, id);
        let request = self.client.patch(url).json(&fields);
        // PATCH on /fields answers with the field set only
        let fields: FieldMap = self.send(request).await?.json().await?;
        Ok(ListItem {
            id: id.to_string(),
            fields,
            last_modified: None,
        })
    }

    async fn delete(&self, list: ListKind, id: &str) -> RoundingResult<()> {
        let url = format!("{}/{}", self.items_url(list)?, id);
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    fn set_access_token(&self, token: SecretString) {
        *self.token.write() = Some(token);
    }
}
