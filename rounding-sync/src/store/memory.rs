//! In-process list backend
//!
//! Same query semantics as the Graph backend, plus fault injection for tests:
//! a simulated offline switch, queued rate-limit responses and call counting.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use tokio::time::Instant;

use super::{ListBackend, ListKind, ListQuery};
use crate::error::{RoundingError, RoundingResult};
use crate::schema::{fields, FieldMap, ListItem};

#[derive(Debug, Default)]
struct MemoryState {
    lists: HashMap<ListKind, Vec<ListItem>>,
    next_id: u64,
    last_stamp: Option<DateTime<Utc>>,
    offline: bool,
    queued_rate_limits: u32,
    calls: Vec<Instant>,
}

impl MemoryState {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    /// Strictly increasing modification stamp.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn insert(&mut self, list: ListKind, mut fields_map: FieldMap) -> ListItem {
        let stamp = self.stamp();
        fields_map.insert(fields::MODIFIED.into(), Value::String(stamp.to_rfc3339()));
        let item = ListItem {
            id: self.next_id(),
            fields: fields_map,
            last_modified: Some(stamp),
        };
        self.lists.entry(list).or_default().push(item.clone());
        item
    }
}

fn field_text(item: &ListItem, name: &str) -> String {
    match item.fields.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// List store kept in memory, shared through `Arc` between the adapter and tests
#[derive(Debug, Default)]
pub struct MemoryListBackend {
    state: Mutex<MemoryState>,
}

impl MemoryListBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `Network`.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Answer the next `count` calls with `RateLimited`.
    pub fn fail_with_rate_limit(&self, count: u32) {
        self.state.lock().queued_rate_limits = count;
    }

    /// Calls received so far, including failed ones.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Arrival time of every call, on the tokio clock.
    pub fn call_instants(&self) -> Vec<Instant> {
        self.state.lock().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Current rows of one list.
    pub fn items(&self, list: ListKind) -> Vec<ListItem> {
        self.state.lock().lists.get(&list).cloned().unwrap_or_default()
    }

    /// Insert a row directly, bypassing fault injection and call counting.
    pub fn seed(&self, list: ListKind, fields_map: FieldMap) -> ListItem {
        self.state.lock().insert(list, fields_map)
    }

    fn enter(&self) -> RoundingResult<()> {
        let mut state = self.state.lock();
        state.calls.push(Instant::now());
        if state.offline {
            return Err(RoundingError::Network("Simulated offline".into()));
        }
        if state.queued_rate_limits > 0 {
            state.queued_rate_limits -= 1;
            return Err(RoundingError::RateLimited { retry_after: None });
        }
        Ok(())
    }
}

#[async_trait]
impl ListBackend for MemoryListBackend {
    async fn query(&self, list: ListKind, query: &ListQuery) -> RoundingResult<Vec<ListItem>> {
        self.enter()?;
        let state = self.state.lock();
        let mut items: Vec<ListItem> = state
            .lists
            .get(&list)
            .map(|rows| {
                rows.iter()
                    .filter(|item| {
                        query
                            .equals
                            .iter()
                            .all(|(name, value)| field_text(item, name) == *value)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order_by_desc {
            items.sort_by(|a, b| match field_text(b, order).cmp(&field_text(a, order)) {
                Ordering::Equal => b.id.cmp(&a.id),
                other => other,
            });
        }
        if let Some(top) = query.top {
            items.truncate(top);
        }
        Ok(items)
    }

    async fn create(&self, list: ListKind, fields_map: FieldMap) -> RoundingResult<ListItem> {
        self.enter()?;
        Ok(self.state.lock().insert(list, fields_map))
    }

    async fn update(&self, list: ListKind, id: &str, fields_map: FieldMap) -> RoundingResult<ListItem> {
        self.enter()?;
        let mut state = self.state.lock();
        let stamp = state.stamp();
        let item = state
            .lists
            .get_mut(&list)
            .and_then(|rows| rows.iter_mut().find(|item| item.id == id))
            .ok_or_else(|| RoundingError::NotFound(format!("{} item {}", list.as_str(), id)))?;

        item.fields.extend(fields_map);
        item.fields.insert(fields::MODIFIED.into(), Value::String(stamp.to_rfc3339()));
        item.last_modified = Some(stamp);
        Ok(item.clone())
    }

    async fn delete(&self, list: ListKind, id: &str) -> RoundingResult<()> {
        self.enter()?;
        let mut state = self.state.lock();
        let rows = state.lists.entry(list).or_default();
        let before = rows.len();
        rows.retain(|item| item.id != id);
        if rows.len() == before {
            return Err(RoundingError::NotFound(format!("{} item {}", list.as_str(), id)));
        }
        Ok(())
    }
}
