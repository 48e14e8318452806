//! Action history store.
//!
//! Every request the rule engine dispatches leaves one entry here. Entries are
//! kept newest first and trimmed at the tail, so the store always holds the
//! `max_entries` most recently added. When `auto_save` is set the whole list
//! is written to the local store after each mutation.

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::HistoryConfig;
use crate::storage::KeyValueStore;
use crate::types::{
    generate_id, now_millis, ActionContext, ActionInput, DataCategory, ProcessedResult,
    SourceContext,
};

/// History shared between the engine, the server and status queries
pub type SharedHistory = Arc<tokio::sync::Mutex<ActionHistoryStore>>;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("CSV import not implemented yet")]
    CsvImportUnsupported,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Lifecycle of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Processing => "processing",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states are never left again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }
}

/// One recorded action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionHistoryEntry {
    pub id: String,
    pub timestamp: i64,
    pub context: ActionContext,
    pub action: String,
    pub input: ActionInput,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ProcessedResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_category: Option<DataCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_action_id: Option<String>,
}

impl ActionHistoryEntry {
    /// A new entry; `id` and `timestamp` are assigned by [`ActionHistoryStore::add_entry`]
    pub fn new(
        context: ActionContext,
        action: impl Into<String>,
        input: ActionInput,
        status: ActionStatus,
    ) -> Self {
        Self {
            id: String::new(),
            timestamp: 0,
            context,
            action: action.into(),
            input,
            status,
            result: None,
            error: None,
            rule_set: None,
            execution_id: None,
            data_category: None,
            parent_action_id: None,
        }
    }
}

/// Partial update merged into an existing entry
#[derive(Debug, Clone, Default)]
pub struct EntryUpdate {
    pub action: Option<String>,
    pub status: Option<ActionStatus>,
    pub result: Option<ProcessedResult>,
    pub error: Option<String>,
    pub data_category: Option<DataCategory>,
}

/// Inclusive time window in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    #[serde(default)]
    pub source: Option<SourceContext>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub status: Option<ActionStatus>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
}

impl HistoryFilter {
    fn matches(&self, entry: &ActionHistoryEntry) -> bool {
        if let Some(source) = self.source {
            if entry.context.source != source {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(range) = self.date_range {
            if entry.timestamp < range.start || entry.timestamp > range.end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Pending plus processing
    pub pending: usize,
    /// Percentage of completed entries (0-100)
    pub success_rate: f64,
    pub by_source: BTreeMap<String, usize>,
    pub by_action: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Capped, newest-first log of actions
pub struct ActionHistoryStore {
    entries: Vec<ActionHistoryEntry>,
    max_entries: usize,
    auto_save: bool,
    storage_key: String,
    store: Option<Arc<dyn KeyValueStore>>,
    filters: HistoryFilter,
}

impl ActionHistoryStore {
    /// Create an in-memory store with no persistence. The cap is at least one
    /// so the entry just added is always retrievable.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries: max_entries.max(1),
            auto_save: false,
            storage_key: "rs-action-history".to_string(),
            store: None,
            filters: HistoryFilter::default(),
        }
    }

    /// Create a store backed by `store`, rehydrating any persisted entries
    pub fn load(config: &HistoryConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let mut history = Self {
            entries: Vec::new(),
            max_entries: config.max_entries.max(1),
            auto_save: config.auto_save,
            storage_key: config.storage_key.clone(),
            store: Some(store),
            filters: HistoryFilter::default(),
        };
        history.load_history();
        history
    }

    pub fn into_shared(self) -> SharedHistory {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    fn load_history(&mut self) {
        let Some(store) = &self.store else { return };

        let raw = match store.get(&self.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to load action history: {}", e);
                return;
            }
        };

        let Value::Array(items) = raw else {
            warn!("Stored action history is not a list, ignoring");
            return;
        };

        self.entries = items.into_iter().filter_map(rehydrate_entry).collect();
        self.entries.truncate(self.max_entries);
        info!("📚 Loaded {} history entries", self.entries.len());
    }

    fn save_history(&self) {
        if !self.auto_save {
            return;
        }
        let Some(store) = &self.store else { return };

        match serde_json::to_value(&self.entries) {
            Ok(value) => {
                if let Err(e) = store.set(&self.storage_key, &value) {
                    warn!("Failed to save action history: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize action history: {}", e),
        }
    }

    /// Insert an entry at the front, assigning its id and timestamp
    pub fn add_entry(&mut self, mut entry: ActionHistoryEntry) -> String {
        entry.id = generate_id("action");
        entry.timestamp = now_millis();
        let id = entry.id.clone();

        self.entries.insert(0, entry);
        self.entries.truncate(self.max_entries);
        self.save_history();
        id
    }

    /// Merge `update` into an entry. Returns false if the id is unknown.
    pub fn update_entry(&mut self, id: &str, update: EntryUpdate) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };

        if let Some(status) = update.status {
            if entry.status.is_terminal() && status != entry.status {
                warn!(
                    "Ignoring transition {} -> {} for {}",
                    entry.status.as_str(),
                    status.as_str(),
                    id
                );
            } else {
                entry.status = status;
            }
        }
        if let Some(action) = update.action {
            entry.action = action;
        }
        if let Some(result) = update.result {
            entry.result = Some(result);
        }
        if let Some(error) = update.error {
            entry.error = Some(error);
        }
        if let Some(category) = update.data_category {
            entry.data_category = Some(category);
        }

        self.save_history();
        true
    }

    pub fn get_entry(&self, id: &str) -> Option<&ActionHistoryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Entries matching `filter`, or the store's default filters when `None`
    pub fn get_entries(&self, filter: Option<&HistoryFilter>) -> Vec<ActionHistoryEntry> {
        let filter = filter.unwrap_or(&self.filters);
        self.entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// The `limit` newest entries
    pub fn get_recent_entries(&self, limit: usize) -> Vec<ActionHistoryEntry> {
        self.entries.iter().take(limit).cloned().collect()
    }

    pub fn remove_entry(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        let removed = self.entries.len() != before;
        if removed {
            self.save_history();
        }
        removed
    }

    pub fn clear_entries(&mut self) {
        self.entries.clear();
        self.save_history();
    }

    pub fn set_filters(&mut self, filters: HistoryFilter) {
        self.filters = filters;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_stats(&self) -> HistoryStats {
        let total = self.entries.len();
        let mut completed = 0;
        let mut failed = 0;
        let mut pending = 0;
        let mut by_source = BTreeMap::new();
        let mut by_action = BTreeMap::new();

        for entry in &self.entries {
            match entry.status {
                ActionStatus::Completed => completed += 1,
                ActionStatus::Failed => failed += 1,
                ActionStatus::Pending | ActionStatus::Processing => pending += 1,
                ActionStatus::Cancelled => {}
            }
            *by_source
                .entry(entry.context.source.as_str().to_string())
                .or_insert(0) += 1;
            *by_action.entry(entry.action.clone()).or_insert(0) += 1;
        }

        let success_rate = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        HistoryStats {
            total,
            completed,
            failed,
            pending,
            success_rate,
            by_source,
            by_action,
        }
    }

    pub fn export_entries(&self, format: ExportFormat) -> Result<String, HistoryError> {
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&self.entries)?),
            ExportFormat::Csv => Ok(self.export_csv()),
        }
    }

    fn export_csv(&self) -> String {
        const HEADERS: [&str; 8] = [
            "ID",
            "Timestamp",
            "Source",
            "Action",
            "Status",
            "Input Type",
            "Result Type",
            "Processing Time",
        ];

        let mut lines = vec![HEADERS.join(",")];
        for entry in &self.entries {
            let row = [
                entry.id.clone(),
                iso_timestamp(entry.timestamp),
                entry.context.source.as_str().to_string(),
                entry.action.clone(),
                entry.status.as_str().to_string(),
                entry.input.kind.as_str().to_string(),
                entry
                    .result
                    .as_ref()
                    .map(|r| r.kind.as_str().to_string())
                    .unwrap_or_default(),
                entry
                    .result
                    .as_ref()
                    .and_then(|r| r.processing_time)
                    .map(|t| t.to_string())
                    .unwrap_or_default(),
            ];
            let cells: Vec<String> = row
                .iter()
                .map(|cell| format!("\"{}\"", cell.replace('"', "\"\"")))
                .collect();
            lines.push(cells.join(","));
        }
        lines.join("\n")
    }

    /// Merge exported entries into the store. Returns how many were added.
    pub fn import_entries(
        &mut self,
        data: &str,
        format: ExportFormat,
    ) -> Result<usize, HistoryError> {
        if format == ExportFormat::Csv {
            return Err(HistoryError::CsvImportUnsupported);
        }

        let parsed: Value = serde_json::from_str(data).map_err(|_| HistoryError::InvalidJson)?;
        let Value::Array(items) = parsed else {
            return Err(HistoryError::InvalidJson);
        };

        let known: HashSet<String> = self.entries.iter().map(|e| e.id.clone()).collect();
        let imported: Vec<ActionHistoryEntry> = items
            .into_iter()
            .filter(has_required_fields)
            .filter_map(rehydrate_entry)
            .filter(|e| !known.contains(&e.id))
            .collect();

        let count = imported.len();
        self.entries.extend(imported);
        self.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.entries.truncate(self.max_entries);
        self.save_history();

        debug!("Imported {} history entries", count);
        Ok(count)
    }
}

fn has_required_fields(item: &Value) -> bool {
    ["id", "timestamp", "context", "action"]
        .iter()
        .all(|field| item.get(field).map_or(false, |v| !v.is_null()))
}

/// Parse a persisted entry, back-filling fields older versions did not write
fn rehydrate_entry(mut item: Value) -> Option<ActionHistoryEntry> {
    let obj = item.as_object_mut()?;
    if !obj.get("context").map_or(false, Value::is_object) {
        obj.insert("context".to_string(), json!({ "source": "unknown" }));
    }
    if !obj.get("input").map_or(false, Value::is_object) {
        obj.insert("input".to_string(), json!({ "type": "unknown" }));
    }
    if !obj.get("status").map_or(false, Value::is_string) {
        obj.insert("status".to_string(), json!("completed"));
    }

    match serde_json::from_value(item) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!("Skipping unreadable history entry: {}", e);
            None
        }
    }
}

fn iso_timestamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{InputKind, ResultType};

    fn entry(source: SourceContext, action: &str) -> ActionHistoryEntry {
        ActionHistoryEntry::new(
            ActionContext::new(source),
            action,
            ActionInput::text("hello"),
            ActionStatus::Processing,
        )
    }

    #[test]
    fn test_capacity_keeps_most_recent() {
        let mut history = ActionHistoryStore::new(5);
        let ids: Vec<String> = (0..8)
            .map(|i| history.add_entry(entry(SourceContext::Workcenter, &format!("a{}", i))))
            .collect();

        assert_eq!(history.len(), 5);
        let kept: Vec<String> = history.get_recent_entries(50).into_iter().map(|e| e.id).collect();
        let expected: Vec<String> = ids[3..].iter().rev().cloned().collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn test_capacity_at_small_caps() {
        for cap in [0, 1, 2] {
            let mut history = ActionHistoryStore::new(cap);
            let ids: Vec<String> = (0..cap + 3)
                .map(|i| history.add_entry(entry(SourceContext::Workcenter, &format!("a{}", i))))
                .collect();

            let retained = cap.max(1);
            assert_eq!(history.len(), retained);
            let newest = ids.last().unwrap();
            assert!(history.update_entry(
                newest,
                EntryUpdate {
                    status: Some(ActionStatus::Completed),
                    ..Default::default()
                }
            ));
            assert_eq!(history.get_entry(newest).unwrap().status, ActionStatus::Completed);

            let kept: Vec<String> =
                history.get_recent_entries(50).into_iter().map(|e| e.id).collect();
            let expected: Vec<String> =
                ids[ids.len() - retained..].iter().rev().cloned().collect();
            assert_eq!(kept, expected);
        }
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut history = ActionHistoryStore::new(10);
        let id = history.add_entry(entry(SourceContext::Workcenter, "auto"));

        assert!(history.update_entry(
            &id,
            EntryUpdate {
                status: Some(ActionStatus::Failed),
                error: Some("boom".into()),
                ..Default::default()
            }
        ));
        history.update_entry(
            &id,
            EntryUpdate {
                status: Some(ActionStatus::Processing),
                ..Default::default()
            },
        );

        let stored = history.get_entry(&id).unwrap();
        assert_eq!(stored.status, ActionStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(!history.update_entry("missing", EntryUpdate::default()));
    }

    #[test]
    fn test_filters_and_stats() {
        let mut history = ActionHistoryStore::new(10);
        let a = history.add_entry(entry(SourceContext::Workcenter, "recognize"));
        history.add_entry(entry(SourceContext::ShareTarget, "view"));
        let c = history.add_entry(entry(SourceContext::Workcenter, "analyze"));

        history.update_entry(
            &a,
            EntryUpdate {
                status: Some(ActionStatus::Completed),
                ..Default::default()
            },
        );
        history.update_entry(
            &c,
            EntryUpdate {
                status: Some(ActionStatus::Failed),
                ..Default::default()
            },
        );

        let filter = HistoryFilter {
            source: Some(SourceContext::Workcenter),
            ..Default::default()
        };
        assert_eq!(history.get_entries(Some(&filter)).len(), 2);

        history.set_filters(HistoryFilter {
            status: Some(ActionStatus::Failed),
            ..Default::default()
        });
        assert_eq!(history.get_entries(None).len(), 1);

        let stats = history.get_stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert!((stats.success_rate - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.by_source.get("workcenter"), Some(&2));
        assert_eq!(stats.by_action.get("view"), Some(&1));
    }

    #[test]
    fn test_csv_export_quotes_every_cell() {
        let mut history = ActionHistoryStore::new(10);
        let id = history.add_entry(entry(SourceContext::ChromeExtension, "recognize"));
        let mut result = ProcessedResult::new(ResultType::Markdown, "x");
        result.processing_time = Some(12);
        history.update_entry(
            &id,
            EntryUpdate {
                status: Some(ActionStatus::Completed),
                result: Some(result),
                ..Default::default()
            },
        );

        let csv = history.export_entries(ExportFormat::Csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines[0],
            "ID,Timestamp,Source,Action,Status,Input Type,Result Type,Processing Time"
        );
        assert!(lines[1].starts_with(&format!("\"{}\",\"", id)));
        assert!(lines[1].ends_with(
            "\"chrome-extension\",\"recognize\",\"completed\",\"text\",\"markdown\",\"12\""
        ));
    }

    #[test]
    fn test_import_skips_known_and_invalid() {
        let mut source = ActionHistoryStore::new(10);
        source.add_entry(entry(SourceContext::Workcenter, "a"));
        source.add_entry(entry(SourceContext::Workcenter, "b"));
        let exported = source.export_entries(ExportFormat::Json).unwrap();

        let mut target = ActionHistoryStore::new(10);
        assert_eq!(target.import_entries(&exported, ExportFormat::Json).unwrap(), 2);
        assert_eq!(target.import_entries(&exported, ExportFormat::Json).unwrap(), 0);
        assert_eq!(target.len(), 2);

        let partial = r#"[{"id":"x","timestamp":1},{"id":"y","timestamp":2,"context":{"source":"workcenter"},"action":"view"}]"#;
        assert_eq!(target.import_entries(partial, ExportFormat::Json).unwrap(), 1);
        assert_eq!(target.get_entry("y").unwrap().status, ActionStatus::Completed);
        assert_eq!(target.get_entry("y").unwrap().input.kind, InputKind::Unknown);

        assert!(matches!(
            target.import_entries("not json", ExportFormat::Json),
            Err(HistoryError::InvalidJson)
        ));
        assert_eq!(
            target.import_entries("", ExportFormat::Csv).unwrap_err().to_string(),
            "CSV import not implemented yet"
        );
    }

    #[test]
    fn test_persists_and_rehydrates() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = HistoryConfig::default();

        let mut history = ActionHistoryStore::load(&config, store.clone());
        let id = history.add_entry(entry(SourceContext::LaunchQueue, "process"));

        let reloaded = ActionHistoryStore::load(&config, store.clone());
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get_entry(&id).unwrap().action, "process");

        store
            .set(
                &config.storage_key,
                &json!([{ "id": "old", "timestamp": 5, "action": "view" }]),
            )
            .unwrap();
        let backfilled = ActionHistoryStore::load(&config, store);
        let old = backfilled.get_entry("old").unwrap();
        assert_eq!(old.context.source, SourceContext::Unknown);
        assert_eq!(old.status, ActionStatus::Completed);
    }
}
