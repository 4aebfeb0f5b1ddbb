use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const GAME_ID: &str = "game_id";
pub const PLAYER_ID: &str = "player_id";
pub const TIME_RANGE: &str = "time_range";
pub const ANALYSIS_TYPE: &str = "analysis_type";
pub const METRICS: &str = "metrics";
pub const FILTERS: &str = "filters";
pub const SESSION_ID: &str = "session_id";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

/// Field-level changes between two context states. A `Value::Null` entry
/// means the field was cleared.
pub type ContextDiff = BTreeMap<String, Value>;

/// The single mutable state shared by every agent of a conversation.
///
/// Fields are free-form JSON values keyed by name. Absent fields read as
/// `None` and a field set to `null` is the same as an absent one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnalysisContext {
    fields: BTreeMap<String, Value>,
}

impl AnalysisContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|value| !value.is_null())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        let name = name.into();
        if value.is_null() {
            self.fields.remove(&name);
        } else {
            self.fields.insert(name, value);
        }
    }

    pub fn clear(&mut self, name: &str) {
        self.fields.remove(name);
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn game_id(&self) -> Option<&str> {
        self.get(GAME_ID).and_then(Value::as_str)
    }

    pub fn player_id(&self) -> Option<&str> {
        self.get(PLAYER_ID).and_then(Value::as_str)
    }

    pub fn analysis_type(&self) -> Option<&str> {
        self.get(ANALYSIS_TYPE).and_then(Value::as_str)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.get(SESSION_ID).and_then(Value::as_str)
    }

    pub fn metrics(&self) -> Vec<String> {
        self.get(METRICS)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_owned).collect())
            .unwrap_or_default()
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        self.get(TIME_RANGE).cloned().and_then(|value| serde_json::from_value(value).ok())
    }

    pub fn filters(&self) -> BTreeMap<String, Value> {
        self.get(FILTERS)
            .and_then(Value::as_object)
            .map(|map| map.iter().map(|(key, value)| (key.clone(), value.clone())).collect())
            .unwrap_or_default()
    }

    pub fn set_time_range(&mut self, range: &TimeRange) {
        match serde_json::to_value(range) {
            Ok(value) => self.set(TIME_RANGE, value),
            Err(_) => self.clear(TIME_RANGE),
        }
    }

    /// Fields whose value differs from `before`, keyed by name.
    pub fn diff_from(&self, before: &AnalysisContext) -> ContextDiff {
        let mut diff = ContextDiff::new();
        for (name, value) in &self.fields {
            if before.fields.get(name) != Some(value) {
                diff.insert(name.clone(), value.clone());
            }
        }
        for name in before.fields.keys() {
            if !self.fields.contains_key(name) {
                diff.insert(name.clone(), Value::Null);
            }
        }
        diff
    }
}

/// Owns a conversation's [`AnalysisContext`] and applies field writes to it.
///
/// Writes are last-writer-wins per field. `commit` reports only the fields
/// that actually changed so callers can decide whether a `context_update`
/// event is due.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextStore {
    current: AnalysisContext,
    revision: u64,
}

impl ContextStore {
    pub fn new(initial: AnalysisContext) -> Self {
        Self { current: initial, revision: 0 }
    }

    pub fn current(&self) -> &AnalysisContext {
        &self.current
    }

    pub fn snapshot(&self) -> AnalysisContext {
        self.current.clone()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn commit(&mut self, diff: &ContextDiff) -> ContextDiff {
        let mut applied = ContextDiff::new();
        for (name, value) in diff {
            let existing = self.current.get(name).cloned().unwrap_or(Value::Null);
            if &existing == value {
                continue;
            }
            self.current.set(name.clone(), value.clone());
            applied.insert(name.clone(), value.clone());
        }
        if !applied.is_empty() {
            self.revision += 1;
        }
        applied
    }

    /// Fills only fields that are currently absent.
    pub fn seed_defaults(&mut self, defaults: &BTreeMap<String, Value>) -> ContextDiff {
        let missing = defaults
            .iter()
            .filter(|(name, _)| !self.current.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect::<ContextDiff>();
        self.commit(&missing)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Value};

    use super::{AnalysisContext, ContextStore, TimeRange, ANALYSIS_TYPE, GAME_ID, METRICS};

    #[test]
    fn absent_and_null_fields_read_as_none() {
        let mut context = AnalysisContext::new();
        assert!(context.get(GAME_ID).is_none());

        context.set(GAME_ID, json!("GAME-1001"));
        context.set(GAME_ID, Value::Null);
        assert!(context.game_id().is_none());
        assert!(context.is_empty());
        assert!(context.metrics().is_empty());
    }

    #[test]
    fn diff_reports_changed_added_and_cleared_fields() {
        let mut before = AnalysisContext::new();
        before.set(GAME_ID, "GAME-1");
        before.set(ANALYSIS_TYPE, "revenue");

        let mut after = before.clone();
        after.set(ANALYSIS_TYPE, "retention");
        after.set(METRICS, json!(["retention_rate"]));
        after.clear(GAME_ID);

        let diff = after.diff_from(&before);
        assert_eq!(diff.len(), 3);
        assert_eq!(diff[ANALYSIS_TYPE], json!("retention"));
        assert_eq!(diff[GAME_ID], Value::Null);
        assert_eq!(after.metrics(), vec!["retention_rate".to_owned()]);
    }

    #[test]
    fn commit_is_last_writer_wins_and_skips_no_op_writes() {
        let mut store = ContextStore::default();
        let first = store.commit(&BTreeMap::from([(ANALYSIS_TYPE.to_owned(), json!("revenue"))]));
        assert_eq!(first.len(), 1);
        assert_eq!(store.revision(), 1);

        let repeat = store.commit(&BTreeMap::from([(ANALYSIS_TYPE.to_owned(), json!("revenue"))]));
        assert!(repeat.is_empty());
        assert_eq!(store.revision(), 1);

        store.commit(&BTreeMap::from([(ANALYSIS_TYPE.to_owned(), json!("retention"))]));
        assert_eq!(store.current().analysis_type(), Some("retention"));
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn seed_defaults_never_overwrites_existing_fields() {
        let mut store = ContextStore::default();
        store.commit(&BTreeMap::from([(GAME_ID.to_owned(), json!("GAME-7"))]));

        let applied = store.seed_defaults(&BTreeMap::from([
            (GAME_ID.to_owned(), json!("GAME-9")),
            (ANALYSIS_TYPE.to_owned(), json!("performance")),
        ]));

        assert_eq!(applied.len(), 1);
        assert_eq!(store.current().game_id(), Some("GAME-7"));
        assert_eq!(store.current().analysis_type(), Some("performance"));
    }

    #[test]
    fn time_range_round_trips_through_the_field_map() {
        let mut context = AnalysisContext::new();
        context.set_time_range(&TimeRange {
            start: Some("2024-01-01".to_owned()),
            end: Some("2024-01-31".to_owned()),
            period: None,
        });

        let range = context.time_range().expect("time range should parse");
        assert_eq!(range.start.as_deref(), Some("2024-01-01"));
        assert!(range.period.is_none());
    }
}
