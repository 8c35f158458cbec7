//! Context display settings
//!
//! Everything under `CLAUDE_MEM_CONTEXT_*`: counts and toggles consumed by
//! the context composer. Resolved per request so a settings-file edit shows
//! up without a worker restart.

pub const KEY_TOTAL_OBSERVATIONS: &str = "CLAUDE_MEM_CONTEXT_TOTAL_OBSERVATIONS";
pub const KEY_SESSION_COUNT: &str = "CLAUDE_MEM_CONTEXT_SESSION_COUNT";
pub const KEY_FULL_OBSERVATION_COUNT: &str = "CLAUDE_MEM_CONTEXT_FULL_OBSERVATION_COUNT";
pub const KEY_SHOW_LEGEND: &str = "CLAUDE_MEM_CONTEXT_SHOW_LEGEND";
pub const KEY_SHOW_COLUMN_KEY: &str = "CLAUDE_MEM_CONTEXT_SHOW_COLUMN_KEY";
pub const KEY_SHOW_CONTEXT_INDEX: &str = "CLAUDE_MEM_CONTEXT_SHOW_CONTEXT_INDEX";
pub const KEY_SHOW_ECONOMICS: &str = "CLAUDE_MEM_CONTEXT_SHOW_ECONOMICS";
pub const KEY_SHOW_PREVIOUSLY: &str = "CLAUDE_MEM_CONTEXT_SHOW_PREVIOUSLY";
pub const KEY_FULL_DETAIL_FIELD: &str = "CLAUDE_MEM_CONTEXT_FULL_DETAIL_FIELD";

/// What the full-detail rendering of an observation shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetailField {
    #[default]
    Narrative,
    Facts,
}

/// Composer display knobs.
#[derive(Debug, Clone)]
pub struct DisplaySettings {
    /// Maximum recent observations fetched per composition.
    pub total_observations: usize,
    /// Recent session summaries fetched (one extra is read for lookback).
    pub session_count: usize,
    /// Leading timeline items rendered in full detail.
    pub full_observation_count: usize,
    pub show_legend: bool,
    pub show_column_key: bool,
    pub show_context_index: bool,
    pub show_economics: bool,
    pub show_previously: bool,
    pub full_detail_field: DetailField,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            total_observations: 50,
            session_count: 3,
            full_observation_count: 5,
            show_legend: true,
            show_column_key: true,
            show_context_index: false,
            show_economics: true,
            show_previously: true,
            full_detail_field: DetailField::Narrative,
        }
    }
}

impl DisplaySettings {
    /// Build from a key lookup (env > file, supplied by the caller).
    pub fn from_lookup(get: &dyn Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let flag = |key: &str, default: bool| {
            get(key)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };
        Self {
            total_observations: get(KEY_TOTAL_OBSERVATIONS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.total_observations),
            session_count: get(KEY_SESSION_COUNT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.session_count),
            full_observation_count: get(KEY_FULL_OBSERVATION_COUNT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.full_observation_count),
            show_legend: flag(KEY_SHOW_LEGEND, d.show_legend),
            show_column_key: flag(KEY_SHOW_COLUMN_KEY, d.show_column_key),
            show_context_index: flag(KEY_SHOW_CONTEXT_INDEX, d.show_context_index),
            show_economics: flag(KEY_SHOW_ECONOMICS, d.show_economics),
            show_previously: flag(KEY_SHOW_PREVIOUSLY, d.show_previously),
            full_detail_field: match get(KEY_FULL_DETAIL_FIELD).as_deref() {
                Some("facts") => DetailField::Facts,
                _ => d.full_detail_field,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_defaults() {
        let mut map = HashMap::new();
        map.insert(KEY_TOTAL_OBSERVATIONS.to_string(), "10".to_string());
        map.insert(KEY_SHOW_ECONOMICS.to_string(), "false".to_string());
        map.insert(KEY_FULL_DETAIL_FIELD.to_string(), "facts".to_string());

        let get = |key: &str| map.get(key).cloned();
        let d = DisplaySettings::from_lookup(&get);
        assert_eq!(d.total_observations, 10);
        assert!(!d.show_economics);
        assert_eq!(d.full_detail_field, DetailField::Facts);
        // Untouched keys keep defaults
        assert_eq!(d.session_count, 3);
    }
}
