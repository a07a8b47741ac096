// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Caps enforcement for captured payloads.
//!
//! Hard limits on rows, columns, and bytes applied to any payload leaving
//! the proxy. Caps are enforced regardless of safety mode: transparent mode
//! disables blocking, never capping.

use serde_json::{Map, Value};

use crate::engine_core::constants::caps;

/// Immutable limits supplied once per proxy instance.
#[derive(Debug, Clone, Copy)]
pub struct CapsConfig {
    pub max_rows: usize,
    pub max_columns: usize,
    pub max_bytes: usize,
}

impl Default for CapsConfig {
    fn default() -> Self {
        Self {
            max_rows: caps::DEFAULT_MAX_ROWS,
            max_columns: caps::DEFAULT_MAX_COLUMNS,
            max_bytes: caps::DEFAULT_MAX_BYTES,
        }
    }
}

/// Result of applying caps to a payload.
#[derive(Debug, Clone)]
pub struct CappedResult {
    pub data: Value,
    pub rows_truncated: bool,
    pub columns_truncated: bool,
    pub bytes_truncated: bool,
}

impl CappedResult {
    fn passthrough(data: Value) -> Self {
        Self {
            data,
            rows_truncated: false,
            columns_truncated: false,
            bytes_truncated: false,
        }
    }

    pub fn was_truncated(&self) -> bool {
        self.rows_truncated || self.columns_truncated || self.bytes_truncated
    }

    /// Human-readable summary of the truncations applied, if any.
    pub fn truncation_summary(&self) -> Option<String> {
        if !self.was_truncated() {
            return None;
        }
        let mut parts = Vec::new();
        if self.rows_truncated {
            parts.push("rows");
        }
        if self.columns_truncated {
            parts.push("columns");
        }
        if self.bytes_truncated {
            parts.push("bytes");
        }
        Some(format!("Truncated: {}", parts.join(", ")))
    }
}

/// Truncate text at the byte budget, never splitting a UTF-8 sequence.
///
/// Returns the (possibly shortened) text and whether truncation occurred.
pub fn cap_text(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}

/// Row/column truncation outcome for tabular payloads.
#[derive(Debug, Clone)]
pub struct CappedRows {
    pub rows: Vec<Map<String, Value>>,
    pub rows_truncated: bool,
    pub columns_truncated: bool,
}

/// Cap tabular data (list of row objects) by rows, then columns.
///
/// Column names are taken from the first row; every kept row is reduced to
/// the first `max_columns` of those names.
pub fn cap_tabular_data(
    rows: &[Map<String, Value>],
    max_rows: usize,
    max_columns: usize,
) -> CappedRows {
    if rows.is_empty() {
        return CappedRows {
            rows: Vec::new(),
            rows_truncated: false,
            columns_truncated: false,
        };
    }

    let rows_truncated = rows.len() > max_rows;
    let kept = &rows[..rows.len().min(max_rows)];

    let all_columns: Vec<&String> = match kept.first() {
        Some(first) => first.keys().collect(),
        None => Vec::new(),
    };
    let columns_truncated = all_columns.len() > max_columns;

    let capped: Vec<Map<String, Value>> = if columns_truncated {
        let kept_names: Vec<&String> = all_columns[..max_columns].to_vec();
        kept.iter()
            .map(|row| {
                kept_names
                    .iter()
                    .filter_map(|name| row.get(*name).map(|v| ((*name).clone(), v.clone())))
                    .collect()
            })
            .collect()
    } else {
        kept.to_vec()
    };

    CappedRows {
        rows: capped,
        rows_truncated,
        columns_truncated,
    }
}

/// Cap preview data based on its shape.
///
/// Strings get the byte cap, lists of row objects get the row/column caps,
/// anything else passes through unmodified with no truncation flags.
pub fn cap_preview(data: &Value, config: &CapsConfig) -> CappedResult {
    match data {
        Value::String(text) => {
            let (capped, truncated) = cap_text(text, config.max_bytes);
            CappedResult {
                data: Value::String(capped),
                rows_truncated: false,
                columns_truncated: false,
                bytes_truncated: truncated,
            }
        }
        Value::Array(items) if items.first().map(Value::is_object).unwrap_or(false) => {
            let rows: Vec<Map<String, Value>> = items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect();
            let capped = cap_tabular_data(&rows, config.max_rows, config.max_columns);
            CappedResult {
                data: Value::Array(capped.rows.into_iter().map(Value::Object).collect()),
                rows_truncated: capped.rows_truncated,
                columns_truncated: capped.columns_truncated,
                bytes_truncated: false,
            }
        }
        other => CappedResult::passthrough(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, i64)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn cap_text_under_budget_is_untouched() {
        let (text, truncated) = cap_text("hello", 100);
        assert_eq!(text, "hello");
        assert!(!truncated);
    }

    #[test]
    fn cap_text_respects_utf8_boundaries() {
        // "héllo" - é is 2 bytes; cutting at byte 2 would split it
        let (text, truncated) = cap_text("héllo", 2);
        assert_eq!(text, "h");
        assert!(truncated);
        assert!(text.len() <= 2);
    }

    #[test]
    fn cap_text_exact_budget_not_truncated() {
        let (text, truncated) = cap_text("abcd", 4);
        assert_eq!(text, "abcd");
        assert!(!truncated);
    }

    #[test]
    fn tabular_caps_rows_and_columns_independently() {
        let rows: Vec<_> = (0..5)
            .map(|i| row(&[("a", i), ("b", i * 2), ("c", i * 3)]))
            .collect();

        let capped = cap_tabular_data(&rows, 3, 2);
        assert_eq!(capped.rows.len(), 3);
        assert!(capped.rows_truncated);
        assert!(capped.columns_truncated);
        for r in &capped.rows {
            assert_eq!(r.len(), 2);
            assert!(r.contains_key("a"));
            assert!(r.contains_key("b"));
            assert!(!r.contains_key("c"));
        }
    }

    #[test]
    fn tabular_within_limits_sets_no_flags() {
        let rows = vec![row(&[("a", 1)]), row(&[("a", 2)])];
        let capped = cap_tabular_data(&rows, 10, 10);
        assert_eq!(capped.rows.len(), 2);
        assert!(!capped.rows_truncated);
        assert!(!capped.columns_truncated);
    }

    #[test]
    fn tabular_empty_input_is_empty_output() {
        let capped = cap_tabular_data(&[], 10, 10);
        assert!(capped.rows.is_empty());
        assert!(!capped.rows_truncated);
    }

    #[test]
    fn preview_string_gets_byte_cap() {
        let config = CapsConfig {
            max_rows: 10,
            max_columns: 10,
            max_bytes: 4,
        };
        let capped = cap_preview(&json!("abcdefgh"), &config);
        assert!(capped.bytes_truncated);
        assert_eq!(capped.data, json!("abcd"));
        assert_eq!(capped.truncation_summary().unwrap(), "Truncated: bytes");
    }

    #[test]
    fn preview_scalar_passes_through() {
        let config = CapsConfig::default();
        let capped = cap_preview(&json!(42), &config);
        assert!(!capped.was_truncated());
        assert_eq!(capped.data, json!(42));
    }

    #[test]
    fn preview_tabular_reports_both_flags() {
        let config = CapsConfig {
            max_rows: 1,
            max_columns: 1,
            max_bytes: 1024,
        };
        let data = json!([{"x": 1, "y": 2}, {"x": 3, "y": 4}]);
        let capped = cap_preview(&data, &config);
        assert!(capped.rows_truncated);
        assert!(capped.columns_truncated);
        assert!(!capped.bytes_truncated);
        assert_eq!(
            capped.truncation_summary().unwrap(),
            "Truncated: rows, columns"
        );
    }
}
