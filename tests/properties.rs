//! Property tests for the SQL guard and caps enforcer.
//! Covers:
//! - Multi-statement detection for any interior semicolon
//! - Read-only classification for benign SELECTs
//! - Row/column/byte cap arithmetic

use proptest::prelude::*;
use querygate::engine::sql_guard::{analyze_sql, SqlClassification};
use querygate::engine_core::caps::{cap_tabular_data, cap_text};
use serde_json::{json, Map, Value};

proptest! {
    #[test]
    fn interior_semicolon_is_always_multi_statement(
        head in "[A-Za-z0-9_ ]{0,20}",
        tail in "[a-z]{1,10}"
    ) {
        // A semicolon followed by non-whitespace content is never "trailing"
        let sql = format!("{head}; {tail}");
        let result = analyze_sql(&sql);
        prop_assert!(result.is_multi_statement);
    }

    #[test]
    fn trailing_semicolon_is_never_multi_statement(
        body in "[xyz_ ]{1,30}"
    ) {
        let sql = format!("SELECT {body};");
        let result = analyze_sql(&sql);
        prop_assert!(!result.is_multi_statement);
    }

    #[test]
    fn benign_select_classifies_read_only(
        // x/y/z/_ cannot spell any destructive keyword
        payload in "[xyz_ ]{0,30}"
    ) {
        let sql = format!("SELECT {payload}");
        let result = analyze_sql(&sql);
        prop_assert_eq!(result.classification, SqlClassification::ReadOnly);
    }

    #[test]
    fn cap_text_never_exceeds_budget(
        text in "\\PC{0,200}",
        max_bytes in 0usize..100
    ) {
        let (capped, truncated) = cap_text(&text, max_bytes);
        prop_assert!(capped.len() <= max_bytes || !truncated);
        prop_assert_eq!(truncated, text.len() > max_bytes);
        if truncated {
            prop_assert!(capped.len() <= max_bytes);
        } else {
            prop_assert_eq!(capped.as_str(), text.as_str());
        }
    }

    #[test]
    fn tabular_caps_hold_for_all_shapes(
        rows in 0usize..30,
        columns in 1usize..10,
        max_rows in 1usize..40,
        max_columns in 1usize..12
    ) {
        let data: Vec<Map<String, Value>> = (0..rows)
            .map(|r| {
                (0..columns)
                    .map(|c| (format!("c{c:02}"), json!(r)))
                    .collect()
            })
            .collect();

        let capped = cap_tabular_data(&data, max_rows, max_columns);

        prop_assert_eq!(capped.rows.len(), rows.min(max_rows));
        for row in &capped.rows {
            prop_assert_eq!(row.len(), columns.min(max_columns));
        }
        if rows == 0 {
            prop_assert!(!capped.rows_truncated);
            prop_assert!(!capped.columns_truncated);
        } else {
            prop_assert_eq!(capped.rows_truncated, rows > max_rows);
            prop_assert_eq!(capped.columns_truncated, columns > max_columns);
        }
    }
}
