//! Typed predicates for slot listings.
//!
//! `list_filtered` and `count_filtered` compile the same `SlotFilter`, so the
//! counted row set is always the listed row set.

use rusqlite::types::Value;

use crate::cursor::Cursor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Desc,
    Asc,
}

impl SortOrder {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "desc" => Some(Self::Desc),
            "asc" => Some(Self::Asc),
            _ => None,
        }
    }

    pub const fn order_by(self) -> &'static str {
        match self {
            Self::Desc => "created_at DESC, id DESC",
            Self::Asc => "created_at ASC, id ASC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePosition {
    Offset(u64),
    After(Cursor),
}

impl Default for PagePosition {
    fn default() -> Self {
        Self::Offset(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotFilter {
    pub include_inactive: bool,
    pub is_file: Option<bool>,
    pub mime: Option<String>,
    pub filename: Option<String>,
    pub order: SortOrder,
}

/// `WHERE` clauses joined with `AND`, with their positional parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Predicate {
    fn push(&mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.params.extend(params);
    }

    pub fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn into_params(self) -> Vec<Value> {
        self.params
    }
}

impl SlotFilter {
    pub fn active_text() -> Self {
        Self {
            is_file: Some(false),
            ..Self::default()
        }
    }

    /// Row-set predicate shared by listing and counting.
    pub fn predicate(&self) -> Predicate {
        let mut predicate = Predicate::default();
        if !self.include_inactive {
            predicate.push("is_active = 1", []);
        }
        if let Some(is_file) = self.is_file {
            predicate.push("is_file = ?", [Value::Integer(i64::from(is_file))]);
        }
        if let Some(mime) = self.mime.as_ref() {
            predicate.push("mime = ?", [Value::Text(mime.clone())]);
        }
        if let Some(filename) = self.filename.as_ref() {
            predicate.push("filename = ?", [Value::Text(filename.clone())]);
        }
        predicate
    }

    /// Listing predicate: the row set narrowed to rows past `cursor` in this order.
    pub fn predicate_after(&self, cursor: Option<Cursor>) -> Predicate {
        let mut predicate = self.predicate();
        if let Some(cursor) = cursor {
            let clause = match self.order {
                SortOrder::Desc => "(created_at < ? OR (created_at = ? AND id < ?))",
                SortOrder::Asc => "(created_at > ? OR (created_at = ? AND id > ?))",
            };
            predicate.push(
                clause,
                [
                    Value::Integer(cursor.created_at),
                    Value::Integer(cursor.created_at),
                    Value::Integer(cursor.id),
                ],
            );
        }
        predicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_only_selects_active_rows() {
        let predicate = SlotFilter::default().predicate();
        assert_eq!(predicate.where_sql(), " WHERE is_active = 1");
        assert!(predicate.params().is_empty());
    }

    #[test]
    fn include_inactive_drops_every_clause() {
        let filter = SlotFilter {
            include_inactive: true,
            ..SlotFilter::default()
        };
        assert_eq!(filter.predicate().where_sql(), "");
    }

    #[test]
    fn equality_filters_bind_parameters_in_clause_order() {
        let filter = SlotFilter {
            include_inactive: false,
            is_file: Some(true),
            mime: Some("image/png".to_string()),
            filename: Some("a'; DROP TABLE karing;--".to_string()),
            order: SortOrder::Desc,
        };
        let predicate = filter.predicate();
        assert_eq!(
            predicate.where_sql(),
            " WHERE is_active = 1 AND is_file = ? AND mime = ? AND filename = ?"
        );
        assert_eq!(
            predicate.into_params(),
            vec![
                Value::Integer(1),
                Value::Text("image/png".to_string()),
                Value::Text("a'; DROP TABLE karing;--".to_string()),
            ]
        );
    }

    #[test]
    fn cursor_clause_follows_sort_order() {
        let cursor = Cursor::new(50, 7);
        let desc = SlotFilter::default().predicate_after(Some(cursor));
        assert!(desc.where_sql().contains("created_at < ?"));
        assert_eq!(desc.params().len(), 3);

        let asc = SlotFilter {
            order: SortOrder::Asc,
            ..SlotFilter::default()
        }
        .predicate_after(Some(cursor));
        assert!(asc.where_sql().contains("id > ?"));
    }

    #[test]
    fn sort_order_parses_case_insensitively() {
        assert_eq!(SortOrder::parse("ASC"), Some(SortOrder::Asc));
        assert_eq!(SortOrder::parse("desc"), Some(SortOrder::Desc));
        assert_eq!(SortOrder::parse("sideways"), None);
    }
}
