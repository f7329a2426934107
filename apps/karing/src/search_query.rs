//! Translation of user search strings into FTS5 `MATCH` expressions.
//!
//! Terms are whitespace separated and implicitly joined with `AND`. A bare `|`
//! replaces the joiner at its position with `OR`; there is no precedence
//! grouping, the expression reads left to right exactly as typed. A `|` must sit
//! between two terms. Every term is emitted as a quoted FTS5 string so engine
//! operators inside a term are inert.

use thiserror::Error;

use crate::text_audit::utf8_prefix;

pub const MAX_QUERY_BYTES: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchQueryError {
    #[error("empty")]
    Empty,
    #[error("unclosed quote")]
    UnclosedQuote,
    #[error("dangling operator")]
    DanglingOperator,
}

impl SearchQueryError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::UnclosedQuote => "unclosed quote",
            Self::DanglingOperator => "dangling operator",
        }
    }
}

enum Part {
    Term(String),
    Or,
}

pub fn build_fts_query(raw: &str) -> Result<String, SearchQueryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SearchQueryError::Empty);
    }
    let input = utf8_prefix(trimmed, MAX_QUERY_BYTES);

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quote {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quote = false;
                    parts.push(Part::Term(std::mem::take(&mut current)));
                }
            } else {
                current.push(ch);
            }
            continue;
        }

        match ch {
            '"' => {
                flush_term(&mut current, &mut parts);
                in_quote = true;
            }
            '|' => {
                flush_term(&mut current, &mut parts);
                parts.push(Part::Or);
            }
            ch if ch.is_whitespace() => flush_term(&mut current, &mut parts),
            ch => current.push(ch),
        }
    }

    if in_quote {
        return Err(SearchQueryError::UnclosedQuote);
    }
    flush_term(&mut current, &mut parts);

    let mut expression = String::with_capacity(input.len() + 16);
    let mut pending_or = false;
    for part in parts {
        match part {
            Part::Or => {
                // Leading or doubled.
                if expression.is_empty() || pending_or {
                    return Err(SearchQueryError::DanglingOperator);
                }
                pending_or = true;
            }
            Part::Term(term) => {
                if pending_or {
                    expression.push_str(" OR ");
                } else if !expression.is_empty() {
                    expression.push_str(" AND ");
                }
                expression.push_str(&quote_term(&term));
                pending_or = false;
            }
        }
    }
    if pending_or {
        return Err(SearchQueryError::DanglingOperator);
    }
    Ok(expression)
}

fn flush_term(current: &mut String, parts: &mut Vec<Part>) {
    if !current.is_empty() {
        parts.push(Part::Term(std::mem::take(current)));
    }
}

fn quote_term(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Escapes `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern and wraps it in wildcards.
pub fn like_pattern(raw: &str) -> String {
    let mut pattern = String::with_capacity(raw.len() + 2);
    pattern.push('%');
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_terms_are_anded() {
        assert_eq!(
            build_fts_query("foo bar").as_deref(),
            Ok("\"foo\" AND \"bar\"")
        );
    }

    #[test]
    fn pipe_replaces_the_joiner_without_grouping() {
        assert_eq!(
            build_fts_query("foo | bar").as_deref(),
            Ok("\"foo\" OR \"bar\"")
        );
        assert_eq!(
            build_fts_query("a b|c").as_deref(),
            Ok("\"a\" AND \"b\" OR \"c\"")
        );
    }

    #[test]
    fn quoted_phrases_stay_whole_and_escape_inner_quotes() {
        assert_eq!(
            build_fts_query("\"hello world\"").as_deref(),
            Ok("\"hello world\"")
        );
        assert_eq!(
            build_fts_query("\"say \"\"hi\"\"\" now").as_deref(),
            Ok("\"say \"\"hi\"\"\" AND \"now\"")
        );
        assert_eq!(
            build_fts_query("pre\"fix\"").as_deref(),
            Ok("\"pre\" AND \"fix\"")
        );
    }

    #[test]
    fn engine_operators_inside_terms_are_quoted() {
        assert_eq!(
            build_fts_query("NEAR(a b) col:x*").as_deref(),
            Ok("\"NEAR(a\" AND \"b)\" AND \"col:x*\"")
        );
    }

    #[test]
    fn empty_and_unclosed_inputs_fail() {
        assert_eq!(build_fts_query(""), Err(SearchQueryError::Empty));
        assert_eq!(build_fts_query("   \t"), Err(SearchQueryError::Empty));
        assert_eq!(
            build_fts_query("\"unterminated"),
            Err(SearchQueryError::UnclosedQuote)
        );
        assert_eq!(SearchQueryError::UnclosedQuote.reason(), "unclosed quote");
    }

    #[test]
    fn long_input_is_truncated_silently() {
        let raw = "x".repeat(MAX_QUERY_BYTES + 100);
        let expression = build_fts_query(&raw).expect("query builds");
        assert_eq!(expression.len(), MAX_QUERY_BYTES + 2);
    }

    #[test]
    fn pipe_without_a_term_on_both_sides_is_rejected() {
        for raw in ["foo |", "| foo", "a | | b", "a || b", "|"] {
            assert_eq!(
                build_fts_query(raw),
                Err(SearchQueryError::DanglingOperator),
                "{raw}"
            );
        }
        assert_eq!(
            build_fts_query("\"a | b\" | c").as_deref(),
            Ok("\"a | b\" OR \"c\"")
        );
    }

    #[test]
    fn truncation_inside_a_quote_leaves_it_unclosed() {
        let raw = format!("\"{}\"", "a".repeat(MAX_QUERY_BYTES + 10));
        assert_eq!(build_fts_query(&raw), Err(SearchQueryError::UnclosedQuote));

        let fits = format!("\"{}\"", "a".repeat(MAX_QUERY_BYTES - 2));
        assert!(build_fts_query(&fits).is_ok());
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("50%_a\\b"), "%50\\%\\_a\\\\b%");
    }
}
