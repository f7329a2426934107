//! Opaque `created_at:id` pagination tokens.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: i64,
    pub id: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor must look like <created_at>:<id>")]
    Malformed,
    #[error("cursor timestamp must not be negative")]
    NegativeTimestamp,
    #[error("cursor id must be positive")]
    NonPositiveId,
}

impl Cursor {
    pub fn new(created_at: i64, id: i64) -> Self {
        Self { created_at, id }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.created_at, self.id)
    }
}

impl FromStr for Cursor {
    type Err = CursorError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (created_at, id) = raw.split_once(':').ok_or(CursorError::Malformed)?;
        if created_at.is_empty() || id.is_empty() {
            return Err(CursorError::Malformed);
        }
        let created_at = created_at
            .parse::<i64>()
            .map_err(|_| CursorError::Malformed)?;
        let id = id.parse::<i64>().map_err(|_| CursorError::Malformed)?;
        if created_at < 0 {
            return Err(CursorError::NegativeTimestamp);
        }
        if id <= 0 {
            return Err(CursorError::NonPositiveId);
        }
        Ok(Self { created_at, id })
    }
}
