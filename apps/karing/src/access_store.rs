//! API credentials and IP allow/deny rules.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde::Serialize;

use crate::cidr::normalize_ipv4_cidr;
use crate::clock::SharedClock;
use crate::db::{self, StoreError};

const KEY_SECRET_BYTES: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    Read,
    Write,
    Admin,
}

impl ApiKeyRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for ApiKeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiKeyRole {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "admin" => Ok(Self::Admin),
            other => Err(StoreError::Validation {
                field: "role",
                message: format!("unknown role '{other}', expected read, write or admin"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpList {
    Allow,
    Deny,
}

impl IpList {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    const fn table(self) -> &'static str {
        match self {
            Self::Allow => "ip_allow",
            Self::Deny => "ip_deny",
        }
    }
}

impl FromStr for IpList {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(StoreError::Validation {
                field: "list",
                message: format!("unknown list '{other}', expected allow or deny"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub key: String,
    pub label: Option<String>,
    pub enabled: bool,
    /// Stored verbatim; values outside read/write/admin never grant access.
    pub role: String,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
    pub last_ip: Option<String>,
}

/// An enabled key as seen by the access gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMatch {
    pub id: i64,
    pub role: String,
}

impl KeyMatch {
    pub fn role(&self) -> Option<ApiKeyRole> {
        self.role.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpRuleRecord {
    pub id: i64,
    pub cidr: String,
    pub enabled: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct AccessStore {
    db_path: PathBuf,
    clock: SharedClock,
}

impl AccessStore {
    pub fn new(db_path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            db_path: db_path.into(),
            clock,
        }
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        db::open(&self.db_path)
    }

    /// Creates a key with a fresh random secret.
    pub fn issue_key(
        &self,
        role: ApiKeyRole,
        label: Option<&str>,
        enabled: bool,
    ) -> Result<ApiKeyRecord, StoreError> {
        let secret = generate_secret();
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO api_keys(key, label, enabled, role, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![secret, label, enabled, role.as_str(), self.clock.now()],
        )?;
        let id = conn.last_insert_rowid();
        tracing::info!(key_id = id, role = role.as_str(), "api key issued");
        fetch_key(&conn, id)?.ok_or(StoreError::NotFound)
    }

    pub fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, key, label, enabled, role, created_at, last_used_at, last_ip \
             FROM api_keys ORDER BY id",
        )?;
        let rows = stmt.query_map([], key_from_row)?;
        let keys = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn get_key(&self, id: i64) -> Result<ApiKeyRecord, StoreError> {
        let conn = self.connect()?;
        fetch_key(&conn, id)?.ok_or(StoreError::NotFound)
    }

    pub fn set_role(&self, id: i64, role: ApiKeyRole) -> Result<(), StoreError> {
        self.update_key(id, "UPDATE api_keys SET role = ?1 WHERE id = ?2", role.as_str())
    }

    pub fn set_label(&self, id: i64, label: Option<&str>) -> Result<(), StoreError> {
        self.update_key(id, "UPDATE api_keys SET label = ?1 WHERE id = ?2", label)
    }

    pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<(), StoreError> {
        self.update_key(id, "UPDATE api_keys SET enabled = ?1 WHERE id = ?2", enabled)
    }

    pub fn delete_key(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute("DELETE FROM api_keys WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        tracing::info!(key_id = id, "api key deleted");
        Ok(())
    }

    fn update_key<T: rusqlite::ToSql>(
        &self,
        id: i64,
        sql: &str,
        value: T,
    ) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let changed = conn.execute(sql, params![value, id])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn count_keys(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM api_keys", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub fn find_enabled_key(&self, key: &str) -> Result<Option<KeyMatch>, StoreError> {
        let conn = self.connect()?;
        let found = conn
            .query_row(
                "SELECT id, role FROM api_keys WHERE key = ?1 AND enabled = 1",
                params![key],
                |row| {
                    Ok(KeyMatch {
                        id: row.get(0)?,
                        role: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    pub fn touch_key(&self, id: i64, ip: &str) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ?1, last_ip = ?2 WHERE id = ?3",
            params![self.clock.now(), ip, id],
        )?;
        Ok(())
    }

    /// Normalizes `cidr` and adds it to `list`.
    pub fn add_ip_rule(&self, list: IpList, cidr: &str) -> Result<IpRuleRecord, StoreError> {
        let cidr = normalize_ipv4_cidr(cidr).map_err(|error| StoreError::Validation {
            field: "cidr",
            message: error.to_string(),
        })?;
        let created_at = self.clock.now();
        let conn = self.connect()?;
        let sql = format!(
            "INSERT INTO {}(cidr, enabled, created_at) VALUES (?1, 1, ?2)",
            list.table()
        );
        match conn.execute(&sql, params![cidr, created_at]) {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(error, _))
                if error.code == ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Conflict {
                    message: format!("{cidr} is already on the {} list", list.as_str()),
                });
            }
            Err(error) => return Err(error.into()),
        }
        let id = conn.last_insert_rowid();
        tracing::info!(list = list.as_str(), %cidr, "ip rule added");
        Ok(IpRuleRecord {
            id,
            cidr,
            enabled: true,
            created_at,
        })
    }

    pub fn remove_ip_rule(&self, list: IpList, id: i64) -> Result<(), StoreError> {
        let conn = self.connect()?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", list.table());
        let changed = conn.execute(&sql, params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn list_ip_rules(&self, list: IpList) -> Result<Vec<IpRuleRecord>, StoreError> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT id, cidr, enabled, created_at FROM {} ORDER BY id",
            list.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(IpRuleRecord {
                id: row.get(0)?,
                cidr: row.get(1)?,
                enabled: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        let rules = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(rules)
    }

    pub fn enabled_cidrs(&self, list: IpList) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let sql = format!("SELECT cidr FROM {} WHERE enabled = 1 ORDER BY id", list.table());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let cidrs = rows.collect::<Result<Vec<String>, _>>()?;
        Ok(cidrs)
    }
}

fn generate_secret() -> String {
    let bytes: [u8; KEY_SECRET_BYTES] = rand::random();
    hex::encode(bytes)
}

fn fetch_key(conn: &Connection, id: i64) -> Result<Option<ApiKeyRecord>, StoreError> {
    let key = conn
        .query_row(
            "SELECT id, key, label, enabled, role, created_at, last_used_at, last_ip \
             FROM api_keys WHERE id = ?1",
            params![id],
            key_from_row,
        )
        .optional()?;
    Ok(key)
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
    Ok(ApiKeyRecord {
        id: row.get(0)?,
        key: row.get(1)?,
        label: row.get(2)?,
        enabled: row.get(3)?,
        role: row.get(4)?,
        created_at: row.get(5)?,
        last_used_at: row.get(6)?,
        last_ip: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::clock::SteppingClock;

    fn store() -> (TempDir, AccessStore) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("karing.db");
        db::init_schema(&path, false).expect("schema");
        let store = AccessStore::new(path, Arc::new(SteppingClock::starting_at(500)));
        (dir, store)
    }

    #[test]
    fn issued_keys_are_48_hex_characters_and_unique() {
        let (_dir, store) = store();
        let first = store
            .issue_key(ApiKeyRole::Write, Some("laptop"), true)
            .expect("issue");
        let second = store
            .issue_key(ApiKeyRole::Read, None, true)
            .expect("issue");
        assert_eq!(first.key.len(), 48);
        assert!(first.key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first.key, second.key);
        assert_eq!(first.label.as_deref(), Some("laptop"));
        assert_eq!(store.count_keys().expect("count"), 2);
    }

    #[test]
    fn disabled_keys_are_not_found_and_roles_round_trip() {
        let (_dir, store) = store();
        let key = store
            .issue_key(ApiKeyRole::Read, None, false)
            .expect("issue");
        assert_eq!(store.find_enabled_key(&key.key).expect("find"), None);

        store.set_enabled(key.id, true).expect("enable");
        store.set_role(key.id, ApiKeyRole::Admin).expect("role");
        let found = store
            .find_enabled_key(&key.key)
            .expect("find")
            .expect("enabled key");
        assert_eq!(found.role(), Some(ApiKeyRole::Admin));

        store.touch_key(key.id, "10.1.2.3").expect("touch");
        let record = store.get_key(key.id).expect("get");
        assert_eq!(record.last_ip.as_deref(), Some("10.1.2.3"));
        assert!(record.last_used_at.is_some());

        store.delete_key(key.id).expect("delete");
        assert!(matches!(store.delete_key(key.id), Err(StoreError::NotFound)));
        assert!(matches!(
            store.set_label(key.id, Some("x")),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn unknown_role_strings_grant_nothing() {
        let found = KeyMatch {
            id: 1,
            role: "superuser".to_string(),
        };
        assert_eq!(found.role(), None);
        assert!("owner".parse::<ApiKeyRole>().is_err());
        assert_eq!("WRITE".parse::<ApiKeyRole>().ok(), Some(ApiKeyRole::Write));
    }

    #[test]
    fn ip_rules_are_normalized_and_unique_per_list() {
        let (_dir, store) = store();
        let rule = store
            .add_ip_rule(IpList::Deny, "10.0.0.5/24")
            .expect("add");
        assert_eq!(rule.cidr, "10.0.0.0/24");
        assert!(matches!(
            store.add_ip_rule(IpList::Deny, "10.0.0.77/24"),
            Err(StoreError::Conflict { .. })
        ));
        store
            .add_ip_rule(IpList::Allow, "10.0.0.0/24")
            .expect("same cidr on the other list");
        let host = store.add_ip_rule(IpList::Allow, "192.168.1.9").expect("host");
        assert_eq!(host.cidr, "192.168.1.9/32");
        assert!(matches!(
            store.add_ip_rule(IpList::Allow, "not-an-ip"),
            Err(StoreError::Validation { field: "cidr", .. })
        ));

        assert_eq!(
            store.enabled_cidrs(IpList::Allow).expect("allow"),
            vec!["10.0.0.0/24".to_string(), "192.168.1.9/32".to_string()]
        );
        store.remove_ip_rule(IpList::Deny, rule.id).expect("remove");
        assert!(store.list_ip_rules(IpList::Deny).expect("deny").is_empty());
        assert!(matches!(
            store.remove_ip_rule(IpList::Deny, rule.id),
            Err(StoreError::NotFound)
        ));
    }
}
