//! Command-line surface: server flags plus the `keys` and `ip` admin commands.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat};
use clap::{Parser, Subcommand};

use crate::access_store::{AccessStore, ApiKeyRecord, ApiKeyRole, IpList, IpRuleRecord};
use crate::clock::{SharedClock, system_clock};
use crate::config::{BUILD_LIMIT, Config, ConfigOverrides, HARD_MAX_FILE_BYTES, HARD_MAX_TEXT_BYTES};
use crate::db;

#[derive(Debug, Parser)]
#[command(name = "karing")]
#[command(version, about = "Self-hosted clipboard and paste service with rotating slots")]
pub struct Cli {
    /// SQLite database file.
    #[arg(long, value_name = "PATH")]
    pub data: Option<PathBuf>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Active slot limit, clamped to the build limit.
    #[arg(long)]
    pub limit: Option<u32>,
    #[arg(long)]
    pub max_file_bytes: Option<u64>,
    #[arg(long)]
    pub max_text_bytes: Option<u64>,
    #[arg(long)]
    pub no_auth: bool,
    /// Honor X-Forwarded-For / X-Real-IP from trusted peers.
    #[arg(long)]
    pub trusted_proxy: bool,
    /// Let loopback clients read without a key.
    #[arg(long)]
    pub allow_localhost: bool,
    #[arg(long)]
    pub base_path: Option<String>,
    /// Print the schema and effective limits, then exit.
    #[arg(long)]
    pub check_db: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            db_path: self.data.clone(),
            port: self.port,
            limit: self.limit,
            max_file_bytes: self.max_file_bytes,
            max_text_bytes: self.max_text_bytes,
            no_auth: self.no_auth,
            trust_proxy: self.trusted_proxy,
            allow_localhost: self.allow_localhost,
            base_path: self.base_path.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage API keys.
    #[command(subcommand)]
    Keys(KeysCommand),
    /// Manage the IP allow and deny lists.
    #[command(subcommand)]
    Ip(IpCommand),
}

#[derive(Debug, Subcommand)]
pub enum KeysCommand {
    List {
        #[arg(long)]
        json: bool,
    },
    Add {
        #[arg(long, default_value = "write")]
        role: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        disabled: bool,
        #[arg(long)]
        json: bool,
    },
    SetRole {
        id: i64,
        role: String,
    },
    SetLabel {
        id: i64,
        label: String,
    },
    Disable {
        id: i64,
    },
    Enable {
        id: i64,
    },
    /// Disables the key, or deletes it with `--hard`.
    Rm {
        id: i64,
        #[arg(long)]
        hard: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum IpCommand {
    List {
        /// `allow` or `deny`; both when omitted.
        list: Option<String>,
    },
    Add {
        cidr: String,
        list: String,
    },
    /// Removes a rule given as `allow:<id>` or `deny:<id>`.
    Del {
        target: String,
    },
}

/// Prints every table with its SQL, followed by the effective limits.
pub fn check_db(config: &Config, out: &mut dyn Write) -> Result<()> {
    let tables = db::list_tables(&config.db_path)
        .with_context(|| format!("read schema from {}", config.db_path.display()))?;
    for table in tables {
        writeln!(out, "{}\t{}", table.name, table.sql.unwrap_or_default())?;
    }
    writeln!(out, "limit\t{}", config.runtime_limit)?;
    writeln!(out, "build_limit\t{BUILD_LIMIT}")?;
    writeln!(
        out,
        "max_file_bytes\t{}\t(hard {HARD_MAX_FILE_BYTES})",
        config.max_file_bytes
    )?;
    writeln!(
        out,
        "max_text_bytes\t{}\t(hard {HARD_MAX_TEXT_BYTES})",
        config.max_text_bytes
    )?;
    Ok(())
}

pub fn run_command(config: &Config, command: Command, out: &mut dyn Write) -> Result<()> {
    run_command_with_clock(config, command, system_clock(), out)
}

pub fn run_command_with_clock(
    config: &Config,
    command: Command,
    clock: SharedClock,
    out: &mut dyn Write,
) -> Result<()> {
    let access = AccessStore::new(config.db_path.clone(), clock);
    match command {
        Command::Keys(command) => run_keys(&access, command, out),
        Command::Ip(command) => run_ip(&access, command, out),
    }
}

fn run_keys(access: &AccessStore, command: KeysCommand, out: &mut dyn Write) -> Result<()> {
    match command {
        KeysCommand::List { json } => {
            let keys = access.list_keys().context("list api keys")?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&keys)?)?;
            } else {
                for key in &keys {
                    writeln!(out, "{}", key_line(key))?;
                }
            }
        }
        KeysCommand::Add {
            role,
            label,
            disabled,
            json,
        } => {
            let role = role.parse::<ApiKeyRole>()?;
            let label = label.filter(|label| !label.trim().is_empty());
            let key = access
                .issue_key(role, label.as_deref(), !disabled)
                .context("issue api key")?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&key)?)?;
            } else {
                writeln!(out, "{}", key_line(&key))?;
            }
        }
        KeysCommand::SetRole { id, role } => {
            let role = role.parse::<ApiKeyRole>()?;
            access
                .set_role(id, role)
                .with_context(|| format!("set role of key {id}"))?;
            writeln!(out, "key {id}: role {role}")?;
        }
        KeysCommand::SetLabel { id, label } => {
            let label = Some(label.trim()).filter(|label| !label.is_empty());
            access
                .set_label(id, label)
                .with_context(|| format!("set label of key {id}"))?;
            writeln!(out, "key {id}: label {}", label.unwrap_or("-"))?;
        }
        KeysCommand::Disable { id } | KeysCommand::Rm { id, hard: false } => {
            access
                .set_enabled(id, false)
                .with_context(|| format!("disable key {id}"))?;
            writeln!(out, "key {id}: disabled")?;
        }
        KeysCommand::Enable { id } => {
            access
                .set_enabled(id, true)
                .with_context(|| format!("enable key {id}"))?;
            writeln!(out, "key {id}: enabled")?;
        }
        KeysCommand::Rm { id, hard: true } => {
            access
                .delete_key(id)
                .with_context(|| format!("delete key {id}"))?;
            writeln!(out, "key {id}: deleted")?;
        }
    }
    Ok(())
}

fn run_ip(access: &AccessStore, command: IpCommand, out: &mut dyn Write) -> Result<()> {
    match command {
        IpCommand::List { list } => {
            let lists = match list.as_deref() {
                Some(raw) => vec![raw.parse::<IpList>()?],
                None => vec![IpList::Allow, IpList::Deny],
            };
            for list in lists {
                let rules = access
                    .list_ip_rules(list)
                    .with_context(|| format!("list {} rules", list.as_str()))?;
                for rule in &rules {
                    writeln!(out, "{}", rule_line(list, rule))?;
                }
            }
        }
        IpCommand::Add { cidr, list } => {
            let list = list.parse::<IpList>()?;
            let rule = access.add_ip_rule(list, &cidr)?;
            writeln!(out, "{}", rule_line(list, &rule))?;
        }
        IpCommand::Del { target } => {
            let (list, id) = parse_rule_target(&target)?;
            access
                .remove_ip_rule(list, id)
                .with_context(|| format!("remove {target}"))?;
            writeln!(out, "removed {}:{id}", list.as_str())?;
        }
    }
    Ok(())
}

fn parse_rule_target(target: &str) -> Result<(IpList, i64)> {
    let Some((list, id)) = target.split_once(':') else {
        bail!("expected allow:<id> or deny:<id>, got '{target}'");
    };
    let list = list.parse::<IpList>()?;
    let id = id
        .trim()
        .parse::<i64>()
        .with_context(|| format!("invalid rule id in '{target}'"))?;
    Ok((list, id))
}

fn format_timestamp(seconds: i64) -> String {
    DateTime::from_timestamp(seconds, 0)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| seconds.to_string())
}

fn key_line(key: &ApiKeyRecord) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        key.id,
        key.key,
        key.role,
        if key.enabled { "enabled" } else { "disabled" },
        key.label.as_deref().unwrap_or("-"),
        format_timestamp(key.created_at),
        key.last_used_at.map_or_else(|| "-".to_string(), format_timestamp),
        key.last_ip.as_deref().unwrap_or("-"),
    )
}

fn rule_line(list: IpList, rule: &IpRuleRecord) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}",
        list.as_str(),
        rule.id,
        rule.cidr,
        if rule.enabled { "enabled" } else { "disabled" },
        format_timestamp(rule.created_at),
    )
}
