//! Agent configuration.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fieldsync_core::parse_utc;
use fieldsync_proto::WireFormat;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// This site's identifier
    pub site_id: String,

    /// This device's identifier
    pub device_id: Option<String>,

    /// Persistence configuration
    pub persistence: PersistenceConfig,

    /// Exchange configuration
    pub exchange: ExchangeConfig,
}

/// Backing store selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// `SQLite` database at `db_path`
    Sqlite,
    /// Process memory; state is lost on exit
    Memory,
}

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Store type
    pub store: StoreKind,

    /// Database path (for `SQLite`)
    pub db_path: PathBuf,
}

/// Envelope exchange configuration.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Directory scanned for incoming envelopes
    pub inbox_dir: PathBuf,

    /// Directory receiving exported envelopes
    pub outbox_dir: PathBuf,

    /// Time between sync passes
    pub interval: Duration,

    /// Encoding of exported envelopes
    pub wire_format: WireFormat,

    /// Export watermark used when none is persisted
    pub export_since: Option<DateTime<Utc>>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            site_id: "local".to_string(),
            device_id: None,
            persistence: PersistenceConfig {
                store: StoreKind::Sqlite,
                db_path: PathBuf::from("./fieldsync.db"),
            },
            exchange: ExchangeConfig {
                inbox_dir: PathBuf::from("./inbox"),
                outbox_dir: PathBuf::from("./outbox"),
                interval: Duration::from_secs(30),
                wire_format: WireFormat::Json,
                export_since: None,
            },
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FIELDSYNC_SITE_ID`: Site identifier (default `local`)
    /// - `FIELDSYNC_DEVICE_ID`: Device identifier
    /// - `FIELDSYNC_STORE`: `sqlite` or `memory`
    /// - `FIELDSYNC_DB_PATH`: `SQLite` database path
    /// - `FIELDSYNC_INBOX_DIR`: Incoming envelope directory
    /// - `FIELDSYNC_OUTBOX_DIR`: Outgoing envelope directory
    /// - `FIELDSYNC_SYNC_INTERVAL_SECS`: Seconds between sync passes
    /// - `FIELDSYNC_WIRE_FORMAT`: `json` or `cbor`
    /// - `FIELDSYNC_EXPORT_SINCE`: Initial export watermark, RFC 3339 UTC
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(site) = lookup("FIELDSYNC_SITE_ID") {
            if site.trim().is_empty() {
                bail!("FIELDSYNC_SITE_ID must not be blank");
            }
            config.site_id = site;
        }

        config.device_id = lookup("FIELDSYNC_DEVICE_ID").filter(|d| !d.trim().is_empty());

        if let Some(store) = lookup("FIELDSYNC_STORE") {
            config.persistence.store = match store.trim().to_ascii_lowercase().as_str() {
                "sqlite" => StoreKind::Sqlite,
                "memory" => StoreKind::Memory,
                other => bail!("Invalid FIELDSYNC_STORE: {other} (expected sqlite or memory)"),
            };
        }

        if let Some(db_path) = lookup("FIELDSYNC_DB_PATH") {
            config.persistence.db_path = PathBuf::from(db_path);
        }

        if let Some(dir) = lookup("FIELDSYNC_INBOX_DIR") {
            config.exchange.inbox_dir = PathBuf::from(dir);
        }

        if let Some(dir) = lookup("FIELDSYNC_OUTBOX_DIR") {
            config.exchange.outbox_dir = PathBuf::from(dir);
        }

        if let Some(secs) = lookup("FIELDSYNC_SYNC_INTERVAL_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .context("Invalid FIELDSYNC_SYNC_INTERVAL_SECS")?;
            if secs == 0 {
                bail!("FIELDSYNC_SYNC_INTERVAL_SECS must be positive");
            }
            config.exchange.interval = Duration::from_secs(secs);
        }

        if let Some(format) = lookup("FIELDSYNC_WIRE_FORMAT") {
            config.exchange.wire_format = format.parse().context("Invalid FIELDSYNC_WIRE_FORMAT")?;
        }

        if let Some(since) = lookup("FIELDSYNC_EXPORT_SINCE") {
            config.exchange.export_since =
                Some(parse_utc(&since).context("Invalid FIELDSYNC_EXPORT_SINCE")?);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AgentConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        AgentConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = load(&[]).unwrap();
        assert_eq!(config.site_id, "local");
        assert_eq!(config.persistence.store, StoreKind::Sqlite);
        assert_eq!(config.exchange.wire_format, WireFormat::Json);
        assert_eq!(config.exchange.interval, Duration::from_secs(30));
    }

    #[test]
    fn reads_every_variable() {
        let config = load(&[
            ("FIELDSYNC_SITE_ID", "depot-4"),
            ("FIELDSYNC_DEVICE_ID", "rugged-1"),
            ("FIELDSYNC_STORE", "Memory"),
            ("FIELDSYNC_DB_PATH", "/var/lib/fieldsync/site.db"),
            ("FIELDSYNC_INBOX_DIR", "/srv/in"),
            ("FIELDSYNC_OUTBOX_DIR", "/srv/out"),
            ("FIELDSYNC_SYNC_INTERVAL_SECS", "5"),
            ("FIELDSYNC_WIRE_FORMAT", "cbor"),
            ("FIELDSYNC_EXPORT_SINCE", "2024-02-01T00:00:00Z"),
        ])
        .unwrap();

        assert_eq!(config.site_id, "depot-4");
        assert_eq!(config.device_id.as_deref(), Some("rugged-1"));
        assert_eq!(config.persistence.store, StoreKind::Memory);
        assert_eq!(config.exchange.inbox_dir, PathBuf::from("/srv/in"));
        assert_eq!(config.exchange.interval, Duration::from_secs(5));
        assert_eq!(config.exchange.wire_format, WireFormat::Cbor);
        assert!(config.exchange.export_since.is_some());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(load(&[("FIELDSYNC_STORE", "postgres")]).is_err());
        assert!(load(&[("FIELDSYNC_SYNC_INTERVAL_SECS", "soon")]).is_err());
        assert!(load(&[("FIELDSYNC_SYNC_INTERVAL_SECS", "0")]).is_err());
        assert!(load(&[("FIELDSYNC_WIRE_FORMAT", "xml")]).is_err());
        assert!(load(&[("FIELDSYNC_SITE_ID", "  ")]).is_err());
    }

    #[test]
    fn export_watermark_must_be_utc() {
        assert!(load(&[("FIELDSYNC_EXPORT_SINCE", "2024-02-01T00:00:00+01:00")]).is_err());
    }
}
