//! Engine configuration.
//!
//! Layered: built-in defaults, then `local_settings` rows in category
//! `sync`, then `POS_SYNC_*` environment variables. The API key is never
//! stored in SQLite; it comes from `POS_SYNC_API_KEY` or the OS keyring.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::db;
use crate::error::{Result, SyncError};
use crate::outbox::RetryPolicy;
use crate::storage;

/// `local_settings` category holding engine settings.
pub const SETTINGS_CATEGORY: &str = "sync";

const ENV_PREFIX: &str = "POS_SYNC_";

/// Setting keys, shared by `local_settings` and the environment.
const KEYS: &[&str] = &[
    "remote_url",
    "organization_id",
    "drain_interval_secs",
    "remote_timeout_secs",
    "debounce_ms",
    "probe_interval_secs",
    "base_retry_delay_ms",
    "max_retry_delay_ms",
    "max_rejections",
];

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub remote_url: String,
    pub organization_id: String,
    #[serde(skip)]
    pub api_key: Option<Zeroizing<String>>,
    pub data_dir: PathBuf,
    pub drain_interval_secs: u64,
    pub remote_timeout_secs: u64,
    pub debounce_ms: u64,
    pub probe_interval_secs: u64,
    pub base_retry_delay_ms: i64,
    pub max_retry_delay_ms: i64,
    pub max_rejections: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            remote_url: String::new(),
            organization_id: String::new(),
            api_key: None,
            data_dir: PathBuf::from("."),
            drain_interval_secs: 15,
            remote_timeout_secs: 10,
            debounce_ms: 1_500,
            probe_interval_secs: 30,
            base_retry_delay_ms: retry.base_delay_ms,
            max_retry_delay_ms: retry.max_delay_ms,
            max_rejections: retry.max_rejections,
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("remote_url", &self.remote_url)
            .field("organization_id", &self.organization_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("data_dir", &self.data_dir)
            .field("drain_interval_secs", &self.drain_interval_secs)
            .field("remote_timeout_secs", &self.remote_timeout_secs)
            .field("debounce_ms", &self.debounce_ms)
            .field("probe_interval_secs", &self.probe_interval_secs)
            .field("base_retry_delay_ms", &self.base_retry_delay_ms)
            .field("max_retry_delay_ms", &self.max_retry_delay_ms)
            .field("max_rejections", &self.max_rejections)
            .finish()
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("invalid value for {key}: {value:?}")))
}

impl SyncConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load the full layered configuration for a data directory.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let db = db::init(data_dir)?;
        let conn = db.conn.lock()?;
        let mut config = Self::with_data_dir(data_dir);
        config.apply_settings(&conn)?;
        config.apply_env()?;
        if config.api_key.is_none() {
            config.api_key = storage::api_key();
        }
        config.validate()?;
        info!(
            organization_id = %config.organization_id,
            remote_url = %config.remote_url,
            "Sync configuration loaded"
        );
        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "remote_url" => self.remote_url = value.trim().to_string(),
            "organization_id" => self.organization_id = value.trim().to_string(),
            "drain_interval_secs" => self.drain_interval_secs = parse(key, value)?,
            "remote_timeout_secs" => self.remote_timeout_secs = parse(key, value)?,
            "debounce_ms" => self.debounce_ms = parse(key, value)?,
            "probe_interval_secs" => self.probe_interval_secs = parse(key, value)?,
            "base_retry_delay_ms" => self.base_retry_delay_ms = parse(key, value)?,
            "max_retry_delay_ms" => self.max_retry_delay_ms = parse(key, value)?,
            "max_rejections" => self.max_rejections = parse(key, value)?,
            other => return Err(SyncError::Config(format!("unknown setting {other}"))),
        }
        Ok(())
    }

    /// Overlay settings stored in `local_settings`.
    pub fn apply_settings(&mut self, conn: &Connection) -> Result<()> {
        for key in KEYS {
            if let Some(value) = db::get_setting(conn, SETTINGS_CATEGORY, key)? {
                self.set(key, &value)?;
            }
        }
        Ok(())
    }

    /// Overlay `POS_SYNC_*` environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        for key in KEYS {
            let var = format!("{ENV_PREFIX}{}", key.to_uppercase());
            if let Ok(value) = std::env::var(&var) {
                debug!(var, "Config override from environment");
                self.set(key, &value)?;
            }
        }
        if let Ok(api_key) = std::env::var(format!("{ENV_PREFIX}API_KEY")) {
            if !api_key.trim().is_empty() {
                self.api_key = Some(Zeroizing::new(api_key.trim().to_string()));
            }
        }
        Ok(())
    }

    /// Persist the non-secret settings so the next start picks them up.
    pub fn save_settings(&self, conn: &Connection) -> Result<()> {
        let values = [
            ("remote_url", self.remote_url.clone()),
            ("organization_id", self.organization_id.clone()),
            ("drain_interval_secs", self.drain_interval_secs.to_string()),
            ("remote_timeout_secs", self.remote_timeout_secs.to_string()),
            ("debounce_ms", self.debounce_ms.to_string()),
            ("probe_interval_secs", self.probe_interval_secs.to_string()),
            ("base_retry_delay_ms", self.base_retry_delay_ms.to_string()),
            ("max_retry_delay_ms", self.max_retry_delay_ms.to_string()),
            ("max_rejections", self.max_rejections.to_string()),
        ];
        for (key, value) in values {
            db::set_setting(conn, SETTINGS_CATEGORY, key, &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.organization_id.is_empty() {
            return Err(SyncError::Config("organization id is not configured".into()));
        }
        if self.remote_url.is_empty() {
            return Err(SyncError::Config("remote URL is not configured".into()));
        }
        if self.drain_interval_secs == 0 || self.remote_timeout_secs == 0 {
            return Err(SyncError::Config(
                "drain interval and remote timeout must be positive".into(),
            ));
        }
        if self.base_retry_delay_ms <= 0 || self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(SyncError::Config(
                "retry delays must be positive with max >= base".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.base_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            max_rejections: self.max_rejections,
        }
    }

    /// Rolling log files live next to the database.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

/// Remove every stored engine setting (terminal reset).
pub fn clear_settings(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![SETTINGS_CATEGORY],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(format!("{ENV_PREFIX}{}", key.to_uppercase()));
        }
        std::env::remove_var(format!("{ENV_PREFIX}API_KEY"));
    }

    #[test]
    #[serial]
    fn settings_then_environment_override_defaults() {
        clear_env();
        let db = db::open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, "organization_id", "org-7").unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, "remote_url", "db.example.com").unwrap();
        db::set_setting(&conn, SETTINGS_CATEGORY, "max_rejections", "3").unwrap();
        std::env::set_var("POS_SYNC_MAX_REJECTIONS", "5");
        std::env::set_var("POS_SYNC_API_KEY", " secret ");

        let mut config = SyncConfig::with_data_dir("/tmp/pos");
        config.apply_settings(&conn).unwrap();
        config.apply_env().unwrap();
        clear_env();

        assert_eq!(config.organization_id, "org-7");
        assert_eq!(config.max_rejections, 5);
        assert_eq!(config.drain_interval_secs, 15);
        assert_eq!(config.api_key.as_deref().map(String::as_str), Some("secret"));
        assert_eq!(config.retry_policy().max_rejections, 5);
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn malformed_values_are_config_errors() {
        clear_env();
        std::env::set_var("POS_SYNC_DEBOUNCE_MS", "soon");
        let result = SyncConfig::default().apply_env();
        clear_env();
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn missing_organization_fails_validation() {
        let config = SyncConfig {
            remote_url: "https://db.example.com".into(),
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn saved_settings_round_trip_and_clear() {
        let db = db::open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        let config = SyncConfig {
            remote_url: "https://db.example.com".into(),
            organization_id: "org-1".into(),
            drain_interval_secs: 42,
            ..SyncConfig::default()
        };
        config.save_settings(&conn).unwrap();

        let mut loaded = SyncConfig::default();
        loaded.apply_settings(&conn).unwrap();
        assert_eq!(loaded.drain_interval_secs, 42);
        assert_eq!(loaded.organization_id, "org-1");

        assert_eq!(clear_settings(&conn).unwrap(), KEYS.len());
    }

    #[test]
    fn logs_are_kept_under_the_data_dir() {
        let config = SyncConfig::with_data_dir("/var/lib/pos");
        assert_eq!(config.log_dir(), Path::new("/var/lib/pos").join("logs"));
    }

    #[test]
    fn debug_output_hides_api_key() {
        let config = SyncConfig {
            api_key: Some(Zeroizing::new("super-secret".into())),
            ..SyncConfig::default()
        };
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
