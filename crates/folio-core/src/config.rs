//! Configuration module
//!
//! Queue configuration is read from the environment (a `.env` file is honoured via
//! dotenvy). The broker itself is described by a separate JSON descriptor whose
//! location is part of this configuration; the descriptor is parsed when the broker
//! starts.

use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::error::QueueError;

const DEFAULT_CONNECTOR_URI: &str = "vm://folio";
const DEFAULT_QUEUE_WORKERS: usize = 4;
const MAX_QUEUE_WORKERS: usize = 32;
const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 5;
const MAX_CONNECTIONS: u32 = 10;

/// Task queue configuration
#[derive(Clone)]
pub struct QueueConfig {
    /// URI the embedded broker is reachable under, e.g. `vm://folio`
    pub broker_connector_uri: String,
    pub broker_admin_user: String,
    pub broker_admin_password: String,
    /// Path to the JSON broker descriptor
    pub broker_descriptor_path: PathBuf,
    pub queue_workers: usize,
    /// Address for the management endpoint; disabled when unset
    pub management_addr: Option<String>,
    /// Observer notified after every status change; disabled when unset
    pub notify_url: Option<String>,
    pub notify_timeout_seconds: u64,
    /// Envelope store database; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub environment: String,
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("broker_connector_uri", &self.broker_connector_uri)
            .field("broker_admin_user", &self.broker_admin_user)
            .field("broker_admin_password", &"<redacted>")
            .field("broker_descriptor_path", &self.broker_descriptor_path)
            .field("queue_workers", &self.queue_workers)
            .field("management_addr", &self.management_addr)
            .field("notify_url", &self.notify_url)
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("environment", &self.environment)
            .finish()
    }
}

impl QueueConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, QueueError> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars<F>(var: F) -> Result<Self, QueueError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| var(key).filter(|s| !s.trim().is_empty());

        let config = QueueConfig {
            broker_connector_uri: non_empty("FOLIO_BROKER_CONNECTOR_URI")
                .unwrap_or_else(|| DEFAULT_CONNECTOR_URI.to_string()),
            broker_admin_user: non_empty("FOLIO_BROKER_ADMIN_USER").ok_or_else(|| {
                QueueError::Configuration("FOLIO_BROKER_ADMIN_USER must be set".to_string())
            })?,
            broker_admin_password: non_empty("FOLIO_BROKER_ADMIN_PASSWORD").ok_or_else(|| {
                QueueError::Configuration("FOLIO_BROKER_ADMIN_PASSWORD must be set".to_string())
            })?,
            broker_descriptor_path: non_empty("FOLIO_BROKER_DESCRIPTOR")
                .map(PathBuf::from)
                .ok_or_else(|| {
                    QueueError::Configuration("FOLIO_BROKER_DESCRIPTOR must be set".to_string())
                })?,
            queue_workers: match non_empty("FOLIO_QUEUE_WORKERS") {
                Some(raw) => raw.trim().parse().map_err(|_| {
                    QueueError::Configuration(
                        "FOLIO_QUEUE_WORKERS must be a valid number".to_string(),
                    )
                })?,
                None => DEFAULT_QUEUE_WORKERS,
            },
            management_addr: non_empty("FOLIO_MANAGEMENT_ADDR"),
            notify_url: non_empty("FOLIO_NOTIFY_URL"),
            notify_timeout_seconds: var("FOLIO_NOTIFY_TIMEOUT_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_NOTIFY_TIMEOUT_SECS),
            database_url: non_empty("DATABASE_URL"),
            db_max_connections: var("DB_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(MAX_CONNECTIONS),
            environment: var("ENVIRONMENT")
                .or_else(|| var("APP_ENV"))
                .unwrap_or_else(|| "development".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.broker_admin_user.trim().is_empty() || self.broker_admin_password.is_empty() {
            return Err(QueueError::Configuration(
                "broker admin credentials must not be empty".to_string(),
            ));
        }

        if self.broker_name().is_none() {
            return Err(QueueError::Configuration(format!(
                "FOLIO_BROKER_CONNECTOR_URI must look like vm://<broker-name>, got '{}'",
                self.broker_connector_uri
            )));
        }

        if self.queue_workers == 0 || self.queue_workers > MAX_QUEUE_WORKERS {
            return Err(QueueError::Configuration(format!(
                "FOLIO_QUEUE_WORKERS must be between 1 and {}",
                MAX_QUEUE_WORKERS
            )));
        }

        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(QueueError::Configuration(
                    "DATABASE_URL must be a valid PostgreSQL connection string".to_string(),
                ));
            }
        }

        if self.is_production() && self.broker_admin_password.len() < 12 {
            return Err(QueueError::Configuration(
                "FOLIO_BROKER_ADMIN_PASSWORD must be at least 12 characters in production"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Broker name addressed by the connector URI (`vm://<name>`).
    pub fn broker_name(&self) -> Option<&str> {
        self.broker_connector_uri
            .strip_prefix("vm://")
            .map(|rest| rest.split(['?', '/']).next().unwrap_or(rest))
            .filter(|name| !name.is_empty())
    }

    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }
}
