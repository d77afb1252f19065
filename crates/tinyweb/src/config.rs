// src/config.rs
use crate::error::{ServerError, ServerResult};
use crate::pool::ActorModel;
use crate::syscalls::TriggerMode;
use serde::Deserialize;
use serde::de::{DeserializeOwned, IntoDeserializer, value};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "TINYWEB_";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen host (default: 0.0.0.0)
    pub host: String,

    /// Listen port (default: 9006)
    pub port: u16,

    /// Directory files are served from (default: ./root)
    pub doc_root: PathBuf,

    /// Worker threads (default: 8)
    pub workers: usize,

    /// Work queue capacity (default: 10000)
    pub max_requests: usize,

    /// Trigger mode for the listening socket
    pub listen_trigger: TriggerMode,

    /// Trigger mode for connection sockets
    pub conn_trigger: TriggerMode,

    /// Whether the loop or the workers perform socket I/O
    pub actor_model: ActorModel,

    /// Timer tick in seconds; idle connections expire after three ticks
    pub timeslot_secs: u64,

    /// Connections beyond this get "Internal server busy" (default: 65536)
    pub max_connections: usize,

    /// Graceful SO_LINGER close
    pub opt_linger: bool,

    /// JSON account file; in-memory accounts when unset
    pub credentials_path: Option<PathBuf>,

    /// Credential store handles (default: 8)
    pub store_pool_size: usize,

    /// Page served for `/` (default: /judge.html)
    pub default_page: String,

    /// Filter used when RUST_LOG is unset (default: info)
    pub log_level: String,

    /// Turn logging off entirely
    pub close_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9006,
            doc_root: PathBuf::from("./root"),
            workers: 8,
            max_requests: 10_000,
            listen_trigger: TriggerMode::Level,
            conn_trigger: TriggerMode::Level,
            actor_model: ActorModel::Proactor,
            timeslot_secs: 5,
            max_connections: 65_536,
            opt_linger: false,
            credentials_path: None,
            store_pool_size: 8,
            default_page: "/judge.html".to_string(),
            log_level: "info".to_string(),
            close_log: false,
        }
    }
}

impl Config {
    /// Load configuration from `TINYWEB_*` environment variables (with .env
    /// support). Unset variables keep their defaults.
    pub fn from_env() -> ServerResult<Self> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source, keyed by full variable name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ServerResult<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Config::default();

        if let Some(v) = var("HOST") {
            config.host = v;
        }
        set_parsed(&mut config.port, "PORT", var("PORT"))?;
        if let Some(v) = var("DOC_ROOT") {
            config.doc_root = PathBuf::from(v);
        }
        set_parsed(&mut config.workers, "WORKERS", var("WORKERS"))?;
        set_parsed(&mut config.max_requests, "MAX_REQUESTS", var("MAX_REQUESTS"))?;
        set_enum(&mut config.listen_trigger, "LISTEN_TRIGGER", var("LISTEN_TRIGGER"))?;
        set_enum(&mut config.conn_trigger, "CONN_TRIGGER", var("CONN_TRIGGER"))?;
        set_enum(&mut config.actor_model, "ACTOR_MODEL", var("ACTOR_MODEL"))?;
        set_parsed(&mut config.timeslot_secs, "TIMESLOT_SECS", var("TIMESLOT_SECS"))?;
        set_parsed(&mut config.max_connections, "MAX_CONNECTIONS", var("MAX_CONNECTIONS"))?;
        if let Some(v) = var("OPT_LINGER") {
            config.opt_linger = parse_flag(&v);
        }
        config.credentials_path = var("CREDENTIALS_PATH").map(PathBuf::from);
        set_parsed(&mut config.store_pool_size, "STORE_POOL_SIZE", var("STORE_POOL_SIZE"))?;
        if let Some(v) = var("DEFAULT_PAGE") {
            config.default_page = v;
        }
        if let Some(v) = var("LOG_LEVEL") {
            config.log_level = v;
        }
        if let Some(v) = var("CLOSE_LOG") {
            config.close_log = parse_flag(&v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        let positive = [
            ("workers", self.workers as u64),
            ("max_requests", self.max_requests as u64),
            ("timeslot_secs", self.timeslot_secs),
            ("store_pool_size", self.store_pool_size as u64),
            ("max_connections", self.max_connections as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ServerError::Config(format!("{name} must be greater than zero")));
        }
        if !self.default_page.starts_with('/') {
            return Err(ServerError::Config("default_page must start with `/`".into()));
        }
        Ok(())
    }

    pub fn timeslot(&self) -> Duration {
        Duration::from_secs(self.timeslot_secs)
    }

    /// Get the full listen address.
    pub fn server_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Apply the classic 0..=3 trigger combination: bit 1 selects edge
    /// triggering for the listener, bit 0 for connections.
    pub fn set_trigger_combo(&mut self, combo: u8) {
        let pick = |edge: bool| if edge { TriggerMode::Edge } else { TriggerMode::Level };
        self.listen_trigger = pick(combo & 0b10 != 0);
        self.conn_trigger = pick(combo & 0b01 != 0);
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v.to_lowercase().as_str(), "true" | "1" | "yes")
}

fn set_parsed<T>(slot: &mut T, name: &str, raw: Option<String>) -> ServerResult<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = raw {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| ServerError::Config(format!("{ENV_PREFIX}{name}={raw}: {e}")))?;
    }
    Ok(())
}

fn set_enum<T: DeserializeOwned>(slot: &mut T, name: &str, raw: Option<String>) -> ServerResult<()> {
    if let Some(raw) = raw {
        let lowered = raw.trim().to_lowercase();
        let de: value::StrDeserializer<'_, value::Error> = lowered.as_str().into_deserializer();
        *slot = T::deserialize(de)
            .map_err(|e| ServerError::Config(format!("{ENV_PREFIX}{name}={raw}: {e}")))?;
    }
    Ok(())
}
