//! Server configuration, read from the environment.
//!
//! [`ServerConfig::from_env`] loads a `.env` file if one exists, then reads
//! `VIGIL_*` variables, falling back to a default for anything unset. A
//! variable that is set but unparsable is an error, never silently
//! replaced by its default.
//!
//! Each layer keeps its own plain config struct; this module only knows
//! how to build them from one flat set of variables.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use vigil_hub::HubConfig;
use vigil_session::{MAX_TOKEN_TTL, SessionConfig};
use vigil_telemetry::{PublisherConfig, TickConfig};
use vigil_transport::TransportConfig;

use crate::handler::HandlerConfig;

/// Used when `VIGIL_JWT_SECRET` is unset. Fine on a laptop, nowhere else.
const DEV_JWT_SECRET: &str = "vigil-development-secret-change-me";

/// Secrets shorter than this get a startup warning.
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Inconsistent(String),
}

/// Credentials for the account created at startup.
#[derive(Clone)]
pub struct AdminAccount {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AdminAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminAccount")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// REST surface (`/auth/*`, `/notifications`, `/health`).
    pub http_addr: String,
    /// WebSocket listener.
    pub realtime_addr: String,
    pub realtime_path: String,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub session_ttl: Duration,
    pub session_sweep_interval: Duration,
    /// Heartbeat ping interval (`T_ping`).
    pub ping_interval: Duration,
    /// Silence allowed before a connection is dropped (`T_pong`).
    /// Must exceed `ping_interval`.
    pub pong_timeout: Duration,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Per-connection outbound queue bound.
    pub queue_capacity: usize,
    pub telemetry_interval: Duration,
    /// Random delay (below this) before the first telemetry sample.
    pub telemetry_jitter: Duration,
    pub announce_presence: bool,
    pub admin: Option<AdminAccount>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8080".to_string(),
            realtime_addr: "127.0.0.1:8081".to_string(),
            realtime_path: "/realtime".to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_issuer: "vigil".to_string(),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            session_sweep_interval: Duration::from_secs(300),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            queue_capacity: 256,
            telemetry_interval: Duration::from_millis(5000),
            telemetry_jitter: Duration::ZERO,
            announce_presence: true,
            admin: None,
        }
    }
}

impl ServerConfig {
    /// Loads `.env` (if present) and reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let vars = Vars(&lookup);

        let jwt_secret = match vars.get("VIGIL_JWT_SECRET") {
            Some(secret) => {
                if secret.len() < MIN_SECRET_LEN {
                    tracing::warn!(
                        len = secret.len(),
                        "VIGIL_JWT_SECRET is shorter than {MIN_SECRET_LEN} bytes"
                    );
                }
                secret
            }
            None => {
                tracing::warn!("VIGIL_JWT_SECRET not set, using the development secret");
                defaults.jwt_secret
            }
        };

        let admin = match (
            vars.get("VIGIL_ADMIN_USERNAME"),
            vars.get("VIGIL_ADMIN_PASSWORD"),
        ) {
            (Some(username), Some(password)) => Some(AdminAccount { username, password }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::Inconsistent(
                    "VIGIL_ADMIN_USERNAME and VIGIL_ADMIN_PASSWORD must be set together".into(),
                ));
            }
        };

        let config = Self {
            http_addr: vars.get("VIGIL_HTTP_ADDR").unwrap_or(defaults.http_addr),
            realtime_addr: vars.get("VIGIL_REALTIME_ADDR").unwrap_or(defaults.realtime_addr),
            realtime_path: vars.get("VIGIL_REALTIME_PATH").unwrap_or(defaults.realtime_path),
            jwt_secret,
            jwt_issuer: vars.get("VIGIL_JWT_ISSUER").unwrap_or(defaults.jwt_issuer),
            session_ttl: vars.secs("VIGIL_SESSION_TTL_SECS", defaults.session_ttl)?,
            session_sweep_interval: vars
                .secs("VIGIL_SESSION_SWEEP_SECS", defaults.session_sweep_interval)?,
            ping_interval: vars.secs("VIGIL_PING_INTERVAL_SECS", defaults.ping_interval)?,
            pong_timeout: vars.secs("VIGIL_PONG_TIMEOUT_SECS", defaults.pong_timeout)?,
            write_timeout: vars.secs("VIGIL_WRITE_TIMEOUT_SECS", defaults.write_timeout)?,
            handshake_timeout: vars
                .secs("VIGIL_HANDSHAKE_TIMEOUT_SECS", defaults.handshake_timeout)?,
            queue_capacity: vars.parse("VIGIL_QUEUE_CAPACITY", defaults.queue_capacity)?,
            telemetry_interval: vars
                .millis("VIGIL_TELEMETRY_INTERVAL_MS", defaults.telemetry_interval)?,
            telemetry_jitter: Duration::from_millis(vars.parse(
                "VIGIL_TELEMETRY_JITTER_MS",
                defaults.telemetry_jitter.as_millis() as u64,
            )?),
            announce_presence: vars.flag("VIGIL_ANNOUNCE_PRESENCE", defaults.announce_presence)?,
            admin,
        };
        config.check()
    }

    /// Rejects combinations that can't work together.
    pub fn check(self) -> Result<Self, ConfigError> {
        if !self.realtime_path.starts_with('/') {
            return Err(ConfigError::Inconsistent(format!(
                "VIGIL_REALTIME_PATH must start with '/', got {:?}",
                self.realtime_path
            )));
        }
        if self.pong_timeout <= self.ping_interval {
            return Err(ConfigError::Inconsistent(format!(
                "pong timeout ({:?}) must exceed ping interval ({:?})",
                self.pong_timeout, self.ping_interval
            )));
        }
        if self.session_ttl > MAX_TOKEN_TTL {
            return Err(ConfigError::Inconsistent(format!(
                "session ttl ({}s) must not exceed {}s",
                self.session_ttl.as_secs(),
                MAX_TOKEN_TTL.as_secs()
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "VIGIL_QUEUE_CAPACITY must be at least 1".into(),
            ));
        }
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::Inconsistent(
                "VIGIL_JWT_SECRET must not be empty".into(),
            ));
        }
        Ok(self)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            token_ttl: self.session_ttl,
            issuer: self.jwt_issuer.clone(),
            sweep_interval: self.session_sweep_interval,
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue_capacity,
            announce_presence: self.announce_presence,
            ..HubConfig::default()
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            tick: TickConfig {
                interval: self.telemetry_interval,
                initial_jitter: self.telemetry_jitter,
            },
            ..PublisherConfig::default()
        }
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
            write_timeout: self.write_timeout,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            path: self.realtime_path.clone(),
            handshake_timeout: self.handshake_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Variable parsing
// ---------------------------------------------------------------------------

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    /// Unset and blank are the same thing.
    fn get(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(var) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: raw,
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let secs = self.parse(var, default.as_secs())?;
        positive(var, Duration::from_secs(secs))
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let ms = self.parse(var, default.as_millis() as u64)?;
        positive(var, Duration::from_millis(ms))
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        let Some(raw) = self.get(var) else {
            return Ok(default);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value: raw,
                reason: "expected true or false".into(),
            }),
        }
    }
}

fn positive(var: &'static str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        Err(ConfigError::Invalid {
            var,
            value: "0".into(),
            reason: "must be greater than zero".into(),
        })
    } else {
        Ok(value)
    }
}
