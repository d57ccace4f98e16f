//! Fabric configuration — a small enumerated environment set.
//!
//! Everything the runtime reads from the process environment, read once
//! at connector startup:
//!
//!   WEFT_NATS            broker URL; empty = in-process only
//!   WEFT_NATS_USER       broker username
//!   WEFT_NATS_PASSWORD   broker password
//!   WEFT_NATS_TOKEN      broker token auth
//!   WEFT_NATS_CA         CA certificate path
//!   WEFT_NATS_CERT       client certificate path
//!   WEFT_NATS_KEY        client key path
//!   WEFT_DEPLOYMENT      PROD | LAB | LOCAL | TESTING
//!   WEFT_PLANE           subject isolation namespace
//!   WEFT_LOG_DEBUG       enable debug logging ("1"/"true")
//!   WEFT_OTEL_ENDPOINT   OTLP collector endpoint (surfaced, not wired)
//!   WEFT_OTEL_PROTOCOL   OTLP protocol hint
//!   WEFT_SHORT_CIRCUIT   in-process fast path ("1"/"true", default on)
//!   WEFT_LOCALITY        locality hint for routing

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::subject;

/// Deployment label — gates what the runtime is willing to do (clock
/// shifts are ignored in PROD).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Deployment {
    Prod,
    Lab,
    #[default]
    Local,
    Testing,
}

impl Deployment {
    pub fn parse(s: &str) -> Result<Deployment> {
        match s.to_uppercase().as_str() {
            "PROD" => Ok(Deployment::Prod),
            "LAB" => Ok(Deployment::Lab),
            "LOCAL" => Ok(Deployment::Local),
            "TESTING" => Ok(Deployment::Testing),
            other => Err(Error::bad_request(format!("unknown deployment '{other}'"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Deployment::Prod => "PROD",
            Deployment::Lab => "LAB",
            Deployment::Local => "LOCAL",
            Deployment::Testing => "TESTING",
        }
    }
}

/// Top-level fabric configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Broker URL. Empty with short-circuit on = fully in-process.
    pub nats_url: String,
    pub nats_user: String,
    pub nats_password: String,
    pub nats_token: String,
    pub nats_ca: String,
    pub nats_cert: String,
    pub nats_key: String,
    pub deployment: Deployment,
    /// Subject isolation namespace shared by cooperating services.
    pub plane: String,
    pub log_debug: bool,
    pub otel_endpoint: String,
    pub otel_protocol: String,
    /// In-process delivery via the subject trie, bypassing the broker.
    pub short_circuit: bool,
    /// Locality hint stamped on outbound requests.
    pub locality: String,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            nats_url: String::new(),
            nats_user: String::new(),
            nats_password: String::new(),
            nats_token: String::new(),
            nats_ca: String::new(),
            nats_cert: String::new(),
            nats_key: String::new(),
            deployment: Deployment::Local,
            plane: "weft".to_string(),
            log_debug: false,
            otel_endpoint: String::new(),
            otel_protocol: String::new(),
            short_circuit: true,
            locality: String::new(),
        }
    }
}

impl FabricConfig {
    /// Read the enumerated environment set. Unset variables keep their
    /// defaults; the deployment defaults to PROD when a broker URL is
    /// present and LOCAL when not.
    pub fn from_env() -> Result<FabricConfig> {
        let mut cfg = FabricConfig {
            nats_url: env("WEFT_NATS"),
            nats_user: env("WEFT_NATS_USER"),
            nats_password: env("WEFT_NATS_PASSWORD"),
            nats_token: env("WEFT_NATS_TOKEN"),
            nats_ca: env("WEFT_NATS_CA"),
            nats_cert: env("WEFT_NATS_CERT"),
            nats_key: env("WEFT_NATS_KEY"),
            otel_endpoint: env("WEFT_OTEL_ENDPOINT"),
            otel_protocol: env("WEFT_OTEL_PROTOCOL"),
            locality: env("WEFT_LOCALITY"),
            ..FabricConfig::default()
        };

        let plane = env("WEFT_PLANE");
        if !plane.is_empty() {
            cfg.plane = plane;
        }
        cfg.log_debug = flag(&env("WEFT_LOG_DEBUG"), false);
        cfg.short_circuit = flag(&env("WEFT_SHORT_CIRCUIT"), true);

        let deployment = env("WEFT_DEPLOYMENT");
        cfg.deployment = if deployment.is_empty() {
            if cfg.nats_url.is_empty() {
                Deployment::Local
            } else {
                Deployment::Prod
            }
        } else {
            Deployment::parse(&deployment)?
        };

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        subject::validate_plane(&self.plane)?;
        if self.nats_url.is_empty() && !self.short_circuit {
            return Err(Error::bad_request(
                "no broker URL and short-circuit disabled: nothing can move",
            ));
        }
        Ok(())
    }
}

fn env(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn flag(raw: &str, default: bool) -> bool {
    match raw.to_lowercase().as_str() {
        "" => default,
        "1" | "true" | "yes" | "on" => true,
        _ => false,
    }
}
