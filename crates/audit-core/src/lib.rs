use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_SCHEME: &str = "https";

pub const RECORD_KIND_VISIT: &str = "visit";
pub const RECORD_KIND_CAPTURE: &str = "capture";

pub const AUDITOR_ENV_PROXY: &str = "AUDITOR_PROXY";
pub const AUDITOR_ENV_WEBDRIVER_URL: &str = "AUDITOR_WEBDRIVER_URL";
pub const AUDITOR_ENV_PUSHOVER_USER: &str = "AUDITOR_PUSHOVER_USER";
pub const AUDITOR_ENV_PUSHOVER_TOKEN: &str = "AUDITOR_PUSHOVER_TOKEN";

const SNAPSHOT_REF_PREFIX: &str = "snapshot://sha256/";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("experiment interrupted")]
    Interrupted,
    #[error("browser session for {identity} already released")]
    SessionReleased { identity: String },
    #[error("location {0} has no scrape catalog")]
    UnknownLocation(String),
    #[error("webdriver {code}: {message}")]
    WebDriver { code: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Champaign,
    Chicago,
    Sacramento,
    Atlanta,
}

impl Location {
    pub const ALL: [Location; 4] = [
        Location::Champaign,
        Location::Chicago,
        Location::Sacramento,
        Location::Atlanta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Champaign => "champaign",
            Location::Chicago => "chicago",
            Location::Sacramento => "sacramento",
            Location::Atlanta => "atlanta",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Location {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let wanted = raw.trim().to_ascii_lowercase();
        Location::ALL
            .into_iter()
            .find(|loc| loc.as_str() == wanted)
            .ok_or_else(|| anyhow!(AuditError::UnknownLocation(raw.to_string())))
    }
}

/// Network proxy handed to every browser session of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    /// Parses `host:port`.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (host, port) = trimmed
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("proxy must be host:port (got: {})", raw))?;
        if host.is_empty() {
            return Err(anyhow!("proxy host must not be empty (got: {})", raw));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| anyhow!("proxy port must be a number (got: {})", raw))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How long an agent idles after a step. `Fixed` is whole seconds; `Normal`
/// draws `|trunc(N(mean, stddev))|` seconds each time it is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DelaySpec {
    Fixed(u64),
    Normal { mean: f64, stddev: f64 },
}

impl Default for DelaySpec {
    fn default() -> Self {
        DelaySpec::Fixed(20)
    }
}

impl DelaySpec {
    /// Rejects a distribution that cannot produce a meaningful delay.
    pub fn validate(&self) -> Result<()> {
        match *self {
            DelaySpec::Fixed(_) => Ok(()),
            DelaySpec::Normal { mean, stddev } => check_normal(mean, stddev),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Duration> {
        match *self {
            DelaySpec::Fixed(seconds) => Ok(Duration::from_secs(seconds)),
            DelaySpec::Normal { mean, stddev } => {
                Ok(Duration::from_secs(pos_int_norm(rng, mean, stddev)?))
            }
        }
    }
}

fn check_normal(mean: f64, stddev: f64) -> Result<()> {
    if !mean.is_finite() || !stddev.is_finite() || stddev < 0.0 {
        return Err(anyhow!(
            "invalid delay distribution N({}, {}): mean must be finite and stddev finite and >= 0",
            mean,
            stddev
        ));
    }
    Ok(())
}

pub fn pos_int_norm<R: Rng + ?Sized>(rng: &mut R, mean: f64, stddev: f64) -> Result<u64> {
    check_normal(mean, stddev)?;
    let normal = Normal::new(mean, stddev)
        .map_err(|e| anyhow!("invalid delay distribution N({}, {}): {}", mean, stddev, e))?;
    let drawn: f64 = normal.sample(rng);
    Ok(drawn.trunc().abs() as u64)
}

/// One row of collected data. Records pass through the writer queue untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub block: usize,
    pub agent: String,
    pub step: String,
    pub kind: String,
    pub target: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(
        block: usize,
        agent: impl Into<String>,
        step: impl Into<String>,
        kind: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            block,
            agent: agent.into(),
            step: step.into(),
            kind: kind.into(),
            target: target.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }
}

/// Turns a configured target into an absolute address, defaulting to https
/// when the target carries no scheme.
pub fn normalize_address(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("empty address"));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", DEFAULT_SCHEME, trimmed.trim_start_matches('/'))
    };
    Url::parse(&candidate).map_err(|e| anyhow!("invalid address {}: {}", raw, e))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Content-addressed page snapshots, one blob per distinct digest.
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn put_bytes(&self, bytes: &[u8]) -> Result<String> {
        let digest = sha256_bytes(bytes);
        let hex = digest.strip_prefix("sha256:").unwrap_or("unknown");
        let dir = self.root.join("sha256").join(hex);
        ensure_dir(&dir)?;
        let path = dir.join("blob");
        if !path.exists() {
            fs::write(&path, bytes)?;
        }
        Ok(format!("{}{}", SNAPSHOT_REF_PREFIX, hex))
    }

    pub fn read_ref(&self, snapshot_ref: &str) -> Result<Vec<u8>> {
        let hex = snapshot_ref
            .strip_prefix(SNAPSHOT_REF_PREFIX)
            .ok_or_else(|| anyhow!("invalid snapshot ref: {}", snapshot_ref))?;
        let path = self.root.join("sha256").join(hex).join("blob");
        Ok(fs::read(path)?)
    }
}
