use crate::catalog::StepCatalog;
use crate::connectivity::DEFAULT_CONNECTIVITY_URL;
use crate::scheduler::SchedulerSettings;
use crate::treatment::{RosterStrategy, TreatmentTable};
use crate::webdriver::DEFAULT_WEBDRIVER_URL;
use anyhow::{anyhow, Context, Result};
use audit_core::{
    Location, ProxyConfig, SnapshotStore, AUDITOR_ENV_PROXY, AUDITOR_ENV_PUSHOVER_TOKEN,
    AUDITOR_ENV_PUSHOVER_USER, AUDITOR_ENV_WEBDRIVER_URL,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushoverCredentials {
    pub user: String,
    pub token: String,
}

/// Everything one invocation needs, fixed before the first block starts.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub location: Location,
    /// Roster repetitions per block.
    pub agents: usize,
    pub blocks: usize,
    pub output: PathBuf,
    pub debug: bool,
    pub roster: RosterStrategy,
    pub catalog_file: Option<PathBuf>,
    pub treatments_file: Option<PathBuf>,
    pub webdriver_url: String,
    pub headless: bool,
    pub retry_budget: Option<usize>,
    pub snapshot_dir: Option<PathBuf>,
    pub proxy: Option<ProxyConfig>,
    pub pushover: Option<PushoverCredentials>,
    /// `None` skips the connectivity probe entirely.
    pub connectivity_url: Option<String>,
    pub seed: Option<u64>,
}

impl ExperimentConfig {
    pub fn new(location: Location, output: PathBuf) -> Self {
        Self {
            location,
            agents: 1,
            blocks: 1,
            output,
            debug: false,
            roster: RosterStrategy::default(),
            catalog_file: None,
            treatments_file: None,
            webdriver_url: DEFAULT_WEBDRIVER_URL.to_string(),
            headless: false,
            retry_budget: None,
            snapshot_dir: None,
            proxy: None,
            pushover: None,
            connectivity_url: Some(DEFAULT_CONNECTIVITY_URL.to_string()),
            seed: None,
        }
    }

    /// Fills proxy, WebDriver endpoint and push credentials from the
    /// environment where the caller left them unset.
    pub fn with_env_defaults(mut self) -> Result<Self> {
        if self.proxy.is_none() {
            self.proxy = parse_optional_env(AUDITOR_ENV_PROXY)?
                .map(|raw| ProxyConfig::parse(&raw))
                .transpose()
                .with_context(|| format!("invalid {}", AUDITOR_ENV_PROXY))?;
        }
        if let Some(url) = parse_optional_env(AUDITOR_ENV_WEBDRIVER_URL)? {
            if self.webdriver_url == DEFAULT_WEBDRIVER_URL {
                self.webdriver_url = url;
            }
        }
        if self.pushover.is_none() {
            self.pushover = pushover_credentials(
                parse_optional_env(AUDITOR_ENV_PUSHOVER_USER)?,
                parse_optional_env(AUDITOR_ENV_PUSHOVER_TOKEN)?,
            )?;
        }
        Ok(self)
    }

    pub fn load_catalog(&self) -> Result<StepCatalog> {
        let catalog = match &self.catalog_file {
            Some(path) => StepCatalog::load(path)?,
            None => StepCatalog::builtin()?,
        };
        let snapshots = self
            .snapshot_dir
            .as_ref()
            .map(|dir| Arc::new(SnapshotStore::new(dir)));
        Ok(catalog.with_snapshots(snapshots))
    }

    pub fn load_treatments(&self) -> Result<TreatmentTable> {
        match &self.treatments_file {
            Some(path) => TreatmentTable::load(path),
            None => TreatmentTable::builtin(),
        }
    }

    pub fn validate(&self, catalog: &StepCatalog, treatments: &TreatmentTable) -> Result<()> {
        if self.agents == 0 {
            return Err(anyhow!("agents must be > 0"));
        }
        if self.blocks == 0 {
            return Err(anyhow!("blocks must be > 0"));
        }
        if self.retry_budget == Some(0) {
            return Err(anyhow!("retry budget must be > 0 when set"));
        }
        if self.output.as_os_str().is_empty() {
            return Err(anyhow!("output path must not be empty"));
        }
        if self.webdriver_url.trim().is_empty() {
            return Err(anyhow!("webdriver endpoint must not be empty"));
        }
        catalog.specs(self.location)?;
        treatments.validate_roster(self.roster)?;
        Ok(())
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            location: self.location,
            agents: self.agents,
            blocks: self.blocks,
            roster: self.roster,
            seed: self.seed,
        }
    }
}

/// Trimmed value of `name`; unset and blank are both `None`.
pub fn parse_optional_env(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

fn pushover_credentials(
    user: Option<String>,
    token: Option<String>,
) -> Result<Option<PushoverCredentials>> {
    match (user, token) {
        (Some(user), Some(token)) => Ok(Some(PushoverCredentials { user, token })),
        (None, None) => Ok(None),
        (Some(_), None) => Err(anyhow!(
            "{} is set but {} is not",
            AUDITOR_ENV_PUSHOVER_USER,
            AUDITOR_ENV_PUSHOVER_TOKEN
        )),
        (None, Some(_)) => Err(anyhow!(
            "{} is set but {} is not",
            AUDITOR_ENV_PUSHOVER_TOKEN,
            AUDITOR_ENV_PUSHOVER_USER
        )),
    }
}
