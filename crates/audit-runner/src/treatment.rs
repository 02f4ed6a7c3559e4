use crate::agent::Agent;
use crate::connectivity::ConnectivityProbe;
use crate::page_capture::{fill_query, QUERY_PLACEHOLDER};
use crate::session::{SessionFactory, SessionHandle, SessionRegistry};
use crate::site_visitor::SiteVisitor;
use crate::step::Step;
use anyhow::{anyhow, Context, Result};
use audit_core::{DelaySpec, ProxyConfig};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const BUILTIN_TREATMENTS_YAML: &str = include_str!("../catalog/treatments.yaml");
const DEFAULT_SEARCH_URL: &str = "https://www.google.com/search?q={query}";

const GENDERS: [&str; 2] = ["male", "female"];
const ETHNICITIES: [&str; 4] = ["caucasian", "afam", "hispanic", "asian"];
pub const CONTROL_TREATMENT: &str = "control";

/// What one treatment does to an agent under construction.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreatmentSpec {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Visited by one training step, in order.
    #[serde(default)]
    pub sites: Vec<String>,
    /// Each term becomes a search URL visited by a second training step.
    #[serde(default)]
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub delay: DelaySpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TreatmentTable {
    #[serde(default = "default_search_url")]
    search_url: String,
    treatments: BTreeMap<String, TreatmentSpec>,
}

fn default_search_url() -> String {
    DEFAULT_SEARCH_URL.to_string()
}

impl TreatmentTable {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_TREATMENTS_YAML).context("built-in treatment table")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read treatments {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid treatments {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let table: Self = serde_yaml::from_str(raw)?;
        if !table.search_url.contains(QUERY_PLACEHOLDER) {
            return Err(anyhow!(
                "search_url must contain {} (got {})",
                QUERY_PLACEHOLDER,
                table.search_url
            ));
        }
        for (name, spec) in &table.treatments {
            spec.delay
                .validate()
                .with_context(|| format!("treatment {}", name))?;
        }
        Ok(table)
    }

    pub fn get(&self, name: &str) -> Option<&TreatmentSpec> {
        self.treatments.get(name)
    }

    /// Fails when `strategy` names a treatment this table does not define.
    pub fn validate_roster(&self, strategy: RosterStrategy) -> Result<()> {
        let missing: Vec<String> = strategy
            .pipelines()
            .into_iter()
            .flat_map(|entry| entry.treatments)
            .filter(|name| !self.treatments.contains_key(name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "roster {} needs undefined treatments: {}",
                strategy,
                missing.join(", ")
            ))
        }
    }

    /// Applies one treatment to `builder`. Training steps get their delays
    /// sampled here, so every agent draws its own.
    pub fn apply(
        &self,
        name: &str,
        mut builder: AgentBuilder,
        rng: &mut dyn RngCore,
        retry_budget: Option<usize>,
    ) -> Result<AgentBuilder> {
        let spec = self
            .get(name)
            .ok_or_else(|| anyhow!("unknown treatment {}", name))?;
        builder
            .attributes
            .extend(spec.attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !spec.sites.is_empty() {
            let delay = spec.delay.sample(&mut *rng)?;
            builder.training_steps.push(Box::new(
                SiteVisitor::new(format!("{}-sites", name), spec.sites.clone(), delay)
                    .with_retry_budget(retry_budget),
            ));
        }
        if !spec.search_terms.is_empty() {
            let delay = spec.delay.sample(&mut *rng)?;
            let searches = spec
                .search_terms
                .iter()
                .map(|term| fill_query(&self.search_url, term))
                .collect();
            builder.training_steps.push(Box::new(
                SiteVisitor::new(format!("{}-search", name), searches, delay)
                    .with_retry_budget(retry_budget),
            ));
        }
        builder.applied.push(name.to_string());
        Ok(builder)
    }
}

/// Agent configuration accumulated by folding treatments, before any
/// session exists.
pub struct AgentBuilder {
    identity: String,
    block: usize,
    attributes: BTreeMap<String, String>,
    training_steps: Vec<Box<dyn Step>>,
    applied: Vec<String>,
}

impl AgentBuilder {
    pub fn new(identity: &str, block: usize) -> Self {
        Self {
            identity: identity.to_string(),
            block,
            attributes: BTreeMap::new(),
            training_steps: Vec::new(),
            applied: Vec::new(),
        }
    }

    pub fn applied(&self) -> &[String] {
        &self.applied
    }

    fn finish(self, session: SessionHandle, probe: Arc<dyn ConnectivityProbe>) -> Agent {
        Agent::new(
            self.identity,
            self.block,
            self.attributes,
            session,
            probe,
            self.training_steps,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RosterStrategy {
    #[default]
    Qc,
    SingleSite,
    Test,
}

impl fmt::Display for RosterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RosterStrategy::Qc => f.write_str("qc"),
            RosterStrategy::SingleSite => f.write_str("single-site"),
            RosterStrategy::Test => f.write_str("test"),
        }
    }
}

/// One roster slot: an identity and the treatments folded onto it, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub identity: String,
    pub treatments: Vec<String>,
}

impl RosterEntry {
    fn new(identity: impl Into<String>, treatments: &[&str]) -> Self {
        Self {
            identity: identity.into(),
            treatments: treatments.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl RosterStrategy {
    pub fn pipelines(self) -> Vec<RosterEntry> {
        match self {
            RosterStrategy::Qc => identity_axis()
                .map(|(ethnicity, gender)| {
                    RosterEntry::new(format!("{}-{}", ethnicity, gender), &[gender, ethnicity])
                })
                .collect(),
            RosterStrategy::SingleSite => {
                let mut entries = vec![RosterEntry::new(CONTROL_TREATMENT, &[CONTROL_TREATMENT])];
                entries.extend(identity_axis().map(|(ethnicity, gender)| {
                    RosterEntry::new(
                        format!("{}-{}", ethnicity, gender),
                        &[CONTROL_TREATMENT, gender, ethnicity],
                    )
                }));
                entries
            }
            RosterStrategy::Test => vec![RosterEntry::new("test", &[CONTROL_TREATMENT])],
        }
    }
}

fn identity_axis() -> impl Iterator<Item = (&'static str, &'static str)> {
    ETHNICITIES
        .into_iter()
        .flat_map(|ethnicity| GENDERS.into_iter().map(move |gender| (ethnicity, gender)))
}

/// Builds agents: folds treatments, opens the browser session and registers
/// it so the scheduler can always release it.
pub struct AgentFactory {
    sessions: Arc<dyn SessionFactory>,
    registry: SessionRegistry,
    treatments: Arc<TreatmentTable>,
    probe: Arc<dyn ConnectivityProbe>,
    proxy: Option<ProxyConfig>,
    retry_budget: Option<usize>,
}

impl AgentFactory {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        registry: SessionRegistry,
        treatments: Arc<TreatmentTable>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self {
            sessions,
            registry,
            treatments,
            probe,
            proxy: None,
            retry_budget: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_retry_budget(mut self, retry_budget: Option<usize>) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn build_agent(
        &self,
        entry: &RosterEntry,
        block: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Agent> {
        let builder = entry.treatments.iter().try_fold(
            AgentBuilder::new(&entry.identity, block),
            |builder, name| {
                self.treatments
                    .apply(name, builder, &mut *rng, self.retry_budget)
            },
        )?;

        let session = self
            .sessions
            .open(&entry.identity, self.proxy.as_ref())
            .with_context(|| format!("failed to open browser session for {}", entry.identity))?;
        let handle = SessionHandle::new(&entry.identity, session);
        if let Err(err) = self.registry.register(handle.clone()) {
            handle.release();
            return Err(err);
        }
        debug!(
            block,
            agent = %entry.identity,
            treatments = %builder.applied().join(","),
            "agent built"
        );
        Ok(builder.finish(handle, self.probe.clone()))
    }

    /// The roster repeated `per_treatment` times. Sessions opened before a
    /// failure stay registered for teardown.
    pub fn build_roster(
        &self,
        strategy: RosterStrategy,
        block: usize,
        per_treatment: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Agent>> {
        let pipelines = strategy.pipelines();
        let mut agents = Vec::with_capacity(pipelines.len() * per_treatment);
        for _ in 0..per_treatment {
            for entry in &pipelines {
                agents.push(self.build_agent(entry, block, &mut *rng)?);
            }
        }
        Ok(agents)
    }
}
