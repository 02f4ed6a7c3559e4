use crate::page_capture::PageCapture;
use crate::step::Step;
use anyhow::{anyhow, Context, Result};
use audit_core::{AuditError, DelaySpec, Location, SnapshotStore};
use rand::RngCore;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

const BUILTIN_LOCATIONS_YAML: &str = include_str!("../catalog/locations.yaml");

/// Source of the scrape steps appended to every agent of a block.
pub trait ScrapeCatalog: Send + Sync {
    /// Fresh step instances for one agent; delays are sampled per call.
    fn scrape_steps(&self, location: Location, rng: &mut dyn RngCore) -> Result<Vec<Box<dyn Step>>>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeStepSpec {
    pub site: String,
    pub url: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub delay: DelaySpec,
}

/// Location key to ordered scrape step specs, loaded from YAML.
pub struct StepCatalog {
    locations: BTreeMap<Location, Vec<ScrapeStepSpec>>,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl StepCatalog {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_LOCATIONS_YAML).context("built-in location catalog")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("invalid catalog {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let locations: BTreeMap<Location, Vec<ScrapeStepSpec>> = serde_yaml::from_str(raw)?;
        for (location, specs) in &locations {
            for spec in specs {
                if spec.url.contains(crate::page_capture::QUERY_PLACEHOLDER) && spec.query.is_none() {
                    return Err(anyhow!(
                        "{}: site {} uses a query placeholder but sets no query",
                        location,
                        spec.site
                    ));
                }
                spec.delay
                    .validate()
                    .with_context(|| format!("{}: site {}", location, spec.site))?;
            }
        }
        Ok(Self {
            locations,
            snapshots: None,
        })
    }

    pub fn with_snapshots(mut self, snapshots: Option<Arc<SnapshotStore>>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn specs(&self, location: Location) -> Result<&[ScrapeStepSpec]> {
        self.locations
            .get(&location)
            .map(Vec::as_slice)
            .ok_or_else(|| anyhow!(AuditError::UnknownLocation(location.to_string())))
    }
}

impl ScrapeCatalog for StepCatalog {
    fn scrape_steps(&self, location: Location, rng: &mut dyn RngCore) -> Result<Vec<Box<dyn Step>>> {
        let mut steps: Vec<Box<dyn Step>> = Vec::new();
        for spec in self.specs(location)? {
            let delay = spec.delay.sample(&mut *rng)?;
            steps.push(Box::new(
                PageCapture::new(spec.site.clone(), spec.url.clone(), delay)
                    .with_query(spec.query.clone())
                    .with_snapshots(self.snapshots.clone()),
            ));
        }
        Ok(steps)
    }
}
