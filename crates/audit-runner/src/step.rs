use crate::connectivity::ConnectivityProbe;
use crate::session::SessionHandle;
use anyhow::Result;
use audit_core::Record;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Training,
    Scrape,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Training => f.write_str("training"),
            StepKind::Scrape => f.write_str("scrape"),
        }
    }
}

/// What a step sees of the agent running it.
pub struct StepContext<'a> {
    pub block: usize,
    pub identity: &'a str,
    pub session: &'a SessionHandle,
    pub probe: &'a dyn ConnectivityProbe,
}

impl StepContext<'_> {
    pub fn record(&self, step: &str, kind: &str, target: &str) -> Record {
        Record::new(self.block, self.identity, step, kind, target)
    }
}

/// One scripted action. The agent sleeps for `delay()` after every
/// invocation, whether or not it produced records.
pub trait Step: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> StepKind;
    fn delay(&self) -> Duration;
    fn invoke(&mut self, ctx: &StepContext<'_>) -> Result<Vec<Record>>;
}
