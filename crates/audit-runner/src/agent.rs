use crate::connectivity::ConnectivityProbe;
use crate::session::{is_session_released, SessionHandle};
use crate::step::{Step, StepContext};
use crate::writer::RecordSender;
use anyhow::Result;
use serde_json::Value;
use rand::seq::SliceRandom;
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

pub const ATTRIBUTES_FIELD: &str = "attributes";

/// One simulated identity: a browser session plus the steps it runs.
pub struct Agent {
    identity: String,
    block: usize,
    attributes: BTreeMap<String, String>,
    session: SessionHandle,
    probe: Arc<dyn ConnectivityProbe>,
    training_steps: Vec<Box<dyn Step>>,
    scrape_steps: Vec<Box<dyn Step>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub identity: String,
    pub steps_completed: usize,
    pub records_emitted: usize,
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn failed(identity: &str, error: String) -> Self {
        Self {
            identity: identity.to_string(),
            steps_completed: 0,
            records_emitted: 0,
            error: Some(error),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl Agent {
    pub(crate) fn new(
        identity: String,
        block: usize,
        attributes: BTreeMap<String, String>,
        session: SessionHandle,
        probe: Arc<dyn ConnectivityProbe>,
        training_steps: Vec<Box<dyn Step>>,
    ) -> Self {
        Self {
            identity,
            block,
            attributes,
            session,
            probe,
            training_steps,
            scrape_steps: Vec::new(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Clone of the session handle for out-of-band teardown.
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    pub fn training_steps(&self) -> &[Box<dyn Step>] {
        &self.training_steps
    }

    pub fn scrape_steps(&self) -> &[Box<dyn Step>] {
        &self.scrape_steps
    }

    pub fn add_scrape_steps(&mut self, steps: Vec<Box<dyn Step>>) {
        self.scrape_steps.extend(steps);
    }

    /// Permutes training and scrape steps independently.
    pub fn shuffle_steps(&mut self, rng: &mut dyn RngCore) {
        self.training_steps.shuffle(&mut *rng);
        self.scrape_steps.shuffle(&mut *rng);
    }

    /// Runs every training step, then every scrape step. The first step error
    /// ends the run; records already sent stay sent. Every record carries the
    /// agent's treatment attributes under `attributes`.
    pub fn run(mut self, records: &RecordSender) -> AgentOutcome {
        let mut outcome = AgentOutcome {
            identity: self.identity.clone(),
            steps_completed: 0,
            records_emitted: 0,
            error: None,
        };
        info!(
            block = self.block,
            agent = %self.identity,
            training = self.training_steps.len(),
            scrape = self.scrape_steps.len(),
            "agent started"
        );

        let attributes = attributes_value(&self.attributes);
        let ctx = StepContext {
            block: self.block,
            identity: &self.identity,
            session: &self.session,
            probe: self.probe.as_ref(),
        };
        let steps = self
            .training_steps
            .iter_mut()
            .chain(self.scrape_steps.iter_mut());
        for step in steps {
            match run_step(step.as_mut(), &ctx, attributes.as_ref(), records) {
                Ok(emitted) => {
                    outcome.steps_completed += 1;
                    outcome.records_emitted += emitted;
                }
                Err(err) => {
                    if is_session_released(&err) {
                        warn!(
                            block = ctx.block,
                            agent = %ctx.identity,
                            step = %step.name(),
                            "session released while step was running"
                        );
                    } else {
                        error!(
                            block = ctx.block,
                            agent = %ctx.identity,
                            step = %step.name(),
                            error = %format!("{:#}", err),
                            "step failed; ending agent run"
                        );
                    }
                    outcome.error = Some(format!("{}: {:#}", step.name(), err));
                    return outcome;
                }
            }
            thread::sleep(step.delay());
        }

        info!(
            block = ctx.block,
            agent = %ctx.identity,
            steps = outcome.steps_completed,
            records = outcome.records_emitted,
            "agent finished"
        );
        outcome
    }
}

fn attributes_value(attributes: &BTreeMap<String, String>) -> Option<Value> {
    if attributes.is_empty() {
        return None;
    }
    Some(Value::Object(
        attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    ))
}

fn run_step(
    step: &mut dyn Step,
    ctx: &StepContext<'_>,
    attributes: Option<&Value>,
    records: &RecordSender,
) -> Result<usize> {
    debug!(agent = %ctx.identity, step = %step.name(), kind = %step.kind(), "invoking step");
    let emitted = step.invoke(ctx)?;
    let count = emitted.len();
    for mut record in emitted {
        if let Some(attributes) = attributes {
            record
                .fields
                .entry(ATTRIBUTES_FIELD)
                .or_insert_with(|| attributes.clone());
        }
        records.send(record)?;
    }
    Ok(count)
}
