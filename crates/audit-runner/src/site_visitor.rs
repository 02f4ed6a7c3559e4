use crate::session::is_session_released;
use crate::step::{Step, StepContext, StepKind};
use anyhow::Result;
use audit_core::{normalize_address, Record, RECORD_KIND_VISIT};
use std::collections::VecDeque;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Training step that visits every configured site once. A failed visit is
/// pushed to the back of the work queue and tried again later in the same
/// invocation; without a retry budget that repeats until the visit succeeds.
pub struct SiteVisitor {
    name: String,
    sites: Vec<String>,
    delay: Duration,
    retry_budget: Option<usize>,
}

struct PendingVisit {
    address: String,
    failures: usize,
}

impl SiteVisitor {
    pub fn new(name: impl Into<String>, sites: Vec<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            sites,
            delay,
            retry_budget: None,
        }
    }

    /// Caps the number of failed attempts per site. `None` retries forever.
    pub fn with_retry_budget(mut self, retry_budget: Option<usize>) -> Self {
        self.retry_budget = retry_budget;
        self
    }
}

impl Step for SiteVisitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StepKind {
        StepKind::Training
    }

    fn delay(&self) -> Duration {
        self.delay
    }

    fn invoke(&mut self, ctx: &StepContext<'_>) -> Result<Vec<Record>> {
        let mut queue: VecDeque<PendingVisit> = self
            .sites
            .iter()
            .map(|address| PendingVisit {
                address: address.clone(),
                failures: 0,
            })
            .collect();
        let mut records = Vec::new();

        while let Some(mut pending) = queue.pop_front() {
            let url = match normalize_address(&pending.address) {
                Ok(url) => url,
                Err(err) => {
                    error!(
                        agent = %ctx.identity,
                        step = %self.name,
                        site = %pending.address,
                        error = %err,
                        "dropping unusable site"
                    );
                    continue;
                }
            };
            if !ctx.probe.is_online() {
                info!(agent = %ctx.identity, "not connected to internet");
            }
            debug!(agent = %ctx.identity, url = %url, "accessing site");
            match ctx.session.navigate(&url) {
                Ok(()) => {
                    records.push(
                        ctx.record(&self.name, RECORD_KIND_VISIT, url.as_str())
                            .with_field("attempt", pending.failures + 1),
                    );
                }
                Err(err) if is_session_released(&err) => return Err(err),
                Err(err) => {
                    pending.failures += 1;
                    warn!(
                        agent = %ctx.identity,
                        step = %self.name,
                        site = %url,
                        failures = pending.failures,
                        error = %format!("{:#}", err),
                        "site visit failed"
                    );
                    match self.retry_budget {
                        Some(budget) if pending.failures >= budget => {
                            error!(
                                agent = %ctx.identity,
                                site = %url,
                                budget,
                                "retry budget exhausted, giving up on site"
                            );
                        }
                        _ => {
                            info!(agent = %ctx.identity, site = %pending.address, "adding site back to queue");
                            queue.push_back(pending);
                        }
                    }
                }
            }
            thread::sleep(self.delay);
        }
        Ok(records)
    }
}
