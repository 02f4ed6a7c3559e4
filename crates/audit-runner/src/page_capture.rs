use crate::session::is_session_released;
use crate::step::{Step, StepContext, StepKind};
use anyhow::Result;
use audit_core::{normalize_address, sha256_bytes, Record, SnapshotStore, RECORD_KIND_CAPTURE};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const QUERY_PLACEHOLDER: &str = "{query}";

/// Generic scrape step: load one page and record what came back. Site
/// specific parsers plug in as their own `Step` implementations instead.
pub struct PageCapture {
    site: String,
    url_template: String,
    query: Option<String>,
    delay: Duration,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl PageCapture {
    pub fn new(site: impl Into<String>, url_template: impl Into<String>, delay: Duration) -> Self {
        Self {
            site: site.into(),
            url_template: url_template.into(),
            query: None,
            delay,
            snapshots: None,
        }
    }

    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query;
        self
    }

    pub fn with_snapshots(mut self, snapshots: Option<Arc<SnapshotStore>>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn target(&self) -> String {
        match &self.query {
            Some(query) => fill_query(&self.url_template, query),
            None => self.url_template.clone(),
        }
    }
}

/// Substitutes the percent-encoded `query` for every placeholder in `template`.
pub fn fill_query(template: &str, query: &str) -> String {
    let encoded = utf8_percent_encode(query, NON_ALPHANUMERIC).to_string();
    template.replace(QUERY_PLACEHOLDER, &encoded)
}

impl Step for PageCapture {
    fn name(&self) -> &str {
        &self.site
    }

    fn kind(&self) -> StepKind {
        StepKind::Scrape
    }

    fn delay(&self) -> Duration {
        self.delay
    }

    fn invoke(&mut self, ctx: &StepContext<'_>) -> Result<Vec<Record>> {
        let url = normalize_address(&self.target())?;
        debug!(agent = %ctx.identity, site = %self.site, url = %url, "capturing page");
        let page = ctx
            .session
            .navigate(&url)
            .and_then(|()| Ok((ctx.session.title()?, ctx.session.page_source()?)));
        let (title, source) = match page {
            Ok(page) => page,
            Err(err) if is_session_released(&err) => return Err(err),
            Err(err) => {
                warn!(
                    agent = %ctx.identity,
                    site = %self.site,
                    url = %url,
                    error = %format!("{:#}", err),
                    "page capture failed"
                );
                return Ok(Vec::new());
            }
        };

        let mut record = ctx
            .record(&self.site, RECORD_KIND_CAPTURE, url.as_str())
            .with_field("site", self.site.as_str())
            .with_field("title", title)
            .with_field("content_length", source.len())
            .with_field("digest", sha256_bytes(source.as_bytes()));
        if let Some(query) = &self.query {
            record = record.with_field("query", query.as_str());
        }
        if let Some(store) = &self.snapshots {
            match store.put_bytes(source.as_bytes()) {
                Ok(snapshot_ref) => record = record.with_field("snapshot", snapshot_ref),
                Err(err) => warn!(
                    agent = %ctx.identity,
                    site = %self.site,
                    error = %format!("{:#}", err),
                    "page snapshot failed"
                ),
            }
        }
        Ok(vec![record])
    }
}
