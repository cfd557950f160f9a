//! Fan-out orchestrator
//!
//! Drives a three-level fetch: one batch manifest lists groups, each group
//! manifest lists leaf items, each leaf is a payload handed to a
//! [`PayloadSink`]. Every level goes through its own [`Loader`], so work that
//! succeeded once is never repeated, and a failed iteration retries the whole
//! batch while only refetching what actually failed.
//!
//! - [`manifest`] - Manifest entry types
//! - [`sink`] - Payload destinations
//! - [`report`] - Run metrics

mod manifest;
mod report;
mod sink;


pub use manifest::{GroupRef, LeafReceipt, LeafRef};
pub use report::RunReport;
pub use sink::{DirectorySink, DiscardSink, PayloadSink};

use crate::config::Config;
use crate::error::Result;
use crate::executor::{RequestExecutor, RequestOptions};
use crate::fault::{Fault, assert_all};
use crate::loader::Loader;
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Loader key of the batch manifest
const BATCH_KEY: &str = "batch";

/// Summary of a failed batch
pub const BATCH_FAILURE: &str = "failed to load groups for batch";

/// Summary of a failed group
pub fn group_failure(group_id: &str) -> String {
    format!("failed to load items for group: {group_id}")
}

/// Fetches a whole batch, retrying failed iterations
pub struct FanOut {
    config: Arc<Config>,
    executor: RequestExecutor,
    sink: Arc<dyn PayloadSink>,
    batches: Loader<Arc<Vec<GroupRef>>>,
    groups: Loader<Arc<Vec<LeafRef>>>,
    leaves: Loader<LeafReceipt>,
}

impl FanOut {
    /// Create an orchestrator
    pub fn new(config: Config, executor: RequestExecutor, sink: Arc<dyn PayloadSink>) -> Self {
        Self {
            config: Arc::new(config),
            executor,
            sink,
            batches: Loader::new("batch"),
            groups: Loader::new("group"),
            leaves: Loader::new("leaf"),
        }
    }

    /// Create a reqwest-backed orchestrator writing into `run.output_dir`
    pub fn from_config(config: Config) -> Result<Self> {
        let executor = RequestExecutor::from_config(&config)?;
        let sink = Arc::new(DirectorySink::new(config.run.output_dir.clone()));
        Ok(Self::new(config, executor, sink))
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Executor shared by every level
    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// Run iterations until one succeeds, `run.max_iterations` is reached or
    /// `cancel` fires
    pub async fn run(&self, cancel: &CancellationToken) -> RunReport {
        let max_iterations = self.config.run.max_iterations;
        let mut report = RunReport::new();

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                tracing::warn!(iteration, "Run cancelled");
                break;
            }
            report.iterations = iteration;
            tracing::info!(iteration, max_iterations, "Starting iteration");

            match self.run_iteration(cancel).await {
                Ok(groups) => {
                    tracing::info!(iteration, groups, "Batch complete");
                    report.succeeded = true;
                    report.final_fault = None;
                    break;
                }
                Err(fault) => {
                    for leaf in fault.leaves() {
                        tracing::warn!(
                            iteration,
                            trace_id = %leaf.trace_id(),
                            error = %leaf,
                            "Item failed"
                        );
                    }
                    report.absorb(&fault);
                    tracing::warn!(
                        iteration,
                        failed_groups = fault.children().len(),
                        failures = report.failures,
                        "Iteration failed"
                    );
                    report.final_fault = Some(fault);
                }
            }

            if iteration < max_iterations {
                let delay = self.config.run.iteration_delay;
                tracing::info!(delay_ms = delay.as_millis() as u64, "Retrying batch");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::warn!(iteration, "Run cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if !report.succeeded {
            tracing::error!(
                iterations = report.iterations,
                failures = report.failures,
                missing = report.missing.len(),
                "Run failed"
            );
        }
        report
    }

    /// One pass over the batch; returns the number of groups completed
    pub async fn run_iteration(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<usize, Fault> {
        let groups = self
            .load_batch(cancel)
            .await
            .map_err(|fault| Fault::aggregate(BATCH_FAILURE, vec![fault]))?;

        let outcomes = join_all(groups.iter().map(|group| self.run_group(group, cancel))).await;
        let completed = assert_all(outcomes, BATCH_FAILURE)?;
        Ok(completed.len())
    }

    /// Fetch every leaf of `group`; returns the number of leaves completed
    pub async fn run_group(
        &self,
        group: &GroupRef,
        cancel: &CancellationToken,
    ) -> std::result::Result<usize, Fault> {
        let leaves = self.load_group(group, cancel).await?;

        let outcomes = join_all(
            leaves
                .iter()
                .map(|leaf| self.fetch_leaf(&group.id, leaf, cancel)),
        )
        .await;
        let receipts = assert_all(outcomes, group_failure(&group.id))?;

        let skipped = receipts.iter().filter(|r| r.skipped).count();
        let bytes: usize = receipts.iter().map(|r| r.bytes).sum();
        tracing::info!(
            group = %group.id,
            items = receipts.len(),
            skipped,
            bytes,
            "Group complete"
        );
        Ok(receipts.len())
    }

    async fn load_batch(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<Arc<Vec<GroupRef>>, Fault> {
        let executor = self.executor.clone();
        let url = self.config.run.manifest_url.clone();
        let options = RequestOptions::get().with_cancel(cancel.clone());

        self.batches
            .get(BATCH_KEY, move || async move {
                let groups: Vec<GroupRef> = executor.fetch_json(&url, options).await?;
                tracing::info!(url = %url, groups = groups.len(), "Loaded batch manifest");
                Ok(Arc::new(groups))
            })
            .await
    }

    async fn load_group(
        &self,
        group: &GroupRef,
        cancel: &CancellationToken,
    ) -> std::result::Result<Arc<Vec<LeafRef>>, Fault> {
        let executor = self.executor.clone();
        let url = self.config.run.group_manifest_url(group);
        let group_id = group.id.clone();
        let options = RequestOptions::get().with_cancel(cancel.clone());

        self.groups
            .get(group.id.clone(), move || async move {
                let leaves: Vec<LeafRef> = executor.fetch_json(&url, options).await?;
                tracing::debug!(group = %group_id, items = leaves.len(), "Loaded group manifest");
                Ok(Arc::new(leaves))
            })
            .await
    }

    async fn fetch_leaf(
        &self,
        group_id: &str,
        leaf: &LeafRef,
        cancel: &CancellationToken,
    ) -> std::result::Result<LeafReceipt, Fault> {
        let executor = self.executor.clone();
        let sink = Arc::clone(&self.sink);
        let group_id = group_id.to_string();
        let leaf_id = leaf.id.clone();
        let listed = leaf.url.clone();
        let url = self.config.fetch.resolve_url(&leaf.url).to_string();
        if url != leaf.url {
            tracing::debug!(from = %leaf.url, to = %url, "Applying URL override");
        }
        let options = RequestOptions::get()
            .with_retry(self.config.leaf_retry.clone())
            .with_cancel(cancel.clone());

        // One entry per destination: groups listing the same URL each get their copy
        self.leaves
            .get(format!("{group_id}/{leaf_id}"), move || async move {
                if sink.contains(&group_id, &leaf_id).await {
                    tracing::debug!(group = %group_id, item = %leaf_id, "Already held, skipping");
                    return Ok(LeafReceipt {
                        url,
                        bytes: 0,
                        skipped: true,
                    });
                }

                let payload = executor
                    .fetch_bytes(&url, options)
                    .await
                    .map_err(|fault| fault.with_origin(listed))?;
                let bytes = payload.len();
                sink.store(&group_id, &leaf_id, payload).await?;

                Ok(LeafReceipt {
                    url,
                    bytes,
                    skipped: false,
                })
            })
            .await
    }
}
