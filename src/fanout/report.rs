//! Run metrics
//!
//! [`RunReport`] accumulates what the outer retry loop observed. It is the
//! only state carried from one iteration to the next besides the loaders'
//! caches.

use crate::error::Result;
use crate::fault::{Fault, TraceId};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;

/// Outcome of a whole run
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunReport {
    /// Listed URLs of items answered with 404, in first-seen order, without duplicates
    pub missing: Vec<String>,
    /// Outer iterations performed
    pub iterations: u32,
    /// Distinct leaf failure events seen across all iterations
    pub failures: u64,
    /// True if an iteration completed without any failure
    pub succeeded: bool,
    /// Failure tree of the last failed iteration, cleared on success
    #[serde(skip)]
    pub final_fault: Option<Fault>,
    #[serde(skip)]
    seen: HashSet<TraceId>,
}

impl RunReport {
    /// Create an empty report
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a failed iteration's tree into the counters
    ///
    /// A leaf shared by several waiters (same trace id) counts once, even
    /// when it shows up again in a later iteration.
    pub fn absorb(&mut self, fault: &Fault) {
        for leaf in fault.leaves() {
            if !self.seen.insert(leaf.trace_id()) {
                continue;
            }
            self.failures += 1;

            if leaf.is_not_found()
                && let Some(url) = leaf.origin()
                && !self.missing.iter().any(|m| m == url)
            {
                self.missing.push(url.to_string());
            }
        }
    }

    /// Groups that failed in the last failed iteration
    pub fn failed_groups(&self) -> usize {
        self.final_fault
            .as_ref()
            .map_or(0, |fault| fault.children().len())
    }

    /// Process exit code: 0 on success, otherwise the failed group count in 1..=255
    pub fn exit_code(&self) -> u8 {
        if self.succeeded {
            0
        } else {
            u8::try_from(self.failed_groups().clamp(1, 255)).unwrap_or(u8::MAX)
        }
    }

    /// Write the report as pretty JSON
    pub async fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::debug!(path = %path.display(), "Wrote run metrics");
        Ok(())
    }
}
