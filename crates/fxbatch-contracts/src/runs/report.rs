use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::item::{BatchItem, ItemStatus};
use super::result::GenerationFailure;
use crate::events::now_utc_iso;

/// Settled state of a whole batch, in submission order.
///
/// Built by the batch runner and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    run_id: String,
    started_at: String,
    finished_at: String,
    items: Vec<BatchItem>,
    // Cookie values are credentials and never land in a written report.
    #[serde(skip)]
    refreshed_cookies: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_images: usize,
    pub failures_by_reason: BTreeMap<String, usize>,
}

impl BatchReport {
    pub fn new(
        run_id: impl Into<String>,
        started_at: impl Into<String>,
        finished_at: impl Into<String>,
        items: Vec<BatchItem>,
        refreshed_cookies: BTreeMap<String, String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: started_at.into(),
            finished_at: finished_at.into(),
            items,
            refreshed_cookies,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn started_at(&self) -> &str {
        &self.started_at
    }

    pub fn finished_at(&self) -> &str {
        &self.finished_at
    }

    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count_status(ItemStatus::Succeeded)
    }

    pub fn failed(&self) -> usize {
        self.count_status(ItemStatus::Failed)
    }

    pub fn total_images(&self) -> usize {
        self.items.iter().map(|item| item.images().len()).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&BatchItem, &GenerationFailure)> {
        self.items
            .iter()
            .filter_map(|item| item.failure().map(|failure| (item, failure)))
    }

    /// Cookies the service rotated during the batch, latest value per name.
    /// Callers decide whether to rebuild their cookie store from them.
    pub fn refreshed_cookies(&self) -> &BTreeMap<String, String> {
        &self.refreshed_cookies
    }

    pub fn summary(&self) -> BatchSummary {
        let mut failures_by_reason = BTreeMap::new();
        for (_, failure) in self.failures() {
            *failures_by_reason
                .entry(failure.reason.as_str().to_string())
                .or_insert(0) += 1;
        }
        BatchSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
            total: self.total(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            total_images: self.total_images(),
            failures_by_reason,
        }
    }

    fn count_status(&self, status: ItemStatus) -> usize {
        self.items
            .iter()
            .filter(|item| item.status() == status)
            .count()
    }
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    #[serde(flatten)]
    summary: BatchSummary,
    items: &'a [BatchItem],
    ts: String,
}

/// Writes the report as pretty JSON. The document carries the summary
/// fields next to the items, so it deserializes back into a [`BatchReport`].
pub fn write_report(path: &Path, report: &BatchReport) -> anyhow::Result<()> {
    let document = ReportDocument {
        summary: report.summary(),
        items: report.items(),
        ts: now_utc_iso(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&document)?)
        .with_context(|| format!("failed to write report {}", path.display()))
}
