//! Offline batch reconciliation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ScanContext, ScanEngine, ScanError, ScanOutcome, ScanRequest};
use crate::models::ScanResult;

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    /// Device that collected the scans. Items without their own device id inherit it.
    pub device_id: Option<String>,
    pub scans: Vec<ScanRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchItemStatus {
    Processed,
    Error,
}

#[derive(Debug)]
pub struct BatchItem {
    /// Position in the submitted batch.
    pub index: usize,
    pub status: BatchItemStatus,
    pub outcome: Option<ScanOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub valid: usize,
    pub duplicate: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub struct BatchReport {
    /// Results in submission order.
    pub items: Vec<BatchItem>,
    pub summary: BatchSummary,
    pub total_scans: usize,
}

impl BatchSummary {
    fn count(&mut self, item: &BatchItem) {
        match item.outcome.as_ref().map(|outcome| outcome.result) {
            Some(ScanResult::Valid) => self.valid += 1,
            Some(ScanResult::Duplicate) => self.duplicate += 1,
            _ => self.errors += 1,
        }
    }
}

impl ScanEngine {
    /// Replays an offline batch in client timestamp order.
    ///
    /// The whole batch counts as one attempt against the device rate limit. Batches from
    /// the same device run one at a time.
    pub async fn reconcile(
        &self,
        batch: BatchRequest,
        context: &ScanContext,
    ) -> Result<BatchReport, ScanError> {
        let limit = self.settings.batch_max_items;
        if batch.scans.len() > limit {
            return Err(ScanError::BatchTooLarge {
                size: batch.scans.len(),
                limit,
            });
        }

        let device_key = batch
            .device_id
            .clone()
            .or_else(|| batch.scans.iter().find_map(|scan| scan.device_id.clone()));
        self.throttle(device_key.as_deref())?;

        let _device_guard = self
            .devices_in_flight
            .lock(device_key.clone().unwrap_or_default())
            .await;

        let received_at = Utc::now();
        let total_scans = batch.scans.len();
        let mut ordered: Vec<(usize, ScanRequest)> = batch
            .scans
            .into_iter()
            .map(|mut scan| {
                scan.scanned_at = Some(scan.scanned_at.unwrap_or(received_at));
                scan.offline = true;
                if scan.device_id.is_none() {
                    scan.device_id = batch.device_id.clone();
                }
                scan
            })
            .enumerate()
            .collect();
        // sort_by_key is stable, so equal timestamps keep submission order
        ordered.sort_by_key(|(_, scan)| scan.scanned_at);

        let mut items = Vec::with_capacity(total_scans);
        for (index, scan) in ordered {
            let item = match self.evaluate(&scan, context).await {
                Ok(outcome) => BatchItem {
                    index,
                    status: BatchItemStatus::Processed,
                    outcome: Some(outcome),
                    error: None,
                },
                Err(e) => {
                    warn!(index, error = %e, "Batch item failed");
                    BatchItem {
                        index,
                        status: BatchItemStatus::Error,
                        outcome: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            items.push(item);
        }

        items.sort_by_key(|item| item.index);
        let mut summary = BatchSummary::default();
        for item in &items {
            summary.count(item);
        }

        info!(
            device_id = ?device_key,
            total_scans,
            valid = summary.valid,
            duplicate = summary.duplicate,
            errors = summary.errors,
            "Batch reconciled"
        );

        Ok(BatchReport {
            items,
            summary,
            total_scans,
        })
    }
}
