// Batch Producer: splits a large list of ids (e.g. mail message ids) into
// fixed-size batches, one scheduled item per batch, staggered so the
// downstream endpoint sees a smoothed load instead of a burst.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    scheduled_item::{Method, ScheduledItem},
    scheduler::{Scheduler, SchedulerError},
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub spacing_ms: u64,
    pub max_attempts: Option<u32>,
    // lists shorter than this are refused; 0 accepts any non-empty list
    pub min_ids: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            spacing_ms: 2_000,
            max_attempts: Some(10),
            min_ids: 0,
        }
    }
}

// What every batch item shares; `payload` builds the body from one chunk of ids
pub struct BatchTemplate<F>
where
    F: Fn(&[String]) -> serde_json::Value,
{
    pub id_prefix: String,
    pub method: Method,
    pub target: String,
    pub owner_id: Option<String>,
    pub payload: F,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSubmission {
    Scheduled { batches: usize },
    // owner already has outstanding work; nothing submitted
    OwnerBusy,
    Empty,
    // fewer ids than `min_ids`; nothing submitted
    TooFew { ids: usize },
}

#[derive(Debug, Clone, Default)]
pub struct BatchProducer {
    config: BatchConfig,
}

impl BatchProducer {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Batch `i` becomes eligible at `start + i * spacing`.
    pub fn plan<F>(
        &self,
        template: &BatchTemplate<F>,
        ids: &[String],
        start: Instant,
    ) -> Vec<ScheduledItem>
    where
        F: Fn(&[String]) -> serde_json::Value,
    {
        let spacing = Duration::from_millis(self.config.spacing_ms);
        let stamp = Utc::now().timestamp_millis();

        ids.chunks(self.config.batch_size.max(1))
            .enumerate()
            .map(|(index, chunk)| {
                let mut item = ScheduledItem::new(
                    format!("{}-{}-{}", template.id_prefix, stamp, index),
                    template.method,
                    template.target.clone(),
                )
                .with_payload((template.payload)(chunk))
                .eligible_at(start + spacing * index as u32);

                item.max_attempts = self.config.max_attempts;
                item.owner_id = template.owner_id.clone();
                item
            })
            .collect()
    }

    pub fn submit_for_owner<F>(
        &self,
        scheduler: &Scheduler,
        template: &BatchTemplate<F>,
        ids: &[String],
    ) -> Result<BatchSubmission, SchedulerError>
    where
        F: Fn(&[String]) -> serde_json::Value,
    {
        if let Some(owner) = &template.owner_id {
            if scheduler.is_owner_scheduled(owner) {
                debug!(owner = %owner, "request already scheduled for this owner");
                return Ok(BatchSubmission::OwnerBusy);
            }
        }
        if ids.is_empty() {
            return Ok(BatchSubmission::Empty);
        }
        if ids.len() < self.config.min_ids {
            debug!(
                owner = ?template.owner_id,
                ids = ids.len(),
                min_ids = self.config.min_ids,
                "not enough ids to schedule"
            );
            return Ok(BatchSubmission::TooFew { ids: ids.len() });
        }

        let items = self.plan(template, ids, Instant::now());
        let batches = items.len();
        for item in items {
            scheduler.submit(item)?;
        }

        info!(
            owner = ?template.owner_id,
            ids = ids.len(),
            batches,
            "scheduled batched fetch"
        );
        Ok(BatchSubmission::Scheduled { batches })
    }
}
