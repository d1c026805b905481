//! Batch ingestion: decode, classify, thumbnail and persist queue messages.
//!
//! Every message in a batch is handled on its own task and resolves to an
//! [`Outcome`] independently of its siblings. The worker never retries on
//! its own: redelivery and dead-lettering belong to the queue.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::models::event::ImageEvent;
use crate::models::label::{LabelResult, ThumbnailRef};
use crate::models::outcome::{BatchRecord, Outcome};
use crate::services::classifier::{ClassificationClient, ClassificationError};
use crate::services::decoder::{DecodeError, NotificationDecoder};
use crate::services::label_store::{LabelStore, StoreError};
use crate::services::thumbnail::{ThumbnailError, ThumbnailGenerator};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Records of one batch processed in parallel.
    pub concurrency: usize,
    /// Timeout applied to each external call.
    pub call_timeout: Duration,
    /// Records still running this long after the batch started are
    /// cancelled and left for redelivery.
    pub batch_deadline: Option<Duration>,
    /// Process every inner notification record, not only the first.
    pub fan_out: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            call_timeout: Duration::from_secs(10),
            batch_deadline: None,
            fan_out: false,
        }
    }
}

/// The orchestrating core of the pipeline. Cheap to clone: every
/// collaborator is a shared read-only handle.
#[derive(Clone)]
pub struct IngestionWorker {
    decoder: NotificationDecoder,
    classifier: ClassificationClient,
    thumbnails: Option<Arc<ThumbnailGenerator>>,
    labels: Arc<dyn LabelStore>,
    settings: WorkerSettings,
}

impl IngestionWorker {
    pub fn new(
        classifier: ClassificationClient,
        thumbnails: Option<Arc<ThumbnailGenerator>>,
        labels: Arc<dyn LabelStore>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            decoder: NotificationDecoder::new(settings.fan_out),
            classifier,
            thumbnails,
            labels,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Process one delivered batch.
    ///
    /// Returns `(index, outcome)` pairs sorted by input index. A record
    /// missing from the result was cancelled at the batch deadline (or its
    /// task died) and must be left unacknowledged.
    pub async fn process_batch<S: AsRef<str>>(&self, raw_messages: &[S]) -> Vec<(usize, Outcome)> {
        let started = Instant::now();
        let deadline = self.settings.batch_deadline.map(|d| started + d);
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));

        let mut tasks = JoinSet::new();
        for (index, raw) in raw_messages.iter().enumerate() {
            let record = BatchRecord::decode(index, raw.as_ref(), &self.decoder);
            let worker = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                worker.process_record(record).await
            });
        }

        let mut outcomes = Vec::with_capacity(raw_messages.len());
        loop {
            let next = match deadline {
                Some(deadline) => match timeout_at(deadline, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            unfinished = tasks.len(),
                            "Batch deadline reached, cancelling unfinished records"
                        );
                        tasks.abort_all();
                        break;
                    }
                },
                None => tasks.join_next().await,
            };

            match next {
                None => break,
                Some(Ok(record)) => {
                    if let Some(outcome) = record.outcome {
                        outcomes.push((record.index, outcome));
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "Record task failed, leaving message for redelivery");
                }
            }
        }

        outcomes.sort_by_key(|(index, _)| *index);

        metrics::counter!("ingestion_batches_total").increment(1);
        info!(
            messages = raw_messages.len(),
            resolved = outcomes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch processed"
        );

        outcomes
    }

    async fn process_record(self, mut record: BatchRecord) -> BatchRecord {
        let outcome = match &record.decoded {
            Err(DecodeError::Empty) => {
                debug!(index = record.index, "Envelope has no storage records, acknowledging");
                Outcome::Ack
            }
            Err(e @ DecodeError::Malformed(_)) => {
                error!(
                    index = record.index,
                    error = %e,
                    body = record.body_preview.as_deref().unwrap_or_default(),
                    "Undecodable message, dead-lettering"
                );
                Outcome::DeadLetter
            }
            Ok(events) => {
                let mut outcome = Outcome::Ack;
                for event in events {
                    outcome = outcome.merge(self.process_event(event).await);
                }
                outcome
            }
        };

        metrics::counter!("ingestion_records_total", "outcome" => outcome.to_string()).increment(1);
        record.outcome = Some(outcome);
        record
    }

    /// Classification and thumbnailing run side by side; only the former
    /// (and the subsequent save) can change the acknowledgment decision.
    async fn process_event(&self, event: &ImageEvent) -> Outcome {
        let started = Instant::now();
        let bucket = event.bucket();
        let key = event.key();

        let (classified, thumbnail) = tokio::join!(self.classify(event), self.thumbnail(event));

        report_thumbnail(event, thumbnail);

        let outcome = match classified {
            Ok(result) => self.persist(event, result).await,
            Err(e) => {
                let outcome = classification_outcome(&e);
                if outcome == Outcome::Retry {
                    info!(bucket, key, error = %e, "Classification unavailable, will retry");
                } else {
                    error!(bucket, key, error = %e, "Classification failed permanently, dead-lettering");
                }
                outcome
            }
        };

        metrics::histogram!("ingestion_record_seconds").record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn persist(&self, event: &ImageEvent, result: LabelResult) -> Outcome {
        let bucket = event.bucket();
        let key = event.key();
        let label_count = result.labels.len();

        let saved = self
            .bounded(self.labels.save(&result), || {
                StoreError::Unavailable("label store call timed out".to_string())
            })
            .await;

        match saved {
            Ok(()) => {
                info!(bucket, key, labels = label_count, "Labels stored");
                Outcome::Ack
            }
            Err(e) => {
                let outcome = store_outcome(&e);
                if outcome == Outcome::Retry {
                    info!(bucket, key, error = %e, "Label store unavailable, will retry");
                } else {
                    error!(bucket, key, error = %e, "Labels cannot be stored, dead-lettering");
                }
                outcome
            }
        }
    }

    async fn classify(&self, event: &ImageEvent) -> Result<LabelResult, ClassificationError> {
        self.bounded(self.classifier.classify(event.bucket(), event.key()), || {
            ClassificationError::Unavailable("classification call timed out".to_string())
        })
        .await
    }

    async fn thumbnail(&self, event: &ImageEvent) -> Option<Result<ThumbnailRef, ThumbnailError>> {
        let generator = self.thumbnails.as_ref()?;
        Some(
            self.bounded(generator.generate(event.bucket(), event.key()), || {
                ThumbnailError::Unavailable("thumbnail call timed out".to_string())
            })
            .await,
        )
    }

    /// Run an external call under the per-call timeout.
    async fn bounded<T, E, F>(&self, call: F, on_timeout: impl FnOnce() -> E) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        match timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout()),
        }
    }
}

fn classification_outcome(err: &ClassificationError) -> Outcome {
    if err.is_retryable() {
        Outcome::Retry
    } else {
        Outcome::DeadLetter
    }
}

fn store_outcome(err: &StoreError) -> Outcome {
    if err.is_retryable() {
        Outcome::Retry
    } else {
        Outcome::DeadLetter
    }
}

fn report_thumbnail(event: &ImageEvent, thumbnail: Option<Result<ThumbnailRef, ThumbnailError>>) {
    match thumbnail {
        None => {}
        Some(Ok(thumb)) => {
            debug!(
                key = event.key(),
                thumbnail_bucket = %thumb.bucket,
                thumbnail_key = %thumb.key,
                width = thumb.width,
                height = thumb.height,
                "Thumbnail written"
            );
        }
        Some(Err(e)) => {
            metrics::counter!("ingestion_thumbnail_failures_total").increment(1);
            warn!(bucket = event.bucket(), key = event.key(), error = %e, "Thumbnail generation failed");
        }
    }
}
