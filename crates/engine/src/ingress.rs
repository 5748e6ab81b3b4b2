//! Sample ingress and the realtime tick scheduler.
//!
//! Producers push samples through a bounded channel; the ingress loop
//! is the only writer into the time-series store. The channel bound is
//! the ingest backpressure: producers await when the engine falls
//! behind instead of growing an unbounded backlog.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use faultline_core::model::TimeSeriesSample;
use faultline_storage::StorageError;
use faultline_timeseries::TimeSeriesStore;

use crate::error::EngineError;
use crate::orchestrator::Orchestrator;

/// Producer handle for the sample channel. Cheap to clone.
#[derive(Clone)]
pub struct SampleIngress {
    tx: mpsc::Sender<TimeSeriesSample>,
}

impl SampleIngress {
    /// Submit one sample, awaiting channel capacity.
    pub async fn submit(&self, sample: TimeSeriesSample) -> Result<(), EngineError> {
        self.tx
            .send(sample)
            .await
            .map_err(|_| EngineError::Store(StorageError::Unavailable("ingress closed".into())))
    }
}

/// Consumer side: drains the channel into the time-series store.
pub struct IngressLoop {
    rx: mpsc::Receiver<TimeSeriesSample>,
    series: Arc<TimeSeriesStore>,
}

/// Build the bounded sample channel.
pub fn sample_channel(
    series: Arc<TimeSeriesStore>,
    capacity: usize,
) -> (SampleIngress, IngressLoop) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (SampleIngress { tx }, IngressLoop { rx, series })
}

impl IngressLoop {
    pub async fn run(mut self, shutdown: Arc<Notify>) {
        loop {
            tokio::select! {
                sample = self.rx.recv() => {
                    match sample {
                        Some(sample) => {
                            // Typed rejects (late, bad quality, full
                            // window) are counted by the store; they
                            // are expected and never stop the loop.
                            if let Err(e) = self.series.ingest(&sample) {
                                debug!(point_id = %sample.point_id, error = %e, "sample rejected");
                            }
                        }
                        None => {
                            info!("sample channel closed, ingress loop exiting");
                            return;
                        }
                    }
                }
                _ = shutdown.notified() => {
                    info!("ingress loop shutting down");
                    return;
                }
            }
        }
    }
}

/// Drive the ingress from newline-delimited JSON samples.
///
/// Returns the number of samples submitted. Unparseable lines are
/// logged and skipped; the feed ends on EOF, a read error, or a closed
/// ingress channel. The worker binary runs this over stdin.
pub async fn feed_jsonl<R>(reader: R, ingress: &SampleIngress) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut submitted = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TimeSeriesSample>(line) {
                    Ok(sample) => {
                        if ingress.submit(sample).await.is_err() {
                            return submitted;
                        }
                        submitted += 1;
                    }
                    Err(e) => warn!(error = %e, "unparseable sample line, skipping"),
                }
            }
            Ok(None) => return submitted,
            Err(e) => {
                warn!(error = %e, "sample input read failed");
                return submitted;
            }
        }
    }
}

/// Enqueues a realtime tick on a fixed interval.
pub struct TickScheduler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl TickScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    pub async fn run(&self, shutdown: Arc<Notify>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Skip the immediate first tick.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self
                        .orchestrator
                        .enqueue(faultline_core::model::ExecutionRequest::realtime_tick())
                        .await
                    {
                        warn!(error = %e, "failed to enqueue realtime tick");
                    }
                }
                _ = shutdown.notified() => {
                    info!("tick scheduler shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use faultline_core::Config;

    #[tokio::test]
    async fn test_ingress_delivers_samples_to_store() {
        let config = Config::for_tests();
        let series = Arc::new(TimeSeriesStore::new(&config.buffer));
        let (ingress, ingress_loop) = sample_channel(series.clone(), 16);

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(ingress_loop.run(shutdown.clone()));

        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        ingress
            .submit(TimeSeriesSample::new("p1", at, 42.0))
            .await
            .unwrap();

        // Wait for the loop to drain the channel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(series.snapshot("p1", at).unwrap().last.value, 42.0);

        shutdown.notify_waiters();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_sample_does_not_stop_loop() {
        let config = Config::for_tests();
        let series = Arc::new(TimeSeriesStore::new(&config.buffer));
        let (ingress, ingress_loop) = sample_channel(series.clone(), 16);

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(ingress_loop.run(shutdown.clone()));

        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        // NaN is unusable and gets rejected at the buffer.
        ingress
            .submit(TimeSeriesSample::new("p1", at, f64::NAN))
            .await
            .unwrap();
        ingress
            .submit(TimeSeriesSample::new("p1", at, 1.0))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(series.snapshot("p1", at).unwrap().last.value, 1.0);
        assert_eq!(series.metrics().snapshot().quality_rejected, 1);

        shutdown.notify_waiters();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_jsonl_feed_parses_and_skips_bad_lines() {
        let config = Config::for_tests();
        let series = Arc::new(TimeSeriesStore::new(&config.buffer));
        let (ingress, ingress_loop) = sample_channel(series.clone(), 16);

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(ingress_loop.run(shutdown.clone()));

        let input: &[u8] = br#"{"point_id":"p1","timestamp":"2023-11-14T22:13:20Z","value":42.0}
not json
"#;
        let submitted = feed_jsonl(tokio::io::BufReader::new(input), &ingress).await;
        assert_eq!(submitted, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(series.snapshot("p1", at).unwrap().last.value, 42.0);

        shutdown.notify_waiters();
        handle.await.unwrap();
    }
}
