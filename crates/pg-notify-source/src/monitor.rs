//! Idle monitor
//!
//! Waits on the notification stream and, when nothing arrives within the
//! idle window, fires a detached liveness probe against the source. The probe
//! is never awaited: the caller is back to waiting for the next event as soon
//! as the window elapses.

use futures::{Stream, StreamExt};
use pg_es_core::prelude::*;
use pg_es_core::SourceMetrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one wait
#[derive(Debug)]
pub enum Wake<T> {
    /// The stream produced an item, or ended (`None`)
    Item(Option<T>),
    /// The idle window elapsed and a probe was fired
    Idle,
}

/// Watches for silence on a stream and probes the source
pub struct IdleMonitor {
    window: Duration,
    target: Arc<dyn HealthCheck>,
    metrics: SourceMetrics,
    probes: AtomicU64,
}

impl IdleMonitor {
    pub fn new(target: Arc<dyn HealthCheck>, window: Duration) -> Self {
        Self {
            window,
            target,
            metrics: SourceMetrics::new("idle_monitor"),
            probes: AtomicU64::new(0),
        }
    }

    /// Number of probes fired so far
    pub fn probes_fired(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Wait for the next stream item or the end of the idle window
    pub async fn next<S>(&self, stream: &mut S) -> Wake<S::Item>
    where
        S: Stream + Unpin,
    {
        tokio::select! {
            item = stream.next() => Wake::Item(item),
            _ = tokio::time::sleep(self.window) => {
                info!(
                    idle_secs = self.window.as_secs(),
                    component = self.target.component_name(),
                    "No notification within idle window, probing connection"
                );
                self.fire_probe();
                Wake::Idle
            }
        }
    }

    /// Spawn a fire-and-forget probe
    pub fn fire_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);

        let target = self.target.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            match target.health_check().await {
                Ok(()) => {
                    debug!(component = target.component_name(), "Liveness probe succeeded");
                    metrics.record_probe(true);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        component = target.component_name(),
                        "Liveness probe failed"
                    );
                    metrics.record_probe(false);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct ProbeRecorder {
        tx: mpsc::UnboundedSender<()>,
        healthy: bool,
    }

    #[async_trait]
    impl HealthCheck for ProbeRecorder {
        async fn health_check(&self) -> Result<()> {
            let _ = self.tx.send(());
            if self.healthy {
                Ok(())
            } else {
                Err(SyncError::listener("connection closed"))
            }
        }

        fn component_name(&self) -> &'static str {
            "probe_recorder"
        }
    }

    fn monitor(healthy: bool) -> (IdleMonitor, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let target = Arc::new(ProbeRecorder { tx, healthy });
        (IdleMonitor::new(target, Duration::from_secs(90)), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_fires_one_probe_per_window() {
        let (monitor, mut probes) = monitor(true);
        let (_events_tx, events_rx) = mpsc::unbounded_channel::<u32>();
        let mut events = futures::stream::unfold(events_rx, |mut rx| async move {
            rx.recv().await.map(|v| (v, rx))
        })
        .boxed();

        let start = Instant::now();
        assert!(matches!(monitor.next(&mut events).await, Wake::Idle));
        assert!(start.elapsed() >= Duration::from_secs(90));
        assert_eq!(monitor.probes_fired(), 1);

        // The probe runs detached; wait for it to report
        probes.recv().await.unwrap();
        assert!(probes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_before_window_does_not_probe() {
        let (monitor, mut probes) = monitor(true);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<u32>();
        let mut events = futures::stream::unfold(events_rx, |mut rx| async move {
            rx.recv().await.map(|v| (v, rx))
        })
        .boxed();

        events_tx.send(7).unwrap();
        match monitor.next(&mut events).await {
            Wake::Item(Some(v)) => assert_eq!(v, 7),
            other => panic!("expected item, got {:?}", other),
        }
        assert_eq!(monitor.probes_fired(), 0);
        tokio::task::yield_now().await;
        assert!(probes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_for_next_event_after_failed_probe() {
        let (monitor, mut probes) = monitor(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<u32>();
        let mut events = futures::stream::unfold(events_rx, |mut rx| async move {
            rx.recv().await.map(|v| (v, rx))
        })
        .boxed();

        assert!(matches!(monitor.next(&mut events).await, Wake::Idle));
        probes.recv().await.unwrap();

        events_tx.send(1).unwrap();
        let start = Instant::now();
        assert!(matches!(monitor.next(&mut events).await, Wake::Item(Some(1))));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(monitor.probes_fired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_is_reported() {
        let (monitor, _probes) = monitor(true);
        let mut events = futures::stream::iter(Vec::<u32>::new());
        assert!(matches!(monitor.next(&mut events).await, Wake::Item(None)));
    }
}
