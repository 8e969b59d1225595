pub mod host;

pub use host::HostMonitor;

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{Event, EventBus};
use crate::error::MonitorError;
use crate::types::ResourceSample;

/// Source of host resource observations.
#[async_trait::async_trait]
pub trait ResourceMonitor: Send + 'static {
    async fn sample(&mut self) -> Result<ResourceSample, MonitorError>;
}

/// Sample on a fixed interval and publish `ResourceSampled`.
/// A failed read skips that tick; nothing is published for it.
pub fn spawn_sampler(
    mut monitor: Box<dyn ResourceMonitor>,
    bus: EventBus,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("resource sampler shutting down");
                    break;
                }
                _ = ticker.tick() => {}
            }

            match monitor.sample().await {
                Ok(sample) => {
                    consecutive_failures = 0;
                    tracing::trace!(gpu = sample.gpu_percent, cpu = sample.cpu_percent, "resource sample");
                    bus.publish(Event::ResourceSampled(sample));
                }
                Err(e) => {
                    consecutive_failures += 1;
                    tracing::warn!(error = %e, consecutive_failures, "resource sample skipped");
                }
            }
        }
    })
}

/// Replays a fixed sequence of samples, then fails every later read.
#[derive(Debug, Default)]
pub struct ScriptedMonitor {
    samples: std::collections::VecDeque<Result<ResourceSample, String>>,
}

impl ScriptedMonitor {
    pub fn new(samples: Vec<Result<ResourceSample, String>>) -> Self {
        Self { samples: samples.into() }
    }
}

#[async_trait::async_trait]
impl ResourceMonitor for ScriptedMonitor {
    async fn sample(&mut self) -> Result<ResourceSample, MonitorError> {
        match self.samples.pop_front() {
            Some(Ok(sample)) => Ok(sample),
            Some(Err(reason)) => Err(MonitorError::Parse(reason)),
            None => Err(MonitorError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventTag;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn failed_reads_skip_the_tick() {
        let token = CancellationToken::new();
        let bus = EventBus::new(token.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe_fn(EventTag::ResourceSampled, move |event| {
            let tx = tx.clone();
            async move {
                if let Event::ResourceSampled(s) = event {
                    tx.send(s.gpu_percent)?;
                }
                Ok(())
            }
        });

        let monitor = ScriptedMonitor::new(vec![
            Ok(ResourceSample::new(10.0, 0.0)),
            Err("nvidia-smi garbage".into()),
            Ok(ResourceSample::new(30.0, 0.0)),
        ]);
        let handle = spawn_sampler(Box::new(monitor), bus, Duration::from_millis(100), token.clone());

        assert_eq!(rx.recv().await.unwrap(), 10.0);
        assert_eq!(rx.recv().await.unwrap(), 30.0);
        token.cancel();
        handle.await.unwrap();
    }
}
