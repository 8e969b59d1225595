use chrono::{DateTime, Local, Timelike};
use std::sync::Arc;
use tokio::sync::watch;

use crate::bus::{Event, EventBus, EventTag};
use crate::emotion::phase_name;
use crate::types::{CryostasisPhase, CryostasisState, ResourceSample};

/// A source of ambient context for the system prompt.
pub trait Sensor: Send + Sync {
    fn name(&self) -> &str;

    /// One or more lines of context, or `None` when there is nothing to say.
    fn context(&self) -> Option<String>;
}

/// Local wall-clock time and part of the day.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeSensor {
    fixed: Option<DateTime<Local>>,
}

impl TimeSensor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always report `at` instead of the current time.
    pub fn fixed(at: DateTime<Local>) -> Self {
        Self { fixed: Some(at) }
    }
}

impl Sensor for TimeSensor {
    fn name(&self) -> &str {
        "time"
    }

    fn context(&self) -> Option<String> {
        let now = self.fixed.unwrap_or_else(Local::now);
        Some(format!(
            "Current time: {} ({})\nPart of day: {}",
            now.format("%I:%M %p"),
            now.format("%A"),
            phase_name(now.hour()),
        ))
    }
}

/// Latest host resource sample and model residency.
#[derive(Debug, Clone)]
pub struct HardwareSensor {
    latest: watch::Receiver<Option<ResourceSample>>,
    cryostasis: Option<watch::Receiver<CryostasisState>>,
}

impl HardwareSensor {
    /// Track `ResourceSampled` events published on `bus`.
    pub fn attach(bus: &EventBus, cryostasis: Option<watch::Receiver<CryostasisState>>) -> Self {
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        bus.subscribe_fn(EventTag::ResourceSampled, move |event| {
            let tx = Arc::clone(&tx);
            async move {
                if let Event::ResourceSampled(sample) = event {
                    tx.send_replace(Some(sample));
                }
                Ok(())
            }
        });
        Self { latest: rx, cryostasis }
    }
}

impl Sensor for HardwareSensor {
    fn name(&self) -> &str {
        "hardware"
    }

    fn context(&self) -> Option<String> {
        let sample = self.latest.borrow().clone()?;
        let mut out = format!(
            "Host load: GPU {:.0}%, CPU {:.0}%",
            sample.gpu_percent, sample.cpu_percent
        );
        if sample.vram_used_mb > 0.0 {
            out.push_str(&format!(", VRAM {:.0} MiB", sample.vram_used_mb));
        }
        if let Some(rx) = &self.cryostasis
            && rx.borrow().phase == CryostasisPhase::Cooling
        {
            out.push_str("\nThe computer is busy; you may be put to sleep soon.");
        }
        Some(out)
    }
}

/// Sensors in fixed order. Empty sensors contribute nothing.
#[derive(Default)]
pub struct SensorSuite {
    sensors: Vec<Box<dyn Sensor>>,
}

impl SensorSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sensor: impl Sensor + 'static) -> Self {
        self.sensors.push(Box::new(sensor));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.sensors.iter().map(|s| s.name()).collect()
    }

    pub fn gather(&self) -> String {
        self.sensors
            .iter()
            .filter_map(|s| s.context())
            .filter(|c| !c.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
