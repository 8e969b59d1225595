//! Hysteresis state machine for model residency.
//!
//! Pure and synchronous: the controller feeds it samples, reload requests and
//! lifecycle results, and performs whatever [`Directive`] comes back.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::config::GhostCfg;
use crate::types::{CryostasisPhase, CryostasisState, LifecycleOp, ResourceSample};

/// How one sample counts toward the debounce streaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pressure {
    High(String),
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: CryostasisPhase,
    pub to: CryostasisPhase,
    pub reason: String,
}

/// What the controller must do after feeding the machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directive {
    pub transition: Option<Transition>,
    pub start: Option<(LifecycleOp, String)>,
}

impl Directive {
    pub fn is_empty(&self) -> bool {
        self.transition.is_none() && self.start.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PressurePolicy {
    gpu_threshold: f32,
    cpu_threshold: f32,
    vram_threshold_mb: f32,
    exempt: HashSet<String>,
    blacklist: HashSet<String>,
}

impl PressurePolicy {
    pub fn from_cfg(cfg: &GhostCfg) -> Self {
        let lower = |v: &[String]| v.iter().map(|p| p.to_lowercase()).collect();
        Self {
            gpu_threshold: cfg.gpu_threshold_percent,
            cpu_threshold: cfg.cpu_threshold_percent,
            vram_threshold_mb: cfg.vram_threshold_mb,
            exempt: lower(&cfg.exempt_processes),
            blacklist: lower(&cfg.blacklist_processes),
        }
    }

    /// Blacklisted processes force pressure. Otherwise a sample is high when GPU
    /// utilization, VRAM use or CPU utilization exceeds its threshold and no
    /// exempt process is running.
    pub fn classify(&self, sample: &ResourceSample) -> Pressure {
        if let Some(name) = sample.running_process_names.iter().find(|p| self.blacklist.contains(*p)) {
            return Pressure::High(format!("blacklisted process running: {name}"));
        }

        let over = if sample.gpu_percent > self.gpu_threshold {
            Some(format!("gpu {:.0}% > {:.0}%", sample.gpu_percent, self.gpu_threshold))
        } else if sample.vram_used_mb > self.vram_threshold_mb {
            Some(format!("vram {:.0}MiB > {:.0}MiB", sample.vram_used_mb, self.vram_threshold_mb))
        } else if sample.cpu_percent > self.cpu_threshold {
            Some(format!("cpu {:.0}% > {:.0}%", sample.cpu_percent, self.cpu_threshold))
        } else {
            None
        };
        let Some(reason) = over else {
            return Pressure::Low;
        };

        if sample.running_process_names.iter().any(|p| self.exempt.contains(p)) {
            return Pressure::Low;
        }
        Pressure::High(reason)
    }
}

#[derive(Debug, Clone)]
pub struct CryostasisMachine {
    state: CryostasisState,
    policy: PressurePolicy,
    high_debounce: u32,
    low_debounce: u32,
    reload_after_unload: bool,
    wake_cooldown: chrono::TimeDelta,
    last_wake: Option<DateTime<Utc>>,
}

impl CryostasisMachine {
    pub fn new(cfg: &GhostCfg, now: DateTime<Utc>) -> Self {
        Self {
            state: CryostasisState::resident(now),
            policy: PressurePolicy::from_cfg(cfg),
            high_debounce: cfg.high_debounce.max(1),
            low_debounce: cfg.low_debounce.max(1),
            reload_after_unload: false,
            wake_cooldown: i64::try_from(cfg.wake_cooldown_secs)
                .ok()
                .and_then(chrono::TimeDelta::try_seconds)
                .unwrap_or(chrono::TimeDelta::MAX),
            last_wake: None,
        }
    }

    pub fn state(&self) -> &CryostasisState {
        &self.state
    }

    pub fn observe(&mut self, sample: &ResourceSample, now: DateTime<Utc>) -> Directive {
        let pressure = self.policy.classify(sample);
        let s = &mut self.state;
        let reason = match &pressure {
            Pressure::High(reason) => {
                s.consecutive_high_samples = s.consecutive_high_samples.saturating_add(1);
                s.consecutive_low_samples = 0;
                reason.clone()
            }
            Pressure::Low => {
                s.consecutive_low_samples = s.consecutive_low_samples.saturating_add(1);
                s.consecutive_high_samples = 0;
                "resources released".to_string()
            }
        };

        let high = s.consecutive_high_samples >= self.high_debounce;
        let low = s.consecutive_low_samples >= self.low_debounce;
        let idle = s.operation_in_flight.is_none();
        let phase = s.phase;
        let settled = self.last_wake.is_none_or(|at| now - at >= self.wake_cooldown);

        match phase {
            CryostasisPhase::Resident if high && !settled => {
                tracing::debug!("wake cooldown active, ignoring pressure");
                Directive::default()
            }
            CryostasisPhase::Resident if high => self.enter(CryostasisPhase::Cooling, reason, now),
            CryostasisPhase::Cooling if high && idle => self.start(LifecycleOp::Unload, reason),
            CryostasisPhase::Cooling if low && idle => self.enter(CryostasisPhase::Resident, reason, now),
            CryostasisPhase::Unloaded if low && idle => self.start(LifecycleOp::Load, reason),
            _ => Directive::default(),
        }
    }

    /// On-demand wake. Ignored while the model is resident; joins an in-flight
    /// load; deferred until an in-flight unload finishes.
    pub fn request_reload(&mut self) -> Directive {
        match (self.state.phase, self.state.operation_in_flight) {
            (CryostasisPhase::Unloaded, None) => self.start(LifecycleOp::Load, "reload requested".into()),
            (_, Some(LifecycleOp::Unload)) => {
                self.reload_after_unload = true;
                Directive::default()
            }
            _ => Directive::default(),
        }
    }

    /// Record the result of the in-flight operation. Failures keep the phase so
    /// the next qualifying sample retries.
    pub fn finish(&mut self, op: LifecycleOp, succeeded: bool, now: DateTime<Utc>) -> Directive {
        if self.state.operation_in_flight != Some(op) {
            tracing::warn!(op = op.as_str(), "completion for an operation that was not in flight");
            return Directive::default();
        }
        self.state.operation_in_flight = None;
        let reload = std::mem::take(&mut self.reload_after_unload);

        match (op, succeeded, self.state.phase) {
            (LifecycleOp::Unload, true, CryostasisPhase::Cooling) => {
                let mut d = self.enter(CryostasisPhase::Unloaded, "model unloaded".into(), now);
                if reload {
                    d.start = self.start(LifecycleOp::Load, "reload requested during unload".into()).start;
                }
                d
            }
            (LifecycleOp::Load, true, CryostasisPhase::Unloaded) => {
                self.last_wake = Some(now);
                self.enter(CryostasisPhase::Resident, "model loaded".into(), now)
            }
            _ => Directive::default(),
        }
    }

    fn enter(&mut self, to: CryostasisPhase, reason: String, now: DateTime<Utc>) -> Directive {
        let from = self.state.phase;
        self.state.phase = to;
        self.state.last_transition_at = now;
        self.state.consecutive_high_samples = 0;
        self.state.consecutive_low_samples = 0;
        Directive { transition: Some(Transition { from, to, reason }), start: None }
    }

    fn start(&mut self, op: LifecycleOp, reason: String) -> Directive {
        self.state.operation_in_flight = Some(op);
        Directive { transition: None, start: Some((op, reason)) }
    }
}
