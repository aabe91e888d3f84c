//! Sampling state machine: enabled/paused plus the software trigger gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::AcquisitionEngine;
use crate::converter::Converter;
use crate::settings::ConfigurationStore;

/// Reported sampling state.
///
/// `paused` is only ever reported while `enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub enabled: bool,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerGate {
    Free,
    Holding { since: Instant },
}

/// Outcome of one trigger-gate poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPoll {
    /// No hold in progress.
    Idle,
    /// Still waiting for the level crossing.
    Waiting,
    /// Level reached; collection restarted from cursor 0.
    Released,
    /// Gave up waiting; collection restarted from cursor 0.
    TimedOut,
}

pub struct SamplingController {
    engine: Arc<AcquisitionEngine>,
    paused: bool,
    gate: TriggerGate,
}

impl SamplingController {
    pub fn new(engine: Arc<AcquisitionEngine>) -> Self {
        Self {
            engine,
            paused: false,
            gate: TriggerGate::Free,
        }
    }

    pub fn status(&self) -> Status {
        let enabled = self.engine.is_enabled();
        Status {
            enabled,
            paused: enabled && self.paused,
        }
    }

    pub fn start<C: Converter>(&mut self, converter: &mut C) -> Status {
        self.engine.set_enabled(true);
        self.paused = false;
        self.gate = TriggerGate::Free;
        self.engine.buffer().reset();
        converter.arm_auto_trigger();
        info!("Sampling started");
        self.status()
    }

    pub fn stop<C: Converter>(&mut self, converter: &mut C) -> Status {
        self.paused = true;
        converter.disable_auto_retrigger();
        info!("Sampling stopped");
        self.status()
    }

    pub fn toggle<C: Converter>(&mut self, converter: &mut C) -> Status {
        let enabled = !self.engine.is_enabled();
        self.engine.set_enabled(enabled);
        if enabled {
            self.start(converter)
        } else {
            self.stop(converter)
        }
    }

    pub fn arm_trigger(&mut self, store: &mut ConfigurationStore, level: u8) {
        store.set_trigger(true, level);
        info!("Trigger armed at level {}", level);
    }

    /// Leave trigger mode. A hold in progress is released immediately.
    pub fn disarm_trigger(&mut self, store: &mut ConfigurationStore) {
        let level = store.settings().trigger_level;
        store.set_trigger(false, level);
        if self.is_holding() {
            self.release();
        }
        info!("Trigger disarmed");
    }

    pub fn is_holding(&self) -> bool {
        matches!(self.gate, TriggerGate::Holding { .. })
    }

    /// Keep the just-emitted buffer full (so the handler rejects samples)
    /// until the trigger level is seen.
    pub fn hold_for_trigger(&mut self, now: Instant) {
        debug!("Holding collection for trigger");
        self.gate = TriggerGate::Holding { since: now };
    }

    pub fn poll_trigger(&mut self, level: u8, timeout: Option<Duration>, now: Instant) -> TriggerPoll {
        let TriggerGate::Holding { since } = self.gate else {
            return TriggerPoll::Idle;
        };
        let latest = self.engine.latest_sample();
        if latest >= level {
            debug!("Trigger crossed: sample={} level={}", latest, level);
            self.release();
            return TriggerPoll::Released;
        }
        match timeout {
            Some(limit) if now.saturating_duration_since(since) >= limit => {
                warn!(
                    "Trigger level {} not reached within {:?}, resuming free-run",
                    level, limit
                );
                self.release();
                TriggerPoll::TimedOut
            }
            _ => TriggerPoll::Waiting,
        }
    }

    fn release(&mut self) {
        self.gate = TriggerGate::Free;
        self.engine.buffer().reset();
    }
}
