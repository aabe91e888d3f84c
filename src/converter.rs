//! Converter peripheral boundary and a simulated implementation.
//!
//! The device core only ever asks the converter to configure itself, to arm
//! free-running (auto-trigger) conversions, or to stop re-issuing them. Each
//! finished conversion is reported by calling
//! [`AcquisitionEngine::on_conversion_complete`] from the converter's own
//! execution context, which plays the role of the completion interrupt.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::buffer::AcquisitionEngine;
use crate::errors::Result;
use crate::settings::RATE_TABLE;

/// Interval between simulated interrupt bursts.
const TICK: Duration = Duration::from_millis(1);

/// Upper bound on conversions delivered in one burst, so a stalled host
/// thread does not produce an unbounded catch-up.
const MAX_BURST: usize = 4096;

/// Supply reference relative to the internal 1.1 V bandgap.
const SUPPLY_TO_INTERNAL_GAIN: f64 = 5.0 / 1.1;

pub trait Converter {
    /// Select input, clock divider and reference.
    fn configure(&mut self, channel: u8, divider_index: u8, use_internal_ref: bool);
    /// Enable the converter in free-running mode with completion notifications.
    fn arm_auto_trigger(&mut self);
    /// Stop re-issuing conversions. The converter stays powered.
    fn disable_auto_retrigger(&mut self);
}

struct SimShared {
    armed: AtomicBool,
    channel: AtomicU8,
    divider_index: AtomicU8,
    internal_ref: AtomicBool,
    shutdown: AtomicBool,
}

/// Converter backed by a worker thread generating a synthetic signal.
///
/// Each input channel carries a sine of a different frequency. Rates follow
/// the divider table, divided by `slowdown` so slow links can keep up.
pub struct SimulatedConverter {
    shared: Arc<SimShared>,
    worker: Option<JoinHandle<()>>,
}

impl SimulatedConverter {
    pub fn spawn(engine: Arc<AcquisitionEngine>, slowdown: u32) -> Result<Self> {
        let shared = Arc::new(SimShared {
            armed: AtomicBool::new(false),
            channel: AtomicU8::new(0),
            divider_index: AtomicU8::new(0),
            internal_ref: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let slowdown = slowdown.max(1);
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("adc-sim".into())
                .spawn(move || run_worker(&shared, &engine, slowdown))?
        };
        debug!("Simulated converter started (slowdown={})", slowdown);
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn is_armed(&self) -> bool {
        self.shared.armed.load(Ordering::Acquire)
    }
}

impl Converter for SimulatedConverter {
    fn configure(&mut self, channel: u8, divider_index: u8, use_internal_ref: bool) {
        self.shared.channel.store(channel, Ordering::Release);
        self.shared.divider_index.store(divider_index, Ordering::Release);
        self.shared
            .internal_ref
            .store(use_internal_ref, Ordering::Release);
    }

    fn arm_auto_trigger(&mut self) {
        self.shared.armed.store(true, Ordering::Release);
    }

    fn disable_auto_retrigger(&mut self) {
        self.shared.armed.store(false, Ordering::Release);
    }
}

impl Drop for SimulatedConverter {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Simulated converter worker panicked");
            }
        }
    }
}

fn run_worker(shared: &SimShared, engine: &AcquisitionEngine, slowdown: u32) {
    let mut last = Instant::now();
    let mut pending = 0.0f64;
    let mut produced: u64 = 0;

    while !shared.shutdown.load(Ordering::Acquire) {
        thread::sleep(TICK);
        let now = Instant::now();
        let elapsed = now.duration_since(last);
        last = now;

        if !shared.armed.load(Ordering::Acquire) {
            pending = 0.0;
            continue;
        }

        let index = shared.divider_index.load(Ordering::Acquire) as usize;
        let rate = RATE_TABLE[index % RATE_TABLE.len()].samples_per_second() / slowdown as f64;
        pending += elapsed.as_secs_f64() * rate;

        let due = pending.floor() as usize;
        if due > MAX_BURST {
            pending = 0.0;
        } else {
            pending -= due as f64;
        }

        let channel = shared.channel.load(Ordering::Acquire);
        let internal = shared.internal_ref.load(Ordering::Acquire);
        for _ in 0..due.min(MAX_BURST) {
            let t = produced as f64 / rate;
            engine.on_conversion_complete(synthetic_sample(channel, internal, t));
            produced = produced.wrapping_add(1);
        }
    }
}

/// Signal seen on `channel` at time `t` seconds, as an 8-bit reading.
pub fn synthetic_sample(channel: u8, use_internal_ref: bool, t: f64) -> u8 {
    let freq = 50.0 * (channel as f64 + 1.0);
    let mut swing = 0.4 * (TAU * freq * t).sin();
    if use_internal_ref {
        swing *= SUPPLY_TO_INTERNAL_GAIN;
    }
    let level = (0.5 + swing).clamp(0.0, 1.0);
    (level * 255.0) as u8
}
