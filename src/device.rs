//! Foreground loop of the acquisition front end.
//!
//! Each [`Device::poll`] call services at most one command byte and then
//! checks the buffer: a full buffer is sent as one data frame and, unless the
//! trigger gate takes over, handed back to the completion handler by resetting
//! the cursor. Nothing in here blocks; waits for a parameter byte or for a
//! trigger crossing are states that carry over between polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::buffer::AcquisitionEngine;
use crate::controller::{SamplingController, Status, TriggerPoll};
use crate::converter::Converter;
use crate::errors::{Result, SettingsError};
use crate::protocol::{
    encode_data_frame, encode_settings, encode_status, Command, CommandDecoder, SettingsReport,
};
use crate::settings::{ConfigurationStore, SamplingSettings};
use crate::transport::Transport;

/// Sleep between polls when a poll found nothing to do.
const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_micros(200);

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub initial: SamplingSettings,
    pub idle_interval: Duration,
    /// Give up on a trigger hold after this long. `None` waits indefinitely.
    pub trigger_timeout: Option<Duration>,
    /// Drop a command whose parameter byte does not arrive in time. `None`
    /// waits indefinitely.
    pub parameter_timeout: Option<Duration>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            initial: SamplingSettings::default(),
            idle_interval: DEFAULT_IDLE_INTERVAL,
            trigger_timeout: None,
            parameter_timeout: None,
        }
    }
}

pub struct Device<T, C> {
    transport: T,
    converter: C,
    engine: Arc<AcquisitionEngine>,
    controller: SamplingController,
    store: ConfigurationStore,
    decoder: CommandDecoder,
    idle_interval: Duration,
    trigger_timeout: Option<Duration>,
    frames_sent: u64,
}

impl<T: Transport, C: Converter> Device<T, C> {
    /// Bring the device up: program the converter from the initial settings
    /// and start free-running acquisition.
    pub fn new(
        transport: T,
        mut converter: C,
        engine: Arc<AcquisitionEngine>,
        config: DeviceConfig,
    ) -> Self {
        let store = ConfigurationStore::new(config.initial);
        store.apply_all(&mut converter);
        engine.set_enabled(true);
        engine.buffer().reset();

        let s = store.settings();
        info!(
            "Front end up: channel=A{} divider_index={} ({:.2} kSPS) reference={}",
            s.input_channel,
            s.rate_divider_index,
            s.rate().map_or(0.0, |r| r.rate_ksps()),
            if s.use_internal_reference { "internal" } else { "supply" }
        );

        Self {
            transport,
            converter,
            controller: SamplingController::new(Arc::clone(&engine)),
            engine,
            store,
            decoder: CommandDecoder::new(config.parameter_timeout),
            idle_interval: config.idle_interval,
            trigger_timeout: config.trigger_timeout,
            frames_sent: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Foreground loop
    // ------------------------------------------------------------------------

    /// Run one loop iteration. Returns whether anything happened.
    pub fn poll(&mut self) -> Result<bool> {
        let now = Instant::now();
        let mut busy = false;

        match self.transport.read_byte()? {
            Some(byte) => {
                busy = true;
                if let Some(cmd) = self.decoder.push(byte, now) {
                    self.dispatch(cmd)?;
                }
            }
            None => {
                self.decoder.expire(now);
            }
        }

        busy |= self.service_acquisition(now)?;
        Ok(busy)
    }

    /// Poll until `shutdown` is set.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Acquire) {
            if !self.poll()? {
                thread::sleep(self.idle_interval);
            }
        }
        info!("Front end stopping after {} data frames", self.frames_sent);
        Ok(())
    }

    /// Execute a decoded command and send its reply, if any.
    pub fn dispatch(&mut self, cmd: Command) -> Result<()> {
        debug!("Command: {:?}", cmd);
        match cmd {
            Command::SetDivider(index) => {
                match self.store.set_rate_divider(index, &mut self.converter) {
                    Ok(()) => self.send_settings(),
                    Err(e) => {
                        ignore(e);
                        Ok(())
                    }
                }
            }
            Command::Toggle => {
                let status = self.controller.toggle(&mut self.converter);
                self.send_status(status)
            }
            Command::QuerySettings => self.send_settings(),
            Command::SetChannel(ch) => match self.store.set_input_channel(ch, &mut self.converter) {
                Ok(()) => self.send_settings(),
                Err(e) => {
                    ignore(e);
                    Ok(())
                }
            },
            Command::SetReference(internal) => {
                self.store
                    .set_voltage_reference(internal, &mut self.converter);
                self.send_settings()
            }
            Command::ArmTrigger(level) => {
                self.controller.arm_trigger(&mut self.store, level);
                self.send_status(self.controller.status())
            }
            Command::DisarmTrigger => {
                self.controller.disarm_trigger(&mut self.store);
                self.send_status(self.controller.status())
            }
        }
    }

    fn service_acquisition(&mut self, now: Instant) -> Result<bool> {
        if self.controller.is_holding() {
            let level = self.store.settings().trigger_level;
            let outcome = self
                .controller
                .poll_trigger(level, self.trigger_timeout, now);
            return Ok(matches!(outcome, TriggerPoll::Released | TriggerPoll::TimedOut));
        }

        if !self.engine.is_enabled() {
            return Ok(false);
        }
        let Some(samples) = self.engine.buffer().take_full() else {
            return Ok(false);
        };

        self.transport.write_frame(&encode_data_frame(&samples))?;
        self.frames_sent += 1;

        if self.store.settings().trigger_mode {
            self.controller.hold_for_trigger(now);
        } else {
            self.engine.buffer().reset();
        }
        Ok(true)
    }

    fn send_settings(&mut self) -> Result<()> {
        let report = SettingsReport::from_settings(self.store.settings());
        self.transport.write_frame(&encode_settings(&report))
    }

    fn send_status(&mut self, status: Status) -> Result<()> {
        self.transport.write_frame(&encode_status(&status))
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn status(&self) -> Status {
        self.controller.status()
    }

    pub fn settings(&self) -> &SamplingSettings {
        self.store.settings()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn engine(&self) -> &Arc<AcquisitionEngine> {
        &self.engine
    }

    pub fn converter(&self) -> &C {
        &self.converter
    }

    pub fn is_waiting_for_trigger(&self) -> bool {
        self.controller.is_holding()
    }
}

/// Rejected settings never reach the host.
fn ignore(e: SettingsError) {
    debug!("Ignoring command: {}", e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BUFFER_CAPACITY;
    use crate::converter::tests::{Call, RecordingConverter};
    use crate::protocol::DATA_FRAME_LEN;
    use crate::settings::RATE_TABLE;
    use crate::transport::MemoryLink;

    struct Bench {
        device: Device<MemoryLink, RecordingConverter>,
        host: MemoryLink,
        engine: Arc<AcquisitionEngine>,
    }

    fn bench_with(config: DeviceConfig) -> Bench {
        let (device_end, host) = MemoryLink::pair();
        let engine = Arc::new(AcquisitionEngine::new(true));
        let device = Device::new(
            device_end,
            RecordingConverter::default(),
            Arc::clone(&engine),
            config,
        );
        Bench {
            device,
            host,
            engine,
        }
    }

    fn bench() -> Bench {
        bench_with(DeviceConfig::default())
    }

    impl Bench {
        fn send(&mut self, bytes: &[u8]) -> Vec<u8> {
            self.host.write_frame(bytes).unwrap();
            for _ in 0..bytes.len() {
                self.device.poll().unwrap();
            }
            self.host.take_received()
        }

        fn fill(&self, value: u8) {
            for _ in 0..BUFFER_CAPACITY {
                self.engine.on_conversion_complete(value);
            }
        }
    }

    #[test]
    fn power_on_programs_converter() {
        let b = bench();
        assert_eq!(
            b.device.converter().calls,
            vec![
                Call::DisableAutoRetrigger,
                Call::Configure {
                    channel: 0,
                    divider_index: 3,
                    internal_ref: false
                },
                Call::ArmAutoTrigger,
            ]
        );
        assert_eq!(
            b.device.status(),
            Status {
                enabled: true,
                paused: false
            }
        );
    }

    #[test]
    fn query_and_toggle_scenario() {
        let mut b = bench();
        assert_eq!(b.send(b"R"), vec![b'S', 3, 76, 90]);
        assert_eq!(b.send(b"S"), vec![b'X', 0, 0]);
        assert_eq!(b.send(b"S"), vec![b'X', 1, 0]);
    }

    #[test]
    fn every_valid_divider_round_trips() {
        let mut b = bench();
        for (i, entry) in RATE_TABLE.iter().enumerate() {
            let reply = b.send(&[b'P', i as u8]);
            assert_eq!(
                reply,
                vec![
                    b'S',
                    i as u8,
                    entry.rate_integer() as u8,
                    entry.rate_hundredths()
                ]
            );
            assert_eq!(b.send(b"R"), reply);
        }
    }

    #[test]
    fn invalid_divider_is_silent() {
        let mut b = bench();
        let before = *b.device.settings();
        let calls = b.device.converter().calls.len();
        for index in [7u8, 8, 100, 255] {
            assert!(b.send(&[b'P', index]).is_empty());
        }
        assert_eq!(*b.device.settings(), before);
        assert_eq!(b.device.converter().calls.len(), calls);
    }

    #[test]
    fn unknown_commands_are_discarded() {
        let mut b = bench();
        assert!(b.send(b"zQ\x00").is_empty());
        assert_eq!(b.send(b"R"), vec![b'S', 3, 76, 90]);
    }

    #[test]
    fn parameter_byte_may_arrive_on_a_later_poll() {
        let mut b = bench();
        assert!(b.send(b"P").is_empty());
        // other polls run while the parameter is outstanding
        for _ in 0..10 {
            b.device.poll().unwrap();
        }
        assert_eq!(b.send(&[1]), vec![b'S', 1, 51, 70]);
    }

    #[test]
    fn stalled_parameter_is_dropped_with_timeout() {
        let mut b = bench_with(DeviceConfig {
            parameter_timeout: Some(Duration::from_millis(5)),
            ..DeviceConfig::default()
        });
        assert!(b.send(b"P").is_empty());
        thread::sleep(Duration::from_millis(10));
        b.device.poll().unwrap();
        // 'R' is now read as a command, not as the divider index
        assert_eq!(b.send(b"R"), vec![b'S', 3, 76, 90]);
    }

    #[test]
    fn full_buffer_emits_one_data_frame() {
        let mut b = bench();
        for i in 0..BUFFER_CAPACITY {
            assert!(b.engine.on_conversion_complete(i as u8));
        }
        assert!(!b.engine.on_conversion_complete(0xEE));

        assert!(b.device.poll().unwrap());
        let out = b.host.take_received();
        assert_eq!(out.len(), DATA_FRAME_LEN);
        assert_eq!(&out[..2], &[0xFF, 0xAA]);
        assert_eq!(&out[402..], &[0x55, 0xEE]);
        for (i, &s) in out[2..402].iter().enumerate() {
            assert_eq!(s, i as u8);
        }
        assert!(b.engine.buffer().is_empty());
        assert_eq!(b.device.frames_sent(), 1);

        // nothing more until the next 400 samples
        assert!(!b.device.poll().unwrap());
        assert!(b.host.take_received().is_empty());
    }

    #[test]
    fn partial_buffer_is_not_sent() {
        let mut b = bench();
        for _ in 0..BUFFER_CAPACITY - 1 {
            b.engine.on_conversion_complete(1);
        }
        b.device.poll().unwrap();
        assert!(b.host.take_received().is_empty());
        b.engine.on_conversion_complete(1);
        b.device.poll().unwrap();
        assert_eq!(b.host.take_received().len(), DATA_FRAME_LEN);
    }

    #[test]
    fn disabled_device_collects_nothing() {
        let mut b = bench();
        assert_eq!(b.send(b"S"), vec![b'X', 0, 0]);
        assert!(!b.engine.on_conversion_complete(5));
        assert!(b.engine.buffer().is_empty());
        b.device.poll().unwrap();
        assert!(b.host.take_received().is_empty());
    }

    #[test]
    fn trigger_holds_collection_until_level() {
        let mut b = bench();
        assert_eq!(b.send(&[b'T', 180]), vec![b'X', 1, 0]);
        assert!(b.device.settings().trigger_mode);

        b.fill(50);
        b.device.poll().unwrap();
        assert_eq!(b.host.take_received().len(), DATA_FRAME_LEN);
        assert!(b.device.is_waiting_for_trigger());

        // below the level: held, samples rejected, no new frame
        b.engine.on_conversion_complete(179);
        b.device.poll().unwrap();
        assert!(b.device.is_waiting_for_trigger());
        assert!(b.host.take_received().is_empty());

        // commands still work during the hold
        assert_eq!(b.send(b"R"), vec![b'S', 3, 76, 90]);

        b.engine.on_conversion_complete(180);
        b.device.poll().unwrap();
        assert!(!b.device.is_waiting_for_trigger());
        assert!(b.engine.buffer().is_empty());

        b.fill(200);
        b.device.poll().unwrap();
        let frame = b.host.take_received();
        assert_eq!(frame.len(), DATA_FRAME_LEN);
        assert!(frame[2..402].iter().all(|&s| s == 200));
    }

    #[test]
    fn disarming_trigger_releases_hold() {
        let mut b = bench();
        b.send(&[b'T', 255]);
        b.fill(0);
        b.device.poll().unwrap();
        b.host.take_received();
        assert!(b.device.is_waiting_for_trigger());

        assert_eq!(b.send(b"N"), vec![b'X', 1, 0]);
        assert!(!b.device.is_waiting_for_trigger());
        assert!(b.engine.buffer().is_empty());
    }

    #[test]
    fn channel_and_reference_commands() {
        let mut b = bench();
        assert_eq!(b.send(&[b'C', 2]), vec![b'S', 3, 76, 90]);
        assert_eq!(b.device.settings().input_channel, 2);
        assert!(b.send(&[b'C', 6]).is_empty());
        assert_eq!(b.device.settings().input_channel, 2);

        assert_eq!(b.send(&[b'V', 1]), vec![b'S', 3, 76, 90]);
        assert!(b.device.settings().use_internal_reference);
        assert_eq!(
            b.device.converter().calls.last(),
            Some(&Call::Configure {
                channel: 2,
                divider_index: 3,
                internal_ref: true
            })
        );
    }

    #[test]
    fn toggle_restart_discards_partial_buffer() {
        let mut b = bench();
        for _ in 0..250 {
            b.engine.on_conversion_complete(3);
        }
        b.send(b"S");
        assert_eq!(b.engine.buffer().len(), 250);
        b.send(b"S");
        assert!(b.engine.buffer().is_empty());
    }
}
