//! Host-side client for the acquisition front end.
//!
//! # Timing
//!
//! The front end does not timestamp anything. Data frames are sent as soon as
//! 400 samples have been collected, so the host can reconstruct sample times
//! as `frame_index * 400 / rate` only while the link keeps up: when the link
//! is slower than the converter, the device drops samples between frames and
//! the gaps are invisible on the wire.
//!
//! Replies to commands share the link with data frames. While waiting for a
//! reply, data frames that arrive first are queued and returned by the next
//! [`DaqClient::read_frames`].

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Serialize;

use crate::buffer::BUFFER_CAPACITY;
use crate::controller::Status;
use crate::protocol::{Command, Reply, ReplyParser, SettingsReport};
use crate::settings::{validate_channel, validate_divider_index};
use crate::transport::{BAUD_RATE, DEFAULT_TIMEOUT};

/// Maximum time to wait for a command reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a command so the device's foreground loop can pick it up.
const COMMAND_DELAY: Duration = Duration::from_millis(5);

trait Link: Read + Write + Send {}
impl<T: Read + Write + Send> Link for T {}

/// One data frame as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataFrame {
    pub samples: Vec<u8>,
}

impl DataFrame {
    pub fn min(&self) -> u8 {
        self.samples.iter().copied().min().unwrap_or(0)
    }

    pub fn max(&self) -> u8 {
        self.samples.iter().copied().max().unwrap_or(0)
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|&s| s as f64).sum::<f64>() / self.samples.len() as f64
    }
}

/// Result of reading data frames, with link statistics.
#[derive(Debug, Clone, Serialize)]
pub struct FrameBatch {
    pub frames: Vec<DataFrame>,
    /// Microseconds since the client was created when the batch read started.
    pub timestamp_us: u64,
    /// Bytes discarded while resynchronizing during this batch.
    pub sync_errors: usize,
}

/// Client that speaks the front end's serial protocol.
///
/// # Example
/// ```ignore
/// let mut client = DaqClient::connect_serial("/dev/ttyUSB0")?;
/// let settings = client.query_settings()?;
/// println!("rate: {:.2} kSPS", settings.rate_ksps());
/// let batch = client.read_frames(10)?;
/// ```
pub struct DaqClient {
    link: Box<dyn Link>,
    parser: ReplyParser,
    queued: VecDeque<DataFrame>,
    created: Instant,
    reply_timeout: Duration,
}

impl DaqClient {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    /// Open the front end's serial port at the default baud rate.
    pub fn connect_serial(path: &str) -> Result<Self> {
        Self::connect_serial_with_baud(path, BAUD_RATE)
    }

    pub fn connect_serial_with_baud(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(DEFAULT_TIMEOUT)
            .open()
            .with_context(|| format!("Failed to open serial port at {}", path))?;
        Ok(Self::from_stream(port))
    }

    /// Wrap any connected byte stream (serial port, in-memory link, socket).
    pub fn from_stream<S: Read + Write + Send + 'static>(stream: S) -> Self {
        Self {
            link: Box::new(stream),
            parser: ReplyParser::new(),
            queued: VecDeque::new(),
            created: Instant::now(),
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    pub fn query_settings(&mut self) -> Result<SettingsReport> {
        self.send(Command::QuerySettings)?;
        self.wait_settings()
    }

    /// Select a rate divider index (0-6).
    ///
    /// The device silently ignores invalid indices, so they are rejected here
    /// instead of waiting for a reply that never comes.
    pub fn set_divider(&mut self, index: u8) -> Result<SettingsReport> {
        validate_divider_index(index)?;
        self.send(Command::SetDivider(index))?;
        self.wait_settings()
    }

    pub fn set_channel(&mut self, channel: u8) -> Result<SettingsReport> {
        validate_channel(channel)?;
        self.send(Command::SetChannel(channel))?;
        self.wait_settings()
    }

    pub fn set_internal_reference(&mut self, internal: bool) -> Result<SettingsReport> {
        self.send(Command::SetReference(internal))?;
        self.wait_settings()
    }

    /// Flip acquisition on/off. Returns the new state.
    pub fn toggle(&mut self) -> Result<Status> {
        self.send(Command::Toggle)?;
        self.wait_status()
    }

    pub fn arm_trigger(&mut self, level: u8) -> Result<Status> {
        self.send(Command::ArmTrigger(level))?;
        self.wait_status()
    }

    pub fn disarm_trigger(&mut self) -> Result<Status> {
        self.send(Command::DisarmTrigger)?;
        self.wait_status()
    }

    /// Toggle until the device reports the wanted enabled state.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<Status> {
        let status = self.toggle()?;
        if status.enabled == enabled {
            return Ok(status);
        }
        self.toggle()
    }

    // ------------------------------------------------------------------------
    // Data
    // ------------------------------------------------------------------------

    /// Read `n_frames` data frames.
    ///
    /// Fails with a timeout if the device stops producing frames for longer
    /// than the reply timeout.
    pub fn read_frames(&mut self, n_frames: usize) -> Result<FrameBatch> {
        let timestamp_us = self.created.elapsed().as_micros() as u64;
        let errors_before = self.parser.sync_errors();
        let mut frames = Vec::with_capacity(n_frames);

        while frames.len() < n_frames {
            if let Some(frame) = self.queued.pop_front() {
                frames.push(frame);
                continue;
            }
            match self.next_reply(self.reply_timeout)? {
                Some(Reply::Data(samples)) => frames.push(DataFrame {
                    samples: samples.to_vec(),
                }),
                Some(other) => debug!("Unsolicited reply while reading frames: {:?}", other),
                None => anyhow::bail!(
                    "Timeout waiting for data frame ({} of {} received)",
                    frames.len(),
                    n_frames
                ),
            }
        }

        let sync_errors = self.parser.sync_errors() - errors_before;
        if sync_errors > 0 {
            warn!(
                "Discarded {} bytes while resynchronizing (suppressing per-byte logs)",
                sync_errors
            );
        }

        Ok(FrameBatch {
            frames,
            timestamp_us,
            sync_errors,
        })
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn send(&mut self, cmd: Command) -> Result<()> {
        debug!("Sending {:?}", cmd);
        self.link.write_all(&cmd.encode())?;
        self.link.flush()?;
        std::thread::sleep(COMMAND_DELAY);
        Ok(())
    }

    fn wait_settings(&mut self) -> Result<SettingsReport> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            match self.next_reply(deadline.saturating_duration_since(Instant::now()))? {
                Some(Reply::Settings(report)) => return Ok(report),
                Some(reply) => self.stash(reply),
                None => anyhow::bail!("Timeout waiting for settings reply"),
            }
        }
    }

    fn wait_status(&mut self) -> Result<Status> {
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            match self.next_reply(deadline.saturating_duration_since(Instant::now()))? {
                Some(Reply::Status(status)) => return Ok(status),
                Some(reply) => self.stash(reply),
                None => anyhow::bail!("Timeout waiting for status reply"),
            }
        }
    }

    fn stash(&mut self, reply: Reply) {
        match reply {
            Reply::Data(samples) => self.queued.push_back(DataFrame {
                samples: samples.to_vec(),
            }),
            other => debug!("Dropping stale reply {:?}", other),
        }
    }

    /// Pull the next complete reply, reading from the link until `timeout`.
    fn next_reply(&mut self, timeout: Duration) -> Result<Option<Reply>> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; BUFFER_CAPACITY];
        loop {
            if let Some(reply) = self.parser.next_reply() {
                return Ok(Some(reply));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            match self.link.read(&mut chunk) {
                Ok(0) => std::thread::sleep(COMMAND_DELAY),
                Ok(n) => self.parser.feed(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e).context("Failed to read from device link"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_data_frame, encode_settings, encode_status};
    use crate::transport::{MemoryLink, Transport};

    fn client() -> (DaqClient, MemoryLink) {
        let (device, host) = MemoryLink::pair();
        let host = host.with_timeout(Duration::from_millis(20));
        let client = DaqClient::from_stream(host).with_reply_timeout(Duration::from_millis(200));
        (client, device)
    }

    #[test]
    fn settings_reply_skips_queued_data() {
        let (mut client, mut device) = client();
        let samples = [9u8; BUFFER_CAPACITY];
        device.write_frame(&encode_data_frame(&samples)).unwrap();
        device
            .write_frame(&encode_settings(&SettingsReport {
                divider_index: 3,
                rate_integer: 76,
                rate_hundredths: 90,
            }))
            .unwrap();

        let report = client.query_settings().unwrap();
        assert_eq!(report.divider_index, 3);
        assert_eq!(device.take_received(), vec![b'R']);

        let batch = client.read_frames(1).unwrap();
        assert_eq!(batch.frames[0].samples, samples.to_vec());
        assert_eq!(batch.sync_errors, 0);
    }

    #[test]
    fn invalid_divider_rejected_locally() {
        let (mut client, device) = client();
        assert!(client.set_divider(7).is_err());
        assert!(device.take_received().is_empty());
    }

    #[test]
    fn toggle_reads_status() {
        let (mut client, mut device) = client();
        device
            .write_frame(&encode_status(&Status {
                enabled: false,
                paused: false,
            }))
            .unwrap();
        let status = client.toggle().unwrap();
        assert!(!status.enabled);
        assert_eq!(device.take_received(), vec![b'S']);
    }

    #[test]
    fn missing_reply_times_out() {
        let (mut client, _device) = client();
        assert!(client.query_settings().is_err());
        assert!(client.read_frames(1).is_err());
    }

    #[test]
    fn frame_statistics() {
        let mut samples = [0u8; BUFFER_CAPACITY];
        samples[0] = 10;
        samples[1] = 250;
        let frame = DataFrame {
            samples: samples.to_vec(),
        };
        assert_eq!(frame.min(), 0);
        assert_eq!(frame.max(), 250);
        assert!((frame.mean() - 0.65).abs() < 1e-9);
    }
}
