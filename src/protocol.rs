//! Wire protocol between the acquisition front end and the host.
//!
//! # Commands (host -> device)
//!
//! Single opcode byte, optionally followed by one parameter byte:
//!
//! | Byte | Parameter | Effect | Reply |
//! |------|-----------|--------|-------|
//! | `P`  | divider index | set rate divider | settings |
//! | `S`  | - | toggle sampling | status |
//! | `R`  | - | query settings | settings |
//! | `C`  | channel 0-5 | select input | settings |
//! | `V`  | 0 = supply, else internal | select reference | settings |
//! | `T`  | level | arm trigger | status |
//! | `N`  | - | disarm trigger | status |
//!
//! Unknown opcodes and out-of-range parameters are dropped without a reply.
//!
//! # Replies (device -> host)
//!
//! - Data: `FF AA` + 400 samples + `55 EE` (404 bytes)
//! - Settings: `'S'` + divider index + whole kSPS (low byte) + hundredths
//! - Status: `'X'` + enabled + paused
//!
//! There is no checksum or length prefix; frame boundaries come from the
//! fixed sizes and the data-frame markers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::BUFFER_CAPACITY;
use crate::controller::Status;
use crate::settings::{rate_entry, SamplingSettings};

// ============================================================================
// Constants
// ============================================================================

pub const CMD_SET_DIVIDER: u8 = b'P';
pub const CMD_TOGGLE: u8 = b'S';
pub const CMD_QUERY_SETTINGS: u8 = b'R';
pub const CMD_SET_CHANNEL: u8 = b'C';
pub const CMD_SET_REFERENCE: u8 = b'V';
pub const CMD_ARM_TRIGGER: u8 = b'T';
pub const CMD_DISARM_TRIGGER: u8 = b'N';

pub const FRAME_START: [u8; 2] = [0xFF, 0xAA];
pub const FRAME_END: [u8; 2] = [0x55, 0xEE];
pub const DATA_FRAME_LEN: usize = FRAME_START.len() + BUFFER_CAPACITY + FRAME_END.len();

pub const SETTINGS_HEADER: u8 = b'S';
pub const SETTINGS_FRAME_LEN: usize = 4;

pub const STATUS_HEADER: u8 = b'X';
pub const STATUS_FRAME_LEN: usize = 3;

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetDivider(u8),
    Toggle,
    QuerySettings,
    SetChannel(u8),
    SetReference(bool),
    ArmTrigger(u8),
    DisarmTrigger,
}

impl Command {
    /// Bytes the host sends for this command.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Command::SetDivider(index) => vec![CMD_SET_DIVIDER, index],
            Command::Toggle => vec![CMD_TOGGLE],
            Command::QuerySettings => vec![CMD_QUERY_SETTINGS],
            Command::SetChannel(ch) => vec![CMD_SET_CHANNEL, ch],
            Command::SetReference(internal) => vec![CMD_SET_REFERENCE, internal as u8],
            Command::ArmTrigger(level) => vec![CMD_ARM_TRIGGER, level],
            Command::DisarmTrigger => vec![CMD_DISARM_TRIGGER],
        }
    }
}

fn takes_parameter(opcode: u8) -> bool {
    matches!(
        opcode,
        CMD_SET_DIVIDER | CMD_SET_CHANNEL | CMD_SET_REFERENCE | CMD_ARM_TRIGGER
    )
}

fn with_parameter(opcode: u8, param: u8) -> Option<Command> {
    match opcode {
        CMD_SET_DIVIDER => Some(Command::SetDivider(param)),
        CMD_SET_CHANNEL => Some(Command::SetChannel(param)),
        CMD_SET_REFERENCE => Some(Command::SetReference(param != 0)),
        CMD_ARM_TRIGGER => Some(Command::ArmTrigger(param)),
        _ => None,
    }
}

/// Incremental command decoder.
///
/// A parameterized opcode leaves the decoder waiting for its parameter
/// byte across calls instead of blocking the caller. With a
/// `parameter_timeout`, a stalled command is dropped once it expires.
#[derive(Debug, Clone, Default)]
pub struct CommandDecoder {
    pending: Option<(u8, Instant)>,
    parameter_timeout: Option<Duration>,
}

impl CommandDecoder {
    pub fn new(parameter_timeout: Option<Duration>) -> Self {
        Self {
            pending: None,
            parameter_timeout,
        }
    }

    /// Whether an opcode is waiting for its parameter byte.
    pub fn is_awaiting_parameter(&self) -> bool {
        self.pending.is_some()
    }

    /// Feed one byte from the link.
    pub fn push(&mut self, byte: u8, now: Instant) -> Option<Command> {
        if let Some((opcode, _)) = self.pending.take() {
            return with_parameter(opcode, byte);
        }
        match byte {
            CMD_TOGGLE => Some(Command::Toggle),
            CMD_QUERY_SETTINGS => Some(Command::QuerySettings),
            CMD_DISARM_TRIGGER => Some(Command::DisarmTrigger),
            op if takes_parameter(op) => {
                self.pending = Some((op, now));
                None
            }
            other => {
                debug!("Ignoring unknown command byte {:#04X}", other);
                None
            }
        }
    }

    /// Drop a pending opcode whose parameter never arrived. Returns the
    /// dropped opcode.
    pub fn expire(&mut self, now: Instant) -> Option<u8> {
        let limit = self.parameter_timeout?;
        let (opcode, since) = self.pending?;
        if now.saturating_duration_since(since) < limit {
            return None;
        }
        self.pending = None;
        warn!(
            "Parameter for command {:?} not received within {:?}, dropped",
            opcode as char, limit
        );
        Some(opcode)
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Payload of a settings frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsReport {
    pub divider_index: u8,
    /// Low byte of the whole kSPS value.
    pub rate_integer: u8,
    pub rate_hundredths: u8,
}

impl SettingsReport {
    pub fn from_settings(settings: &SamplingSettings) -> Self {
        let (rate_integer, rate_hundredths) = settings
            .rate()
            .map(|r| (r.rate_integer() as u8, r.rate_hundredths()))
            .unwrap_or((0, 0));
        Self {
            divider_index: settings.rate_divider_index,
            rate_integer,
            rate_hundredths,
        }
    }

    /// Sampling rate in kSPS.
    ///
    /// The integer field is a single byte, so rates of 256 kSPS and above
    /// only survive the wire in their low byte. The divider table is used to
    /// recover the full value when the index is known and the transmitted
    /// bytes agree with it.
    pub fn rate_ksps(&self) -> f64 {
        match rate_entry(self.divider_index) {
            Some(entry)
                if entry.rate_integer() as u8 == self.rate_integer
                    && entry.rate_hundredths() == self.rate_hundredths =>
            {
                entry.rate_ksps()
            }
            _ => self.rate_integer as f64 + self.rate_hundredths as f64 / 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Data(Box<[u8; BUFFER_CAPACITY]>),
    Settings(SettingsReport),
    Status(Status),
}

pub fn encode_data_frame(samples: &[u8; BUFFER_CAPACITY]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DATA_FRAME_LEN);
    frame.extend_from_slice(&FRAME_START);
    frame.extend_from_slice(samples);
    frame.extend_from_slice(&FRAME_END);
    frame
}

pub fn encode_settings(report: &SettingsReport) -> [u8; SETTINGS_FRAME_LEN] {
    [
        SETTINGS_HEADER,
        report.divider_index,
        report.rate_integer,
        report.rate_hundredths,
    ]
}

pub fn encode_status(status: &Status) -> [u8; STATUS_FRAME_LEN] {
    [STATUS_HEADER, status.enabled as u8, status.paused as u8]
}

/// Host-side reply decoder.
///
/// Bytes are appended with [`ReplyParser::feed`] and complete replies pulled
/// with [`ReplyParser::next_reply`]. A byte that cannot start a frame, or a
/// data frame with a bad end marker, counts as a sync error and the parser
/// advances one byte to resynchronize.
#[derive(Debug, Default)]
pub struct ReplyParser {
    pending: VecDeque<u8>,
    sync_errors: usize,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn sync_errors(&self) -> usize {
        self.sync_errors
    }

    pub fn next_reply(&mut self) -> Option<Reply> {
        loop {
            let first = *self.pending.front()?;
            match first {
                STATUS_HEADER => {
                    if self.pending.len() < STATUS_FRAME_LEN {
                        return None;
                    }
                    let frame = self.take(STATUS_FRAME_LEN);
                    return Some(Reply::Status(Status {
                        enabled: frame[1] != 0,
                        paused: frame[2] != 0,
                    }));
                }
                SETTINGS_HEADER => {
                    if self.pending.len() < SETTINGS_FRAME_LEN {
                        return None;
                    }
                    let frame = self.take(SETTINGS_FRAME_LEN);
                    return Some(Reply::Settings(SettingsReport {
                        divider_index: frame[1],
                        rate_integer: frame[2],
                        rate_hundredths: frame[3],
                    }));
                }
                b if b == FRAME_START[0] => {
                    if self.pending.len() < 2 {
                        return None;
                    }
                    if self.pending[1] != FRAME_START[1] {
                        self.skip_byte();
                        continue;
                    }
                    if self.pending.len() < DATA_FRAME_LEN {
                        return None;
                    }
                    let end_ok = self.pending[DATA_FRAME_LEN - 2] == FRAME_END[0]
                        && self.pending[DATA_FRAME_LEN - 1] == FRAME_END[1];
                    if !end_ok {
                        self.skip_byte();
                        continue;
                    }
                    let frame = self.take(DATA_FRAME_LEN);
                    let mut samples = Box::new([0u8; BUFFER_CAPACITY]);
                    samples.copy_from_slice(&frame[FRAME_START.len()..DATA_FRAME_LEN - 2]);
                    return Some(Reply::Data(samples));
                }
                _ => self.skip_byte(),
            }
        }
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        self.pending.drain(..n).collect()
    }

    fn skip_byte(&mut self) {
        self.pending.pop_front();
        self.sync_errors += 1;
    }
}
