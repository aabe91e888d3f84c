//! Single-channel ADC acquisition front end with a framed serial protocol.
//!
//! The device side is a foreground loop ([`Device`]) plus a conversion-complete
//! handler ([`AcquisitionEngine::on_conversion_complete`]) that runs in the
//! converter's own context. The handler fills a 400-sample buffer; the
//! foreground loop answers single-byte commands and ships every full buffer
//! to the host as one fixed-size data frame.
//!
//! The converter and the byte link are collaborators behind the [`Converter`]
//! and [`Transport`] traits. [`SimulatedConverter`] and [`MemoryLink`] let the
//! whole pipeline run on a host; [`DaqClient`] is the host-side driver.
//!
//! # Timing and Synchronization
//!
//! - The device does NOT timestamp samples; frames carry raw bytes only
//! - While a frame is being written the buffer stays full, so conversions
//!   completing during the write are dropped
//! - In trigger mode, collection restarts only after a conversion reaches the
//!   trigger level

mod buffer;
mod controller;
mod converter;
mod device;
mod errors;
mod host;
pub mod logging;
mod protocol;
mod settings;
mod transport;

pub use buffer::{AcquisitionEngine, SampleBuffer, BUFFER_CAPACITY};
pub use controller::{SamplingController, Status, TriggerPoll};
pub use converter::{synthetic_sample, Converter, SimulatedConverter};
pub use device::{Device, DeviceConfig};
pub use errors::*;
pub use host::{DaqClient, DataFrame, FrameBatch};
pub use protocol::{
    encode_data_frame, encode_settings, encode_status, Command, CommandDecoder, Reply,
    ReplyParser, SettingsReport, DATA_FRAME_LEN,
};
pub use settings::{
    rate_entry, ConfigurationStore, RateEntry, SamplingSettings, INPUT_CHANNELS, RATE_TABLE,
};
pub use transport::{MemoryLink, SerialTransport, Transport, BAUD_RATE};
