//! Sampling settings, the rate-divider table, and the configuration store.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::converter::Converter;
use crate::errors::SettingsError;

// ============================================================================
// Constants
// ============================================================================

/// Number of selectable analog inputs (A0-A5).
pub const INPUT_CHANNELS: u8 = 6;

/// Converter clock divider and resulting sampling rate.
///
/// Rates are held in hundredths of a kSPS so the wire encoding truncates the
/// decimal value exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateEntry {
    pub divider: u8,
    pub rate_centi_ksps: u32,
}

impl RateEntry {
    const fn new(divider: u8, rate_centi_ksps: u32) -> Self {
        Self {
            divider,
            rate_centi_ksps,
        }
    }

    /// Whole kSPS.
    pub fn rate_integer(&self) -> u32 {
        self.rate_centi_ksps / 100
    }

    /// Fractional kSPS in hundredths (0-99), truncated.
    pub fn rate_hundredths(&self) -> u8 {
        (self.rate_centi_ksps % 100) as u8
    }

    /// Samples per second.
    pub fn samples_per_second(&self) -> f64 {
        self.rate_centi_ksps as f64 * 10.0
    }

    pub fn rate_ksps(&self) -> f64 {
        self.rate_centi_ksps as f64 / 100.0
    }
}

/// Valid dividers, fastest first.
pub const RATE_TABLE: [RateEntry; 7] = [
    RateEntry::new(2, 61_540),
    RateEntry::new(4, 30_770),
    RateEntry::new(8, 15_380),
    RateEntry::new(16, 7_690),
    RateEntry::new(32, 3_850),
    RateEntry::new(64, 1_920),
    RateEntry::new(128, 960),
];

/// Look up a divider index, or `None` if it is outside the table.
pub fn rate_entry(index: u8) -> Option<&'static RateEntry> {
    RATE_TABLE.get(index as usize)
}

// ============================================================================
// Data Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingSettings {
    pub rate_divider_index: u8,
    pub input_channel: u8,
    pub use_internal_reference: bool,
    pub trigger_mode: bool,
    pub trigger_level: u8,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            rate_divider_index: 3,
            input_channel: 0,
            use_internal_reference: false,
            trigger_mode: false,
            trigger_level: 128,
        }
    }
}

impl SamplingSettings {
    /// Table entry for the selected divider, or `None` for an index the
    /// store would refuse.
    pub fn rate(&self) -> Option<&'static RateEntry> {
        rate_entry(self.rate_divider_index)
    }
}

// ============================================================================
// Validation
// ============================================================================

pub fn validate_channel(channel: u8) -> Result<u8, SettingsError> {
    if channel < INPUT_CHANNELS {
        Ok(channel)
    } else {
        Err(SettingsError::InvalidChannel(channel))
    }
}

pub fn validate_divider_index(index: u8) -> Result<u8, SettingsError> {
    match rate_entry(index) {
        Some(_) => Ok(index),
        None => Err(SettingsError::InvalidDividerIndex(index)),
    }
}

// ============================================================================
// Configuration Store
// ============================================================================

/// Owns the current [`SamplingSettings`] and applies changes to the converter.
///
/// Every method validates before touching the converter or the mirror, so a
/// rejected request leaves both unchanged.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationStore {
    settings: SamplingSettings,
}

impl ConfigurationStore {
    /// Create a store; out-of-range fields in `initial` fall back to defaults.
    pub fn new(initial: SamplingSettings) -> Self {
        let defaults = SamplingSettings::default();
        let settings = SamplingSettings {
            rate_divider_index: validate_divider_index(initial.rate_divider_index)
                .unwrap_or(defaults.rate_divider_index),
            input_channel: validate_channel(initial.input_channel)
                .unwrap_or(defaults.input_channel),
            ..initial
        };
        Self { settings }
    }

    pub fn settings(&self) -> &SamplingSettings {
        &self.settings
    }

    /// Power-on programming of the converter from the current settings.
    pub fn apply_all<C: Converter>(&self, converter: &mut C) {
        self.reprogram(converter);
    }

    pub fn set_input_channel<C: Converter>(
        &mut self,
        channel: u8,
        converter: &mut C,
    ) -> Result<(), SettingsError> {
        let channel = validate_channel(channel)?;
        let s = &self.settings;
        converter.configure(channel, s.rate_divider_index, s.use_internal_reference);
        self.settings.input_channel = channel;
        debug!("Input channel set to A{}", channel);
        Ok(())
    }

    /// Select a new divider. The divider bits cannot change while conversions
    /// are in flight, so this runs a full disable/reprogram/re-arm cycle.
    pub fn set_rate_divider<C: Converter>(
        &mut self,
        index: u8,
        converter: &mut C,
    ) -> Result<(), SettingsError> {
        let index = validate_divider_index(index)?;
        self.settings.rate_divider_index = index;
        self.reprogram(converter);
        let rate = &RATE_TABLE[index as usize];
        info!(
            "Rate divider set: index={} divider={} rate={:.2} kSPS",
            index,
            rate.divider,
            rate.rate_ksps()
        );
        Ok(())
    }

    pub fn set_voltage_reference<C: Converter>(&mut self, use_internal: bool, converter: &mut C) {
        let s = &self.settings;
        converter.configure(s.input_channel, s.rate_divider_index, use_internal);
        self.settings.use_internal_reference = use_internal;
        debug!(
            "Voltage reference set to {}",
            if use_internal { "internal" } else { "supply" }
        );
    }

    pub fn set_trigger(&mut self, enabled: bool, level: u8) {
        self.settings.trigger_mode = enabled;
        self.settings.trigger_level = level;
    }

    fn reprogram<C: Converter>(&self, converter: &mut C) {
        let s = &self.settings;
        converter.disable_auto_retrigger();
        converter.configure(s.input_channel, s.rate_divider_index, s.use_internal_reference);
        converter.arm_auto_trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::tests::{Call, RecordingConverter};

    #[test]
    fn table_hundredths_are_truncated_decimals() {
        let expected = [
            (615, 40),
            (307, 70),
            (153, 80),
            (76, 90),
            (38, 50),
            (19, 20),
            (9, 60),
        ];
        for (entry, (int, frac)) in RATE_TABLE.iter().zip(expected) {
            assert_eq!(entry.rate_integer(), int);
            assert_eq!(entry.rate_hundredths(), frac);
        }
    }

    #[test]
    fn rate_lookup_does_not_wrap_out_of_table_indices() {
        let mut settings = SamplingSettings::default();
        assert_eq!(settings.rate(), Some(&RATE_TABLE[3]));
        settings.rate_divider_index = RATE_TABLE.len() as u8;
        assert_eq!(settings.rate(), None);
        settings.rate_divider_index = 7 + 3;
        assert_eq!(settings.rate(), None);
    }

    #[test]
    fn rate_divider_runs_full_reprogram_cycle() {
        let mut store = ConfigurationStore::default();
        let mut conv = RecordingConverter::default();
        store.set_rate_divider(5, &mut conv).unwrap();
        assert_eq!(store.settings().rate_divider_index, 5);
        assert_eq!(
            conv.calls,
            vec![
                Call::DisableAutoRetrigger,
                Call::Configure {
                    channel: 0,
                    divider_index: 5,
                    internal_ref: false
                },
                Call::ArmAutoTrigger,
            ]
        );
    }

    #[test]
    fn invalid_values_leave_store_untouched() {
        let mut store = ConfigurationStore::default();
        let mut conv = RecordingConverter::default();
        let before = *store.settings();

        assert_eq!(
            store.set_rate_divider(7, &mut conv),
            Err(SettingsError::InvalidDividerIndex(7))
        );
        assert_eq!(
            store.set_input_channel(6, &mut conv),
            Err(SettingsError::InvalidChannel(6))
        );
        assert_eq!(*store.settings(), before);
        assert!(conv.calls.is_empty());
    }

    #[test]
    fn channel_and_reference_update_the_mirror() {
        let mut store = ConfigurationStore::default();
        let mut conv = RecordingConverter::default();
        store.set_input_channel(5, &mut conv).unwrap();
        store.set_voltage_reference(true, &mut conv);
        assert_eq!(store.settings().input_channel, 5);
        assert!(store.settings().use_internal_reference);
        assert_eq!(
            conv.calls.last(),
            Some(&Call::Configure {
                channel: 5,
                divider_index: 3,
                internal_ref: true
            })
        );
    }

    #[test]
    fn new_sanitizes_initial_settings() {
        let store = ConfigurationStore::new(SamplingSettings {
            rate_divider_index: 42,
            input_channel: 9,
            trigger_level: 10,
            ..SamplingSettings::default()
        });
        assert_eq!(store.settings().rate_divider_index, 3);
        assert_eq!(store.settings().input_channel, 0);
        assert_eq!(store.settings().trigger_level, 10);
    }
}
