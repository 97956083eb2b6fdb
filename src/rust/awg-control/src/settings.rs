// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Settings of the AWG control layer.
use std::time::Duration;

use awg_program::device_traits::{DeviceTraits, HDAWG_TRAITS};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct SanitizationChange {
    pub field: &'static str,
    pub original: String,
    pub sanitized: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwgSettings {
    pub poll_interval_ms: u64,
    pub min_waveform_length: u64,
    pub waveform_quantum: u64,
    pub idle_wait_cycles: u32,
}

impl Default for AwgSettings {
    fn default() -> Self {
        AwgSettings {
            poll_interval_ms: 100,
            min_waveform_length: HDAWG_TRAITS.min_play_wave.into(),
            waveform_quantum: HDAWG_TRAITS.sample_multiple.into(),
            idle_wait_cycles: 300,
        }
    }
}

impl AwgSettings {
    /// Parse settings from JSON. Missing fields take their default.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::configuration(format!("Invalid AWG settings: {e}")))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Round the waveform constraints up to values `device` can play.
    pub fn sanitize(&mut self, device: &DeviceTraits) -> Result<Vec<SanitizationChange>> {
        let mut changes = vec![];
        let sample_multiple = u64::from(device.sample_multiple);
        let quantum = sanitize_to_multiple(
            "waveform_quantum",
            self.waveform_quantum.max(1),
            sample_multiple,
        )?;
        if quantum != self.waveform_quantum {
            changes.push(SanitizationChange {
                field: "waveform_quantum",
                original: self.waveform_quantum.to_string(),
                sanitized: quantum.to_string(),
                reason: format!("Not a multiple of {sample_multiple}."),
            });
            self.waveform_quantum = quantum;
        }

        let device_minimum = u64::from(device.min_play_wave);
        let min_len = sanitize_to_multiple(
            "min_waveform_length",
            self.min_waveform_length.max(device_minimum),
            quantum,
        )?;
        if min_len != self.min_waveform_length {
            let reason = if self.min_waveform_length < device_minimum {
                format!("Below the {} minimum of {device_minimum}.", device.type_str)
            } else {
                format!("Not a multiple of {quantum}.")
            };
            changes.push(SanitizationChange {
                field: "min_waveform_length",
                original: self.min_waveform_length.to_string(),
                sanitized: min_len.to_string(),
                reason,
            });
            self.min_waveform_length = min_len;
        }
        Ok(changes)
    }
}

fn sanitize_to_multiple(field: &str, value: u64, multiple: u64) -> Result<u64> {
    value.checked_next_multiple_of(multiple).ok_or_else(|| {
        Error::configuration(format!(
            "Expected `{field}` rounded to a multiple of {multiple} to fit into 64 bit unsigned int"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_to_multiple() {
        assert_eq!(sanitize_to_multiple("f", 0, 16).unwrap(), 0);
        assert_eq!(sanitize_to_multiple("f", 10, 1).unwrap(), 10);
        assert_eq!(sanitize_to_multiple("f", 11, 2).unwrap(), 12);
        assert_eq!(sanitize_to_multiple("f", 15, 4).unwrap(), 16);
        assert!(sanitize_to_multiple("f", u64::MAX, 1000).is_err());
    }

    #[test]
    fn test_defaults_are_sane() {
        let mut settings = AwgSettings::default();
        assert!(settings.sanitize(&HDAWG_TRAITS).unwrap().is_empty());
        assert_eq!(settings.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_sanitization_change() {
        let mut settings = AwgSettings {
            waveform_quantum: 20,
            min_waveform_length: 40,
            ..AwgSettings::default()
        };
        let changes = settings.sanitize(&HDAWG_TRAITS).unwrap();
        assert_eq!(settings.waveform_quantum, 32);
        assert_eq!(settings.min_waveform_length, 64);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].field, "waveform_quantum");
        assert_eq!(changes[0].original, "20");
        assert_eq!(changes[1].field, "min_waveform_length");
        assert_eq!(changes[1].sanitized, "64");
    }

    #[test]
    fn test_min_length_raised_to_device_minimum() {
        let mut settings = AwgSettings {
            min_waveform_length: 8,
            ..AwgSettings::default()
        };
        let changes = settings.sanitize(&HDAWG_TRAITS).unwrap();
        assert_eq!(settings.min_waveform_length, 32);
        assert!(changes[0].reason.starts_with("Below"));
    }

    #[test]
    fn test_from_json() {
        let json = r#"{"poll_interval_ms": 10, "idle_wait_cycles": 50}"#;
        let settings = AwgSettings::from_json(json).unwrap();
        assert_eq!(settings.poll_interval_ms, 10);
        assert_eq!(settings.idle_wait_cycles, 50);
        assert_eq!(settings.waveform_quantum, 16);
        assert!(matches!(
            AwgSettings::from_json("{\"poll_interval_ms\": \"fast\"}"),
            Err(Error::Configuration(_))
        ));
    }
}
