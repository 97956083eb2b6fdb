// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

/// Device specific traits for program generation and control.
pub struct DeviceTraits {
    pub type_str: &'static str,
    pub sampling_rate: f64,
    pub channel_count: u16,
    pub markers_per_channel: u16,
    pub sample_multiple: u16,
    pub min_play_wave: u16,
    pub user_register_count: u8,
}

pub const HDAWG_TRAITS: DeviceTraits = DeviceTraits {
    type_str: "HDAWG",
    sampling_rate: 2.4e9,
    channel_count: 8,
    markers_per_channel: 2,
    sample_multiple: 16,
    min_play_wave: 32,
    user_register_count: 16,
};
