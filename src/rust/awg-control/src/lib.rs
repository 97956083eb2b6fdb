// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Compile, upload, arm and run sequencer programs on an AWG.
//!
//! The moving parts, leaves first:
//!
//! - [`nodes`] and [`session`]: the device node table and the session traits
//!   through which all device communication goes.
//! - [`elf_manager`]: content addressed compile/upload cache with a
//!   cooperative, steppable progress protocol.
//! - [`program_manager`]: named programs of one channel group, their register
//!   assignments and the concatenated sequencer source.
//! - [`channel_group`]: upload/arm/run state machine of one channel group.
//! - [`instrument`]: all channel groups of one device.

use std::time::Duration;

pub mod artifacts;
pub mod channel_group;
pub mod elf_manager;
pub mod instrument;
pub mod nodes;
pub mod program_manager;
pub mod session;
pub mod settings;
pub mod simulator;

pub use awg_program::register::Register;
pub use awg_program::timing::{Loop, RepetitionCount, Waveform};
pub use channel_group::{ChannelGroup, GroupState};
pub use elf_manager::{Command, ElfManager, ProgressHandle, ProgressState};
pub use instrument::{ChannelGrouping, Instrument};
pub use program_manager::{ProgramManager, ProgramSpec, TriggerMode, VoltageTransform};
pub use session::{AwgModule, DeviceSession};
pub use settings::AwgSettings;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid channel, marker, register or program arguments.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The device compiler rejected the sequencer source.
    #[error("Compilation failed: {status}")]
    Compilation { status: String },
    #[error("Upload failed: {0}")]
    Upload(String),
    /// Any failure of the transport to the device.
    #[error("Device communication failed: {0}")]
    DeviceCommunication(String),
    /// Operation attempted in the wrong state.
    #[error("{0}")]
    Runtime(String),
    /// Only raised by drain loops that were given a deadline.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn configuration<T: std::fmt::Display>(msg: T) -> Self {
        Error::Configuration(msg.to_string())
    }

    pub fn runtime<T: std::fmt::Display>(msg: T) -> Self {
        Error::Runtime(msg.to_string())
    }

    pub fn communication<T: std::fmt::Display>(msg: T) -> Self {
        Error::DeviceCommunication(msg.to_string())
    }
}

/// Errors from the program layer are problems of the program definition.
impl From<awg_program::Error> for Error {
    fn from(error: awg_program::Error) -> Self {
        let awg_program::Error::Anyhow(e) = error;
        Error::Configuration(format!("{e:#}"))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
