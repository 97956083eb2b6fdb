// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Device and AWG module node table.
//!
//! Every node the control layer touches has a role in [`ModuleNode`] or
//! [`DeviceNode`]; the path strings live only here.

use awg_program::register::Register;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Int(i64),
    Double(f64),
    String(String),
}

impl NodeValue {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            NodeValue::Int(v) => Ok(*v),
            other => Err(Error::communication(format!(
                "Expected an integer node value, got {other:?}"
            ))),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            NodeValue::Double(v) => Ok(*v),
            NodeValue::Int(v) => Ok(*v as f64),
            other => Err(Error::communication(format!(
                "Expected a floating point node value, got {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            NodeValue::String(v) => Ok(v),
            other => Err(Error::communication(format!(
                "Expected a string node value, got {other:?}"
            ))),
        }
    }
}

impl From<i64> for NodeValue {
    fn from(value: i64) -> Self {
        NodeValue::Int(value)
    }
}

impl From<bool> for NodeValue {
    fn from(value: bool) -> Self {
        NodeValue::Int(value.into())
    }
}

impl From<f64> for NodeValue {
    fn from(value: f64) -> Self {
        NodeValue::Double(value)
    }
}

impl From<&str> for NodeValue {
    fn from(value: &str) -> Self {
        NodeValue::String(value.to_string())
    }
}

impl From<String> for NodeValue {
    fn from(value: String) -> Self {
        NodeValue::String(value)
    }
}

/// Nodes of the AWG module that compiles and uploads sequencer programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleNode {
    /// Base directory holding the `awg/src`, `awg/elf` and `awg/waves` folders.
    Directory,
    Device,
    Index,
    CompilerSourceFile,
    /// Reads 1 while a compilation is running.
    CompilerStart,
    /// Upload the binary automatically after compilation.
    CompilerUpload,
    CompilerStatus,
    CompilerStatusString,
    ElfFile,
    /// Reads 1 while an upload is running.
    ElfUpload,
    ElfStatus,
    Progress,
}

impl ModuleNode {
    pub const fn path(self) -> &'static str {
        match self {
            ModuleNode::Directory => "awgModule/directory",
            ModuleNode::Device => "awgModule/device",
            ModuleNode::Index => "awgModule/index",
            ModuleNode::CompilerSourceFile => "awgModule/compiler/sourcefile",
            ModuleNode::CompilerStart => "awgModule/compiler/start",
            ModuleNode::CompilerUpload => "awgModule/compiler/upload",
            ModuleNode::CompilerStatus => "awgModule/compiler/status",
            ModuleNode::CompilerStatusString => "awgModule/compiler/statusstring",
            ModuleNode::ElfFile => "awgModule/elf/file",
            ModuleNode::ElfUpload => "awgModule/elf/upload",
            ModuleNode::ElfStatus => "awgModule/elf/status",
            ModuleNode::Progress => "awgModule/progress",
        }
    }
}

/// Nodes of the instrument itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceNode {
    UserRegister { awg: u16, register: Register },
    Enable { awg: u16 },
    ChannelGrouping,
    SampleClock,
}

impl DeviceNode {
    pub fn path(&self, serial: &str) -> String {
        let serial = serial.to_lowercase();
        match self {
            DeviceNode::UserRegister { awg, register } => {
                format!("/{serial}/awgs/{awg}/userregs/{}", register.zero_based())
            }
            DeviceNode::Enable { awg } => format!("/{serial}/awgs/{awg}/enable"),
            DeviceNode::ChannelGrouping => format!("/{serial}/system/awg/channelgrouping"),
            DeviceNode::SampleClock => format!("/{serial}/system/clocks/sampleclock/freq"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerStatus {
    Idle,
    Success,
    Failure,
    Warning,
}

impl CompilerStatus {
    pub const fn code(self) -> i64 {
        match self {
            CompilerStatus::Idle => -1,
            CompilerStatus::Success => 0,
            CompilerStatus::Failure => 1,
            CompilerStatus::Warning => 2,
        }
    }
}

impl TryFrom<i64> for CompilerStatus {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            -1 => Ok(CompilerStatus::Idle),
            0 => Ok(CompilerStatus::Success),
            1 => Ok(CompilerStatus::Failure),
            2 => Ok(CompilerStatus::Warning),
            other => Err(Error::communication(format!(
                "Unknown compiler status code {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfStatus {
    Idle,
    Success,
    Failure,
    Busy,
}

impl ElfStatus {
    pub const fn code(self) -> i64 {
        match self {
            ElfStatus::Idle => -1,
            ElfStatus::Success => 0,
            ElfStatus::Failure => 1,
            ElfStatus::Busy => 2,
        }
    }
}

impl TryFrom<i64> for ElfStatus {
    type Error = Error;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            -1 => Ok(ElfStatus::Idle),
            0 => Ok(ElfStatus::Success),
            1 => Ok(ElfStatus::Failure),
            2 => Ok(ElfStatus::Busy),
            other => Err(Error::communication(format!(
                "Unknown upload status code {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_node_paths() {
        let register = Register::from_one_based(3).unwrap();
        assert_eq!(
            DeviceNode::UserRegister { awg: 1, register }.path("DEV8123"),
            "/dev8123/awgs/1/userregs/2"
        );
        assert_eq!(
            DeviceNode::Enable { awg: 0 }.path("dev8123"),
            "/dev8123/awgs/0/enable"
        );
        assert_eq!(
            DeviceNode::ChannelGrouping.path("dev8123"),
            "/dev8123/system/awg/channelgrouping"
        );
    }

    #[test]
    fn test_status_codes() {
        for status in [
            CompilerStatus::Idle,
            CompilerStatus::Success,
            CompilerStatus::Failure,
            CompilerStatus::Warning,
        ] {
            assert_eq!(CompilerStatus::try_from(status.code()).unwrap(), status);
        }
        assert!(CompilerStatus::try_from(7).is_err());
        assert_eq!(ElfStatus::try_from(2).unwrap(), ElfStatus::Busy);
        assert!(ElfStatus::try_from(-2).is_err());
    }

    #[test]
    fn test_node_value_accessors() {
        assert_eq!(NodeValue::from(true).as_int().unwrap(), 1);
        assert_eq!(NodeValue::from(2i64).as_double().unwrap(), 2.0);
        assert_eq!(NodeValue::from("a.elf").as_str().unwrap(), "a.elf");
        assert!(matches!(
            NodeValue::from(0.5).as_int(),
            Err(Error::DeviceCommunication(_))
        ));
    }
}
