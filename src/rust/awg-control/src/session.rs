// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Interface to the instrument transport.
//!
//! All calls are synchronous and made from the caller's thread. Transport
//! failures are reported as [`Error::DeviceCommunication`](crate::Error::DeviceCommunication).

use crate::Result;
use crate::nodes::{ModuleNode, NodeValue};

/// Connection to one instrument.
pub trait DeviceSession: Send + Sync {
    fn get_node(&self, path: &str) -> Result<NodeValue>;

    fn set_node(&self, path: &str, value: NodeValue) -> Result<()>;

    /// Global synchronization barrier.
    ///
    /// A node write is only guaranteed to have taken effect on the device after
    /// this call returns. The barrier covers every channel group of the device.
    fn sync(&self) -> Result<()>;

    /// Create an AWG module bound to the sequencer core `awg_index` of `serial`.
    fn awg_module(&self, serial: &str, awg_index: u16) -> Result<Box<dyn AwgModule>>;
}

/// The AWG module compiles sequencer source and uploads the binary to one core.
pub trait AwgModule: Send {
    fn get(&self, node: ModuleNode) -> Result<NodeValue>;

    fn set(&mut self, node: ModuleNode, value: NodeValue) -> Result<()>;

    fn get_int(&self, node: ModuleNode) -> Result<i64> {
        self.get(node)?.as_int()
    }

    fn get_double(&self, node: ModuleNode) -> Result<f64> {
        self.get(node)?.as_double()
    }

    fn get_string(&self, node: ModuleNode) -> Result<String> {
        Ok(self.get(node)?.as_str()?.to_string())
    }
}
