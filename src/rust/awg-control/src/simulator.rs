// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! In-process stand-in for an instrument and its AWG modules.
//!
//! Node values are kept in memory. Compilation and upload finish after a
//! configurable number of status polls; compilation writes `<hash>.elf` next
//! to the other artifacts like the real compiler does. Failures of the
//! compiler, the upload and the transport can be injected.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use awg_program::device_traits::HDAWG_TRAITS;
use awg_program::register::Register;

use crate::artifacts::{ArtifactStore, BINARY_EXTENSION, SOURCE_EXTENSION};
use crate::nodes::{CompilerStatus, DeviceNode, ElfStatus, ModuleNode, NodeValue};
use crate::session::{AwgModule, DeviceSession};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Success,
    Warning(String),
    Failure(String),
}

/// Something the simulated instrument observed, in order of occurrence.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Write(String),
    Sync,
    CompileStarted,
    UploadFinished(String),
}

#[derive(Debug)]
struct DeviceState {
    nodes: HashMap<String, NodeValue>,
    writes: Vec<(String, NodeValue)>,
    events: Vec<Event>,
    sync_count: usize,
    compile_count: usize,
    upload_count: usize,
    compile_outcome: CompileOutcome,
    fail_uploads: bool,
    fail_transport: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct SimulatedInstrument {
    serial: String,
    directory: PathBuf,
    compile_polls: u32,
    upload_polls: u32,
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedInstrument {
    /// Simulate device `serial` whose AWG modules work in `directory`.
    pub fn new(serial: &str, directory: impl Into<PathBuf>) -> Self {
        let serial = serial.to_lowercase();
        let mut nodes = HashMap::new();
        nodes.insert(
            DeviceNode::SampleClock.path(&serial),
            NodeValue::Double(HDAWG_TRAITS.sampling_rate),
        );
        Self {
            serial,
            directory: directory.into(),
            compile_polls: 1,
            upload_polls: 1,
            state: Arc::new(Mutex::new(DeviceState {
                nodes,
                writes: vec![],
                events: vec![],
                sync_count: 0,
                compile_count: 0,
                upload_count: 0,
                compile_outcome: CompileOutcome::Success,
                fail_uploads: false,
                fail_transport: false,
            })),
        }
    }

    pub fn with_compile_polls(mut self, polls: u32) -> Self {
        self.compile_polls = polls;
        self
    }

    pub fn with_upload_polls(mut self, polls: u32) -> Self {
        self.upload_polls = polls;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn set_compile_outcome(&self, outcome: CompileOutcome) {
        lock(&self.state).compile_outcome = outcome;
    }

    pub fn set_upload_failure(&self, fail: bool) {
        lock(&self.state).fail_uploads = fail;
    }

    /// Make every following node access fail.
    pub fn set_transport_failure(&self, fail: bool) {
        lock(&self.state).fail_transport = fail;
    }

    pub fn compile_count(&self) -> usize {
        lock(&self.state).compile_count
    }

    pub fn upload_count(&self) -> usize {
        lock(&self.state).upload_count
    }

    pub fn sync_count(&self) -> usize {
        lock(&self.state).sync_count
    }

    /// All device node writes in order.
    pub fn writes(&self) -> Vec<(String, NodeValue)> {
        lock(&self.state).writes.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.state).events.clone()
    }

    pub fn node(&self, path: &str) -> Option<NodeValue> {
        lock(&self.state).nodes.get(path).cloned()
    }

    pub fn user_register(&self, awg: u16, register: Register) -> i64 {
        self.node(&DeviceNode::UserRegister { awg, register }.path(&self.serial))
            .and_then(|v| v.as_int().ok())
            .unwrap_or(0)
    }

    fn check_transport(&self) -> Result<()> {
        if lock(&self.state).fail_transport {
            return Err(Error::communication(format!(
                "Connection to {} lost",
                self.serial
            )));
        }
        Ok(())
    }
}

impl DeviceSession for SimulatedInstrument {
    fn get_node(&self, path: &str) -> Result<NodeValue> {
        self.check_transport()?;
        Ok(lock(&self.state)
            .nodes
            .get(path)
            .cloned()
            .unwrap_or(NodeValue::Int(0)))
    }

    fn set_node(&self, path: &str, value: NodeValue) -> Result<()> {
        self.check_transport()?;
        log::trace!("{path} <- {value:?}");
        let mut state = lock(&self.state);
        state.events.push(Event::Write(path.to_string()));
        state.writes.push((path.to_string(), value.clone()));
        state.nodes.insert(path.to_string(), value);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_transport()?;
        let mut state = lock(&self.state);
        state.sync_count += 1;
        state.events.push(Event::Sync);
        Ok(())
    }

    fn awg_module(&self, serial: &str, awg_index: u16) -> Result<Box<dyn AwgModule>> {
        self.check_transport()?;
        if serial.to_lowercase() != self.serial {
            return Err(Error::communication(format!("Device {serial} not found")));
        }
        Ok(Box::new(SimulatedAwgModule::new(self.clone(), awg_index)))
    }
}

#[derive(Debug)]
struct ModuleState {
    nodes: HashMap<ModuleNode, NodeValue>,
    compile_remaining: Option<u32>,
    upload_remaining: Option<u32>,
}

impl ModuleState {
    fn value(&self, node: ModuleNode) -> NodeValue {
        self.nodes.get(&node).cloned().unwrap_or(match node {
            ModuleNode::CompilerStatus => NodeValue::Int(CompilerStatus::Idle.code()),
            ModuleNode::ElfStatus => NodeValue::Int(ElfStatus::Idle.code()),
            ModuleNode::Progress => NodeValue::Double(0.0),
            ModuleNode::CompilerStatusString
            | ModuleNode::CompilerSourceFile
            | ModuleNode::ElfFile => NodeValue::String(String::new()),
            _ => NodeValue::Int(0),
        })
    }

    fn put(&mut self, node: ModuleNode, value: impl Into<NodeValue>) {
        self.nodes.insert(node, value.into());
    }
}

/// Counts down a running job. Returns true once the job is due.
fn tick(remaining: &mut Option<u32>) -> bool {
    match remaining {
        Some(0) => true,
        Some(n) => {
            *n -= 1;
            false
        }
        None => false,
    }
}

#[derive(Debug)]
pub struct SimulatedAwgModule {
    instrument: SimulatedInstrument,
    state: Mutex<ModuleState>,
}

impl SimulatedAwgModule {
    fn new(instrument: SimulatedInstrument, awg_index: u16) -> Self {
        let mut state = ModuleState {
            nodes: HashMap::new(),
            compile_remaining: None,
            upload_remaining: None,
        };
        state.put(
            ModuleNode::Directory,
            instrument.directory.display().to_string(),
        );
        state.put(ModuleNode::Device, instrument.serial.clone());
        state.put(ModuleNode::Index, i64::from(awg_index));
        Self {
            instrument,
            state: Mutex::new(state),
        }
    }

    fn store(&self) -> ArtifactStore {
        ArtifactStore::new(&self.instrument.directory)
    }

    fn start_compile(&self, state: &mut ModuleState) {
        let mut device = lock(&self.instrument.state);
        device.compile_count += 1;
        device.events.push(Event::CompileStarted);
        drop(device);
        state.put(ModuleNode::CompilerStart, 1_i64);
        state.put(ModuleNode::CompilerStatus, CompilerStatus::Idle.code());
        state.compile_remaining = Some(self.instrument.compile_polls);
    }

    fn finish_compile(&self, state: &mut ModuleState) -> Result<()> {
        state.compile_remaining = None;
        state.put(ModuleNode::CompilerStart, 0_i64);
        let source_file = state
            .value(ModuleNode::CompilerSourceFile)
            .as_str()?
            .to_string();
        let store = self.store();
        let source_path = store.src_dir().join(&source_file);
        if !source_path.is_file() {
            state.put(ModuleNode::CompilerStatus, CompilerStatus::Failure.code());
            state.put(
                ModuleNode::CompilerStatusString,
                format!("File not found: {source_file}"),
            );
            return Ok(());
        }
        let outcome = lock(&self.instrument.state).compile_outcome.clone();
        let (status, message) = match outcome {
            CompileOutcome::Failure(message) => (CompilerStatus::Failure, message),
            CompileOutcome::Warning(message) => (CompilerStatus::Warning, message),
            CompileOutcome::Success => (CompilerStatus::Success, String::new()),
        };
        if status != CompilerStatus::Failure {
            let source = fs::read_to_string(&source_path)?;
            let stem = source_file
                .strip_suffix(&format!(".{SOURCE_EXTENSION}"))
                .unwrap_or(&source_file);
            fs::write(
                store.elf_dir().join(format!("{stem}.{BINARY_EXTENSION}")),
                format!("ELF\n{source}"),
            )?;
        }
        state.put(ModuleNode::CompilerStatus, status.code());
        state.put(ModuleNode::CompilerStatusString, message);
        Ok(())
    }

    fn start_upload(&self, state: &mut ModuleState) -> Result<()> {
        let elf_file = state.value(ModuleNode::ElfFile).as_str()?.to_string();
        if elf_file.is_empty() || !self.store().elf_dir().join(&elf_file).is_file() {
            state.put(ModuleNode::ElfUpload, 0_i64);
            state.put(ModuleNode::ElfStatus, ElfStatus::Failure.code());
            return Ok(());
        }
        state.put(ModuleNode::ElfUpload, 1_i64);
        state.put(ModuleNode::ElfStatus, ElfStatus::Busy.code());
        state.put(ModuleNode::Progress, 0.0);
        state.upload_remaining = Some(self.instrument.upload_polls);
        Ok(())
    }

    fn finish_upload(&self, state: &mut ModuleState) {
        state.upload_remaining = None;
        state.put(ModuleNode::ElfUpload, 0_i64);
        let mut device = lock(&self.instrument.state);
        if device.fail_uploads {
            state.put(ModuleNode::ElfStatus, ElfStatus::Failure.code());
        } else {
            device.upload_count += 1;
            let elf_file = state.value(ModuleNode::ElfFile);
            let elf_file = elf_file.as_str().unwrap_or_default();
            device.events.push(Event::UploadFinished(elf_file.to_string()));
            state.put(ModuleNode::ElfStatus, ElfStatus::Success.code());
            state.put(ModuleNode::Progress, 1.0);
        }
    }
}

impl AwgModule for SimulatedAwgModule {
    fn get(&self, node: ModuleNode) -> Result<NodeValue> {
        self.instrument.check_transport()?;
        let mut state = lock(&self.state);
        match node {
            ModuleNode::CompilerStart => {
                if tick(&mut state.compile_remaining) {
                    self.finish_compile(&mut state)?;
                }
            }
            ModuleNode::ElfUpload => {
                if tick(&mut state.upload_remaining) {
                    self.finish_upload(&mut state);
                } else if let Some(remaining) = state.upload_remaining {
                    let total = f64::from(self.instrument.upload_polls.max(1));
                    state.put(ModuleNode::Progress, 1.0 - f64::from(remaining) / total);
                }
            }
            _ => {}
        }
        Ok(state.value(node))
    }

    fn set(&mut self, node: ModuleNode, value: NodeValue) -> Result<()> {
        self.instrument.check_transport()?;
        let mut state = lock(&self.state);
        match node {
            ModuleNode::CompilerStart => {
                if value.as_int()? == 1 {
                    self.start_compile(&mut state);
                }
            }
            ModuleNode::ElfUpload => match value.as_int()? {
                1 => self.start_upload(&mut state)?,
                _ => {
                    state.upload_remaining = None;
                    state.put(ModuleNode::ElfUpload, 0_i64);
                    state.put(ModuleNode::ElfStatus, ElfStatus::Idle.code());
                }
            },
            _ => state.put(node, value),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("DEV8000", dir.path());
        assert_eq!(sim.serial(), "dev8000");
        sim.set_node("/dev8000/awgs/0/enable", NodeValue::Int(1))
            .unwrap();
        sim.sync().unwrap();
        assert_eq!(
            sim.get_node("/dev8000/awgs/0/enable").unwrap(),
            NodeValue::Int(1)
        );
        assert_eq!(sim.sync_count(), 1);
        assert_eq!(sim.writes().len(), 1);
        assert_eq!(
            sim.get_node(&DeviceNode::SampleClock.path("dev8000"))
                .unwrap()
                .as_double()
                .unwrap(),
            2.4e9
        );
    }

    #[test]
    fn test_transport_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        sim.set_transport_failure(true);
        assert!(matches!(
            sim.get_node("/dev8000/awgs/0/enable"),
            Err(Error::DeviceCommunication(_))
        ));
        assert!(sim.sync().is_err());
        assert!(sim.awg_module("dev8000", 0).is_err());
    }

    #[test]
    fn test_unknown_device() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        assert!(sim.awg_module("dev9999", 0).is_err());
    }

    #[test]
    fn test_compile_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path()).with_compile_polls(0);
        let mut module = sim.awg_module("dev8000", 0).unwrap();
        module
            .set(ModuleNode::CompilerSourceFile, "missing.seqc".into())
            .unwrap();
        module.set(ModuleNode::CompilerStart, true.into()).unwrap();
        assert_eq!(module.get_int(ModuleNode::CompilerStart).unwrap(), 0);
        assert_eq!(
            module.get_int(ModuleNode::CompilerStatus).unwrap(),
            CompilerStatus::Failure.code()
        );
        assert_eq!(
            module.get_string(ModuleNode::CompilerStatusString).unwrap(),
            "File not found: missing.seqc"
        );
    }
}
