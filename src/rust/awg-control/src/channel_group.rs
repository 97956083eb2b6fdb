// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Upload, arm and run programs on one channel group.
//!
//! A group owns a [`ProgramManager`] and an [`ElfManager`] bound to its
//! sequencer core. `upload` only starts the compile and upload of the new
//! source; `arm` is the single operation that waits for the device to hold
//! the source of the current program set before it touches any register.
//!
//! ```text
//!            clear                arm(None)          arm(name)         run
//! Cleared <────────── * ──> ... Uploaded <──────> Armed ──────────> Running
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;

use awg_program::device_traits::HDAWG_TRAITS;
use awg_program::register::Register;

use crate::elf_manager::{Command, ElfManager, Phase, ProgressHandle, ProgressState};
use crate::nodes::{DeviceNode, ModuleNode, NodeValue};
use crate::program_manager::{
    NO_RESET_MASK, PLAYBACK_FINISHED_MASK, PROG_SEL_NONE, PROG_SEL_REGISTER, ProgramManager,
    ProgramSpec, TRIGGER_REGISTER, TRIGGER_RESET_MASK,
};
use crate::session::DeviceSession;
use crate::settings::AwgSettings;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Cleared,
    Uploaded,
    Armed,
    Running,
}

/// Compile and upload running for `source`.
struct PendingUpload {
    handle: ProgressHandle,
    source: String,
}

pub struct ChannelGroup {
    session: Arc<dyn DeviceSession>,
    serial: String,
    awg_index: u16,
    identifier: String,
    settings: AwgSettings,
    program_manager: ProgramManager,
    elf_manager: ElfManager,
    required_source: String,
    uploaded_source: Option<String>,
    pending: Option<PendingUpload>,
    current_program: Option<String>,
    state: GroupState,
}

impl ChannelGroup {
    /// Bind a group of `num_channels` outputs to the sequencer core `awg_index` of `serial`.
    pub fn new(
        session: Arc<dyn DeviceSession>,
        serial: &str,
        awg_index: u16,
        num_channels: usize,
        mut settings: AwgSettings,
    ) -> Result<Self> {
        let serial = serial.to_lowercase();
        let identifier = format!("{serial}/awgs/{awg_index}");
        for change in settings.sanitize(&HDAWG_TRAITS)? {
            awg_log::warn!(
                "{}: setting {} changed from {} to {}. {}",
                identifier,
                change.field,
                change.original,
                change.sanitized,
                change.reason
            );
        }

        let mut module = session.awg_module(&serial, awg_index)?;
        module.set(ModuleNode::Device, serial.as_str().into())?;
        module.set(ModuleNode::Index, i64::from(awg_index).into())?;
        let elf_manager = ElfManager::new(module)?;

        let num_markers = num_channels * usize::from(HDAWG_TRAITS.markers_per_channel);
        let program_manager = ProgramManager::new(num_channels, num_markers, &settings);
        let required_source = program_manager.to_source()?;
        Ok(Self {
            session,
            serial,
            awg_index,
            identifier,
            settings,
            program_manager,
            elf_manager,
            required_source,
            uploaded_source: None,
            pending: None,
            current_program: None,
            state: GroupState::Cleared,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn awg_index(&self) -> u16 {
        self.awg_index
    }

    pub fn num_channels(&self) -> usize {
        self.program_manager.num_channels()
    }

    pub fn num_markers(&self) -> usize {
        self.program_manager.num_markers()
    }

    pub fn programs(&self) -> impl Iterator<Item = &str> {
        self.program_manager.programs()
    }

    pub fn program_manager(&self) -> &ProgramManager {
        &self.program_manager
    }

    pub fn elf_manager(&self) -> &ElfManager {
        &self.elf_manager
    }

    pub fn current_program(&self) -> Option<&str> {
        self.current_program.as_deref()
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    /// Whether the device holds the source of the current program set.
    pub fn is_synchronized(&self) -> bool {
        self.uploaded_source.as_deref() == Some(self.required_source.as_str())
    }

    pub fn sample_rate(&self) -> Result<f64> {
        self.session
            .get_node(&DeviceNode::SampleClock.path(&self.serial))?
            .as_double()
    }

    /// Add program `name` and start compiling and uploading the new source.
    ///
    /// Returns without waiting for the device. An existing program is only
    /// replaced if `force` is set.
    pub fn upload(&mut self, name: &str, spec: ProgramSpec, force: bool) -> Result<()> {
        let sample_rate = self.sample_rate()?;
        if self.program_manager.contains(name) {
            if !force {
                return Err(Error::configuration(format!(
                    "Program '{name}' is already uploaded to {}. Use force to replace it.",
                    self.identifier
                )));
            }
            awg_log::info!("{}: replacing program '{}'", self.identifier, name);
            self.program_manager.replace_program(name, spec, sample_rate)?;
        } else {
            self.program_manager.add_program(name, spec, sample_rate)?;
        }
        self.update_required_source()
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.program_manager.remove(name)?;
        if self.current_program.as_deref() == Some(name) {
            self.current_program = None;
            self.state = GroupState::Uploaded;
        }
        self.update_required_source()
    }

    /// Remove all programs and disarm.
    pub fn clear(&mut self) -> Result<()> {
        self.program_manager.clear();
        self.current_program = None;
        self.required_source = self.program_manager.to_source()?;
        self.uploaded_source = None;
        self.arm(None)?;
        self.state = GroupState::Cleared;
        Ok(())
    }

    /// Select program `name` for the next [`run`](Self::run), or no program.
    ///
    /// Waits until the device holds the source of the current program set.
    pub fn arm(&mut self, name: Option<&str>) -> Result<()> {
        self.arm_with_siblings(name, &mut [])
    }

    /// [`arm`](Self::arm), draining the uploads of `siblings` on the same
    /// device before the output is enabled.
    pub fn arm_with_siblings(
        &mut self,
        name: Option<&str>,
        siblings: &mut [&mut ChannelGroup],
    ) -> Result<()> {
        let register_values = match name {
            Some(name) => self.program_manager.register_values_for(name)?,
            None => BTreeMap::new(),
        };
        for register in register_values.keys() {
            assert!(
                *register != PROG_SEL_REGISTER && *register != TRIGGER_REGISTER,
                "Program register values overwrite the reserved {register}"
            );
        }

        self.wait_for_compile_and_upload()?;
        for sibling in siblings.iter_mut() {
            sibling.wait_for_compile_and_upload()?;
        }

        self.set_user_register(TRIGGER_REGISTER, 0)?;
        match name {
            None => {
                self.set_user_register(PROG_SEL_REGISTER, PROG_SEL_NONE)?;
                self.current_program = None;
                self.state = GroupState::Uploaded;
            }
            Some(name) => {
                for (register, value) in register_values {
                    self.set_user_register(register, value)?;
                }
                let index = self.program_manager.program_index(name)?;
                self.set_user_register(PROG_SEL_REGISTER, index | NO_RESET_MASK)?;
                awg_log::info!("{}: armed program '{}'", self.identifier, name);
                self.current_program = Some(name.to_string());
                self.state = GroupState::Armed;
            }
        }
        self.set_enabled(true)
    }

    /// Start the armed program.
    pub fn run(&mut self) -> Result<()> {
        if self.current_program.is_none() {
            return Err(Error::runtime("No program active"));
        }
        if !self.enabled()? {
            self.set_enabled(true)?;
        }
        self.set_user_register(TRIGGER_REGISTER, TRIGGER_RESET_MASK)?;
        self.state = GroupState::Running;
        Ok(())
    }

    /// Update volatile parameters of `name`.
    ///
    /// The registers are written at once if `name` is armed. Otherwise the
    /// values are written by the next `arm`.
    pub fn set_register_values(
        &mut self,
        name: &str,
        updates: &HashMap<String, u32>,
    ) -> Result<()> {
        let writes = self
            .program_manager
            .update_volatile_parameters(name, updates)?;
        if self.current_program.as_deref() == Some(name) {
            for (register, value) in writes {
                self.set_user_register(register, value)?;
            }
        }
        Ok(())
    }

    /// Advance the background compile and upload by one device poll.
    ///
    /// Reports [`ProgressState::Done`] once the device holds the required source.
    pub fn step_upload(&mut self) -> Result<ProgressState> {
        if let Some(pending) = &mut self.pending {
            let state = match self.elf_manager.step(&mut pending.handle, None) {
                Ok(state) => state,
                Err(e) => {
                    self.pending = None;
                    return Err(e);
                }
            };
            if state != ProgressState::Done {
                return Ok(state);
            }
            if let Some(done) = self.pending.take() {
                self.uploaded_source = Some(done.source);
            }
        }
        if self.is_synchronized() {
            return Ok(ProgressState::Done);
        }
        self.begin_upload()?;
        Ok(match self.pending.as_ref().map(|p| p.handle.phase()) {
            Some(Phase::Compiling) => ProgressState::Compiling,
            Some(Phase::Uploading) => ProgressState::Uploading { progress: 0.0 },
            _ => ProgressState::Done,
        })
    }

    /// Block until the device holds the source of the current program set.
    pub fn wait_for_compile_and_upload(&mut self) -> Result<()> {
        loop {
            let state = self.step_upload()?;
            awg_log::diagnostic!("{}: {:?}", self.identifier, state);
            if state == ProgressState::Done && self.is_synchronized() {
                return Ok(());
            }
            thread::sleep(self.settings.poll_interval());
        }
    }

    pub fn user_register(&self, register: Register) -> Result<u32> {
        let value = self
            .session
            .get_node(&self.register_path(register))?
            .as_int()?;
        u32::try_from(value).map_err(|_| {
            Error::communication(format!("{register} holds {value}, expected 32 bit unsigned"))
        })
    }

    /// Write a register and wait for the device to take it.
    pub fn set_user_register(&self, register: Register, value: u32) -> Result<()> {
        self.session
            .set_node(&self.register_path(register), i64::from(value).into())?;
        self.session.sync()
    }

    pub fn enabled(&self) -> Result<bool> {
        let path = DeviceNode::Enable {
            awg: self.awg_index,
        }
        .path(&self.serial);
        Ok(self.session.get_node(&path)?.as_int()? != 0)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let path = DeviceNode::Enable {
            awg: self.awg_index,
        }
        .path(&self.serial);
        self.session.set_node(&path, NodeValue::from(enabled))?;
        self.session.sync()
    }

    pub fn was_current_program_finished(&self) -> Result<bool> {
        Ok(self.user_register(PROG_SEL_REGISTER)? & PLAYBACK_FINISHED_MASK != 0)
    }

    fn register_path(&self, register: Register) -> String {
        DeviceNode::UserRegister {
            awg: self.awg_index,
            register,
        }
        .path(&self.serial)
    }

    fn update_required_source(&mut self) -> Result<()> {
        self.required_source = self.program_manager.to_source()?;
        self.begin_upload()
    }

    fn begin_upload(&mut self) -> Result<()> {
        if let Some(pending) = &mut self.pending {
            if pending.source == self.required_source {
                return Ok(());
            }
            match pending.handle.phase() {
                Phase::Compiling => {
                    awg_log::debug!(
                        "{}: source changed while compiling, uploading it afterwards",
                        self.identifier
                    );
                    return Ok(());
                }
                Phase::Uploading => {
                    match self.elf_manager.step(&mut pending.handle, Some(Command::Abort)) {
                        Err(Error::Upload(msg)) => awg_log::debug!("{}: {}", self.identifier, msg),
                        Err(e) => return Err(e),
                        Ok(_) => {}
                    }
                }
                Phase::Done | Phase::Failed => {}
            }
            self.pending = None;
        }
        if self.is_synchronized() {
            return Ok(());
        }
        let handle = self.elf_manager.begin(&self.required_source)?;
        if handle.is_done() {
            self.uploaded_source = Some(self.required_source.clone());
        } else {
            self.uploaded_source = None;
            self.pending = Some(PendingUpload {
                handle,
                source: self.required_source.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{CompileOutcome, Event, SimulatedInstrument};
    use awg_program::timing::{Loop, RepetitionCount, Waveform};

    fn seg(label: &str, samples: u64) -> Waveform {
        Waveform::segment_on(label, samples as f64 / HDAWG_TRAITS.sampling_rate, ["X"])
    }

    fn spec(label: &str) -> ProgramSpec {
        program_spec(Loop::leaf(seg(label, 64), RepetitionCount::Fixed(1)))
    }

    fn program_spec(program: Loop) -> ProgramSpec {
        ProgramSpec::new(program, vec![Some("X".to_string()), None], vec![None; 4])
    }

    fn volatile_spec(value: u32) -> ProgramSpec {
        let repetition = RepetitionCount::Volatile {
            parameter: "n".to_string(),
            value,
        };
        program_spec(Loop::sequence(
            vec![Loop::leaf(seg("v", 64), repetition)],
            RepetitionCount::Fixed(1),
        ))
    }

    fn group(sim: &SimulatedInstrument) -> ChannelGroup {
        let settings = AwgSettings {
            poll_interval_ms: 0,
            ..AwgSettings::default()
        };
        ChannelGroup::new(Arc::new(sim.clone()), "dev8000", 0, 2, settings).unwrap()
    }

    fn register(index: u8) -> Register {
        Register::from_zero_based(index).unwrap()
    }

    #[test]
    fn test_upload_arm_run() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        assert_eq!(group.state(), GroupState::Cleared);
        assert_eq!(group.num_markers(), 4);

        group.upload("p1", spec("a"), false).unwrap();
        group.arm(Some("p1")).unwrap();
        assert_eq!(group.state(), GroupState::Armed);
        assert!(group.is_synchronized());
        assert!(group.enabled().unwrap());
        group.run().unwrap();
        assert_eq!(group.state(), GroupState::Running);

        let index = group.program_manager().program_index("p1").unwrap();
        assert_eq!(
            sim.user_register(0, PROG_SEL_REGISTER),
            i64::from(index | NO_RESET_MASK)
        );
        assert_eq!(
            sim.user_register(0, TRIGGER_REGISTER),
            i64::from(TRIGGER_RESET_MASK)
        );
        assert_eq!(sim.compile_count(), 1);
        assert_eq!(sim.upload_count(), 1);
    }

    #[test]
    fn test_upload_returns_promptly() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path()).with_compile_polls(5);
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        assert_eq!(sim.compile_count(), 1);
        assert_eq!(sim.upload_count(), 0);
        assert!(!group.is_synchronized());
        assert_eq!(group.step_upload().unwrap(), ProgressState::Compiling);
        assert!(sim.writes().is_empty());

        group.arm(Some("p1")).unwrap();
        assert_eq!(sim.upload_count(), 1);
    }

    #[test]
    fn test_arm_writes_registers_after_upload() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path())
            .with_compile_polls(2)
            .with_upload_polls(4);
        let mut group = group(&sim);
        group.upload("p1", volatile_spec(3), false).unwrap();
        group.step_upload().unwrap();
        group.arm(Some("p1")).unwrap();

        let events = sim.events();
        let uploaded = events
            .iter()
            .rposition(|e| matches!(e, Event::UploadFinished(_)))
            .unwrap();
        let first_register_write = events
            .iter()
            .position(|e| matches!(e, Event::Write(path) if path.contains("/userregs/")))
            .unwrap();
        assert!(first_register_write > uploaded);
        assert_eq!(sim.upload_count(), 1);
        // Every register write is followed by a sync
        assert_eq!(events.get(first_register_write + 1), Some(&Event::Sync));
    }

    #[test]
    fn test_upload_replaces_running_upload() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path()).with_upload_polls(5);
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        while group.step_upload().unwrap() == ProgressState::Compiling {}
        assert!(matches!(
            group.step_upload().unwrap(),
            ProgressState::Uploading { .. }
        ));

        // The stale upload is aborted and the new source compiled right away
        group.upload("p2", spec("b"), false).unwrap();
        assert_eq!(sim.compile_count(), 2);
        assert!(!group.is_synchronized());

        group.arm(Some("p2")).unwrap();
        assert!(group.is_synchronized());
        assert_eq!(sim.upload_count(), 1);
        let uploads = sim
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::UploadFinished(_)))
            .count();
        assert_eq!(uploads, 1);
    }

    #[test]
    fn test_arm_unknown_program() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        assert!(matches!(group.arm(Some("missing")), Err(Error::Configuration(_))));
        assert!(sim.writes().is_empty());
    }

    #[test]
    fn test_run_without_arm() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        assert!(matches!(group.run(), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_clear_disarms() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        group.arm(Some("p1")).unwrap();
        group.run().unwrap();

        group.clear().unwrap();
        assert_eq!(group.state(), GroupState::Cleared);
        assert_eq!(group.current_program(), None);
        assert_eq!(group.programs().count(), 0);
        assert_eq!(
            sim.user_register(0, PROG_SEL_REGISTER),
            i64::from(PROG_SEL_NONE)
        );
        group.arm(None).unwrap();
        assert_eq!(group.state(), GroupState::Uploaded);
        assert!(matches!(group.run(), Err(Error::Runtime(_))));
    }

    #[test]
    fn test_duplicate_upload_requires_force() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        assert!(matches!(
            group.upload("p1", spec("b"), false),
            Err(Error::Configuration(_))
        ));
        group.upload("p1", spec("b"), true).unwrap();
        group.arm(Some("p1")).unwrap();
        assert_eq!(sim.compile_count(), 2);

        // The binary of the replaced source is kept
        let binaries = std::fs::read_dir(dir.path().join("awg").join("elf"))
            .unwrap()
            .count();
        assert_eq!(binaries, 2);
    }

    #[test]
    fn test_rearm_reuses_upload() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        group.arm(Some("p1")).unwrap();
        group.arm(None).unwrap();
        group.arm(Some("p1")).unwrap();
        assert_eq!(sim.compile_count(), 1);
        assert_eq!(sim.upload_count(), 1);
    }

    #[test]
    fn test_restored_source_not_recompiled() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        group.arm(Some("p1")).unwrap();
        group.upload("p2", spec("b"), false).unwrap();
        group.arm(Some("p2")).unwrap();
        group.remove("p2").unwrap();
        group.arm(Some("p1")).unwrap();
        assert_eq!(sim.compile_count(), 2);
        assert_eq!(sim.upload_count(), 3);
    }

    #[test]
    fn test_remove_armed_program() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        group.arm(Some("p1")).unwrap();
        group.remove("p1").unwrap();
        assert_eq!(group.current_program(), None);
        assert!(matches!(group.run(), Err(Error::Runtime(_))));
        assert!(group.remove("p1").is_err());
    }

    #[test]
    #[should_panic(expected = "reserved")]
    fn test_register_collision_traps() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        group
            .program_manager
            .force_register_value("p1", TRIGGER_REGISTER, 7);
        let _ = group.arm(Some("p1"));
    }

    #[test]
    fn test_volatile_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        group.upload("p1", volatile_spec(3), false).unwrap();
        group.upload("p2", volatile_spec(4), false).unwrap();
        group.arm(Some("p1")).unwrap();
        assert_eq!(sim.user_register(0, register(2)), 3);
        let compiles = sim.compile_count();

        let syncs = sim.sync_count();
        group
            .set_register_values("p1", &HashMap::from([("n".to_string(), 7)]))
            .unwrap();
        assert_eq!(sim.user_register(0, register(2)), 7);
        assert_eq!(sim.sync_count(), syncs + 1);

        // Not armed: recorded for the next arm
        group
            .set_register_values("p2", &HashMap::from([("n".to_string(), 9)]))
            .unwrap();
        assert_eq!(sim.user_register(0, register(2)), 7);
        group.arm(Some("p2")).unwrap();
        assert_eq!(sim.user_register(0, register(2)), 9);

        assert!(matches!(
            group.set_register_values("p2", &HashMap::from([("m".to_string(), 1)])),
            Err(Error::Configuration(_))
        ));
        assert_eq!(sim.compile_count(), compiles);
    }

    #[test]
    fn test_register_access() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let group = group(&sim);
        group.set_user_register(register(5), 42).unwrap();
        assert_eq!(group.user_register(register(5)).unwrap(), 42);
        assert_eq!(sim.sync_count(), 1);
        assert_eq!(sim.writes()[0].0, "/dev8000/awgs/0/userregs/5".to_string());

        assert!(!group.was_current_program_finished().unwrap());
        group
            .set_user_register(PROG_SEL_REGISTER, PLAYBACK_FINISHED_MASK | 1)
            .unwrap();
        assert!(group.was_current_program_finished().unwrap());

        group.set_enabled(false).unwrap();
        assert!(!group.enabled().unwrap());
    }

    #[test]
    fn test_compile_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        sim.set_compile_outcome(CompileOutcome::Failure("syntax error".to_string()));
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        assert!(matches!(
            group.arm(Some("p1")),
            Err(Error::Compilation { .. })
        ));
        assert_eq!(group.state(), GroupState::Cleared);

        sim.set_compile_outcome(CompileOutcome::Success);
        group.arm(Some("p1")).unwrap();
        assert_eq!(sim.compile_count(), 2);
    }

    #[test]
    fn test_transport_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimulatedInstrument::new("dev8000", dir.path());
        let mut group = group(&sim);
        group.upload("p1", spec("a"), false).unwrap();
        sim.set_transport_failure(true);
        assert!(matches!(group.arm(Some("p1")), Err(Error::DeviceCommunication(_))));
    }
}
