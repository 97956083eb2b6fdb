// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Named programs of one channel group and the sequencer source they form.
//!
//! Every program becomes a function `<name>_function`. A runtime loop reads
//! the selected program from [`PROG_SEL_REGISTER`], writes the acknowledged
//! selection back and calls the function. Programs started by software wait
//! for a write to [`TRIGGER_REGISTER`] before they play.
//!
//! The generated source is a pure function of the program set and its
//! insertion order. It is the key of the compile cache.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, LazyLock};

use awg_program::lower::{LoweredProgram, lower_program};
use awg_program::register::{Register, RegisterAllocator};
use awg_program::seqc_generator::SeqCGenerator;
use awg_program::seqc_statements::SeqCVariant;
use awg_program::timing::{Loop, make_compatible};
use indexmap::{IndexMap, IndexSet};
use regex::Regex;

use crate::settings::AwgSettings;
use crate::{Error, Result};

pub const PROG_SEL_REGISTER: Register = Register::from_zero_based_const(0);
pub const TRIGGER_REGISTER: Register = Register::from_zero_based_const(1);
/// Written to [`TRIGGER_REGISTER`] to start the armed program.
pub const TRIGGER_RESET_MASK: u32 = 1 << 31;
pub const PROG_SEL_NONE: u32 = 0;
/// Keeps a selection alive after its program finished.
pub const NO_RESET_MASK: u32 = 1 << 31;
pub const PLAYBACK_FINISHED_MASK: u32 = 1 << 30;
pub const PROG_SEL_MASK: u32 = (1 << 30) - 1;
pub const INVERTED_PROG_SEL_MASK: u32 = !PROG_SEL_MASK;

const RESERVED_REGISTERS: [Register; 2] = [PROG_SEL_REGISTER, TRIGGER_REGISTER];

static PROGRAM_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_][0-9a-zA-Z_]*$").expect("Internal error: invalid name pattern")
});

/// Maps program voltages of one channel before the amplitude is applied.
#[derive(Clone, Default)]
pub enum VoltageTransform {
    #[default]
    Identity,
    Linear {
        scale: f64,
        offset: f64,
    },
    Custom(Arc<dyn Fn(f64) -> f64 + Send + Sync>),
}

impl VoltageTransform {
    pub fn apply(&self, voltage: f64) -> f64 {
        match self {
            VoltageTransform::Identity => voltage,
            VoltageTransform::Linear { scale, offset } => voltage * scale + offset,
            VoltageTransform::Custom(transform) => transform(voltage),
        }
    }
}

impl fmt::Debug for VoltageTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoltageTransform::Identity => write!(f, "Identity"),
            VoltageTransform::Linear { scale, offset } => f
                .debug_struct("Linear")
                .field("scale", scale)
                .field("offset", offset)
                .finish(),
            VoltageTransform::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Wait for [`TRIGGER_REGISTER`] after the program is selected.
    #[default]
    Software,
    /// Play as soon as the program is selected.
    Immediate,
}

/// A program as handed over by the caller.
///
/// The voltage transforms and output ranges are validated and kept with the
/// program for sampling its waveforms. They do not enter the sequencer source.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub program: Loop,
    /// Program channel identifier per output channel, `None` for unused outputs.
    pub channels: Vec<Option<String>>,
    pub markers: Vec<Option<String>>,
    /// One per output channel.
    pub voltage_transforms: Vec<VoltageTransform>,
    /// Output amplitude per channel in volt.
    pub amplitudes: Vec<f64>,
    /// Output offset per channel in volt.
    pub offsets: Vec<f64>,
    pub trigger: TriggerMode,
}

impl ProgramSpec {
    /// Identity voltage transforms, 1 V amplitude, no offset and software trigger.
    pub fn new(
        program: Loop,
        channels: Vec<Option<String>>,
        markers: Vec<Option<String>>,
    ) -> Self {
        let num_channels = channels.len();
        Self {
            program,
            channels,
            markers,
            voltage_transforms: vec![VoltageTransform::Identity; num_channels],
            amplitudes: vec![1.0; num_channels],
            offsets: vec![0.0; num_channels],
            trigger: TriggerMode::default(),
        }
    }

    pub fn with_voltage_transforms(mut self, transforms: Vec<VoltageTransform>) -> Self {
        self.voltage_transforms = transforms;
        self
    }

    pub fn with_output_ranges(mut self, amplitudes: Vec<f64>, offsets: Vec<f64>) -> Self {
        self.amplitudes = amplitudes;
        self.offsets = offsets;
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerMode) -> Self {
        self.trigger = trigger;
        self
    }
}

/// Helper functions shared by all programs of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Helper {
    WaitForSoftwareTrigger,
}

impl Helper {
    fn name(self) -> &'static str {
        match self {
            Helper::WaitForSoftwareTrigger => "waitForSoftwareTrigger",
        }
    }

    fn definition(self) -> Result<SeqCGenerator> {
        let mut body = SeqCGenerator::new();
        match self {
            Helper::WaitForSoftwareTrigger => {
                let read_trigger = SeqCVariant::String("getUserReg(TRIGGER_REGISTER)".to_string());
                body.add_variable_declaration("trigger_register", Some(read_trigger.clone()))?;
                let mut poll = SeqCGenerator::new();
                poll.add_variable_assignment("trigger_register", read_trigger);
                body.add_while("trigger_register == 0", poll);
                let mut reset = SeqCGenerator::new();
                reset.add_function_call_statement(
                    "setUserReg",
                    vec![
                        SeqCVariant::String("TRIGGER_REGISTER".to_string()),
                        SeqCVariant::Integer(0),
                    ],
                    None::<String>,
                );
                body.add_if("trigger_register & TRIGGER_RESET_MASK", reset);
            }
        }
        Ok(body)
    }
}

#[derive(Debug, Clone)]
pub struct ProgramEntry {
    name: String,
    index: u32,
    spec: ProgramSpec,
    lowered: LoweredProgram,
    sample_rate: f64,
}

impl ProgramEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// The timing tree after it was made compatible with the hardware.
    pub fn program(&self) -> &Loop {
        &self.spec.program
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn trigger(&self) -> TriggerMode {
        self.spec.trigger
    }

    pub fn function_name(&self) -> String {
        format!("{}_function", self.name)
    }

    /// Names of the volatile parameters of this program.
    pub fn volatile_parameters(&self) -> impl Iterator<Item = &str> {
        self.lowered.volatile.keys().map(String::as_str)
    }

    fn required_helpers(&self, helpers: &mut IndexSet<Helper>) {
        if self.spec.trigger == TriggerMode::Software {
            helpers.insert(Helper::WaitForSoftwareTrigger);
        }
    }

    fn function_body(&self) -> SeqCGenerator {
        let mut body = SeqCGenerator::new();
        if self.spec.trigger == TriggerMode::Software {
            body.add_function_call_statement(
                Helper::WaitForSoftwareTrigger.name(),
                vec![],
                None::<String>,
            );
        }
        body.append_statements_from(&self.lowered.body);
        body
    }
}

/// The programs of one channel group.
#[derive(Debug)]
pub struct ProgramManager {
    num_channels: usize,
    num_markers: usize,
    min_waveform_length: u64,
    waveform_quantum: u64,
    idle_wait_cycles: u32,
    programs: IndexMap<String, ProgramEntry>,
}

impl ProgramManager {
    pub fn new(num_channels: usize, num_markers: usize, settings: &AwgSettings) -> Self {
        Self {
            num_channels,
            num_markers,
            min_waveform_length: settings.min_waveform_length,
            waveform_quantum: settings.waveform_quantum,
            idle_wait_cycles: settings.idle_wait_cycles,
            programs: IndexMap::new(),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn num_markers(&self) -> usize {
        self.num_markers
    }

    /// Add a new program.
    ///
    /// The timing tree is rewritten to satisfy the minimum waveform length and
    /// the length quantum at `sample_rate`.
    pub fn add_program(&mut self, name: &str, spec: ProgramSpec, sample_rate: f64) -> Result<()> {
        if self.programs.contains_key(name) {
            return Err(Error::configuration(format!(
                "Program '{name}' already exists"
            )));
        }
        let index = self.free_index()?;
        let entry = self.build_entry(name, index, spec, sample_rate)?;
        awg_log::debug!("Added program '{}' with index {}", name, index);
        self.programs.insert(name.to_string(), entry);
        Ok(())
    }

    /// Replace the definition of `name`, keeping its index and position.
    pub fn replace_program(
        &mut self,
        name: &str,
        spec: ProgramSpec,
        sample_rate: f64,
    ) -> Result<()> {
        let index = self.program_index(name)?;
        let entry = self.build_entry(name, index, spec, sample_rate)?;
        self.programs.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.programs
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::configuration(format!("Unknown program '{name}'")))
    }

    pub fn clear(&mut self) {
        self.programs.clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    /// Program names in insertion order.
    pub fn programs(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    pub fn program(&self, name: &str) -> Result<&ProgramEntry> {
        self.programs
            .get(name)
            .ok_or_else(|| Error::configuration(format!("Unknown program '{name}'")))
    }

    /// Index of `name` in the selected-program register.
    pub fn program_index(&self, name: &str) -> Result<u32> {
        Ok(self.program(name)?.index)
    }

    /// Register values that must be written before `name` runs.
    pub fn register_values_for(&self, name: &str) -> Result<BTreeMap<Register, u32>> {
        Ok(self
            .program(name)?
            .lowered
            .volatile
            .values()
            .map(|v| (v.register, v.value))
            .collect())
    }

    /// Store new values of volatile parameters of `name`.
    ///
    /// Either all `updates` are applied or none. Returns the register writes
    /// the updates imply.
    pub fn update_volatile_parameters(
        &mut self,
        name: &str,
        updates: &HashMap<String, u32>,
    ) -> Result<BTreeMap<Register, u32>> {
        let entry = self
            .programs
            .get_mut(name)
            .ok_or_else(|| Error::configuration(format!("Unknown program '{name}'")))?;
        if let Some(unknown) = updates
            .keys()
            .find(|parameter| !entry.lowered.volatile.contains_key(*parameter))
        {
            return Err(Error::configuration(format!(
                "Program '{name}' has no volatile parameter '{unknown}'"
            )));
        }
        let mut writes = BTreeMap::new();
        for (parameter, value) in updates {
            if let Some(volatile) = entry.lowered.volatile.get_mut(parameter) {
                volatile.value = *value;
                writes.insert(volatile.register, *value);
            }
        }
        Ok(writes)
    }

    #[cfg(test)]
    pub(crate) fn force_register_value(&mut self, name: &str, register: Register, value: u32) {
        if let Some(entry) = self.programs.get_mut(name) {
            entry.lowered.volatile.insert(
                format!("forced_{}", register.zero_based()),
                awg_program::lower::VolatileRepetition { register, value },
            );
        }
    }

    /// The complete sequencer source for all programs.
    pub fn to_source(&self) -> Result<String> {
        let mut source = SeqCGenerator::new();
        for (name, value, comment) in self.constants() {
            source.add_constant_definition(name, SeqCVariant::Integer(value), comment);
        }

        let mut helpers = IndexSet::new();
        for entry in self.programs.values() {
            entry.required_helpers(&mut helpers);
        }
        for helper in helpers {
            source.add_function_def(helper.name(), helper.definition()?);
        }

        for entry in self.programs.values() {
            source.add_function_def(entry.function_name(), entry.function_body());
        }

        for variable in ["prog_sel", "new_prog_sel", "playback_finished"] {
            source.add_variable_declaration(variable, Some(SeqCVariant::Integer(0)))?;
        }
        source.add_while("true", self.runtime_block()?);
        Ok(source.generate_seq_c())
    }

    fn constants(&self) -> [(&'static str, i64, Option<&'static str>); 9] {
        [
            (
                "PROG_SEL_REGISTER",
                PROG_SEL_REGISTER.zero_based().into(),
                None,
            ),
            (
                "TRIGGER_REGISTER",
                TRIGGER_REGISTER.zero_based().into(),
                None,
            ),
            ("TRIGGER_RESET_MASK", TRIGGER_RESET_MASK.into(), None),
            ("PROG_SEL_NONE", PROG_SEL_NONE.into(), None),
            (
                "NO_RESET_MASK",
                NO_RESET_MASK.into(),
                Some("keep the selection after playback"),
            ),
            ("PLAYBACK_FINISHED_MASK", PLAYBACK_FINISHED_MASK.into(), None),
            ("PROG_SEL_MASK", PROG_SEL_MASK.into(), None),
            ("INVERTED_PROG_SEL_MASK", INVERTED_PROG_SEL_MASK.into(), None),
            ("IDLE_WAIT_CYCLES", self.idle_wait_cycles.into(), None),
        ]
    }

    fn runtime_block(&self) -> Result<SeqCGenerator> {
        let expr = |s: &str| SeqCVariant::String(s.to_string());
        let mut block = SeqCGenerator::new();
        block.add_variable_assignment("prog_sel", expr("getUserReg(PROG_SEL_REGISTER)"));
        block.add_variable_assignment("new_prog_sel", expr("prog_sel | playback_finished"));
        let mut reset = SeqCGenerator::new();
        reset.add_variable_assignment(
            "new_prog_sel",
            expr("new_prog_sel & INVERTED_PROG_SEL_MASK"),
        );
        block.add_if("!(prog_sel & NO_RESET_MASK)", reset);
        block.add_function_call_statement(
            "setUserReg",
            vec![expr("PROG_SEL_REGISTER"), expr("new_prog_sel")],
            None::<String>,
        );
        block.add_variable_assignment("playback_finished", SeqCVariant::Integer(0));
        block.add_variable_assignment("prog_sel", expr("prog_sel & PROG_SEL_MASK"));

        let cases = self
            .programs
            .values()
            .map(|entry| {
                let mut case = SeqCGenerator::new();
                case.add_function_call_statement(entry.function_name(), vec![], None::<String>);
                case.add_function_call_statement("waitWaveDone", vec![], None::<String>);
                case.add_variable_assignment("playback_finished", expr("PLAYBACK_FINISHED_MASK"));
                (i64::from(entry.index), case)
            })
            .collect();
        let mut idle = SeqCGenerator::new();
        idle.add_function_call_statement("wait", vec![expr("IDLE_WAIT_CYCLES")], None::<String>);
        block.add_switch("prog_sel", cases, Some(idle))?;
        Ok(block)
    }

    /// Lowest index that is neither used nor the "none" selection.
    fn free_index(&self) -> Result<u32> {
        (PROG_SEL_NONE + 1..=PROG_SEL_MASK)
            .find(|index| self.programs.values().all(|p| p.index != *index))
            .ok_or_else(|| Error::configuration("No free program index left"))
    }

    fn build_entry(
        &self,
        name: &str,
        index: u32,
        mut spec: ProgramSpec,
        sample_rate: f64,
    ) -> Result<ProgramEntry> {
        if !PROGRAM_NAME.is_match(name) {
            return Err(Error::configuration(format!(
                "Program name '{name}' is not a valid sequencer identifier"
            )));
        }
        self.check_lengths(&spec)?;
        if let Some(amplitude) = spec.amplitudes.iter().find(|a| !(a.is_finite() && **a > 0.0)) {
            return Err(Error::configuration(format!(
                "Channel amplitude must be positive, got {amplitude}"
            )));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(Error::configuration(format!(
                "Invalid sample rate {sample_rate}"
            )));
        }
        check_mapping(&spec)?;

        make_compatible(
            &mut spec.program,
            self.min_waveform_length,
            self.waveform_quantum,
            sample_rate,
        )?;
        let mut registers = RegisterAllocator::new(&RESERVED_REGISTERS);
        let lowered = lower_program(&spec.program, &mut registers)?;
        Ok(ProgramEntry {
            name: name.to_string(),
            index,
            spec,
            lowered,
            sample_rate,
        })
    }

    fn check_lengths(&self, spec: &ProgramSpec) -> Result<()> {
        let checks = [
            ("channels", spec.channels.len(), self.num_channels),
            ("markers", spec.markers.len(), self.num_markers),
            (
                "voltage transforms",
                spec.voltage_transforms.len(),
                self.num_channels,
            ),
            ("amplitudes", spec.amplitudes.len(), self.num_channels),
            ("offsets", spec.offsets.len(), self.num_channels),
        ];
        for (what, got, expected) in checks {
            if got != expected {
                return Err(Error::configuration(format!(
                    "Expected {expected} {what}, got {got}"
                )));
            }
        }
        Ok(())
    }
}

/// Every channel the program defines must be mapped to exactly one output.
fn check_mapping(spec: &ProgramSpec) -> Result<()> {
    let mut mapped = IndexSet::new();
    for id in spec.channels.iter().chain(&spec.markers).flatten() {
        if !mapped.insert(id.as_str()) {
            return Err(Error::configuration(format!(
                "Channel '{id}' is mapped to more than one output"
            )));
        }
    }
    let unmapped = spec
        .program
        .defined_channels()
        .into_iter()
        .filter(|c| !mapped.contains(c.as_str()))
        .collect::<Vec<_>>();
    if !unmapped.is_empty() {
        return Err(Error::configuration(format!(
            "Program channels {unmapped:?} are not mapped to any output"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use awg_program::timing::{RepetitionCount, Waveform};

    const RATE: f64 = 1e9;

    fn seg(label: &str, samples: u64) -> Waveform {
        Waveform::segment_on(label, samples as f64 / RATE, ["A"])
    }

    fn spec(program: Loop) -> ProgramSpec {
        ProgramSpec::new(program, vec![Some("A".to_string()), None], vec![None; 4])
    }

    fn simple() -> ProgramSpec {
        spec(Loop::leaf(seg("a", 64), RepetitionCount::Fixed(1)))
    }

    fn manager() -> ProgramManager {
        ProgramManager::new(2, 4, &AwgSettings::default())
    }

    fn add(manager: &mut ProgramManager, name: &str, spec: ProgramSpec) -> Result<()> {
        manager.add_program(name, spec, RATE)
    }

    #[test]
    fn test_program_indices() {
        let mut manager = manager();
        add(&mut manager, "p1", simple()).unwrap();
        add(&mut manager, "p2", simple()).unwrap();
        assert_eq!(manager.program_index("p1").unwrap(), 1);
        assert_eq!(manager.program_index("p2").unwrap(), 2);
        manager.remove("p1").unwrap();
        add(&mut manager, "p3", simple()).unwrap();
        assert_eq!(manager.program_index("p3").unwrap(), 1);
        assert_eq!(manager.programs().collect::<Vec<_>>(), ["p2", "p3"]);
    }

    #[test]
    fn test_duplicate_name() {
        let mut manager = manager();
        add(&mut manager, "p1", simple()).unwrap();
        assert!(matches!(
            add(&mut manager, "p1", simple()),
            Err(Error::Configuration(_))
        ));
        manager.replace_program("p1", simple(), RATE).unwrap();
        assert_eq!(manager.program_index("p1").unwrap(), 1);
    }

    #[test]
    fn test_invalid_definitions() {
        let mut manager = manager();
        assert!(add(&mut manager, "1abc", simple()).is_err());
        assert!(add(&mut manager, "a b", simple()).is_err());

        let mut wrong_channels = simple();
        wrong_channels.channels.push(None);
        assert!(matches!(
            add(&mut manager, "p", wrong_channels),
            Err(Error::Configuration(_))
        ));

        let mut wrong_markers = simple();
        wrong_markers.markers.pop();
        assert!(add(&mut manager, "p", wrong_markers).is_err());

        let unmapped = ProgramSpec::new(
            Loop::leaf(seg("a", 64), RepetitionCount::Fixed(1)),
            vec![None, None],
            vec![None; 4],
        );
        assert!(add(&mut manager, "p", unmapped).is_err());

        let zero_amplitude = simple().with_output_ranges(vec![0.0, 1.0], vec![0.0, 0.0]);
        assert!(add(&mut manager, "p", zero_amplitude).is_err());
        assert!(manager.add_program("p", simple(), 0.0).is_err());
        assert!(manager.programs().next().is_none());
    }

    #[test]
    fn test_too_short_program_rejected() {
        let mut manager = manager();
        let short = spec(Loop::leaf(seg("a", 16), RepetitionCount::Fixed(1)));
        assert!(matches!(add(&mut manager, "p", short), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_program_made_compatible() {
        let mut manager = manager();
        let short_leaf = spec(Loop::leaf(seg("a", 8), RepetitionCount::Fixed(4)));
        add(&mut manager, "p", short_leaf).unwrap();
        let program = manager.program("p").unwrap().program();
        assert_eq!(program.repetition, RepetitionCount::Fixed(1));
        assert!(matches!(
            program.waveform,
            Some(Waveform::Repeated { count: 4, .. })
        ));
    }

    #[test]
    fn test_source_layout() {
        let mut manager = manager();
        add(&mut manager, "p1", simple()).unwrap();
        add(
            &mut manager,
            "p2",
            simple().with_trigger(TriggerMode::Immediate),
        )
        .unwrap();
        let source = manager.to_source().unwrap();
        assert!(source.starts_with("const PROG_SEL_REGISTER = 0;\nconst TRIGGER_REGISTER = 1;\n"));
        assert!(source.contains("const IDLE_WAIT_CYCLES = 300;\n"));
        assert!(source.contains(
            "void p1_function() {\n  waitForSoftwareTrigger();\n  playWave(\"wave_"
        ));
        assert!(source.contains("void p2_function() {\n  playWave(\"wave_"));
        assert!(source.contains(
            "    case 1:\n      p1_function();\n      waitWaveDone();\n      playback_finished = PLAYBACK_FINISHED_MASK;\n"
        ));
        assert!(source.contains("    case 2:\n      p2_function();\n"));
        assert!(source.contains("    default:\n      wait(IDLE_WAIT_CYCLES);\n"));
        assert!(source.ends_with("}\n"));
    }

    #[test]
    fn test_source_is_deterministic() {
        let build = || {
            let mut manager = manager();
            add(&mut manager, "p1", simple()).unwrap();
            add(&mut manager, "p2", simple()).unwrap();
            manager.to_source().unwrap()
        };
        assert_eq!(build(), build());

        let mut reordered = manager();
        add(&mut reordered, "p2", simple()).unwrap();
        add(&mut reordered, "p1", simple()).unwrap();
        assert_ne!(reordered.to_source().unwrap(), build());
    }

    #[test]
    fn test_helpers_defined_once() {
        let mut manager = manager();
        add(&mut manager, "p1", simple()).unwrap();
        add(&mut manager, "p2", simple()).unwrap();
        let source = manager.to_source().unwrap();
        assert_eq!(source.matches("void waitForSoftwareTrigger()").count(), 1);

        let mut immediate = self::manager();
        add(&mut immediate, "p", simple().with_trigger(TriggerMode::Immediate)).unwrap();
        assert!(!immediate.to_source().unwrap().contains("waitForSoftwareTrigger"));
    }

    #[test]
    fn test_empty_source() {
        let source = manager().to_source().unwrap();
        assert!(source.contains("switch (prog_sel) {\n    default:\n"));
        assert!(!source.contains("_function"));
    }

    #[test]
    fn test_volatile_parameters() {
        let volatile = RepetitionCount::Volatile {
            parameter: "n".to_string(),
            value: 5,
        };
        let program = Loop::sequence(
            vec![Loop::leaf(seg("a", 64), volatile)],
            RepetitionCount::Fixed(1),
        );
        let mut manager = manager();
        add(&mut manager, "p", spec(program)).unwrap();

        let first_free = Register::from_zero_based(2).unwrap();
        let values = manager.register_values_for("p").unwrap();
        assert_eq!(values, BTreeMap::from([(first_free, 5)]));
        assert!(manager.to_source().unwrap().contains("repeat (getUserReg(2))"));

        let source_before = manager.to_source().unwrap();
        let writes = manager
            .update_volatile_parameters("p", &HashMap::from([("n".to_string(), 9)]))
            .unwrap();
        assert_eq!(writes, BTreeMap::from([(first_free, 9)]));
        assert_eq!(manager.register_values_for("p").unwrap()[&first_free], 9);
        assert_eq!(manager.to_source().unwrap(), source_before);

        assert!(matches!(
            manager.update_volatile_parameters("p", &HashMap::from([("m".to_string(), 1)])),
            Err(Error::Configuration(_))
        ));
        assert!(manager.register_values_for("unknown").is_err());
    }

    #[test]
    fn test_output_ranges_and_transforms() {
        let transforms = vec![
            VoltageTransform::Linear {
                scale: 2.0,
                offset: 0.5,
            },
            VoltageTransform::Custom(Arc::new(|v| -v)),
        ];
        let mut manager = manager();
        add(
            &mut manager,
            "p",
            simple()
                .with_voltage_transforms(transforms)
                .with_output_ranges(vec![2.0, 1.0], vec![0.5, 0.0]),
        )
        .unwrap();
        let carried = &manager.program("p").unwrap().spec.voltage_transforms;
        assert_eq!(carried[0].apply(1.0), 2.5);
        assert_eq!(carried[1].apply(0.25), -0.25);

        let short = simple().with_voltage_transforms(vec![VoltageTransform::Identity]);
        assert!(matches!(add(&mut manager, "q", short), Err(Error::Configuration(_))));
        let negative = simple().with_output_ranges(vec![1.0, -1.0], vec![0.0, 0.0]);
        assert!(add(&mut manager, "q", negative).is_err());
        let offsets = simple().with_output_ranges(vec![1.0, 1.0], vec![0.0]);
        assert!(add(&mut manager, "q", offsets).is_err());
    }

    #[test]
    fn test_masks() {
        assert_eq!(PROG_SEL_MASK & NO_RESET_MASK, 0);
        assert_eq!(PROG_SEL_MASK & PLAYBACK_FINISHED_MASK, 0);
        assert_eq!(INVERTED_PROG_SEL_MASK, NO_RESET_MASK | PLAYBACK_FINISHED_MASK);
        assert!(!RESERVED_REGISTERS.contains(&Register::from_zero_based_const(2)));
    }
}
