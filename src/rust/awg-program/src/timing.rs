// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Timing tree of a playback program and its hardware compatibility pass.
//!
//! A [`Loop`] either plays a [`Waveform`] (leaf) or its children in order,
//! repeated [`RepetitionCount`] times. The sequencer can only play waveforms
//! that are at least a minimum number of samples long and whose length is a
//! multiple of a fixed quantum. [`make_compatible`] rewrites trees that
//! violate these constraints by merging offending subtrees into a single
//! waveform. It never drops or truncates samples.

use std::collections::BTreeSet;
use std::fmt::Write;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::samples::duration_to_samples;
use crate::{Result, Samples};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Waveform {
    /// An externally defined waveform segment.
    Segment {
        label: String,
        /// Duration in seconds.
        duration: f64,
        /// Program channel identifiers this segment defines.
        #[serde(default)]
        channels: BTreeSet<String>,
    },
    Sequence(Vec<Waveform>),
    Repeated { body: Box<Waveform>, count: u64 },
}

impl Waveform {
    pub fn segment<S: Into<String>>(label: S, duration: f64) -> Self {
        Waveform::Segment {
            label: label.into(),
            duration,
            channels: BTreeSet::new(),
        }
    }

    pub fn segment_on<S: Into<String>, C: Into<String>>(
        label: S,
        duration: f64,
        channels: impl IntoIterator<Item = C>,
    ) -> Self {
        Waveform::Segment {
            label: label.into(),
            duration,
            channels: channels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn duration(&self) -> f64 {
        match self {
            Waveform::Segment { duration, .. } => *duration,
            Waveform::Sequence(parts) => parts.iter().map(Waveform::duration).sum(),
            Waveform::Repeated { body, count } => body.duration() * *count as f64,
        }
    }

    fn collect_channels(&self, channels: &mut BTreeSet<String>) {
        match self {
            Waveform::Segment { channels: own, .. } => channels.extend(own.iter().cloned()),
            Waveform::Sequence(parts) => parts.iter().for_each(|p| p.collect_channels(channels)),
            Waveform::Repeated { body, .. } => body.collect_channels(channels),
        }
    }

    /// Identifier of the waveform as used in the sequencer source.
    ///
    /// Identical waveforms share an identifier, so they are stored only once.
    pub fn wave_id(&self) -> Result<String> {
        let serialized = serde_json::to_string(self)
            .map_err(|e| anyhow!("Waveform serialization failed: {e}"))?;
        let mut hasher = Sha1::new();
        hasher.update(serialized.as_bytes());
        let hash = hasher.finalize();
        let mut id = String::from("wave_");
        for byte in &hash[..8] {
            write!(id, "{byte:02x}").map_err(|e| anyhow!(e))?;
        }
        Ok(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepetitionCount {
    Fixed(u64),
    /// Repetition count that can be changed on the device without recompiling.
    Volatile { parameter: String, value: u32 },
}

impl Default for RepetitionCount {
    fn default() -> Self {
        RepetitionCount::Fixed(1)
    }
}

impl RepetitionCount {
    pub fn value(&self) -> u64 {
        match self {
            RepetitionCount::Fixed(n) => *n,
            RepetitionCount::Volatile { value, .. } => (*value).into(),
        }
    }

    pub fn is_volatile(&self) -> bool {
        matches!(self, RepetitionCount::Volatile { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Loop {
    #[serde(default)]
    pub waveform: Option<Waveform>,
    #[serde(default)]
    pub repetition: RepetitionCount,
    #[serde(default)]
    pub children: Vec<Loop>,
}

impl Loop {
    pub fn leaf(waveform: Waveform, repetition: RepetitionCount) -> Self {
        Loop {
            waveform: Some(waveform),
            repetition,
            children: vec![],
        }
    }

    pub fn sequence(children: Vec<Loop>, repetition: RepetitionCount) -> Self {
        Loop {
            waveform: None,
            repetition,
            children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Whether the loop plays nothing at all.
    pub fn is_empty(&self) -> bool {
        if self.is_leaf() {
            self.waveform.is_none()
        } else {
            self.children.iter().all(Loop::is_empty)
        }
    }

    /// Duration of a single iteration in seconds.
    pub fn body_duration(&self) -> f64 {
        if self.is_leaf() {
            self.waveform.as_ref().map_or(0.0, Waveform::duration)
        } else {
            self.children.iter().map(Loop::duration).sum()
        }
    }

    pub fn duration(&self) -> f64 {
        self.body_duration() * self.repetition.value() as f64
    }

    /// Program channel identifiers defined anywhere in the tree.
    pub fn defined_channels(&self) -> BTreeSet<String> {
        let mut channels = BTreeSet::new();
        self.collect_channels(&mut channels);
        channels
    }

    fn collect_channels(&self, channels: &mut BTreeSet<String>) {
        if let Some(waveform) = &self.waveform {
            waveform.collect_channels(channels);
        }
        self.children
            .iter()
            .for_each(|child| child.collect_channels(channels));
    }

    /// Waveform playing a single iteration of this loop.
    fn body_to_waveform(&self) -> Result<Waveform> {
        if self.is_leaf() {
            return self
                .waveform
                .clone()
                .ok_or_else(|| anyhow!("Cannot create a waveform from an empty loop").into());
        }
        let parts = self
            .children
            .iter()
            .filter(|child| !child.is_empty())
            .map(Loop::to_waveform)
            .collect::<Result<Vec<_>>>()?;
        Ok(Waveform::Sequence(parts))
    }

    /// Waveform playing the whole loop, repetitions included.
    fn to_waveform(&self) -> Result<Waveform> {
        let body = self.body_to_waveform()?;
        match &self.repetition {
            RepetitionCount::Volatile { parameter, .. } => Err(anyhow!(
                "Volatile repetition '{parameter}' cannot be merged into a waveform \
                to satisfy the hardware length constraints"
            )
            .into()),
            RepetitionCount::Fixed(1) => Ok(body),
            RepetitionCount::Fixed(count) => Ok(Waveform::Repeated {
                body: Box::new(body),
                count: *count,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Compatible,
    ActionRequired,
    IncompatibleFraction,
    IncompatibleTooShort,
    IncompatibleQuantum,
}

impl Compatibility {
    fn is_incompatible(self) -> bool {
        matches!(
            self,
            Compatibility::IncompatibleFraction
                | Compatibility::IncompatibleTooShort
                | Compatibility::IncompatibleQuantum
        )
    }
}

fn fits(samples: Option<Samples>, min_len: Samples, quantum: Samples) -> bool {
    samples.is_some_and(|s| s >= min_len && s.is_multiple_of(quantum))
}

pub fn compatibility(
    program: &Loop,
    min_len: Samples,
    quantum: Samples,
    sampling_rate: f64,
) -> Compatibility {
    let Some(total) = duration_to_samples(program.duration(), sampling_rate) else {
        return Compatibility::IncompatibleFraction;
    };
    if total < min_len {
        return Compatibility::IncompatibleTooShort;
    }
    if !total.is_multiple_of(quantum) {
        return Compatibility::IncompatibleQuantum;
    }
    if program.is_leaf() {
        let body = duration_to_samples(program.body_duration(), sampling_rate);
        if fits(body, min_len, quantum) {
            Compatibility::Compatible
        } else {
            Compatibility::ActionRequired
        }
    } else if program
        .children
        .iter()
        .all(|c| compatibility(c, min_len, quantum, sampling_rate) == Compatibility::Compatible)
    {
        Compatibility::Compatible
    } else {
        Compatibility::ActionRequired
    }
}

fn make_compatible_inner(
    program: &mut Loop,
    min_len: Samples,
    quantum: Samples,
    sampling_rate: f64,
) -> Result<()> {
    if program.is_leaf() {
        // The whole loop fits, a single iteration does not: unroll the repetitions.
        program.waveform = Some(program.to_waveform()?);
        program.repetition = RepetitionCount::Fixed(1);
        return Ok(());
    }
    let levels = program
        .children
        .iter()
        .map(|c| compatibility(c, min_len, quantum, sampling_rate))
        .collect::<Vec<_>>();
    if levels.iter().any(|l| l.is_incompatible()) {
        let single_run = duration_to_samples(program.body_duration(), sampling_rate);
        if fits(single_run, min_len, quantum) {
            program.waveform = Some(program.body_to_waveform()?);
        } else {
            program.waveform = Some(program.to_waveform()?);
            program.repetition = RepetitionCount::Fixed(1);
        }
        program.children.clear();
        return Ok(());
    }
    for (child, level) in program.children.iter_mut().zip(levels) {
        if level == Compatibility::ActionRequired {
            make_compatible_inner(child, min_len, quantum, sampling_rate)?;
        }
    }
    Ok(())
}

/// Rewrite `program` in place so that every played waveform is at least
/// `min_len` samples long and a multiple of `quantum` samples.
///
/// Fails if the program as a whole cannot satisfy the constraints.
pub fn make_compatible(
    program: &mut Loop,
    min_len: Samples,
    quantum: Samples,
    sampling_rate: f64,
) -> Result<()> {
    match compatibility(program, min_len, quantum, sampling_rate) {
        Compatibility::Compatible => Ok(()),
        Compatibility::IncompatibleFraction => Err(anyhow!(
            "The program duration in samples {} is not an integer",
            program.duration() * sampling_rate
        )
        .into()),
        Compatibility::IncompatibleTooShort => Err(anyhow!(
            "The program is too short to be a valid waveform: {} samples, minimum is {min_len}",
            program.duration() * sampling_rate
        )
        .into()),
        Compatibility::IncompatibleQuantum => Err(anyhow!(
            "The program duration in samples {} is not a multiple of quantum {quantum}",
            program.duration() * sampling_rate
        )
        .into()),
        Compatibility::ActionRequired => {
            awg_log::warn!(
                "Program waveforms violate the minimum length {} or quantum {} and are merged",
                min_len,
                quantum
            );
            make_compatible_inner(program, min_len, quantum, sampling_rate)
        }
    }
}
