// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Lowering of a timing tree into a sequencer source fragment.

use anyhow::anyhow;
use indexmap::{IndexMap, IndexSet};

use crate::Result;
use crate::register::{Register, RegisterAllocator};
use crate::seqc_generator::SeqCGenerator;
use crate::seqc_statements::SeqCVariant;
use crate::timing::{Loop, RepetitionCount};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolatileRepetition {
    pub register: Register,
    pub value: u32,
}

#[derive(Debug, Clone)]
pub struct LoweredProgram {
    pub body: SeqCGenerator,
    /// Volatile parameters in order of first appearance.
    pub volatile: IndexMap<String, VolatileRepetition>,
    pub wave_ids: IndexSet<String>,
}

struct LoweringContext<'a> {
    registers: &'a mut RegisterAllocator,
    volatile: IndexMap<String, VolatileRepetition>,
    wave_ids: IndexSet<String>,
}

impl LoweringContext<'_> {
    fn volatile_register(&mut self, parameter: &str, value: u32) -> Result<Register> {
        if let Some(existing) = self.volatile.get(parameter) {
            if existing.value != value {
                return Err(anyhow!(
                    "Volatile parameter '{parameter}' is used with conflicting values {} and {value}",
                    existing.value
                )
                .into());
            }
            return Ok(existing.register);
        }
        let register = self.registers.allocate().map_err(|e| {
            anyhow!("Cannot assign a register to volatile parameter '{parameter}': {e}")
        })?;
        self.volatile
            .insert(parameter.to_string(), VolatileRepetition { register, value });
        Ok(register)
    }
}

fn lower_loop(node: &Loop, generator: &mut SeqCGenerator, ctx: &mut LoweringContext) -> Result<()> {
    let mut body = SeqCGenerator::new();
    if node.is_leaf() {
        if let Some(waveform) = &node.waveform {
            let wave_id = waveform.wave_id()?;
            body.add_play_wave_statement(wave_id.as_str());
            ctx.wave_ids.insert(wave_id);
        }
    } else {
        for child in &node.children {
            lower_loop(child, &mut body, ctx)?;
        }
    }
    if body.is_empty() {
        return Ok(());
    }
    match &node.repetition {
        RepetitionCount::Fixed(0) => {}
        RepetitionCount::Fixed(1) => generator.append_statements_from(&body),
        RepetitionCount::Fixed(count) => {
            let count = i64::try_from(*count)
                .map_err(|_| anyhow!("Repetition count {count} exceeds the sequencer range"))?;
            generator.add_repeat(SeqCVariant::Integer(count), body);
        }
        RepetitionCount::Volatile { parameter, value } => {
            let register = ctx.volatile_register(parameter, *value)?;
            generator.add_repeat(
                SeqCVariant::String(format!("getUserReg({})", register.zero_based())),
                body,
            );
        }
    }
    Ok(())
}

/// Lower `program` into the statements of one program function.
///
/// Registers for volatile repetition counts are drawn from `registers`.
pub fn lower_program(program: &Loop, registers: &mut RegisterAllocator) -> Result<LoweredProgram> {
    let mut ctx = LoweringContext {
        registers,
        volatile: IndexMap::new(),
        wave_ids: IndexSet::new(),
    };
    let mut body = SeqCGenerator::new();
    lower_loop(program, &mut body, &mut ctx)?;
    log::trace!(
        "Lowered program with {} waveforms and {} volatile parameters",
        ctx.wave_ids.len(),
        ctx.volatile.len()
    );
    Ok(LoweredProgram {
        body,
        volatile: ctx.volatile,
        wave_ids: ctx.wave_ids,
    })
}
