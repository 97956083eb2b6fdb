// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Sequencer user registers.
//!
//! User manuals and the web interface count registers from one, the device
//! node tree and the sequencer code count from zero. [`Register`] stores the
//! zero based index and converts explicitly at every boundary.

use std::fmt;

use anyhow::anyhow;

use crate::Result;

/// Number of user registers of one sequencer core.
pub const REGISTER_COUNT: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(u8);

impl Register {
    pub const fn from_zero_based_const(index: u8) -> Self {
        assert!(index < REGISTER_COUNT);
        Register(index)
    }

    pub fn from_zero_based(index: u8) -> Result<Self> {
        if index >= REGISTER_COUNT {
            return Err(anyhow!(
                "User register index {index} (zero based) out of range 0..{REGISTER_COUNT}"
            )
            .into());
        }
        Ok(Register(index))
    }

    pub fn from_one_based(index: u8) -> Result<Self> {
        if index == 0 || index > REGISTER_COUNT {
            return Err(anyhow!(
                "User register {index} out of range 1..={REGISTER_COUNT}"
            )
            .into());
        }
        Ok(Register(index - 1))
    }

    /// Index used in sequencer code and device node paths.
    pub fn zero_based(self) -> u8 {
        self.0
    }

    /// Index as shown in the user interface.
    pub fn one_based(self) -> u8 {
        self.0 + 1
    }

    pub fn all() -> impl Iterator<Item = Register> {
        (0..REGISTER_COUNT).map(Register)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user register {}", self.one_based())
    }
}

/// Hands out the registers that are not reserved, lowest first.
#[derive(Debug, Clone)]
pub struct RegisterAllocator {
    available: Vec<Register>,
    next: usize,
}

impl RegisterAllocator {
    pub fn new(reserved: &[Register]) -> Self {
        Self {
            available: Register::all().filter(|r| !reserved.contains(r)).collect(),
            next: 0,
        }
    }

    pub fn allocate(&mut self) -> Result<Register> {
        let register = self.available.get(self.next).copied().ok_or_else(|| {
            anyhow!(
                "No free user register left ({} available)",
                self.available.len()
            )
        })?;
        self.next += 1;
        Ok(register)
    }

    pub fn remaining(&self) -> usize {
        self.available.len() - self.next
    }
}
