// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use crate::seqc_generator::SeqCGenerator;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqCVariant {
    /// Verbatim expression, e.g. a constant name or a function call.
    String(String),
    Integer(i64),
}

impl fmt::Display for SeqCVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeqCVariant::String(s) => write!(f, "{s}"),
            SeqCVariant::Integer(i) => write!(f, "{i}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SeqCStatement {
    FunctionCall {
        name: String,
        args: Vec<SeqCVariant>,
        assign_to: Option<String>,
    },
    Constant {
        name: String,
        value: SeqCVariant,
        comment: Option<String>,
    },
    Repeat {
        count: SeqCVariant,
        body: SeqCGenerator,
    },
    While {
        condition: String,
        body: SeqCGenerator,
    },
    If {
        condition: String,
        body: SeqCGenerator,
    },
    Switch {
        selector: String,
        cases: Vec<(i64, SeqCGenerator)>,
        default: Option<SeqCGenerator>,
    },
    FunctionDef {
        name: String,
        body: SeqCGenerator,
    },
    VariableDeclaration {
        variable_name: String,
        initial_value: Option<SeqCVariant>,
    },
    VariableAssignment {
        variable_name: String,
        value: SeqCVariant,
    },
    PlayWave {
        wave_id: String,
    },
}
