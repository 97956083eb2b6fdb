// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use anyhow::anyhow;

use crate::Result;
use crate::seqc_statements::{SeqCStatement, SeqCVariant};

const INDENTATION: &str = "  ";

fn format_comment(comment: Option<&String>) -> String {
    match comment {
        Some(comment) if !comment.is_empty() => format!("  // {comment}"),
        _ => String::new(),
    }
}

fn indent(s: &str, prefix: &str) -> String {
    s.lines()
        .flat_map(|line| [prefix, line, "\n"].into_iter())
        .collect()
}

/// Statement list that renders into sequencer source.
///
/// Output is a pure function of the statements: generating twice from equal
/// generators yields byte identical source.
#[derive(Clone, Debug, Default)]
pub struct SeqCGenerator {
    statements: Vec<SeqCStatement>,
    symbols: std::collections::HashSet<String>,
}

impl PartialEq for SeqCGenerator {
    fn eq(&self, other: &Self) -> bool {
        self.statements == other.statements && self.symbols == other.symbols
    }
}

impl SeqCGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn append_statements_from(&mut self, other: &SeqCGenerator) {
        self.statements.extend(other.statements.iter().cloned());
    }

    pub fn add_function_call_statement<S1: Into<String>, S2: Into<String>>(
        &mut self,
        name: S1,
        args: Vec<SeqCVariant>,
        assign_to: Option<S2>,
    ) {
        self.statements.push(SeqCStatement::FunctionCall {
            name: name.into(),
            args,
            assign_to: assign_to.map(|s| s.into()),
        });
    }

    pub fn add_constant_definition<S1: Into<String>, S2: Into<String>>(
        &mut self,
        name: S1,
        value: SeqCVariant,
        comment: Option<S2>,
    ) {
        self.statements.push(SeqCStatement::Constant {
            name: name.into(),
            value,
            comment: comment.map(|s| s.into()),
        });
    }

    pub fn add_repeat(&mut self, count: SeqCVariant, body: SeqCGenerator) {
        self.statements.push(SeqCStatement::Repeat { count, body });
    }

    pub fn add_while<S: Into<String>>(&mut self, condition: S, body: SeqCGenerator) {
        self.statements.push(SeqCStatement::While {
            condition: condition.into(),
            body,
        });
    }

    pub fn add_if<S: Into<String>>(&mut self, condition: S, body: SeqCGenerator) {
        self.statements.push(SeqCStatement::If {
            condition: condition.into(),
            body,
        });
    }

    pub fn add_switch<S: Into<String>>(
        &mut self,
        selector: S,
        cases: Vec<(i64, SeqCGenerator)>,
        default: Option<SeqCGenerator>,
    ) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        if let Some((duplicate, _)) = cases.iter().find(|(value, _)| !seen.insert(*value)) {
            return Err(anyhow!("Duplicate switch case {duplicate}").into());
        }
        self.statements.push(SeqCStatement::Switch {
            selector: selector.into(),
            cases,
            default,
        });
        Ok(())
    }

    pub fn add_function_def<S: Into<String>>(&mut self, name: S, body: SeqCGenerator) {
        self.statements.push(SeqCStatement::FunctionDef {
            name: name.into(),
            body,
        });
    }

    // warning: this function is designed to only work if the seqc generator maps to a single scope
    //          (it asserts that each variable may only be defined once)
    pub fn add_variable_declaration<S: Into<String>>(
        &mut self,
        variable_name: S,
        initial_value: Option<SeqCVariant>,
    ) -> Result<()> {
        let variable_name: String = variable_name.into();
        if self.symbols.contains(&variable_name) {
            return Err(anyhow!(
                "Trying to declare variable {variable_name} which has already been declared in this scope"
            )
            .into());
        }
        self.symbols.insert(variable_name.clone());
        self.statements.push(SeqCStatement::VariableDeclaration {
            variable_name,
            initial_value,
        });
        Ok(())
    }

    pub fn add_variable_assignment<S: Into<String>>(
        &mut self,
        variable_name: S,
        value: SeqCVariant,
    ) {
        self.statements.push(SeqCStatement::VariableAssignment {
            variable_name: variable_name.into(),
            value,
        });
    }

    pub fn add_play_wave_statement<S: Into<String>>(&mut self, wave_id: S) {
        self.statements.push(SeqCStatement::PlayWave {
            wave_id: wave_id.into(),
        });
    }

    pub fn generate_seq_c(&self) -> String {
        self.statements
            .iter()
            .map(|statement| self.emit_statement(statement))
            .collect::<String>()
    }

    fn emit_block(body: &SeqCGenerator) -> String {
        indent(&body.generate_seq_c(), INDENTATION)
    }

    fn emit_statement(&self, statement: &SeqCStatement) -> String {
        match statement {
            SeqCStatement::FunctionCall {
                name,
                args,
                assign_to,
            } => {
                let assign_to = assign_to
                    .as_ref()
                    .map(|s| format!("{s} = "))
                    .unwrap_or_default();
                let args = args
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<String>>()
                    .join(",");

                format!("{assign_to}{name}({args});\n")
            }
            SeqCStatement::Constant {
                name,
                value,
                comment,
            } => format!("const {name} = {value};{}\n", format_comment(comment.as_ref())),
            SeqCStatement::Repeat { count, body } => {
                format!("repeat ({count}) {{\n{}}}\n", Self::emit_block(body))
            }
            SeqCStatement::While { condition, body } => {
                format!("while ({condition}) {{\n{}}}\n", Self::emit_block(body))
            }
            SeqCStatement::If { condition, body } => {
                format!("if ({condition}) {{\n{}}}\n", Self::emit_block(body))
            }
            SeqCStatement::Switch {
                selector,
                cases,
                default,
            } => {
                let mut text = format!("switch ({selector}) {{\n");
                for (value, body) in cases {
                    text += &indent(
                        &format!("case {value}:\n{}", Self::emit_block(body)),
                        INDENTATION,
                    );
                }
                if let Some(default) = default {
                    text += &indent(
                        &format!("default:\n{}", Self::emit_block(default)),
                        INDENTATION,
                    );
                }
                text + "}\n"
            }
            SeqCStatement::FunctionDef { name, body } => {
                format!("void {name}() {{\n{}}}\n", Self::emit_block(body))
            }
            SeqCStatement::VariableDeclaration {
                variable_name,
                initial_value,
            } => {
                let initial_value = initial_value
                    .as_ref()
                    .map(|s| format!(" = {s}"))
                    .unwrap_or_default();
                format!("var {variable_name}{initial_value};\n")
            }
            SeqCStatement::VariableAssignment {
                variable_name,
                value,
            } => format!("{variable_name} = {value};\n"),
            SeqCStatement::PlayWave { wave_id } => format!("playWave(\"{wave_id}\");\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_nested_blocks() {
        let mut body = SeqCGenerator::new();
        body.add_play_wave_statement("wave_a");
        let mut function = SeqCGenerator::new();
        function.add_repeat(SeqCVariant::Integer(3), body);
        let mut generator = SeqCGenerator::new();
        generator.add_constant_definition("N", SeqCVariant::Integer(1), Some("one"));
        generator.add_function_def("f", function);

        let expected = "\
const N = 1;  // one
void f() {
  repeat (3) {
    playWave(\"wave_a\");
  }
}
";
        assert_eq!(generator.generate_seq_c(), expected);
    }

    #[test]
    fn test_emit_switch() {
        let mut case = SeqCGenerator::new();
        case.add_function_call_statement("p_function", vec![], None::<String>);
        let mut default = SeqCGenerator::new();
        default.add_function_call_statement(
            "wait",
            vec![SeqCVariant::Integer(300)],
            None::<String>,
        );
        let mut generator = SeqCGenerator::new();
        generator
            .add_switch("prog_sel", vec![(1, case)], Some(default))
            .unwrap();
        let expected = "\
switch (prog_sel) {
  case 1:
    p_function();
  default:
    wait(300);
}
";
        assert_eq!(generator.generate_seq_c(), expected);
    }

    #[test]
    fn test_duplicate_switch_case() {
        let mut generator = SeqCGenerator::new();
        let cases = vec![(1, SeqCGenerator::new()), (1, SeqCGenerator::new())];
        assert!(generator.add_switch("x", cases, None).is_err());
    }

    #[test]
    fn test_variable_declared_once() {
        let mut generator = SeqCGenerator::new();
        generator
            .add_variable_declaration("prog_sel", Some(SeqCVariant::Integer(0)))
            .unwrap();
        assert!(generator.add_variable_declaration("prog_sel", None).is_err());
        generator.add_variable_assignment("prog_sel", SeqCVariant::String("x & 3".into()));
        assert_eq!(
            generator.generate_seq_c(),
            "var prog_sel = 0;\nprog_sel = x & 3;\n"
        );
    }
}
