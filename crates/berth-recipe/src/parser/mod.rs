//! `Berthfile` parser built on `nom`.
//!
//! Transforms raw recipe text into a validated AST through
//! lexing, parsing, and ordering checks.

pub mod ast;
pub mod lexer;
pub mod validator;

use std::path::PathBuf;

use berth_common::error::{BerthError, Result};
use berth_common::types::EntryCommand;

use self::ast::{Instruction, InstructionKind, Recipe};
use self::lexer::{SourceLine, Token};

/// Parses a recipe from its source text. `file` names the source in errors.
///
/// # Errors
///
/// Returns `BerthError::Recipe` if the input contains syntax errors or the
/// directives are out of order.
pub fn parse_recipe(file: &str, input: &str) -> Result<Recipe> {
    tracing::info!(file, "parsing recipe");
    let lines = lexer::split_lines(input).map_err(|(line, message)| recipe_err(file, line, message))?;
    let mut recipe = Recipe::default();
    for line in &lines {
        let kind = parse_instruction(line).map_err(|message| recipe_err(file, line.number, message))?;
        recipe.instructions.push(Instruction {
            line: line.number,
            kind,
        });
    }
    validator::validate(file, &recipe)?;
    Ok(recipe)
}

fn recipe_err(file: &str, line: usize, message: String) -> BerthError {
    BerthError::Recipe {
        file: file.to_string(),
        line,
        message,
    }
}

fn parse_instruction(line: &SourceLine) -> std::result::Result<InstructionKind, String> {
    match line.keyword.as_str() {
        "FROM" => single_argument(line).map(InstructionKind::From),
        "WORKDIR" => single_argument(line).map(|p| InstructionKind::Workdir(PathBuf::from(p))),
        "MANIFEST" => single_argument(line).map(|p| InstructionKind::Manifest(PathBuf::from(p))),
        "INSTALL" => {
            if line.rest.is_empty() {
                Ok(InstructionKind::Install)
            } else {
                Err(format!("INSTALL takes no arguments, got: {}", line.rest))
            }
        }
        "COPY" => {
            let mut args = argument_texts(line)?;
            if args.len() != 2 {
                return Err(format!("COPY expects <src> <dest>, got {} argument(s)", args.len()));
            }
            let dest = args.pop().unwrap_or_default();
            let src = args.pop().unwrap_or_default();
            Ok(InstructionKind::Copy {
                src: PathBuf::from(src),
                dest: PathBuf::from(dest),
            })
        }
        "ACCOUNT" => single_argument(line).map(InstructionKind::Account),
        "USER" => single_argument(line).map(InstructionKind::User),
        "ENV" => parse_env(&line.rest).map(InstructionKind::Env),
        "CMD" => parse_cmd(&line.rest).map(InstructionKind::Cmd),
        other => Err(format!("unknown directive: {other}")),
    }
}

fn argument_texts(line: &SourceLine) -> std::result::Result<Vec<String>, String> {
    Ok(lexer::arguments(&line.rest)?
        .into_iter()
        .map(Token::into_text)
        .collect())
}

fn single_argument(line: &SourceLine) -> std::result::Result<String, String> {
    let mut args = argument_texts(line)?;
    match args.len() {
        1 => Ok(args.remove(0)),
        n => Err(format!("{} expects exactly one argument, got {n}", line.keyword)),
    }
}

fn parse_env(rest: &str) -> std::result::Result<Vec<(String, String)>, String> {
    let first = rest.split_whitespace().next().unwrap_or_default();
    if !first.is_empty() && !first.contains('=') {
        // `ENV KEY value with spaces`
        if !crate::envfile::is_valid_key(first) {
            return Err(format!("invalid environment variable name: {first}"));
        }
        let value = rest[first.len()..].trim();
        return Ok(vec![(first.to_string(), value.to_string())]);
    }
    crate::envfile::assignments(rest)
}

fn parse_cmd(rest: &str) -> std::result::Result<EntryCommand, String> {
    if !rest.starts_with('[') {
        return Err("CMD must use the exec form [\"program\", \"arg\", ...]".into());
    }
    let argv = lexer::string_array(rest)?;
    EntryCommand::new(argv).map_err(|e| e.to_string())
}
