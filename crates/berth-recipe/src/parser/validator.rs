//! Static validation of the parsed recipe.
//!
//! Enforces the mandatory build order before any step executes, so a
//! misordered recipe fails without touching the store.

use std::collections::HashSet;

use berth_common::error::{BerthError, Result};

use super::ast::{InstructionKind, Recipe};

/// Position of each directive in the mandatory build order. `ENV` has none.
const fn stage(kind: &InstructionKind) -> Option<u8> {
    match kind {
        InstructionKind::From(_) => Some(0),
        InstructionKind::Workdir(_) => Some(1),
        InstructionKind::Manifest(_) => Some(2),
        InstructionKind::Install => Some(3),
        InstructionKind::Copy { .. } => Some(4),
        InstructionKind::Account(_) => Some(5),
        InstructionKind::User(_) => Some(6),
        InstructionKind::Cmd(_) => Some(7),
        InstructionKind::Env(_) => None,
    }
}

const REQUIRED: [&str; 7] = ["WORKDIR", "MANIFEST", "INSTALL", "COPY", "ACCOUNT", "USER", "CMD"];

/// Validates a parsed recipe for ordering and completeness.
///
/// # Checks performed
///
/// 1. Directives appear in the order `FROM`, `WORKDIR`, `MANIFEST`,
///    `INSTALL`, `COPY`, `ACCOUNT`, `USER`, `CMD`.
/// 2. Only `COPY` may repeat; `FROM` is optional.
/// 3. `ENV` appears after `WORKDIR`.
/// 4. `USER` names the account created by `ACCOUNT`.
///
/// # Errors
///
/// Returns `BerthError::Recipe` citing the offending line.
pub fn validate(file: &str, recipe: &Recipe) -> Result<()> {
    tracing::debug!(file, "validating recipe");
    check_order(file, recipe)?;
    check_required(file, recipe)?;
    check_user_matches_account(file, recipe)
}

fn err(file: &str, line: usize, message: String) -> BerthError {
    BerthError::Recipe {
        file: file.to_string(),
        line,
        message,
    }
}

fn check_order(file: &str, recipe: &Recipe) -> Result<()> {
    let mut current: Option<u8> = None;
    let mut seen = HashSet::new();
    for instr in &recipe.instructions {
        let keyword = instr.kind.keyword();
        let Some(position) = stage(&instr.kind) else {
            if current.is_none_or(|c| c < 1) {
                return Err(err(file, instr.line, "ENV must follow WORKDIR".into()));
            }
            continue;
        };
        if !seen.insert(keyword) && !matches!(instr.kind, InstructionKind::Copy { .. }) {
            return Err(err(file, instr.line, format!("{keyword} may appear only once")));
        }
        if current.is_some_and(|c| position < c) {
            return Err(err(
                file,
                instr.line,
                format!("{keyword} is out of order (expected FROM, WORKDIR, MANIFEST, INSTALL, COPY, ACCOUNT, USER, CMD)"),
            ));
        }
        current = Some(position);
    }
    Ok(())
}

fn check_required(file: &str, recipe: &Recipe) -> Result<()> {
    let present: HashSet<&str> = recipe.instructions.iter().map(|i| i.kind.keyword()).collect();
    let last_line = recipe.instructions.last().map_or(1, |i| i.line);
    match REQUIRED.iter().find(|k| !present.contains(*k)) {
        Some(missing) => Err(err(file, last_line, format!("missing {missing} directive"))),
        None => Ok(()),
    }
}

fn check_user_matches_account(file: &str, recipe: &Recipe) -> Result<()> {
    let account = recipe.instructions.iter().find_map(|i| match &i.kind {
        InstructionKind::Account(name) => Some(name.as_str()),
        _ => None,
    });
    for instr in &recipe.instructions {
        if let InstructionKind::User(name) = &instr.kind {
            if account != Some(name.as_str()) {
                return Err(err(
                    file,
                    instr.line,
                    format!("USER {name} does not name the account created by ACCOUNT"),
                ));
            }
        }
    }
    Ok(())
}
