//! Environment assignments: `--env KEY=VALUE`, `--env-file`, and `ENV`.
//!
//! Env files hold one `KEY=VALUE` per line. `#` comment lines, blank
//! lines, an optional `export ` prefix, and single or double quotes around
//! the value are accepted.

use berth_common::error::{BerthError, Result};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till, take_till1, take_while1},
    character::complete::{char, space0, space1},
    combinator::{all_consuming, map, opt},
    multi::separated_list1,
    sequence::{delimited, preceded, terminated},
};

use crate::parser::lexer::string_literal;

const fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn key(input: &str) -> IResult<&str, &str> {
    let (rest, k) = take_while1(is_key_char)(input)?;
    if k.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::AlphaNumeric,
        )));
    }
    Ok((rest, k))
}

/// Returns `true` if `name` is a valid environment variable name.
#[must_use]
pub fn is_valid_key(name: &str) -> bool {
    all_consuming(key).parse(name).is_ok()
}

fn single_quoted(input: &str) -> IResult<&str, String> {
    map(
        delimited(char('\''), take_till(|c| c == '\''), char('\'')),
        str::to_string,
    )
    .parse(input)
}

fn bare_value(input: &str) -> IResult<&str, String> {
    map(take_till(char::is_whitespace), str::to_string).parse(input)
}

/// Parses one `KEY=VALUE` pair; the value may be quoted or empty.
pub fn assignment(input: &str) -> IResult<&str, (String, String)> {
    let (input, k) = key(input)?;
    let (input, _) = char('=')(input)?;
    let (input, v) = alt((string_literal, single_quoted, bare_value)).parse(input)?;
    Ok((input, (k.to_string(), v)))
}

/// Parses whitespace-separated `KEY=VALUE` pairs, as written after `ENV`.
///
/// # Errors
///
/// Returns a message if any pair is malformed.
pub fn assignments(input: &str) -> std::result::Result<Vec<(String, String)>, String> {
    all_consuming(delimited(space0, separated_list1(space1, assignment), space0))
        .parse(input)
        .map(|(_, pairs)| pairs)
        .map_err(|_| format!("expected KEY=VALUE pairs, got: {input}"))
}

/// Parses a single `--env` argument.
///
/// `KEY` alone is rejected; use `KEY=` for an empty value.
///
/// # Errors
///
/// Returns `BerthError::Config` if the argument is not `KEY=VALUE`.
pub fn parse_assignment(arg: &str) -> Result<(String, String)> {
    let parsed: IResult<&str, &str> = terminated(key, char('=')).parse(arg);
    match parsed {
        Ok((value, k)) => Ok((k.to_string(), value.to_string())),
        Err(_) => Err(BerthError::Config {
            message: format!("invalid environment assignment `{arg}` (expected KEY=VALUE)"),
        }),
    }
}

fn env_line(input: &str) -> IResult<&str, (String, String)> {
    let (input, _) = opt(preceded(tag("export"), space1)).parse(input)?;
    let (input, k) = key(input)?;
    let (input, _) = delimited(space0, char('='), space0).parse(input)?;
    let (input, v) = alt((
        terminated(string_literal, space0),
        terminated(single_quoted, space0),
        map(opt(take_till1(|c| c == '#')), |v: Option<&str>| {
            v.unwrap_or_default().trim_end().to_string()
        }),
    ))
    .parse(input)?;
    let (input, _) = opt(preceded(char('#'), take_till(|_| false))).parse(input)?;
    Ok((input, (k.to_string(), v)))
}

/// Parses the contents of an env file. `file` names the source in errors.
///
/// # Errors
///
/// Returns `BerthError::Recipe` citing the first malformed line.
pub fn parse_env_file(file: &str, text: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (_, pair) = all_consuming(env_line)
            .parse(line)
            .map_err(|_| BerthError::Recipe {
                file: file.to_string(),
                line: index + 1,
                message: format!("expected KEY=VALUE, got `{line}`"),
            })?;
        pairs.push(pair);
    }
    tracing::debug!(file, count = pairs.len(), "env file parsed");
    Ok(pairs)
}
