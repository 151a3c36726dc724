//! Line-level tokenization of `Berthfile` source text using `nom`.
//!
//! Splits the input into logical lines (joining `\` continuations and
//! dropping `#` comments), then tokenizes each line's arguments into
//! bare words, quoted strings, and JSON-style string arrays.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{take_till1, take_while1},
    character::complete::{char, multispace0, space0, space1},
    combinator::{all_consuming, map},
    multi::{separated_list0, separated_list1},
    sequence::delimited,
};

/// One logical line of a recipe: a directive keyword and its raw arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// One-based line number where the directive starts.
    pub number: usize,
    /// Directive keyword, uppercased.
    pub keyword: String,
    /// Everything after the keyword, trimmed.
    pub rest: String,
}

/// An argument token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// An unquoted run of non-whitespace characters.
    Word(String),
    /// A double-quoted string literal.
    StringLiteral(String),
}

impl Token {
    /// Returns the token text.
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Word(s) | Self::StringLiteral(s) => s,
        }
    }
}

/// Splits recipe text into logical lines.
///
/// Comment lines (first non-blank character `#`) and blank lines are
/// dropped. A line ending in `\` continues on the next one.
///
/// # Errors
///
/// Returns the one-based line number and a message when a line does not
/// start with a directive keyword.
pub fn split_lines(input: &str) -> Result<Vec<SourceLine>, (usize, String)> {
    let mut lines = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, raw) in input.lines().enumerate() {
        let trimmed = raw.trim();
        if pending.is_none() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }
        let (start, mut text) = pending.take().unwrap_or((index + 1, String::new()));
        if let Some(head) = trimmed.strip_suffix('\\') {
            text.push_str(head);
            text.push(' ');
            pending = Some((start, text));
            continue;
        }
        text.push_str(trimmed);
        lines.push(directive(start, &text)?);
    }

    if let Some((start, text)) = pending {
        lines.push(directive(start, &text)?);
    }
    Ok(lines)
}

fn directive(number: usize, text: &str) -> Result<SourceLine, (usize, String)> {
    let parsed: IResult<&str, &str> = take_while1(|c: char| c.is_ascii_alphabetic())(text);
    match parsed {
        Ok((rest, keyword)) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
            Ok(SourceLine {
                number,
                keyword: keyword.to_ascii_uppercase(),
                rest: rest.trim().to_string(),
            })
        }
        _ => Err((
            number,
            format!(
                "expected a directive at: \"{}\"",
                &text[..text.len().min(20)]
            ),
        )),
    }
}

/// Parses a double-quoted string literal with basic escape support.
pub fn string_literal(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let mut result = String::new();
    let mut chars = input.char_indices();
    loop {
        match chars.next() {
            Some((idx, '"')) => {
                let remaining = &input[idx + 1..];
                return Ok((remaining, result));
            }
            Some((_, '\\')) => match chars.next() {
                Some((_, 'n')) => result.push('\n'),
                Some((_, 't')) => result.push('\t'),
                Some((_, '\\')) => result.push('\\'),
                Some((_, '"')) => result.push('"'),
                Some((_, c)) => {
                    result.push('\\');
                    result.push(c);
                }
                None => {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::Char,
                    )));
                }
            },
            Some((_, c)) => result.push(c),
            None => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Char,
                )));
            }
        }
    }
}

fn bare_word(input: &str) -> IResult<&str, &str> {
    take_till1(char::is_whitespace)(input)
}

fn token(input: &str) -> IResult<&str, Token> {
    alt((
        map(string_literal, Token::StringLiteral),
        map(bare_word, |w: &str| Token::Word(w.to_string())),
    ))
    .parse(input)
}

/// Tokenizes whitespace-separated arguments.
///
/// # Errors
///
/// Returns a message if a quoted string is unterminated.
pub fn arguments(input: &str) -> Result<Vec<Token>, String> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    all_consuming(delimited(space0, separated_list1(space1, token), space0))
        .parse(input)
        .map(|(_, tokens)| tokens)
        .map_err(|_| format!("malformed arguments: {input}"))
}

/// Parses a JSON-style array of double-quoted strings: `["a", "b"]`.
///
/// # Errors
///
/// Returns a message if the input is not a well-formed string array.
pub fn string_array(input: &str) -> Result<Vec<String>, String> {
    all_consuming(delimited(
        (multispace0, char('['), multispace0),
        separated_list0((multispace0, char(','), multispace0), string_literal),
        (multispace0, char(']'), multispace0),
    ))
    .parse(input)
    .map(|(_, items)| items)
    .map_err(|_| format!("expected a string array like [\"program\", \"arg\"], got: {input}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_drops_comments_and_blank_lines() {
        let lines = split_lines("# header\n\nFROM scratch\n  workdir /app\n").expect("split");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].keyword, "FROM");
        assert_eq!(lines[0].number, 3);
        assert_eq!(lines[1].keyword, "WORKDIR");
        assert_eq!(lines[1].rest, "/app");
    }

    #[test]
    fn split_joins_continuations() {
        let lines = split_lines("CMD [\"python\", \\\n  \"bot.py\"]\nUSER bot").expect("split");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].number, 1);
        assert_eq!(lines[0].rest, "[\"python\",  \"bot.py\"]");
        assert_eq!(lines[1].number, 3);
    }

    #[test]
    fn split_rejects_lines_without_keyword() {
        let err = split_lines("FROM scratch\n/app\n").expect_err("should fail");
        assert_eq!(err.0, 2);
    }

    #[test]
    fn arguments_mix_words_and_strings() {
        let tokens = arguments(r#"src "my dir/"  ."#).expect("tokenize");
        assert_eq!(
            tokens,
            vec![
                Token::Word("src".into()),
                Token::StringLiteral("my dir/".into()),
                Token::Word(".".into()),
            ]
        );
    }

    #[test]
    fn string_with_escapes() {
        let (_, s) = string_literal(r#""line\nnew\ttab\\slash\"quote""#).expect("literal");
        assert_eq!(s, "line\nnew\ttab\\slash\"quote");
    }

    #[test]
    fn string_array_parses_exec_form() {
        assert_eq!(
            string_array(r#"["python", "main.py"]"#).expect("array"),
            vec!["python", "main.py"]
        );
        assert!(string_array("[]").expect("empty").is_empty());
        assert!(string_array("python main.py").is_err());
        assert!(string_array(r#"["unterminated]"#).is_err());
    }
}
