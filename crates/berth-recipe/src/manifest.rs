//! Dependency manifests: one requirement specifier per line.
//!
//! ```text
//! # runtime dependencies
//! libfoo>=1.0
//! python-telegram-bot==20.7
//! requests>=2.28,<3
//! ```
//!
//! Versions are dotted numeric sequences compared component-wise, with
//! missing components treated as zero (`1.0 == 1`).

use std::cmp::Ordering;
use std::fmt;

use berth_common::error::{BerthError, Result};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1, space0},
    combinator::{all_consuming, map_res, opt, value},
    multi::{separated_list0, separated_list1},
    sequence::delimited,
};

/// A dotted numeric version such as `1`, `1.0`, or `2.10.3`.
#[derive(Debug, Clone)]
pub struct Version(Vec<u64>);

impl Version {
    /// Creates a version from its numeric components.
    #[must_use]
    pub fn new(parts: impl Into<Vec<u64>>) -> Self {
        Self(parts.into())
    }

    /// Parses a version string.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::Config` if the text is not a dotted numeric version.
    pub fn parse(text: &str) -> Result<Self> {
        all_consuming(version_parts)
            .parse(text.trim())
            .map(|(_, parts)| Self(parts))
            .map_err(|_| BerthError::Config {
                message: format!("invalid version: {text}"),
            })
    }

    /// Returns the numeric components.
    #[must_use]
    pub fn parts(&self) -> &[u64] {
        &self.0
    }

    fn component(&self, index: usize) -> u64 {
        self.0.get(index).copied().unwrap_or(0)
    }

    /// Returns `true` if the leading components equal `prefix`.
    fn starts_with(&self, prefix: &[u64]) -> bool {
        prefix
            .iter()
            .enumerate()
            .all(|(i, part)| self.component(i) == *part)
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// Comparison operator of a version constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `~=` (compatible release).
    Compatible,
}

impl ConstraintOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Compatible => "~=",
        }
    }
}

/// A single version constraint such as `>=1.0` or `==2.*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    /// Comparison operator.
    pub op: ConstraintOp,
    /// Version operand.
    pub version: Version,
    /// Trailing `.*` on `==` / `!=`: compare as a prefix.
    pub wildcard: bool,
}

impl Constraint {
    /// Returns `true` if `candidate` satisfies this constraint.
    #[must_use]
    pub fn matches(&self, candidate: &Version) -> bool {
        match self.op {
            ConstraintOp::Eq if self.wildcard => candidate.starts_with(self.version.parts()),
            ConstraintOp::Ne if self.wildcard => !candidate.starts_with(self.version.parts()),
            ConstraintOp::Eq => candidate == &self.version,
            ConstraintOp::Ne => candidate != &self.version,
            ConstraintOp::Ge => candidate >= &self.version,
            ConstraintOp::Le => candidate <= &self.version,
            ConstraintOp::Gt => candidate > &self.version,
            ConstraintOp::Lt => candidate < &self.version,
            ConstraintOp::Compatible => {
                let parts = self.version.parts();
                let prefix = &parts[..parts.len().saturating_sub(1)];
                candidate >= &self.version && candidate.starts_with(prefix)
            }
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.symbol(), self.version)?;
        if self.wildcard {
            write!(f, ".*")?;
        }
        Ok(())
    }
}

/// One manifest entry: a package name plus its version constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Package name as written.
    pub name: String,
    /// Constraints that must all hold; empty means any version.
    pub constraints: Vec<Constraint>,
}

impl Requirement {
    /// Returns the name lowercased with `_` and `.` folded to `-`.
    #[must_use]
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Returns `true` if `candidate` satisfies every constraint.
    #[must_use]
    pub fn matches(&self, candidate: &Version) -> bool {
        self.constraints.iter().all(|c| c.matches(candidate))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (i, constraint) in self.constraints.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{constraint}")?;
        }
        Ok(())
    }
}

/// Folds a package name into its canonical lookup form.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '_' | '.' => '-',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// A parsed dependency manifest. Immutable once parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    requirements: Vec<Requirement>,
}

impl Manifest {
    /// Parses manifest text. `file` names the source in error messages.
    ///
    /// Blank lines and `#` comments are ignored.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::Recipe` citing the first unparsable line.
    pub fn parse(file: &str, text: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let requirement = parse_requirement(line).map_err(|message| BerthError::Recipe {
                file: file.to_string(),
                line: index + 1,
                message,
            })?;
            requirements.push(requirement);
        }
        tracing::debug!(file, count = requirements.len(), "manifest parsed");
        Ok(Self { requirements })
    }

    /// Returns the requirements in declaration order.
    #[must_use]
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Returns the number of requirements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.requirements.len()
    }

    /// Returns `true` if the manifest declares no dependencies.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

const fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn package_name(input: &str) -> IResult<&str, &str> {
    take_while1(is_name_char)(input)
}

fn operator(input: &str) -> IResult<&str, ConstraintOp> {
    alt((
        value(ConstraintOp::Compatible, tag("~=")),
        value(ConstraintOp::Eq, tag("==")),
        value(ConstraintOp::Ne, tag("!=")),
        value(ConstraintOp::Ge, tag(">=")),
        value(ConstraintOp::Le, tag("<=")),
        value(ConstraintOp::Gt, tag(">")),
        value(ConstraintOp::Lt, tag("<")),
    ))
    .parse(input)
}

fn version_parts(input: &str) -> IResult<&str, Vec<u64>> {
    separated_list1(char('.'), map_res(digit1, str::parse::<u64>)).parse(input)
}

fn constraint(input: &str) -> IResult<&str, Constraint> {
    let (input, op) = operator(input)?;
    let (input, _) = space0(input)?;
    let (input, parts) = version_parts(input)?;
    let (input, wildcard) = opt(tag(".*")).parse(input)?;
    Ok((
        input,
        Constraint {
            op,
            version: Version(parts),
            wildcard: wildcard.is_some(),
        },
    ))
}

fn requirement(input: &str) -> IResult<&str, (&str, Vec<Constraint>)> {
    let (input, name) = package_name(input)?;
    let (input, _) = space0(input)?;
    let (input, constraints) =
        separated_list0(delimited(space0, char(','), space0), constraint).parse(input)?;
    let (input, _) = space0(input)?;
    Ok((input, (name, constraints)))
}

fn parse_requirement(line: &str) -> std::result::Result<Requirement, String> {
    let (_, (name, constraints)) = all_consuming(requirement)
        .parse(line)
        .map_err(|_| format!("invalid requirement specifier `{line}`"))?;

    for c in &constraints {
        if c.wildcard && !matches!(c.op, ConstraintOp::Eq | ConstraintOp::Ne) {
            return Err(format!("`.*` is only allowed with == or != in `{line}`"));
        }
        if c.op == ConstraintOp::Compatible && c.version.parts().len() < 2 {
            return Err(format!("`~=` needs at least two version components in `{line}`"));
        }
    }

    Ok(Requirement {
        name: name.to_string(),
        constraints,
    })
}
