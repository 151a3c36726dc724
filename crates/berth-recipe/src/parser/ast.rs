//! Abstract Syntax Tree for `Berthfile` recipes.

use std::fmt;
use std::path::PathBuf;

use berth_common::types::EntryCommand;

/// Root node of a parsed recipe.
#[derive(Debug, Clone, Default)]
pub struct Recipe {
    /// Instructions in file order.
    pub instructions: Vec<Instruction>,
}

impl Recipe {
    /// Returns the base reference declared by `FROM`, if any.
    #[must_use]
    pub fn base(&self) -> Option<&str> {
        self.instructions.iter().find_map(|i| match &i.kind {
            InstructionKind::From(base) => Some(base.as_str()),
            _ => None,
        })
    }
}

/// A single recipe directive with its source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// One-based line number in the recipe file.
    pub line: usize,
    /// Parsed directive.
    pub kind: InstructionKind,
}

/// The directives a recipe may contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionKind {
    /// `FROM <base>`: `scratch`, `file://<dir>` or `tar://<archive>`.
    From(String),
    /// `WORKDIR <absolute path>`.
    Workdir(PathBuf),
    /// `MANIFEST <path>`: manifest file relative to the build context.
    Manifest(PathBuf),
    /// `INSTALL`: resolve and install the manifest's dependencies.
    Install,
    /// `COPY <src> <dest>`: source tree relative to the build context,
    /// destination relative to the working directory.
    Copy {
        /// Source path in the build context.
        src: PathBuf,
        /// Destination under the working directory.
        dest: PathBuf,
    },
    /// `ACCOUNT <name>`: create the unprivileged account.
    Account(String),
    /// `USER <name>`: switch to the account for the rest of the build and at runtime.
    User(String),
    /// `ENV KEY=VALUE ...`: image environment.
    Env(Vec<(String, String)>),
    /// `CMD ["argv0", ...]`: exec-form entry command.
    Cmd(EntryCommand),
}

impl InstructionKind {
    /// Returns the directive keyword.
    #[must_use]
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::From(_) => "FROM",
            Self::Workdir(_) => "WORKDIR",
            Self::Manifest(_) => "MANIFEST",
            Self::Install => "INSTALL",
            Self::Copy { .. } => "COPY",
            Self::Account(_) => "ACCOUNT",
            Self::User(_) => "USER",
            Self::Env(_) => "ENV",
            Self::Cmd(_) => "CMD",
        }
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())?;
        match self {
            Self::From(base) => write!(f, " {base}"),
            Self::Workdir(path) | Self::Manifest(path) => write!(f, " {}", path.display()),
            Self::Install => Ok(()),
            Self::Copy { src, dest } => write!(f, " {} {}", src.display(), dest.display()),
            Self::Account(name) | Self::User(name) => write!(f, " {name}"),
            Self::Env(pairs) => {
                for (key, value) in pairs {
                    write!(f, " {key}={value:?}")?;
                }
                Ok(())
            }
            Self::Cmd(argv) => write!(f, " {argv}"),
        }
    }
}
