//! Account provisioning inside an image root filesystem.
//!
//! Accounts live in the image's own `/etc/passwd` and `/etc/group`, never
//! in the host's. Provisioning only edits files under the given root; the
//! caller decides who owns the results.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use berth_common::constants::{FIRST_ACCOUNT_ID, MAX_ACCOUNT_NAME_LEN};
use berth_common::error::{BerthError, Result};
use serde::{Deserialize, Serialize};

const PASSWD: &str = "etc/passwd";
const GROUP: &str = "etc/group";
const DEFAULT_SHELL: &str = "/bin/sh";
const LAST_ACCOUNT_ID: u32 = 60_000;

/// An unprivileged login account recorded in an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Numeric primary group id.
    pub gid: u32,
    /// Home directory, as an absolute path inside the image.
    pub home: PathBuf,
    /// Login shell.
    pub shell: String,
}

impl Account {
    fn passwd_line(&self) -> String {
        format!(
            "{}:x:{}:{}::{}:{}",
            self.name,
            self.uid,
            self.gid,
            self.home.display(),
            self.shell
        )
    }

    fn group_line(&self) -> String {
        format!("{}:x:{}:", self.name, self.gid)
    }
}

/// The account and group tables of one image root.
#[derive(Debug, Clone, Default)]
pub struct AccountDatabase {
    accounts: Vec<Account>,
    group_ids: Vec<u32>,
}

impl AccountDatabase {
    /// Reads `/etc/passwd` and `/etc/group` under `root`.
    ///
    /// Missing files are treated as empty tables; malformed lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be read.
    pub fn load(root: &Path) -> Result<Self> {
        let accounts = read_table(&root.join(PASSWD))?
            .lines()
            .filter_map(parse_passwd_line)
            .collect();
        let group_ids = read_table(&root.join(GROUP))?
            .lines()
            .filter_map(parse_group_gid)
            .collect();
        Ok(Self {
            accounts,
            group_ids,
        })
    }

    /// Looks up an account by login name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Returns all accounts in file order.
    #[must_use]
    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    fn next_free_uid(&self) -> u32 {
        self.accounts
            .iter()
            .map(|a| a.uid)
            .filter(|uid| (FIRST_ACCOUNT_ID..LAST_ACCOUNT_ID).contains(uid))
            .max()
            .map_or(FIRST_ACCOUNT_ID, |uid| uid + 1)
    }

    fn gid_is_free(&self, gid: u32) -> bool {
        !self.group_ids.contains(&gid)
    }

    fn next_free_gid(&self, preferred: u32) -> u32 {
        let mut gid = preferred;
        while !self.gid_is_free(gid) {
            gid += 1;
        }
        gid
    }
}

/// Checks that `name` is an acceptable login name.
///
/// Accepted names start with a lowercase letter or underscore, continue with
/// lowercase letters, digits, `_` or `-`, and are at most 32 characters.
///
/// # Errors
///
/// Returns `BerthError::Config` describing the first violated rule.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |why: &str| {
        Err(BerthError::Config {
            message: format!("invalid account name `{name}`: {why}"),
        })
    };
    let Some(first) = name.chars().next() else {
        return invalid("name is empty");
    };
    if name.len() > MAX_ACCOUNT_NAME_LEN {
        return invalid("longer than 32 characters");
    }
    if !(first.is_ascii_lowercase() || first == '_') {
        return invalid("must start with a lowercase letter or underscore");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    {
        return invalid("only lowercase letters, digits, `_` and `-` are allowed");
    }
    Ok(())
}

/// Creates a new account with a fresh home directory under `root`.
///
/// The uid is the first free id at or above 1000; a group of the same name
/// is created, reusing the uid as gid when that gid is free.
///
/// # Errors
///
/// Returns `BerthError::AccountExists` if the name is already present in
/// the image's `/etc/passwd`, a config error for an invalid name, or an
/// I/O error if the tables or home directory cannot be written.
pub fn provision(root: &Path, name: &str) -> Result<Account> {
    validate_name(name)?;
    let db = AccountDatabase::load(root)?;
    if db.lookup(name).is_some() {
        return Err(BerthError::AccountExists { name: name.into() });
    }

    let uid = db.next_free_uid();
    let account = Account {
        name: name.to_string(),
        uid,
        gid: db.next_free_gid(uid),
        home: PathBuf::from("/home").join(name),
        shell: DEFAULT_SHELL.to_string(),
    };

    append_line(&root.join(PASSWD), &account.passwd_line())?;
    append_line(&root.join(GROUP), &account.group_line())?;

    let home = root.join(account.home.strip_prefix("/").unwrap_or(&account.home));
    std::fs::create_dir_all(&home).map_err(|e| BerthError::io(&home, e))?;
    set_mode(&home, 0o755)?;

    tracing::info!(name, uid = account.uid, gid = account.gid, "account provisioned");
    Ok(account)
}

fn read_table(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(BerthError::io(path, e)),
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut content = read_table(path)?;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    let _ = writeln!(content, "{line}");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| BerthError::io(path, e))?;
    set_mode(path, 0o644)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| BerthError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn parse_passwd_line(line: &str) -> Option<Account> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != 7 {
        return None;
    }
    Some(Account {
        name: fields[0].to_string(),
        uid: fields[2].parse().ok()?,
        gid: fields[3].parse().ok()?,
        home: PathBuf::from(fields[5]),
        shell: fields[6].to_string(),
    })
}

fn parse_group_gid(line: &str) -> Option<u32> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    line.split(':').nth(2)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_with_passwd(passwd: &str, group: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("etc")).expect("mkdir etc");
        std::fs::write(dir.path().join(PASSWD), passwd).expect("write passwd");
        std::fs::write(dir.path().join(GROUP), group).expect("write group");
        dir
    }

    #[test]
    fn provision_on_empty_root_starts_at_first_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let account = provision(dir.path(), "botuser").expect("provision");
        assert_eq!(account.uid, 1000);
        assert_eq!(account.gid, 1000);
        assert_eq!(account.home, PathBuf::from("/home/botuser"));
        assert!(dir.path().join("home/botuser").is_dir());

        let passwd = std::fs::read_to_string(dir.path().join(PASSWD)).expect("read");
        assert_eq!(passwd, "botuser:x:1000:1000::/home/botuser:/bin/sh\n");
    }

    #[test]
    fn provision_skips_taken_ids() {
        let dir = root_with_passwd(
            "root:x:0:0:root:/root:/bin/bash\nalice:x:1000:1000::/home/alice:/bin/sh",
            "root:x:0:\nalice:x:1000:\nstaff:x:1001:\n",
        );
        let account = provision(dir.path(), "bot").expect("provision");
        assert_eq!(account.uid, 1001);
        assert_eq!(account.gid, 1002);

        let db = AccountDatabase::load(dir.path()).expect("load");
        assert_eq!(db.accounts().len(), 3);
        assert_eq!(db.lookup("bot").map(|a| a.uid), Some(1001));
    }

    #[test]
    fn provision_rejects_existing_name() {
        let dir = root_with_passwd("nobody:x:65534:65534::/nonexistent:/usr/sbin/nologin\n", "");
        let err = provision(dir.path(), "nobody").expect_err("collision");
        assert!(matches!(err, BerthError::AccountExists { ref name } if name == "nobody"));
    }

    #[test]
    fn validate_name_rules() {
        assert!(validate_name("botuser").is_ok());
        assert!(validate_name("_svc-1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Bot").is_err());
        assert!(validate_name("1bot").is_err());
        assert!(validate_name("bot:user").is_err());
        assert!(validate_name(&"a".repeat(33)).is_err());
    }

    #[test]
    fn load_skips_comments_and_malformed_lines() {
        let dir = root_with_passwd("# comment\nbroken line\nbot:x:1000:1000::/home/bot:/bin/sh\n", "");
        let db = AccountDatabase::load(dir.path()).expect("load");
        assert_eq!(db.accounts().len(), 1);
    }
}
