//! Account storage behind application principals.
//!
//! Accounts are plain records (name, SID, owner comment, memberships). The
//! [`AccountStore`] trait only needs record-level access; the account
//! operations hosting performs are provided on top of it.

use crate::error::{HostingError, Result};
use crate::model::SecurityPrincipalAccountType;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Attempts made to find a free random account name.
const RANDOM_NAME_ATTEMPTS: usize = 8;

/// Length of the random suffix of generated account names.
const RANDOM_NAME_SUFFIX_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    User,
    Group,
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Parameters for a new account.
#[derive(Debug, Clone)]
pub struct AccountSpec {
    pub kind: AccountKind,
    pub comment: String,
    /// Groups the account joins on creation.
    pub member_of: Vec<String>,
    /// Certificate backing the account password; empty when none is needed.
    pub certificate_thumbprint: String,
}

impl AccountSpec {
    pub fn new(kind: AccountKind, comment: impl Into<String>) -> Self {
        Self {
            kind,
            comment: comment.into(),
            member_of: Vec::new(),
            certificate_thumbprint: String::new(),
        }
    }
}

/// One stored account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub name: String,
    pub kind: AccountKind,
    pub sid: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub member_of: Vec<String>,
    /// Member SIDs, for groups.
    #[serde(default)]
    pub members: Vec<String>,
    /// Outstanding loads of the account.
    #[serde(default)]
    pub load_count: u32,
}

/// SID of a built-in service account, if `account_type` is one.
pub fn well_known_sid(account_type: SecurityPrincipalAccountType) -> Option<&'static str> {
    match account_type {
        SecurityPrincipalAccountType::LocalSystem => Some("S-1-5-18"),
        SecurityPrincipalAccountType::LocalService => Some("S-1-5-19"),
        SecurityPrincipalAccountType::NetworkService => Some("S-1-5-20"),
        _ => None,
    }
}

fn generate_sid() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "S-1-5-21-{}-{}-{}-{}",
        rng.gen::<u32>(),
        rng.gen::<u32>(),
        rng.gen::<u32>(),
        rng.gen_range(1000..100_000u32)
    )
}

fn random_account_name(principal_name: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_NAME_SUFFIX_LEN)
        .map(char::from)
        .collect();
    let stem: String = principal_name.chars().take(8).collect();
    format!("{stem}-{suffix}")
}

/// Storage of user and group accounts.
pub trait AccountStore: Send + Sync {
    fn read_record(&self, name: &str) -> Result<Option<AccountRecord>>;

    fn write_record(&self, record: &AccountRecord) -> Result<()>;

    /// Returns false when no record existed.
    fn remove_record(&self, name: &str) -> Result<bool>;

    fn list_records(&self) -> Result<Vec<AccountRecord>>;

    fn has_certificate(&self, thumbprint: &str) -> Result<bool>;

    /// Comment of an existing account of `kind`.
    fn get_comment(&self, kind: AccountKind, name: &str) -> Result<String> {
        match self.read_record(name)? {
            Some(record) if record.kind == kind => Ok(record.comment),
            _ => Err(HostingError::NotFound(format!("{kind} {name}"))),
        }
    }

    fn update_comment(&self, kind: AccountKind, name: &str, comment: &str) -> Result<()> {
        match self.read_record(name)? {
            Some(mut record) if record.kind == kind => {
                record.comment = comment.to_string();
                self.write_record(&record)
            }
            _ => Err(HostingError::NotFound(format!("{kind} {name}"))),
        }
    }

    /// Create an account named `name`, returning its SID.
    fn create_account(&self, name: &str, spec: &AccountSpec) -> Result<String> {
        if !spec.certificate_thumbprint.is_empty() && !self.has_certificate(&spec.certificate_thumbprint)? {
            return Err(HostingError::CertificateNotFound(spec.certificate_thumbprint.clone()));
        }
        if self.read_record(name)?.is_some() {
            return Err(HostingError::AlreadyExists(format!("{} {name}", spec.kind)));
        }

        let record = AccountRecord {
            name: name.to_string(),
            kind: spec.kind,
            sid: generate_sid(),
            comment: spec.comment.clone(),
            member_of: spec.member_of.clone(),
            members: Vec::new(),
            load_count: 1,
        };
        self.write_record(&record)?;
        tracing::debug!(account = %name, kind = %spec.kind, sid = %record.sid, "Created account");
        Ok(record.sid)
    }

    /// Create an account with a generated name derived from `principal_name`.
    ///
    /// Returns `(account name, SID)`.
    fn create_account_with_random_name(
        &self,
        principal_name: &str,
        spec: &AccountSpec,
    ) -> Result<(String, String)> {
        for _ in 0..RANDOM_NAME_ATTEMPTS {
            let name = random_account_name(principal_name);
            match self.create_account(&name, spec) {
                Err(HostingError::AlreadyExists(_)) => continue,
                result => return result.map(|sid| (name, sid)),
            }
        }
        Err(HostingError::OperationFailed(format!(
            "no free account name for {principal_name}"
        )))
    }

    /// Register an externally managed account so it can be loaded.
    fn configure_account(&self, name: &str, kind: AccountKind) -> Result<()> {
        if self.read_record(name)?.is_some() {
            return Ok(());
        }
        self.write_record(&AccountRecord {
            name: name.to_string(),
            kind,
            sid: generate_sid(),
            comment: String::new(),
            member_of: Vec::new(),
            members: Vec::new(),
            load_count: 0,
        })
    }

    /// Load an existing account, returning its SID.
    fn load_account(&self, name: &str) -> Result<String> {
        let mut record = self
            .read_record(name)?
            .ok_or_else(|| HostingError::NotFound(format!("account {name}")))?;
        record.load_count += 1;
        self.write_record(&record)?;
        Ok(record.sid)
    }

    fn unload_account(&self, name: &str) -> Result<()> {
        if let Some(mut record) = self.read_record(name)? {
            record.load_count = record.load_count.saturating_sub(1);
            self.write_record(&record)?;
        }
        Ok(())
    }

    fn delete_account(&self, name: &str) -> Result<()> {
        if self.remove_record(name)? {
            tracing::debug!(account = %name, "Deleted account");
            Ok(())
        } else {
            Err(HostingError::NotFound(format!("account {name}")))
        }
    }

    /// Replace a group's member list.
    fn set_group_members(&self, group: &str, member_sids: &[String]) -> Result<()> {
        match self.read_record(group)? {
            Some(mut record) if record.kind == AccountKind::Group => {
                record.members = member_sids.to_vec();
                self.write_record(&record)
            }
            _ => Err(HostingError::NotFound(format!("group {group}"))),
        }
    }

    fn list_accounts(&self, kind: AccountKind) -> Result<Vec<AccountRecord>> {
        Ok(self
            .list_records()?
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local account store.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    records: Mutex<HashMap<String, AccountRecord>>,
    certificates: Mutex<HashSet<String>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a certificate available to accounts that need one.
    pub fn install_certificate(&self, thumbprint: impl Into<String>) {
        lock(&self.certificates).insert(thumbprint.into());
    }

    pub fn remove_certificate(&self, thumbprint: &str) {
        lock(&self.certificates).remove(thumbprint);
    }

    /// Snapshot of one account.
    pub fn account(&self, name: &str) -> Option<AccountRecord> {
        lock(&self.records).get(name).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn read_record(&self, name: &str) -> Result<Option<AccountRecord>> {
        Ok(lock(&self.records).get(name).cloned())
    }

    fn write_record(&self, record: &AccountRecord) -> Result<()> {
        lock(&self.records).insert(record.name.clone(), record.clone());
        Ok(())
    }

    fn remove_record(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.records).remove(name).is_some())
    }

    fn list_records(&self) -> Result<Vec<AccountRecord>> {
        let mut records: Vec<_> = lock(&self.records).values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn has_certificate(&self, thumbprint: &str) -> Result<bool> {
        Ok(lock(&self.certificates).contains(thumbprint))
    }
}

// ============================================================================
// Sidecar file store
// ============================================================================

/// Account store keeping one JSON file per account.
///
/// Layout under the root folder:
/// - `accounts/<name>.json`: the account record
/// - `certificates/<thumbprint>`: marker for an installed certificate
///
/// Callers serialize access per account with the account's named lock.
#[derive(Debug, Clone)]
pub struct FileAccountStore {
    accounts_dir: PathBuf,
    certificates_dir: PathBuf,
}

impl FileAccountStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            accounts_dir: root.join("accounts"),
            certificates_dir: root.join("certificates"),
        }
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.accounts_dir.join(format!("{}.json", file_safe_name(name)))
    }
}

/// Map an arbitrary name onto a portable file name.
pub(crate) fn file_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

impl AccountStore for FileAccountStore {
    fn read_record(&self, name: &str) -> Result<Option<AccountRecord>> {
        match std::fs::read(self.record_path(name)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(&self, record: &AccountRecord) -> Result<()> {
        std::fs::create_dir_all(&self.accounts_dir)?;
        let path = self.record_path(&record.name);
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(record)?)?;
        std::fs::rename(&staging, &path)?;
        Ok(())
    }

    fn remove_record(&self, name: &str) -> Result<bool> {
        match std::fs::remove_file(self.record_path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list_records(&self) -> Result<Vec<AccountRecord>> {
        let entries = match std::fs::read_dir(&self.accounts_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path) {
                Ok(bytes) => match serde_json::from_slice::<AccountRecord>(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable account record");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    fn has_certificate(&self, thumbprint: &str) -> Result<bool> {
        Ok(self.certificates_dir.join(file_safe_name(thumbprint)).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_store(store: &dyn AccountStore) {
        let spec = AccountSpec::new(AccountKind::Group, "WinFabApplication|g|N1|App_App1");
        let sid = store.create_account("g1", &spec).unwrap();
        assert!(sid.starts_with("S-1-5-21-"));

        assert!(matches!(
            store.create_account("g1", &spec),
            Err(HostingError::AlreadyExists(_))
        ));

        assert_eq!(
            store.get_comment(AccountKind::Group, "g1").unwrap(),
            "WinFabApplication|g|N1|App_App1"
        );
        assert!(matches!(
            store.get_comment(AccountKind::User, "g1"),
            Err(HostingError::NotFound(_))
        ));

        store
            .update_comment(AccountKind::Group, "g1", "WinFabApplication|g|N1,N2|App_App1")
            .unwrap();
        assert_eq!(store.load_account("g1").unwrap(), sid);

        store.set_group_members("g1", &["S-1-5-20".to_string()]).unwrap();
        assert_eq!(store.list_accounts(AccountKind::Group).unwrap()[0].members.len(), 1);

        store.delete_account("g1").unwrap();
        assert!(matches!(store.delete_account("g1"), Err(HostingError::NotFound(_))));
        assert!(matches!(store.load_account("g1"), Err(HostingError::NotFound(_))));
    }

    #[test]
    fn test_in_memory_store() {
        exercise_store(&InMemoryAccountStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        exercise_store(&FileAccountStore::new(dir.path()));
    }

    #[test]
    fn test_missing_certificate() {
        let store = InMemoryAccountStore::new();
        let mut spec = AccountSpec::new(AccountKind::User, "c");
        spec.certificate_thumbprint = "ABCD".into();

        assert!(matches!(
            store.create_account("u1", &spec),
            Err(HostingError::CertificateNotFound(_))
        ));

        store.install_certificate("ABCD");
        assert!(store.create_account("u1", &spec).is_ok());
    }

    #[test]
    fn test_random_names_are_distinct() {
        let store = InMemoryAccountStore::new();
        let spec = AccountSpec::new(AccountKind::User, "c");
        let (a, _) = store.create_account_with_random_name("WebUser", &spec).unwrap();
        let (b, _) = store.create_account_with_random_name("WebUser", &spec).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("WebUser-"));
    }

    #[test]
    fn test_file_safe_name() {
        assert_eq!(file_safe_name("Global\\WinFab_x"), "Global_WinFab_x");
    }

    #[test]
    fn test_well_known_sids() {
        assert_eq!(
            well_known_sid(SecurityPrincipalAccountType::NetworkService),
            Some("S-1-5-20")
        );
        assert_eq!(well_known_sid(SecurityPrincipalAccountType::LocalUser), None);
    }
}
