//! Local account and authorized-keys management.
//!
//! All mutations run through [`AccountManager`], which the processor drives
//! serially. A user "exists" when both its home directory is present and the
//! passwd database resolves the name; account changes go through the system
//! tools (`useradd`, `userdel`, `gpasswd`, `passwd`) invoked with argv
//! vectors, never a shell. A command failed when it exits nonzero; its
//! stderr is the diagnostic reported back to the backend.

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bastio_proto::FeedbackStatus;
use nix::unistd::User;
use tokio::process::Command;
use tracing::debug;

use crate::error::{AgentError, AgentResult};

/// Root under which user home directories live.
pub const DEFAULT_HOME_ROOT: &str = "/home";

/// Result of one account operation, ready to become feedback.
#[derive(Debug, Clone)]
pub struct AccountOutcome {
    pub status: FeedbackStatus,
    pub detail: String,
}

impl AccountOutcome {
    fn success(detail: impl Into<String>) -> Self {
        Self {
            status: FeedbackStatus::Success,
            detail: detail.into(),
        }
    }

    fn info(detail: impl Into<String>) -> Self {
        Self {
            status: FeedbackStatus::Info,
            detail: detail.into(),
        }
    }

    fn error(detail: impl Into<String>) -> Self {
        Self {
            status: FeedbackStatus::Error,
            detail: detail.into(),
        }
    }
}

/// Applies account and key mutations to the local system.
#[derive(Debug, Clone)]
pub struct AccountManager {
    home_root: PathBuf,
}

impl Default for AccountManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountManager {
    pub fn new() -> Self {
        Self::with_home_root(DEFAULT_HOME_ROOT)
    }

    pub fn with_home_root(home_root: impl Into<PathBuf>) -> Self {
        Self {
            home_root: home_root.into(),
        }
    }

    fn user_dir(&self, username: &str) -> PathBuf {
        self.home_root.join(username)
    }

    fn ssh_dir(&self, username: &str) -> PathBuf {
        self.user_dir(username).join(".ssh")
    }

    fn authorized_keys_path(&self, username: &str) -> PathBuf {
        self.ssh_dir(username).join("authorized_keys")
    }

    fn user_exists(&self, username: &str) -> bool {
        self.user_dir(username).is_dir() && lookup_user(username).is_some()
    }

    /// Create `username` (with optional sudo membership), clear its password
    /// and provision its SSH directory.
    pub async fn add_user(&self, username: &str, sudo: bool) -> AccountOutcome {
        if self.user_exists(username) {
            // Re-ensure the SSH directory so a half-provisioned account heals.
            self.ensure_ssh_dir(username);
            return AccountOutcome::info(format!("{username} already exists"));
        }

        let mut args = vec!["-mU"];
        if sudo {
            args.extend_from_slice(&["-G", "sudo"]);
        }
        args.push(username);
        if let Err(diagnostic) = run_command("useradd", &args).await {
            return AccountOutcome::error(diagnostic);
        }

        if let Err(diagnostic) = run_command("passwd", &["-d", username]).await {
            return AccountOutcome::error(diagnostic);
        }

        self.ensure_ssh_dir(username);
        AccountOutcome::success(format!("{username} was created successfully"))
    }

    /// Remove `username` and its home directory.
    pub async fn remove_user(&self, username: &str) -> AccountOutcome {
        if !self.user_exists(username) {
            return AccountOutcome::info(format!("{username} does not exist"));
        }
        match run_command("userdel", &["-r", username]).await {
            Ok(()) => AccountOutcome::success(format!("{username} was removed successfully")),
            Err(diagnostic) => AccountOutcome::error(diagnostic),
        }
    }

    /// Grant (`sudo = true`) or revoke sudo group membership.
    pub async fn update_user(&self, username: &str, sudo: bool) -> AccountOutcome {
        if !self.user_exists(username) {
            return AccountOutcome::error(format!("{username} does not exist"));
        }
        let flag = if sudo { "-a" } else { "-d" };
        match run_command("gpasswd", &[flag, username, "sudo"]).await {
            Ok(()) if sudo => {
                AccountOutcome::success(format!("{username} was added to the sudo group successfully"))
            }
            Ok(()) => AccountOutcome::success(format!(
                "{username} was removed from the sudo group successfully"
            )),
            Err(diagnostic) => AccountOutcome::error(diagnostic),
        }
    }

    /// Append a public key to the user's authorized_keys file.
    pub async fn add_key(&self, username: &str, public_key: &str) -> AccountOutcome {
        if !self.user_exists(username) {
            return AccountOutcome::error(format!("{username} does not exist"));
        }

        let path = self.authorized_keys_path(username);
        let contents = std::fs::read_to_string(&path).unwrap_or_default();
        if contents.contains(public_key) {
            return AccountOutcome::info(format!(
                "public key `{public_key}` for {username} already exists"
            ));
        }

        let appended = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{public_key}"));
        match appended {
            Ok(()) => {
                AccountOutcome::success(format!("added public key to {username} successfully"))
            }
            Err(e) => AccountOutcome::error(e.to_string()),
        }
    }

    /// Remove every authorized_keys line containing the public key. The file
    /// is rewritten through a temp file in the same directory and renamed
    /// into place so concurrent readers never see a partial file.
    pub async fn remove_key(&self, username: &str, public_key: &str) -> AccountOutcome {
        if !self.user_exists(username) {
            return AccountOutcome::error(format!("{username} does not exist"));
        }

        let path = self.authorized_keys_path(username);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return AccountOutcome::info(format!(
                    "public key for {username} does not exist"
                ));
            }
            Err(e) => return AccountOutcome::error(e.to_string()),
        };

        let retained: Vec<&str> = contents
            .lines()
            .filter(|line| !line.contains(public_key))
            .collect();
        if retained.len() == contents.lines().count() {
            return AccountOutcome::info(format!("public key for {username} does not exist"));
        }

        match self.rewrite_authorized_keys(username, &path, &retained) {
            Ok(()) => {
                AccountOutcome::success(format!("removed public key from {username} successfully"))
            }
            Err(e) => AccountOutcome::error(e.to_string()),
        }
    }

    /// Make sure `.ssh` (0700) and `authorized_keys` (0600) exist and belong
    /// to the user. Failures are deferred: a later key operation will surface
    /// them as its own error.
    fn ensure_ssh_dir(&self, username: &str) {
        let ssh_dir = self.ssh_dir(username);
        if let Err(e) = std::fs::create_dir(&ssh_dir) {
            if e.kind() != std::io::ErrorKind::AlreadyExists {
                debug!(username, error = %e, "deferred: could not create .ssh directory");
                return;
            }
        }
        let _ = std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700));

        let authorized_keys = self.authorized_keys_path(username);
        if let Err(e) = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&authorized_keys)
        {
            debug!(username, error = %e, "deferred: could not create authorized_keys");
        }
        let _ = std::fs::set_permissions(&authorized_keys, std::fs::Permissions::from_mode(0o600));

        if let Some(user) = lookup_user(username) {
            let uid = Some(user.uid.as_raw());
            let gid = Some(user.gid.as_raw());
            let _ = std::os::unix::fs::chown(&ssh_dir, uid, gid);
            let _ = std::os::unix::fs::chown(&authorized_keys, uid, gid);
        }
    }

    fn rewrite_authorized_keys(
        &self,
        username: &str,
        path: &Path,
        lines: &[&str],
    ) -> AgentResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| AgentError::account("authorized_keys file has no parent directory"))?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        for line in lines {
            writeln!(temp, "{line}")?;
        }
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        if let Some(user) = lookup_user(username) {
            let _ = std::os::unix::fs::chown(
                temp.path(),
                Some(user.uid.as_raw()),
                Some(user.gid.as_raw()),
            );
        }
        temp.persist(path).map_err(|e| AgentError::Io(e.error))?;
        Ok(())
    }
}

fn lookup_user(username: &str) -> Option<User> {
    User::from_name(username).ok().flatten()
}

/// Run a system command; `Err` carries the diagnostic for an error feedback.
async fn run_command(program: &str, args: &[&str]) -> Result<(), String> {
    match Command::new(program).args(args).output().await {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                Err(format!("{program} exited with {}", output.status))
            } else {
                Err(stderr)
            }
        }
        Err(e) => Err(format!("failed to run {program}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISSING_USER: &str = "bastio_missing_user";
    const TEST_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAAAgQCxyzzyqwer/tyuiop+asdf tester";

    /// The current (real, resolvable) user plus a temp home root containing
    /// its home directory, so existence checks pass without privileges.
    fn manager_for_current_user() -> (tempfile::TempDir, AccountManager, String) {
        let user = User::from_uid(nix::unistd::Uid::effective())
            .unwrap()
            .expect("current user resolves");
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(&user.name)).unwrap();
        let manager = AccountManager::with_home_root(dir.path());
        (dir, manager, user.name)
    }

    #[test]
    fn test_paths() {
        let manager = AccountManager::new();
        assert_eq!(manager.user_dir("alice"), PathBuf::from("/home/alice"));
        assert_eq!(manager.ssh_dir("alice"), PathBuf::from("/home/alice/.ssh"));
        assert_eq!(
            manager.authorized_keys_path("alice"),
            PathBuf::from("/home/alice/.ssh/authorized_keys")
        );
    }

    #[test]
    fn test_user_exists_needs_home_and_passwd_entry() {
        let (_dir, manager, username) = manager_for_current_user();
        assert!(manager.user_exists(&username));
        assert!(!manager.user_exists(MISSING_USER));

        // Home dir alone is not enough.
        let other = AccountManager::with_home_root("/nonexistent_root_for_tests");
        assert!(!other.user_exists(&username));
    }

    #[tokio::test]
    async fn test_add_user_reports_already_exists() {
        let (_dir, manager, username) = manager_for_current_user();
        let outcome = manager.add_user(&username, false).await;
        assert_eq!(outcome.status, FeedbackStatus::Info);
        assert!(outcome.detail.contains("already exists"));
        // The SSH directory was (re-)provisioned on the way out.
        assert!(manager.ssh_dir(&username).is_dir());
        assert!(manager.authorized_keys_path(&username).exists());
    }

    #[tokio::test]
    async fn test_remove_user_missing_is_info() {
        let manager = AccountManager::new();
        let outcome = manager.remove_user(MISSING_USER).await;
        assert_eq!(outcome.status, FeedbackStatus::Info);
        assert!(outcome.detail.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_update_user_missing_is_error() {
        let manager = AccountManager::new();
        let outcome = manager.update_user(MISSING_USER, false).await;
        assert_eq!(outcome.status, FeedbackStatus::Error);
        assert!(outcome.detail.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_key_operations_on_missing_user_are_errors() {
        let manager = AccountManager::new();
        let outcome = manager.add_key(MISSING_USER, TEST_KEY).await;
        assert_eq!(outcome.status, FeedbackStatus::Error);
        let outcome = manager.remove_key(MISSING_USER, TEST_KEY).await;
        assert_eq!(outcome.status, FeedbackStatus::Error);
    }

    #[tokio::test]
    async fn test_key_roundtrip() {
        let (_dir, manager, username) = manager_for_current_user();
        manager.ensure_ssh_dir(&username);

        // First add succeeds, second is informational.
        let outcome = manager.add_key(&username, TEST_KEY).await;
        assert_eq!(outcome.status, FeedbackStatus::Success);
        let outcome = manager.add_key(&username, TEST_KEY).await;
        assert_eq!(outcome.status, FeedbackStatus::Info);
        assert!(outcome.detail.contains("already exists"));

        let contents = std::fs::read_to_string(manager.authorized_keys_path(&username)).unwrap();
        assert_eq!(contents.matches(TEST_KEY).count(), 1);

        // First remove succeeds, second is informational.
        let outcome = manager.remove_key(&username, TEST_KEY).await;
        assert_eq!(outcome.status, FeedbackStatus::Success);
        let outcome = manager.remove_key(&username, TEST_KEY).await;
        assert_eq!(outcome.status, FeedbackStatus::Info);
        assert!(outcome.detail.contains("does not exist"));

        let contents = std::fs::read_to_string(manager.authorized_keys_path(&username)).unwrap();
        assert!(!contents.contains(TEST_KEY));
    }

    #[tokio::test]
    async fn test_remove_key_keeps_other_lines() {
        let (_dir, manager, username) = manager_for_current_user();
        manager.ensure_ssh_dir(&username);

        let other = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOtherKeyMaterial other@host";
        manager.add_key(&username, other).await;
        manager.add_key(&username, TEST_KEY).await;

        let outcome = manager.remove_key(&username, TEST_KEY).await;
        assert_eq!(outcome.status, FeedbackStatus::Success);

        let contents = std::fs::read_to_string(manager.authorized_keys_path(&username)).unwrap();
        assert!(contents.contains(other));
        assert!(!contents.contains(TEST_KEY));
    }

    #[tokio::test]
    async fn test_remove_key_without_file_is_info() {
        let (_dir, manager, username) = manager_for_current_user();
        let outcome = manager.remove_key(&username, TEST_KEY).await;
        assert_eq!(outcome.status, FeedbackStatus::Info);
        assert!(outcome.detail.contains("does not exist"));
    }

    #[test]
    fn test_ssh_dir_modes() {
        let (_dir, manager, username) = manager_for_current_user();
        manager.ensure_ssh_dir(&username);

        let dir_mode = std::fs::metadata(manager.ssh_dir(&username))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file_mode = std::fs::metadata(manager.authorized_keys_path(&username))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }
}
