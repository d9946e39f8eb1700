//! File-backed user record store.
//!
//! Layout: one YAML file per user under the store root:
//!
//! ```text
//! <root>/
//!   alice@example.org.yaml
//!   bob@example.org.yaml
//! ```
//!
//! Writes go through a temp file followed by an atomic rename so a crash
//! mid-write never leaves a torn record behind.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::remote::Credentials;
use crate::session::{CursorKind, DisplayMode};

use super::error::{StorageError, StorageResult};
use super::user::{UserRecord, UserStore};

/// User record store backed by per-user YAML files.
pub struct FileUserStore {
    root: PathBuf,
}

impl FileUserStore {
    /// Create a store rooted at the given directory.
    ///
    /// The directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, user: &str) -> PathBuf {
        self.root.join(format!("{}.yaml", sanitize_user(user)))
    }

    async fn ensure_root(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StorageError::file_io(&self.root, e))
    }

    async fn load(&self, user: &str) -> StorageResult<UserRecord> {
        let path = self.record_path(user);

        let contents = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(UserRecord::default());
            }
            Err(e) => return Err(StorageError::file_io(&path, e)),
        };

        serde_yaml::from_str(&contents)
            .map_err(|e| StorageError::file_deserialization(&path, e.to_string()))
    }

    async fn save(&self, user: &str, record: &UserRecord) -> StorageResult<()> {
        self.ensure_root().await?;

        let final_path = self.record_path(user);
        let temp_path = final_path.with_extension("yaml.tmp");

        let yaml = serde_yaml::to_string(record)
            .map_err(|e| StorageError::serialization(e.to_string()))?;

        fs::write(&temp_path, yaml.as_bytes())
            .await
            .map_err(|e| StorageError::file_io(&temp_path, e))?;

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| StorageError::file_io(&final_path, e))?;

        Ok(())
    }

    async fn update<F>(&self, user: &str, apply: F) -> StorageResult<()>
    where
        F: FnOnce(&mut UserRecord),
    {
        let mut record = self.load(user).await?;
        apply(&mut record);
        self.save(user, &record).await
    }
}

#[async_trait]
impl UserStore for FileUserStore {
    async fn record(&self, user: &str) -> StorageResult<UserRecord> {
        self.load(user).await
    }

    async fn credentials(&self, user: &str) -> StorageResult<Option<Credentials>> {
        Ok(self.load(user).await?.credentials())
    }

    async fn set_credentials(&self, user: &str, credentials: &Credentials) -> StorageResult<()> {
        self.update(user, |record| {
            record.token = Some(credentials.token.clone());
            record.secret = Some(credentials.secret.clone());
        })
        .await
    }

    async fn cursor(&self, user: &str, kind: CursorKind) -> StorageResult<u64> {
        Ok(self.load(user).await?.cursor(kind))
    }

    async fn set_cursor(&self, user: &str, kind: CursorKind, id: u64) -> StorageResult<()> {
        self.update(user, |record| match kind {
            CursorKind::Status => record.status_cursor = id,
            CursorKind::DirectMessage => record.dm_cursor = id,
        })
        .await
    }

    async fn mode(&self, user: &str) -> StorageResult<Option<DisplayMode>> {
        Ok(self.load(user).await?.mode)
    }

    async fn set_mode(&self, user: &str, mode: DisplayMode) -> StorageResult<()> {
        self.update(user, |record| record.mode = Some(mode)).await
    }

    async fn is_legacy_user(&self, user: &str) -> StorageResult<bool> {
        Ok(self.load(user).await?.legacy_scheme)
    }

    async fn set_screen_name(&self, user: &str, screen_name: &str) -> StorageResult<()> {
        self.update(user, |record| record.screen_name = Some(screen_name.to_string()))
            .await
    }
}

/// Make a user identity safe to use as a file name.
///
/// Identities are JID-like ("alice@example.org"); anything outside a
/// conservative character set is replaced so path separators cannot escape
/// the store root.
fn sanitize_user(user: &str) -> String {
    let sanitized: String = user
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '@' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}
