//! A file-backed token store

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;

use super::{StorageError, TokenStore};
use crate::tokens::TokenRecord;

/// The schema version this build reads and writes
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    schema_version: u32,
    #[serde(flatten)]
    record: TokenRecord,
}

/// A token store backed by a local file
///
/// Records are written to a sibling temp file, fsynced, and renamed into
/// place, so an interrupted write never corrupts the stored record. The file
/// is created with mode `0600`.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    /// Constructs a new file token store at the given path
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_record(&self) -> Result<Option<TokenRecord>, StorageError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let stored: StoredRecord = serde_json::from_slice(&data)?;
        if stored.schema_version != SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchema {
                found: stored.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(Some(stored.record))
    }

    async fn write_record(&self, record: &TokenRecord) -> Result<(), StorageError> {
        use tokio::io::AsyncWriteExt;

        let stored = StoredRecord {
            schema_version: SCHEMA_VERSION,
            record: record.clone_it(),
        };
        let data = serde_json::to_vec_pretty(&stored)?;

        let tmp_path = self.path.with_extension("tmp");

        let mut file_opts = OpenOptions::new();
        file_opts.create(true).truncate(true).write(true);

        #[cfg(unix)]
        file_opts.mode(0o600);

        let mut file = file_opts.open(&tmp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&mut self) -> Result<Option<TokenRecord>, StorageError> {
        self.read_record().await
    }

    async fn save(&mut self, record: &TokenRecord) -> Result<(), StorageError> {
        self.write_record(record).await
    }
}

#[cfg(test)]
mod tests {
    use aliri_clock::{DurationSecs, TestClock, UnixTime};

    use super::*;
    use crate::braids::{AccessToken, RefreshToken, Scope};
    use crate::tokens::TokenLifetimeConfig;

    fn sample_record() -> TokenRecord {
        TokenLifetimeConfig::default()
            .with_clock(TestClock::new(UnixTime(10_000)))
            .create_record(
                AccessToken::from_static("an-access-token"),
                RefreshToken::from_static("a-refresh-token"),
                Some(Scope::from_static("accounts trading")),
                DurationSecs(1_800),
            )
    }

    #[tokio::test]
    async fn load_returns_none_when_no_record_was_ever_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileTokenStore::new(dir.path().join("token.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileTokenStore::new(dir.path().join("token.json"));

        let record = sample_record();
        store.save(&record).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.access_token().as_str(), "an-access-token");
        assert_eq!(loaded.refresh_token().as_str(), "a-refresh-token");
        assert_eq!(loaded.issued(), UnixTime(10_000));
        assert_eq!(loaded.expiry(), UnixTime(11_800));
    }

    #[tokio::test]
    async fn save_replaces_the_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileTokenStore::new(dir.path().join("token.json"));

        store.save(&sample_record()).await.unwrap();
        let replacement = TokenLifetimeConfig::default()
            .with_clock(TestClock::new(UnixTime(20_000)))
            .create_record(
                AccessToken::from_static("newer-access-token"),
                RefreshToken::from_static("newer-refresh-token"),
                None,
                DurationSecs(1_800),
            );
        store.save(&replacement).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.access_token().as_str(), "newer-access-token");
        assert_eq!(loaded.issued(), UnixTime(20_000));
    }

    #[tokio::test]
    async fn corrupt_contents_fail_distinguishably() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        tokio::fs::write(&path, b"{\"schema_version\": 1, \"acce").await.unwrap();

        let mut store = FileTokenStore::new(path);
        assert!(matches!(
            store.load().await,
            Err(StorageError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileTokenStore::new(dir.path().join("token.json"));
        store.save(&sample_record()).await.unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("token.json"))
            .await
            .unwrap();
        let bumped = raw.replace("\"schema_version\": 1", "\"schema_version\": 2");
        tokio::fs::write(dir.path().join("token.json"), bumped)
            .await
            .unwrap();

        assert!(matches!(
            store.load().await,
            Err(StorageError::UnsupportedSchema {
                found: 2,
                supported: 1
            })
        ));
    }

    #[tokio::test]
    async fn interrupted_write_leaves_the_previous_record_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let mut store = FileTokenStore::new(path.clone());
        store.save(&sample_record()).await.unwrap();

        // a crash between temp-write and rename leaves a stray temp file
        tokio::fs::write(dir.path().join("token.tmp"), b"garbage")
            .await
            .unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.access_token().as_str(), "an-access-token");

        // and the next save still lands cleanly
        store.save(&sample_record()).await.unwrap();
        assert!(store.load().await.unwrap().is_some());
    }
}
