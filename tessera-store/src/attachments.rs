//! Content-addressed attachment files.
//!
//! Every attachment body lives in one directory per database, under the
//! name derived from its digest and content type. Identical bytes of the
//! same type therefore share one file, and storing them again is a no-op.
//!
//! ```text
//! <base>/<db>_file/
//!   5d41402abc4b2a76b9719d911017c592.plain
//!   tmpFile_3f1c…          (in flight, swept on open)
//! ```

use std::io;
use std::path::{Path, PathBuf};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use tessera_core::attachment::{decode_inline, encode_base64};
use tessera_core::{
    attachment_file_name, md5_digest, Attachment, DocError, DocumentData, ValidationError,
};

const TEMP_PREFIX: &str = "tmpFile_";
const FILE_REFERENCE_MAX_LEN: usize = 1000;

/// Where attachment files of one database live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentConfig {
    pub dir: PathBuf,
}

impl AttachmentConfig {
    /// `<base>/<name>_file`, keeping only `[A-Za-z0-9_-]` of the name.
    pub fn for_database(base: impl AsRef<Path>, name: &str) -> Self {
        let clean: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        Self {
            dir: base.as_ref().join(format!("{clean}_file")),
        }
    }
}

#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("Attachment not found: {0}")]
    NotFound(String),
    #[error("Attachment I/O failed on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AttachmentError {
    fn io(path: &Path, source: io::Error) -> Self {
        AttachmentError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<AttachmentError> for DocError {
    fn from(err: AttachmentError) -> Self {
        match err {
            AttachmentError::Invalid(e) => DocError::Validation(e),
            AttachmentError::NotFound(name) => DocError::NotFound(name),
            io @ AttachmentError::Io { .. } => DocError::Backend(io.to_string()),
        }
    }
}

/// Result of [`AttachmentStore::read_attachment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentBody {
    Path(PathBuf),
    Base64(String),
}

pub struct AttachmentStore {
    config: AttachmentConfig,
}

impl AttachmentStore {
    /// Create the directory, or sweep temp files a crash left behind.
    pub async fn open(config: AttachmentConfig) -> Result<Self, AttachmentError> {
        let store = Self { config };
        let dir = store.dir();
        if fs::try_exists(dir).await.map_err(|e| AttachmentError::io(dir, e))? {
            let swept = store.clean_temp_files().await?;
            if swept > 0 {
                log::info!("Removed {swept} stale temp files from {}", dir.display());
            }
        } else {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| AttachmentError::io(dir, e))?;
            log::debug!("Created attachment directory {}", dir.display());
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Full path of a stored file name.
    pub fn path_for(&self, file: &str) -> PathBuf {
        self.config.dir.join(file)
    }

    fn temp_path(&self) -> PathBuf {
        self.path_for(&format!("{TEMP_PREFIX}{}", Uuid::new_v4()))
    }

    /// Store every non-stub attachment of a document.
    ///
    /// Attachments are handled concurrently and all of them run to
    /// completion before this returns, so no temp file outlives the call.
    /// Afterwards each descriptor carries `digest`, `length` and the stored
    /// file name in `data`.
    ///
    /// Every file placed in the store is pushed onto `written`, also when a
    /// sibling attachment fails, so the caller can reclaim files of a
    /// document that is never committed.
    pub async fn preprocess(
        &self,
        data: &mut DocumentData,
        written: &mut Vec<String>,
    ) -> Result<(), AttachmentError> {
        if matches!(data.0.get("_attachments"), None | Some(serde_json::Value::Null)) {
            return Ok(());
        }
        let atts = data.attachments()?;
        let results = join_all(atts.into_iter().map(|(name, att)| async move {
            let att = self.store(&name, att).await?;
            Ok::<_, AttachmentError>((name, att))
        }))
        .await;

        let mut stored = Vec::with_capacity(results.len());
        let mut first_err = None;
        for result in results {
            match result {
                Ok((name, att)) => {
                    if !att.stub {
                        written.extend(att.data.clone());
                    }
                    stored.push((name, att));
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        data.set_attachments(stored);
        Ok(())
    }

    async fn store(&self, name: &str, mut att: Attachment) -> Result<Attachment, AttachmentError> {
        if att.stub {
            return Ok(att);
        }
        let Some(data) = att.data.take() else {
            return Err(ValidationError::BadAttachment {
                name: name.to_string(),
                reason: "attachment has no data".into(),
            }
            .into());
        };

        let (digest, length, file) = match file_reference(&data).await {
            Some(source) => self.store_file(source, &att.content_type).await?,
            None => self.store_inline(name, &data, &att.content_type).await?,
        };
        log::trace!("Stored attachment {name} as {file} ({length} bytes)");
        att.digest = Some(digest);
        att.length = Some(length);
        att.data = Some(file);
        Ok(att)
    }

    async fn store_inline(
        &self,
        name: &str,
        data: &str,
        content_type: &str,
    ) -> Result<(String, u64, String), AttachmentError> {
        let bytes = decode_inline(name, data)?;
        let digest = md5_digest(&bytes);
        let file = attachment_file_name(&digest, content_type)?;
        let target = self.path_for(&file);

        if !exists(&target).await? {
            // write then rename, so readers never see a partial body
            let temp = self.temp_path();
            let written = match fs::write(&temp, &bytes).await {
                Ok(()) => place(&temp, &target).await,
                Err(e) => Err(AttachmentError::io(&temp, e)),
            };
            remove_quietly(&temp).await;
            written?;
        }
        Ok((digest, bytes.len() as u64, file))
    }

    async fn store_file(
        &self,
        source: &Path,
        content_type: &str,
    ) -> Result<(String, u64, String), AttachmentError> {
        let temp = self.temp_path();
        let result = self.place_copied(source, &temp, content_type).await;
        remove_quietly(&temp).await;
        result
    }

    async fn place_copied(
        &self,
        source: &Path,
        temp: &Path,
        content_type: &str,
    ) -> Result<(String, u64, String), AttachmentError> {
        fs::copy(source, temp)
            .await
            .map_err(|e| AttachmentError::io(source, e))?;
        let length = fs::metadata(temp)
            .await
            .map_err(|e| AttachmentError::io(temp, e))?
            .len();
        let bytes = fs::read(temp).await.map_err(|e| AttachmentError::io(temp, e))?;
        let digest = md5_digest(&bytes);
        let file = attachment_file_name(&digest, content_type)?;
        let target = self.path_for(&file);
        if !exists(&target).await? {
            place(temp, &target).await?;
        }
        Ok((digest, length, file))
    }

    /// Resolved path, or the base64 contents, of a stored file.
    pub async fn read_attachment(
        &self,
        file: &str,
        as_path: bool,
    ) -> Result<AttachmentBody, AttachmentError> {
        if file.contains('/') || file.contains('\\') || file.starts_with('.') {
            return Err(AttachmentError::NotFound(file.to_string()));
        }
        let path = self.path_for(file);
        if !exists(&path).await? {
            return Err(AttachmentError::NotFound(file.to_string()));
        }
        if as_path {
            return Ok(AttachmentBody::Path(path));
        }
        let bytes = fs::read(&path).await.map_err(|e| AttachmentError::io(&path, e))?;
        Ok(AttachmentBody::Base64(encode_base64(&bytes)))
    }

    /// Delete a stored file no revision references any more.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn delete_attachment(&self, file: &str) {
        let path = self.path_for(file);
        match fs::remove_file(&path).await {
            Ok(()) => log::debug!("Deleted orphaned attachment {file}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to delete attachment {}: {e}", path.display()),
        }
    }

    /// Remove leftover temp files; returns how many were removed.
    pub async fn clean_temp_files(&self) -> Result<usize, AttachmentError> {
        let dir = self.dir();
        let mut entries = fs::read_dir(dir).await.map_err(|e| AttachmentError::io(dir, e))?;
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AttachmentError::io(dir, e))?
        {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if is_temp {
                match fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => log::warn!("Failed to remove temp file {}: {e}", entry.path().display()),
                }
            }
        }
        Ok(removed)
    }

    /// Remove the whole attachment directory.
    pub async fn destroy(self) -> Result<(), AttachmentError> {
        let dir = self.config.dir;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AttachmentError::io(&dir, e)),
        }
    }
}

/// Path named by a `data` string that points at a file instead of
/// carrying base64: a `file://` URL, or an absolute path that exists.
async fn file_reference(data: &str) -> Option<&Path> {
    if data.len() >= FILE_REFERENCE_MAX_LEN {
        return None;
    }
    if let Some(path) = data.strip_prefix("file://") {
        return Some(Path::new(path));
    }
    if data.starts_with('/') && fs::try_exists(data).await.unwrap_or(false) {
        return Some(Path::new(data));
    }
    None
}

async fn exists(path: &Path) -> Result<bool, AttachmentError> {
    fs::try_exists(path)
        .await
        .map_err(|e| AttachmentError::io(path, e))
}

/// Move `temp` onto `target`. Losing a race to an identical file is fine.
async fn place(temp: &Path, target: &Path) -> Result<(), AttachmentError> {
    match fs::rename(temp, target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => {
            if exists(target).await? {
                Ok(())
            } else {
                Err(AttachmentError::io(target, e))
            }
        }
    }
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove temp file {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const HELLO: &str = "md5-XUFAKrxLKna5cZ2REBfFkg==";
    const HELLO_FILE: &str = "5d41402abc4b2a76b9719d911017c592.plain";

    fn doc_with(atts: serde_json::Value) -> DocumentData {
        DocumentData(json!({ "_attachments": atts }).as_object().cloned().unwrap())
    }

    fn temp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(TEMP_PREFIX)
            })
            .count()
    }

    #[test]
    fn test_config_for_database() {
        let config = AttachmentConfig::for_database("/data", "my db/..v2");
        assert_eq!(config.dir, PathBuf::from("/data/mydbv2_file"));
        let config = AttachmentConfig::for_database("/data", "users_db-1");
        assert_eq!(config.dir, PathBuf::from("/data/users_db-1_file"));
    }

    #[tokio::test]
    async fn test_inline_attachment_stored_by_digest() {
        let tmp = tempdir().unwrap();
        let store = AttachmentStore::open(AttachmentConfig::for_database(tmp.path(), "db"))
            .await
            .unwrap();

        let mut data = doc_with(json!({
            "hello.txt": { "content_type": "text/plain", "data": "aGVsbG8=" }
        }));
        store.preprocess(&mut data, &mut Vec::new()).await.unwrap();

        let (_, att) = data.attachments().unwrap().remove(0);
        assert_eq!(att.digest.as_deref(), Some(HELLO));
        assert_eq!(att.length, Some(5));
        assert_eq!(att.data.as_deref(), Some(HELLO_FILE));
        assert_eq!(std::fs::read(store.path_for(HELLO_FILE)).unwrap(), b"hello");
        assert_eq!(temp_files(store.dir()), 0);
    }

    #[tokio::test]
    async fn test_same_bytes_share_one_file() {
        let tmp = tempdir().unwrap();
        let store = AttachmentStore::open(AttachmentConfig::for_database(tmp.path(), "db"))
            .await
            .unwrap();

        let mut data = doc_with(json!({
            "a.txt": { "content_type": "text/plain", "data": "aGVsbG8=" },
            "b.txt": { "content_type": "text/plain", "data": "data:text/plain;base64,aGVsbG8=" }
        }));
        store.preprocess(&mut data, &mut Vec::new()).await.unwrap();
        let mut again = doc_with(json!({
            "c.txt": { "content_type": "text/plain", "data": "aGVsbG8=" }
        }));
        store.preprocess(&mut again, &mut Vec::new()).await.unwrap();

        let files: Vec<_> = std::fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let names: Vec<String> = data
            .attachments()
            .unwrap()
            .into_iter()
            .chain(again.attachments().unwrap())
            .map(|(_, att)| att.data.unwrap())
            .collect();
        assert!(names.iter().all(|n| n == HELLO_FILE));
    }

    #[tokio::test]
    async fn test_file_reference_copied_and_temp_removed() {
        let tmp = tempdir().unwrap();
        let source = tmp.path().join("upload.bin");
        std::fs::write(&source, b"hello").unwrap();
        let store = AttachmentStore::open(AttachmentConfig::for_database(tmp.path(), "db"))
            .await
            .unwrap();

        let reference = format!("file://{}", source.display());
        let mut data = doc_with(json!({
            "upload": { "content_type": "text/plain", "data": reference }
        }));
        store.preprocess(&mut data, &mut Vec::new()).await.unwrap();

        let (_, att) = data.attachments().unwrap().remove(0);
        assert_eq!(att.digest.as_deref(), Some(HELLO));
        assert_eq!(att.length, Some(5));
        assert!(store.path_for(HELLO_FILE).exists());
        // the source is copied, not moved
        assert!(source.exists());
        assert_eq!(temp_files(store.dir()), 0);
    }

    #[tokio::test]
    async fn test_missing_file_reference_fails_without_leftovers() {
        let tmp = tempdir().unwrap();
        let store = AttachmentStore::open(AttachmentConfig::for_database(tmp.path(), "db"))
            .await
            .unwrap();
        let mut data = doc_with(json!({
            "gone": { "content_type": "text/plain", "data": "file:///nonexistent/tessera/upload" }
        }));
        let err = store.preprocess(&mut data, &mut Vec::new()).await.unwrap_err();
        assert!(matches!(err, AttachmentError::Io { .. }));
        assert_eq!(temp_files(store.dir()), 0);
    }

    #[tokio::test]
    async fn test_stub_passes_through() {
        let tmp = tempdir().unwrap();
        let store = AttachmentStore::open(AttachmentConfig::for_database(tmp.path(), "db"))
            .await
            .unwrap();
        let mut data = doc_with(json!({
            "a.txt": { "content_type": "text/plain", "digest": HELLO, "stub": true }
        }));
        let before = data.clone();
        store.preprocess(&mut data, &mut Vec::new()).await.unwrap();
        assert_eq!(data.attachments().unwrap(), before.attachments().unwrap());
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_non_object_attachments_rejected() {
        let tmp = tempdir().unwrap();
        let store = AttachmentStore::open(AttachmentConfig::for_database(tmp.path(), "db"))
            .await
            .unwrap();
        for bad in [json!(5), json!("a.txt"), json!([{ "data": "aGVsbG8=" }])] {
            let mut data = doc_with(bad);
            let err = store.preprocess(&mut data, &mut Vec::new()).await.unwrap_err();
            assert_eq!(DocError::from(err).status(), 400);
        }

        // an explicit null is the same as no attachments
        let mut data = doc_with(serde_json::Value::Null);
        store.preprocess(&mut data, &mut Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_written_files_reported_when_sibling_fails() {
        let tmp = tempdir().unwrap();
        let store = AttachmentStore::open(AttachmentConfig::for_database(tmp.path(), "db"))
            .await
            .unwrap();
        let mut data = doc_with(json!({
            "good.txt": { "content_type": "text/plain", "data": "aGVsbG8=" },
            "bad.txt": { "content_type": "text/plain", "data": "not base64!" },
            "old.txt": { "content_type": "text/plain", "digest": HELLO, "stub": true }
        }));
        let mut written = Vec::new();
        assert!(store.preprocess(&mut data, &mut written).await.is_err());
        assert_eq!(written, vec![HELLO_FILE.to_string()]);
        assert!(store.path_for(HELLO_FILE).exists());
    }

    #[tokio::test]
    async fn test_bad_base64_is_validation_error() {
        let tmp = tempdir().unwrap();
        let store = AttachmentStore::open(AttachmentConfig::for_database(tmp.path(), "db"))
            .await
            .unwrap();
        let mut data = doc_with(json!({
            "a.txt": { "content_type": "text/plain", "data": "not base64!" }
        }));
        let err = store.preprocess(&mut data, &mut Vec::new()).await.unwrap_err();
        assert!(matches!(
            DocError::from(err),
            DocError::Validation(ValidationError::BadAttachment { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_and_delete() {
        let tmp = tempdir().unwrap();
        let store = AttachmentStore::open(AttachmentConfig::for_database(tmp.path(), "db"))
            .await
            .unwrap();
        let mut data = doc_with(json!({
            "a.txt": { "content_type": "text/plain", "data": "aGVsbG8=" }
        }));
        store.preprocess(&mut data, &mut Vec::new()).await.unwrap();

        assert_eq!(
            store.read_attachment(HELLO_FILE, false).await.unwrap(),
            AttachmentBody::Base64("aGVsbG8=".into())
        );
        assert_eq!(
            store.read_attachment(HELLO_FILE, true).await.unwrap(),
            AttachmentBody::Path(store.path_for(HELLO_FILE))
        );
        assert!(matches!(
            store.read_attachment("../escape", false).await,
            Err(AttachmentError::NotFound(_))
        ));

        store.delete_attachment(HELLO_FILE).await;
        assert!(matches!(
            store.read_attachment(HELLO_FILE, false).await,
            Err(AttachmentError::NotFound(_))
        ));
        // deleting twice is harmless
        store.delete_attachment(HELLO_FILE).await;
    }

    #[tokio::test]
    async fn test_open_sweeps_temp_files_and_destroy() {
        let tmp = tempdir().unwrap();
        let config = AttachmentConfig::for_database(tmp.path(), "db");
        std::fs::create_dir_all(&config.dir).unwrap();
        std::fs::write(config.dir.join("tmpFile_stale"), b"x").unwrap();
        std::fs::write(config.dir.join(HELLO_FILE), b"hello").unwrap();

        let store = AttachmentStore::open(config.clone()).await.unwrap();
        assert_eq!(temp_files(store.dir()), 0);
        assert!(store.path_for(HELLO_FILE).exists());

        store.destroy().await.unwrap();
        assert!(!config.dir.exists());
    }
}
