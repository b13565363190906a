//! Streaming encryption of uploaded file parts into the staging area.
//!
//! Each part is encrypted for the system key while it is read, so the
//! plaintext never touches disk. Once the stream ends the symmetric key is
//! wrapped for every certificate in the keyring and the ciphertext is
//! committed under its content id, next to a JSON sidecar carrying the
//! wrapped keys for the key custodian.
//!
//! ```text
//! upload/<batch>/upload.tmp           while streaming
//! upload/<batch>/<content_id>         committed ciphertext
//! upload/<batch>/<content_id>.json    StagedDescriptor
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use reception_shared::constants::{
    ACTION_ADD_DOMAIN_KEY, CIPHER_FORMAT, DOMAIN_KEY_CUSTODIAN, DOMAIN_MESSAGES,
};
use reception_shared::keywrap::wrap_key;
use reception_shared::{DomainSignature, RecipientCertificate, StreamEncryptor, SymmetricKey};

use crate::error::ReceptionError;
use crate::keyring::KeyringCache;
use crate::staging::{BatchId, StagingArea};

const TEMP_NAME: &str = "upload.tmp";

/// Public description of an encrypted file, as attached to the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub content_id: String,
    pub filename: String,
    pub mimetype: String,
    pub created: i64,
    pub plaintext_size: u64,
    pub ciphertext_size: u64,
    pub key_reference: String,
    pub format: String,
    /// Stream header (ephemeral key and nonce), hex.
    pub header: String,
}

/// Key material the custodian needs to serve a file key later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub domain: String,
    pub action: String,
    pub signature: DomainSignature,
    /// Certificate fingerprint to base64 wrapped key.
    pub keys: BTreeMap<String, String>,
}

/// Sidecar persisted next to staged ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedDescriptor {
    pub keys: KeyBundle,
    pub key_reference: String,
    pub content_id: String,
    pub retry: u32,
    pub created: i64,
}

#[derive(Debug, Clone)]
pub struct FileArtifact {
    pub descriptor: FileDescriptor,
    pub wrapped_keys: BTreeMap<String, String>,
}

/// Deletes the temp file unless the upload reached its commit rename.
struct TempFile {
    path: PathBuf,
    committed: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed partial upload"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove partial upload"),
        }
    }
}

pub struct StreamCipherIntake {
    staging: StagingArea,
    keyring: Arc<KeyringCache>,
    system_public_key: [u8; 32],
    permits: Semaphore,
}

impl StreamCipherIntake {
    pub fn new(
        staging: StagingArea,
        keyring: Arc<KeyringCache>,
        system_public_key: [u8; 32],
        concurrency: usize,
    ) -> Self {
        Self {
            staging,
            keyring,
            system_public_key,
            permits: Semaphore::new(concurrency.max(1)),
        }
    }

    /// Whether the keyring holds at least one certificate to wrap for.
    pub fn keys_available(&self) -> bool {
        !self.keyring.is_empty()
    }

    /// Encrypt one file part into the batch's staging directory.
    ///
    /// Waits for an intake slot when all are busy.
    pub async fn receive_file<S, E>(
        &self,
        batch: &BatchId,
        filename: &str,
        mimetype: &str,
        stream: S,
    ) -> Result<FileArtifact, ReceptionError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ReceptionError::Internal("intake closed".to_string()))?;

        let dir = self.staging.batch_dir(batch)?;
        fs::create_dir_all(&dir).await?;

        let temp_path = dir.join(TEMP_NAME);
        let mut temp = TempFile::new(temp_path.clone());
        let mut file = fs::File::create(&temp_path).await?;

        let mut encryptor = StreamEncryptor::new(&self.system_public_key);
        let mut plaintext_size = 0u64;
        let mut ciphertext_size = 0u64;

        let mut stream = std::pin::pin!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| ReceptionError::BadRequest(format!("Failed to read file part: {e}")))?;
            plaintext_size += chunk.len() as u64;

            let sealed = encryptor.update(&chunk)?;
            if !sealed.is_empty() {
                file.write_all(&sealed).await?;
                ciphertext_size += sealed.len() as u64;
            }
        }

        let (last, seal) = encryptor.finalize()?;
        file.write_all(&last).await?;
        ciphertext_size += last.len() as u64;
        file.sync_all().await?;
        drop(file);

        let wrapped_keys = wrap_for_recipients(&self.keyring.certificates(), &seal.key)?;
        let signature = DomainSignature::sign(&seal.key, &[DOMAIN_MESSAGES], &seal.header);
        let key_reference = signature.key_reference();

        let content_path = dir.join(&seal.content_id);
        fs::rename(&temp_path, &content_path).await?;
        temp.commit();

        let created = Utc::now().timestamp();
        let staged = StagedDescriptor {
            keys: KeyBundle {
                domain: DOMAIN_KEY_CUSTODIAN.to_string(),
                action: ACTION_ADD_DOMAIN_KEY.to_string(),
                signature,
                keys: wrapped_keys.clone(),
            },
            key_reference: key_reference.clone(),
            content_id: seal.content_id.clone(),
            retry: 0,
            created,
        };

        let sidecar = dir.join(format!("{}.json", seal.content_id));
        if let Err(e) = write_json(&sidecar, &staged).await {
            if let Err(cleanup) = fs::remove_file(&content_path).await {
                warn!(path = %content_path.display(), error = %cleanup, "Failed to remove orphan ciphertext");
            }
            return Err(e);
        }

        info!(
            batch = %batch,
            content_id = %seal.content_id,
            plaintext_size,
            ciphertext_size,
            recipients = wrapped_keys.len(),
            "File part encrypted"
        );

        Ok(FileArtifact {
            descriptor: FileDescriptor {
                content_id: seal.content_id,
                filename: filename.to_string(),
                mimetype: mimetype.to_string(),
                created,
                plaintext_size,
                ciphertext_size,
                key_reference,
                format: CIPHER_FORMAT.to_string(),
                header: hex::encode(&seal.header),
            },
            wrapped_keys,
        })
    }
}

fn wrap_for_recipients(
    certificates: &[RecipientCertificate],
    key: &SymmetricKey,
) -> Result<BTreeMap<String, String>, ReceptionError> {
    let mut wrapped = BTreeMap::new();
    for certificate in certificates {
        let (bytes, fingerprint) = wrap_key(certificate, key)?;
        wrapped.insert(fingerprint, BASE64.encode(bytes));
    }

    if wrapped.is_empty() {
        return Err(ReceptionError::NoRecipients);
    }
    Ok(wrapped)
}

/// Write JSON through a temp name so scanners never see a partial file.
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ReceptionError> {
    let bytes = serde_json::to_vec(value)?;
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    fs::write(&partial, &bytes).await?;
    if let Err(e) = fs::rename(&partial, path).await {
        if let Err(cleanup) = fs::remove_file(&partial).await {
            warn!(path = %partial.display(), error = %cleanup, "Failed to remove partial JSON");
        }
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use reception_shared::keywrap::unwrap_key;
    use reception_shared::stream::{open_stream, recover_key};
    use std::io;

    fn chunks(parts: Vec<Vec<u8>>) -> impl Stream<Item = Result<Bytes, io::Error>> {
        futures::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from(p))))
    }

    async fn entries(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(mut read) = fs::read_dir(dir).await else {
            return names;
        };
        while let Some(entry) = read.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_sizes_and_disk_layout() {
        let harness = Harness::new(|_| None).await;
        let batch = BatchId::generate();
        let parts = vec![vec![1u8; 70_000], vec![2u8; 10], vec![3u8; 65_536]];
        let plaintext: Vec<u8> = parts.concat();

        let artifact = harness
            .state
            .intake
            .receive_file(&batch, "photo.jpg", "image/jpeg", chunks(parts))
            .await
            .unwrap();
        let descriptor = &artifact.descriptor;

        assert_eq!(descriptor.plaintext_size, plaintext.len() as u64);
        assert_eq!(descriptor.format, CIPHER_FORMAT);

        let dir = harness.staging.batch_dir(&batch).unwrap();
        let on_disk = fs::read(dir.join(&descriptor.content_id)).await.unwrap();
        assert_eq!(on_disk.len() as u64, descriptor.ciphertext_size);
        assert_eq!(
            blake3::hash(&on_disk).to_hex().to_string(),
            descriptor.content_id
        );

        let mut expected = vec![descriptor.content_id.clone(), format!("{}.json", descriptor.content_id)];
        expected.sort();
        assert_eq!(entries(&dir).await, expected);

        // The system key opens the stream directly.
        let header = hex::decode(&descriptor.header).unwrap();
        let key = recover_key(&harness.system_secret, &header).unwrap();
        assert_eq!(open_stream(&key, &header, &on_disk).unwrap(), plaintext);

        // So does the key wrapped for the keyring recipient.
        let wrapped = &artifact.wrapped_keys[&harness.recipient.fingerprint()];
        let unwrapped = unwrap_key(&harness.recipient_secret, &BASE64.decode(wrapped).unwrap()).unwrap();
        assert_eq!(unwrapped, key);
    }

    #[tokio::test]
    async fn test_sidecar_contents() {
        let harness = Harness::new(|_| None).await;
        let batch = BatchId::generate();

        let artifact = harness
            .state
            .intake
            .receive_file(&batch, "a.txt", "text/plain", chunks(vec![b"hello".to_vec()]))
            .await
            .unwrap();

        let dir = harness.staging.batch_dir(&batch).unwrap();
        let raw = fs::read(dir.join(format!("{}.json", artifact.descriptor.content_id)))
            .await
            .unwrap();
        let staged: StagedDescriptor = serde_json::from_slice(&raw).unwrap();

        assert_eq!(staged.retry, 0);
        assert_eq!(staged.content_id, artifact.descriptor.content_id);
        assert_eq!(staged.key_reference, artifact.descriptor.key_reference);
        assert_eq!(staged.keys.domain, DOMAIN_KEY_CUSTODIAN);
        assert_eq!(staged.keys.signature.domains, vec![DOMAIN_MESSAGES.to_string()]);
        assert_eq!(staged.keys.keys, artifact.wrapped_keys);
    }

    #[tokio::test]
    async fn test_empty_stream_still_sealed() {
        let harness = Harness::new(|_| None).await;
        let batch = BatchId::generate();

        let artifact = harness
            .state
            .intake
            .receive_file(&batch, "empty", "application/octet-stream", chunks(vec![]))
            .await
            .unwrap();

        assert_eq!(artifact.descriptor.plaintext_size, 0);
        assert!(artifact.descriptor.ciphertext_size > 0);
    }

    #[tokio::test]
    async fn test_no_recipients_leaves_nothing() {
        let harness = Harness::empty(|_| None).await;
        let batch = BatchId::generate();

        let result = harness
            .state
            .intake
            .receive_file(&batch, "a.txt", "text/plain", chunks(vec![b"data".to_vec()]))
            .await;

        assert!(matches!(result, Err(ReceptionError::NoRecipients)));
        let dir = harness.staging.batch_dir(&batch).unwrap();
        assert!(entries(&dir).await.is_empty());
    }

    /// A part that never ends, reporting when intake first reads from it.
    fn stalled(started: tokio::sync::oneshot::Sender<()>) -> impl Stream<Item = Result<Bytes, io::Error>> {
        let mut started = Some(started);
        futures::stream::poll_fn(move |_| {
            if let Some(tx) = started.take() {
                let _ = tx.send(());
            }
            std::task::Poll::Pending
        })
    }

    #[tokio::test]
    async fn test_full_intake_waits_without_blocking_submissions() {
        use crate::message::parse;
        use serde_json::json;
        use std::time::Duration;

        let harness = Harness::new(|_| Some(json!({ "ok": true }))).await;

        let mut holders = Vec::new();
        for _ in 0..5 {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let intake = harness.state.intake.clone();
            holders.push(tokio::spawn(async move {
                intake
                    .receive_file(&BatchId::generate(), "big.bin", "application/octet-stream", stalled(tx))
                    .await
            }));
            rx.await.unwrap();
        }

        // A sixth upload waits for a slot instead of failing.
        let batch = BatchId::generate();
        let waiting = tokio::time::timeout(
            Duration::from_millis(200),
            harness
                .state
                .intake
                .receive_file(&batch, "a.txt", "text/plain", chunks(vec![b"queued".to_vec()])),
        )
        .await;
        assert!(waiting.is_err());

        // Submissions have their own bound.
        let message = parse(json!({ "destinataires": "alice", "contenu": "hi" })).unwrap();
        let submitted = tokio::time::timeout(
            Duration::from_secs(2),
            harness.state.submitter.submit(&message, None, Vec::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(submitted.is_accepted());

        for holder in &holders {
            holder.abort();
        }
        for holder in holders {
            assert!(holder.await.unwrap_err().is_cancelled());
        }

        let artifact = harness
            .state
            .intake
            .receive_file(&batch, "a.txt", "text/plain", chunks(vec![b"queued".to_vec()]))
            .await
            .unwrap();
        assert_eq!(artifact.descriptor.plaintext_size, 6);
    }

    #[tokio::test]
    async fn test_write_json_failed_rename_leaves_no_partial() {
        let dir = tempfile::TempDir::new().unwrap();
        // A non-empty directory in the way makes the final rename fail.
        let target = dir.path().join("descriptor.json");
        fs::create_dir_all(target.join("occupied")).await.unwrap();

        let result = write_json(&target, &serde_json::json!({ "retry": 0 })).await;

        assert!(matches!(result, Err(ReceptionError::Staging(_))));
        assert_eq!(entries(dir.path()).await, vec!["descriptor.json".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_error_removes_temp() {
        let harness = Harness::new(|_| None).await;
        let batch = BatchId::generate();
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);

        let result = harness
            .state
            .intake
            .receive_file(&batch, "a.txt", "text/plain", stream)
            .await;

        assert!(matches!(result, Err(ReceptionError::BadRequest(_))));
        let dir = harness.staging.batch_dir(&batch).unwrap();
        assert!(entries(&dir).await.is_empty());
    }
}
