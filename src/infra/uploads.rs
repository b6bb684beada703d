//! Filesystem blob store.

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hmac::{Hmac, Mac, digest::KeyInit};
use sha2::{Digest, Sha256};
use slug::slugify;
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::application::blobs::{BlobError, BlobStore, BlobUpload, StoredBlob};
use crate::config::UploadsSettings;
use crate::domain::uploads::BlobRef;

/// Blob store writing payloads below a root directory.
///
/// References are relative paths of the form `{yyyy}/{mm}/{dd}/{uuid}-{name}`,
/// so they are unguessable and never reused. Serving URLs carry an
/// HMAC-SHA256 signature over reference, expiry and size hint.
pub struct FsBlobStore {
    root: PathBuf,
    public_base_url: Url,
    max_bytes: u64,
    signer: Hmac<Sha256>,
    url_ttl: Duration,
}

impl fmt::Debug for FsBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsBlobStore")
            .field("root", &self.root)
            .field("public_base_url", &self.public_base_url.as_str())
            .field("max_bytes", &self.max_bytes)
            .field("url_ttl", &self.url_ttl)
            .finish_non_exhaustive()
    }
}

impl FsBlobStore {
    /// Initialise storage rooted at the configured directory, creating it if necessary.
    pub fn new(settings: &UploadsSettings) -> Result<Self, io::Error> {
        let signer = <Hmac<Sha256> as KeyInit>::new_from_slice(settings.signing_key.as_bytes())
            .map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("uploads signing key rejected: {err}"),
                )
            })?;
        std::fs::create_dir_all(&settings.directory)?;
        Ok(Self {
            root: settings.directory.clone(),
            public_base_url: settings.public_base_url.clone(),
            max_bytes: settings.max_request_bytes.get(),
            signer,
            url_ttl: settings.url_ttl,
        })
    }

    /// Obtain the absolute filesystem path for a stored blob.
    pub fn absolute_path(&self, reference: &BlobRef) -> Result<PathBuf, BlobError> {
        self.resolve(reference.as_str())
    }

    /// Check a signed serving URL produced by [`BlobStore::url_for`].
    pub fn verify_url(&self, url: &Url, now: OffsetDateTime) -> bool {
        let Some(relative) = self.public_base_url.make_relative(url) else {
            return false;
        };
        let reference = relative.split('?').next().unwrap_or_default();
        let mut expires = None;
        let mut size = None;
        let mut signature = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "expires" => expires = value.parse::<i64>().ok(),
                "size" => size = value.parse::<u32>().ok(),
                "sig" => signature = Some(value.into_owned()),
                _ => {}
            }
        }
        let (Some(expires), Some(signature)) = (expires, signature) else {
            return false;
        };
        if expires < now.unix_timestamp() {
            return false;
        }
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        self.mac_for(reference, expires, size)
            .verify_slice(&signature)
            .is_ok()
    }

    fn mac_for(&self, reference: &str, expires: i64, size: Option<u32>) -> Hmac<Sha256> {
        let mut mac = self.signer.clone();
        mac.update(reference.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac.update(b"\n");
        if let Some(size) = size {
            mac.update(size.to_string().as_bytes());
        }
        mac
    }

    fn sign(&self, reference: &str, expires: i64, size: Option<u32>) -> String {
        hex::encode(self.mac_for(reference, expires, size).finalize().into_bytes())
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(reference);
        if reference.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(BlobError::InvalidReference {
                reference: reference.to_string(),
            });
        }

        Ok(self.root.join(relative))
    }

    fn build_reference(original_name: &str) -> String {
        let (year, month, day) = OffsetDateTime::now_utc().to_calendar_date();
        let directory = format!("{year}/{:02}/{:02}", month as u8, day);
        let identifier = Uuid::new_v4();
        let filename = sanitize_filename(original_name);
        format!("{directory}/{identifier}-{filename}")
    }

    async fn discard(path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            debug!(path = %path.display(), error = %err, "Failed to discard partial blob");
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn store(&self, upload: BlobUpload) -> Result<StoredBlob, BlobError> {
        let BlobUpload {
            filename,
            content_type,
            mut body,
        } = upload;
        let reference = Self::build_reference(&filename);
        let absolute = self.resolve(&reference)?;

        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&absolute).await?;
        let mut hasher = Sha256::new();
        let mut total_bytes: u64 = 0;

        while let Some(chunk) = body.next().await {
            let written = match chunk {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => {
                    total_bytes = total_bytes
                        .checked_add(chunk.len() as u64)
                        .ok_or(BlobError::SizeOverflow)?;
                    if total_bytes > self.max_bytes {
                        Err(BlobError::PayloadTooLarge {
                            limit: self.max_bytes,
                        })
                    } else {
                        hasher.update(&chunk);
                        file.write_all(&chunk).await.map_err(BlobError::from)
                    }
                }
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                drop(file);
                Self::discard(&absolute).await;
                return Err(err);
            }
        }

        file.flush().await?;
        drop(file);

        if total_bytes == 0 {
            Self::discard(&absolute).await;
            return Err(BlobError::EmptyPayload);
        }

        let size = i64::try_from(total_bytes).map_err(|_| BlobError::SizeOverflow)?;
        let content_type = content_type
            .map(|declared| declared.trim().to_string())
            .filter(|declared| !declared.is_empty())
            .unwrap_or_else(|| {
                mime_guess::from_path(&filename)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });

        info!(reference = %reference, size, content_type = %content_type, "Blob stored");

        Ok(StoredBlob {
            reference: BlobRef::new(reference),
            content_type,
            hash: hex::encode(hasher.finalize()),
            filename,
            size,
        })
    }

    async fn fetch(&self, reference: &BlobRef) -> Result<Bytes, BlobError> {
        let absolute = self.resolve(reference.as_str())?;
        match fs::read(&absolute).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                reference: reference.clone(),
            }),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    fn url_for(&self, reference: &BlobRef, size_hint: Option<u32>) -> Result<Url, BlobError> {
        self.resolve(reference.as_str())?;
        let mut url = self
            .public_base_url
            .join(reference.as_str())
            .map_err(|_| BlobError::InvalidReference {
                reference: reference.to_string(),
            })?;
        let ttl = i64::try_from(self.url_ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = OffsetDateTime::now_utc().unix_timestamp().saturating_add(ttl);
        let signature = self.sign(reference.as_str(), expires, size_hint);
        {
            let mut query = url.query_pairs_mut();
            if let Some(size) = size_hint {
                query.append_pair("size", &size.to_string());
            }
            query.append_pair("expires", &expires.to_string());
            query.append_pair("sig", &signature);
        }
        Ok(url)
    }

    async fn delete(&self, reference: &BlobRef) -> Result<(), BlobError> {
        let absolute = self.resolve(reference.as_str())?;
        match fs::remove_file(&absolute).await {
            Ok(()) => {
                debug!(reference = %reference, "Blob deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                reference: reference.clone(),
            }),
            Err(err) => Err(BlobError::Io(err)),
        }
    }
}

fn sanitize_filename(original: &str) -> String {
    let path = Path::new(original);
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("upload");
    let mut base = slugify(stem);
    if base.is_empty() {
        base = "upload".to_string();
    }

    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.trim_matches('.').to_ascii_lowercase())
        .filter(|value| !value.is_empty());

    match extension {
        Some(ext) => format!("{base}.{ext}"),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;

    use futures::stream;
    use tempfile::TempDir;

    use super::*;

    fn settings(dir: &TempDir, limit: u64) -> UploadsSettings {
        keyed_settings(dir, limit, "test-key")
    }

    fn keyed_settings(dir: &TempDir, limit: u64, signing_key: &str) -> UploadsSettings {
        UploadsSettings {
            directory: dir.path().to_path_buf(),
            public_base_url: Url::parse("https://cdn.example.test/media/").expect("valid url"),
            max_request_bytes: NonZeroU64::new(limit).expect("non-zero"),
            signing_key: signing_key.into(),
            url_ttl: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn stores_hashes_and_fetches() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsBlobStore::new(&settings(&dir, 1024)).expect("store");

        let stored = store
            .store(BlobUpload::from_bytes("My Photo.PNG", None, "hello"))
            .await
            .expect("stored");

        assert_eq!(stored.size, 5);
        assert_eq!(stored.content_type, "image/png");
        assert_eq!(
            stored.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(stored.reference.as_str().ends_with("-my-photo.png"));
        assert_eq!(
            store.fetch(&stored.reference).await.expect("fetch"),
            Bytes::from_static(b"hello")
        );
    }

    #[tokio::test]
    async fn declared_content_type_wins() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsBlobStore::new(&settings(&dir, 1024)).expect("store");
        let stored = store
            .store(BlobUpload::from_bytes(
                "app.js",
                Some("text/plain".into()),
                "let a;",
            ))
            .await
            .expect("stored");
        assert_eq!(stored.content_type, "text/plain");
    }

    #[tokio::test]
    async fn rejects_empty_and_oversized_payloads() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsBlobStore::new(&settings(&dir, 4)).expect("store");

        let empty = store
            .store(BlobUpload::from_bytes("a.txt", None, Bytes::new()))
            .await;
        assert!(matches!(empty, Err(BlobError::EmptyPayload)));

        let chunks = vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"de"))];
        let upload = BlobUpload {
            filename: "big.bin".into(),
            content_type: None,
            body: stream::iter(chunks).boxed(),
        };
        assert!(matches!(
            store.store(upload).await,
            Err(BlobError::PayloadTooLarge { limit: 4 })
        ));

        let mut leftovers = Vec::new();
        let mut pending = vec![dir.path().to_path_buf()];
        while let Some(next) = pending.pop() {
            for entry in std::fs::read_dir(next).expect("readable") {
                let path = entry.expect("entry").path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    leftovers.push(path);
                }
            }
        }
        assert!(leftovers.is_empty(), "partial files left: {leftovers:?}");
    }

    #[tokio::test]
    async fn rejects_traversal_and_reports_missing() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsBlobStore::new(&settings(&dir, 1024)).expect("store");

        let escaped = BlobRef::new("../etc/passwd");
        assert!(matches!(
            store.fetch(&escaped).await,
            Err(BlobError::InvalidReference { .. })
        ));
        assert!(matches!(
            store.delete(&BlobRef::new("/abs")).await,
            Err(BlobError::InvalidReference { .. })
        ));
        assert!(matches!(
            store.delete(&BlobRef::new("2024/01/01/missing.bin")).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn urls_are_signed_and_expire() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsBlobStore::new(&settings(&dir, 1024)).expect("store");
        let stored = store
            .store(BlobUpload::from_bytes("a.png", None, "png"))
            .await
            .expect("stored");

        let url = store.url_for(&stored.reference, Some(320)).expect("url");
        assert!(url.as_str().starts_with("https://cdn.example.test/media/"));
        assert!(url.query_pairs().any(|(name, value)| name == "size" && value == "320"));
        assert!(store.verify_url(&url, OffsetDateTime::now_utc()));

        let later = OffsetDateTime::now_utc() + time::Duration::hours(1);
        assert!(!store.verify_url(&url, later));

        let mut tampered = url.clone();
        tampered.set_query(Some("size=1024&expires=9999999999&sig=00"));
        assert!(!store.verify_url(&tampered, OffsetDateTime::now_utc()));
    }

    #[tokio::test]
    async fn signatures_are_hmac_bound_to_the_signing_key() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsBlobStore::new(&keyed_settings(&dir, 1024, "k")).expect("store");
        let other = FsBlobStore::new(&keyed_settings(&dir, 1024, "other-key")).expect("store");
        let stored = store
            .store(BlobUpload::from_bytes("a.png", None, "png"))
            .await
            .expect("stored");

        let url = store.url_for(&stored.reference, None).expect("url");
        let (expires, signature) = signed_parts(&url);

        let bare_hash = hex::encode(Sha256::digest(
            format!("k\n{}\n{expires}\n", stored.reference).as_bytes(),
        ));
        assert_ne!(signature, bare_hash);

        let mut expected = <Hmac<Sha256> as KeyInit>::new_from_slice(b"k").expect("hmac key");
        expected.update(format!("{}\n{expires}\n", stored.reference).as_bytes());
        assert_eq!(signature, hex::encode(expected.finalize().into_bytes()));

        assert!(store.verify_url(&url, OffsetDateTime::now_utc()));
        assert!(!other.verify_url(&url, OffsetDateTime::now_utc()));
        let foreign = other.url_for(&stored.reference, None).expect("url");
        assert!(!store.verify_url(&foreign, OffsetDateTime::now_utc()));
    }

    #[tokio::test]
    async fn malformed_signatures_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let store = FsBlobStore::new(&settings(&dir, 1024)).expect("store");
        let stored = store
            .store(BlobUpload::from_bytes("a.png", None, "png"))
            .await
            .expect("stored");
        let url = store.url_for(&stored.reference, None).expect("url");
        let (expires, signature) = signed_parts(&url);

        for sig in ["not-hex", &signature[..signature.len() - 2], ""] {
            let mut forged = url.clone();
            forged.set_query(Some(&format!("expires={expires}&sig={sig}")));
            assert!(!store.verify_url(&forged, OffsetDateTime::now_utc()), "{sig}");
        }
    }

    fn signed_parts(url: &Url) -> (i64, String) {
        let mut expires = None;
        let mut signature = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "expires" => expires = value.parse::<i64>().ok(),
                "sig" => signature = Some(value.into_owned()),
                _ => {}
            }
        }
        (
            expires.expect("expires parameter"),
            signature.expect("sig parameter"),
        )
    }

    #[test]
    fn sanitizes_filenames() {
        assert_eq!(sanitize_filename("Hello World.JPG"), "hello-world.jpg");
        assert_eq!(sanitize_filename("..."), "upload");
    }
}
