//! src/services/local_gateway.rs
//!
//! LocalObjectGateway: a filesystem-backed object store implementing
//! [`ObjectGateway`]. Payloads are sharded beneath
//! `base_path/objects/{shard}/{shard}/{key}`, metadata sidecars beneath
//! `base_path/meta/{shard}/{shard}/{key}.json`, and open multipart uploads
//! live in `base_path/uploads/{upload_id}/`.
//!
//! Presigned URLs point at this process's `/storage` routes and carry an
//! HMAC signature; the data-plane handlers verify it and then call the
//! `put_*_stream` methods below.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

use crate::{
    models::{
        object::{MultipartManifest, StoredObject},
        upload::CompletedPart,
    },
    services::{
        gateway::{GatewayError, GatewayResult, ObjectGateway, ensure_key_safe},
        signing::{UrlSigner, object_resource, part_resource},
    },
};

const MANIFEST_FILE: &str = "manifest.json";
const COPY_BUFFER_LEN: usize = 64 * 1024;

#[derive(Clone)]
pub struct LocalObjectGateway {
    /// Root directory for payloads, sidecars and open uploads.
    base_path: PathBuf,

    /// Externally reachable origin used when building presigned URLs.
    public_url: String,

    signer: UrlSigner,
}

impl LocalObjectGateway {
    pub fn new(base_path: impl Into<PathBuf>, public_url: impl Into<String>, signer: UrlSigner) -> Self {
        Self {
            base_path: base_path.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            signer,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Generate two-level shard identifiers for an object key.
    ///
    /// Uses MD5(key) and returns the first two bytes as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn sharded_path(&self, area: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.join(area);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.sharded_path("objects", key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        let mut path = self.sharded_path("meta", key).into_os_string();
        path.push(".json");
        PathBuf::from(path)
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join("uploads").join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("part.{part_number:05}"))
    }

    /// Upload ids are issued by us; anything else cannot name an upload.
    fn ensure_upload_id_safe(upload_id: &str) -> GatewayResult<()> {
        if upload_id.is_empty()
            || !upload_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(GatewayError::UploadNotFound(upload_id.to_string()));
        }
        Ok(())
    }

    fn encode_key(key: &str) -> String {
        key.split('/')
            .map(urlencoding::encode)
            .collect::<Vec<_>>()
            .join("/")
    }

    async fn read_manifest(&self, upload_id: &str) -> GatewayResult<MultipartManifest> {
        Self::ensure_upload_id_safe(upload_id)?;
        let path = self.upload_dir(upload_id).join(MANIFEST_FILE);
        let raw = fs::read(&path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                GatewayError::UploadNotFound(upload_id.to_string())
            } else {
                GatewayError::Io(err)
            }
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn read_metadata(&self, key: &str) -> GatewayResult<StoredObject> {
        let raw = fs::read(self.meta_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                GatewayError::ObjectNotFound(key.to_string())
            } else {
                GatewayError::Io(err)
            }
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write_metadata(&self, object: &StoredObject) -> GatewayResult<()> {
        let path = self.meta_path(&object.key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, serde_json::to_vec(object)?).await?;
        Ok(())
    }

    /// Stream a body into a temp file inside `dir`.
    ///
    /// Returns the temp path, the byte count and the hex MD5. The temp file is
    /// removed on any error.
    async fn write_temp<S>(dir: &Path, stream: S) -> GatewayResult<(PathBuf, i64, String)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        fs::create_dir_all(dir).await?;
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(GatewayError::Io(err));
                }
            };
            size_bytes += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(GatewayError::Io(err));
            }
        }
        if let Err(err) = finish_file(&mut file).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }

        Ok((tmp_path, size_bytes, format!("{:x}", digest.compute())))
    }

    /// Store one part of an open multipart upload; returns the part ETag.
    ///
    /// Uploading the same part number again replaces the earlier bytes.
    pub async fn put_part_stream<S>(
        &self,
        upload_id: &str,
        part_number: u32,
        stream: S,
    ) -> GatewayResult<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.read_manifest(upload_id).await?;
        let dir = self.upload_dir(upload_id);
        let (tmp_path, size_bytes, etag) = Self::write_temp(&dir, stream).await?;

        let part_path = self.part_path(upload_id, part_number);
        if let Err(err) = replace_file(&tmp_path, &part_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }

        debug!(upload_id, part_number, size_bytes, "stored upload part");
        Ok(etag)
    }

    /// Single-shot upload of a whole object (S3-like overwrite semantics).
    pub async fn put_object_stream<S>(
        &self,
        key: &str,
        content_type: Option<String>,
        stream: S,
    ) -> GatewayResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let parent = parent_dir(&file_path)?;
        let (tmp_path, size_bytes, etag) = Self::write_temp(&parent, stream).await?;

        if let Err(err) = replace_file(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }

        let object = StoredObject {
            key: key.to_string(),
            content_type,
            size_bytes,
            etag,
            last_modified: Utc::now(),
            metadata: BTreeMap::new(),
        };
        self.write_metadata(&object).await?;
        Ok(object)
    }

    /// Fetch an object for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    pub async fn open_object(&self, key: &str) -> GatewayResult<(StoredObject, File)> {
        ensure_key_safe(key)?;
        let object = self.read_metadata(key).await?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                GatewayError::ObjectNotFound(key.to_string())
            } else {
                GatewayError::Io(err)
            }
        })?;
        Ok((object, file))
    }

    /// Copy one stored part into `out`, verifying it against the client tag.
    ///
    /// Returns the raw MD5 of the part and its length.
    async fn append_part(
        &self,
        upload_id: &str,
        part: &CompletedPart,
        out: &mut File,
    ) -> GatewayResult<([u8; 16], i64)> {
        let mut file = File::open(self.part_path(upload_id, part.part_number))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    GatewayError::InvalidPart {
                        part_number: part.part_number,
                        reason: "part was never uploaded".into(),
                    }
                } else {
                    GatewayError::Io(err)
                }
            })?;

        let mut digest = Context::new();
        let mut len: i64 = 0;
        let mut buf = vec![0u8; COPY_BUFFER_LEN];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            len += n as i64;
        }

        let computed = digest.compute();
        let expected = part.etag.trim_matches('"');
        if format!("{:x}", computed) != expected.to_ascii_lowercase() {
            return Err(GatewayError::InvalidPart {
                part_number: part.part_number,
                reason: "integrity tag does not match uploaded bytes".into(),
            });
        }
        Ok((computed.0, len))
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectGateway for LocalObjectGateway {
    async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> GatewayResult<String> {
        ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let manifest = MultipartManifest {
            upload_id: upload_id.clone(),
            key: key.to_string(),
            content_type: content_type.to_string(),
            metadata,
            initiated_at: Utc::now(),
        };

        let dir = self.upload_dir(&upload_id);
        fs::create_dir_all(&dir).await?;
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec(&manifest)?).await?;

        debug!(upload_id, key, "created multipart upload");
        Ok(upload_id)
    }

    async fn presign_part_upload(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> GatewayResult<String> {
        ensure_key_safe(key)?;
        Self::ensure_upload_id_safe(upload_id)?;
        let signed = self.signer.sign(&part_resource(upload_id, part_number));
        Ok(format!(
            "{}/storage/uploads/{}/parts/{}?{}",
            self.public_url,
            upload_id,
            part_number,
            signed.to_query()
        ))
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<String> {
        let manifest = self.read_manifest(upload_id).await?;
        if manifest.key != key {
            return Err(GatewayError::UploadNotFound(upload_id.to_string()));
        }

        let file_path = self.object_path(key);
        let parent = parent_dir(&file_path)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut out = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut combined = Context::new();
        for part in parts {
            match self.append_part(upload_id, part, &mut out).await {
                Ok((digest, len)) => {
                    combined.consume(digest);
                    size_bytes += len;
                }
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err);
                }
            }
        }
        if let Err(err) = finish_file(&mut out).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }
        if let Err(err) = replace_file(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(GatewayError::Io(err));
        }

        let object = StoredObject {
            key: key.to_string(),
            content_type: Some(manifest.content_type),
            size_bytes,
            etag: format!("{:x}-{}", combined.compute(), parts.len()),
            last_modified: Utc::now(),
            metadata: manifest.metadata,
        };
        self.write_metadata(&object).await?;

        if let Err(err) = fs::remove_dir_all(self.upload_dir(upload_id)).await {
            debug!(upload_id, "failed to remove finished upload directory: {}", err);
        }

        debug!(upload_id, key, size_bytes, "completed multipart upload");
        Ok(key.to_string())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> GatewayResult<()> {
        let manifest = self.read_manifest(upload_id).await?;
        if manifest.key != key {
            return Err(GatewayError::UploadNotFound(upload_id.to_string()));
        }
        match fs::remove_dir_all(self.upload_dir(upload_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(GatewayError::UploadNotFound(upload_id.to_string()))
            }
            Err(err) => Err(GatewayError::Io(err)),
        }
    }

    async fn presign_put_object(&self, key: &str, content_type: &str) -> GatewayResult<String> {
        ensure_key_safe(key)?;
        let signed = self.signer.sign(&object_resource(key, content_type));
        Ok(format!(
            "{}/storage/objects/{}?contentType={}&{}",
            self.public_url,
            Self::encode_key(key),
            urlencoding::encode(content_type),
            signed.to_query()
        ))
    }

    async fn delete_object(&self, key: &str) -> GatewayResult<()> {
        ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(()) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(GatewayError::ObjectNotFound(key.to_string()));
            }
            Err(err) => return Err(GatewayError::Io(err)),
        }

        let meta_path = self.meta_path(key);
        if let Err(err) = fs::remove_file(&meta_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("failed to remove sidecar {}: {}", meta_path.display(), err);
            }
        }

        for (area, path) in [("objects", file_path), ("meta", meta_path)] {
            if let Some(parent) = path.parent() {
                self.prune_empty_dirs(parent, &self.base_path.join(area))
                    .await;
            }
        }
        Ok(())
    }
}

fn parent_dir(path: &Path) -> GatewayResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        GatewayError::Io(io::Error::new(
            ErrorKind::Other,
            "object path missing parent directory",
        ))
    })
}

async fn finish_file(file: &mut File) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

/// Move `tmp` over `dest`, replacing any existing file.
async fn replace_file(tmp: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(tmp, dest).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            fs::remove_file(dest).await?;
            fs::rename(tmp, dest).await
        }
        Err(err) => Err(err),
    }
}
