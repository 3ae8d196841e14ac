//! Open-file handles and the streaming segmentation engine.
//!
//! A handle is read-only or write-only. Writers stream into the target path
//! until the configured segment size would be exceeded; at that point the
//! bytes already uploaded are promoted into the segments container, a
//! manifest takes their place at the target path, and subsequent writes roll
//! over into numbered segment objects. Backend failures mid-stream leave
//! whatever was committed; cleanup happens on the next truncating open.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use log::warn;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::OwnedMutexGuard;

use super::error::{FsError, Result};
use super::naming;
use super::object::Object;
use super::FsCore;
use crate::store::{
    AUTO_CONTENT_HEADER, Headers, MANIFEST_HEADER, ObjectReader, ObjectWriter, StoreError,
};

pub struct ObjectHandle {
    core: Arc<FsCore>,
    target: Arc<Object>,
    reader: Option<Box<dyn ObjectReader>>,
    writer: Option<Box<dyn ObjectWriter>>,
    create: bool,
    truncated: bool,
    nonce: Option<String>,
    wrote_segment: bool,
    segment_id: u32,
    uploaded: u64,
    segment_prefix: String,
    /// Held while this handle may write; releasing it lets the next writer
    /// in.
    write_guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("create", &self.create)
            .field("truncated", &self.truncated)
            .field("wrote_segment", &self.wrote_segment)
            .field("segment_id", &self.segment_id)
            .field("uploaded", &self.uploaded)
            .field("segment_prefix", &self.segment_prefix)
            .finish()
    }
}

impl ObjectHandle {
    pub(crate) fn new(
        core: Arc<FsCore>,
        target: Arc<Object>,
        create: bool,
        write_guard: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        ObjectHandle {
            core,
            target,
            reader: None,
            writer: None,
            create,
            truncated: false,
            nonce: None,
            wrote_segment: false,
            segment_id: 0,
            uploaded: 0,
            segment_prefix: String::new(),
            write_guard,
        }
    }

    pub fn target(&self) -> &Arc<Object> {
        &self.target
    }

    /// Start the streaming create for a fresh object.
    pub(crate) async fn open_writer(&mut self) -> Result<()> {
        let container = self.target.container().to_string();
        let path = self.target.path();
        let (writer, nonce) = new_writer(&self.core, &container, &path).await?;
        self.writer = Some(writer);
        if nonce.is_some() {
            self.nonce = nonce;
        }
        Ok(())
    }

    /// Read up to `size` bytes at `offset`; short reads signal EOF. The
    /// reader is constructed on first use.
    pub async fn read(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        if self.reader.is_none() {
            let container = self.target.container().to_string();
            let reader = self
                .core
                .store
                .object_open(&container, &self.target.path())
                .await?;
            self.reader = Some(reader);
        }
        let reader = self.reader.as_mut().expect("reader just installed");
        reader
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(StoreError::Io)?;

        let mut buf = vec![0u8; size];
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = reader
                .read(&mut buf[filled..])
                .await
                .map_err(StoreError::Io)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Append `data` to the stream; the kernel offset is ignored (the open
    /// reply declared the handle non-seekable).
    pub async fn write(&mut self, data: &[u8]) -> Result<u32> {
        // No writer lock can be taken again until this handle releases.
        self.target.set_writing(true);

        // Overwriting an existing object: tear down whatever it was first.
        if !self.create && !self.truncated {
            self.truncate().await?;
        }

        let len = data.len() as u64;
        if self.uploaded + len <= self.core.config.segment_size {
            // Still inside the current object or segment.
            let writer = self.writer.as_mut().ok_or(FsError::NotSupported)?;
            writer.write_all(data).await?;
            self.uploaded += len;
            self.target.grow(len);
        } else {
            if !self.wrote_segment {
                // First crossing: what is at the target path becomes
                // segment zero and a manifest takes its place.
                self.move_to_segment().await?;
            } else if let Some(writer) = self.writer.take() {
                writer.close().await?;
            }
            self.init_segment(data).await?;
        }

        Ok(data.len() as u32)
    }

    /// Delete stale segments, reset the size, and reopen the target path
    /// for streaming.
    async fn truncate(&mut self) -> Result<()> {
        if self.target.segmented() {
            self.target.remove_segments().await?;
        }
        self.truncated = true;
        self.target.set_bytes(0);

        let container = self.target.container().to_string();
        let (writer, nonce) = new_writer(&self.core, &container, &self.target.path()).await?;
        self.writer = Some(writer);
        if nonce.is_some() {
            self.nonce = nonce;
        }
        Ok(())
    }

    /// Promote the bytes uploaded so far into the segments container and
    /// put a manifest at the target path.
    async fn move_to_segment(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.close().await?;
        }

        let epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();
        self.segment_prefix = format!("{}/{}", self.target.path(), epoch);
        let segment_path = naming::segment_path(&self.segment_prefix, self.segment_id);
        self.segment_id += 1;

        let container = self.target.container().to_string();
        let segments = self.target.segments_container().to_string();
        self.core
            .store
            .object_move(&container, &self.target.path(), &segments, &segment_path)
            .await?;

        let manifest = format!("{segments}/{}", self.segment_prefix);
        create_manifest(&self.core, &container, &manifest, &self.target.path()).await?;
        self.target.set_manifest(&manifest);
        self.wrote_segment = true;
        Ok(())
    }

    /// Open the next segment and write the first chunk into it.
    async fn init_segment(&mut self, data: &[u8]) -> Result<()> {
        let segment_path = naming::segment_path(&self.segment_prefix, self.segment_id);
        self.segment_id += 1;

        let segments = self.target.segments_container().to_string();
        let mut headers = Headers::new();
        headers.insert(AUTO_CONTENT_HEADER.to_string(), "true".to_string());
        let mut writer = self
            .core
            .store
            .object_create(&segments, &segment_path, false, "", "", headers)
            .await?;
        writer.write_all(data).await?;

        self.writer = Some(writer);
        self.uploaded = data.len() as u64;
        self.target.grow(data.len() as u64);
        Ok(())
    }

    /// Close the handle: finish the stream, write crypto headers back when
    /// encryption is on, clear the writing flag, and let go of the change
    /// cache entry and the object lock.
    pub async fn release(mut self) -> Result<()> {
        let mut result = Ok(());

        drop(self.reader.take());

        if let Some(writer) = self.writer.take() {
            if let Err(err) = writer.close().await {
                warn!("closing writer for {} failed: {err}", self.target.path());
            }
            if self.core.config.encryption {
                result = self.write_crypto_headers().await;
            }
            self.target.set_writing(false);
        }

        let container = self.target.container().to_string();
        let path = self.target.path();
        if self.core.changes.exists(&container, &path) {
            self.core.changes.remove(&container, &path);
        }
        drop(self.write_guard.take());

        result
    }

    async fn write_crypto_headers(&self) -> Result<()> {
        let nonce = self.nonce.clone().unwrap_or_default();
        let headers = self.target.stamp_crypto_headers(&nonce);
        let container = self.target.container().to_string();
        self.core
            .store
            .object_update(&container, &self.target.path(), headers)
            .await?;
        Ok(())
    }
}

/// Streaming create at `path`, asking the backend to sniff the content
/// type. With encryption on, the cipher wrapping yields a nonce the caller
/// must write back on release.
async fn new_writer(
    core: &Arc<FsCore>,
    container: &str,
    path: &str,
) -> Result<(Box<dyn ObjectWriter>, Option<String>)> {
    let mut headers = Headers::new();
    headers.insert(AUTO_CONTENT_HEADER.to_string(), "true".to_string());
    let nonce = core.config.encryption.then(generate_nonce);
    let writer = core
        .store
        .object_create(container, path, false, "", "", headers)
        .await?;
    Ok((writer, nonce))
}

/// Zero-byte object whose manifest header stitches the segments together.
async fn create_manifest(
    core: &Arc<FsCore>,
    container: &str,
    manifest: &str,
    path: &str,
) -> Result<()> {
    let mut headers = Headers::new();
    headers.insert(MANIFEST_HEADER.to_string(), manifest.to_string());
    headers.insert(AUTO_CONTENT_HEADER.to_string(), "true".to_string());
    let writer = core
        .store
        .object_create(container, path, false, "", "", headers)
        .await?;
    writer.close().await?;
    Ok(())
}

fn generate_nonce() -> String {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    B64.encode(raw)
}
