// Jackson Coxson
//! AFC (Apple File Conduit) client for the file systems exposed by a device.
//!
//! [`AfcPrimitives`] is the set of single-request operations. [`AfcConnection`]
//! speaks them over a service socket; [`AfcClient`] layers retries, directory
//! listing and the chunked transfer protocol on top of any implementation.

use std::{future::Future, path::Path};

use log::{trace, warn};
use tokio::io::AsyncReadExt;

use crate::DeviceError;

pub mod connection;
pub mod errors;
pub mod opcode;
pub mod packet;

pub use connection::AfcConnection;
use errors::AfcError;
use opcode::mode_from_flags;

/// The magic number used in AFC protocol communications
pub const MAGIC: u64 = 0x4141504c36414643;

/// How many times a primitive is attempted before its error is surfaced
pub const RETRY_ATTEMPTS: usize = 5;

/// Size of the local reads fed into a transfer
const TRANSFER_CHUNK: usize = 1024 * 1024;

/// Single-request AFC operations
///
/// Handles returned here are only valid on the connection that produced them.
pub trait AfcPrimitives: Send {
    fn file_open(
        &mut self,
        path: &str,
        mode: u64,
    ) -> impl Future<Output = Result<u64, DeviceError>> + Send;

    fn file_read(
        &mut self,
        handle: u64,
        len: usize,
    ) -> impl Future<Output = Result<Vec<u8>, DeviceError>> + Send;

    fn file_write(
        &mut self,
        handle: u64,
        data: &[u8],
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn file_close(&mut self, handle: u64) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn make_dir(&mut self, path: &str) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn directory_open(
        &mut self,
        path: &str,
    ) -> impl Future<Output = Result<u64, DeviceError>> + Send;

    /// Returns `None` once the listing is exhausted
    fn directory_read(
        &mut self,
        handle: u64,
    ) -> impl Future<Output = Result<Option<String>, DeviceError>> + Send;

    fn directory_close(
        &mut self,
        handle: u64,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn remove_path(&mut self, path: &str) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn close(self) -> impl Future<Output = Result<(), DeviceError>> + Send
    where
        Self: Sized;
}

/// Runs a primitive up to [`RETRY_ATTEMPTS`] times, returning the first
/// success or the last error.
macro_rules! retry {
    ($what:expr, $call:expr) => {{
        let mut attempt = 0;
        loop {
            attempt += 1;
            match $call.await {
                Ok(v) => break Ok(v),
                Err(e) => {
                    trace!("Error #{attempt} while {}: {e}", $what);
                    if attempt >= RETRY_ATTEMPTS {
                        break Err(e);
                    }
                }
            }
        }
    }};
}

/// Client for interacting with the AFC service on iOS devices
#[derive(Debug)]
pub struct AfcClient<C> {
    conn: C,
}

/// Handle for an open file on the device.
/// Call close before dropping
pub struct AfcFile<'a, C: AfcPrimitives> {
    client: &'a mut AfcClient<C>,
    handle: u64,
    path: String,
}

impl<C: AfcPrimitives> AfcFile<'_, C> {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads up to `len` bytes. An empty result means end of file.
    pub async fn read(&mut self, len: usize) -> Result<Vec<u8>, DeviceError> {
        let handle = self.handle;
        let conn = &mut self.client.conn;
        retry!(
            format!("reading from '{}'", self.path),
            conn.file_read(handle, len)
        )
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        let handle = self.handle;
        let conn = &mut self.client.conn;
        retry!(
            format!("writing to '{}'", self.path),
            conn.file_write(handle, data)
        )
    }

    pub async fn close(self) -> Result<(), DeviceError> {
        let handle = self.handle;
        let conn = &mut self.client.conn;
        retry!(
            format!("closing '{}'", self.path),
            conn.file_close(handle)
        )
    }
}

impl<C: AfcPrimitives> AfcClient<C> {
    pub fn new(conn: C) -> Self {
        Self { conn }
    }

    pub fn into_inner(self) -> C {
        self.conn
    }

    /// Opens a file on the device
    ///
    /// # Arguments
    /// * `path` - Path to the file to open
    /// * `flags` - `"r"` or `"w"`; write wins when both are present
    pub async fn open(
        &mut self,
        path: impl Into<String>,
        flags: &str,
    ) -> Result<AfcFile<'_, C>, DeviceError> {
        let path = path.into();
        let mode = mode_from_flags(flags);
        let handle = retry!(
            format!("opening '{path}'"),
            self.conn.file_open(&path, mode)
        )?;
        Ok(AfcFile {
            client: self,
            handle,
            path,
        })
    }

    pub async fn mkdir(&mut self, path: &str) -> Result<(), DeviceError> {
        retry!(format!("making directory '{path}'"), self.conn.make_dir(path))
    }

    /// Lists a directory, skipping the `.` and `..` entries
    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        let dir = retry!(
            format!("opening directory '{path}'"),
            self.conn.directory_open(path)
        )?;

        let mut entries = Vec::new();
        let listing = loop {
            match self.conn.directory_read(dir).await {
                Ok(Some(name)) if name.is_empty() => break Ok(()),
                Ok(Some(name)) => {
                    if name != "." && name != ".." {
                        entries.push(name);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        let closed = retry!(
            format!("closing directory '{path}'"),
            self.conn.directory_close(dir)
        );
        listing?;
        closed?;
        Ok(entries)
    }

    pub async fn remove(&mut self, path: &str) -> Result<(), DeviceError> {
        retry!(format!("removing '{path}'"), self.conn.remove_path(path))
    }

    /// Removes a file once, ignoring failures such as a missing path
    pub async fn delete_file(&mut self, path: &str) {
        let res = self.conn.remove_path(path).await;
        trace!("Removing device file '{path}', result: {res:?}");
    }

    /// Creates every component of `dir`, root first
    pub async fn ensure_device_path_exists(&mut self, dir: &str) -> Result<(), DeviceError> {
        let mut current = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            self.mkdir(&current).await?;
        }
        Ok(())
    }

    /// Streams a local file to `device_path`, replacing what was there
    pub async fn transfer(
        &mut self,
        local_path: impl AsRef<Path>,
        device_path: &str,
    ) -> Result<(), DeviceError> {
        let local_path = local_path.as_ref();
        let device_path = device_path.replace('\\', "/");
        if let Some((parent, _)) = device_path.rsplit_once('/') {
            self.ensure_device_path_exists(parent).await?;
        }
        self.delete_file(&device_path).await;

        let mut reader = tokio::fs::File::open(local_path).await?;
        let local_size = reader.metadata().await?.len();

        let mut target = self.open(device_path.clone(), "w").await?;
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        loop {
            let read = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = target.close().await;
                    return Err(e.into());
                }
            };
            match target.write(&buf[..read]).await {
                Ok(()) => {}
                Err(DeviceError::Afc(AfcError::OpInterrupted)) => {
                    warn!("Transfer of '{device_path}' reported an interrupted write, continuing");
                }
                Err(e) => {
                    let _ = target.close().await;
                    return Err(e);
                }
            }
            trace!(
                "transfer-> localFilePath: '{}', devicePath: '{device_path}', localFilePathSize: '{local_size}', transferred bytes: '{read}'",
                local_path.display()
            );
        }
        target.close().await
    }

    pub async fn transfer_package(
        &mut self,
        local_path: impl AsRef<Path>,
        device_path: &str,
    ) -> Result<(), DeviceError> {
        self.transfer(local_path, device_path).await
    }

    /// Writes an in-memory buffer to `device_path`
    pub async fn upload_bytes(&mut self, data: &[u8], device_path: &str) -> Result<(), DeviceError> {
        if let Some((parent, _)) = device_path.rsplit_once('/') {
            self.ensure_device_path_exists(parent).await?;
        }
        self.delete_file(device_path).await;
        let mut target = self.open(device_path, "w").await?;
        if let Err(e) = target.write(data).await {
            let _ = target.close().await;
            return Err(e);
        }
        target.close().await
    }

    pub async fn close(self) -> Result<(), DeviceError> {
        self.conn.close().await
    }
}
