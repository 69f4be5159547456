// Jackson Coxson
//! File operations on a device, either through the media AFC service or
//! inside one application's sandbox through house arrest.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_recursion::async_recursion;
use log::{info, trace};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    afc::{AfcClient, AfcConnection, AfcPrimitives},
    bridge::MobileDeviceBridge,
    device::Device,
    house_arrest::HouseArrestClient,
    service::ServiceName,
    DeviceError,
};

/// Size of each read when pulling a file off the device
pub const READ_CHUNK: usize = 8192;

/// Roots under this prefix live in the app's data container
const DOCUMENTS_PREFIX: &str = "/Documents/";

/// One file to copy during a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalToDevicePath {
    pub local_path: PathBuf,
    pub device_path: String,
}

/// Where an application's synced files go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAppData {
    pub app_identifier: String,
    pub device_project_root_path: String,
}

pub struct DeviceFileSystem<B: MobileDeviceBridge> {
    device: Arc<Device<B>>,
    app: Option<String>,
}

impl<B: MobileDeviceBridge> std::fmt::Debug for DeviceFileSystem<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceFileSystem")
            .field("device", &self.device.identifier())
            .field("app", &self.app)
            .finish()
    }
}

impl<B: MobileDeviceBridge> DeviceFileSystem<B> {
    /// `app` scopes listing, pulling and pushing to that application's container.
    /// Without it they use the media partition.
    pub fn new(device: Arc<Device<B>>, app: Option<String>) -> Self {
        Self { device, app }
    }

    async fn afc(&self) -> Result<AfcClient<AfcConnection>, DeviceError> {
        match &self.app {
            Some(app) => {
                HouseArrestClient::connect(&self.device)
                    .await?
                    .vend_container(app)
                    .await
            }
            None => {
                let service = self.device.start_service(ServiceName::AFC).await?;
                Ok(AfcClient::new(AfcConnection::new(service.into_socket())))
            }
        }
    }

    async fn sandbox(
        &self,
        root: &str,
        app_identifier: &str,
    ) -> Result<AfcClient<AfcConnection>, DeviceError> {
        let house_arrest = HouseArrestClient::connect(&self.device).await?;
        if is_documents_root(root) {
            house_arrest.vend_documents(app_identifier).await
        } else {
            house_arrest.vend_container(app_identifier).await
        }
    }

    /// Logs the tree under `device_path` (the AFC root when `None`)
    ///
    /// # Returns
    /// Every visited path, depth first
    pub async fn list_files(&self, device_path: Option<&str>) -> Result<Vec<String>, DeviceError> {
        let root = device_path.filter(|p| !p.is_empty()).unwrap_or(".");
        info!("Listing {root}");
        let mut afc = self.afc().await?;
        let mut visited = Vec::new();
        walk(&mut afc, root.to_string(), 0, &mut visited).await;
        afc.close().await?;
        Ok(visited)
    }

    /// Copies a device file to `output`, or to stdout when `None`
    ///
    /// # Arguments
    /// * `device_path` - path relative to the AFC root or the app container
    /// * `output` - local file to create, truncating an existing one
    ///
    /// # Returns
    /// The number of bytes copied
    pub async fn get_file(
        &self,
        device_path: &str,
        output: Option<&Path>,
    ) -> Result<u64, DeviceError> {
        let mut afc = self.afc().await?;
        let copied = match output {
            Some(path) => {
                let mut file = tokio::fs::File::create(path).await?;
                copy_to(&mut afc, device_path, &mut file).await
            }
            None => copy_to(&mut afc, device_path, &mut tokio::io::stdout()).await,
        };
        if let Err(e) = &copied {
            trace!("Error while getting file from device: {e:?}");
        }
        afc.close().await?;
        copied
    }

    /// Uploads a local file, creating missing parent directories on the device
    ///
    /// # Errors
    /// Fails before connecting if `local_path` does not exist
    pub async fn put_file(
        &self,
        local_path: impl AsRef<Path>,
        device_path: &str,
    ) -> Result<(), DeviceError> {
        let local_path = tokio::fs::canonicalize(local_path.as_ref()).await?;
        let mut afc = self.afc().await?;
        let res = afc.transfer(&local_path, device_path).await;
        afc.close().await?;
        res
    }

    /// Removes a file from an application's sandbox. A missing file is not an error.
    pub async fn delete_file(
        &self,
        device_path: &str,
        app_identifier: &str,
    ) -> Result<(), DeviceError> {
        let mut afc = self.sandbox(device_path, app_identifier).await?;
        afc.delete_file(device_path).await;
        afc.close().await
    }

    /// Copies the regular files among `files` into the application's sandbox
    pub async fn transfer_files(
        &self,
        app_data: &DeviceAppData,
        files: &[LocalToDevicePath],
    ) -> Result<(), DeviceError> {
        let mut afc = self
            .sandbox(&app_data.device_project_root_path, &app_data.app_identifier)
            .await?;
        let res = transfer_local_files(&mut afc, files).await;
        afc.close().await?;
        res
    }

    /// Syncs a project directory. Only the listed files are copied.
    pub async fn transfer_directory(
        &self,
        app_data: &DeviceAppData,
        files: &[LocalToDevicePath],
        _project_files_path: &Path,
    ) -> Result<(), DeviceError> {
        self.transfer_files(app_data, files).await
    }
}

pub fn is_documents_root(root: &str) -> bool {
    root.starts_with(DOCUMENTS_PREFIX)
}

/// Directories that cannot be listed are treated as empty
#[async_recursion]
async fn walk<C: AfcPrimitives>(
    afc: &mut AfcClient<C>,
    root: String,
    indent: usize,
    visited: &mut Vec<String>,
) {
    info!("{} {root}", " ".repeat(indent.saturating_sub(1)));
    let children = afc.list_dir(&root).await.unwrap_or_default();
    visited.push(root.clone());
    for child in children {
        walk(afc, format!("{root}/{child}"), indent + 1, visited).await;
    }
}

async fn copy_to<C: AfcPrimitives, W: AsyncWrite + Unpin>(
    afc: &mut AfcClient<C>,
    device_path: &str,
    output: &mut W,
) -> Result<u64, DeviceError> {
    let mut file = afc.open(device_path, "r").await?;
    let mut size = 0u64;
    let res = loop {
        let data = match file.read(READ_CHUNK).await {
            Ok(d) => d,
            Err(e) => break Err(e),
        };
        if data.is_empty() {
            break Ok(());
        }
        if let Err(e) = output.write_all(&data).await {
            break Err(e.into());
        }
        size += data.len() as u64;
    };
    let closed = file.close().await;
    res?;
    closed?;
    output.flush().await?;
    trace!("{size} bytes read from {device_path}");
    Ok(size)
}

async fn transfer_local_files<C: AfcPrimitives>(
    afc: &mut AfcClient<C>,
    files: &[LocalToDevicePath],
) -> Result<(), DeviceError> {
    for file in files {
        if tokio::fs::metadata(&file.local_path).await?.is_file() {
            afc.transfer(&file.local_path, &file.device_path).await?;
        }
    }
    Ok(())
}
