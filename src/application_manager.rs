// Jackson Coxson
//! Install, list, launch and stop applications on one device
//!
//! Listing goes through the installation proxy, launching through
//! debugserver. debugserver only exists once a developer disk image is
//! mounted, so [`ApplicationManager::start_application`] mounts one first.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};

use indexmap::IndexMap;
#[cfg(target_os = "macos")]
use log::debug;
use log::{info, trace};

use crate::{
    bridge::MobileDeviceBridge,
    debug_server::{DebugServerClient, RunOptions},
    device::Device,
    installation_proxy::InstallationProxyClient,
    message::Message,
    DeviceError, DeviceSocket,
};

const LIVE_SYNC_ATTRIBUTE: &str = "IceniumLiveSyncEnabled";
#[cfg(target_os = "macos")]
const DEVELOPER_DISK_IMAGE: &str = "DeveloperDiskImage.dmg";

#[derive(Debug, Clone, Default)]
pub struct ApplicationManagerOptions {
    /// Developer disk image to mount. Required on hosts without Xcode.
    pub developer_disk_image: Option<PathBuf>,
    pub run: RunOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationLiveSyncStatus {
    pub application_identifier: String,
    pub is_live_sync_supported: bool,
}

pub struct ApplicationManager<B: MobileDeviceBridge> {
    device: Arc<Device<B>>,
    options: ApplicationManagerOptions,
    live_sync: StdMutex<Vec<ApplicationLiveSyncStatus>>,
    debugger: tokio::sync::Mutex<Option<DebugServerClient<DeviceSocket>>>,
}

impl<B: MobileDeviceBridge> std::fmt::Debug for ApplicationManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationManager")
            .field("device", &self.device.identifier())
            .field("options", &self.options)
            .finish()
    }
}

impl<B: MobileDeviceBridge> ApplicationManager<B> {
    pub fn new(device: Arc<Device<B>>, options: ApplicationManagerOptions) -> Self {
        Self {
            device,
            options,
            live_sync: StdMutex::new(Vec::new()),
            debugger: tokio::sync::Mutex::new(None),
        }
    }

    pub fn device(&self) -> &Arc<Device<B>> {
        &self.device
    }

    /// Bundle identifiers of user applications, sorted case-insensitively
    pub async fn installed_applications(&self) -> Result<Vec<String>, DeviceError> {
        let mut ids: Vec<String> = self
            .applications_live_sync_status()
            .await?
            .into_iter()
            .map(|a| a.application_identifier)
            .collect();
        ids.sort_by_key(|id| id.to_lowercase());
        Ok(ids)
    }

    /// Browses user applications and remembers which ones allow live sync
    pub async fn applications_live_sync_status(
        &self,
    ) -> Result<Vec<ApplicationLiveSyncStatus>, DeviceError> {
        let proxy = InstallationProxyClient::connect(&self.device).await?;
        let browsed = proxy
            .browse("User", &["CFBundleIdentifier", LIVE_SYNC_ATTRIBUTE])
            .await;
        proxy.close().await?;
        let apps = browsed?;
        trace!("Result when getting applications for which LiveSync is enabled: {apps:?}");

        let status: Vec<ApplicationLiveSyncStatus> = apps
            .iter()
            .filter_map(|app| {
                Some(ApplicationLiveSyncStatus {
                    application_identifier: app.string_field("CFBundleIdentifier")?,
                    is_live_sync_supported: app
                        .get(LIVE_SYNC_ATTRIBUTE)
                        .and_then(Message::as_bool)
                        .unwrap_or(false),
                })
            })
            .collect();
        *self.live_sync.lock().unwrap_or_else(|e| e.into_inner()) = status.clone();
        Ok(status)
    }

    /// Answers from the last [`Self::applications_live_sync_status`] call
    pub fn is_live_sync_supported(&self, application_id: &str) -> bool {
        self.live_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|a| a.application_identifier == application_id && a.is_live_sync_supported)
    }

    pub async fn install_application(&self, package: impl AsRef<Path>) -> Result<(), DeviceError> {
        InstallationProxyClient::deploy(&self.device, package).await
    }

    pub async fn uninstall_application(&self, application_id: &str) -> Result<(), DeviceError> {
        let proxy = InstallationProxyClient::connect(&self.device).await?;
        let res = proxy.uninstall(application_id).await;
        proxy.close().await?;
        res
    }

    /// Every installed application keyed by bundle identifier
    pub async fn lookup_applications(&self) -> Result<IndexMap<String, Message>, DeviceError> {
        let proxy = InstallationProxyClient::connect(&self.device).await?;
        let res = proxy.lookup(None).await;
        proxy.close().await?;
        res
    }

    /// Returns the application's lookup entry or lists the valid identifiers
    pub async fn validate_application_id(
        &self,
        application_id: &str,
    ) -> Result<Message, DeviceError> {
        let mut apps = self.lookup_applications().await?;
        if let Some(app) = apps.shift_remove(application_id) {
            return Ok(app);
        }
        let mut available: Vec<String> = apps.into_keys().collect();
        available.sort();
        Err(DeviceError::InvalidApplicationId {
            id: application_id.to_string(),
            available: available.join("\n"),
        })
    }

    async fn application_path(&self, application_id: &str) -> Result<String, DeviceError> {
        self.validate_application_id(application_id)
            .await?
            .string_field("Path")
            .ok_or(DeviceError::UnexpectedResponse)
    }

    /// Mounts the developer disk image debugserver lives on
    pub async fn mount_developer_image(&self) -> Result<(), DeviceError> {
        let image = match &self.options.developer_disk_image {
            Some(image) => image.clone(),
            None => self.find_developer_disk_image().await?,
        };
        let mut signature_path = image.clone().into_os_string();
        signature_path.push(".signature");
        let signature = tokio::fs::read(&signature_path).await?;

        self.device
            .try_execute_function(|s| async move { s.mount_image(&image, &signature).await })
            .await
    }

    #[cfg(target_os = "macos")]
    async fn find_developer_disk_image(&self) -> Result<PathBuf, DeviceError> {
        let output = tokio::process::Command::new("xcode-select")
            .arg("-print-path")
            .output()
            .await?;
        let developer_dir = String::from_utf8(output.stdout)?;
        let support_dir = Path::new(developer_dir.trim())
            .join("Platforms")
            .join("iPhoneOS.platform")
            .join("DeviceSupport");

        let (product_version, build_version) = self
            .device
            .try_execute_function(|s| async move {
                let version = s.copy_value("ProductVersion").await?;
                let build = s.copy_value("BuildVersion").await?;
                Ok((
                    version.and_then(|v| v.as_str().map(str::to_string)),
                    build.and_then(|v| v.as_str().map(str::to_string)),
                ))
            })
            .await?;

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&support_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.file_name().to_string_lossy().into_owned());
        }
        entries.sort();

        let chosen = select_device_support(
            &entries,
            product_version.as_deref().unwrap_or_default(),
            build_version.as_deref(),
        )
        .ok_or(DeviceError::DeviceSupportNotFound)?;
        debug!("Using device support {chosen}");
        Ok(support_dir.join(chosen).join(DEVELOPER_DISK_IMAGE))
    }

    #[cfg(not(target_os = "macos"))]
    async fn find_developer_disk_image(&self) -> Result<PathBuf, DeviceError> {
        Err(DeviceError::DeveloperDiskImageRequired)
    }

    /// Validates the identifier, mounts the developer image and launches the app
    pub async fn start_application(&self, application_id: &str) -> Result<(), DeviceError> {
        self.validate_application_id(application_id).await?;
        self.mount_developer_image().await?;
        self.run_application(application_id).await?;
        info!(
            "Successfully run application {application_id} on device with ID {}.",
            self.device.identifier()
        );
        Ok(())
    }

    pub async fn stop_application(&self, application_id: &str) -> Result<(), DeviceError> {
        let path = self.application_path(application_id).await?;
        let mut debugger = self.debugger.lock().await;
        if debugger.is_none() {
            *debugger = Some(DebugServerClient::connect(&self.device).await?);
        }
        match debugger.as_mut() {
            Some(gdb) => gdb.kill(&[path]).await,
            None => Err(DeviceError::NoEstablishedConnection),
        }
    }

    pub async fn restart_application(&self, application_id: &str) -> Result<(), DeviceError> {
        self.stop_application(application_id).await?;
        self.run_application(application_id).await
    }

    /// Launches through a fresh debugserver connection, replacing any previous one
    async fn run_application(&self, application_id: &str) -> Result<(), DeviceError> {
        let path = self.application_path(application_id).await?;
        let mut debugger = self.debugger.lock().await;
        if let Some(old) = debugger.take() {
            if let Err(e) = old.close().await {
                trace!("Closing previous debugserver connection failed: {e:?}");
            }
        }
        let mut gdb = DebugServerClient::connect(&self.device).await?;
        gdb.run(&[path], self.options.run).await?;
        *debugger = Some(gdb);
        Ok(())
    }

    /// Follows the output of the last launched application
    ///
    /// # Returns
    /// The fatal signal the application stopped on, or `None` if debugserver
    /// closed the connection first
    pub async fn watch_application_output<F: FnMut(&str)>(
        &self,
        on_output: F,
    ) -> Result<Option<u8>, DeviceError> {
        let mut debugger = self.debugger.lock().await;
        match debugger.as_mut() {
            Some(gdb) => gdb.watch_output(on_output).await,
            None => Err(DeviceError::NoEstablishedConnection),
        }
    }
}

/// Picks the DeviceSupport entry for a device
///
/// Entries look like `"16.4 (20E247)"` or `"16.4"`. The first entry with the
/// same major version is taken, then replaced by entries matching the minor
/// version, preferring one whose build matches exactly.
pub fn select_device_support(
    entries: &[String],
    product_version: &str,
    build_version: Option<&str>,
) -> Option<String> {
    struct Candidate<'a> {
        name: &'a str,
        build: Option<String>,
    }

    let mut product = product_version.split('.');
    let major = product.next()?;
    let minor = product.next();

    let mut chosen: Option<Candidate> = None;
    for name in entries {
        let mut parts = name.split(' ');
        let version = parts.next().unwrap_or_default();
        let build = parts
            .next()
            .map(|b| b.trim_matches(|c| c == '(' || c == ')').to_string());
        let mut version = version.split('.');
        if version.next() != Some(major) {
            continue;
        }
        let candidate = Candidate { name, build };
        match &chosen {
            None => chosen = Some(candidate),
            Some(current) => {
                let is_exact =
                    |c: &Candidate| build_version.is_some() && c.build.as_deref() == build_version;
                if version.next() != minor || is_exact(current) {
                    continue;
                }
                if is_exact(&candidate)
                    || current.build != candidate.build
                    || current.build.is_none()
                {
                    chosen = Some(candidate);
                }
            }
        }
    }
    chosen.map(|c| c.name.to_string())
}
