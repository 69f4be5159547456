// Jackson Coxson
//! One physical device and its connect/pair/session lifecycle
//!
//! Nothing holds a session across calls. Every operation goes through
//! [`Device::try_execute_function`], which connects, pairs when needed,
//! validates the pairing and starts a session, hands the caller an
//! [`ActiveSession`], then stops the session and disconnects no matter how
//! the operation ended.

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use futures::FutureExt;
use log::{debug, info, warn};

use crate::{
    bridge::MobileDeviceBridge,
    message::Message,
    service::{self, Service},
    DeviceError, DeviceSocket, IMAGE_ALREADY_MOUNTED_ERROR_CODE,
    INCOMPATIBLE_IMAGE_SIGNATURE_ERROR_CODE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Connected,
    Paired,
    SessionActive,
    SessionStopped,
}

/// Static facts about a device, read in one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub identifier: String,
    pub vendor: String,
    pub display_name: String,
    pub product_type: String,
    pub version: String,
    pub build_version: String,
    pub color: String,
    pub is_tablet: bool,
    pub active_architecture: String,
}

/// `arm64` or `armv7` for a product type such as `iPhone10,3`.
/// Empty when the product type is unknown.
pub fn active_architecture(product_type: Option<&str>) -> String {
    let Some(product_type) = product_type.filter(|p| !p.trim().is_empty()) else {
        return String::new();
    };
    let product_type = product_type.trim().to_lowercase();
    let major = product_type
        .split_once(',')
        .map(|(head, _)| {
            let digits = head.len() - head.trim_end_matches(|c: char| c.is_ascii_digit()).len();
            &head[head.len() - digits..]
        })
        .and_then(|d| d.parse::<u32>().ok())
        .unwrap_or(0);

    let arm64 = if product_type.starts_with("iphone") {
        major >= 6
    } else if product_type.starts_with("ipad") {
        major >= 4
    } else if product_type.starts_with("ipod") {
        major >= 7
    } else {
        false
    };
    let arch = if arm64 { "arm64" } else { "armv7" };
    arch.to_string()
}

/// A device reachable through a bridge
#[derive(Debug)]
pub struct Device<B: MobileDeviceBridge> {
    bridge: Arc<B>,
    handle: B::Handle,
    identifier: String,
    state: Mutex<DeviceState>,
    operation: tokio::sync::Mutex<()>,
}

/// Proof that a session is running. Only valid inside the closure given to
/// [`Device::try_execute_function`]; afterwards every call fails with
/// [`DeviceError::SessionInactive`].
#[derive(Debug)]
pub struct ActiveSession<B: MobileDeviceBridge> {
    bridge: Arc<B>,
    handle: B::Handle,
    identifier: String,
    active: Arc<AtomicBool>,
}

impl<B: MobileDeviceBridge> Clone for ActiveSession<B> {
    fn clone(&self) -> Self {
        Self {
            bridge: self.bridge.clone(),
            handle: self.handle.clone(),
            identifier: self.identifier.clone(),
            active: self.active.clone(),
        }
    }
}

impl<B: MobileDeviceBridge> ActiveSession<B> {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    fn ensure_active(&self) -> Result<(), DeviceError> {
        if self.active.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DeviceError::SessionInactive)
        }
    }

    /// Starts a named service. The returned transport outlives the session.
    pub async fn start_service(&self, name: &str) -> Result<Service, DeviceError> {
        self.ensure_active()?;
        debug!("Starting service {name} on {}", self.identifier);
        let socket = self
            .bridge
            .start_service(&self.handle, name)
            .await
            .map_err(service::start_failure)?;
        Ok(Service::new(name, socket))
    }

    pub async fn connect_to_port(&self, port: u16) -> Result<DeviceSocket, DeviceError> {
        self.ensure_active()?;
        self.bridge.connect_to_port(&self.handle, port).await
    }

    pub async fn copy_value(&self, key: &str) -> Result<Option<Message>, DeviceError> {
        self.ensure_active()?;
        self.bridge.copy_value(&self.handle, key).await
    }

    /// Mounts a developer disk image. An image that is already mounted is fine.
    pub async fn mount_image(&self, image: &Path, signature: &[u8]) -> Result<(), DeviceError> {
        self.ensure_active()?;
        info!("Mounting {}", image.display());
        match self.bridge.mount_image(&self.handle, image, signature).await {
            Ok(()) => Ok(()),
            Err(e) => match e.code() {
                Some(IMAGE_ALREADY_MOUNTED_ERROR_CODE) => {
                    debug!("Developer image already mounted on {}", self.identifier);
                    Ok(())
                }
                Some(INCOMPATIBLE_IMAGE_SIGNATURE_ERROR_CODE) => {
                    Err(DeviceError::IncompatibleImageSignature)
                }
                _ => Err(e),
            },
        }
    }
}

impl<B: MobileDeviceBridge> Device<B> {
    pub fn new(bridge: Arc<B>, handle: B::Handle) -> Self {
        let identifier = bridge.device_identifier(&handle);
        Self {
            bridge,
            handle,
            identifier,
            state: Mutex::new(DeviceState::Disconnected),
            operation: tokio::sync::Mutex::new(()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn handle(&self) -> &B::Handle {
        &self.handle
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Runs `f` inside a fresh session
    ///
    /// Operations on one device are serialized: a second caller waits until
    /// the first one has disconnected. The session is stopped and the device
    /// disconnected on every exit path, including a panic inside `f`.
    /// When `f` fails its error wins over any cleanup error.
    pub async fn try_execute_function<T, F, Fut>(&self, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce(ActiveSession<B>) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let _guard = self.operation.lock().await;

        self.bridge
            .connect(&self.handle)
            .await
            .map_err(|e| e.with_hint("Unable to connect to device"))?;
        self.set_state(DeviceState::Connected);

        let outcome = match self.pair_and_validate().await {
            Ok(()) => AssertUnwindSafe(self.run_session(f)).catch_unwind().await,
            Err(e) => Ok(Err(e)),
        };

        let disconnected = self
            .bridge
            .disconnect(&self.handle)
            .await
            .map_err(|e| e.with_hint("Unable to disconnect from device"));
        self.set_state(DeviceState::Disconnected);

        let value = match outcome {
            Ok(result) => result?,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        disconnected?;
        Ok(value)
    }

    async fn pair_and_validate(&self) -> Result<(), DeviceError> {
        if !self.bridge.is_paired(&self.handle).await? {
            info!("Pairing with {}", self.identifier);
            self.bridge.pair(&self.handle).await.map_err(|e| {
                e.with_hint("If your phone is locked with a passcode, unlock then reconnect it")
            })?;
        }
        self.bridge
            .validate_pairing(&self.handle)
            .await
            .map_err(|e| e.with_hint("Unable to validate pairing"))?;
        self.set_state(DeviceState::Paired);
        Ok(())
    }

    async fn run_session<T, F, Fut>(&self, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce(ActiveSession<B>) -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        self.bridge
            .start_session(&self.handle)
            .await
            .map_err(|e| e.with_hint("Unable to start session"))?;
        self.set_state(DeviceState::SessionActive);

        let active = Arc::new(AtomicBool::new(true));
        let session = ActiveSession {
            bridge: self.bridge.clone(),
            handle: self.handle.clone(),
            identifier: self.identifier.clone(),
            active: active.clone(),
        };
        let outcome = AssertUnwindSafe(f(session)).catch_unwind().await;
        active.store(false, Ordering::Release);

        let stopped = self
            .bridge
            .stop_session(&self.handle)
            .await
            .map_err(|e| e.with_hint("Unable to stop session"));
        self.set_state(DeviceState::SessionStopped);

        let result = match outcome {
            Ok(r) => r,
            Err(panic) => {
                warn!("Operation on {} panicked, session released", self.identifier);
                std::panic::resume_unwind(panic)
            }
        };
        let value = result?;
        stopped?;
        Ok(value)
    }

    /// Starts a service in its own session and hands back the transport
    pub async fn start_service(&self, name: &str) -> Result<Service, DeviceError> {
        let name = name.to_string();
        self.try_execute_function(|s| async move { s.start_service(&name).await })
            .await
    }

    pub async fn connect_to_port(&self, port: u16) -> Result<DeviceSocket, DeviceError> {
        self.try_execute_function(|s| async move { s.connect_to_port(port).await })
            .await
    }

    /// Reads one device property in its own session
    pub async fn get_value(&self, key: &str) -> Result<Option<Message>, DeviceError> {
        let key = key.to_string();
        self.try_execute_function(|s| async move { s.copy_value(&key).await })
            .await
    }

    pub async fn device_info(&self) -> Result<DeviceInfo, DeviceError> {
        let identifier = self.identifier.clone();
        self.try_execute_function(|s| async move {
            let mut values = Vec::with_capacity(5);
            for key in [
                "DeviceName",
                "ProductType",
                "ProductVersion",
                "BuildVersion",
                "DeviceColor",
            ] {
                values.push(
                    s.copy_value(key)
                        .await?
                        .and_then(|v| v.as_str().map(str::to_string)),
                );
            }
            let [name, product_type, version, build_version, color]: [Option<String>; 5] =
                values.try_into().map_err(|_| DeviceError::UnexpectedResponse)?;

            let is_tablet = product_type
                .as_deref()
                .is_some_and(|p| p.to_lowercase().contains("ipad"));
            Ok(DeviceInfo {
                active_architecture: active_architecture(product_type.as_deref()),
                display_name: name.unwrap_or_else(|| product_type.clone().unwrap_or_default()),
                identifier,
                vendor: "Apple".to_string(),
                product_type: product_type.unwrap_or_default(),
                version: version.unwrap_or_default(),
                build_version: build_version.unwrap_or_default(),
                color: color.unwrap_or_default(),
                is_tablet,
            })
        })
        .await
    }

    pub async fn active_architecture(&self) -> Result<String, DeviceError> {
        let product_type = self.get_value("ProductType").await?;
        Ok(active_architecture(product_type.as_ref().and_then(Message::as_str)))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;
    use crate::{bridge::fake::FakeBridge, service::ServiceName};

    fn device(bridge: &Arc<FakeBridge>) -> Device<FakeBridge> {
        Device::new(bridge.clone(), "udid-1".to_string())
    }

    #[tokio::test]
    async fn operation_is_bracketed_by_session() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.set_paired(true);
        let (socket, _peer) = duplex(64);
        bridge.add_service(ServiceName::AFC, Box::new(socket));

        let dev = device(&bridge);
        let service = dev.start_service(ServiceName::AFC).await.unwrap();
        assert_eq!(service.name(), ServiceName::AFC);
        assert_eq!(dev.state(), DeviceState::Disconnected);
        assert_eq!(
            bridge.calls(),
            [
                "connect:udid-1",
                "is_paired:udid-1",
                "validate_pairing:udid-1",
                "start_session:udid-1",
                "start_service:udid-1",
                "service:com.apple.afc",
                "stop_session:udid-1",
                "disconnect:udid-1",
            ]
        );
    }

    #[tokio::test]
    async fn unpaired_device_is_paired_first() {
        let bridge = Arc::new(FakeBridge::new());
        device(&bridge).get_value("ProductVersion").await.unwrap();
        let calls = bridge.calls();
        assert_eq!(calls[1..3], ["is_paired:udid-1", "pair:udid-1"]);
    }

    #[tokio::test]
    async fn failed_operation_still_releases_session() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.set_paired(true);
        bridge.fail("stop_session", 5);
        let err = device(&bridge)
            .try_execute_function(|_| async { Err::<(), _>(DeviceError::UnexpectedResponse) })
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnexpectedResponse));
        let calls = bridge.calls();
        assert_eq!(
            calls[calls.len() - 2..],
            ["stop_session:udid-1", "disconnect:udid-1"]
        );
    }

    #[tokio::test]
    async fn panic_still_releases_session() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.set_paired(true);
        let dev = device(&bridge);
        let res = AssertUnwindSafe(dev.try_execute_function(|_| async {
            if bridge.calls().len() > 1 {
                panic!("operation blew up");
            }
            Ok::<(), DeviceError>(())
        }))
        .catch_unwind()
        .await;
        assert!(res.is_err());
        let calls = bridge.calls();
        assert_eq!(
            calls[calls.len() - 2..],
            ["stop_session:udid-1", "disconnect:udid-1"]
        );
        assert_eq!(dev.state(), DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_carries_code() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.fail("connect", 0xe80000e2);
        let err = device(&bridge).get_value("x").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unable to connect to device. Result code is: 3892314338"
        );
        assert_eq!(bridge.calls(), ["connect:udid-1"]);
    }

    #[tokio::test]
    async fn pairing_failure_disconnects() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.fail("pair", 0xe800001a);
        let err = device(&bridge).get_value("x").await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("If your phone is locked with a passcode"));
        assert_eq!(bridge.calls().last().map(String::as_str), Some("disconnect:udid-1"));
        assert!(!bridge.calls().iter().any(|c| c.starts_with("start_session")));
    }

    #[tokio::test]
    async fn escaped_session_is_inactive() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.set_paired(true);
        let dev = device(&bridge);
        let session = dev
            .try_execute_function(|s| async move { Ok(s) })
            .await
            .unwrap();
        let err = session.start_service(ServiceName::AFC).await.unwrap_err();
        assert!(matches!(err, DeviceError::SessionInactive));
    }

    #[tokio::test]
    async fn device_info_reads_one_session() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.set_paired(true);
        bridge.set_value("DeviceName", "Test Phone");
        bridge.set_value("ProductType", "iPad7,5");
        bridge.set_value("ProductVersion", "14.2");
        bridge.set_value("BuildVersion", "18B92");

        let info = device(&bridge).device_info().await.unwrap();
        assert_eq!(info.display_name, "Test Phone");
        assert!(info.is_tablet);
        assert_eq!(info.active_architecture, "arm64");
        assert_eq!(info.color, "");
        let sessions = bridge
            .calls()
            .iter()
            .filter(|c| c.starts_with("start_session"))
            .count();
        assert_eq!(sessions, 1);
    }

    #[tokio::test]
    async fn already_mounted_image_is_fine() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.set_paired(true);
        bridge.fail("mount_image", IMAGE_ALREADY_MOUNTED_ERROR_CODE);
        let dev = device(&bridge);
        dev.try_execute_function(|s| async move {
            s.mount_image(Path::new("/tmp/DeveloperDiskImage.dmg"), b"sig")
                .await
        })
        .await
        .unwrap();

        bridge.fail("mount_image", INCOMPATIBLE_IMAGE_SIGNATURE_ERROR_CODE);
        let err = dev
            .try_execute_function(|s| async move {
                s.mount_image(Path::new("/tmp/DeveloperDiskImage.dmg"), b"sig")
                    .await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::IncompatibleImageSignature));
    }

    #[test]
    fn architecture_by_product_type() {
        assert_eq!(active_architecture(Some("iPhone10,3")), "arm64");
        assert_eq!(active_architecture(Some("iPhone5,2")), "armv7");
        assert_eq!(active_architecture(Some("iPad3,4")), "armv7");
        assert_eq!(active_architecture(Some("iPod7,1")), "arm64");
        assert_eq!(active_architecture(None), "");
    }
}
