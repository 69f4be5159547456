// Jackson Coxson

use log::debug;
use tokio::io::AsyncWriteExt;

use crate::{DeviceError, DeviceSocket};

/// Reverse-DNS names of the services this crate talks to
pub struct ServiceName;

impl ServiceName {
    pub const AFC: &'static str = "com.apple.afc";
    pub const INSTALLATION_PROXY: &'static str = "com.apple.mobile.installation_proxy";
    pub const HOUSE_ARREST: &'static str = "com.apple.mobile.house_arrest";
    pub const NOTIFICATION_PROXY: &'static str = "com.apple.mobile.notification_proxy";
    pub const SYSLOG_RELAY: &'static str = "com.apple.syslog_relay";
    pub const MOBILE_IMAGE_MOUNTER: &'static str = "com.apple.mobile.mobile_image_mounter";
    pub const DEBUG_SERVER: &'static str = "com.apple.debugserver";
}

/// A started service and the transport it produced.
/// Whoever holds it owns the transport; `close` consumes it.
#[derive(Debug)]
pub struct Service {
    name: String,
    socket: DeviceSocket,
}

impl Service {
    pub fn new(name: impl Into<String>, socket: DeviceSocket) -> Self {
        Self {
            name: name.into(),
            socket,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_socket(self) -> DeviceSocket {
        self.socket
    }

    pub async fn close(mut self) -> Result<(), DeviceError> {
        debug!("Closing service {}", self.name);
        self.socket.shutdown().await?;
        Ok(())
    }
}

/// Maps a failed start to the errors callers can act on
pub(crate) fn start_failure(e: DeviceError) -> DeviceError {
    match e.code() {
        Some(crate::NO_WIFI_SYNC_ERROR_CODE) => DeviceError::NoWifiSync,
        _ => e.with_hint("Unable to start service"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wifi_sync_code_is_recognised() {
        let e = start_failure(DeviceError::NativeCall {
            call: "AMDeviceStartService",
            code: crate::NO_WIFI_SYNC_ERROR_CODE,
        });
        assert!(matches!(e, DeviceError::NoWifiSync));

        let e = start_failure(DeviceError::NativeCall {
            call: "AMDeviceStartService",
            code: 7,
        });
        assert_eq!(e.to_string(), "Unable to start service. Result code is: 7");
    }
}
