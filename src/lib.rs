// Jackson Coxson
//! Apple mobile device protocol stack.
//!
//! Discovers attached devices, brackets every operation in a
//! connect/pair/session lifecycle, opens named services and speaks the
//! protocols that run over them: length-prefixed and XML plist channels,
//! AFC file transfer and the debugserver subset of the GDB remote protocol.

pub mod afc;
pub mod application_manager;
pub mod bridge;
pub mod debug_server;
pub mod device;
pub mod discovery;
pub mod file_system;
pub mod house_arrest;
pub mod installation_proxy;
pub mod message;
pub mod mobile_image_mounter;
pub mod notification_proxy;
pub mod plist_channel;
pub mod service;
pub mod syslog_relay;

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use afc::errors::AfcError;
pub use device::{ActiveSession, Device, DeviceInfo, DeviceState};
pub use discovery::{Discovery, DiscoveryEvent};
pub use message::Message;
pub use service::{Service, ServiceName};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream and UnixStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Boxed transport returned by the service multiplexer
pub type DeviceSocket = Box<dyn ReadWrite>;

/// Native result code for "Apple Mobile Device Service is not running"
pub const APPLE_SERVICE_NOT_STARTED_ERROR_CODE: u32 = 0xE8000063;
/// kAMDNoWifiSyncSupportError
pub const NO_WIFI_SYNC_ERROR_CODE: u32 = 3892314239;
/// The developer image is already mounted
pub const IMAGE_ALREADY_MOUNTED_ERROR_CODE: u32 = 3892314230;
/// The developer image signature does not match the device
pub const INCOMPATIBLE_IMAGE_SIGNATURE_ERROR_CODE: u32 = 3892314163;

/// Error fields reported by a device service inside a decoded message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolError {
    pub error: Option<String>,
    pub description: Option<String>,
    pub detail: Option<String>,
}

impl ProtocolError {
    /// Extracts the `Error`, `ErrorDescription` and `ErrorDetail` fields.
    /// Returns `None` when the message carries none of them.
    pub fn from_message(message: &Message) -> Option<Self> {
        let res = Self {
            error: message.string_field("Error"),
            description: message.string_field("ErrorDescription"),
            detail: message.string_field("ErrorDetail"),
        };
        if res.error.is_none() && res.description.is_none() && res.detail.is_none() {
            None
        } else {
            Some(res)
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if let Some(e) = &self.error {
            parts.push(e.as_str());
        }
        if let Some(d) = &self.description {
            parts.push(d.as_str());
        }
        if let Some(d) = &self.detail {
            parts.push(d.as_str());
        }
        write!(f, "{}", parts.join(": "))
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("openssl failed")]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error("TLS handshake failed")]
    SslHandshake(#[from] openssl::ssl::Error),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("no established connection")]
    NoEstablishedConnection,

    #[error("{hint}. Result code is: {code}")]
    Session { hint: &'static str, code: u32 },
    #[error("{hint}. {source}")]
    SessionSetup {
        hint: &'static str,
        #[source]
        source: Box<DeviceError>,
    },
    #[error("native call {call} failed with {code:#x}")]
    NativeCall { call: &'static str, code: u32 },
    #[error("Cannot run and complete operations on iOS devices because Apple Mobile Device Service is not started. Verify that iTunes is installed and running on your system.")]
    ServiceNotStarted,
    #[error("Unable to start installation service. Looks like `Sync over Wi-Fi` option in iTunes is enabled. Try disabling it, reconnect the device and execute your command again.")]
    NoWifiSync,

    #[error("{0}")]
    Protocol(ProtocolError),
    #[error("Unable to find the application on a connected device. Ensure that the application is installed and try again.")]
    ApplicationLookupFailed,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("device does not have pairing file")]
    InvalidHostID,
    #[error("device is locked")]
    PasswordProtected,
    #[error("pairing trust dialog pending")]
    PairingDialogResponsePending,
    #[error("user denied pairing trust")]
    UserDeniedPairing,
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),

    #[error("device not found")]
    DeviceNotFound,
    #[error("device refused connection")]
    UsbConnectionRefused,
    #[error("bad command")]
    UsbBadCommand,
    #[error("bad device")]
    UsbBadDevice,
    #[error("usb bad version")]
    UsbBadVersion,

    #[error("afc error: {0}")]
    Afc(#[from] AfcError),
    #[error("unknown afc opcode")]
    UnknownAfcOpcode,
    #[error("invalid afc magic")]
    InvalidAfcMagic,

    #[error("Unable to send {0}.")]
    GdbResponse(String),
    #[error("Unable to kill the application.")]
    GdbKillTimeout,

    #[error("Invalid application id: {id}. All available application ids are: \n{available}")]
    InvalidApplicationId { id: String, available: String },
    #[error("Unable to mount image. {0}")]
    MountFailed(String),
    #[error("The developer disk image signature is not compatible with the device.")]
    IncompatibleImageSignature,
    #[error("Unable to find device support path.")]
    DeviceSupportNotFound,
    #[error("You must specify the path to developer disk image.")]
    DeveloperDiskImageRequired,
    #[error("this host cannot talk to devices: {0}")]
    Unsupported(&'static str),
}

impl DeviceError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Arguments
    /// * `e` - The error string from device
    ///
    /// # Returns
    /// Some(DeviceError) if the string maps to a known error type, None otherwise
    pub fn from_device_error_type(e: &str) -> Option<Self> {
        match e {
            "ApplicationLookupFailed" => Some(Self::ApplicationLookupFailed),
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "PasswordProtected" => Some(Self::PasswordProtected),
            "PairingDialogResponsePending" => Some(Self::PairingDialogResponsePending),
            "UserDeniedPairing" => Some(Self::UserDeniedPairing),
            _ => None,
        }
    }

    /// The native result code carried by this error, if any
    pub fn code(&self) -> Option<u32> {
        match self {
            DeviceError::Session { code, .. } | DeviceError::NativeCall { code, .. } => {
                Some(*code)
            }
            DeviceError::SessionSetup { source, .. } => source.code(),
            DeviceError::ServiceNotStarted => Some(APPLE_SERVICE_NOT_STARTED_ERROR_CODE),
            DeviceError::NoWifiSync => Some(NO_WIFI_SYNC_ERROR_CODE),
            DeviceError::IncompatibleImageSignature => {
                Some(INCOMPATIBLE_IMAGE_SIGNATURE_ERROR_CODE)
            }
            _ => None,
        }
    }

    /// Attaches a lifecycle hint to a failed native call
    pub(crate) fn with_hint(self, hint: &'static str) -> Self {
        match self {
            DeviceError::NativeCall { code, .. } => DeviceError::Session { hint, code },
            e @ DeviceError::Session { .. } => e,
            e => DeviceError::SessionSetup {
                hint,
                source: Box::new(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_carries_code_and_hint() {
        let e = DeviceError::NativeCall {
            call: "AMDeviceConnect",
            code: 0xe80000e2,
        }
        .with_hint("Unable to connect to device");
        assert_eq!(
            e.to_string(),
            "Unable to connect to device. Result code is: 3892314338"
        );
        assert_eq!(e.code(), Some(0xe80000e2));
    }

    #[test]
    fn protocol_error_with_only_error_renders_text() {
        let e = ProtocolError {
            error: Some("X".into()),
            ..Default::default()
        };
        assert_eq!(DeviceError::Protocol(e).to_string(), "X");
    }

    #[test]
    fn known_device_errors_are_mapped() {
        assert!(matches!(
            DeviceError::from_device_error_type("ApplicationLookupFailed"),
            Some(DeviceError::ApplicationLookupFailed)
        ));
        assert!(DeviceError::from_device_error_type("SomethingElse").is_none());
    }
}
