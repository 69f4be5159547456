// Jackson Coxson
//! Host adapters for the native mobile device layer
//!
//! Everything above this module talks to devices through
//! [`MobileDeviceBridge`]. Each adapter owns its own unsafe or wire-level
//! details; the protocol code only sees handles, sockets and [`Message`]s.

use std::{collections::VecDeque, future::Future, path::Path, sync::Arc, time::Duration};

use crate::{message::Message, DeviceError, DeviceSocket};

#[cfg(test)]
pub mod fake;
#[cfg(target_os = "macos")]
pub mod macos;
pub mod usbmux;

/// The adapter used by default on this host
#[cfg(target_os = "macos")]
pub type DefaultBridge = macos::MacBridge;
#[cfg(not(target_os = "macos"))]
pub type DefaultBridge = usbmux::UsbmuxBridge;

/// Device notification message codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NotificationKind {
    Connected = 1,
    Disconnected = 2,
    Trusted = 4,
}

impl NotificationKind {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Connected),
            2 => Some(Self::Disconnected),
            4 => Some(Self::Trusted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceNotification<H> {
    pub kind: NotificationKind,
    pub handle: H,
}

/// Dispatch table the native callback feeds.
/// Discovery owns one and drains it after every run-loop pass.
#[derive(Debug)]
pub struct NotificationRegistry<H> {
    pending: std::sync::Mutex<VecDeque<DeviceNotification<H>>>,
}

impl<H> Default for NotificationRegistry<H> {
    fn default() -> Self {
        Self {
            pending: std::sync::Mutex::new(VecDeque::new()),
        }
    }
}

impl<H> NotificationRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatch(&self, notification: DeviceNotification<H>) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(notification);
    }

    /// Takes every pending notification in arrival order
    pub fn drain(&self) -> Vec<DeviceNotification<H>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }
}

/// The operations the protocol stack needs from the host's device layer
///
/// Every call that can block is exposed as a future. Lifecycle calls are
/// made in order by [`crate::device::Device`]; nothing else should call them.
pub trait MobileDeviceBridge: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + std::fmt::Debug + 'static;

    /// Registers for attach, detach and trust notifications
    fn subscribe(
        &self,
        registry: Arc<NotificationRegistry<Self::Handle>>,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn unsubscribe(&self) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Delivers pending notifications for at most `timeout`
    fn run_loop(&self, timeout: Duration) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn device_identifier(&self, handle: &Self::Handle) -> String;

    fn connect(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn disconnect(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn is_paired(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<bool, DeviceError>> + Send;

    fn pair(&self, handle: &Self::Handle) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn validate_pairing(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn start_session(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    fn stop_session(
        &self,
        handle: &Self::Handle,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Reads a device property. `None` when the device has no such value.
    fn copy_value(
        &self,
        handle: &Self::Handle,
        key: &str,
    ) -> impl Future<Output = Result<Option<Message>, DeviceError>> + Send;

    fn start_service(
        &self,
        handle: &Self::Handle,
        name: &str,
    ) -> impl Future<Output = Result<DeviceSocket, DeviceError>> + Send;

    /// Opens a raw connection to a TCP port on the device
    fn connect_to_port(
        &self,
        handle: &Self::Handle,
        port: u16,
    ) -> impl Future<Output = Result<DeviceSocket, DeviceError>> + Send;

    fn mount_image(
        &self,
        handle: &Self::Handle,
        image: &Path,
        signature: &[u8],
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_drains_in_order() {
        let registry = NotificationRegistry::new();
        registry.dispatch(DeviceNotification {
            kind: NotificationKind::Connected,
            handle: "a",
        });
        registry.dispatch(DeviceNotification {
            kind: NotificationKind::Trusted,
            handle: "a",
        });
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[1].kind, NotificationKind::Trusted);
        assert!(registry.drain().is_empty());
        assert_eq!(NotificationKind::from_code(3), None);
    }
}
