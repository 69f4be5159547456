// Jackson Coxson
//! Polls the native layer for attached, detached and trusted devices
//!
//! The bridge delivers notifications through callbacks into a
//! [`NotificationRegistry`]. [`Discovery::check_for_devices`] runs one
//! bounded run-loop pass and turns whatever arrived into events.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    bridge::{DeviceNotification, MobileDeviceBridge, NotificationKind, NotificationRegistry},
    device::Device,
    DeviceError, APPLE_SERVICE_NOT_STARTED_ERROR_CODE,
};

/// How long a check waits for notifications when no timeout is given
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions {
    pub poll_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub enum DiscoveryEvent<B: MobileDeviceBridge> {
    Found(Arc<Device<B>>),
    Lost(String),
}

pub struct Discovery<B: MobileDeviceBridge> {
    bridge: Arc<B>,
    options: DiscoveryOptions,
    registry: Arc<NotificationRegistry<B::Handle>>,
    devices: Mutex<HashMap<String, Arc<Device<B>>>>,
    started: Mutex<bool>,
}

impl<B: MobileDeviceBridge> std::fmt::Debug for Discovery<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discovery")
            .field("options", &self.options)
            .field("devices", &self.devices().len())
            .finish()
    }
}

impl<B: MobileDeviceBridge> Discovery<B> {
    pub fn new(bridge: Arc<B>, options: DiscoveryOptions) -> Self {
        Self {
            bridge,
            options,
            registry: Arc::new(NotificationRegistry::new()),
            devices: Mutex::new(HashMap::new()),
            started: Mutex::new(false),
        }
    }

    fn known(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Device<B>>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_started(&self) -> bool {
        *self.started.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_started(&self, started: bool) {
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = started;
    }

    /// Subscribes to device notifications. Calling it again is a no-op.
    ///
    /// # Errors
    /// [`DeviceError::ServiceNotStarted`] when the host's device service is
    /// not running
    pub async fn start(&self) -> Result<(), DeviceError> {
        if self.is_started() {
            return Ok(());
        }
        self.bridge
            .subscribe(self.registry.clone())
            .await
            .map_err(|e| match e {
                DeviceError::NativeCall { code, .. }
                    if code == APPLE_SERVICE_NOT_STARTED_ERROR_CODE =>
                {
                    DeviceError::ServiceNotStarted
                }
                DeviceError::Socket(io)
                    if matches!(
                        io.kind(),
                        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
                    ) =>
                {
                    DeviceError::ServiceNotStarted
                }
                e => e,
            })?;
        self.set_started(true);
        debug!("Subscribed to device notifications");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        if !self.is_started() {
            return Ok(());
        }
        self.set_started(false);
        self.bridge.unsubscribe().await
    }

    /// Devices currently attached, by identifier
    pub fn devices(&self) -> Vec<Arc<Device<B>>> {
        self.known().values().cloned().collect()
    }

    pub fn device(&self, identifier: &str) -> Option<Arc<Device<B>>> {
        self.known().get(identifier).cloned()
    }

    /// Runs the native event loop for up to `timeout` and reports what changed
    ///
    /// Subscribes first if [`Self::start`] was not called.
    ///
    /// # Arguments
    /// * `timeout` - how long to wait, [`DiscoveryOptions::poll_timeout`] when `None`
    ///
    /// # Returns
    /// Events in arrival order. A trust change yields `Lost` then a fresh `Found`.
    pub async fn check_for_devices(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<DiscoveryEvent<B>>, DeviceError> {
        if !self.is_started() {
            self.start().await?;
        }
        self.bridge
            .run_loop(timeout.unwrap_or(self.options.poll_timeout))
            .await?;

        let mut events = Vec::new();
        for notification in self.registry.drain() {
            self.handle(notification, &mut events);
        }
        Ok(events)
    }

    fn handle(
        &self,
        notification: DeviceNotification<B::Handle>,
        events: &mut Vec<DiscoveryEvent<B>>,
    ) {
        let identifier = self.bridge.device_identifier(&notification.handle);
        match notification.kind {
            NotificationKind::Connected => {
                events.push(self.found(notification.handle));
            }
            NotificationKind::Disconnected => {
                if self.known().remove(&identifier).is_none() {
                    warn!("Detach for unknown device {identifier}");
                }
                info!("Device lost: {identifier}");
                events.push(DiscoveryEvent::Lost(identifier));
            }
            // Trust changes what the device allows, so rebuild it from scratch
            NotificationKind::Trusted => {
                self.known().remove(&identifier);
                info!("Device trust changed: {identifier}");
                events.push(DiscoveryEvent::Lost(identifier));
                events.push(self.found(notification.handle));
            }
        }
    }

    fn found(&self, handle: B::Handle) -> DiscoveryEvent<B> {
        let device = Arc::new(Device::new(self.bridge.clone(), handle));
        info!("Device found: {}", device.identifier());
        self.known()
            .insert(device.identifier().to_string(), device.clone());
        DiscoveryEvent::Found(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::FakeBridge;

    #[tokio::test]
    async fn trust_is_lost_then_found_again() {
        let bridge = Arc::new(FakeBridge::new());
        let discovery = Discovery::new(bridge.clone(), DiscoveryOptions::default());
        discovery.start().await.unwrap();

        bridge.notify(NotificationKind::Connected, "1");
        let events = discovery.check_for_devices(None).await.unwrap();
        let first = match events.as_slice() {
            [DiscoveryEvent::Found(d)] => d.clone(),
            other => panic!("unexpected events {other:?}"),
        };
        assert_eq!(first.identifier(), "1");

        bridge.notify(NotificationKind::Trusted, "1");
        let events = discovery.check_for_devices(None).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], DiscoveryEvent::Lost(id) if id == "1"));
        match &events[1] {
            DiscoveryEvent::Found(d) => {
                assert_eq!(d.identifier(), "1");
                assert!(!Arc::ptr_eq(d, &first));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(discovery.devices().len(), 1);
    }

    #[tokio::test]
    async fn detach_forgets_device() {
        let bridge = Arc::new(FakeBridge::new());
        let discovery = Discovery::new(bridge.clone(), DiscoveryOptions::default());

        bridge.notify(NotificationKind::Connected, "a");
        bridge.notify(NotificationKind::Connected, "b");
        // the first check subscribes on its own
        assert_eq!(discovery.check_for_devices(None).await.unwrap().len(), 2);

        bridge.notify(NotificationKind::Disconnected, "a");
        let events = discovery.check_for_devices(None).await.unwrap();
        assert!(matches!(&events[..], [DiscoveryEvent::Lost(id)] if id == "a"));
        assert!(discovery.device("a").is_none());
        assert!(discovery.device("b").is_some());
    }

    #[tokio::test]
    async fn missing_service_is_reported() {
        let bridge = Arc::new(FakeBridge::new());
        bridge.fail("subscribe", APPLE_SERVICE_NOT_STARTED_ERROR_CODE);
        let discovery = Discovery::new(bridge, DiscoveryOptions::default());
        let err = discovery.start().await.unwrap_err();
        assert!(matches!(err, DeviceError::ServiceNotStarted));
    }
}
