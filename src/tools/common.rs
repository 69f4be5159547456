// Jackson Coxson
// Common functions between tools

use std::{sync::Arc, time::Duration};

use amdevice::{
    bridge::DefaultBridge,
    discovery::{Discovery, DiscoveryEvent, DiscoveryOptions},
    Device,
};

/// How long to wait for attach notifications before giving up
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn discover() -> Result<Discovery<DefaultBridge>, String> {
    let bridge = Arc::new(DefaultBridge::default());
    let discovery = Discovery::new(bridge, DiscoveryOptions::default());
    discovery
        .start()
        .await
        .map_err(|e| format!("Unable to watch for devices: {e}"))?;
    Ok(discovery)
}

/// Finds the device with `udid`, or the first one attached
pub async fn get_device(udid: Option<&String>) -> Result<Arc<Device<DefaultBridge>>, String> {
    let discovery = discover().await?;
    let events = discovery
        .check_for_devices(Some(DISCOVERY_TIMEOUT))
        .await
        .map_err(|e| format!("Unable to check for devices: {e}"))?;

    let mut found = events.into_iter().filter_map(|e| match e {
        DiscoveryEvent::Found(d) => Some(d),
        DiscoveryEvent::Lost(_) => None,
    });
    match udid {
        Some(udid) => found
            .find(|d| d.identifier() == udid)
            .ok_or_else(|| format!("Device not found: {udid}")),
        None => found
            .next()
            .ok_or_else(|| "No devices connected".to_string()),
    }
}
