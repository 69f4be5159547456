// Jackson Coxson

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::{debug, warn};

use crate::{message::Message, DeviceError};

use super::{Connection, UsbmuxDevice};

fn ipv6(addr: &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&addr[8..24]);
    IpAddr::V6(Ipv6Addr::from(octets))
}

fn network_address(addr: &[u8]) -> Result<Connection, DeviceError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(DeviceError::UnexpectedResponse);
    }
    Ok(match (addr[0], addr[1]) {
        (0x02, _) | (_, 0x02) => {
            Connection::Network(IpAddr::V4(Ipv4Addr::new(addr[4], addr[5], addr[6], addr[7])))
        }
        (0x1E, _) | (0x1C, 0x1E) if addr.len() >= 24 => Connection::Network(ipv6(addr)),
        (family, _) => {
            warn!("Unknown IP address protocol: {family:02X}");
            Connection::Unknown(format!("Network {family:02X}"))
        }
    })
}

/// Reads a device out of an `Attached` message or a `DeviceList` entry
pub(crate) fn device_from_message(msg: &Message) -> Result<UsbmuxDevice, DeviceError> {
    let device_id = msg
        .get("DeviceID")
        .and_then(Message::as_integer)
        .ok_or(DeviceError::UnexpectedResponse)? as u32;
    let props = msg
        .get("Properties")
        .ok_or(DeviceError::UnexpectedResponse)?;
    let udid = props
        .string_field("SerialNumber")
        .ok_or(DeviceError::UnexpectedResponse)?;

    let connection_type = match props.get("ConnectionType").and_then(Message::as_str) {
        Some("USB") => Connection::Usb,
        Some("Network") => match props.get("NetworkAddress").and_then(Message::as_data) {
            Some(addr) => network_address(addr)?,
            None => {
                warn!("Device is network attached, but has no network info");
                return Err(DeviceError::UnexpectedResponse);
            }
        },
        Some(other) => Connection::Unknown(other.to_string()),
        None => Connection::Unknown(String::new()),
    };
    debug!("Connection type: {connection_type:?}");

    Ok(UsbmuxDevice {
        connection_type,
        udid,
        device_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attached_usb_device_is_parsed() {
        let msg = Message::dictionary([
            ("MessageType", Message::from("Attached")),
            ("DeviceID", 3i64.into()),
            (
                "Properties",
                Message::dictionary([
                    ("ConnectionType", "USB"),
                    ("SerialNumber", "00008101-000A"),
                ]),
            ),
        ]);
        let dev = device_from_message(&msg).unwrap();
        assert_eq!(dev.device_id, 3);
        assert_eq!(dev.udid, "00008101-000A");
        assert_eq!(dev.connection_type, Connection::Usb);
    }

    #[test]
    fn network_device_reads_ipv4() {
        let addr = vec![0x10, 0x02, 0, 0, 192, 168, 1, 20];
        assert_eq!(
            network_address(&addr).unwrap(),
            Connection::Network(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
        );
    }
}
