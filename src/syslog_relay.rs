// Jackson Coxson
// Streams the device system log from com.apple.syslog_relay

use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    bridge::MobileDeviceBridge, device::Device, service::ServiceName, DeviceError, DeviceSocket,
};

const READ_SIZE: usize = 1024;

#[derive(Debug)]
pub struct SyslogRelayClient {
    socket: DeviceSocket,
}

impl SyslogRelayClient {
    pub fn new(socket: DeviceSocket) -> Self {
        Self { socket }
    }

    pub async fn connect<B: MobileDeviceBridge>(device: &Device<B>) -> Result<Self, DeviceError> {
        let service = device.start_service(ServiceName::SYSLOG_RELAY).await?;
        Ok(Self::new(service.into_socket()))
    }

    /// Next piece of log text, with the relay's NUL separators removed.
    /// `None` once the device closes the stream.
    pub async fn next_chunk(&mut self) -> Result<Option<String>, DeviceError> {
        let mut buf = [0u8; READ_SIZE];
        let read = self.socket.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        trace!("syslog_relay: {read} bytes");
        let text: Vec<u8> = buf[..read].iter().copied().filter(|b| *b != 0).collect();
        Ok(Some(String::from_utf8_lossy(&text).into_owned()))
    }

    pub async fn close(mut self) -> Result<(), DeviceError> {
        self.socket.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn strips_nul_and_ends_on_close() {
        let (client, mut server) = duplex(4096);
        server
            .write_all(b"Oct 19 12:00:00 iPhone kernel[0]: hello\n\0")
            .await
            .unwrap();
        drop(server);

        let mut relay = SyslogRelayClient::new(Box::new(client));
        let chunk = relay.next_chunk().await.unwrap().unwrap();
        assert_eq!(chunk, "Oct 19 12:00:00 iPhone kernel[0]: hello\n");
        assert_eq!(relay.next_chunk().await.unwrap(), None);
    }
}
