// Jackson Coxson
// Sandboxed AFC access through com.apple.mobile.house_arrest

use log::debug;

use crate::{
    afc::{AfcClient, AfcConnection},
    bridge::MobileDeviceBridge,
    device::Device,
    message::Message,
    plist_channel::{PlistChannel, PlistFormat},
    service::ServiceName,
    DeviceError, DeviceSocket, ProtocolError,
};

/// Vends an application's container or documents directory over AFC
#[derive(Debug)]
pub struct HouseArrestClient {
    channel: PlistChannel,
}

impl HouseArrestClient {
    pub fn new(socket: DeviceSocket) -> Self {
        Self {
            channel: PlistChannel::new(socket, PlistFormat::Xml),
        }
    }

    pub async fn connect<B: MobileDeviceBridge>(device: &Device<B>) -> Result<Self, DeviceError> {
        let service = device.start_service(ServiceName::HOUSE_ARREST).await?;
        Ok(Self::new(service.into_socket()))
    }

    /// AFC client rooted at the application's bundle container
    pub async fn vend_container(
        self,
        bundle_id: &str,
    ) -> Result<AfcClient<AfcConnection>, DeviceError> {
        self.vend("VendContainer", bundle_id).await
    }

    /// AFC client rooted at the application's data container
    pub async fn vend_documents(
        self,
        bundle_id: &str,
    ) -> Result<AfcClient<AfcConnection>, DeviceError> {
        self.vend("VendDocuments", bundle_id).await
    }

    async fn vend(
        self,
        command: &str,
        bundle_id: &str,
    ) -> Result<AfcClient<AfcConnection>, DeviceError> {
        self.channel
            .send_message(&Message::dictionary([
                ("Command", command),
                ("Identifier", bundle_id),
            ]))
            .await?;
        let res = self.channel.read_message().await?;
        if let Some(e) = ProtocolError::from_message(&res) {
            if let Some(known) = e
                .error
                .as_deref()
                .and_then(DeviceError::from_device_error_type)
            {
                return Err(known);
            }
            return Err(DeviceError::Protocol(e));
        }
        debug!("{command} {bundle_id}: {:?}", res.string_field("Status"));

        // The same connection now speaks AFC
        Ok(AfcClient::new(AfcConnection::new(self.channel.into_inner())))
    }
}
