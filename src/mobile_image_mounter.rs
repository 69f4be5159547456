// Jackson Coxson
// Developer disk image mounting over com.apple.mobile.mobile_image_mounter

use log::{debug, error, info};

use crate::{
    message::Message,
    plist_channel::{PlistChannel, PlistFormat},
    DeviceError, DeviceSocket, IMAGE_ALREADY_MOUNTED_ERROR_CODE,
};

/// Where the image is staged, relative to the AFC root
pub const STAGING_PATH: &str = "PublicStaging/staging.dimage";
/// The staged image as the mounter sees it
pub const STAGING_DEVICE_PATH: &str = "/var/mobile/Media/PublicStaging/staging.dimage";

const IMAGE_TYPE: &str = "Developer";

/// What the device did with an image offered through `ReceiveBytes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The image bytes went over the mounter connection
    Sent,
    /// The device declined; the image has to be copied to [`STAGING_PATH`] over AFC
    NeedsStaging,
}

#[derive(Debug)]
pub struct MobileImageMounterClient {
    channel: PlistChannel,
}

impl MobileImageMounterClient {
    pub fn new(socket: DeviceSocket) -> Self {
        Self {
            channel: PlistChannel::new(socket, PlistFormat::Binary),
        }
    }

    /// Signatures of the developer images currently mounted
    pub async fn lookup_image(&self) -> Result<Vec<Vec<u8>>, DeviceError> {
        self.channel
            .send_message(&Message::dictionary([
                ("Command", "LookupImage"),
                ("ImageType", IMAGE_TYPE),
            ]))
            .await?;
        let res = self.channel.read_message().await?;
        if let Some(e) = crate::ProtocolError::from_message(&res) {
            return Err(DeviceError::Protocol(e));
        }
        Ok(match res.get("ImageSignature") {
            Some(Message::Array(sigs)) => sigs
                .iter()
                .filter_map(Message::as_data)
                .map(<[u8]>::to_vec)
                .collect(),
            Some(Message::Data(sig)) => vec![sig.clone()],
            _ => Vec::new(),
        })
    }

    pub async fn upload_image(
        &self,
        image: &[u8],
        signature: &[u8],
    ) -> Result<UploadOutcome, DeviceError> {
        self.channel
            .send_message(&Message::dictionary([
                ("Command", Message::from("ReceiveBytes")),
                ("ImageSize", Message::Integer(image.len() as i64)),
                ("ImageType", IMAGE_TYPE.into()),
                ("ImageSignature", Message::Data(signature.to_vec())),
            ]))
            .await?;

        let res = self.channel.read_message().await?;
        let status = res.string_field("Status");
        if status.as_deref() != Some("ReceiveBytesAck") {
            debug!("ReceiveBytes declined ({status:?}), staging the image instead");
            return Ok(UploadOutcome::NeedsStaging);
        }

        self.channel.send_raw(image).await?;
        let res = self.channel.read_message().await?;
        if let Some(e) = crate::ProtocolError::from_message(&res) {
            error!("Image send failure: {e}");
            return Err(DeviceError::Protocol(e));
        }
        debug!("Image upload status: {:?}", res.string_field("Status"));
        Ok(UploadOutcome::Sent)
    }

    /// Mounts the image previously uploaded or staged
    pub async fn mount_image(&self, signature: &[u8]) -> Result<(), DeviceError> {
        self.channel
            .send_message(&Message::dictionary([
                ("Command", Message::from("MountImage")),
                ("ImageType", IMAGE_TYPE.into()),
                ("ImageSignature", Message::Data(signature.to_vec())),
                ("ImagePath", STAGING_DEVICE_PATH.into()),
            ]))
            .await?;

        let res = self.channel.read_message().await?;
        if let Some(e) = crate::ProtocolError::from_message(&res) {
            if is_already_mounted(&e, res.string_field("DetailedError")) {
                return Err(DeviceError::NativeCall {
                    call: "MountImage",
                    code: IMAGE_ALREADY_MOUNTED_ERROR_CODE,
                });
            }
            return Err(DeviceError::MountFailed(
                e.error.or(e.description).unwrap_or_default(),
            ));
        }
        if let Some(status) = res.string_field("Status") {
            info!("Mount image: {status}");
        }
        Ok(())
    }

    pub async fn close(self) -> Result<(), DeviceError> {
        self.channel.close().await
    }
}

fn is_already_mounted(e: &crate::ProtocolError, detailed: Option<String>) -> bool {
    [detailed, e.detail.clone(), e.description.clone()]
        .into_iter()
        .flatten()
        .any(|text| text.to_lowercase().contains("already mounted"))
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    async fn read_request(server: &mut DuplexStream) -> Message {
        let len = server.read_u32().await.unwrap();
        let mut buf = vec![0u8; len as usize];
        server.read_exact(&mut buf).await.unwrap();
        Message::from_bytes(&buf).unwrap()
    }

    async fn reply(server: &mut DuplexStream, message: Message) {
        let payload = message.to_binary().unwrap();
        server.write_u32(payload.len() as u32).await.unwrap();
        server.write_all(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn acknowledged_upload_sends_image_bytes() {
        let (client, mut server) = duplex(65536);
        let device = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert_eq!(req.get("ImageSize").and_then(Message::as_integer), Some(4));
            reply(&mut server, Message::dictionary([("Status", "ReceiveBytesAck")])).await;
            let mut image = [0u8; 4];
            server.read_exact(&mut image).await.unwrap();
            reply(&mut server, Message::dictionary([("Status", "Complete")])).await;
            image
        });

        let mounter = MobileImageMounterClient::new(Box::new(client));
        let outcome = mounter.upload_image(b"dmg!", b"sig").await.unwrap();
        assert_eq!(outcome, UploadOutcome::Sent);
        assert_eq!(&device.await.unwrap(), b"dmg!");
    }

    #[tokio::test]
    async fn declined_upload_asks_for_staging() {
        let (client, mut server) = duplex(65536);
        tokio::spawn(async move {
            read_request(&mut server).await;
            reply(&mut server, Message::dictionary([("Status", "Unsupported")])).await;
        });
        let mounter = MobileImageMounterClient::new(Box::new(client));
        assert_eq!(
            mounter.upload_image(b"dmg!", b"sig").await.unwrap(),
            UploadOutcome::NeedsStaging
        );
    }

    #[tokio::test]
    async fn mount_error_is_reported() {
        let (client, mut server) = duplex(65536);
        let device = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            reply(&mut server, Message::dictionary([("Error", "ImageMountFailed")])).await;
            req
        });
        let mounter = MobileImageMounterClient::new(Box::new(client));
        let err = mounter.mount_image(b"sig").await.unwrap_err();
        assert_eq!(err.to_string(), "Unable to mount image. ImageMountFailed");

        let req = device.await.unwrap();
        assert_eq!(
            req.string_field("ImagePath").as_deref(),
            Some(STAGING_DEVICE_PATH)
        );
    }

    #[tokio::test]
    async fn already_mounted_reply_carries_native_code() {
        let (client, mut server) = duplex(65536);
        tokio::spawn(async move {
            read_request(&mut server).await;
            reply(
                &mut server,
                Message::dictionary([
                    ("Error", "ImageMountFailed"),
                    ("DetailedError", "Image is already mounted"),
                ]),
            )
            .await;
        });
        let mounter = MobileImageMounterClient::new(Box::new(client));
        let err = mounter.mount_image(b"sig").await.unwrap_err();
        assert_eq!(err.code(), Some(IMAGE_ALREADY_MOUNTED_ERROR_CODE));
    }

    #[tokio::test]
    async fn lookup_returns_mounted_signatures() {
        let (client, mut server) = duplex(65536);
        let device = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            reply(
                &mut server,
                Message::dictionary([
                    ("ImageSignature", Message::Array(vec![Message::Data(b"sig".to_vec())])),
                    ("Status", Message::from("Complete")),
                ]),
            )
            .await;
            req
        });
        let mounter = MobileImageMounterClient::new(Box::new(client));
        assert_eq!(mounter.lookup_image().await.unwrap(), vec![b"sig".to_vec()]);
        let req = device.await.unwrap();
        assert_eq!(req.string_field("Command").as_deref(), Some("LookupImage"));
    }
}
