// Jackson Coxson
// Abstractions for lockdownd

use std::pin::Pin;

use log::{debug, error};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};

use crate::{
    message::Message,
    plist_channel::{PlistChannel, PlistFormat},
    DeviceError, DeviceSocket,
};

use super::pairing::PairRecord;

pub const LOCKDOWND_PORT: u16 = 62078;

/// Label sent with every lockdown request
pub const HOST_LABEL: &str = "amdevice";

/// Wraps a device socket in TLS using the host identity from a pair record
pub(crate) async fn wrap_tls(
    socket: DeviceSocket,
    record: &PairRecord,
) -> Result<DeviceSocket, DeviceError> {
    let mut connector = SslConnector::builder(SslMethod::tls())?;
    let cert = record.host_certificate()?;
    let key = record.host_private_key()?;
    connector.set_certificate(&cert)?;
    connector.set_private_key(&key)?;
    connector.set_verify(SslVerifyMode::NONE);
    connector.set_security_level(0);
    let connector = connector.build();

    let ssl = connector
        .configure()?
        .verify_hostname(false)
        .use_server_name_indication(false)
        .into_ssl("Device")?;
    let mut stream = tokio_openssl::SslStream::new(ssl, socket)?;
    Pin::new(&mut stream).connect().await?;
    Ok(Box::new(stream))
}

#[derive(Debug)]
pub struct LockdownClient {
    channel: PlistChannel,
}

impl LockdownClient {
    pub fn new(socket: DeviceSocket) -> Self {
        Self {
            channel: PlistChannel::new(socket, PlistFormat::Xml),
        }
    }

    fn request_message<'a>(
        request: &str,
        extra: impl IntoIterator<Item = (&'a str, Message)>,
    ) -> Message {
        let mut entries = vec![
            ("Label", Message::from(HOST_LABEL)),
            ("Request", Message::from(request)),
        ];
        entries.extend(extra);
        Message::dictionary(entries)
    }

    async fn request<'a>(
        &self,
        request: &str,
        extra: impl IntoIterator<Item = (&'a str, Message)>,
    ) -> Result<Message, DeviceError> {
        self.channel
            .send_message(&Self::request_message(request, extra))
            .await?;
        let res = self.channel.read_message().await?;
        if let Some(e) = res.string_field("Error") {
            return Err(match DeviceError::from_device_error_type(&e) {
                Some(e) => e,
                None => DeviceError::UnknownErrorType(e),
            });
        }
        Ok(res)
    }

    pub async fn query_type(&self) -> Result<String, DeviceError> {
        self.request("QueryType", [])
            .await?
            .string_field("Type")
            .ok_or(DeviceError::UnexpectedResponse)
    }

    /// Reads one value. A missing value is `None`, not an error.
    pub async fn get_value(&self, key: &str) -> Result<Option<Message>, DeviceError> {
        match self.request("GetValue", [("Key", key.into())]).await {
            Ok(mut res) => Ok(match &mut res {
                Message::Dictionary(d) => d.shift_remove("Value"),
                _ => None,
            }),
            Err(DeviceError::UnknownErrorType(e)) if e == "MissingValue" => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sends the pairing request. Returns the escrow bag the device handed out.
    pub async fn pair(
        &self,
        record: &PairRecord,
        device_public_key: &[u8],
    ) -> Result<Option<Vec<u8>>, DeviceError> {
        let res = self
            .request(
                "Pair",
                [
                    ("PairRecord", record.to_request(Some(device_public_key))),
                    ("ProtocolVersion", "2".into()),
                    (
                        "PairingOptions",
                        Message::dictionary([("ExtendedPairingErrors", true)]),
                    ),
                ],
            )
            .await?;
        Ok(res
            .get("EscrowBag")
            .and_then(Message::as_data)
            .map(<[u8]>::to_vec))
    }

    pub async fn validate_pair(&self, record: &PairRecord) -> Result<(), DeviceError> {
        self.request(
            "ValidatePair",
            [
                ("PairRecord", record.to_request(None)),
                ("ProtocolVersion", "2".into()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Starts a session and upgrades the connection to TLS when asked to.
    /// Returns the client to keep using and the session identifier.
    pub async fn start_session(
        self,
        record: &PairRecord,
    ) -> Result<(Self, String), DeviceError> {
        let res = self
            .request(
                "StartSession",
                [
                    ("HostID", record.host_id.clone().into()),
                    ("SystemBUID", record.system_buid.clone().into()),
                ],
            )
            .await?;
        let session_id = res
            .string_field("SessionID")
            .ok_or(DeviceError::UnexpectedResponse)?;

        match res.get("EnableSessionSSL").and_then(Message::as_bool) {
            Some(true) => {
                debug!("Upgrading lockdown session {session_id} to TLS");
                let socket = wrap_tls(self.channel.into_inner(), record).await?;
                Ok((Self::new(socket), session_id))
            }
            Some(false) => Ok((self, session_id)),
            None => {
                error!("Response didn't contain EnableSessionSSL bool!");
                Err(DeviceError::UnexpectedResponse)
            }
        }
    }

    pub async fn stop_session(&self, session_id: &str) -> Result<(), DeviceError> {
        self.request("StopSession", [("SessionID", session_id.into())])
            .await?;
        Ok(())
    }

    /// Asks lockdownd to start a service
    ///
    /// # Returns
    /// The port number and whether to enable SSL
    pub async fn start_service(&self, name: &str) -> Result<(u16, bool), DeviceError> {
        let res = self
            .request("StartService", [("Service", name.into())])
            .await?;
        let port = match res.get("Port").and_then(Message::as_integer) {
            Some(p) if (1..=u16::MAX as i64).contains(&p) => p as u16,
            _ => {
                error!("Response didn't contain an integer port");
                return Err(DeviceError::UnexpectedResponse);
            }
        };
        let ssl = res
            .get("EnableServiceSSL")
            .and_then(Message::as_bool)
            .unwrap_or(false);
        Ok((port, ssl))
    }

    pub async fn close(self) -> Result<(), DeviceError> {
        self.channel.close().await
    }
}
