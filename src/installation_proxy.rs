// Jackson Coxson
// Client for com.apple.mobile.installation_proxy

use std::path::Path;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::{
    afc::{AfcClient, AfcConnection},
    bridge::MobileDeviceBridge,
    device::Device,
    message::Message,
    plist_channel::{PlistChannel, PlistFormat},
    service::ServiceName,
    DeviceError, DeviceSocket, ProtocolError,
};

/// Directory packages are staged in before `Install`
pub const STAGING_DIR: &str = "PublicStaging";

#[derive(Debug)]
pub struct InstallationProxyClient {
    channel: PlistChannel,
}

impl InstallationProxyClient {
    pub fn new(socket: DeviceSocket) -> Self {
        Self {
            channel: PlistChannel::new(socket, PlistFormat::Binary),
        }
    }

    /// Starts the installation service on `device`
    pub async fn connect<B: MobileDeviceBridge>(device: &Device<B>) -> Result<Self, DeviceError> {
        match device.start_service(ServiceName::INSTALLATION_PROXY).await {
            Ok(service) => Ok(Self::new(service.into_socket())),
            Err(e) => {
                if let DeviceError::NoWifiSync = e {
                    trace!(
                        "Unable to start {}. Looks like the problem is with WIFI sync",
                        ServiceName::INSTALLATION_PROXY
                    );
                }
                Err(e)
            }
        }
    }

    /// Copies a package to the staging directory over AFC and installs it
    pub async fn deploy<B: MobileDeviceBridge>(
        device: &Device<B>,
        package: impl AsRef<Path>,
    ) -> Result<(), DeviceError> {
        let package = package.as_ref();
        let file_name = package
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or(DeviceError::UnexpectedResponse)?;
        let device_path = format!("{STAGING_DIR}/{file_name}");

        let afc = device.start_service(ServiceName::AFC).await?;
        let mut afc = AfcClient::new(AfcConnection::new(afc.into_socket()));
        let transferred = afc.transfer_package(package, &device_path).await;
        afc.close().await?;
        transferred?;

        let client = Self::connect(device).await?;
        let installed = client.install(&device_path).await;
        client.close().await?;
        installed
    }

    /// Sends a request and collects every progress message until completion
    pub async fn send_message(&self, message: &Message) -> Result<Vec<Message>, DeviceError> {
        self.channel.exchange(message).await
    }

    /// Installs a package already present on the device
    pub async fn install(&self, package_path: &str) -> Result<(), DeviceError> {
        let responses = self
            .send_message(&Message::dictionary([
                ("Command", "Install"),
                ("PackagePath", package_path),
            ]))
            .await?;
        for r in &responses {
            trace!(
                "Install {package_path}: {} {}%",
                r.string_field("Status").unwrap_or_default(),
                r.get("PercentComplete")
                    .and_then(Message::as_integer)
                    .unwrap_or_default()
            );
        }
        debug!("Installed {package_path}");
        Ok(())
    }

    /// Lists applications of `application_type`, returning the requested attributes
    pub async fn browse(
        &self,
        application_type: &str,
        attributes: &[&str],
    ) -> Result<Vec<Message>, DeviceError> {
        let attributes: Vec<Message> = attributes.iter().map(|a| Message::from(*a)).collect();
        let responses = self
            .send_message(&Message::dictionary([
                ("Command", Message::from("Browse")),
                (
                    "ClientOptions",
                    Message::dictionary([
                        ("ApplicationType", Message::from(application_type)),
                        ("ReturnAttributes", Message::from(attributes)),
                    ]),
                ),
            ]))
            .await?;
        Ok(responses
            .iter()
            .filter_map(|r| r.get("CurrentList").and_then(Message::as_array))
            .flatten()
            .cloned()
            .collect())
    }

    /// Looks up installed applications, keyed by bundle identifier
    pub async fn lookup(
        &self,
        bundle_identifiers: Option<&[String]>,
    ) -> Result<IndexMap<String, Message>, DeviceError> {
        let mut options = vec![("ApplicationType", Message::from("Any"))];
        if let Some(ids) = bundle_identifiers {
            let ids: Vec<Message> = ids.iter().map(|i| Message::from(i.as_str())).collect();
            options.push(("BundleIDs", ids.into()));
        }
        self.channel
            .send_message(&Message::dictionary([
                ("Command", Message::from("Lookup")),
                ("ClientOptions", Message::dictionary(options)),
            ]))
            .await?;

        let res = self.channel.read_message().await?;
        if let Some(e) = ProtocolError::from_message(&res) {
            return Err(DeviceError::Protocol(e));
        }
        match res {
            Message::Dictionary(mut d) => match d.shift_remove("LookupResult") {
                Some(Message::Dictionary(apps)) => Ok(apps),
                _ => Err(DeviceError::UnexpectedResponse),
            },
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    pub async fn uninstall(&self, bundle_identifier: &str) -> Result<(), DeviceError> {
        self.send_message(&Message::dictionary([
            ("Command", Message::from("Uninstall")),
            ("ApplicationIdentifier", bundle_identifier.into()),
            ("ClientOptions", Message::dictionary::<&str, Message, _>([])),
        ]))
        .await?;
        debug!("Application {bundle_identifier} has been uninstalled");
        Ok(())
    }

    pub async fn close(self) -> Result<(), DeviceError> {
        self.channel.close().await
    }
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

    fn app(id: &str, live_sync: Option<bool>) -> Message {
        let mut entries = vec![("CFBundleIdentifier", Message::from(id))];
        if let Some(l) = live_sync {
            entries.push(("IceniumLiveSyncEnabled", l.into()));
        }
        Message::dictionary(entries)
    }

    #[tokio::test]
    async fn browse_joins_pages() {
        let (client, mut server) = duplex(65536);
        let device = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            for list in [
                vec![app("com.a", None), app("com.b", Some(true))],
                vec![app("com.c", Some(false))],
            ] {
                reply(
                    &mut server,
                    Message::dictionary([
                        ("Status", Message::from("BrowsingApplications")),
                        ("CurrentList", Message::from(list)),
                    ]),
                )
                .await;
            }
            reply(&mut server, Message::dictionary([("Status", "Complete")])).await;
            req
        });

        let proxy = InstallationProxyClient::new(Box::new(client));
        let apps = proxy
            .browse("User", &["CFBundleIdentifier", "IceniumLiveSyncEnabled"])
            .await
            .unwrap();
        let ids: Vec<_> = apps
            .iter()
            .filter_map(|a| a.string_field("CFBundleIdentifier"))
            .collect();
        assert_eq!(ids, ["com.a", "com.b", "com.c"]);

        let req = device.await.unwrap();
        assert_eq!(
            req.get("ClientOptions")
                .and_then(|o| o.string_field("ApplicationType"))
                .as_deref(),
            Some("User")
        );
    }

    #[tokio::test]
    async fn install_waits_for_completion() {
        let (client, mut server) = duplex(65536);
        let device = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            reply(
                &mut server,
                Message::dictionary([
                    ("Status", Message::from("CopyingFiles")),
                    ("PercentComplete", Message::Integer(10)),
                ]),
            )
            .await;
            reply(&mut server, Message::dictionary([("Status", "Complete")])).await;
            req
        });
        let proxy = InstallationProxyClient::new(Box::new(client));
        proxy.install("PublicStaging/app.ipa").await.unwrap();
        let req = device.await.unwrap();
        assert_eq!(
            req.string_field("PackagePath").as_deref(),
            Some("PublicStaging/app.ipa")
        );
    }

    #[tokio::test]
    async fn install_error_fails() {
        let (client, mut server) = duplex(65536);
        tokio::spawn(async move {
            read_request(&mut server).await;
            reply(
                &mut server,
                Message::dictionary([
                    ("Error", "APIInternalError"),
                    ("ErrorDescription", "Could not install"),
                ]),
            )
            .await;
        });
        let proxy = InstallationProxyClient::new(Box::new(client));
        let err = proxy.install("PublicStaging/app.ipa").await.unwrap_err();
        assert_eq!(err.to_string(), "APIInternalError: Could not install");
    }

    #[tokio::test]
    async fn lookup_returns_result_dictionary() {
        let (client, mut server) = duplex(65536);
        tokio::spawn(async move {
            read_request(&mut server).await;
            reply(
                &mut server,
                Message::dictionary([
                    (
                        "LookupResult",
                        Message::dictionary([(
                            "com.a",
                            Message::dictionary([("Path", "/private/var/containers/A.app")]),
                        )]),
                    ),
                    ("Status", Message::from("Complete")),
                ]),
            )
            .await;
        });
        let proxy = InstallationProxyClient::new(Box::new(client));
        let apps = proxy.lookup(None).await.unwrap();
        assert_eq!(
            apps["com.a"].string_field("Path").as_deref(),
            Some("/private/var/containers/A.app")
        );
    }
}
