//! USB Multiplexing Daemon (usbmuxd) adapter
//!
//! Talks to usbmuxd for device notifications, pair records and port
//! connections, and to lockdownd on each device for pairing, sessions and
//! service startup. Works on every host that runs usbmuxd or Apple's
//! equivalent service.

use std::{
    collections::HashMap,
    net::{AddrParseError, IpAddr, SocketAddr},
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex as StdMutex},
    future::Future,
    time::Duration,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, info, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use crate::{
    afc::{AfcClient, AfcConnection},
    message::Message,
    mobile_image_mounter::{MobileImageMounterClient, UploadOutcome, STAGING_PATH},
    plist_channel::MAX_MESSAGE_LEN,
    service::ServiceName,
    DeviceError, DeviceSocket, IMAGE_ALREADY_MOUNTED_ERROR_CODE,
};

use super::{DeviceNotification, MobileDeviceBridge, NotificationKind, NotificationRegistry};

mod des;
pub mod lockdown;
pub mod pairing;

use lockdown::{wrap_tls, LockdownClient, LOCKDOWND_PORT};
use pairing::PairRecord;

/// Represents the connection type of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device as usbmuxd reports it
#[derive(Debug, Clone)]
pub struct UsbmuxDevice {
    pub connection_type: Connection,
    /// Unique Device Identifier
    pub udid: String,
    /// usbmuxd-assigned device ID
    pub device_id: u32,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug)]
pub enum UsbmuxdAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    pub async fn to_socket(&self) -> Result<DeviceSocket, DeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, DeviceError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Reads `USBMUXD_SOCKET_ADDRESS`, falling back to the platform default.
    /// `UNIX:/path` and bare paths select a unix socket, `host:port` selects TCP.
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                #[cfg(unix)]
                if let Some(path) = var.strip_prefix("UNIX:") {
                    Self::UnixSocket(path.to_string())
                } else if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
                #[cfg(not(unix))]
                Self::TcpSocket(SocketAddr::from_str(&var)?)
            }
            Err(_) => Self::default(),
        })
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// Active connection to the usbmuxd service
#[derive(Debug)]
pub struct UsbmuxdConnection {
    socket: DeviceSocket,
    tag: u32,
}

impl UsbmuxdConnection {
    /// XML PLIST protocol version
    pub const XML_PLIST_VERSION: u32 = 1;
    /// PLIST message type
    pub const PLIST_MESSAGE_TYPE: u32 = 8;
    const HEADER_LEN: u32 = 16;

    pub fn new(socket: DeviceSocket, tag: u32) -> Self {
        Self { socket, tag }
    }

    fn request(message_type: &str, extra: Vec<(&str, Message)>) -> Message {
        let mut entries = vec![
            ("MessageType", Message::from(message_type)),
            ("ClientVersionString", Message::from("amdevice")),
            ("ProgName", Message::from("amdevice")),
            ("kLibUSBMuxVersion", Message::Integer(3)),
        ];
        entries.extend(extra);
        Message::dictionary(entries)
    }

    fn result_number(res: &Message) -> Option<i64> {
        res.get("Number").and_then(Message::as_integer)
    }

    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxDevice>, DeviceError> {
        self.write_plist(&Self::request("ListDevices", vec![])).await?;
        let res = self.read_plist().await?;
        let list = res
            .get("DeviceList")
            .and_then(Message::as_array)
            .ok_or(DeviceError::UnexpectedResponse)?;
        Ok(list
            .iter()
            .filter_map(|d| des::device_from_message(d).ok())
            .collect())
    }

    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairRecord, DeviceError> {
        debug!("Getting pair record for {udid}");
        self.write_plist(&Self::request(
            "ReadPairRecord",
            vec![("PairRecordID", udid.into())],
        ))
        .await?;
        let res = self.read_plist().await?;
        match res.get("PairRecordData").and_then(Message::as_data) {
            Some(d) => PairRecord::from_bytes(d),
            None => Err(DeviceError::InvalidHostID),
        }
    }

    pub async fn get_buid(&mut self) -> Result<String, DeviceError> {
        self.write_plist(&Self::request("ReadBUID", vec![])).await?;
        self.read_plist()
            .await?
            .string_field("BUID")
            .ok_or(DeviceError::UnexpectedResponse)
    }

    pub async fn save_pair_record(
        &mut self,
        device_id: u32,
        udid: &str,
        record: &PairRecord,
    ) -> Result<(), DeviceError> {
        self.write_plist(&Self::request(
            "SavePairRecord",
            vec![
                ("PairRecordData", Message::Data(record.serialize()?)),
                ("DeviceID", Message::Integer(device_id as i64)),
                ("PairRecordID", udid.into()),
            ],
        ))
        .await?;
        match Self::result_number(&self.read_plist().await?) {
            Some(0) => Ok(()),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Connects to a TCP port on the device. On success the usbmuxd socket
    /// becomes the device connection.
    ///
    /// # Arguments
    /// * `port` - port in host byte order
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
    ) -> Result<DeviceSocket, DeviceError> {
        debug!("Connecting to device {device_id} on port {port}");
        self.write_plist(&Self::request(
            "Connect",
            vec![
                ("DeviceID", Message::Integer(device_id as i64)),
                ("PortNumber", Message::Integer(port.to_be() as i64)),
            ],
        ))
        .await?;
        match Self::result_number(&self.read_plist().await?) {
            Some(0) => Ok(self.socket),
            Some(1) => Err(DeviceError::UsbBadCommand),
            Some(2) => Err(DeviceError::UsbBadDevice),
            Some(3) => Err(DeviceError::UsbConnectionRefused),
            Some(6) => Err(DeviceError::UsbBadVersion),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Switches the connection into listen mode
    pub async fn listen(&mut self) -> Result<(), DeviceError> {
        self.write_plist(&Self::request("Listen", vec![])).await?;
        match Self::result_number(&self.read_plist().await?) {
            Some(0) => Ok(()),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    async fn write_plist(&mut self, req: &Message) -> Result<(), DeviceError> {
        let body = req.to_xml()?;
        let mut raw = Vec::with_capacity(Self::HEADER_LEN as usize + body.len());
        for field in [
            Self::HEADER_LEN + body.len() as u32,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        ] {
            raw.extend_from_slice(&field.to_le_bytes());
        }
        raw.extend_from_slice(&body);
        self.socket.write_all(&raw).await?;
        self.socket.flush().await?;
        Ok(())
    }

    pub async fn read_plist(&mut self) -> Result<Message, DeviceError> {
        let mut header = [0u8; Self::HEADER_LEN as usize];
        self.socket.read_exact(&mut header).await?;
        let total = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let body_len = total
            .checked_sub(Self::HEADER_LEN)
            .filter(|len| *len <= MAX_MESSAGE_LEN)
            .ok_or(DeviceError::UnexpectedResponse)?;
        debug!("Reading {body_len} bytes from muxer");

        let mut body = vec![0u8; body_len as usize];
        self.socket.read_exact(&mut body).await?;
        let res = Message::from_bytes(&body)?;
        debug!("Read from muxer: {res:?}");
        Ok(res)
    }
}

/// Per-device connection state kept between lifecycle calls
#[derive(Debug, Default)]
struct DeviceLink {
    lockdown: Option<LockdownClient>,
    record: Option<PairRecord>,
    session_id: Option<String>,
}

/// [`MobileDeviceBridge`] over usbmuxd and lockdownd
#[derive(Debug)]
pub struct UsbmuxBridge {
    addr: UsbmuxdAddr,
    links: StdMutex<HashMap<u32, Arc<Mutex<DeviceLink>>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<DeviceNotification<UsbmuxDevice>>>>,
    registry: StdMutex<Option<Arc<NotificationRegistry<UsbmuxDevice>>>>,
    listener: StdMutex<Option<JoinHandle<()>>>,
}

impl Default for UsbmuxBridge {
    fn default() -> Self {
        Self::new(UsbmuxdAddr::from_env_var().unwrap_or_default())
    }
}

async fn listen_loop(
    mut conn: UsbmuxdConnection,
    tx: mpsc::UnboundedSender<DeviceNotification<UsbmuxDevice>>,
) {
    let mut known: HashMap<u32, UsbmuxDevice> = HashMap::new();
    loop {
        let msg = match conn.read_plist().await {
            Ok(m) => m,
            Err(e) => {
                warn!("usbmuxd listen connection ended: {e}");
                return;
            }
        };
        let device_id = msg
            .get("DeviceID")
            .and_then(Message::as_integer)
            .map(|i| i as u32);
        let notification = match msg.get("MessageType").and_then(Message::as_str) {
            Some("Attached") => match des::device_from_message(&msg) {
                Ok(dev) => {
                    known.insert(dev.device_id, dev.clone());
                    Some(DeviceNotification {
                        kind: NotificationKind::Connected,
                        handle: dev,
                    })
                }
                Err(e) => {
                    warn!("Failed to read attached device: {e:?}");
                    None
                }
            },
            Some("Detached") => device_id
                .and_then(|id| known.remove(&id))
                .map(|handle| DeviceNotification {
                    kind: NotificationKind::Disconnected,
                    handle,
                }),
            Some("Paired") => device_id
                .and_then(|id| known.get(&id).cloned())
                .map(|handle| DeviceNotification {
                    kind: NotificationKind::Trusted,
                    handle,
                }),
            other => {
                warn!("Received unexpected message type during listen: {other:?}");
                None
            }
        };
        if let Some(n) = notification {
            if tx.send(n).is_err() {
                return;
            }
        }
    }
}

impl UsbmuxBridge {
    pub fn new(addr: UsbmuxdAddr) -> Self {
        Self {
            addr,
            links: StdMutex::new(HashMap::new()),
            events: Mutex::new(None),
            registry: StdMutex::new(None),
            listener: StdMutex::new(None),
        }
    }

    fn link(&self, handle: &UsbmuxDevice) -> Arc<Mutex<DeviceLink>> {
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(handle.device_id)
            .or_default()
            .clone()
    }

    async fn pair_record(
        &self,
        handle: &UsbmuxDevice,
        link: &mut DeviceLink,
    ) -> Result<PairRecord, DeviceError> {
        if let Some(r) = &link.record {
            return Ok(r.clone());
        }
        let record = self
            .addr
            .connect(handle.device_id)
            .await?
            .get_pair_record(&handle.udid)
            .await?;
        link.record = Some(record.clone());
        Ok(record)
    }

    async fn open_port(&self, handle: &UsbmuxDevice, port: u16) -> Result<DeviceSocket, DeviceError> {
        self.addr
            .connect(handle.device_id)
            .await?
            .connect_to_device(handle.device_id, port)
            .await
    }
}

fn not_connected() -> DeviceError {
    DeviceError::NoEstablishedConnection
}

impl MobileDeviceBridge for UsbmuxBridge {
    type Handle = UsbmuxDevice;

    async fn subscribe(
        &self,
        registry: Arc<NotificationRegistry<UsbmuxDevice>>,
    ) -> Result<(), DeviceError> {
        let mut conn = self.addr.connect(0).await?;
        conn.listen().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(listen_loop(conn, tx));

        *self.events.lock().await = Some(rx);
        *self.registry.lock().unwrap_or_else(|e| e.into_inner()) = Some(registry);
        if let Some(old) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            old.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), DeviceError> {
        if let Some(task) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        *self.events.lock().await = None;
        *self.registry.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn run_loop(&self, timeout: Duration) -> Result<(), DeviceError> {
        let registry = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut events = self.events.lock().await;
        let (Some(registry), Some(rx)) = (registry, events.as_mut()) else {
            tokio::time::sleep(timeout).await;
            return Ok(());
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(n)) => registry.dispatch(n),
                Ok(None) => {
                    warn!("usbmuxd listener stopped delivering notifications");
                    *events = None;
                    return Ok(());
                }
                Err(_) => return Ok(()),
            }
        }
    }

    fn device_identifier(&self, handle: &UsbmuxDevice) -> String {
        handle.udid.clone()
    }

    async fn connect(&self, handle: &UsbmuxDevice) -> Result<(), DeviceError> {
        let socket = self.open_port(handle, LOCKDOWND_PORT).await?;
        let lockdown = LockdownClient::new(socket);
        let kind = lockdown.query_type().await?;
        if kind != "com.apple.mobile.lockdown" {
            warn!("Unexpected lockdown type {kind}");
        }
        let link = self.link(handle);
        let mut link = link.lock().await;
        link.lockdown = Some(lockdown);
        link.session_id = None;
        Ok(())
    }

    async fn disconnect(&self, handle: &UsbmuxDevice) -> Result<(), DeviceError> {
        let link = self.link(handle);
        let lockdown = link.lock().await.lockdown.take();
        self.links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.device_id);
        match lockdown {
            Some(l) => l.close().await,
            None => Ok(()),
        }
    }

    async fn is_paired(&self, handle: &UsbmuxDevice) -> Result<bool, DeviceError> {
        let link = self.link(handle);
        let mut link = link.lock().await;
        match self.pair_record(handle, &mut link).await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("No usable pair record for {}: {e}", handle.udid);
                Ok(false)
            }
        }
    }

    async fn pair(&self, handle: &UsbmuxDevice) -> Result<(), DeviceError> {
        let link = self.link(handle);
        let mut link = link.lock().await;
        let lockdown = link.lockdown.as_ref().ok_or_else(not_connected)?;

        let device_public_key = lockdown
            .get_value("DevicePublicKey")
            .await?
            .and_then(|v| v.as_data().map(<[u8]>::to_vec))
            .ok_or(DeviceError::UnexpectedResponse)?;
        let wifi_mac_address = lockdown
            .get_value("WiFiAddress")
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let system_buid = self.addr.connect(handle.device_id).await?.get_buid().await?;
        let host_id = uuid::Uuid::new_v4().to_string().to_uppercase();

        let mut record =
            PairRecord::generate(&device_public_key, host_id, system_buid, wifi_mac_address)?;
        record.escrow_bag = lockdown
            .pair(&record, &device_public_key)
            .await?
            .map(Into::into);

        self.addr
            .connect(handle.device_id)
            .await?
            .save_pair_record(handle.device_id, &handle.udid, &record)
            .await?;
        info!("Paired with {}", handle.udid);
        link.record = Some(record);
        Ok(())
    }

    async fn validate_pairing(&self, handle: &UsbmuxDevice) -> Result<(), DeviceError> {
        let link = self.link(handle);
        let mut link = link.lock().await;
        let record = self.pair_record(handle, &mut link).await?;
        link.lockdown
            .as_ref()
            .ok_or_else(not_connected)?
            .validate_pair(&record)
            .await
    }

    async fn start_session(&self, handle: &UsbmuxDevice) -> Result<(), DeviceError> {
        let link = self.link(handle);
        let mut link = link.lock().await;
        let record = self.pair_record(handle, &mut link).await?;
        let lockdown = link.lockdown.take().ok_or_else(not_connected)?;
        let (lockdown, session_id) = lockdown.start_session(&record).await?;
        link.lockdown = Some(lockdown);
        link.session_id = Some(session_id);
        Ok(())
    }

    async fn stop_session(&self, handle: &UsbmuxDevice) -> Result<(), DeviceError> {
        let link = self.link(handle);
        let mut link = link.lock().await;
        let session_id = link.session_id.take().ok_or(DeviceError::SessionInactive)?;
        link.lockdown
            .as_ref()
            .ok_or_else(not_connected)?
            .stop_session(&session_id)
            .await
    }

    async fn copy_value(
        &self,
        handle: &UsbmuxDevice,
        key: &str,
    ) -> Result<Option<Message>, DeviceError> {
        let link = self.link(handle);
        let link = link.lock().await;
        link.lockdown
            .as_ref()
            .ok_or_else(not_connected)?
            .get_value(key)
            .await
    }

    async fn start_service(
        &self,
        handle: &UsbmuxDevice,
        name: &str,
    ) -> Result<DeviceSocket, DeviceError> {
        let link = self.link(handle);
        let mut link = link.lock().await;
        let (port, ssl) = link
            .lockdown
            .as_ref()
            .ok_or_else(not_connected)?
            .start_service(name)
            .await?;
        debug!("Service {name} started on port {port} (ssl: {ssl})");

        let socket = self.open_port(handle, port).await?;
        if ssl {
            let record = self.pair_record(handle, &mut link).await?;
            wrap_tls(socket, &record).await
        } else {
            Ok(socket)
        }
    }

    async fn connect_to_port(
        &self,
        handle: &UsbmuxDevice,
        port: u16,
    ) -> Result<DeviceSocket, DeviceError> {
        self.open_port(handle, port).await
    }

    async fn mount_image(
        &self,
        handle: &UsbmuxDevice,
        image: &Path,
        signature: &[u8],
    ) -> Result<(), DeviceError> {
        let socket = self
            .start_service(handle, ServiceName::MOBILE_IMAGE_MOUNTER)
            .await?;
        let mounter = MobileImageMounterClient::new(socket);
        let res = mount_with(&mounter, image, signature, || async {
            let afc = self.start_service(handle, ServiceName::AFC).await?;
            let mut afc = AfcClient::new(AfcConnection::new(afc));
            afc.transfer(image, STAGING_PATH).await?;
            afc.close().await
        })
        .await;
        mounter.close().await?;
        res
    }
}

/// Uploads and mounts `image` through `mounter`
///
/// # Arguments
/// * `stage` - copies the image to [`STAGING_PATH`] when the device declines the upload
///
/// # Errors
/// A native [`IMAGE_ALREADY_MOUNTED_ERROR_CODE`] error when the device
/// already reports a mounted developer image
async fn mount_with<F, Fut>(
    mounter: &MobileImageMounterClient,
    image: &Path,
    signature: &[u8],
    stage: F,
) -> Result<(), DeviceError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), DeviceError>>,
{
    if !mounter.lookup_image().await?.is_empty() {
        return Err(DeviceError::NativeCall {
            call: "LookupImage",
            code: IMAGE_ALREADY_MOUNTED_ERROR_CODE,
        });
    }
    let bytes = tokio::fs::read(image).await?;
    if mounter.upload_image(&bytes, signature).await? == UploadOutcome::NeedsStaging {
        stage().await?;
    }
    mounter.mount_image(signature).await
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    async fn answer(server: &mut tokio::io::DuplexStream, reply: Message) -> Message {
        let mut header = [0u8; 16];
        server.read_exact(&mut header).await.unwrap();
        let total = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        assert_eq!(u32::from_le_bytes([header[4], header[5], header[6], header[7]]), 1);
        assert_eq!(u32::from_le_bytes([header[8], header[9], header[10], header[11]]), 8);
        let mut body = vec![0u8; total as usize - 16];
        server.read_exact(&mut body).await.unwrap();

        let payload = reply.to_xml().unwrap();
        let mut out = Vec::new();
        for f in [16 + payload.len() as u32, 1, 8, 0] {
            out.extend_from_slice(&f.to_le_bytes());
        }
        out.extend(payload);
        server.write_all(&out).await.unwrap();
        Message::from_bytes(&body).unwrap()
    }

    #[tokio::test]
    async fn connect_sends_network_order_port() {
        let (client, mut server) = duplex(8192);
        let device = tokio::spawn(async move {
            answer(&mut server, Message::dictionary([("Number", Message::Integer(0))])).await
        });
        let conn = UsbmuxdConnection::new(Box::new(client), 1);
        conn.connect_to_device(5, LOCKDOWND_PORT).await.unwrap();
        let request = device.await.unwrap();
        assert_eq!(request.string_field("MessageType").as_deref(), Some("Connect"));
        assert_eq!(
            request.get("PortNumber").and_then(Message::as_integer),
            Some(LOCKDOWND_PORT.to_be() as i64)
        );
    }

    #[tokio::test]
    async fn oversized_muxer_reply_is_rejected() {
        let (client, mut server) = duplex(8192);
        let mut header = Vec::new();
        for f in [MAX_MESSAGE_LEN + 17, 1, 8, 0] {
            header.extend_from_slice(&f.to_le_bytes());
        }
        server.write_all(&header).await.unwrap();
        let mut conn = UsbmuxdConnection::new(Box::new(client), 1);
        assert!(matches!(
            conn.read_plist().await,
            Err(DeviceError::UnexpectedResponse)
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_typed() {
        let (client, mut server) = duplex(8192);
        let device = tokio::spawn(async move {
            answer(&mut server, Message::dictionary([("Number", Message::Integer(3))])).await
        });
        let conn = UsbmuxdConnection::new(Box::new(client), 1);
        let err = conn.connect_to_device(5, 1234).await.unwrap_err();
        assert!(matches!(err, DeviceError::UsbConnectionRefused));
        device.await.unwrap();
    }

    async fn mounter_request(server: &mut tokio::io::DuplexStream) -> Message {
        let len = server.read_u32().await.unwrap();
        let mut buf = vec![0u8; len as usize];
        server.read_exact(&mut buf).await.unwrap();
        Message::from_bytes(&buf).unwrap()
    }

    async fn mounter_reply(server: &mut tokio::io::DuplexStream, reply: Message) {
        let payload = reply.to_binary().unwrap();
        server.write_u32(payload.len() as u32).await.unwrap();
        server.write_all(&payload).await.unwrap();
    }

    fn mounted_signatures(sigs: Vec<Message>) -> Message {
        Message::dictionary([
            ("ImageSignature", Message::Array(sigs)),
            ("Status", Message::from("Complete")),
        ])
    }

    #[tokio::test]
    async fn mounted_image_is_reported_before_upload() {
        let (client, mut server) = duplex(65536);
        let device = tokio::spawn(async move {
            let req = mounter_request(&mut server).await;
            mounter_reply(
                &mut server,
                mounted_signatures(vec![Message::Data(b"sig".to_vec())]),
            )
            .await;
            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            (req, rest)
        });

        let mounter = MobileImageMounterClient::new(Box::new(client));
        let err = mount_with(&mounter, Path::new("/nonexistent.dmg"), b"sig", || async {
            Err(DeviceError::UnexpectedResponse)
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), Some(IMAGE_ALREADY_MOUNTED_ERROR_CODE));
        mounter.close().await.unwrap();

        let (req, rest) = device.await.unwrap();
        assert_eq!(req.string_field("Command").as_deref(), Some("LookupImage"));
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn declined_upload_is_staged_then_mounted() {
        let image = std::env::temp_dir().join(format!("{}.dmg", uuid::Uuid::new_v4()));
        tokio::fs::write(&image, b"dmg!").await.unwrap();

        let (client, mut server) = duplex(65536);
        let device = tokio::spawn(async move {
            let mut commands = Vec::new();
            let req = mounter_request(&mut server).await;
            commands.push(req.string_field("Command"));
            mounter_reply(&mut server, mounted_signatures(vec![])).await;

            let req = mounter_request(&mut server).await;
            commands.push(req.string_field("Command"));
            mounter_reply(&mut server, Message::dictionary([("Status", "Unsupported")])).await;

            let req = mounter_request(&mut server).await;
            commands.push(req.string_field("Command"));
            assert_eq!(
                req.string_field("ImagePath").as_deref(),
                Some(crate::mobile_image_mounter::STAGING_DEVICE_PATH)
            );
            mounter_reply(&mut server, Message::dictionary([("Status", "Complete")])).await;
            commands
        });

        let staged = StdMutex::new(false);
        let mounter = MobileImageMounterClient::new(Box::new(client));
        mount_with(&mounter, &image, b"sig", || async {
            *staged.lock().unwrap() = true;
            Ok(())
        })
        .await
        .unwrap();

        assert!(*staged.lock().unwrap());
        let commands: Vec<_> = device.await.unwrap().into_iter().flatten().collect();
        assert_eq!(commands, ["LookupImage", "ReceiveBytes", "MountImage"]);
        let _ = tokio::fs::remove_file(&image).await;
    }
}
