// Jackson Coxson
//! Client for com.apple.mobile.notification_proxy
//!
//! The connection stays open: requests go out on the write half while
//! pushed `RelayNotification` documents are read from the other half and
//! handed to the observers registered for their name.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use log::{debug, trace, warn};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
};

use crate::{
    bridge::MobileDeviceBridge,
    device::Device,
    message::Message,
    plist_channel::{encode_frame, PlistFormat, XmlDocumentBuffer},
    service::ServiceName,
    DeviceError, DeviceSocket,
};

/// Called with the notification name. Identity is the `Arc` allocation.
pub type NotificationObserver = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug)]
struct Reader {
    socket: ReadHalf<DeviceSocket>,
    xml: XmlDocumentBuffer,
}

pub struct NotificationProxyClient {
    writer: Mutex<WriteHalf<DeviceSocket>>,
    reader: Mutex<Reader>,
    observers: StdMutex<HashMap<String, Vec<NotificationObserver>>>,
}

impl std::fmt::Debug for NotificationProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let observed: Vec<String> = self.observers().keys().cloned().collect();
        f.debug_struct("NotificationProxyClient")
            .field("observed", &observed)
            .finish()
    }
}

impl NotificationProxyClient {
    pub fn new(socket: DeviceSocket) -> Self {
        let (read, write) = tokio::io::split(socket);
        Self {
            writer: Mutex::new(write),
            reader: Mutex::new(Reader {
                socket: read,
                xml: XmlDocumentBuffer::default(),
            }),
            observers: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn connect<B: MobileDeviceBridge>(device: &Device<B>) -> Result<Self, DeviceError> {
        let service = device.start_service(ServiceName::NOTIFICATION_PROXY).await?;
        Ok(Self::new(service.into_socket()))
    }

    fn observers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<NotificationObserver>>> {
        self.observers.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn send(&self, message: Message) -> Result<(), DeviceError> {
        debug!("Sending plist: {message:?}");
        let frame = encode_frame(PlistFormat::Xml, &message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Asks the device to relay `name` and registers `observer` for it
    pub async fn add_observer(
        &self,
        name: &str,
        observer: NotificationObserver,
    ) -> Result<(), DeviceError> {
        self.send(Message::dictionary([
            ("Command", "ObserveNotification"),
            ("Name", name),
        ]))
        .await?;
        self.observers()
            .entry(name.to_string())
            .or_default()
            .push(observer);
        Ok(())
    }

    /// Unregisters one observer. The device keeps relaying the name.
    pub fn remove_observer(&self, name: &str, observer: &NotificationObserver) {
        if let Some(list) = self.observers().get_mut(name) {
            if let Some(i) = list.iter().position(|o| Arc::ptr_eq(o, observer)) {
                list.remove(i);
            }
        }
    }

    pub async fn post_notification(&self, name: &str) -> Result<(), DeviceError> {
        self.send(Message::dictionary([
            ("Command", "PostNotification"),
            ("Name", name),
            ("ClientOptions", ""),
        ]))
        .await
    }

    fn dispatch(&self, document: &[u8]) -> Option<String> {
        let message = match Message::from_bytes(document) {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping unreadable notification document: {e}");
                return None;
            }
        };
        match message.get("Command").and_then(Message::as_str) {
            Some("RelayNotification") => {}
            Some("ProxyDeath") => {
                debug!("Notification proxy is shutting down");
                return None;
            }
            other => {
                trace!("Ignoring notification proxy command {other:?}");
                return None;
            }
        }
        let name = message.string_field("Name")?;
        // Clone the list so observers may add or remove observers themselves
        let observers = self.observers().get(&name).cloned().unwrap_or_default();
        for observer in observers {
            observer(&name);
        }
        Some(name)
    }

    /// Waits for pushed documents and dispatches every complete one
    ///
    /// # Returns
    /// The relayed notification names, or `None` once the device closed the stream
    pub async fn receive_notifications(&self) -> Result<Option<Vec<String>>, DeviceError> {
        let mut reader = self.reader.lock().await;
        let Reader { socket, xml } = &mut *reader;
        let Some(first) = xml.read_from(socket).await? else {
            return Ok(None);
        };
        let mut relayed = Vec::new();
        let mut next = Some(first);
        while let Some(doc) = next {
            relayed.extend(self.dispatch(&doc));
            next = xml.next_document();
        }
        Ok(Some(relayed))
    }

    /// Dispatches notifications until the device closes the connection
    pub async fn run(&self) -> Result<(), DeviceError> {
        while self.receive_notifications().await?.is_some() {}
        Ok(())
    }

    pub async fn close(self) -> Result<(), DeviceError> {
        let mut socket = self
            .reader
            .into_inner()
            .socket
            .unsplit(self.writer.into_inner());
        socket.shutdown().await?;
        Ok(())
    }
}
