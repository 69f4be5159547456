// Jackson Coxson
//! Property-list message framing over a service transport
//!
//! Every message goes out as a 4-byte big-endian length followed by the
//! encoded plist. Binary channels read replies the same way; XML channels
//! locate `<plist`...`</plist>` documents in the byte stream, since pushed
//! documents may arrive concatenated in one buffer.

use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::Mutex,
};

use crate::{message::Message, DeviceError, DeviceSocket, ProtocolError};

const PLIST_OPEN: &[u8] = b"<plist";
const PLIST_CLOSE: &[u8] = b"</plist>";
const READ_CHUNK: usize = 4096;

/// Largest length prefix accepted from the wire
pub const MAX_MESSAGE_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlistFormat {
    Binary,
    Xml,
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Encodes `message` with its 4-byte big-endian length prefix
pub fn encode_frame(format: PlistFormat, message: &Message) -> Result<Vec<u8>, DeviceError> {
    let payload = match format {
        PlistFormat::Binary => message.to_binary()?,
        PlistFormat::Xml => message.to_xml()?,
    };
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Accumulates bytes and hands out complete XML plist documents
#[derive(Debug, Default)]
pub struct XmlDocumentBuffer {
    buf: Vec<u8>,
}

impl XmlDocumentBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Removes and returns the first complete document, leaving the rest
    pub fn next_document(&mut self) -> Option<Vec<u8>> {
        let start = find(&self.buf, PLIST_OPEN, 0)?;
        let end = find(&self.buf, PLIST_CLOSE, start)? + PLIST_CLOSE.len();
        let doc = self.buf[start..end].to_vec();
        self.buf.drain(..end);
        Some(doc)
    }

    /// Reads from `reader` until a document is complete.
    /// Returns `None` when the stream ends first.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        reader: &mut R,
    ) -> Result<Option<Vec<u8>>, DeviceError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(doc) = self.next_document() {
                return Ok(Some(doc));
            }
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                return Ok(None);
            }
            trace!("Buffered {read} bytes of xml plist data");
            self.push(&chunk[..read]);
        }
    }
}

#[derive(Debug)]
struct ChannelInner {
    socket: DeviceSocket,
    xml: XmlDocumentBuffer,
}

/// One request/response channel. The lock admits one exchange at a time.
#[derive(Debug)]
pub struct PlistChannel {
    format: PlistFormat,
    inner: Mutex<ChannelInner>,
}

impl PlistChannel {
    pub fn new(socket: DeviceSocket, format: PlistFormat) -> Self {
        Self {
            format,
            inner: Mutex::new(ChannelInner {
                socket,
                xml: XmlDocumentBuffer::default(),
            }),
        }
    }

    pub fn format(&self) -> PlistFormat {
        self.format
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        self.send_locked(&mut inner, message).await
    }

    pub async fn read_message(&self) -> Result<Message, DeviceError> {
        let mut inner = self.inner.lock().await;
        self.read_locked(&mut inner).await
    }

    /// Reads until the service reports completion, collecting progress messages
    pub async fn receive_message(&self) -> Result<Vec<Message>, DeviceError> {
        let mut inner = self.inner.lock().await;
        self.receive_locked(&mut inner).await
    }

    /// Sends a request and accumulates its responses under one lock
    pub async fn exchange(&self, message: &Message) -> Result<Vec<Message>, DeviceError> {
        let mut inner = self.inner.lock().await;
        self.send_locked(&mut inner, message).await?;
        self.receive_locked(&mut inner).await
    }

    pub async fn send_raw(&self, bytes: &[u8]) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        inner.socket.write_all(bytes).await?;
        inner.socket.flush().await?;
        Ok(())
    }

    /// Reads up to `max` bytes. An empty result means the peer closed.
    pub async fn read_raw(&self, max: usize) -> Result<Vec<u8>, DeviceError> {
        let mut inner = self.inner.lock().await;
        let mut buf = vec![0u8; max];
        let read = inner.socket.read(&mut buf).await?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Gives the transport back, discarding any buffered bytes
    pub fn into_inner(self) -> DeviceSocket {
        self.inner.into_inner().socket
    }

    pub async fn close(self) -> Result<(), DeviceError> {
        let mut socket = self.into_inner();
        socket.shutdown().await?;
        Ok(())
    }

    async fn send_locked(
        &self,
        inner: &mut ChannelInner,
        message: &Message,
    ) -> Result<(), DeviceError> {
        debug!("Sending plist: {message:?}");
        inner.socket.write_all(&encode_frame(self.format, message)?).await?;
        inner.socket.flush().await?;
        Ok(())
    }

    async fn read_locked(&self, inner: &mut ChannelInner) -> Result<Message, DeviceError> {
        let bytes = match self.format {
            PlistFormat::Binary => {
                let len = inner.socket.read_u32().await?;
                if len > MAX_MESSAGE_LEN {
                    return Err(DeviceError::UnexpectedResponse);
                }
                let mut buf = vec![0u8; len as usize];
                inner.socket.read_exact(&mut buf).await?;
                buf
            }
            PlistFormat::Xml => {
                let ChannelInner { socket, xml } = inner;
                match xml.read_from(socket).await? {
                    Some(doc) => doc,
                    None => {
                        return Err(DeviceError::Socket(std::io::Error::from(
                            std::io::ErrorKind::UnexpectedEof,
                        )))
                    }
                }
            }
        };
        let message = Message::from_bytes(&bytes)?;
        debug!("Received plist: {message:?}");
        Ok(message)
    }

    async fn receive_locked(&self, inner: &mut ChannelInner) -> Result<Vec<Message>, DeviceError> {
        let mut messages = Vec::new();
        loop {
            let message = self.read_locked(inner).await?;
            if let Some(e) = ProtocolError::from_message(&message) {
                return Err(DeviceError::Protocol(e));
            }
            match message.get("Status").and_then(Message::as_str) {
                Some("Complete") => return Ok(messages),
                Some(status) => {
                    trace!("Service status: {status}");
                    messages.push(message);
                }
                None => {
                    messages.push(message);
                    return Ok(messages);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt};

    use super::*;

    fn framed(message: &Message) -> Vec<u8> {
        let payload = message.to_binary().unwrap();
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend(payload);
        out
    }

    fn status(s: &str) -> Message {
        Message::dictionary([("Status", s)])
    }

    #[tokio::test]
    async fn accumulates_until_complete() {
        let (client, mut server) = duplex(8192);
        for m in [status("Running"), status("Running"), status("Complete")] {
            server.write_all(&framed(&m)).await.unwrap();
        }
        let channel = PlistChannel::new(Box::new(client), PlistFormat::Binary);
        let messages = channel.receive_message().await.unwrap();
        assert_eq!(messages, vec![status("Running"), status("Running")]);
    }

    #[tokio::test]
    async fn error_field_fails_with_its_text() {
        let (client, mut server) = duplex(8192);
        server
            .write_all(&framed(&Message::dictionary([("Error", "X")])))
            .await
            .unwrap();
        let channel = PlistChannel::new(Box::new(client), PlistFormat::Binary);
        let err = channel.receive_message().await.unwrap_err();
        assert_eq!(err.to_string(), "X");
    }

    #[tokio::test]
    async fn message_without_status_ends_accumulation() {
        let (client, mut server) = duplex(8192);
        let reply = Message::dictionary([("LookupResult", Message::dictionary::<&str, Message, _>([]))]);
        server.write_all(&framed(&reply)).await.unwrap();
        let channel = PlistChannel::new(Box::new(client), PlistFormat::Binary);
        assert_eq!(channel.receive_message().await.unwrap(), vec![reply]);
    }

    #[tokio::test]
    async fn sends_length_prefixed_xml() {
        let (client, mut server) = duplex(8192);
        let channel = PlistChannel::new(Box::new(client), PlistFormat::Xml);
        let msg = Message::dictionary([("Command", "ObserveNotification")]);
        channel.send_message(&msg).await.unwrap();

        let len = server.read_u32().await.unwrap();
        let mut payload = vec![0u8; len as usize];
        server.read_exact(&mut payload).await.unwrap();
        assert!(payload.starts_with(b"<?xml"));
        assert_eq!(Message::from_bytes(&payload).unwrap(), msg);
    }

    #[tokio::test]
    async fn xml_replies_accumulate_until_complete() {
        let (client, mut server) = duplex(8192);
        let mut pushed = Vec::new();
        for m in [status("CreatingStagingDirectory"), status("Complete")] {
            let payload = m.to_xml().unwrap();
            pushed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            pushed.extend(payload);
        }
        server.write_all(&pushed).await.unwrap();

        let channel = PlistChannel::new(Box::new(client), PlistFormat::Xml);
        let messages = channel.receive_message().await.unwrap();
        assert_eq!(messages, vec![status("CreatingStagingDirectory")]);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (client, mut server) = duplex(8192);
        server.write_u32(MAX_MESSAGE_LEN + 1).await.unwrap();
        let channel = PlistChannel::new(Box::new(client), PlistFormat::Binary);
        assert!(matches!(
            channel.read_message().await,
            Err(DeviceError::UnexpectedResponse)
        ));
    }

    #[test]
    fn xml_buffer_splits_concatenated_documents() {
        let first = Message::dictionary([("Name", "a")]).to_xml().unwrap();
        let second = Message::dictionary([("Name", "b")]).to_xml().unwrap();
        let mut buffer = XmlDocumentBuffer::default();
        buffer.push(&[0, 0, 1, 0]);
        buffer.push(&first);
        buffer.push(&second[..second.len() / 2]);

        let doc = buffer.next_document().unwrap();
        assert_eq!(
            Message::from_bytes(&doc).unwrap().string_field("Name").as_deref(),
            Some("a")
        );
        assert!(buffer.next_document().is_none());

        buffer.push(&second[second.len() / 2..]);
        let doc = buffer.next_document().unwrap();
        assert_eq!(
            Message::from_bytes(&doc).unwrap().string_field("Name").as_deref(),
            Some("b")
        );
    }
}
