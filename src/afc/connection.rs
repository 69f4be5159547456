// Jackson Coxson

use std::collections::{HashMap, VecDeque};

use log::{debug, error};
use tokio::io::AsyncWriteExt;

use crate::{DeviceError, DeviceSocket};

use super::{
    errors::AfcError,
    opcode::AfcOpcode,
    packet::AfcPacket,
    AfcPrimitives,
};

/// Maximum payload of one write packet (64KB)
const MAX_TRANSFER: usize = 64 * 1024;

/// AFC primitives spoken over a raw service socket
#[derive(Debug)]
pub struct AfcConnection {
    socket: DeviceSocket,
    packet_num: u64,
    directories: HashMap<u64, VecDeque<String>>,
    next_directory: u64,
}

fn c_string(s: &str) -> Vec<u8> {
    let mut res = Vec::with_capacity(s.len() + 1);
    res.extend_from_slice(s.as_bytes());
    res.push(0);
    res
}

impl AfcConnection {
    pub fn new(socket: DeviceSocket) -> Self {
        Self {
            socket,
            packet_num: 0,
            directories: HashMap::new(),
            next_directory: 1,
        }
    }

    async fn request(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Result<AfcPacket, DeviceError> {
        let packet = AfcPacket::new(operation, self.packet_num, header_payload, payload);
        self.packet_num += 1;
        debug!(
            "Send afc: {operation:?} #{} ({} bytes)",
            packet.header.packet_num, packet.header.entire_len
        );
        self.socket.write_all(&packet.serialize()).await?;
        self.socket.flush().await?;
        self.read().await
    }

    async fn read(&mut self) -> Result<AfcPacket, DeviceError> {
        let res = AfcPacket::read(&mut self.socket).await?;
        if res.header.operation == AfcOpcode::Status {
            let code = match res.header_u64() {
                Ok(c) => c,
                Err(e) => {
                    error!("AFC returned status opcode, but not a code");
                    return Err(e);
                }
            };
            let e = AfcError::from(code);
            if e != AfcError::Success {
                return Err(DeviceError::Afc(e));
            }
        }
        Ok(res)
    }
}

impl AfcPrimitives for AfcConnection {
    async fn file_open(&mut self, path: &str, mode: u64) -> Result<u64, DeviceError> {
        let mut header_payload = mode.to_le_bytes().to_vec();
        header_payload.extend(c_string(path));
        let res = self
            .request(AfcOpcode::FileOpen, header_payload, Vec::new())
            .await?;
        if res.header.operation != AfcOpcode::FileOpenRes {
            return Err(DeviceError::UnexpectedResponse);
        }
        res.header_u64()
    }

    async fn file_read(&mut self, handle: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        let mut header_payload = handle.to_le_bytes().to_vec();
        header_payload.extend((len as u64).to_le_bytes());
        let res = self
            .request(AfcOpcode::Read, header_payload, Vec::new())
            .await?;
        Ok(res.payload)
    }

    async fn file_write(&mut self, handle: u64, data: &[u8]) -> Result<(), DeviceError> {
        for chunk in data.chunks(MAX_TRANSFER) {
            self.request(
                AfcOpcode::Write,
                handle.to_le_bytes().to_vec(),
                chunk.to_vec(),
            )
            .await?;
        }
        Ok(())
    }

    async fn file_close(&mut self, handle: u64) -> Result<(), DeviceError> {
        self.request(AfcOpcode::FileClose, handle.to_le_bytes().to_vec(), Vec::new())
            .await?;
        Ok(())
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), DeviceError> {
        self.request(AfcOpcode::MakeDir, c_string(path), Vec::new())
            .await?;
        Ok(())
    }

    async fn directory_open(&mut self, path: &str) -> Result<u64, DeviceError> {
        let res = self
            .request(AfcOpcode::ReadDir, c_string(path), Vec::new())
            .await?;
        let entries = res
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect::<VecDeque<_>>();

        let handle = self.next_directory;
        self.next_directory += 1;
        self.directories.insert(handle, entries);
        Ok(handle)
    }

    async fn directory_read(&mut self, handle: u64) -> Result<Option<String>, DeviceError> {
        match self.directories.get_mut(&handle) {
            Some(entries) => Ok(entries.pop_front()),
            None => Err(DeviceError::Afc(AfcError::InvalidArg)),
        }
    }

    async fn directory_close(&mut self, handle: u64) -> Result<(), DeviceError> {
        match self.directories.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(DeviceError::Afc(AfcError::InvalidArg)),
        }
    }

    async fn remove_path(&mut self, path: &str) -> Result<(), DeviceError> {
        self.request(AfcOpcode::RemovePath, c_string(path), Vec::new())
            .await?;
        Ok(())
    }

    async fn close(mut self) -> Result<(), DeviceError> {
        self.directories.clear();
        self.socket.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::afc::packet::AfcPacketHeader;

    async fn read_request(server: &mut tokio::io::DuplexStream) -> AfcPacket {
        AfcPacket::read(server).await.unwrap()
    }

    #[tokio::test]
    async fn directory_listing_is_served_from_one_read_dir() {
        let (client, mut server) = duplex(4096);
        let device = tokio::spawn(async move {
            let req = read_request(&mut server).await;
            assert_eq!(req.header.operation, AfcOpcode::ReadDir);
            assert_eq!(req.header_payload, b"/tmp\0");
            let reply = AfcPacket::new(
                AfcOpcode::Data,
                req.header.packet_num,
                Vec::new(),
                b".\0..\0a.txt\0".to_vec(),
            );
            server.write_all(&reply.serialize()).await.unwrap();
        });

        let mut conn = AfcConnection::new(Box::new(client));
        let dir = conn.directory_open("/tmp").await.unwrap();
        assert_eq!(conn.directory_read(dir).await.unwrap().as_deref(), Some("."));
        assert_eq!(conn.directory_read(dir).await.unwrap().as_deref(), Some(".."));
        assert_eq!(conn.directory_read(dir).await.unwrap().as_deref(), Some("a.txt"));
        assert_eq!(conn.directory_read(dir).await.unwrap(), None);
        conn.directory_close(dir).await.unwrap();
        device.await.unwrap();
    }

    #[tokio::test]
    async fn status_reply_becomes_afc_error() {
        let (client, mut server) = duplex(4096);
        let device = tokio::spawn(async move {
            let mut header = [0u8; AfcPacketHeader::LEN as usize];
            server.read_exact(&mut header).await.unwrap();
            let header = AfcPacketHeader::parse(&header).unwrap();
            let mut rest = vec![0u8; (header.entire_len - AfcPacketHeader::LEN) as usize];
            server.read_exact(&mut rest).await.unwrap();
            let reply = AfcPacket::new(AfcOpcode::Status, 0, 8u64.to_le_bytes().to_vec(), vec![]);
            server.write_all(&reply.serialize()).await.unwrap();
        });

        let mut conn = AfcConnection::new(Box::new(client));
        let err = conn.remove_path("missing").await.unwrap_err();
        assert!(matches!(err, DeviceError::Afc(AfcError::ObjectNotFound)));
        device.await.unwrap();
    }
}
