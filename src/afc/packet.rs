// Jackson Coxson

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use tokio::io::AsyncRead;

use crate::DeviceError;

use super::opcode::AfcOpcode;

#[derive(Clone, Debug)]
pub struct AfcPacketHeader {
    pub magic: u64,
    pub entire_len: u64,
    pub header_payload_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(Self::LEN as usize);
        for field in [
            self.magic,
            self.entire_len,
            self.header_payload_len,
            self.packet_num,
            self.operation as u64,
        ] {
            // writes into a Vec cannot fail
            let _ = res.write_u64::<LittleEndian>(field);
        }
        res
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DeviceError> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u64::<LittleEndian>()?;
        let entire_len = cursor.read_u64::<LittleEndian>()?;
        let header_payload_len = cursor.read_u64::<LittleEndian>()?;
        let packet_num = cursor.read_u64::<LittleEndian>()?;
        let operation = AfcOpcode::try_from(cursor.read_u64::<LittleEndian>()?)
            .map_err(|_| DeviceError::UnknownAfcOpcode)?;
        if magic != super::MAGIC {
            return Err(DeviceError::InvalidAfcMagic);
        }
        if header_payload_len < Self::LEN
            || entire_len < header_payload_len
            || entire_len > u64::from(crate::plist_channel::MAX_MESSAGE_LEN)
        {
            return Err(DeviceError::UnexpectedResponse);
        }
        Ok(Self {
            magic,
            entire_len,
            header_payload_len,
            packet_num,
            operation,
        })
    }
}

impl AfcPacket {
    /// Builds a request, filling in the length fields
    pub fn new(
        operation: AfcOpcode,
        packet_num: u64,
        header_payload: Vec<u8>,
        payload: Vec<u8>,
    ) -> Self {
        let header_len = header_payload.len() as u64 + AfcPacketHeader::LEN;
        Self {
            header: AfcPacketHeader {
                magic: super::MAGIC,
                entire_len: header_len + payload.len() as u64,
                header_payload_len: header_len,
                packet_num,
                operation,
            },
            header_payload,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = self.header.serialize();
        res.extend_from_slice(&self.header_payload);
        res.extend_from_slice(&self.payload);
        res
    }

    /// The leading little-endian u64 of the header payload
    pub fn header_u64(&self) -> Result<u64, DeviceError> {
        Cursor::new(&self.header_payload)
            .read_u64::<LittleEndian>()
            .map_err(|_| DeviceError::UnexpectedResponse)
    }

    pub async fn read<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self, DeviceError> {
        let mut header_bytes = [0u8; AfcPacketHeader::LEN as usize];
        tokio::io::AsyncReadExt::read_exact(reader, &mut header_bytes).await?;
        let header = AfcPacketHeader::parse(&header_bytes)?;
        debug!("afc header: {header:?}");

        let mut header_payload =
            vec![0u8; (header.header_payload_len - AfcPacketHeader::LEN) as usize];
        tokio::io::AsyncReadExt::read_exact(reader, &mut header_payload).await?;

        let mut payload = vec![0u8; (header.entire_len - header.header_payload_len) as usize];
        if !payload.is_empty() {
            tokio::io::AsyncReadExt::read_exact(reader, &mut payload).await?;
        }

        let res = Self {
            header,
            header_payload,
            payload,
        };
        debug!(
            "Recv afc: {:?} with {} payload bytes",
            res.header.operation,
            res.payload.len()
        );
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packet_survives_the_wire() {
        let packet = AfcPacket::new(AfcOpcode::Write, 7, 3u64.to_le_bytes().to_vec(), b"abc".to_vec());
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), 40 + 8 + 3);
        assert_eq!(&bytes[..8], b"CFA6LPAA");

        let mut reader = bytes.as_slice();
        let back = AfcPacket::read(&mut reader).await.unwrap();
        assert_eq!(back.header.operation, AfcOpcode::Write);
        assert_eq!(back.header.packet_num, 7);
        assert_eq!(back.header_u64().unwrap(), 3);
        assert_eq!(back.payload, b"abc");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = AfcPacket::new(AfcOpcode::Status, 0, vec![], vec![]).serialize();
        bytes[0] = 0;
        assert!(matches!(
            AfcPacketHeader::parse(&bytes),
            Err(DeviceError::InvalidAfcMagic)
        ));
    }
}
