// Jackson Coxson
//! Typed property-list messages exchanged with device services

use std::io::Cursor;

use indexmap::IndexMap;

use crate::DeviceError;

/// A decoded property-list value
///
/// Only the shapes device services actually send are represented. Reals,
/// dates and UIDs are folded into the nearest variant when decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    String(String),
    Data(Vec<u8>),
    Dictionary(IndexMap<String, Message>),
    Array(Vec<Message>),
    Integer(i64),
    Boolean(bool),
}

impl Message {
    /// Builds a dictionary from key/value pairs, keeping their order
    pub fn dictionary<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Message>,
        I: IntoIterator<Item = (K, V)>,
    {
        Message::Dictionary(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Message> {
        match self {
            Message::Dictionary(d) => d.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Message::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Message::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Message::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Message::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Message]> {
        match self {
            Message::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&IndexMap<String, Message>> {
        match self {
            Message::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    /// A string field of a dictionary, owned
    pub fn string_field(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Message::as_str).map(str::to_string)
    }

    pub fn to_binary(&self) -> Result<Vec<u8>, DeviceError> {
        let mut buf = Vec::new();
        plist::to_writer_binary(&mut buf, &plist::Value::from(self.clone()))?;
        Ok(buf)
    }

    pub fn to_xml(&self) -> Result<Vec<u8>, DeviceError> {
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &plist::Value::from(self.clone()))?;
        Ok(buf)
    }

    /// Decodes either binary or XML property-list bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceError> {
        let value = plist::Value::from_reader(Cursor::new(bytes))?;
        Message::try_from(value)
    }
}

impl From<Message> for plist::Value {
    fn from(value: Message) -> Self {
        match value {
            Message::String(s) => plist::Value::String(s),
            Message::Data(d) => plist::Value::Data(d),
            Message::Dictionary(d) => plist::Value::Dictionary(
                d.into_iter()
                    .map(|(k, v)| (k, plist::Value::from(v)))
                    .collect(),
            ),
            Message::Array(a) => {
                plist::Value::Array(a.into_iter().map(plist::Value::from).collect())
            }
            Message::Integer(i) => plist::Value::Integer(i.into()),
            Message::Boolean(b) => plist::Value::Boolean(b),
        }
    }
}

impl TryFrom<plist::Value> for Message {
    type Error = DeviceError;

    fn try_from(value: plist::Value) -> Result<Self, Self::Error> {
        Ok(match value {
            plist::Value::String(s) => Message::String(s),
            plist::Value::Data(d) => Message::Data(d),
            plist::Value::Boolean(b) => Message::Boolean(b),
            plist::Value::Integer(i) => match i.as_signed() {
                Some(i) => Message::Integer(i),
                None => return Err(DeviceError::UnexpectedResponse),
            },
            plist::Value::Real(r) => {
                if r.fract() == 0.0 && r.abs() < i64::MAX as f64 {
                    Message::Integer(r as i64)
                } else {
                    Message::String(r.to_string())
                }
            }
            plist::Value::Date(d) => Message::String(d.to_xml_format()),
            plist::Value::Uid(u) => Message::Integer(u.get() as i64),
            plist::Value::Array(a) => Message::Array(
                a.into_iter()
                    .map(Message::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            plist::Value::Dictionary(d) => Message::Dictionary(
                d.into_iter()
                    .map(|(k, v)| Ok((k, Message::try_from(v)?)))
                    .collect::<Result<_, DeviceError>>()?,
            ),
            _ => return Err(DeviceError::UnexpectedResponse),
        })
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::String(value.to_string())
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Message::String(value)
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Message::Data(value)
    }
}

impl From<i64> for Message {
    fn from(value: i64) -> Self {
        Message::Integer(value)
    }
}

impl From<bool> for Message {
    fn from(value: bool) -> Self {
        Message::Boolean(value)
    }
}

impl From<Vec<Message>> for Message {
    fn from(value: Vec<Message>) -> Self {
        Message::Array(value)
    }
}

impl From<IndexMap<String, Message>> for Message {
    fn from(value: IndexMap<String, Message>) -> Self {
        Message::Dictionary(value)
    }
}
