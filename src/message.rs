use crate::guid::Guid;
use crate::{Error, Result};

/// An immutable message as accepted from a publisher.
///
/// The guid is a content hash over the encoded body, so republishing the
/// same payload + properties yields the same guid and deduplicates in the
/// message store. `properties` are opaque to the engine and ride along
/// with the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    guid: Guid,
    payload: Vec<u8>,
    properties: Vec<u8>,
    persistent: bool,
}

pub const MAX_BODY_LEN: usize = u32::MAX as usize - 1;

impl Message {
    pub fn new(payload: Vec<u8>, properties: Vec<u8>, persistent: bool) -> Self {
        let guid = Guid::of(&body_bytes(&payload, &properties, persistent));
        Self {
            guid,
            payload,
            properties,
            persistent,
        }
    }

    pub fn guid(&self) -> Guid {
        self.guid
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn properties(&self) -> &[u8] {
        &self.properties
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Stable binary encoding used as the store body for this message.
    pub fn encode(&self) -> Vec<u8> {
        body_bytes(&self.payload, &self.properties, self.persistent)
    }

    /// Decode a store body back into a message.
    ///
    /// # Errors
    ///
    /// - `Error::Corrupt`: truncated or inconsistent body
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::Corrupt("message body is empty"));
        }
        let persistent = match body[0] {
            0 => false,
            1 => true,
            _ => return Err(Error::Corrupt("message persistence flag out of range")),
        };
        let mut at = 1usize;
        let payload = read_chunk(body, &mut at, "message payload")?;
        let properties = read_chunk(body, &mut at, "message properties")?;
        if at != body.len() {
            return Err(Error::Corrupt("trailing bytes after message body"));
        }
        let guid = Guid::of(body);
        Ok(Self {
            guid,
            payload,
            properties,
            persistent,
        })
    }
}

fn body_bytes(payload: &[u8], properties: &[u8], persistent: bool) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + 4 + payload.len() + 4 + properties.len());
    body.push(u8::from(persistent));
    body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    body.extend_from_slice(payload);
    body.extend_from_slice(&(properties.len() as u32).to_le_bytes());
    body.extend_from_slice(properties);
    body
}

fn read_chunk(body: &[u8], at: &mut usize, what: &'static str) -> Result<Vec<u8>> {
    if *at + 4 > body.len() {
        return Err(Error::Corrupt(what));
    }
    let len = u32::from_le_bytes(body[*at..*at + 4].try_into().expect("slice length")) as usize;
    *at += 4;
    if *at + len > body.len() {
        return Err(Error::Corrupt(what));
    }
    let chunk = body[*at..*at + len].to_vec();
    *at += len;
    Ok(chunk)
}
