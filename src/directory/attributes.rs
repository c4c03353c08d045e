//! Structured access to netlink attribute payloads.
//!
//! Replies are decoded through [`Attributes`], which hands back typed values
//! or an explicit missing/malformed error. Nothing is assumed present.

use crate::error::DirectoryError;

/// Attribute payloads of one reply, keyed by numeric attribute type.
#[derive(Debug, Default)]
pub struct Attributes<'a> {
    entries: Vec<(u16, &'a [u8])>,
}

impl<'a> Attributes<'a> {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u16, &'a [u8])>) -> Self {
        Self {
            entries: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, kind: u16) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, payload)| *payload)
    }

    fn require(&self, kind: u16, attribute: &'static str) -> Result<&'a [u8], DirectoryError> {
        self.get(kind)
            .ok_or(DirectoryError::MissingAttribute { attribute })
    }

    pub fn u32(&self, kind: u16, attribute: &'static str) -> Result<u32, DirectoryError> {
        decode_u32(self.require(kind, attribute)?, attribute)
    }

    pub fn optional_u32(
        &self,
        kind: u16,
        attribute: &'static str,
    ) -> Result<Option<u32>, DirectoryError> {
        self.get(kind)
            .map(|payload| decode_u32(payload, attribute))
            .transpose()
    }

    pub fn optional_u8(
        &self,
        kind: u16,
        attribute: &'static str,
    ) -> Result<Option<u8>, DirectoryError> {
        self.get(kind)
            .map(|payload| match payload {
                [value, ..] => Ok(*value),
                [] => Err(DirectoryError::MalformedAttribute { attribute, len: 0 }),
            })
            .transpose()
    }

    /// NUL-terminated (or not) UTF-8 string.
    pub fn string(&self, kind: u16, attribute: &'static str) -> Result<String, DirectoryError> {
        let payload = self.require(kind, attribute)?;
        let end = payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(payload.len());
        std::str::from_utf8(&payload[..end])
            .map(str::to_owned)
            .map_err(|_| DirectoryError::MalformedAttribute {
                attribute,
                len: payload.len(),
            })
    }

    /// Payload of exactly `N` bytes.
    pub fn array<const N: usize>(
        &self,
        kind: u16,
        attribute: &'static str,
    ) -> Result<[u8; N], DirectoryError> {
        let payload = self.require(kind, attribute)?;
        payload
            .try_into()
            .map_err(|_| DirectoryError::MalformedAttribute {
                attribute,
                len: payload.len(),
            })
    }
}

fn decode_u32(payload: &[u8], attribute: &'static str) -> Result<u32, DirectoryError> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|head| head.try_into().ok())
        .ok_or(DirectoryError::MalformedAttribute {
            attribute,
            len: payload.len(),
        })?;
    Ok(u32::from_ne_bytes(bytes))
}
