use bytes::Bytes;
use data_encoding::HEXLOWER;
use thiserror::Error;

/// The content hash of an object's serialized payload, used as the primary
/// key throughout the object graph.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ObjId(Bytes);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid objid length: {0}")]
    InvalidLen(usize),
}

pub const OBJID_LEN: usize = 32;

impl ObjId {
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Lower-hex rendering, as used for remote storage keys.
    pub fn to_hex(&self) -> String {
        HEXLOWER.encode(&self.0)
    }
}

impl From<blake3::Hash> for ObjId {
    fn from(value: blake3::Hash) -> Self {
        Self(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<&[u8; OBJID_LEN]> for ObjId {
    fn from(value: &[u8; OBJID_LEN]) -> Self {
        Self(value.to_vec().into())
    }
}

impl From<ObjId> for Bytes {
    fn from(value: ObjId) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for ObjId {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != OBJID_LEN {
            Err(Error::InvalidLen(value.len()))
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl TryFrom<&[u8]> for ObjId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != OBJID_LEN {
            Err(Error::InvalidLen(value.len()))
        } else {
            Ok(Self(Bytes::copy_from_slice(value)))
        }
    }
}

impl std::fmt::Display for ObjId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for ObjId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ObjId, OBJID_LEN};
    use hex_literal::hex;

    #[test]
    fn from_hash() {
        let objid: ObjId = blake3::hash(b"Hello World").into();
        assert_eq!(objid.as_slice().len(), OBJID_LEN);
        assert_eq!(
            objid.to_hex(),
            "41f8394111eb713a22165c46c90ab8f0fd9399c92028fd6d288944b23ff5bf76",
        );
    }

    #[test]
    fn try_from_checks_length() {
        assert_eq!(
            ObjId::try_from(vec![0u8; 7]),
            Err(Error::InvalidLen(7)),
        );
        let objid = ObjId::try_from(hex!(
            "0000000000000000000000000000000000000000000000000000000000000000"
        ).to_vec())
        .expect("valid length");
        assert_eq!(objid.as_slice(), &[0u8; 32]);
    }
}
