//! Serialization of object payloads.
//!
//! Payloads are sequences of self-delimiting values: byte strings are
//! length-prefixed (u64, little-endian), integers are u64 little-endian,
//! and lists and maps carry a leading u64 element count. Every payload
//! starts with a type tag string, followed by a metadata record of string
//! keys to integer values, followed by type-specific trailing records.
//!
//! This is the on-wire format of the repository. It must stay stable:
//! objids are hashes of these bytes, and existing repositories can only be
//! read back (or have their local cache rebuilt from remote objects) as
//! long as old payloads keep decoding.
//!
//! The concrete grammar:
//!
//! ```text
//! blob  := "blob" bytes
//! inode := "inode" meta{size inode uid gid mode mtime atime}
//!          ( "immediate" bytes
//!          | "chunklist" count (offset objid)* )
//! tree  := "tree" meta{uid gid mode mtime atime} count (name objid)*
//! ```
//!
//! Timestamps are nanoseconds, i64 in two's complement. Tree entries keep
//! the raw directory-entry name bytes; names need not be valid UTF-8.
//! Chunk list entries are in ascending offset order, tree entries in the
//! order the directory was read.

use bstr::{BStr, BString};
use bytes::Bytes;
use thiserror::Error;

use crate::digests::{ObjId, OBJID_LEN};

/// The three node types of the object graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Inode,
    Tree,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Inode => "inode",
            ObjectKind::Tree => "tree",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "inode" => Ok(ObjectKind::Inode),
            "tree" => Ok(ObjectKind::Tree),
            _ => Err(DecodeError::UnknownTag(s.into())),
        }
    }
}

/// Stat metadata recorded for a regular file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeMeta {
    pub size: u64,
    pub inode: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime_ns: i64,
    pub atime_ns: i64,
}

/// Stat metadata recorded for a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeMeta {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime_ns: i64,
    pub atime_ns: i64,
}

/// File contents of an inode: embedded directly, or as a list of
/// `(offset, chunk objid)` pairs in ascending offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Immediate(Bytes),
    Chunks(Vec<(u64, ObjId)>),
}

/// A decoded object payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Blob(Bytes),
    Inode {
        meta: InodeMeta,
        content: FileContent,
    },
    Tree {
        meta: TreeMeta,
        entries: Vec<(BString, ObjId)>,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("unexpected end of payload")]
    UnexpectedEof,
    #[error("trailing data after payload")]
    TrailingData,
    #[error("tag is not valid UTF-8")]
    InvalidTag,
    #[error("unknown payload tag {0:?}")]
    UnknownTag(BString),
    #[error("unknown inode content tag {0:?}")]
    UnknownContentTag(BString),
    #[error("missing metadata field {0:?}")]
    MissingField(&'static str),
    #[error("invalid objid length {0} in payload")]
    InvalidObjIdLen(usize),
}

impl Payload {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Payload::Blob(_) => ObjectKind::Blob,
            Payload::Inode { .. } => ObjectKind::Inode,
            Payload::Tree { .. } => ObjectKind::Tree,
        }
    }

    /// Serializes the payload. The result is what gets hashed into the
    /// objid and uploaded to remote storage.
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        match self {
            Payload::Blob(data) => {
                put_str(&mut buf, "blob");
                put_bytes(&mut buf, data);
            }
            Payload::Inode { meta, content } => {
                put_str(&mut buf, "inode");
                put_map(
                    &mut buf,
                    &[
                        ("size", meta.size),
                        ("inode", meta.inode),
                        ("uid", meta.uid.into()),
                        ("gid", meta.gid.into()),
                        ("mode", meta.mode.into()),
                        ("mtime", meta.mtime_ns as u64),
                        ("atime", meta.atime_ns as u64),
                    ],
                );
                match content {
                    FileContent::Immediate(data) => {
                        put_str(&mut buf, "immediate");
                        put_bytes(&mut buf, data);
                    }
                    FileContent::Chunks(chunks) => {
                        put_str(&mut buf, "chunklist");
                        put_u64(&mut buf, chunks.len() as u64);
                        for (offset, objid) in chunks {
                            put_u64(&mut buf, *offset);
                            put_bytes(&mut buf, objid.as_slice());
                        }
                    }
                }
            }
            Payload::Tree { meta, entries } => {
                put_str(&mut buf, "tree");
                put_map(
                    &mut buf,
                    &[
                        ("uid", meta.uid.into()),
                        ("gid", meta.gid.into()),
                        ("mode", meta.mode.into()),
                        ("mtime", meta.mtime_ns as u64),
                        ("atime", meta.atime_ns as u64),
                    ],
                );
                put_u64(&mut buf, entries.len() as u64);
                for (name, objid) in entries {
                    put_bytes(&mut buf, name);
                    put_bytes(&mut buf, objid.as_slice());
                }
            }
        }
        buf.into()
    }

    /// Parses a full payload buffer back into its structured form.
    pub fn decode(bytes: &[u8]) -> Result<Payload, DecodeError> {
        let mut r = Reader::new(bytes);
        let payload = match r.read_str()? {
            "blob" => Payload::Blob(Bytes::copy_from_slice(r.read_bytes()?)),
            "inode" => {
                let meta = decode_inode_meta(&mut r)?;
                let content = match r.read_str()? {
                    "immediate" => {
                        FileContent::Immediate(Bytes::copy_from_slice(r.read_bytes()?))
                    }
                    "chunklist" => {
                        let count = r.read_u64()?;
                        let mut chunks = Vec::with_capacity(count.min(65_536) as usize);
                        for _ in 0..count {
                            let offset = r.read_u64()?;
                            chunks.push((offset, r.read_objid()?));
                        }
                        FileContent::Chunks(chunks)
                    }
                    other => return Err(DecodeError::UnknownContentTag(other.into())),
                };
                Payload::Inode { meta, content }
            }
            "tree" => {
                let meta = decode_tree_meta(&mut r)?;
                let count = r.read_u64()?;
                let mut entries = Vec::with_capacity(count.min(65_536) as usize);
                for _ in 0..count {
                    let name = BString::from(r.read_bytes()?);
                    entries.push((name, r.read_objid()?));
                }
                Payload::Tree { meta, entries }
            }
            other => return Err(DecodeError::UnknownTag(other.into())),
        };

        if !r.is_empty() {
            return Err(DecodeError::TrailingData);
        }
        Ok(payload)
    }
}

/// Extracts the ordered child objids referenced from a payload without
/// materializing it, as needed for reachability walks and for rebuilding
/// the local cache from remote objects alone.
pub fn children_of(bytes: &[u8]) -> Result<Vec<ObjId>, DecodeError> {
    let mut r = Reader::new(bytes);
    match r.read_str()? {
        "blob" => Ok(Vec::new()),
        "inode" => {
            skip_map(&mut r)?;
            match r.read_str()? {
                "immediate" => Ok(Vec::new()),
                "chunklist" => {
                    let count = r.read_u64()?;
                    let mut children = Vec::with_capacity(count.min(65_536) as usize);
                    for _ in 0..count {
                        r.read_u64()?;
                        children.push(r.read_objid()?);
                    }
                    Ok(children)
                }
                other => Err(DecodeError::UnknownContentTag(other.into())),
            }
        }
        "tree" => {
            skip_map(&mut r)?;
            let count = r.read_u64()?;
            let mut children = Vec::with_capacity(count.min(65_536) as usize);
            for _ in 0..count {
                r.read_bytes()?;
                children.push(r.read_objid()?);
            }
            Ok(children)
        }
        other => Err(DecodeError::UnknownTag(other.into())),
    }
}

fn decode_inode_meta(r: &mut Reader<'_>) -> Result<InodeMeta, DecodeError> {
    let fields = read_map(r)?;
    Ok(InodeMeta {
        size: map_field(&fields, "size")?,
        inode: map_field(&fields, "inode")?,
        uid: map_field(&fields, "uid")? as u32,
        gid: map_field(&fields, "gid")? as u32,
        mode: map_field(&fields, "mode")? as u32,
        mtime_ns: map_field(&fields, "mtime")? as i64,
        atime_ns: map_field(&fields, "atime")? as i64,
    })
}

fn decode_tree_meta(r: &mut Reader<'_>) -> Result<TreeMeta, DecodeError> {
    let fields = read_map(r)?;
    Ok(TreeMeta {
        uid: map_field(&fields, "uid")? as u32,
        gid: map_field(&fields, "gid")? as u32,
        mode: map_field(&fields, "mode")? as u32,
        mtime_ns: map_field(&fields, "mtime")? as i64,
        atime_ns: map_field(&fields, "atime")? as i64,
    })
}

fn read_map<'a>(r: &mut Reader<'a>) -> Result<Vec<(&'a BStr, u64)>, DecodeError> {
    let count = r.read_u64()?;
    let mut fields = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let key = r.read_bytes()?;
        fields.push((BStr::new(key), r.read_u64()?));
    }
    Ok(fields)
}

fn skip_map(r: &mut Reader<'_>) -> Result<(), DecodeError> {
    let count = r.read_u64()?;
    for _ in 0..count {
        r.read_bytes()?;
        r.read_u64()?;
    }
    Ok(())
}

fn map_field(fields: &[(&BStr, u64)], key: &'static str) -> Result<u64, DecodeError> {
    // Unknown keys are tolerated so newer writers can add fields.
    fields
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .ok_or(DecodeError::MissingField(key))
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u64(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_map(buf: &mut Vec<u8>, fields: &[(&str, u64)]) {
    put_u64(buf, fields.len() as u64);
    for (key, value) in fields {
        put_str(buf, key);
        put_u64(buf, *value);
    }
}

struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { rest: buf }
    }

    fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        if self.rest.len() < 8 {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, rest) = self.rest.split_at(8);
        self.rest = rest;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(head);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u64()?;
        if (self.rest.len() as u64) < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let (head, rest) = self.rest.split_at(len as usize);
        self.rest = rest;
        Ok(head)
    }

    fn read_str(&mut self) -> Result<&'a str, DecodeError> {
        std::str::from_utf8(self.read_bytes()?).map_err(|_| DecodeError::InvalidTag)
    }

    fn read_objid(&mut self) -> Result<ObjId, DecodeError> {
        let raw = self.read_bytes()?;
        if raw.len() != OBJID_LEN {
            return Err(DecodeError::InvalidObjIdLen(raw.len()));
        }
        Ok(ObjId::try_from(raw).expect("length checked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{CHUNK_A_DIGEST, CHUNK_B_DIGEST, INODE_META, TREE_META};
    use rstest::rstest;

    #[test]
    fn blob_encoding_is_pinned() {
        let encoded = Payload::Blob(Bytes::from_static(b"ab")).encode();
        let mut expected = Vec::new();
        expected.extend_from_slice(&4u64.to_le_bytes());
        expected.extend_from_slice(b"blob");
        expected.extend_from_slice(&2u64.to_le_bytes());
        expected.extend_from_slice(b"ab");
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn inode_immediate_roundtrip() {
        let payload = Payload::Inode {
            meta: InodeMeta {
                mtime_ns: -5, // pre-epoch timestamps survive the trip
                ..INODE_META.clone()
            },
            content: FileContent::Immediate(Bytes::from_static(b"contents")),
        };
        let decoded = Payload::decode(&payload.encode()).expect("decodes");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn inode_chunklist_roundtrip() {
        let payload = Payload::Inode {
            meta: INODE_META.clone(),
            content: FileContent::Chunks(vec![
                (0, CHUNK_A_DIGEST.clone()),
                (1 << 20, CHUNK_B_DIGEST.clone()),
            ]),
        };
        let encoded = payload.encode();
        assert_eq!(Payload::decode(&encoded).expect("decodes"), payload);
        assert_eq!(
            children_of(&encoded).expect("children decode"),
            vec![CHUNK_A_DIGEST.clone(), CHUNK_B_DIGEST.clone()],
        );
    }

    #[test]
    fn tree_keeps_raw_names() {
        let payload = Payload::Tree {
            meta: TREE_META.clone(),
            entries: vec![
                (BString::from(&b"\xff\xfenot-utf8"[..]), CHUNK_A_DIGEST.clone()),
                (BString::from("plain"), CHUNK_B_DIGEST.clone()),
            ],
        };
        let encoded = payload.encode();
        assert_eq!(Payload::decode(&encoded).expect("decodes"), payload);
        assert_eq!(
            children_of(&encoded).expect("children decode"),
            vec![CHUNK_A_DIGEST.clone(), CHUNK_B_DIGEST.clone()],
        );
    }

    #[test]
    fn blob_has_no_children() {
        let encoded = Payload::Blob(Bytes::from_static(b"xyz")).encode();
        assert_eq!(children_of(&encoded).expect("children decode"), vec![]);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::mid_tag(6)]
    #[case::mid_length(14)]
    fn truncation_is_a_clean_eof(#[case] len: usize) {
        let encoded = Payload::Blob(Bytes::from_static(b"some blob contents")).encode();
        assert!(len < encoded.len());
        assert_eq!(
            Payload::decode(&encoded[..len]),
            Err(DecodeError::UnexpectedEof),
        );
    }

    #[test]
    fn trailing_data_is_rejected() {
        let mut encoded = Payload::Blob(Bytes::from_static(b"x")).encode().to_vec();
        encoded.push(0);
        assert_eq!(Payload::decode(&encoded), Err(DecodeError::TrailingData));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = Vec::new();
        put_str(&mut buf, "symlink");
        assert_eq!(
            Payload::decode(&buf),
            Err(DecodeError::UnknownTag("symlink".into())),
        );
    }

    #[test]
    fn unknown_metadata_keys_are_ignored() {
        let mut buf = Vec::new();
        put_str(&mut buf, "tree");
        put_u64(&mut buf, 6);
        for (key, value) in [
            ("uid", 1000),
            ("gid", 1000),
            ("mode", 0o40755),
            ("mtime", 17),
            ("atime", 18),
            ("btime", 19), // written by a newer version
        ] {
            put_str(&mut buf, key);
            put_u64(&mut buf, value);
        }
        put_u64(&mut buf, 0);
        let decoded = Payload::decode(&buf).expect("decodes");
        assert!(matches!(decoded, Payload::Tree { ref entries, .. } if entries.is_empty()));
    }
}
