use std::sync::LazyLock;

use bytes::Bytes;

use crate::digests::ObjId;
use crate::payload::{FileContent, InodeMeta, Payload, TreeMeta};

pub const CHUNK_A_CONTENTS: &[u8] = b"Hello World";
pub const CHUNK_B_CONTENTS: &[u8] = b"Goodbye World";

pub static CHUNK_A: LazyLock<Bytes> = LazyLock::new(|| CHUNK_A_CONTENTS.into());
pub static CHUNK_A_DIGEST: LazyLock<ObjId> =
    LazyLock::new(|| blake3::hash(CHUNK_A_CONTENTS).into());
pub static CHUNK_B_DIGEST: LazyLock<ObjId> =
    LazyLock::new(|| blake3::hash(CHUNK_B_CONTENTS).into());

pub static INODE_META: LazyLock<InodeMeta> = LazyLock::new(|| InodeMeta {
    size: 11,
    inode: 4242,
    uid: 1000,
    gid: 1000,
    mode: 0o100644,
    mtime_ns: 1_700_000_000_000_000_001,
    atime_ns: 1_700_000_000_000_000_002,
});

pub static TREE_META: LazyLock<TreeMeta> = LazyLock::new(|| TreeMeta {
    uid: 1000,
    gid: 1000,
    mode: 0o40755,
    mtime_ns: 1_700_000_000_000_000_003,
    atime_ns: 1_700_000_000_000_000_004,
});

pub static BLOB_PAYLOAD_A: LazyLock<Payload> =
    LazyLock::new(|| Payload::Blob(CHUNK_A.clone()));
pub static INODE_PAYLOAD_IMMEDIATE: LazyLock<Payload> = LazyLock::new(|| Payload::Inode {
    meta: INODE_META.clone(),
    content: FileContent::Immediate(CHUNK_A.clone()),
});
