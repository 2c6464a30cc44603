//! Git object identity and the loose-object codec.
//!
//! Objects are content-addressed by the SHA-1 of `"{type} {size}\0{content}"`
//! and stored on the remote as zlib-compressed loose objects, byte-identical
//! to what git writes under `.git/objects/`.

use std::fmt;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// The hash of the empty tree. `git cat-file -e` reports it as present even
/// when no loose file exists, so the fetch path special-cases it.
pub const EMPTY_TREE_HASH: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// The four git object types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
            ObjectType::Commit => "commit",
            ObjectType::Tag => "tag",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "blob" => Some(ObjectType::Blob),
            "tree" => Some(ObjectType::Tree),
            "commit" => Some(ObjectType::Commit),
            "tag" => Some(ObjectType::Tag),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A 20-byte SHA-1 object ID
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == 20 {
            let mut arr = [0u8; 20];
            arr.copy_from_slice(bytes);
            Some(ObjectId(arr))
        } else {
            None
        }
    }

    pub fn from_hex(hex_str: &str) -> Option<Self> {
        if hex_str.len() != 40 {
            return None;
        }
        let bytes = hex::decode(hex_str).ok()?;
        Self::from_bytes(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compute an object ID from its type and payload.
    pub fn hash_object(obj_type: ObjectType, payload: &[u8]) -> Self {
        let header = format!("{} {}\0", obj_type.as_str(), payload.len());
        let mut hasher = Sha1::new();
        hasher.update(header.as_bytes());
        hasher.update(payload);
        let digest = hasher.finalize();
        let mut id = [0u8; 20];
        id.copy_from_slice(&digest);
        ObjectId(id)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Store path of an object: `<root>/objects/<hh>/<rest>`.
pub fn object_path(root: &str, id: &ObjectId) -> String {
    let hex_id = id.to_hex();
    format!("{}/objects/{}/{}", root, &hex_id[..2], &hex_id[2..])
}

/// Encode a type + payload into the zlib-compressed loose object format.
pub fn encode_loose(obj_type: ObjectType, payload: &[u8]) -> Result<Vec<u8>> {
    let header = format!("{} {}\0", obj_type.as_str(), payload.len());
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(header.as_bytes())?;
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

/// Decode a zlib-compressed loose object into its type and payload.
///
/// Only the framing is checked here; [`decode_loose_verified`] also
/// recomputes the hash.
pub fn decode_loose(data: &[u8]) -> Result<(ObjectType, Vec<u8>)> {
    let mut decoder = ZlibDecoder::new(data);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| Error::CorruptObject(format!("zlib: {}", e)))?;

    let null_pos = raw
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::CorruptObject("missing header terminator".into()))?;
    let header = std::str::from_utf8(&raw[..null_pos])
        .map_err(|_| Error::CorruptObject("invalid header".into()))?;

    let mut parts = header.split(' ');
    let type_str = parts
        .next()
        .ok_or_else(|| Error::CorruptObject("missing type".into()))?;
    let size_str = parts
        .next()
        .ok_or_else(|| Error::CorruptObject("missing size".into()))?;

    let obj_type = ObjectType::from_str(type_str)
        .ok_or_else(|| Error::CorruptObject(format!("unknown type: {}", type_str)))?;
    let size: usize = size_str
        .parse()
        .map_err(|_| Error::CorruptObject("invalid size".into()))?;

    let payload = raw[null_pos + 1..].to_vec();
    if payload.len() != size {
        return Err(Error::CorruptObject(format!(
            "size mismatch: header says {}, payload is {}",
            size,
            payload.len()
        )));
    }

    Ok((obj_type, payload))
}

/// Decode a loose object and check that it hashes to `expected`.
pub fn decode_loose_verified(data: &[u8], expected: &ObjectId) -> Result<(ObjectType, Vec<u8>)> {
    let (obj_type, payload) = decode_loose(data)?;
    let computed = ObjectId::hash_object(obj_type, &payload);
    if computed != *expected {
        return Err(Error::CorruptObject(format!(
            "hash mismatch: expected {}, got {}",
            expected, computed
        )));
    }
    Ok((obj_type, payload))
}

/// The objects an object points at directly.
///
/// Commits reference their tree and parents, trees their entries, tags the
/// tagged object, blobs nothing. Gitlink entries (mode `160000`) are skipped
/// since submodule commits are not stored in the remote.
pub fn referents(obj_type: ObjectType, payload: &[u8]) -> Result<Vec<ObjectId>> {
    match obj_type {
        ObjectType::Blob => Ok(Vec::new()),
        ObjectType::Commit => commit_referents(payload),
        ObjectType::Tree => tree_referents(payload),
        ObjectType::Tag => tag_referents(payload),
    }
}

fn header_id(line: &str, key: &str) -> Option<ObjectId> {
    line.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(' '))
        .and_then(ObjectId::from_hex)
}

fn commit_referents(payload: &[u8]) -> Result<Vec<ObjectId>> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::CorruptObject("commit is not valid utf-8".into()))?;
    let mut lines = text.lines();
    let tree = lines
        .next()
        .and_then(|line| header_id(line, "tree"))
        .ok_or_else(|| Error::CorruptObject("commit missing tree header".into()))?;
    let mut ids = vec![tree];
    for line in lines {
        match header_id(line, "parent") {
            Some(parent) => ids.push(parent),
            None => break,
        }
    }
    Ok(ids)
}

fn tree_referents(payload: &[u8]) -> Result<Vec<ObjectId>> {
    const GITLINK_MODE: u32 = 0o160000;
    let mut ids = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let space = payload[pos..]
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| Error::CorruptObject("tree: missing mode separator".into()))?;
        let mode_str = std::str::from_utf8(&payload[pos..pos + space])
            .map_err(|_| Error::CorruptObject("tree: invalid mode".into()))?;
        let mode = u32::from_str_radix(mode_str, 8)
            .map_err(|_| Error::CorruptObject("tree: invalid mode octal".into()))?;
        pos += space + 1;

        let null = payload[pos..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::CorruptObject("tree: missing name terminator".into()))?;
        pos += null + 1;

        if pos + 20 > payload.len() {
            return Err(Error::CorruptObject("tree: truncated entry hash".into()));
        }
        let id = ObjectId::from_bytes(&payload[pos..pos + 20])
            .ok_or_else(|| Error::CorruptObject("tree: invalid entry hash".into()))?;
        pos += 20;

        if mode != GITLINK_MODE {
            ids.push(id);
        }
    }
    Ok(ids)
}

fn tag_referents(payload: &[u8]) -> Result<Vec<ObjectId>> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::CorruptObject("tag is not valid utf-8".into()))?;
    let id = text
        .lines()
        .next()
        .and_then(|line| header_id(line, "object"))
        .ok_or_else(|| Error::CorruptObject("tag missing object header".into()))?;
    Ok(vec![id])
}
