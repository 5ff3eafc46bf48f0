//! Byte Transfer resource names.
//!
//! Reads name `{instance_name}/blobs/{hash}/{size}`; writes name
//! `{instance_name}/uploads/{upload_id}/blobs/{hash}/{size}[/{metadata}]`,
//! where the upload id is an opaque client token (Bazel sends a UUID). The
//! instance name may be empty or span several segments, but it never contains
//! the reserved `blobs`, `uploads` or `compressed-blobs` segments.

use crate::Digest;
use std::fmt;

const BLOBS: &str = "blobs";
const COMPRESSED_BLOBS: &str = "compressed-blobs";
const UPLOADS: &str = "uploads";

/// Parsed resource name of a Byte Transfer read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadResource {
    pub instance_name: String,
    pub digest: Digest,
}

impl ReadResource {
    /// Parse a read resource name.
    pub fn parse(name: &str) -> crate::Result<Self> {
        let segments: Vec<&str> = name.split('/').collect();
        let idx = segments
            .iter()
            .position(|s| *s == BLOBS || *s == COMPRESSED_BLOBS)
            .ok_or_else(|| invalid(name, "missing blobs segment"))?;
        if segments[idx] == COMPRESSED_BLOBS {
            return Err(compressed(name));
        }
        let rest = &segments[idx + 1..];
        if rest.len() != 2 {
            return Err(invalid(name, "expected blobs/{hash}/{size}"));
        }
        Ok(Self {
            instance_name: segments[..idx].join("/"),
            digest: parse_digest(name, rest[0], rest[1])?,
        })
    }
}

impl fmt::Display for ReadResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.instance_name.is_empty() {
            write!(f, "{}/", self.instance_name)?;
        }
        write!(f, "{BLOBS}/{}", self.digest)
    }
}

/// Parsed resource name of a Byte Transfer write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResource {
    pub instance_name: String,
    pub upload_id: String,
    pub digest: Digest,
    /// Optional trailing metadata, ignored by the server.
    pub metadata: Option<String>,
}

impl WriteResource {
    /// Parse a write resource name.
    pub fn parse(name: &str) -> crate::Result<Self> {
        let segments: Vec<&str> = name.split('/').collect();
        let idx = segments
            .iter()
            .position(|s| *s == UPLOADS)
            .ok_or_else(|| invalid(name, "missing uploads segment"))?;
        let rest = &segments[idx + 1..];
        if rest.len() < 4 {
            return Err(invalid(
                name,
                "expected uploads/{upload_id}/blobs/{hash}/{size}",
            ));
        }
        if rest[0].is_empty() {
            return Err(invalid(name, "empty upload id"));
        }
        let upload_id = rest[0].to_string();
        match rest[1] {
            BLOBS => {}
            COMPRESSED_BLOBS => return Err(compressed(name)),
            _ => return Err(invalid(name, "expected blobs after upload id")),
        }
        let digest = parse_digest(name, rest[2], rest[3])?;
        let metadata = (rest.len() > 4).then(|| rest[4..].join("/"));
        Ok(Self {
            instance_name: segments[..idx].join("/"),
            upload_id,
            digest,
            metadata,
        })
    }
}

impl fmt::Display for WriteResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.instance_name.is_empty() {
            write!(f, "{}/", self.instance_name)?;
        }
        write!(f, "{UPLOADS}/{}/{BLOBS}/{}", self.upload_id, self.digest)?;
        if let Some(metadata) = &self.metadata {
            write!(f, "/{metadata}")?;
        }
        Ok(())
    }
}

fn parse_digest(name: &str, hash: &str, size: &str) -> crate::Result<Digest> {
    let size = size
        .parse::<i64>()
        .map_err(|_| invalid(name, &format!("invalid size {size:?}")))?;
    Digest::parse(hash, size)
}

fn invalid(name: &str, msg: &str) -> crate::Error {
    crate::Error::InvalidResourceName(format!("{msg}: {name}"))
}

fn compressed(name: &str) -> crate::Error {
    crate::Error::UnsupportedResource(format!("compressed blobs are not supported: {name}"))
}
