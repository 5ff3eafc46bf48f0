//! Generated protocol types.
//!
//! The module tree mirrors the protobuf packages so cross-package references
//! in the generated code resolve.

#![allow(clippy::all, missing_docs)]

pub mod build {
    pub mod bazel {
        pub mod semver {
            tonic::include_proto!("build.bazel.semver");
        }

        pub mod remote {
            pub mod execution {
                pub mod v2 {
                    tonic::include_proto!("build.bazel.remote.execution.v2");
                }
            }
        }
    }
}

pub mod google {
    pub mod bytestream {
        tonic::include_proto!("google.bytestream");
    }

    pub mod rpc {
        tonic::include_proto!("google.rpc");
    }
}

/// Encoded descriptors of every compiled proto, served through reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("larder_descriptor");

pub use build::bazel::remote::execution::v2 as reapi;
pub use google::bytestream;

use larder_core::Digest;

impl From<Digest> for reapi::Digest {
    fn from(digest: Digest) -> Self {
        Self {
            hash: digest.hash_hex(),
            size_bytes: digest.size_i64(),
        }
    }
}

impl From<&Digest> for reapi::Digest {
    fn from(digest: &Digest) -> Self {
        (*digest).into()
    }
}

impl reapi::Digest {
    /// Validate and convert into a core digest.
    pub fn to_digest(&self) -> larder_core::Result<Digest> {
        Digest::parse(&self.hash, self.size_bytes)
    }
}
