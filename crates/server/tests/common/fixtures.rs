//! Test fixtures for generating test data.

use bytes::Bytes;
use larder_core::Digest;
use larder_server::proto::reapi;
use prost::Message;

/// Generate deterministic test data based on a seed.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Wire digest of `data`.
#[allow(dead_code)]
pub fn wire_digest(data: &[u8]) -> reapi::Digest {
    Digest::compute(data).into()
}

/// Serialized `Directory` and its digest.
#[allow(dead_code)]
pub fn encode_directory(directory: &reapi::Directory) -> (reapi::Digest, Bytes) {
    let bytes = Bytes::from(directory.encode_to_vec());
    (wire_digest(&bytes), bytes)
}

/// An action result with a single output file.
#[allow(dead_code)]
pub fn action_result_with_file(path: &str, file: &reapi::Digest) -> reapi::ActionResult {
    reapi::ActionResult {
        output_files: vec![reapi::OutputFile {
            path: path.to_string(),
            digest: Some(file.clone()),
            ..Default::default()
        }],
        exit_code: 0,
        ..Default::default()
    }
}
