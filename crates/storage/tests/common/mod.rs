pub mod mocks;

#[allow(unused_imports)]
pub use mocks::{FaultyBackend, Fault};

use bytes::Bytes;
use larder_storage::ByteStream;

/// Split `data` into a stream of `chunk`-sized pieces.
#[allow(dead_code)]
pub fn chunked(data: &[u8], chunk: usize) -> ByteStream {
    let pieces: Vec<_> = data
        .chunks(chunk.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Box::pin(futures::stream::iter(pieces))
}

/// Count files under `root` whose name marks them as in-flight uploads.
#[allow(dead_code)]
pub fn temp_file_count(root: &std::path::Path) -> usize {
    let mut count = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().contains(".tmp."))
            {
                count += 1;
            }
        }
    }
    count
}
