//! Test fixtures for generating test data.

use std::io::{Cursor, Read};

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
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

    data
}

/// Decode a zip archive into `(entry name, contents)` pairs in archive order.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn read_zip(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("response is not a valid zip");
    (0..archive.len())
        .map(|i| {
            let mut entry = archive.by_index(i).expect("Failed to read zip entry");
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .expect("Failed to decompress zip entry");
            (entry.name().to_string(), data)
        })
        .collect()
}

/// Extract the handle from a chunk download URL.
#[allow(dead_code)]
pub fn handle_of(url: &str) -> &str {
    url.strip_prefix("/zip-chunks/")
        .expect("chunk url should start with /zip-chunks/")
}
