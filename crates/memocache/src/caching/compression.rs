//! Optional gzip compression of stored payloads.
//!
//! Large payloads are compressed and prefixed with the [`COMPRESSION_MARKER`]. Whether a payload
//! needs to be decompressed is decided by that marker alone.

use std::borrow::Cow;
use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

/// The prefix marking a stored payload as gzip compressed.
///
/// Encoded tuples always start with `[`, so they can never be mistaken for a compressed payload.
/// Readers rely only on this marker, never on their own threshold, as the writer might have been
/// configured differently.
pub const COMPRESSION_MARKER: &[u8; 7] = b"~gzip~:";

/// Payloads smaller than this many bytes are stored uncompressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 500;

/// Compresses `bytes` if they are at least `threshold` bytes long.
///
/// Compressed payloads are prefixed with the [`COMPRESSION_MARKER`], everything else is returned
/// unmodified.
pub fn maybe_compress(bytes: Vec<u8>, threshold: usize) -> io::Result<Vec<u8>> {
    if bytes.is_empty() || bytes.len() < threshold {
        metric!(counter("compression") += 1, "type" => "none");
        return Ok(bytes);
    }

    let mut output = Vec::with_capacity(COMPRESSION_MARKER.len() + bytes.len() / 2);
    output.extend_from_slice(COMPRESSION_MARKER);
    let mut encoder = GzEncoder::new(output, Compression::default());
    encoder.write_all(&bytes)?;
    let output = encoder.finish()?;

    metric!(counter("compression") += 1, "type" => "gz");
    metric!(time_raw("compression.ratio") = (output.len() * 100 / bytes.len()) as u64);
    Ok(output)
}

/// Reverses [`maybe_compress`].
///
/// Payloads without the [`COMPRESSION_MARKER`] are returned as-is.
pub fn maybe_decompress(bytes: &[u8]) -> io::Result<Cow<'_, [u8]>> {
    match bytes.strip_prefix(COMPRESSION_MARKER.as_slice()) {
        Some(compressed) => {
            // We assume MultiGzDecoder accepts a strict superset of input
            // values compared to GzDecoder.
            let mut decoder = MultiGzDecoder::new(compressed);
            let mut output = Vec::new();
            decoder.read_to_end(&mut output)?;
            Ok(Cow::Owned(output))
        }
        None => Ok(Cow::Borrowed(bytes)),
    }
}
