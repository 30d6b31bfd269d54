//! Line codec for engine output streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so a
//! runaway engine cannot make the reader buffer unbounded output. Partial
//! lines split across reads stay buffered until `\n` arrives.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum accepted line length: 64 KiB.
///
/// A status record for a many-device host is well under 4 KiB.
pub const MAX_LINE_BYTES: usize = 65_536;

/// Line decoder used by the output monitor.
///
/// Each item is either a line or, for a line longer than [`MAX_LINE_BYTES`],
/// an [`AppError::StatusStreamMalformed`]. The overlong line is discarded and
/// the stream stays open, resuming at the next newline. Only I/O failures
/// end the stream, as [`AppError::Io`].
#[derive(Debug)]
pub struct StatusCodec(LinesCodec);

impl StatusCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for StatusCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StatusCodec {
    type Item = Result<String>;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        lift(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        lift(self.0.decode_eof(src))
    }
}

fn lift(
    decoded: std::result::Result<Option<String>, LinesCodecError>,
) -> Result<Option<Result<String>>> {
    match decoded {
        Ok(line) => Ok(line.map(Ok)),
        Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Err(
            AppError::StatusStreamMalformed(format!(
                "line too long: exceeded {MAX_LINE_BYTES} bytes"
            )),
        ))),
        Err(LinesCodecError::Io(io_err)) => Err(AppError::Io(io_err.to_string())),
    }
}
