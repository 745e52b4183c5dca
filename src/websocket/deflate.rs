//! permessage-deflate payload transforms
//!
//! Messages are raw deflate streams flushed with a sync flush. The sender
//! strips the trailing empty stored block at the end of each message and
//! the receiver appends it back before inflating the final frame.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use serde::{Deserialize, Serialize};

use crate::error::{WebSocketError, WebSocketResult};

const TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];
const MIN_WINDOW_BITS: u8 = 9;
const MAX_WINDOW_BITS: u8 = 15;

/// Negotiated permessage-deflate parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeflateOptions {
    /// LZ77 window used by the client's compressor.
    pub client_max_window_bits: u8,
    /// Whether the client keeps its compression context between messages.
    pub client_context_takeover: bool,
    /// LZ77 window used by the server's compressor.
    pub server_max_window_bits: u8,
    /// Whether the server keeps its compression context between messages.
    pub server_context_takeover: bool,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            client_max_window_bits: MAX_WINDOW_BITS,
            client_context_takeover: true,
            server_max_window_bits: MAX_WINDOW_BITS,
            server_context_takeover: true,
        }
    }
}

impl DeflateOptions {
    pub fn validate(&self) -> WebSocketResult<()> {
        for bits in [self.client_max_window_bits, self.server_max_window_bits] {
            if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
                return Err(WebSocketError::InvalidOperation(format!(
                    "window bits {} outside {}..={}",
                    bits, MIN_WINDOW_BITS, MAX_WINDOW_BITS
                )));
            }
        }
        Ok(())
    }
}

fn compression_error(err: impl std::fmt::Display) -> WebSocketError {
    WebSocketError::Compression(err.to_string())
}

pub(crate) struct Deflater {
    compress: Compress,
    context_takeover: bool,
}

impl Deflater {
    pub(crate) fn new(window_bits: u8, context_takeover: bool) -> Self {
        Self {
            compress: Compress::new_with_window_bits(Compression::default(), false, window_bits),
            context_takeover,
        }
    }

    /// Compresses one frame's worth of a message.
    pub(crate) fn deflate(&mut self, mut input: &[u8], end_of_message: bool) -> WebSocketResult<Vec<u8>> {
        let mut output = Vec::with_capacity(input.len() / 2 + 64);
        loop {
            if output.capacity() - output.len() < 64 {
                output.reserve(output.len().max(1024));
            }
            let before = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut output, FlushCompress::Sync)
                .map_err(compression_error)?;
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];
            // The flush is finished once zlib stops short of filling the buffer.
            if input.is_empty() && output.len() < output.capacity() {
                break;
            }
        }

        if end_of_message {
            if output.ends_with(&TRAILER) {
                output.truncate(output.len() - TRAILER.len());
            }
            if output.is_empty() {
                output.push(0x00);
            }
            if !self.context_takeover {
                self.compress.reset();
            }
        }
        Ok(output)
    }
}

pub(crate) struct Inflater {
    decompress: Decompress,
    context_takeover: bool,
}

impl Inflater {
    pub(crate) fn new(window_bits: u8, context_takeover: bool) -> Self {
        Self {
            decompress: Decompress::new_with_window_bits(false, window_bits),
            context_takeover,
        }
    }

    /// Inflates a chunk of frame payload, appending to `output`. The last
    /// chunk of a message must pass `end_of_message`.
    pub(crate) fn inflate(&mut self, input: &[u8], end_of_message: bool, output: &mut Vec<u8>) -> WebSocketResult<()> {
        self.feed(input, output)?;
        if end_of_message {
            self.feed(&TRAILER, output)?;
            if !self.context_takeover {
                self.decompress.reset(false);
            }
        }
        Ok(())
    }

    fn feed(&mut self, mut input: &[u8], output: &mut Vec<u8>) -> WebSocketResult<()> {
        loop {
            if output.capacity() - output.len() < 1024 {
                output.reserve((input.len() * 2).max(4096));
            }
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress_vec(input, output, FlushDecompress::Sync)
                .map_err(compression_error)?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            let produced = self.decompress.total_out() - before_out;
            input = &input[consumed..];

            if status == Status::StreamEnd {
                return Ok(());
            }
            if input.is_empty() && output.len() < output.capacity() {
                return Ok(());
            }
            if consumed == 0 && produced == 0 && output.len() < output.capacity() {
                return Err(WebSocketError::Compression("inflater made no progress".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailer_stripped_and_restored() {
        let mut deflater = Deflater::new(15, true);
        let mut inflater = Inflater::new(15, true);

        for message in [&b"hello hello hello hello"[..], b"", b"hello again"] {
            let compressed = deflater.deflate(message, true).unwrap();
            assert!(!compressed.ends_with(&TRAILER));
            let mut output = Vec::new();
            inflater.inflate(&compressed, true, &mut output).unwrap();
            assert_eq!(output, message);
        }
    }

    #[test]
    fn test_fragmented_message() {
        let mut deflater = Deflater::new(12, false);
        let mut inflater = Inflater::new(12, false);

        let first = deflater.deflate(b"fragment one, ", false).unwrap();
        let second = deflater.deflate(b"fragment two", true).unwrap();

        let mut output = Vec::new();
        inflater.inflate(&first, false, &mut output).unwrap();
        inflater.inflate(&second, true, &mut output).unwrap();
        assert_eq!(output, b"fragment one, fragment two");

        // No context takeover: the next message decodes from a fresh state.
        let next = deflater.deflate(b"fragment one", true).unwrap();
        let mut output = Vec::new();
        Inflater::new(12, false).inflate(&next, true, &mut output).unwrap();
        assert_eq!(output, b"fragment one");
    }

    #[test]
    fn test_window_bits_range() {
        assert!(DeflateOptions::default().validate().is_ok());
        let options = DeflateOptions {
            client_max_window_bits: 8,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_garbage_input_fails() {
        let mut inflater = Inflater::new(15, true);
        let mut output = Vec::new();
        assert!(inflater.inflate(&[0xff, 0xff, 0xff, 0xff], true, &mut output).is_err());
    }
}
