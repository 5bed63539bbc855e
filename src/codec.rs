use encoding_rs::{CoderResult, DecoderResult, Encoding};

use crate::ReadError;

/// Incremental charset decoder that carries incomplete code points from one chunk to the next.
pub struct TextDecoder {
    encoding: &'static Encoding,
    decoder: encoding_rs::Decoder,
    lossy: bool,
}

impl TextDecoder {
    pub fn new(encoding: &'static Encoding, lossy: bool) -> Self {
        Self {
            encoding,
            // BOM sniffing: a leading BOM is stripped and may override `encoding`
            decoder: encoding.new_decoder(),
            lossy,
        }
    }

    /// Resolve a WHATWG label such as `utf-8` or `euc-kr`.
    pub fn for_label(label: &str, lossy: bool) -> Result<Self, ReadError> {
        let encoding = Encoding::for_label(label.trim().as_bytes())
            .ok_or_else(|| ReadError::UnknownEncoding(label.to_string()))?;
        Ok(Self::new(encoding, lossy))
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.encoding
    }

    /// Decode `src`, which begins at byte `offset` of the source. `last` marks the final slice;
    /// until then a trailing partial sequence is held back for the next call.
    pub fn decode(&mut self, src: &[u8], offset: u64, last: bool) -> Result<String, ReadError> {
        if self.lossy {
            self.decode_lossy(src, last)
        } else {
            self.decode_strict(src, offset, last)
        }
    }

    fn decode_lossy(&mut self, src: &[u8], last: bool) -> Result<String, ReadError> {
        let capacity = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or_else(|| src.len() * 3 + 16);
        let mut out = String::with_capacity(capacity);
        let (result, _read, _had_errors) = self.decoder.decode_to_string(src, &mut out, last);
        debug_assert!(matches!(result, CoderResult::InputEmpty));
        Ok(out)
    }

    fn decode_strict(&mut self, src: &[u8], offset: u64, last: bool) -> Result<String, ReadError> {
        let capacity = self
            .decoder
            .max_utf8_buffer_length_without_replacement(src.len())
            .unwrap_or_else(|| src.len() * 3 + 16);
        let mut out = String::with_capacity(capacity);
        let (result, read) =
            self.decoder
                .decode_to_string_without_replacement(src, &mut out, last);

        match result {
            DecoderResult::InputEmpty => Ok(out),
            DecoderResult::Malformed(bad, extra) => Err(ReadError::Decode {
                offset: offset + read as u64 - u64::from(bad) - u64::from(extra),
                encoding: self.decoder.encoding().name(),
            }),
            // capacity was reserved for the worst case
            DecoderResult::OutputFull => Err(ReadError::Decode {
                offset: offset + read as u64,
                encoding: self.decoder.encoding().name(),
            }),
        }
    }
}
