use crate::error::ExchangeError;
use bytes::Bytes;
use encoding_rs::{CoderResult, Encoding, SHIFT_JIS, UTF_8};
use flate2::read::DeflateDecoder;
use flate2::read::GzDecoder;
use std::io::{self, Read, Write};
use std::str::FromStr;
use tracing::warn;

pub const ENC_IDENTITY: &str = "identity";
pub const ENC_GZIP: &str = "gzip";
pub const ENC_DEFLATE: &str = "deflate";
pub const ENC_ZSTD: &str = "zstd";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Zstd,
}

impl FromStr for ContentEncoding {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | ENC_IDENTITY => Ok(ContentEncoding::Identity),
            ENC_GZIP | "x-gzip" => Ok(ContentEncoding::Gzip),
            ENC_DEFLATE => Ok(ContentEncoding::Deflate),
            ENC_ZSTD => Ok(ContentEncoding::Zstd),
            other => Err(ExchangeError::Protocol(format!(
                "unsupported content encoding: {other}"
            ))),
        }
    }
}

impl ContentEncoding {
    pub fn from_header(value: Option<&str>) -> Result<Self, ExchangeError> {
        value.map_or(Ok(ContentEncoding::Identity), str::parse)
    }
}

pub fn decode_gzip(data: &[u8]) -> io::Result<Bytes> {
    let mut decoder = GzDecoder::new(data);
    let mut decoded_data = Vec::new();
    decoder.read_to_end(&mut decoded_data)?;
    Ok(Bytes::from(decoded_data))
}

pub fn decode_deflate(data: &[u8]) -> io::Result<Bytes> {
    let mut decoder = DeflateDecoder::new(data);
    let mut decoded_data = Vec::new();
    decoder.read_to_end(&mut decoded_data)?;
    Ok(Bytes::from(decoded_data))
}

pub fn decode_zstd(data: &[u8]) -> io::Result<Bytes> {
    let decoded_data = zstd::decode_all(data)?;
    Ok(Bytes::from(decoded_data))
}

/// Picks the charset named by a `Content-Type` header, if any.
pub fn charset_of(content_type: Option<&str>) -> Option<&'static Encoding> {
    content_type?
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .and_then(|(_, label)| Encoding::for_label(label.trim().trim_matches('"').as_bytes()))
}

/// Decodes a complete response body. Used for replies that are read in one piece.
pub fn decode_body(
    data: &[u8],
    encoding: ContentEncoding,
    charset: Option<&'static Encoding>,
) -> Result<String, ExchangeError> {
    let body_bytes = match encoding {
        ContentEncoding::Identity => Bytes::copy_from_slice(data),
        ContentEncoding::Gzip => decode_gzip(data)?,
        ContentEncoding::Deflate => decode_deflate(data)?,
        ContentEncoding::Zstd => decode_zstd(data)?,
    };

    if let Some(charset) = charset {
        let (text, _, had_errors) = charset.decode(&body_bytes);
        if had_errors {
            warn!(charset = charset.name(), "malformed bytes replaced while decoding body");
        }
        return Ok(text.into_owned());
    }

    // Try decoding the body as UTF-8 first, and if it fails,
    // fall back to SHIFT_JIS
    let body = match String::from_utf8(body_bytes.to_vec()) {
        Ok(s) => s,
        Err(utf8e) => {
            let (r, _, sjis_error) = SHIFT_JIS.decode(&body_bytes);
            if sjis_error {
                warn!("body is neither utf8 nor shift-jis ({utf8e}), substituting");
                String::from_utf8_lossy(&body_bytes).into_owned()
            } else {
                r.into_owned()
            }
        }
    };

    Ok(body)
}

/// Decompresses a body chunk by chunk.
pub enum ContentDecoder {
    Identity,
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(flate2::write::DeflateDecoder<Vec<u8>>),
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
}

impl ContentDecoder {
    pub fn new(encoding: ContentEncoding) -> io::Result<Self> {
        Ok(match encoding {
            ContentEncoding::Identity => ContentDecoder::Identity,
            ContentEncoding::Gzip => ContentDecoder::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            ContentEncoding::Deflate => {
                ContentDecoder::Deflate(flate2::write::DeflateDecoder::new(Vec::new()))
            }
            ContentEncoding::Zstd => {
                ContentDecoder::Zstd(zstd::stream::write::Decoder::new(Vec::new())?)
            }
        })
    }

    pub fn decode(&mut self, chunk: Bytes) -> io::Result<Bytes> {
        match self {
            ContentDecoder::Identity => Ok(chunk),
            ContentDecoder::Gzip(w) => {
                w.write_all(&chunk)?;
                w.flush()?;
                Ok(Bytes::from(std::mem::take(w.get_mut())))
            }
            ContentDecoder::Deflate(w) => {
                w.write_all(&chunk)?;
                w.flush()?;
                Ok(Bytes::from(std::mem::take(w.get_mut())))
            }
            ContentDecoder::Zstd(w) => {
                w.write_all(&chunk)?;
                w.flush()?;
                Ok(Bytes::from(std::mem::take(w.get_mut())))
            }
        }
    }

    pub fn finish(&mut self) -> io::Result<Bytes> {
        match self {
            ContentDecoder::Identity => Ok(Bytes::new()),
            ContentDecoder::Gzip(w) => {
                w.try_finish()?;
                Ok(Bytes::from(std::mem::take(w.get_mut())))
            }
            ContentDecoder::Deflate(w) => {
                w.try_finish()?;
                Ok(Bytes::from(std::mem::take(w.get_mut())))
            }
            ContentDecoder::Zstd(w) => {
                w.flush()?;
                Ok(Bytes::from(std::mem::take(w.get_mut())))
            }
        }
    }
}

/// Charset decoder that keeps incomplete multi-byte sequences between chunks.
pub struct StreamDecoder {
    decoder: encoding_rs::Decoder,
    had_replacements: bool,
    finished: bool,
}

impl StreamDecoder {
    pub fn new(encoding: &'static Encoding) -> Self {
        StreamDecoder {
            decoder: encoding.new_decoder_with_bom_removal(),
            had_replacements: false,
            finished: false,
        }
    }

    pub fn utf8() -> Self {
        Self::new(UTF_8)
    }

    pub fn encoding(&self) -> &'static Encoding {
        self.decoder.encoding()
    }

    /// True once any malformed input has been replaced with U+FFFD.
    pub fn had_replacements(&self) -> bool {
        self.had_replacements
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.run(bytes, false)
    }

    /// Flushes whatever is still buffered. A truncated trailing sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        self.run(&[], true)
    }

    fn run(&mut self, bytes: &[u8], last: bool) -> String {
        if self.finished {
            return String::new();
        }
        self.finished = last;

        let mut input = bytes;
        let mut out = String::with_capacity(self.capacity_for(input.len()));
        loop {
            let (result, read, replaced) = self.decoder.decode_to_string(input, &mut out, last);
            self.had_replacements |= replaced;
            input = &input[read..];
            match result {
                CoderResult::InputEmpty => break,
                CoderResult::OutputFull => {
                    let extra = self.capacity_for(input.len());
                    out.reserve(extra);
                }
            }
        }
        out
    }

    fn capacity_for(&self, len: usize) -> usize {
        self.decoder
            .max_utf8_buffer_length(len)
            .unwrap_or(len.saturating_mul(3) + 16)
    }
}
