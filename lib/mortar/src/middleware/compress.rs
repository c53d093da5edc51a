use crate::http::response::{Body, HttpResponse};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use lazy_static::lazy_static;
use std::io::{self, Read, Write};

lazy_static! {
    /// Content-type prefixes worth compressing.
    static ref COMPRESSIBLE: Vec<&'static str> = vec![
        "text/",
        "application/json",
        "application/javascript",
        "application/xml",
        "image/svg+xml",
    ];
}

/// One content coding: symmetric compress/decompress over byte slices.
#[derive(Copy, Clone)]
pub struct Codec {
    pub name: &'static str,
    pub compress: fn(&[u8], u32) -> io::Result<Vec<u8>>,
    pub decompress: fn(&[u8]) -> io::Result<Vec<u8>>,
}

fn gzip_compress(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));

    encoder.write_all(data)?;
    encoder.finish()
}

fn gzip_decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoded = Vec::new();

    GzDecoder::new(data).read_to_end(&mut decoded)?;
    Ok(decoded)
}

fn deflate_compress(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));

    encoder.write_all(data)?;
    encoder.finish()
}

fn deflate_decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoded = Vec::new();

    ZlibDecoder::new(data).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// Known codings in preference order. `identity` is implicit.
pub struct CodecRegistry {
    codecs: Vec<Codec>,
}

impl Default for CodecRegistry {
    fn default() -> CodecRegistry {
        CodecRegistry::standard()
    }
}

impl CodecRegistry {
    pub fn empty() -> CodecRegistry {
        CodecRegistry { codecs: Vec::new() }
    }

    pub fn standard() -> CodecRegistry {
        CodecRegistry {
            codecs: vec![
                Codec {
                    name: "gzip",
                    compress: gzip_compress,
                    decompress: gzip_decompress,
                },
                Codec {
                    name: "deflate",
                    compress: deflate_compress,
                    decompress: deflate_decompress,
                },
            ],
        }
    }

    pub fn register(&mut self, codec: Codec) {
        self.codecs.push(codec);
    }

    pub fn get(&self, name: &str) -> Option<&Codec> {
        self.codecs
            .iter()
            .find(|codec| codec.name.eq_ignore_ascii_case(name))
    }

    /// Picks the highest-q coding both sides know. `None` means identity.
    pub fn negotiate(&self, accept_encoding: Option<&str>) -> Option<&Codec> {
        let header = accept_encoding?;
        let prefs = parse_accept_encoding(header);

        let wildcard_q = prefs
            .iter()
            .find(|(name, _)| name.as_str() == "*")
            .map(|(_, q)| *q);

        let mut best: Option<(&Codec, f32)> = None;

        for codec in self.codecs.iter() {
            let quality = prefs
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(codec.name))
                .map(|(_, q)| *q)
                .or(wildcard_q)
                .unwrap_or(0.0);

            if quality <= 0.0 {
                continue;
            }

            match best {
                Some((_, current)) if current >= quality => {}
                _ => best = Some((codec, quality)),
            }
        }

        best.map(|(codec, _)| codec)
    }
}

/// Parses `Accept-Encoding` into `(coding, q)` pairs. Missing q defaults to
/// 1.0; unparsable q counts as zero.
pub fn parse_accept_encoding(header: &str) -> Vec<(String, f32)> {
    let mut prefs = Vec::new();

    for item in header.split(',') {
        let mut parts = item.split(';');
        let name = parts.next().unwrap_or("").trim().to_ascii_lowercase();

        if name.is_empty() {
            continue;
        }

        let mut quality = 1.0f32;

        for param in parts {
            let mut pair = param.splitn(2, '=');
            let key = pair.next().unwrap_or("").trim();

            if key.eq_ignore_ascii_case("q") {
                quality = pair
                    .next()
                    .unwrap_or("")
                    .trim()
                    .parse::<f32>()
                    .unwrap_or(0.0);
            }
        }

        prefs.push((name, quality));
    }

    prefs
}

fn compressible(content_type: Option<&str>) -> bool {
    match content_type {
        Some(value) => COMPRESSIBLE
            .iter()
            .any(|prefix| value.to_ascii_lowercase().starts_with(prefix)),
        None => false,
    }
}

/// Compresses a fixed response body in place when the negotiated codec,
/// size threshold and content-type policy all agree. Streaming bodies pass
/// through untouched.
pub fn apply(response: &mut HttpResponse, codec: &Codec, min_size: usize, level: u32) -> bool {
    if response.headers.contains("content-encoding") {
        return false;
    }

    if !compressible(response.headers.get("content-type")) {
        return false;
    }

    let bytes = match &response.body {
        Body::Bytes(bytes) if bytes.len() >= min_size => bytes,
        _ => return false,
    };

    let packed = match (codec.compress)(bytes, level) {
        Ok(packed) => packed,
        Err(_) => return false,
    };

    response.body = Body::Bytes(packed);
    response.headers.set("Content-Encoding", codec.name);
    response.headers.set("Vary", "Accept-Encoding");
    true
}
