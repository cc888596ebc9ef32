//! HTTP response with explicit decompression.

use std::io::Read;

use bytes::Bytes;
use serde::Serialize;

use crate::error::{Error, Result};

/// Status line and headers of a response, before the body is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Vec<String>,
    /// The URL that produced this response, after redirects.
    pub effective_url: String,
}

impl ResponseHead {
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }
}

/// HTTP response with its fully read body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<String>,
    body: Bytes,
    http_version: String,
    pub effective_url: String,
}

impl Response {
    pub fn new(head: ResponseHead, body: Bytes) -> Self {
        Self {
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body,
            http_version: head.version,
            effective_url: head.effective_url,
        }
    }

    pub fn http_version(&self) -> &str { &self.http_version }
    pub fn body(&self) -> &Bytes { &self.body }
    pub fn into_body(self) -> Bytes { self.body }
    pub fn is_success(&self) -> bool { (200..300).contains(&self.status) }
    pub fn is_redirect(&self) -> bool { (300..400).contains(&self.status) }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn get_headers(&self, name: &str) -> Vec<&str> {
        self.headers.iter().filter_map(|h| {
            let (key, value) = h.split_once(':')?;
            if key.trim().eq_ignore_ascii_case(name) { Some(value.trim()) } else { None }
        }).collect()
    }

    pub fn content_type(&self) -> Option<&str> { self.get_header("Content-Type") }
    pub fn content_encoding(&self) -> Option<&str> { self.get_header("Content-Encoding") }

    /// Decode body based on Content-Encoding (gzip, deflate, br, zstd).
    pub fn decoded_body(&self) -> Result<Bytes> {
        match self.content_encoding().map(|s| s.to_lowercase()).as_deref() {
            Some("gzip") | Some("x-gzip") => decode_gzip(&self.body),
            Some("deflate") => decode_deflate(&self.body),
            Some("br") => decode_brotli(&self.body),
            Some("zstd") => decode_zstd(&self.body),
            _ => Ok(self.body.clone()),
        }
    }

    pub fn text(&self) -> Result<String> {
        let decoded = self.decoded_body()?;
        String::from_utf8(decoded.to_vec())
            .map_err(|e| Error::Decompression(format!("UTF-8 decode error: {}", e)))
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let text = self.text()?;
        serde_json::from_str(&text).map_err(Error::from)
    }
}

pub(crate) fn find_header<'a>(headers: &'a [String], name: &str) -> Option<&'a str> {
    headers.iter().find_map(|h| {
        let (key, value) = h.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

fn decode_gzip(data: &[u8]) -> Result<Bytes> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).map_err(|e| Error::Decompression(format!("gzip: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_deflate(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    if flate2::read::ZlibDecoder::new(data).read_to_end(&mut decoded).is_ok() {
        return Ok(Bytes::from(decoded));
    }
    decoded.clear();
    flate2::read::DeflateDecoder::new(data).read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("deflate: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_brotli(data: &[u8]) -> Result<Bytes> {
    let mut decoder = brotli::Decompressor::new(data, 4096);
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded).map_err(|e| Error::Decompression(format!("brotli: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_zstd(data: &[u8]) -> Result<Bytes> {
    zstd::stream::decode_all(data)
        .map(Bytes::from)
        .map_err(|e| Error::Decompression(format!("zstd: {}", e)))
}
