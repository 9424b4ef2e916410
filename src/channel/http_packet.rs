//! HTTP/1.x request and response packets (spec.md §4.6). Headers are kept
//! in an order-preserving map (`indexmap`) since HTTP allows repeated
//! header names and most servers care about emission order; the original
//! used an ordered `keyivalue_cont` for the same reason.

use indexmap::IndexMap;

use crate::io_buffer::IoBuffer;
use crate::packet::Packet;

/// `Method`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
    Options,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            _ => return None,
        })
    }
}

/// `Version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
    Http2,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "HTTP/1.0" => Version::Http10,
            "HTTP/1.1" => Version::Http11,
            "HTTP/2" | "HTTP/2.0" => Version::Http2,
            _ => return None,
        })
    }
}

/// `Content-Encoding`, carried as response metadata only — this crate does
/// not itself gzip/deflate/sdch-decode bodies (spec.md Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Sdch,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
            ContentEncoding::Sdch => "sdch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim() {
            "identity" | "" => ContentEncoding::Identity,
            "gzip" => ContentEncoding::Gzip,
            "deflate" => ContentEncoding::Deflate,
            "sdch" => ContentEncoding::Sdch,
            _ => return None,
        })
    }
}

pub const HEADER_CONNECTION: &str = "Connection";
pub const HEADER_CONTENT_ENCODING: &str = "Content-Encoding";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";

/// Order-preserving header map, shared by request and response packets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(IndexMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Headers(IndexMap::new())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(k) = self.0.keys().find(|k| k.eq_ignore_ascii_case(key)).cloned() {
            self.0.shift_remove(&k);
        }
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get(HEADER_CONTENT_LENGTH)?.parse().ok()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(HEADER_CONTENT_TYPE)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn write(&self, out: &mut String) {
        for (k, v) in self.0.iter() {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
    }
}

/// Parses a single `"Key: value"` header line. Returns `None` if `line`
/// has no `:` separator.
pub fn parse_header_line(line: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(line);
    let (k, v) = text.split_once(':')?;
    Some((k.trim().to_string(), v.trim().to_string()))
}

/// Splits an `application/x-www-form-urlencoded` body into ordered
/// key/value pairs.
pub fn split_urlencoded_form(body: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(body);
    text.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (url_decode(k), url_decode(v)),
            None => (url_decode(pair), String::new()),
        })
        .collect()
}

/// Joins key/value pairs back into an `application/x-www-form-urlencoded`
/// body.
pub fn merge_urlencoded_form(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", url_encode(k), url_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// HTTP request: `METHOD uri VERSION` first line, headers, opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestPacket {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequestPacket {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        HttpRequestPacket {
            method,
            uri: uri.into(),
            version: Version::Http11,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Parses `"METHOD uri VERSION"`.
    pub fn parse_first_line(line: &[u8]) -> Option<(Method, String, Version)> {
        let text = String::from_utf8_lossy(line);
        let mut parts = text.split_whitespace();
        let method = Method::parse(parts.next()?)?;
        let uri = parts.next()?.to_string();
        let version = Version::parse(parts.next()?)?;
        Some((method, uri, version))
    }

    fn first_line(&self) -> String {
        format!("{} {} {}", self.method.as_str(), self.uri, self.version.as_str())
    }

    pub fn split_urlencoded_form(&self) -> Vec<(String, String)> {
        split_urlencoded_form(&self.body)
    }

    pub fn merge_urlencoded_form(&mut self, pairs: &[(String, String)]) {
        self.body = merge_urlencoded_form(pairs).into_bytes();
        self.headers.set(HEADER_CONTENT_TYPE, "application/x-www-form-urlencoded");
        self.headers.set(HEADER_CONTENT_LENGTH, self.body.len().to_string());
    }
}

impl Default for HttpRequestPacket {
    fn default() -> Self {
        HttpRequestPacket::new(Method::Get, "")
    }
}

impl Packet for HttpRequestPacket {
    fn serialize(&self, buf: &mut IoBuffer) -> usize {
        let mut head = self.first_line();
        head.push_str("\r\n");
        self.headers.write(&mut head);
        head.push_str("\r\n");

        let mut n = buf.write_to_buffer(head.as_bytes());
        n += buf.write_to_buffer(&self.body);
        n
    }

    fn clear(&mut self) {
        self.uri.clear();
        self.headers = Headers::new();
        self.body.clear();
    }
}

/// HTTP response: `VERSION status reason` first line, headers, opaque
/// body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponsePacket {
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponsePacket {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        HttpResponsePacket {
            version: Version::Http11,
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Parses `"VERSION status reason..."`.
    pub fn parse_first_line(line: &[u8]) -> Option<(Version, u16, String)> {
        let text = String::from_utf8_lossy(line);
        let mut parts = text.splitn(3, ' ');
        let version = Version::parse(parts.next()?)?;
        let status: u16 = parts.next()?.parse().ok()?;
        let reason = parts.next().unwrap_or("").to_string();
        Some((version, status, reason))
    }

    fn first_line(&self) -> String {
        format!("{} {} {}", self.version.as_str(), self.status, self.reason)
    }

    pub fn content_encoding(&self) -> ContentEncoding {
        self.headers
            .get(HEADER_CONTENT_ENCODING)
            .and_then(ContentEncoding::parse)
            .unwrap_or(ContentEncoding::Identity)
    }
}

impl Default for HttpResponsePacket {
    fn default() -> Self {
        HttpResponsePacket::new(0, "")
    }
}

impl Packet for HttpResponsePacket {
    fn serialize(&self, buf: &mut IoBuffer) -> usize {
        let mut head = self.first_line();
        head.push_str("\r\n");
        self.headers.write(&mut head);
        head.push_str("\r\n");

        let mut n = buf.write_to_buffer(head.as_bytes());
        n += buf.write_to_buffer(&self.body);
        n
    }

    fn clear(&mut self) {
        self.status = 0;
        self.reason.clear();
        self.headers = Headers::new();
        self.body.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_serialize_and_parse_first_line() {
        let mut req = HttpRequestPacket::new(Method::Get, "/status");
        req.headers.set("Host", "example.com");
        req.body = b"".to_vec();

        let mut buf = IoBuffer::new();
        req.serialize(&mut buf);

        let line = buf.get_line().unwrap();
        let (method, uri, version) = HttpRequestPacket::parse_first_line(&line).unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(uri, "/status");
        assert_eq!(version, Version::Http11);
    }

    #[test]
    fn response_first_line_parses_status_and_reason() {
        let line = b"HTTP/1.1 404 Not Found";
        let (version, status, reason) = HttpResponsePacket::parse_first_line(line).unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(status, 404);
        assert_eq!(reason, "Not Found");
    }

    #[test]
    fn urlencoded_form_round_trips() {
        let pairs = vec![("name".to_string(), "a b".to_string()), ("x".to_string(), "1&2".to_string())];
        let body = merge_urlencoded_form(&pairs);
        let parsed = split_urlencoded_form(body.as_bytes());
        assert_eq!(parsed, pairs);
    }

    #[test]
    fn headers_are_case_insensitive_on_lookup() {
        let mut h = Headers::new();
        h.set("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
    }

    #[test]
    fn content_encoding_defaults_to_identity() {
        let resp = HttpResponsePacket::new(200, "OK");
        assert_eq!(resp.content_encoding(), ContentEncoding::Identity);
    }

    #[test]
    fn header_line_parses_key_and_trims_value() {
        assert_eq!(
            parse_header_line(b"Content-Length:  42 "),
            Some(("Content-Length".to_string(), "42".to_string()))
        );
        assert_eq!(parse_header_line(b"not-a-header"), None);
    }
}
