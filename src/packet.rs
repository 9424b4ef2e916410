//! Packet contracts (spec.md §4.6): a value any [`crate::channel`] can frame
//! onto the wire, plus the built-in opaque and length-prefixed "Msg"
//! packet types. HTTP (`crate::channel::http_packet`) and RESP
//! (`crate::resp`) packets implement the same trait from their own modules.

use crate::io_buffer::IoBuffer;

/// Anything that can be written onto the wire and reset to an empty,
/// reusable state. Protocol channels additionally define an incremental
/// parser (see each channel module) that is not part of this trait because
/// parsing is a framing concern, not a packet concern.
pub trait Packet {
    /// Serializes `self` into `buf`'s writable region, growing as needed.
    /// Returns the number of bytes appended.
    fn serialize(&self, buf: &mut IoBuffer) -> usize;

    /// Serializes `self` into a freshly allocated string, for logging and
    /// tests. Default implementation round-trips through `serialize`.
    fn serialize_to_string(&self) -> String {
        let mut buf = IoBuffer::new();
        self.serialize(&mut buf);
        String::from_utf8_lossy(buf.grab_read().buf).into_owned()
    }

    /// Resets to an empty, reusable state (mirrors the original's `clear`,
    /// used so a channel's one allocated "current packet" can be reused
    /// across the receive loop instead of reallocating per packet).
    fn clear(&mut self);
}

/// Opaque byte-string packet: the body is the entire wire representation.
/// Used by `MsgChannel`'s body payloads and by simple echo-style channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobPacket {
    pub body: Vec<u8>,
}

impl BlobPacket {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        BlobPacket { body: body.into() }
    }
}

impl Packet for BlobPacket {
    fn serialize(&self, buf: &mut IoBuffer) -> usize {
        buf.write_to_buffer(&self.body)
    }

    fn clear(&mut self) {
        self.body.clear();
    }
}

/// Owned-`String` variant of [`BlobPacket`], for text protocols that want
/// `&str` access without a UTF-8 check on every use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StlStringPacket {
    pub body: String,
}

impl StlStringPacket {
    pub fn new(body: impl Into<String>) -> Self {
        StlStringPacket { body: body.into() }
    }
}

impl Packet for StlStringPacket {
    fn serialize(&self, buf: &mut IoBuffer) -> usize {
        buf.write_to_buffer(self.body.as_bytes())
    }

    fn clear(&mut self) {
        self.body.clear();
    }
}

/// Header size bounds for [`MsgPacket`], mirroring the original's
/// `MIN_HEADER_SIZE`/`MAX_HEADER_SIZE` framing limits.
pub const MIN_HEADER_SIZE: usize = 12;
pub const MAX_HEADER_SIZE: usize = 4096;

/// The length-prefixed "Msg" protocol packet: a text header of the form
/// `<command> <code> <transaction-id> <body-length> [key=value ...]`
/// followed by exactly `body-length` bytes of opaque body.
///
/// Fields beyond the fixed four are format-driven key/value pairs; per
/// spec.md's open question, anything past the fixed four is treated as an
/// opaque string pair and preserved in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgPacket {
    pub command: String,
    pub code: i32,
    pub txid: u32,
    pub extra: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MsgPacketError {
    #[error("msg header exceeds {MAX_HEADER_SIZE} bytes")]
    HeaderTooLarge,
    #[error("msg header shorter than {MIN_HEADER_SIZE} bytes")]
    HeaderTooShort,
    #[error("msg header missing required field: {0}")]
    MissingField(&'static str),
    #[error("msg header field is not a number: {0}")]
    NotANumber(&'static str),
    #[error("msg header key/value pair is malformed: {0}")]
    MalformedExtra(String),
}

impl MsgPacket {
    pub fn new(command: impl Into<String>, code: i32, txid: u32, body: impl Into<Vec<u8>>) -> Self {
        MsgPacket {
            command: command.into(),
            code,
            txid,
            extra: Vec::new(),
            body: body.into(),
        }
    }

    /// Parses the first-line header (without its trailing `\r\n`, which the
    /// channel's line scanner already consumed). Does not touch the body.
    pub fn parse_header(line: &[u8]) -> Result<(Self, usize), MsgPacketError> {
        if line.len() < MIN_HEADER_SIZE {
            return Err(MsgPacketError::HeaderTooShort);
        }
        if line.len() > MAX_HEADER_SIZE {
            return Err(MsgPacketError::HeaderTooLarge);
        }

        let text = String::from_utf8_lossy(line);
        let mut fields = text.split_whitespace();

        let command = fields.next().ok_or(MsgPacketError::MissingField("command"))?.to_string();
        let code: i32 = fields
            .next()
            .ok_or(MsgPacketError::MissingField("code"))?
            .parse()
            .map_err(|_| MsgPacketError::NotANumber("code"))?;
        let txid: u32 = fields
            .next()
            .ok_or(MsgPacketError::MissingField("txid"))?
            .parse()
            .map_err(|_| MsgPacketError::NotANumber("txid"))?;
        let body_len: usize = fields
            .next()
            .ok_or(MsgPacketError::MissingField("body-length"))?
            .parse()
            .map_err(|_| MsgPacketError::NotANumber("body-length"))?;

        let mut extra = Vec::new();
        for pair in fields {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| MsgPacketError::MalformedExtra(pair.to_string()))?;
            extra.push((k.to_string(), v.to_string()));
        }

        Ok((
            MsgPacket {
                command,
                code,
                txid,
                extra,
                body: Vec::new(),
            },
            body_len,
        ))
    }

    fn header_line(&self) -> String {
        let mut out = format!("{} {} {} {}", self.command, self.code, self.txid, self.body.len());
        for (k, v) in &self.extra {
            out.push(' ');
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }
}

impl Packet for MsgPacket {
    fn serialize(&self, buf: &mut IoBuffer) -> usize {
        let header = self.header_line();
        let mut n = buf.write_to_buffer(header.as_bytes());
        n += buf.write_to_buffer(b"\r\n");
        n += buf.write_to_buffer(&self.body);
        n
    }

    fn clear(&mut self) {
        self.command.clear();
        self.code = 0;
        self.txid = 0;
        self.extra.clear();
        self.body.clear();
    }
}
