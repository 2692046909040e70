//! CoAP message model and its RFC 7252 wire codec

use std::{fmt, ops};

use bytes::{Buf, Bytes};
use thiserror::Error;

use crate::coding::{self, BoundedBuf, BufExt, Overflow, UnexpectedEnd};

/// The CoAP protocol version implemented
pub const VERSION: u8 = 1;
/// Longest token or ETag permitted on the wire
pub const MAX_TAG_LEN: usize = 8;

const PAYLOAD_MARKER: u8 = 0xff;
const MAX_OPTION_LEN: usize = 269 + u16::MAX as usize;

/// Reliability class of a message
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Type {
    /// Requires an acknowledgement
    Confirmable = 0,
    /// Fire and forget
    NonConfirmable = 1,
    /// Acknowledges a confirmable message, possibly carrying a piggybacked response
    Acknowledgement = 2,
    /// Rejects a message the receiver could not process
    Reset = 3,
}

impl Type {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Confirmable => "CON",
            Self::NonConfirmable => "NON",
            Self::Acknowledgement => "ACK",
            Self::Reset => "RST",
        })
    }
}

/// Method or response code, encoded as `class.detail`
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Code(pub u8);

macro_rules! codes {
    {$($name:ident($class:expr, $detail:expr) $desc:expr;)*} => {
        impl Code {
            $(#[doc = $desc] pub const $name: Self = Code(($class << 5) | $detail);)*
        }

        impl fmt::Debug for Code {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$name => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Code({})", self),
                }
            }
        }
    }
}

codes! {
    EMPTY(0, 0) "an empty message, used for bare acknowledgements and resets";
    GET(0, 1) "retrieve a representation of a resource";
    POST(0, 2) "process the enclosed representation";
    PUT(0, 3) "replace the resource with the enclosed representation";
    DELETE(0, 4) "remove the resource";
    FETCH(0, 5) "retrieve a representation selected by the request payload";
    CREATED(2, 1) "the resource was created";
    DELETED(2, 2) "the resource was deleted";
    VALID(2, 3) "the cached representation is still valid";
    CHANGED(2, 4) "the resource was modified";
    CONTENT(2, 5) "the response carries a representation";
    CONTINUE(2, 31) "send the next block of a request";
    BAD_REQUEST(4, 0) "the request was malformed";
    UNAUTHORIZED(4, 1) "the client is not authorized";
    BAD_OPTION(4, 2) "a critical option was not understood";
    FORBIDDEN(4, 3) "access is not permitted";
    NOT_FOUND(4, 4) "the resource does not exist";
    METHOD_NOT_ALLOWED(4, 5) "the method is not supported by the resource";
    NOT_ACCEPTABLE(4, 6) "no representation matches the requested content-format";
    REQUEST_ENTITY_INCOMPLETE(4, 8) "a block of the request body is missing";
    PRECONDITION_FAILED(4, 12) "a request precondition did not hold";
    REQUEST_ENTITY_TOO_LARGE(4, 13) "the request body is too large";
    UNSUPPORTED_CONTENT_FORMAT(4, 15) "the request content-format is not supported";
    INTERNAL_SERVER_ERROR(5, 0) "the server hit an internal error";
    NOT_IMPLEMENTED(5, 1) "the server does not implement the function";
    BAD_GATEWAY(5, 2) "an upstream server returned an invalid response";
    SERVICE_UNAVAILABLE(5, 3) "the server is temporarily unable to respond";
    GATEWAY_TIMEOUT(5, 4) "an upstream server did not respond in time";
}

impl Code {
    /// Construct from class and detail
    pub const fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1f))
    }

    /// The `c` in `c.dd`
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// The `dd` in `c.dd`
    pub fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    /// Shorthand for `self == Code::EMPTY`
    pub fn is_empty(self) -> bool {
        self == Self::EMPTY
    }

    /// Whether this is a method code
    pub fn is_request(self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    /// Whether this is a 2.xx response code
    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// Option number
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OptionNumber(pub u16);

impl OptionNumber {
    #![allow(missing_docs)]
    pub const IF_MATCH: Self = Self(1);
    pub const URI_HOST: Self = Self(3);
    pub const ETAG: Self = Self(4);
    pub const IF_NONE_MATCH: Self = Self(5);
    pub const OBSERVE: Self = Self(6);
    pub const URI_PORT: Self = Self(7);
    pub const LOCATION_PATH: Self = Self(8);
    pub const URI_PATH: Self = Self(11);
    pub const CONTENT_FORMAT: Self = Self(12);
    pub const MAX_AGE: Self = Self(14);
    pub const URI_QUERY: Self = Self(15);
    pub const ACCEPT: Self = Self(17);
    pub const LOCATION_QUERY: Self = Self(20);
    pub const BLOCK2: Self = Self(23);
    pub const BLOCK1: Self = Self(27);
    pub const SIZE2: Self = Self(28);
    pub const PROXY_URI: Self = Self(35);
    pub const SIZE1: Self = Self(60);
    pub const NO_RESPONSE: Self = Self(258);
    /// Server time, milliseconds since the Unix epoch
    pub const TIME: Self = Self(0xfde8);
    /// ETag of a subresource the server read on behalf of the device
    pub const READ_ETAG: Self = Self(0xfdf0);
    /// Response code of that subresource read
    pub const READ_RESPONSE_CODE: Self = Self(0xfdf4);
    /// Send interval suggested by the server, in seconds
    pub const INTERVAL: Self = Self(0xfdf8);

    /// Whether a receiver must reject the message if it doesn't understand this option
    pub fn is_critical(self) -> bool {
        self.0 & 1 == 1
    }
}

/// Registered content-format identifiers used by this client
pub mod content_format {
    #![allow(missing_docs)]
    pub const TEXT_PLAIN: u16 = 0;
    pub const LINK_FORMAT: u16 = 40;
    pub const OCTET_STREAM: u16 = 42;
    pub const JSON: u16 = 50;
    pub const CBOR: u16 = 60;
}

/// Opaque byte string of at most 8 bytes, used for tokens and ETags
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Tag {
    len: u8,
    bytes: [u8; MAX_TAG_LEN],
}

/// Request/response correlation tag
pub type Token = Tag;
/// Resource version tag
pub type ETag = Tag;

/// A tag longer than [`MAX_TAG_LEN`] was supplied
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
#[error("tag of {0} bytes exceeds 8")]
pub struct TagTooLong(pub usize);

impl Tag {
    pub(crate) fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_TAG_LEN);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_TAG_LEN],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }
}

impl TryFrom<&[u8]> for Tag {
    type Error = TagTooLong;
    fn try_from(bytes: &[u8]) -> Result<Self, TagTooLong> {
        if bytes.len() > MAX_TAG_LEN {
            return Err(TagTooLong(bytes.len()));
        }
        Ok(Self::new(bytes))
    }
}

impl ops::Deref for Tag {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.bytes[..self.len as usize], f)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Options of a message, ordered by option number
///
/// Repeated options keep their insertion order, which is significant for e.g. `Uri-Path`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(OptionNumber, Bytes)>);

impl Options {
    /// Append an option after any existing ones with the same number
    pub fn push(&mut self, number: OptionNumber, value: impl Into<Bytes>) {
        let pos = self.0.partition_point(|(n, _)| *n <= number);
        self.0.insert(pos, (number, value.into()));
    }

    /// Append an option holding an unsigned integer in its shortest form
    pub fn push_uint(&mut self, number: OptionNumber, value: u32) {
        self.push(number, coding::uint_bytes(value));
    }

    /// Append an option holding a UTF-8 string
    pub fn push_str(&mut self, number: OptionNumber, value: &str) {
        self.push(number, Bytes::copy_from_slice(value.as_bytes()));
    }

    /// First value of an option
    pub fn get(&self, number: OptionNumber) -> Option<&Bytes> {
        self.get_all(number).next()
    }

    /// All values of a repeatable option
    pub fn get_all(&self, number: OptionNumber) -> impl Iterator<Item = &Bytes> {
        self.0
            .iter()
            .filter(move |(n, _)| *n == number)
            .map(|(_, value)| value)
    }

    /// First value of an option interpreted as an unsigned integer
    ///
    /// Values wider than 32 bits are treated as absent.
    pub fn get_uint(&self, number: OptionNumber) -> Option<u32> {
        self.get(number).and_then(|value| coding::uint_value(value))
    }

    /// Drop every value of an option
    pub fn remove(&mut self, number: OptionNumber) {
        self.0.retain(|(n, _)| *n != number);
    }

    /// Iterate over all options in wire order
    pub fn iter(&self) -> impl Iterator<Item = (OptionNumber, &Bytes)> {
        self.0.iter().map(|(n, value)| (*n, value))
    }

    /// Number of option instances
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no options
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Contents of a `Block2` or `Block1` option
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Block {
    /// Block number, relative to the block size
    pub num: u32,
    /// Whether more blocks follow
    pub more: bool,
    /// Size exponent; the block holds `2^(szx + 4)` bytes
    pub szx: u8,
}

/// A block option could not be interpreted
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockError {
    /// The option value is wider than 3 bytes
    #[error("block option longer than 3 bytes")]
    TooLong,
    /// Size exponent 7 is reserved
    #[error("reserved block size exponent")]
    ReservedSize,
    /// The block number does not fit in 20 bits
    #[error("block number out of range")]
    Number,
}

impl Block {
    /// Largest size exponent, i.e. 1024 byte blocks
    pub const MAX_SZX: u8 = 6;
    const MAX_NUM: u32 = (1 << 20) - 1;

    /// Construct a validated block description
    pub fn new(num: u32, more: bool, szx: u8) -> Result<Self, BlockError> {
        if szx > Self::MAX_SZX {
            return Err(BlockError::ReservedSize);
        }
        if num > Self::MAX_NUM {
            return Err(BlockError::Number);
        }
        Ok(Self { num, more, szx })
    }

    /// The block starting at byte `offset`, which must be a multiple of the block size
    pub fn at_offset(offset: u64, szx: u8) -> Result<Self, BlockError> {
        if szx > Self::MAX_SZX {
            return Err(BlockError::ReservedSize);
        }
        let num = u32::try_from(offset >> (szx + 4)).map_err(|_| BlockError::Number)?;
        Self::new(num, false, szx)
    }

    /// Block size in bytes
    pub fn size(self) -> usize {
        1 << (self.szx + 4)
    }

    /// Byte offset of the first byte of this block
    pub fn offset(self) -> u64 {
        u64::from(self.num) << (self.szx + 4)
    }

    /// Encode as an option value
    pub fn encode(self) -> Bytes {
        coding::uint_bytes((self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx))
    }

    /// Decode an option value
    pub fn decode(value: &[u8]) -> Result<Self, BlockError> {
        if value.len() > 3 {
            return Err(BlockError::TooLong);
        }
        let raw = coding::uint_value(value).ok_or(BlockError::TooLong)?;
        let szx = (raw & 0x07) as u8;
        if szx == 7 {
            return Err(BlockError::ReservedSize);
        }
        Ok(Self {
            num: raw >> 4,
            more: raw & 0x08 != 0,
            szx,
        })
    }
}

/// A single CoAP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Reliability class
    pub ty: Type,
    /// Method or response code
    pub code: Code,
    /// Message ID, used for deduplication and to match acknowledgements
    pub id: u16,
    /// Correlates responses with requests
    pub token: Token,
    /// Options in wire order
    pub options: Options,
    /// Payload, empty if none
    pub payload: Bytes,
}

impl Message {
    /// Create a message without options or payload
    pub fn new(ty: Type, code: Code) -> Self {
        Self {
            ty,
            code,
            id: 0,
            token: Token::default(),
            options: Options::default(),
            payload: Bytes::new(),
        }
    }

    /// Empty acknowledgement for message `id`
    pub fn empty_ack(id: u16) -> Self {
        Self {
            id,
            ..Self::new(Type::Acknowledgement, Code::EMPTY)
        }
    }

    /// Replace the `Uri-Path` with the `/`-separated segments of `path`
    pub fn set_uri_path(&mut self, path: &str) -> &mut Self {
        self.options.remove(OptionNumber::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.options.push_str(OptionNumber::URI_PATH, segment);
        }
        self
    }

    /// Append one `Uri-Query` parameter
    pub fn add_uri_query(&mut self, query: &str) -> &mut Self {
        self.options.push_str(OptionNumber::URI_QUERY, query);
        self
    }

    /// The `Uri-Path` joined with `/`
    pub fn uri_path(&self) -> String {
        self.options
            .get_all(OptionNumber::URI_PATH)
            .map(|s| String::from_utf8_lossy(s))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Set the content-format of the payload
    pub fn set_content_format(&mut self, format: u16) -> &mut Self {
        self.options.remove(OptionNumber::CONTENT_FORMAT);
        self.options
            .push_uint(OptionNumber::CONTENT_FORMAT, u32::from(format));
        self
    }

    /// Content-format of the payload, if declared
    pub fn content_format(&self) -> Option<u16> {
        self.options
            .get_uint(OptionNumber::CONTENT_FORMAT)
            .and_then(|v| u16::try_from(v).ok())
    }

    /// First ETag, if any
    pub fn etag(&self) -> Option<Result<ETag, TagTooLong>> {
        self.options
            .get(OptionNumber::ETAG)
            .map(|value| ETag::try_from(&value[..]))
    }

    /// Set the `Block2` option
    pub fn set_block2(&mut self, block: Block) -> &mut Self {
        self.options.remove(OptionNumber::BLOCK2);
        self.options.push(OptionNumber::BLOCK2, block.encode());
        self
    }

    /// The `Block2` option, if present
    pub fn block2(&self) -> Option<Result<Block, BlockError>> {
        self.options
            .get(OptionNumber::BLOCK2)
            .map(|value| Block::decode(value))
    }

    /// Total size of the representation announced by `Size2`
    pub fn size2(&self) -> Option<u32> {
        self.options.get_uint(OptionNumber::SIZE2)
    }

    /// Whether this is an empty message
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Append the wire encoding to `buf`
    pub fn encode(&self, buf: &mut BoundedBuf) -> Result<(), Overflow> {
        buf.put_u8((VERSION << 6) | ((self.ty as u8) << 4) | self.token.len() as u8)?;
        buf.put_u8(self.code.0)?;
        buf.put_u16(self.id)?;
        buf.put_slice(&self.token)?;

        let mut last = 0;
        for (number, value) in self.options.iter() {
            if value.len() > MAX_OPTION_LEN {
                return Err(Overflow {
                    limit: buf.len() + buf.remaining(),
                });
            }
            let (delta, delta_ext) = nibble(u32::from(number.0 - last));
            let (length, length_ext) = nibble(value.len() as u32);
            buf.put_u8((delta << 4) | length)?;
            delta_ext.put(buf)?;
            length_ext.put(buf)?;
            buf.put_slice(value)?;
            last = number.0;
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER)?;
            buf.put_slice(&self.payload)?;
        }
        Ok(())
    }

    /// Encode into a fresh buffer of at most `limit` bytes
    pub fn to_bytes(&self, limit: usize) -> Result<Bytes, Overflow> {
        let mut buf = BoundedBuf::new(limit);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse a datagram
    pub fn decode(mut data: Bytes) -> Result<Self, DecodeError> {
        let first = data.get::<u8>()?;
        if first >> 6 != VERSION {
            return Err(DecodeError::Version(first >> 6));
        }
        let ty = Type::from_bits(first >> 4);
        let tkl = first & 0x0f;
        if usize::from(tkl) > MAX_TAG_LEN {
            return Err(DecodeError::TokenLength(tkl));
        }
        let code = Code(data.get()?);
        let id = data.get::<u16>()?;
        let token = Token::new(&data.take_bytes(usize::from(tkl))?);
        if code.is_empty() && (tkl != 0 || data.has_remaining()) {
            return Err(DecodeError::EmptyWithContent);
        }

        let mut options = Options::default();
        let mut number = 0u32;
        let mut payload = Bytes::new();
        while data.has_remaining() {
            let byte = data.get::<u8>()?;
            if byte == PAYLOAD_MARKER {
                if !data.has_remaining() {
                    return Err(DecodeError::EmptyPayload);
                }
                payload = data.split_off(0);
                break;
            }
            number += extended(byte >> 4, &mut data)?;
            let len = extended(byte & 0x0f, &mut data)?;
            let number = u16::try_from(number).map_err(|_| DecodeError::OptionNumber)?;
            let value = data.take_bytes(len as usize)?;
            // Deltas are non-negative, so appending keeps wire order
            options.0.push((OptionNumber(number), value));
        }

        Ok(Self {
            ty,
            code,
            id,
            token,
            options,
            payload,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} mid={} token={}", self.ty, self.code, self.id, self.token)?;
        if self.options.get(OptionNumber::URI_PATH).is_some() {
            write!(f, " /{}", self.uri_path())?;
        }
        if let Some(Ok(block)) = self.block2() {
            write!(
                f,
                " block2={}/{}/{}",
                block.num,
                u8::from(block.more),
                block.size()
            )?;
        }
        if !self.payload.is_empty() {
            write!(f, " len={}", self.payload.len())?;
        }
        Ok(())
    }
}

/// Reasons a datagram could not be parsed as a message
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum DecodeError {
    /// The datagram ended in the middle of a field
    #[error("truncated message")]
    Truncated,
    /// Version bits other than 1
    #[error("unsupported version {0}")]
    Version(u8),
    /// Token length nibble above 8
    #[error("token length {0} exceeds 8")]
    TokenLength(u8),
    /// An empty message carried a token, options or payload
    #[error("empty message carries content")]
    EmptyWithContent,
    /// Option delta or length nibble 15 outside the payload marker
    #[error("reserved option nibble")]
    ReservedNibble,
    /// Accumulated option number beyond 65535
    #[error("option number out of range")]
    OptionNumber,
    /// A payload marker followed by nothing
    #[error("payload marker without payload")]
    EmptyPayload,
}

impl From<UnexpectedEnd> for DecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::Truncated
    }
}

enum Extension {
    None,
    One(u8),
    Two(u16),
}

impl Extension {
    fn put(self, buf: &mut BoundedBuf) -> Result<(), Overflow> {
        match self {
            Self::None => Ok(()),
            Self::One(x) => buf.put_u8(x),
            Self::Two(x) => buf.put_u16(x),
        }
    }
}

fn nibble(value: u32) -> (u8, Extension) {
    match value {
        0..=12 => (value as u8, Extension::None),
        13..=268 => (13, Extension::One((value - 13) as u8)),
        _ => (14, Extension::Two((value - 269) as u16)),
    }
}

fn extended(nibble: u8, data: &mut Bytes) -> Result<u32, DecodeError> {
    Ok(match nibble {
        0..=12 => u32::from(nibble),
        13 => u32::from(data.get::<u8>()?) + 13,
        14 => u32::from(data.get::<u16>()?) + 269,
        _ => return Err(DecodeError::ReservedNibble),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Message {
        let mut msg = Message::new(Type::Confirmable, Code::GET);
        msg.id = 0x1234;
        msg.token = Token::new(&[0xde, 0xad, 0xbe, 0xef]);
        msg.set_uri_path("fw/box-v1.2.3")
            .add_uri_query("series")
            .set_block2(Block::new(3, false, 5).unwrap());
        msg.options
            .push(OptionNumber::NO_RESPONSE, Bytes::from_static(&[0x02]));
        msg.options.push_uint(OptionNumber::TIME, 1_700_000_000);
        msg.options
            .push(OptionNumber::ETAG, Bytes::from(vec![0x55; 8]));
        msg.payload = Bytes::from(vec![0xa5; 300]);
        msg
    }

    #[test]
    fn header_layout() {
        let msg = request();
        let bytes = msg.to_bytes(1024).unwrap();
        assert_eq!(bytes[0], 0x44); // ver 1, CON, tkl 4
        assert_eq!(bytes[1], 0x01);
        assert_eq!(&bytes[2..4], &[0x12, 0x34]);
        assert_eq!(&bytes[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        // ETag (4) comes first: delta 4, length 8
        assert_eq!(bytes[8], 0x48);
    }

    #[test]
    fn extended_deltas_survive_decoding() {
        let msg = request();
        let decoded = Message::decode(msg.to_bytes(1024).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.uri_path(), "fw/box-v1.2.3");
        assert_eq!(decoded.options.get_uint(OptionNumber::TIME), Some(1_700_000_000));
        assert_eq!(decoded.block2(), Some(Ok(Block::new(3, false, 5).unwrap())));
        assert_eq!(&*decoded.etag().unwrap().unwrap(), &[0x55; 8]);
    }

    #[test]
    fn encode_respects_limit() {
        let msg = request();
        assert_eq!(msg.to_bytes(64), Err(Overflow { limit: 64 }));
    }

    #[test]
    fn malformed_datagrams() {
        let decode = |bytes: &'static [u8]| Message::decode(Bytes::from_static(bytes));
        assert_eq!(decode(&[0x40, 0x01]), Err(DecodeError::Truncated));
        assert_eq!(decode(&[0x80, 0x01, 0, 0]), Err(DecodeError::Version(2)));
        assert_eq!(decode(&[0x49, 0x01, 0, 0]), Err(DecodeError::TokenLength(9)));
        assert_eq!(
            decode(&[0x60, 0x00, 0, 1, 0xff, 1]),
            Err(DecodeError::EmptyWithContent)
        );
        assert_eq!(decode(&[0x60, 0x45, 0, 1, 0xff]), Err(DecodeError::EmptyPayload));
        assert_eq!(decode(&[0x60, 0x45, 0, 1, 0xf1, 0]), Err(DecodeError::ReservedNibble));
        assert_eq!(decode(&[0x60, 0x45, 0, 1, 0x03, 0]), Err(DecodeError::Truncated));
    }

    #[test]
    fn empty_ack() {
        let ack = Message::decode(Bytes::from_static(&[0x60, 0x00, 0xab, 0xcd])).unwrap();
        assert_eq!(ack, Message::empty_ack(0xabcd));
        assert!(ack.is_empty());
    }

    #[test]
    fn block_option_values() {
        assert_eq!(&Block::new(0, false, 6).unwrap().encode()[..], &[0x06]);
        assert_eq!(&Block::new(1, true, 6).unwrap().encode()[..], &[0x1e]);
        let block = Block::decode(&[0x01, 0x4d]).unwrap();
        assert_eq!(block, Block::new(20, true, 5).unwrap());
        assert_eq!(block.offset(), 20 * 512);
        assert_eq!(Block::decode(&[0x0f]), Err(BlockError::ReservedSize));
        assert_eq!(Block::decode(&[1, 2, 3, 4]), Err(BlockError::TooLong));
        assert_eq!(Block::at_offset(4096, 6).unwrap().num, 4);
    }

    #[test]
    fn code_display() {
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(format!("{:?}", Code::NOT_FOUND), "NOT_FOUND");
        assert_eq!(format!("{:?}", Code::new(2, 7)), "Code(2.07)");
        assert!(Code::CHANGED.is_success());
        assert!(!Code::EMPTY.is_request());
    }
}
