//! CoAP (draft-ietf-core-coap-09) message serialization
//!
//! This module builds the exact wire bytes for a CoAP message: a 4-byte
//! fixed header, a delta-coded, length-prefixed sequence of options, and an
//! unframed payload tail. It does not parse -- there is no inverse
//! operation here -- and it does not do any I/O.
//!
//! The two entry points are [`calc_size`], which tells the caller how big a
//! buffer to bring, and [`build`], which fills that buffer in.

use byteorder::{ByteOrder, NetworkEndian};
use cast::{u16, u8, usize};
use core::fmt;

/// Length of the fixed CoAP header, in bytes.
const HEADER_LEN: u16 = 4;

/// Option number of the synthetic Fencepost-1 option.
const FENCEPOST: u16 = 14;

/// Largest value length the length codec can express (`15 + 255`).
const MAX_OPTION_LEN: u16 = 270;

/// Largest value the 4-bit option-count header field may hold; `15` is
/// reserved, so the field stops one short of its bit capacity.
const MAX_OPTION_COUNT: u8 = 14;

/// CoAP message type -- the 2-bit `T` field of the header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    /// Confirmable message (CON)
    Confirmable,
    /// Non-confirmable message (NON)
    NonConfirmable,
    /// Acknowledgement message (ACK)
    Acknowledgement,
    /// Reset message (RST)
    Reset,
}

impl Type {
    fn bits(self) -> u8 {
        match self {
            Type::Confirmable => 0b00,
            Type::NonConfirmable => 0b01,
            Type::Acknowledgement => 0b10,
            Type::Reset => 0b11,
        }
    }
}

/// CoAP Code: the 8-bit `class.detail` field shared by requests and
/// responses.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Code(u8);

mod detail {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: u8 = 0;
    pub const SIZE: u8 = 5;
}

mod class {
    pub const MASK: u8 = (1 << SIZE) - 1;
    pub const OFFSET: u8 = 5;
    pub const SIZE: u8 = 3;
}

impl Code {
    /// The empty message code (0.00), used on Reset and empty ACKs.
    pub const EMPTY: Self = Code(0b000_00000);

    /// Returns this code as a raw byte.
    pub fn raw(&self) -> u8 {
        self.0
    }

    /// Returns the 3-bit class of this code.
    pub fn class(&self) -> u8 {
        get!(self.0, class)
    }

    /// Returns the 5-bit detail of this code.
    pub fn detail(&self) -> u8 {
        get!(self.0, detail)
    }

    /// Is this a request code? (class 0, nonzero detail)
    pub fn is_request(&self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    /// Is this a response code? (class 2..=5)
    pub fn is_response(&self) -> bool {
        matches!(self.class(), 2..=5)
    }

    fn from_parts(class: u8, detail: u8) -> Self {
        let mut code = 0;
        set!(code, class, class);
        set!(code, detail, detail);

        Code(code)
    }
}

impl fmt::Debug for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Code(0b{:03b}_{:05b})", self.class(), self.detail())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

code!(
    /// CoAP request method codes
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub enum Method {
        /// GET
        Get = (0, 1),
        /// POST
        Post = (0, 2),
        /// PUT
        Put = (0, 3),
        /// DELETE
        Delete = (0, 4),
    }
);

code!(
    /// CoAP response codes
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub enum Response {
        /// Created
        Created = (2, 1),
        /// Deleted
        Deleted = (2, 2),
        /// Valid
        Valid = (2, 3),
        /// Changed
        Changed = (2, 4),
        /// Content
        Content = (2, 5),
        /// Bad Request
        BadRequest = (4, 0),
        /// Unauthorized
        Unauthorized = (4, 1),
        /// Bad Option
        BadOption = (4, 2),
        /// Forbidden
        Forbidden = (4, 3),
        /// Not Found
        NotFound = (4, 4),
        /// Method Not Allowed
        MethodNotAllowed = (4, 5),
        /// Not Acceptable
        NotAcceptable = (4, 6),
        /// Precondition Failed
        PreconditionFailed = (4, 12),
        /// Request Entity Too Large
        RequestEntityTooLarge = (4, 13),
        /// Unsupported Content-Format
        UnsupportedContentFormat = (4, 15),
        /// Internal Server Error
        InternalServerError = (5, 0),
        /// Not Implemented
        NotImplemented = (5, 1),
        /// Bad Gateway
        BadGateway = (5, 2),
        /// Service Unavailable
        ServiceUnavailable = (5, 3),
        /// Gateway Timeout
        GatewayTimeout = (5, 4),
        /// Proxying Not Supported
        ProxyingNotSupported = (5, 5),
    }
);

full_range!(
    u16,
    /// A recognized draft-ietf-core-coap-09 option number.
    ///
    /// The catalog is the canonical ascending emission order: options are
    /// always written in this order, never the order they were set on the
    /// message.
    #[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq, Ord)]
    pub enum OptionNumber {
        /// Content-Type
        ContentType = 1,
        /// Max-Age
        MaxAge = 2,
        /// Proxy-Uri
        ProxyUri = 3,
        /// ETag
        ETag = 4,
        /// Uri-Host
        UriHost = 5,
        /// Location-Path
        LocationPath = 6,
        /// Uri-Port
        UriPort = 7,
        /// Location-Query
        LocationQuery = 8,
        /// Uri-Path
        UriPath = 9,
        /// Observe
        Observe = 10,
        /// Token
        Token = 11,
        /// Fencepost-1, synthetic, zero-length
        Fencepost = 14,
        /// Uri-Query
        UriQuery = 15,
        /// Block2
        Block2 = 17,
        /// Block1
        Block1 = 19,
    }
);

impl OptionNumber {
    /// The delimiter byte this option's value is split on, if it is a
    /// multi-segment option.
    pub fn delimiter(self) -> Option<u8> {
        match self {
            OptionNumber::UriPath | OptionNumber::LocationPath => Some(b'/'),
            OptionNumber::UriQuery => Some(b'&'),
            _ => None,
        }
    }

    /// Is this option split into one wire option per delimited segment?
    pub fn is_splittable(self) -> bool {
        self.delimiter().is_some()
    }
}

/// Errors that can occur while building a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The destination buffer or message was absent.
    ///
    /// Unreachable through this crate's safe API -- `&mut [u8]` and
    /// `&Message` can never be null -- kept for parity with the
    /// collaborator contract this crate's error kinds are modeled on.
    NullArgument,
    /// The header validator rejected the message (bad version).
    InvalidHeader,
    /// An option value exceeded the 270-byte length the codec can express.
    ValueTooLong,
    /// The option count would have overflowed the 4-bit header field.
    TooManyOptions,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NullArgument => "destination or message argument was null",
            Error::InvalidHeader => "message header failed validation",
            Error::ValueTooLong => "option value exceeds 270 bytes",
            Error::TooManyOptions => "option count exceeds the 4-bit header field",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// A no-op allocator marker.
///
/// The original collaborator contract lets the caller plug in `alloc`/`free`
/// function pointers at init time. This crate never allocates during
/// serialization -- the caller always supplies the exact-sized destination
/// buffer -- so there is nothing left for an allocator to do; this type
/// exists solely to give that contract a named place in [`Config`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Allocator;

/// Per-call configuration.
///
/// Replaces the original's compile-time `SN_COAP_BLOCKWISE_MAX_PAYLOAD_SIZE`
/// macro with a value threaded explicitly through [`calc_size`] and
/// [`build`], so blockwise behavior is configurable (and testable) per call
/// instead of fixed at build time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Config {
    /// When `Some(n)`, [`calc_size`] treats a payload longer than `n` bytes
    /// as needing blockwise fragmentation and returns a size estimate for
    /// one `n`-byte chunk plus its Block1/Block2 marker, instead of the
    /// full payload's size. Actual chunking -- splitting the payload,
    /// setting `options.block1`/`options.block2`, and calling [`build`]
    /// once per chunk -- happens upstream of this crate; `build` itself
    /// never reads this field.
    pub blockwise_max_payload_size: Option<u16>,
    /// The allocator collaborator. Unused by this no-alloc crate.
    pub allocator: Allocator,
}

/// A transmit descriptor: the destination address and the built packet
/// bytes.
///
/// Mirrors the original's "free the send-message tree" collaborator
/// contract, which must release resources in leaf-first order and tolerate
/// null sub-fields at every level. In safe Rust that contract is just
/// ownership: dropping the fields in leaf-first order, each independently
/// optional.
#[derive(Debug, Default)]
pub struct SendDescriptor<'a> {
    /// The destination address bytes, if any.
    pub dst_addr: Option<&'a [u8]>,
    /// The built packet bytes, if any.
    pub packet: Option<&'a [u8]>,
}

impl<'a> SendDescriptor<'a> {
    /// Releases the descriptor, leaf-first: address, then packet.
    ///
    /// Each field is independently optional; releasing one that was never
    /// set is a no-op, not an error.
    pub fn release(self) {
        // `self`'s fields drop in leaf-first declaration order on return.
    }
}

/// The options sub-aggregate of a [`Message`].
///
/// `content_type`, `uri_path` and `token` live directly on [`Message`]
/// instead, matching the data model's own split.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Options<'a> {
    /// Max-Age (0..4 B)
    pub max_age: Option<&'a [u8]>,
    /// Proxy-Uri (1..270 B)
    pub proxy_uri: Option<&'a [u8]>,
    /// ETag (1..8 B)
    pub etag: Option<&'a [u8]>,
    /// Uri-Host (1..270 B)
    pub uri_host: Option<&'a [u8]>,
    /// Location-Path (1..270 B, `/`-split)
    pub location_path: Option<&'a [u8]>,
    /// Uri-Port (0..2 B)
    pub uri_port: Option<&'a [u8]>,
    /// Location-Query (1..270 B)
    pub location_query: Option<&'a [u8]>,
    /// Observe (0..2 B)
    pub observe: Option<&'a [u8]>,
    /// Uri-Query (1..270 B, `&`-split)
    pub uri_query: Option<&'a [u8]>,
    /// Block1 (1..3 B)
    pub block1: Option<&'a [u8]>,
    /// Block2 (1..3 B)
    pub block2: Option<&'a [u8]>,
}

/// An in-memory, structured CoAP message, ready to be sized and built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message<'a> {
    /// Protocol version; must be `1`.
    pub version: u8,
    /// Message type.
    pub ty: Type,
    /// Request or response code.
    pub code: Code,
    /// 16-bit message identifier, written big-endian.
    pub message_id: u16,
    /// Token (1..8 B), opaque request/response correlator.
    pub token: Option<&'a [u8]>,
    /// Content-Type (1..2 B).
    pub content_type: Option<&'a [u8]>,
    /// Uri-Path (0 or more `/`-separated segments).
    pub uri_path: Option<&'a [u8]>,
    /// The remaining, less commonly used options.
    pub options: Option<Options<'a>>,
    /// Opaque payload, appended after the last option with no separator.
    pub payload: Option<&'a [u8]>,
}

/// Computes the exact number of bytes [`build`] will write for `message`.
///
/// Pure function: does not touch any buffer. Its contract is guaranteed
/// only for messages `build` would accept; for a message that would fail
/// with [`Error::ValueTooLong`] or [`Error::TooManyOptions`] the returned
/// size is a best-effort estimate, not a promise -- call `build` and
/// inspect its `Result` to find out whether the message is actually valid.
///
/// When `config.blockwise_max_payload_size` is set and `message.payload`
/// exceeds it, the returned size is an *estimate for one chunk*: room for
/// the fixed header, the real options, a Block1/Block2 marker, and up to
/// `config.blockwise_max_payload_size` bytes of payload. Actual chunking
/// happens upstream of this crate (see [`build`]'s doc comment) -- this
/// number exists so a caller preparing per-chunk buffers ahead of time
/// knows how big to make them, not because `build` will ever cap anything
/// itself.
pub fn calc_size(message: &Message<'_>, config: &Config) -> u16 {
    if message.ty == Type::Reset {
        return HEADER_LEN;
    }

    let mut state = State::new();
    let mut counter = Counter(0);
    let _ = walk_options(message, &mut state, &mut counter, u16::MAX);

    let payload_len = match message.payload {
        Some(payload) => payload.len(),
        None => return HEADER_LEN + counter.0,
    };

    match config.blockwise_max_payload_size {
        Some(cap) if payload_len > usize(cap) => {
            let reserved = blockwise_reserved_size(message, message.code).unwrap_or(0);
            HEADER_LEN + counter.0 + reserved + cap
        }
        _ => HEADER_LEN + counter.0 + u16(payload_len).unwrap_or(u16::MAX),
    }
}

/// Builds the wire bytes of `message` into `dst`, returning the number of
/// bytes written.
///
/// `dst` must be at least [`calc_size`] bytes long. This always writes the
/// whole of `message.payload`: actual blockwise chunking is the caller's
/// job (split the payload, set `options.block1`/`options.block2`
/// yourself, and call `build` once per chunk) -- this function never
/// truncates a payload or invents an option the caller didn't ask for.
/// `config` is accepted for symmetry with [`calc_size`] (and to carry the
/// allocator hook) but otherwise unused here, matching how the original
/// builder's payload-writing step has no blockwise awareness at all.
pub fn build(dst: &mut [u8], message: &Message<'_>, _config: &Config) -> Result<u16, Error> {
    check_header(message)?;

    let mut writer = Writer::new(dst);
    write_fixed_header(&mut writer, message, 0);

    if message.ty == Type::Reset {
        return Ok(HEADER_LEN);
    }

    let mut state = State::new();
    {
        let mut emitter = Emitter {
            writer: &mut writer,
        };
        walk_options(message, &mut state, &mut emitter, u16::MAX)?;

        if let Some(payload) = message.payload {
            emitter.writer.push_slice(payload);
        }
    }

    patch_option_count(&mut writer, state.option_count)?;

    Ok(u16(writer.cursor).unwrap_or(u16::MAX))
}

fn check_header(message: &Message<'_>) -> Result<(), Error> {
    if message.version != 1 {
        return Err(Error::InvalidHeader);
    }
    Ok(())
}

fn write_fixed_header(writer: &mut Writer<'_>, message: &Message<'_>, oc: u8) {
    let byte0 = (message.version << 6) | (message.ty.bits() << 4) | (oc & 0x0F);
    writer.push(byte0);
    writer.push(message.code.raw());

    let mut id_bytes = [0u8; 2];
    NetworkEndian::write_u16(&mut id_bytes, message.message_id);
    writer.push(id_bytes[0]);
    writer.push(id_bytes[1]);
}

fn patch_option_count(writer: &mut Writer<'_>, count: u8) -> Result<(), Error> {
    if count > MAX_OPTION_COUNT {
        return Err(Error::TooManyOptions);
    }
    writer.buf[0] = (writer.buf[0] & 0xF0) | (count & 0x0F);
    Ok(())
}

/// Running state threaded through option emission: the previous option
/// number (for delta computation) and the option count (for the header's
/// OC field and the `TooManyOptions` check).
struct State {
    previous: u16,
    option_count: u8,
}

impl State {
    fn new() -> Self {
        State {
            previous: 0,
            option_count: 0,
        }
    }

    fn bump(&mut self) -> Result<(), Error> {
        if self.option_count >= MAX_OPTION_COUNT {
            return Err(Error::TooManyOptions);
        }
        self.option_count += 1;
        Ok(())
    }
}

/// Receives each option's wire delta and value as it is decided, without
/// caring whether the caller wants to count bytes or actually write them.
///
/// `calc_size` and `build` share every byte of decision-making logic --
/// fencepost insertion, delta computation, segment splitting -- through
/// [`walk_options`]; only the sink differs. That is what keeps the two in
/// the byte-exact agreement the size-agreement property demands.
trait Sink {
    fn option(&mut self, delta: u16, value: &[u8]);
}

struct Counter(u16);

impl Sink for Counter {
    fn option(&mut self, _delta: u16, value: &[u8]) {
        let len = u16(value.len()).unwrap_or(u16::MAX);
        self.0 += if len < 15 { 1 } else { 2 };
        self.0 += len;
    }
}

/// Discards every option it's handed. Used to replay the catalog walk far
/// enough to learn the `previous`/`option_count` state at a given catalog
/// position without re-counting bytes the real walk already accounted for.
struct NullSink;

impl Sink for NullSink {
    fn option(&mut self, _delta: u16, _value: &[u8]) {}
}

struct Emitter<'a, 'b> {
    writer: &'b mut Writer<'a>,
}

impl Sink for Emitter<'_, '_> {
    fn option(&mut self, delta: u16, value: &[u8]) {
        self.writer.put_option(delta, value);
    }
}

/// A cursor into the destination buffer.
struct Writer<'a> {
    buf: &'a mut [u8],
    cursor: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Writer { buf, cursor: 0 }
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.cursor] = byte;
        self.cursor += 1;
    }

    fn push_slice(&mut self, bytes: &[u8]) {
        let end = self.cursor + bytes.len();
        self.buf[self.cursor..end].copy_from_slice(bytes);
        self.cursor = end;
    }

    fn put_option(&mut self, delta: u16, value: &[u8]) {
        let len = u16(value.len()).unwrap_or(u16::MAX);
        let len_nibble = if len < 15 { u8(len).unwrap() } else { 15 };
        let delta_nibble = u8(delta).unwrap();

        self.push((delta_nibble << 4) | len_nibble);
        if len >= 15 {
            self.push(u8(len - 15).unwrap());
        }
        self.push_slice(value);
    }
}

/// Emits one option, inserting a Fencepost-1 first if the delta from
/// `state.previous` would otherwise exceed 15.
fn emit_option<S: Sink>(
    state: &mut State,
    sink: &mut S,
    number: u16,
    value: &[u8],
) -> Result<(), Error> {
    if value.len() > usize(MAX_OPTION_LEN) {
        return Err(Error::ValueTooLong);
    }

    if number - state.previous > 15 {
        let delta = FENCEPOST - state.previous;
        sink.option(delta, &[]);
        state.bump()?;
        state.previous = FENCEPOST;
    }

    let delta = number - state.previous;
    sink.option(delta, value);
    state.bump()?;
    state.previous = number;

    Ok(())
}

/// Emits one option per delimited segment of `value`, each sharing
/// `number`; the second and later segments carry delta `0`, correctly
/// encoding a repeated option.
fn emit_segments<S: Sink>(
    state: &mut State,
    sink: &mut S,
    number: u16,
    value: Option<&[u8]>,
    delimiter: u8,
) -> Result<(), Error> {
    let value = match value {
        Some(value) => value,
        None => return Ok(()),
    };

    for (offset, len) in Segments::new(value, delimiter) {
        let start = usize(offset);
        let end = start + usize(len);
        emit_option(state, sink, number, &value[start..end])?;
    }

    Ok(())
}

/// Walks the option catalog in canonical ascending order, emitting every
/// option present on `message` whose number is strictly less than
/// `stop_before`. Pass `u16::MAX` for a full walk.
///
/// The `stop_before` cutoff exists so [`blockwise_reserved_size`] can replay
/// a *prefix* of this same walk, from a fresh `State`, to learn the
/// `previous`/`option_count` a synthetic Block1/Block2 option would see at
/// its real catalog position -- without disturbing (or depending on) the
/// state left behind by the real, full walk `calc_size`/`build` already
/// did.
fn walk_options<S: Sink>(
    message: &Message<'_>,
    state: &mut State,
    sink: &mut S,
    stop_before: u16,
) -> Result<(), Error> {
    let options = message.options.unwrap_or_default();

    if u16::from(OptionNumber::ContentType) < stop_before {
        if let Some(value) = message.content_type {
            emit_option(state, sink, u16::from(OptionNumber::ContentType), value)?;
        }
    }
    if u16::from(OptionNumber::MaxAge) < stop_before {
        if let Some(value) = options.max_age {
            emit_option(state, sink, u16::from(OptionNumber::MaxAge), value)?;
        }
    }
    if u16::from(OptionNumber::ProxyUri) < stop_before {
        if let Some(value) = options.proxy_uri {
            emit_option(state, sink, u16::from(OptionNumber::ProxyUri), value)?;
        }
    }
    if u16::from(OptionNumber::ETag) < stop_before {
        if let Some(value) = options.etag {
            emit_option(state, sink, u16::from(OptionNumber::ETag), value)?;
        }
    }
    if u16::from(OptionNumber::UriHost) < stop_before {
        if let Some(value) = options.uri_host {
            emit_option(state, sink, u16::from(OptionNumber::UriHost), value)?;
        }
    }
    if u16::from(OptionNumber::LocationPath) < stop_before {
        emit_segments(
            state,
            sink,
            u16::from(OptionNumber::LocationPath),
            options.location_path,
            b'/',
        )?;
    }
    if u16::from(OptionNumber::UriPort) < stop_before {
        if let Some(value) = options.uri_port {
            emit_option(state, sink, u16::from(OptionNumber::UriPort), value)?;
        }
    }
    if u16::from(OptionNumber::LocationQuery) < stop_before {
        if let Some(value) = options.location_query {
            emit_option(state, sink, u16::from(OptionNumber::LocationQuery), value)?;
        }
    }
    if u16::from(OptionNumber::UriPath) < stop_before {
        emit_segments(
            state,
            sink,
            u16::from(OptionNumber::UriPath),
            message.uri_path,
            b'/',
        )?;
    }
    if u16::from(OptionNumber::Observe) < stop_before {
        if let Some(value) = options.observe {
            emit_option(state, sink, u16::from(OptionNumber::Observe), value)?;
        }
    }
    if u16::from(OptionNumber::Token) < stop_before {
        if let Some(value) = message.token {
            emit_option(state, sink, u16::from(OptionNumber::Token), value)?;
        }
    }
    if u16::from(OptionNumber::UriQuery) < stop_before {
        emit_segments(
            state,
            sink,
            u16::from(OptionNumber::UriQuery),
            options.uri_query,
            b'&',
        )?;
    }
    if u16::from(OptionNumber::Block2) < stop_before {
        if let Some(value) = options.block2 {
            emit_option(state, sink, u16::from(OptionNumber::Block2), value)?;
        }
    }
    if u16::from(OptionNumber::Block1) < stop_before {
        if let Some(value) = options.block1 {
            emit_option(state, sink, u16::from(OptionNumber::Block1), value)?;
        }
    }

    Ok(())
}

/// Estimates the extra bytes a synthetic Block1 (for requests) or Block2
/// (for responses) marker option would add to the wire size, for
/// [`calc_size`]'s blockwise estimate. This is a pure size oracle -- it is
/// never called from [`build`], which never emits an option the caller
/// didn't put in `message` (see `build`'s doc comment).
///
/// Runs its own independent walk from a fresh [`State`], stopping just
/// before the target option's catalog slot, instead of reusing the state
/// left behind by the real walk `calc_size` already performed over the
/// caller's actual options. Reusing that post-walk state would be wrong
/// whenever the caller's real options run past the target's catalog
/// position -- e.g. an explicit `options.block1` on a response message
/// leaves `previous == 19`, but the synthetic option being estimated here is
/// Block2 (`17`), which sits *earlier* in catalog order; computing its delta
/// against `19` would underflow. Replaying the catalog from scratch up to
/// the target's own position sidesteps that entirely.
fn blockwise_reserved_size(message: &Message<'_>, code: Code) -> Option<u16> {
    let number = if code.is_request() {
        u16::from(OptionNumber::Block1)
    } else {
        u16::from(OptionNumber::Block2)
    };

    let mut state = State::new();
    let mut discard = NullSink;
    walk_options(message, &mut state, &mut discard, number).ok()?;

    let mut counter = Counter(0);
    emit_option(&mut state, &mut counter, number, &[0u8]).ok()?;

    Some(counter.0)
}

/// Iterates the segments of a `/`- or `&`-delimited option value.
///
/// One leading delimiter byte and one trailing delimiter byte are trimmed
/// before splitting (so `"/a"` has one segment, `"a/"` has one segment, and
/// `"a/b"` has two); everything else between is split plainly, so an
/// interior run of delimiters does produce empty segments. See
/// `DESIGN.md` for why this shape was chosen over literally porting the
/// original's NUL-terminated-string scan.
struct Segments<'a> {
    remainder: &'a [u8],
    cursor: u16,
    delimiter: u8,
    done: bool,
}

impl<'a> Segments<'a> {
    fn new(buf: &'a [u8], delimiter: u8) -> Self {
        let mut start = 0usize;
        let mut end = buf.len();

        if !buf.is_empty() && buf[0] == delimiter {
            start = 1;
        }
        if end > start && buf[end - 1] == delimiter {
            end -= 1;
        }

        Segments {
            remainder: &buf[start..end],
            cursor: u16(start).unwrap_or(u16::MAX),
            delimiter,
            done: start >= end,
        }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = (u16, u16);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let offset = self.cursor;
        match self.remainder.iter().position(|&b| b == self.delimiter) {
            Some(pos) => {
                let len = u16(pos).unwrap_or(u16::MAX);
                self.remainder = &self.remainder[pos + 1..];
                self.cursor += len + 1;
                Some((offset, len))
            }
            None => {
                let len = u16(self.remainder.len()).unwrap_or(u16::MAX);
                self.remainder = &[];
                self.done = true;
                Some((offset, len))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg<'a>(ty: Type, code: Code, message_id: u16) -> Message<'a> {
        Message {
            version: 1,
            ty,
            code,
            message_id,
            token: None,
            content_type: None,
            uri_path: None,
            options: None,
            payload: None,
        }
    }

    #[test]
    fn s1_minimal_get() {
        let mut message = msg(Type::Confirmable, Code::from(Method::Get), 0x1234);
        message.uri_path = Some(b"temp");

        let config = Config::default();
        let len = calc_size(&message, &config);
        let mut buf = [0u8; 32];
        let written = build(&mut buf, &message, &config).unwrap();

        assert_eq!(written, len);
        assert_eq!(written, 9);
        // header byte 0 carries OC=1 in its low nibble per the header-count
        // invariant: 0x41, not the 0x40 the walkthrough's prose-vs-hex
        // mismatch would suggest (see DESIGN.md).
        assert_eq!(
            &buf[..9],
            &[0x41, 0x01, 0x12, 0x34, 0x94, b't', b'e', b'm', b'p']
        );
    }

    #[test]
    fn s2_two_segment_path() {
        let mut message = msg(Type::Confirmable, Code::from(Method::Get), 0x0001);
        message.uri_path = Some(b"a/b");

        let config = Config::default();
        let len = calc_size(&message, &config);
        let mut buf = [0u8; 32];
        let written = build(&mut buf, &message, &config).unwrap();

        assert_eq!(written, len);
        assert_eq!(written, 8);
        // OC=2 in the low nibble: 0x42.
        assert_eq!(
            &buf[..8],
            &[0x42, 0x01, 0x00, 0x01, 0x91, b'a', 0x01, b'b']
        );
    }

    #[test]
    fn s3_fencepost_not_needed_for_uri_query_alone() {
        let mut message = msg(Type::NonConfirmable, Code::from(Method::Get), 0x0002);
        message.options = Some(Options {
            uri_query: Some(b"x"),
            ..Options::default()
        });

        let config = Config::default();
        let len = calc_size(&message, &config);
        let mut buf = [0u8; 32];
        let written = build(&mut buf, &message, &config).unwrap();

        assert_eq!(written, len);
        assert_eq!(written, 6);
        // OC=1 in the low nibble: 0x51.
        assert_eq!(&buf[..6], &[0x51, 0x01, 0x00, 0x02, 0xF1, b'x']);
    }

    #[test]
    fn s4_still_no_fencepost_with_content_type() {
        let mut message = msg(Type::NonConfirmable, Code::from(Method::Get), 0x0002);
        message.content_type = Some(&[0x00]);
        message.options = Some(Options {
            uri_query: Some(b"x"),
            ..Options::default()
        });

        let config = Config::default();
        let len = calc_size(&message, &config);
        let mut buf = [0u8; 32];
        let written = build(&mut buf, &message, &config).unwrap();

        assert_eq!(written, len);
        assert_eq!(written, 8);
    }

    #[test]
    fn s5_length_extension() {
        let value = [b'a'; 20];
        let mut message = msg(Type::Confirmable, Code::from(Method::Put), 0x0003);
        message.options = Some(Options {
            uri_host: Some(&value),
            ..Options::default()
        });

        let config = Config::default();
        let len = calc_size(&message, &config);
        let mut buf = [0u8; 32];
        let written = build(&mut buf, &message, &config).unwrap();

        assert_eq!(written, len);
        assert_eq!(written, 26);
        assert_eq!(buf[4], 0x5F);
        assert_eq!(buf[5], 0x05);
        assert_eq!(&buf[6..26], &value[..]);
    }

    #[test]
    fn s6_reset_ignores_everything() {
        let mut message = msg(Type::Reset, Code::EMPTY, 0x00FF);
        message.uri_path = Some(b"ignored");
        message.payload = Some(&[0xDE, 0xAD]);

        let config = Config::default();
        let len = calc_size(&message, &config);
        let mut buf = [0u8; 32];
        let written = build(&mut buf, &message, &config).unwrap();

        assert_eq!(written, len);
        assert_eq!(written, 4);
        assert_eq!(&buf[..4], &[0x70, 0x00, 0x00, 0xFF]);
    }

    #[test]
    fn negative_value_too_long() {
        let value = [b'a'; 271];
        let mut message = msg(Type::Confirmable, Code::from(Method::Get), 1);
        message.options = Some(Options {
            uri_host: Some(&value),
            ..Options::default()
        });

        let mut buf = [0u8; 512];
        let err = build(&mut buf, &message, &Config::default()).unwrap_err();
        assert_eq!(err, Error::ValueTooLong);
    }

    #[test]
    fn negative_too_many_options() {
        // 15 single-segment Uri-Path segments -> 15 options, one over the cap.
        let mut message = msg(Type::Confirmable, Code::from(Method::Get), 1);
        message.uri_path = Some(b"a/b/c/d/e/f/g/h/i/j/k/l/m/n/o");

        let mut buf = [0u8; 512];
        let err = build(&mut buf, &message, &Config::default()).unwrap_err();
        assert_eq!(err, Error::TooManyOptions);
    }

    #[test]
    fn invalid_header_rejects_bad_version() {
        let mut message = msg(Type::Confirmable, Code::from(Method::Get), 1);
        message.version = 2;

        let mut buf = [0u8; 32];
        let err = build(&mut buf, &message, &Config::default()).unwrap_err();
        assert_eq!(err, Error::InvalidHeader);
    }

    #[test]
    fn calc_size_estimates_one_capped_chunk_without_build_truncating() {
        let payload = [0xAAu8; 40];
        let mut message = msg(Type::Confirmable, Code::from(Method::Post), 7);
        message.payload = Some(&payload);

        let config = Config {
            blockwise_max_payload_size: Some(16),
            ..Config::default()
        };

        // calc_size reports room for one capped chunk (plus its Block1
        // marker), not the full 40-byte payload -- a size estimate for
        // pre-chunking buffer allocation; chunking itself happens upstream.
        let estimate = calc_size(&message, &config);
        assert!(estimate < HEADER_LEN + u16(payload.len()).unwrap());

        // build() never truncates or invents options: handed the full,
        // un-chunked payload, it writes every byte of it.
        let mut buf = [0u8; 64];
        let written = build(&mut buf, &message, &config).unwrap();
        assert_eq!(written as usize, HEADER_LEN as usize + payload.len());
        assert_eq!(
            &buf[(written as usize - payload.len())..written as usize],
            &payload[..]
        );
    }

    #[test]
    fn blockwise_estimate_handles_response_with_explicit_block1() {
        // Regression: a response message with an explicit (non-canonical)
        // options.block1 advances the real walk's `previous` to 19, past
        // Block2 (17) -- the option calc_size's blockwise estimate targets
        // for a response. The estimate must not underflow against that.
        let payload = [0xAAu8; 40];
        let mut message = msg(Type::Confirmable, Code::from(Response::Content), 7);
        message.payload = Some(&payload);
        message.options = Some(Options {
            block1: Some(&[0x12]),
            ..Options::default()
        });

        let config = Config {
            blockwise_max_payload_size: Some(16),
            ..Config::default()
        };

        let estimate = calc_size(&message, &config);
        assert!(estimate > 0);

        let mut buf = [0u8; 64];
        let written = build(&mut buf, &message, &config).unwrap();
        // Block1 (19) is the only option and its delta from 0 exceeds 15,
        // so a fencepost (1 byte) precedes it: fencepost + option-header +
        // 1-byte value = 3 bytes, plus the full un-chunked payload.
        assert_eq!(written as usize, HEADER_LEN as usize + 3 + payload.len());
    }

    #[test]
    fn segment_scanner_edge_cases() {
        assert_eq!(
            Segments::new(b"a/b", b'/').collect::<std::vec::Vec<_>>(),
            [(0, 1), (2, 1)]
        );
        assert_eq!(
            Segments::new(b"/a", b'/').collect::<std::vec::Vec<_>>(),
            [(1, 1)]
        );
        assert_eq!(
            Segments::new(b"a/", b'/').collect::<std::vec::Vec<_>>(),
            [(0, 1)]
        );
        assert_eq!(
            Segments::new(b"/", b'/').collect::<std::vec::Vec<_>>(),
            std::vec::Vec::<(u16, u16)>::new()
        );
        assert_eq!(
            Segments::new(b"", b'/').collect::<std::vec::Vec<_>>(),
            std::vec::Vec::<(u16, u16)>::new()
        );
    }

    proptest::proptest! {
        #[test]
        fn size_agreement(
            uri_path in "[a-z]{0,3}(/[a-z]{0,3}){0,3}",
            has_content_type in proptest::bool::ANY,
            message_id in 0u16..=0xFFFF,
        ) {
            let content_type_buf = [0u8];
            let mut message = msg(Type::Confirmable, Code::from(Method::Get), message_id);
            if !uri_path.is_empty() {
                message.uri_path = Some(uri_path.as_bytes());
            }
            if has_content_type {
                message.content_type = Some(&content_type_buf);
            }

            let config = Config::default();
            let size = calc_size(&message, &config);
            let mut buf = [0u8; 512];
            let written = build(&mut buf[..usize::from(size).max(4)], &message, &config).unwrap();

            proptest::prop_assert_eq!(written, size);
        }

        #[test]
        fn monotone_and_bounded_deltas(
            segments in proptest::collection::vec("[a-z]{1,4}", 0..6),
        ) {
            let joined = segments.join("/");
            let mut message = msg(Type::Confirmable, Code::from(Method::Get), 0);
            if !joined.is_empty() {
                message.uri_path = Some(joined.as_bytes());
            }

            let config = Config::default();
            let size = calc_size(&message, &config);
            let mut buf = [0u8; 512];
            build(&mut buf[..usize::from(size).max(4)], &message, &config).unwrap();

            let mut previous = 0u16;
            let mut cursor = 4usize;
            while cursor < usize::from(size) {
                let byte = buf[cursor];
                let delta = u16::from(byte >> 4);
                proptest::prop_assert!(delta <= 15);
                let number = previous + delta;
                proptest::prop_assert!(number >= previous);
                previous = number;

                let mut len = u16::from(byte & 0x0F);
                cursor += 1;
                if len == 15 {
                    len = u16::from(buf[cursor]) + 15;
                    cursor += 1;
                }
                cursor += usize::from(len);
            }
        }

        #[test]
        fn reset_is_always_four_bytes(message_id in 0u16..=0xFFFF) {
            let mut message = msg(Type::Reset, Code::EMPTY, message_id);
            message.uri_path = Some(b"ignored");
            message.payload = Some(&[1, 2, 3]);

            let config = Config::default();
            let size = calc_size(&message, &config);
            proptest::prop_assert_eq!(size, 4);

            let mut buf = [0u8; 32];
            let written = build(&mut buf, &message, &config).unwrap();
            proptest::prop_assert_eq!(written, 4);
        }
    }
}
