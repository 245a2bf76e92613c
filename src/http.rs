//! HTTP/1.x analyzer: a resumable per-direction parser for request and
//! response messages, plus transaction correlation and event shaping.

use crate::config::{Config, HttpConfig};
use crate::engine::Ctx;
use crate::error::{Error, Progress, Result};
use crate::event::Event;
use crate::net::{endpoints, Direction, Endpoint, FourTuple, Protocol};
use crate::stream::StreamBuffer;
use crate::table::Table;
use crate::timer::{TimerId, TimerService};
use crate::transactions::TransactionMap;
use crate::util::{is_blank, lossy, parse_hex_length, read_crlf_line, trimmed};
use bstr::ByteSlice;
use log::{debug, warn};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Start,
    Headers,
    Body,
    ChunkedStart,
    ChunkedData,
    ChunkedTrailer,
}

/// One parsed request or response.
#[derive(Debug)]
pub struct HttpMessage {
    pub ts: OffsetDateTime,
    pub is_request: bool,
    pub method: String,
    pub request_uri: String,
    pub status_code: u16,
    pub status_phrase: String,
    pub version: (u8, u8),
    /// Headers captured for emission, per the header capture policy.
    pub headers: Table<String>,
    /// Headers the parser always needs, whatever the capture policy.
    pub content_length: usize,
    pub has_content_length: bool,
    pub connection: String,
    pub transfer_encoding: String,
    pub content_type: Option<String>,
    pub real_ip: String,
    /// Concatenated chunk data; replaces the on-wire body in the raw.
    pub chunked_body: Vec<u8>,
    chunked_length: usize,
    /// Byte range of the message within the stream buffer.
    pub start: usize,
    pub end: usize,
    /// Absolute offset of the first body byte (end of headers).
    pub body_offset: usize,
}

impl HttpMessage {
    fn new(ts: OffsetDateTime) -> Self {
        Self {
            ts,
            is_request: false,
            method: String::new(),
            request_uri: String::new(),
            status_code: 0,
            status_phrase: String::new(),
            version: (0, 0),
            headers: Table::new(),
            content_length: 0,
            has_content_length: false,
            connection: String::new(),
            transfer_encoding: String::new(),
            content_type: None,
            real_ip: String::new(),
            chunked_body: Vec::new(),
            chunked_length: 0,
            start: 0,
            end: 0,
            body_offset: 0,
        }
    }
}

/// Per-direction HTTP stream state.
#[derive(Debug)]
pub struct HttpStream {
    pub buf: StreamBuffer,
    state: ParseState,
    message: Option<HttpMessage>,
}

impl HttpStream {
    pub fn new() -> Self {
        Self {
            buf: StreamBuffer::new(),
            state: ParseState::Start,
            message: None,
        }
    }

    /// Feed the parser from the buffered bytes.
    ///
    /// Returns the next completed message and its raw bytes, or `None`
    /// when more data is needed. The buffer is compacted past a completed
    /// message before returning.
    pub fn parse(
        &mut self,
        ts: OffsetDateTime,
        config: &HttpConfig,
    ) -> Result<Option<(HttpMessage, Vec<u8>)>> {
        let mut msg = match self.message.take() {
            Some(msg) => msg,
            None => HttpMessage::new(ts),
        };
        match parse_message(&mut self.buf, &mut self.state, &mut msg, config)? {
            Progress::Complete => {
                let raw = self.buf.data()[msg.start..msg.end].to_vec();
                self.buf.compact(msg.end);
                self.state = ParseState::Start;
                Ok(Some((msg, raw)))
            }
            Progress::More => {
                self.message = Some(msg);
                Ok(None)
            }
        }
    }

    /// Complete a close-delimited message when the direction ends.
    ///
    /// Needed for HTTP/1.0-without-Content-Length responses, whose body
    /// runs to FIN. Nothing is flushed if no first line was parsed.
    pub fn flush_on_fin(&mut self) -> Option<(HttpMessage, Vec<u8>)> {
        let mut msg = self.message.take()?;
        if self.state == ParseState::Start || self.buf.len() <= msg.start {
            return None;
        }
        msg.end = self.buf.len();
        let raw = self.buf.data()[msg.start..].to_vec();
        self.buf.compact(msg.end);
        self.state = ParseState::Start;
        Some((msg, raw))
    }
}

fn parse_message(
    buf: &mut StreamBuffer,
    state: &mut ParseState,
    msg: &mut HttpMessage,
    config: &HttpConfig,
) -> Result<Progress> {
    while buf.parse_offset() < buf.len() {
        match *state {
            ParseState::Start => {
                buf.mark_message_start();
                msg.start = buf.parse_offset();
                let (line, consumed) = match read_crlf_line(buf.unparsed()) {
                    Some(found) => found,
                    None => return Ok(Progress::More),
                };
                parse_first_line(line, msg)?;
                buf.advance(consumed);
                *state = ParseState::Headers;
            }
            ParseState::Headers => {
                let input = buf.unparsed();
                if input.starts_with(b"\r\n") {
                    buf.advance(2);
                    msg.body_offset = buf.parse_offset();
                    if !msg.is_request && has_no_body_status(msg.status_code) {
                        msg.end = buf.parse_offset();
                        return Ok(Progress::Complete);
                    }
                    if msg.transfer_encoding.eq_ignore_ascii_case("chunked") {
                        // Transfer-Encoding overrides Content-Length.
                        *state = ParseState::ChunkedStart;
                        continue;
                    }
                    if msg.content_length == 0 && (msg.is_request || msg.has_content_length) {
                        msg.end = buf.parse_offset();
                        return Ok(Progress::Complete);
                    }
                    *state = ParseState::Body;
                } else {
                    match parse_header_field(input, msg, config)? {
                        Some(consumed) => buf.advance(consumed),
                        None => return Ok(Progress::More),
                    }
                }
            }
            ParseState::Body => {
                let avail = buf.remaining();
                if !msg.has_content_length && is_close_delimited(msg) {
                    // Body runs to FIN; completion happens in flush_on_fin.
                    msg.content_length += avail;
                    buf.add_body_received(avail);
                    buf.advance_to_end();
                    return Ok(Progress::More);
                }
                let left = msg.content_length.saturating_sub(buf.body_received());
                if avail >= left {
                    buf.advance(left);
                    msg.end = buf.parse_offset();
                    return Ok(Progress::Complete);
                }
                buf.add_body_received(avail);
                buf.advance_to_end();
                return Ok(Progress::More);
            }
            ParseState::ChunkedStart => {
                let (line, consumed) = match read_crlf_line(buf.unparsed()) {
                    Some(found) => found,
                    None => return Ok(Progress::More),
                };
                let chunk_len = parse_hex_length(line)
                    .ok_or_else(|| Error::malformed("http", "invalid chunk length"))?;
                buf.advance(consumed);
                if chunk_len == 0 {
                    *state = ParseState::ChunkedTrailer;
                } else {
                    msg.chunked_length = chunk_len;
                    buf.reset_body_received();
                    *state = ParseState::ChunkedData;
                }
            }
            ParseState::ChunkedData => {
                let avail = buf.remaining();
                let left = msg.chunked_length - buf.body_received();
                if avail >= left + 2 {
                    let offset = buf.parse_offset();
                    msg.chunked_body
                        .extend_from_slice(&buf.data()[offset..offset + left]);
                    buf.advance(left + 2);
                    msg.content_length += msg.chunked_length;
                    *state = ParseState::ChunkedStart;
                } else if avail >= left {
                    // Hold until the chunk's trailing CRLF is buffered.
                    return Ok(Progress::More);
                } else {
                    let offset = buf.parse_offset();
                    msg.chunked_body.extend_from_slice(&buf.data()[offset..]);
                    buf.add_body_received(avail);
                    buf.advance_to_end();
                    return Ok(Progress::More);
                }
            }
            ParseState::ChunkedTrailer => {
                let (line, consumed) = match read_crlf_line(buf.unparsed()) {
                    Some(found) => found,
                    None => return Ok(Progress::More),
                };
                let is_end = line.is_empty();
                if !is_end {
                    // Trailer header, skipped.
                    debug!("skipping chunked trailer: {:?}", line.as_bstr());
                }
                buf.advance(consumed);
                if is_end {
                    msg.end = buf.parse_offset();
                    return Ok(Progress::Complete);
                }
            }
        }
    }
    Ok(Progress::More)
}

fn has_no_body_status(code: u16) -> bool {
    (100..200).contains(&code) || code == 204 || code == 304
}

fn is_close_delimited(msg: &HttpMessage) -> bool {
    msg.connection.eq_ignore_ascii_case("close")
        || (msg.version == (1, 0) && !msg.connection.eq_ignore_ascii_case("keep-alive"))
}

fn parse_first_line(line: &[u8], msg: &mut HttpMessage) -> Result<()> {
    if line.len() < 8 {
        return Err(Error::malformed("http", "first line too short"));
    }
    if line.starts_with(b"HTTP/") {
        msg.is_request = false;
        msg.version = parse_version(&line[5..]);
        let after_version = match line.iter().position(|&c| c == b' ') {
            Some(p) => &line[p + 1..],
            None => return Err(Error::malformed("http", "response line without status")),
        };
        let code_end = after_version
            .iter()
            .position(|&c| c == b' ')
            .unwrap_or(after_version.len());
        msg.status_code = std::str::from_utf8(&after_version[..code_end])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::malformed("http", "unparseable status code"))?;
        msg.status_phrase = lossy(trimmed(&after_version[code_end..]));
    } else {
        let fields: Vec<&[u8]> = line.fields().collect();
        if fields.len() != 3 {
            return Err(Error::malformed("http", "request line is not three tokens"));
        }
        if !fields[2].starts_with(b"HTTP/") {
            return Err(Error::malformed("http", "request line without HTTP version"));
        }
        msg.is_request = true;
        msg.method = lossy(fields[0]);
        msg.request_uri = lossy(fields[1]);
        msg.version = parse_version(&fields[2][5..]);
    }
    Ok(())
}

/// One digit each side of a dot; anything else falls back to 1.0.
fn parse_version(bytes: &[u8]) -> (u8, u8) {
    if bytes.len() >= 3 && bytes[0].is_ascii_digit() && bytes[1] == b'.' && bytes[2].is_ascii_digit()
    {
        (bytes[0] - b'0', bytes[2] - b'0')
    } else {
        (1, 0)
    }
}

/// Parse one header field starting at `input`, including any folded
/// continuation lines.
///
/// Returns the bytes consumed, or `None` when the field is not fully
/// buffered yet (the terminating line cannot be distinguished from a
/// folded continuation until the byte after its CRLF is visible).
fn parse_header_field(
    input: &[u8],
    msg: &mut HttpMessage,
    config: &HttpConfig,
) -> Result<Option<usize>> {
    let eol = memchr::memmem::find(input, b"\r\n");
    let colon = match memchr::memchr(b':', input) {
        Some(colon) => colon,
        None => {
            return match eol {
                Some(_) => Err(Error::malformed("http", "header line without a colon")),
                None => Ok(None),
            }
        }
    };
    if let Some(eol) = eol {
        if eol < colon {
            return Err(Error::malformed("http", "header line without a colon"));
        }
    }

    let mut search_from = colon + 1;
    let value_end = loop {
        let crlf = match memchr::memmem::find(&input[search_from..], b"\r\n") {
            Some(rel) => search_from + rel,
            None => return Ok(None),
        };
        match input.get(crlf + 2) {
            // Cannot tell a terminator from a folded line yet.
            None => return Ok(None),
            Some(&c) if is_blank(c) => search_from = crlf + 2,
            Some(_) => break crlf,
        }
    };

    let name = lossy(&input[..colon]).to_ascii_lowercase();
    let value = join_folded(&input[colon + 1..value_end]);
    capture_header(msg, config, name, value);
    Ok(Some(value_end + 2))
}

/// Concatenate folded continuation lines into one trimmed value.
fn join_folded(span: &[u8]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for segment in span.split_str(b"\r\n") {
        let segment = trimmed(segment);
        if !segment.is_empty() {
            parts.push(lossy(segment));
        }
    }
    parts.join(" ")
}

fn capture_header(msg: &mut HttpMessage, config: &HttpConfig, name: String, value: String) {
    // Headers the parser itself depends on are captured whatever the
    // emission policy says.
    match name.as_str() {
        "content-length" => {
            msg.content_length = value.parse().unwrap_or(0);
            msg.has_content_length = true;
        }
        "transfer-encoding" => msg.transfer_encoding = value.clone(),
        "connection" => msg.connection = value.clone(),
        "content-type" => msg.content_type = Some(value.clone()),
        _ => {}
    }
    if !config.real_ip_header.is_empty() && name == config.real_ip_header {
        msg.real_ip = value.clone();
    }

    if !config.captures_headers() || !config.header_wanted(&name) {
        return;
    }
    if let Some((_, existing)) = msg.headers.get_nocase_mut(&name) {
        existing.push_str(", ");
        existing.push_str(&value);
    } else {
        msg.headers.add(name, value);
    }
}

/// Overwrite configured form-field values with `*` in a urlencoded
/// request body. Only spans shorter than 120 bytes are redacted.
fn censor_passwords(msg: &HttpMessage, raw: &mut [u8], keywords: &[String]) {
    if keywords.is_empty() || !msg.is_request || msg.content_length == 0 {
        return;
    }
    let urlencoded = msg
        .content_type
        .as_deref()
        .map(|ct| ct.contains("urlencoded"))
        .unwrap_or(false);
    if !urlencoded {
        return;
    }
    let body_start = msg.body_offset.saturating_sub(msg.start).min(raw.len());
    let body = &mut raw[body_start..];
    for keyword in keywords {
        if let Some(found) = memchr::memmem::find(body, keyword.as_bytes()) {
            let value_start = found + keyword.len();
            let value_end = body[value_start..]
                .iter()
                .position(|&c| matches!(c, b'&' | b' ' | b'\t' | b'\r' | b'\n'))
                .map(|p| value_start + p)
                .unwrap_or_else(|| body.len());
            if value_end - value_start < 120 {
                for byte in &mut body[value_start..value_end] {
                    *byte = b'*';
                }
            }
        }
    }
}

/// Request-side fields held until the response arrives.
#[derive(Debug)]
struct HttpPending {
    method: String,
    path: String,
    real_ip: Option<String>,
    request_raw: Option<String>,
    http: Map<String, Value>,
    src: Endpoint,
    dst: Endpoint,
}

pub struct HttpAnalyzer {
    config: HttpConfig,
    hide_keywords: Vec<String>,
    transactions: TransactionMap<HttpPending>,
}

impl HttpAnalyzer {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.protocols.http.clone(),
            hide_keywords: config.passwords.hide_keywords.clone(),
            transactions: TransactionMap::new(Protocol::Http, config.transaction_timeout()),
        }
    }

    /// Number of requests still waiting for their response.
    pub fn pending_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub(crate) fn expire(&mut self, tuple: &FourTuple, timer: TimerId) -> bool {
        self.transactions.expire(tuple, timer)
    }

    pub(crate) fn clear(&mut self, timers: &mut TimerService) {
        self.transactions.clear(timers);
    }

    pub fn on_data(
        &mut self,
        tuple: &FourTuple,
        dir: Direction,
        stream: &mut HttpStream,
        ts: OffsetDateTime,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        while let Some((msg, raw)) = stream.parse(ts, &self.config)? {
            self.handle_message(tuple, dir, msg, raw, ctx);
        }
        Ok(())
    }

    pub fn on_fin(
        &mut self,
        tuple: &FourTuple,
        dir: Direction,
        stream: &mut HttpStream,
        ctx: &mut Ctx<'_>,
    ) {
        if let Some((msg, raw)) = stream.flush_on_fin() {
            debug!("flushing close-delimited http message on {}", tuple);
            self.handle_message(tuple, dir, msg, raw, ctx);
        }
    }

    fn handle_message(
        &mut self,
        tuple: &FourTuple,
        dir: Direction,
        msg: HttpMessage,
        mut raw: Vec<u8>,
        ctx: &mut Ctx<'_>,
    ) {
        censor_passwords(&msg, &mut raw, &self.hide_keywords);
        if msg.is_request {
            self.on_request(tuple, dir, msg, &raw, ctx);
        } else {
            self.on_response(tuple, msg, &raw, ctx);
        }
    }

    fn on_request(
        &mut self,
        tuple: &FourTuple,
        dir: Direction,
        msg: HttpMessage,
        raw: &[u8],
        ctx: &mut Ctx<'_>,
    ) {
        let (src, dst) = endpoints(&tuple.ip, dir, ctx.procs);
        let request_raw = if self.config.send_request {
            Some(lossy(&self.cut_message_body(&msg, raw)))
        } else {
            None
        };
        let mut http = Map::new();
        if self.config.captures_headers() {
            http.insert("request_headers".into(), self.headers_value(&msg, true));
        }
        let pending = HttpPending {
            method: msg.method.clone(),
            path: msg.request_uri.clone(),
            real_ip: (!msg.real_ip.is_empty()).then(|| msg.real_ip.clone()),
            request_raw,
            http,
            src,
            dst,
        };
        if self
            .transactions
            .begin(*tuple, pending, msg.ts, ctx.timers)
        {
            warn!("two http requests without a response on {}; dropping the old one", tuple);
        }
    }

    fn on_response(
        &mut self,
        tuple: &FourTuple,
        msg: HttpMessage,
        raw: &[u8],
        ctx: &mut Ctx<'_>,
    ) {
        let pending = match self.transactions.resolve(tuple, ctx.timers) {
            Some(pending) => pending,
            None => {
                ctx.stats.orphan_responses += 1;
                warn!("http response on {} without a request; ignoring", tuple);
                return;
            }
        };
        let responsetime = pending.response_time_ms(msg.ts);
        let request_ts = pending.ts;
        let HttpPending {
            method,
            path,
            real_ip,
            request_raw,
            mut http,
            src,
            dst,
        } = pending.request;

        http.insert("code".into(), json!(msg.status_code));
        http.insert("phrase".into(), json!(msg.status_phrase));
        http.insert("content_length".into(), json!(msg.content_length));
        if self.config.captures_headers() {
            http.insert("response_headers".into(), self.headers_value(&msg, false));
        }

        let mut event = Event::new("http", request_ts, src, dst);
        event.set_status(msg.status_code < 400);
        event.responsetime = responsetime;
        event.method = method;
        event.path = path;
        event.real_ip = real_ip;
        event.request_raw = request_raw;
        if self.config.send_response {
            event.response_raw = Some(lossy(&self.cut_message_body(&msg, raw)));
        }
        event.details.insert("http".into(), Value::Object(http));
        ctx.publisher.publish(event);
    }

    /// The raw message with its body removed unless the content type is
    /// on the include list. The chunked body replaces the wire body.
    fn cut_message_body(&self, msg: &HttpMessage, raw: &[u8]) -> Vec<u8> {
        let body_start = msg.body_offset.saturating_sub(msg.start).min(raw.len());
        let mut cut = raw[..body_start].to_vec();
        if let Some(content_type) = &msg.content_type {
            let include = content_type.is_empty()
                || self
                    .config
                    .include_body_for
                    .iter()
                    .any(|inc| content_type.contains(inc));
            if include {
                if !msg.chunked_body.is_empty() {
                    cut.extend_from_slice(&msg.chunked_body);
                } else {
                    cut.extend_from_slice(&raw[body_start..]);
                }
            }
        }
        cut
    }

    fn headers_value(&self, msg: &HttpMessage, is_request: bool) -> Value {
        let mut map = Map::new();
        for (name, value) in msg.headers.iter() {
            let split = self.config.split_cookie
                && ((is_request && name == "cookie") || (!is_request && name == "set-cookie"));
            if split {
                map.insert(name.clone(), Value::Object(split_cookies(value)));
            } else {
                map.insert(name.clone(), Value::String(value.clone()));
            }
        }
        Value::Object(map)
    }
}

/// Split a cookie header value on `;` and `=` into a sub-mapping.
fn split_cookies(value: &str) -> Map<String, Value> {
    let mut out = Map::new();
    for pair in value.split(';') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        let val = parts.next().unwrap_or("").to_string();
        out.insert(name, Value::String(val));
    }
    out
}
