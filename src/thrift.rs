//! Thrift binary-protocol analyzer.
//!
//! Handles both the strict (versioned) and the non-versioned framing.
//! Primitive field values are decoded to display strings; container
//! fields (struct, map, set, list) are skipped over safely by walking
//! their declared element types, bounded in depth.

use crate::config::Config;
use crate::engine::Ctx;
use crate::error::{Error, Progress, Result};
use crate::event::Event;
use crate::net::{endpoints, Direction, Endpoint, FourTuple, Protocol};
use crate::stream::StreamBuffer;
use crate::timer::{TimerId, TimerService};
use crate::transactions::TransactionMap;
use crate::util::lossy;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, warn};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

const VERSION_MASK: u32 = 0xffff_0000;
const VERSION_1: u32 = 0x8001_0000;
const TYPE_MASK: u32 = 0x0000_00ff;

pub const MSG_CALL: u32 = 1;
pub const MSG_REPLY: u32 = 2;
pub const MSG_EXCEPTION: u32 = 3;
pub const MSG_ONEWAY: u32 = 4;

const TYPE_STOP: u8 = 0;
const TYPE_BOOL: u8 = 2;
const TYPE_BYTE: u8 = 3;
const TYPE_DOUBLE: u8 = 4;
const TYPE_I16: u8 = 6;
const TYPE_I32: u8 = 8;
const TYPE_I64: u8 = 10;
const TYPE_STRING: u8 = 11;
const TYPE_STRUCT: u8 = 12;
const TYPE_MAP: u8 = 13;
const TYPE_SET: u8 = 14;
const TYPE_LIST: u8 = 15;

/// Containers nested deeper than this are structurally impossible input.
const MAX_SKIP_DEPTH: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Start,
    Fields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThriftField {
    pub typ: u8,
    pub id: u16,
    pub value: String,
}

/// One parsed call, reply, exception or oneway message.
#[derive(Debug)]
pub struct ThriftMessage {
    pub ts: OffsetDateTime,
    pub version: u32,
    pub typ: u32,
    pub method: String,
    pub seq: u32,
    pub fields: Vec<ThriftField>,
    pub is_request: bool,
    pub start: usize,
    pub end: usize,
}

impl ThriftMessage {
    fn new(ts: OffsetDateTime) -> Self {
        Self {
            ts,
            version: 0,
            typ: 0,
            method: String::new(),
            seq: 0,
            fields: Vec::new(),
            is_request: false,
            start: 0,
            end: 0,
        }
    }
}

/// Per-direction Thrift stream state.
#[derive(Debug)]
pub struct ThriftStream {
    pub buf: StreamBuffer,
    state: ParseState,
    message: Option<ThriftMessage>,
}

impl ThriftStream {
    pub fn new() -> Self {
        Self {
            buf: StreamBuffer::new(),
            state: ParseState::Start,
            message: None,
        }
    }

    pub fn parse(&mut self, ts: OffsetDateTime) -> Result<Option<(ThriftMessage, Vec<u8>)>> {
        let mut msg = match self.message.take() {
            Some(msg) => msg,
            None => ThriftMessage::new(ts),
        };
        match parse_message(&mut self.buf, &mut self.state, &mut msg)? {
            Progress::Complete => {
                let raw = self.buf.data()[msg.start..msg.end].to_vec();
                let consumed = self.buf.parse_offset();
                self.buf.compact(consumed);
                self.state = ParseState::Start;
                Ok(Some((msg, raw)))
            }
            Progress::More => {
                self.message = Some(msg);
                Ok(None)
            }
        }
    }
}

fn parse_message(
    buf: &mut StreamBuffer,
    state: &mut ParseState,
    msg: &mut ThriftMessage,
) -> Result<Progress> {
    while buf.parse_offset() < buf.len() {
        match *state {
            ParseState::Start => {
                buf.mark_message_start();
                msg.start = buf.parse_offset();
                match read_message_begin(buf.unparsed(), msg)? {
                    Some(consumed) => {
                        buf.advance(consumed);
                        *state = ParseState::Fields;
                    }
                    None => return Ok(Progress::More),
                }
            }
            ParseState::Fields => {
                let input = buf.unparsed();
                let ftype = input[0];
                if ftype == TYPE_STOP {
                    buf.advance(1);
                    msg.end = buf.parse_offset();
                    return Ok(Progress::Complete);
                }
                if input.len() < 3 {
                    return Ok(Progress::More);
                }
                let id = BigEndian::read_u16(&input[1..3]);
                match read_field_value(&input[3..], ftype, MAX_SKIP_DEPTH)? {
                    Some((value, consumed)) => {
                        buf.advance(3 + consumed);
                        msg.fields.push(ThriftField {
                            typ: ftype,
                            id,
                            value,
                        });
                    }
                    None => return Ok(Progress::More),
                }
            }
        }
    }
    Ok(Progress::More)
}

/// Parse the message header in either framing.
///
/// Returns bytes consumed, or `None` when more input is needed.
fn read_message_begin(input: &[u8], msg: &mut ThriftMessage) -> Result<Option<usize>> {
    if input.len() < 9 {
        return Ok(None);
    }
    let first_word = BigEndian::read_u32(&input[..4]);
    if first_word & 0x8000_0000 != 0 {
        // Strict framing carries the message type in the version word.
        msg.version = first_word & VERSION_MASK;
        if msg.version != VERSION_1 {
            debug!("unexpected thrift version 0x{:08x}", msg.version);
        }
        msg.typ = first_word & TYPE_MASK;
        let (method, method_len) = match read_string(&input[4..])? {
            Some(found) => found,
            None => return Ok(None),
        };
        let offset = 4 + method_len;
        if input.len() < offset + 4 {
            return Ok(None);
        }
        msg.method = method;
        msg.seq = BigEndian::read_u32(&input[offset..offset + 4]);
        mark_request(msg);
        Ok(Some(offset + 4))
    } else {
        let (method, method_len) = match read_string(input)? {
            Some(found) => found,
            None => return Ok(None),
        };
        if input.len() < method_len + 5 {
            return Ok(None);
        }
        msg.method = method;
        msg.typ = u32::from(input[method_len]);
        msg.seq = BigEndian::read_u32(&input[method_len + 1..method_len + 5]);
        mark_request(msg);
        Ok(Some(method_len + 5))
    }
}

fn mark_request(msg: &mut ThriftMessage) {
    msg.is_request = msg.typ == MSG_CALL || msg.typ == MSG_ONEWAY;
}

/// Length-prefixed string: `[len:4 BE][bytes]`.
fn read_string(data: &[u8]) -> Result<Option<(String, usize)>> {
    if data.len() < 4 {
        return Ok(None);
    }
    let length = BigEndian::read_u32(&data[..4]);
    if length & 0x8000_0000 != 0 {
        return Err(Error::malformed("thrift", "negative string length"));
    }
    let length = length as usize;
    if data.len() - 4 < length {
        return Ok(None);
    }
    Ok(Some((lossy(&data[4..4 + length]), 4 + length)))
}

/// Decode one field value. Primitive types become display strings;
/// containers are skipped and reported as a placeholder.
fn read_field_value(data: &[u8], typ: u8, depth: u8) -> Result<Option<(String, usize)>> {
    match typ {
        TYPE_BOOL => Ok(data
            .first()
            .map(|&b| ((if b != 0 { "true" } else { "false" }).to_string(), 1))),
        TYPE_BYTE => Ok(data.first().map(|&b| (b.to_string(), 1))),
        TYPE_DOUBLE => {
            if data.len() < 8 {
                return Ok(None);
            }
            Ok(Some((BigEndian::read_f64(&data[..8]).to_string(), 8)))
        }
        TYPE_I16 => {
            if data.len() < 2 {
                return Ok(None);
            }
            Ok(Some((BigEndian::read_i16(&data[..2]).to_string(), 2)))
        }
        TYPE_I32 => {
            if data.len() < 4 {
                return Ok(None);
            }
            Ok(Some((BigEndian::read_i32(&data[..4]).to_string(), 4)))
        }
        TYPE_I64 => {
            if data.len() < 8 {
                return Ok(None);
            }
            Ok(Some((BigEndian::read_i64(&data[..8]).to_string(), 8)))
        }
        TYPE_STRING => read_string(data),
        TYPE_STRUCT | TYPE_MAP | TYPE_SET | TYPE_LIST => {
            let placeholder = match typ {
                TYPE_STRUCT => "<struct>",
                TYPE_MAP => "<map>",
                TYPE_SET => "<set>",
                _ => "<list>",
            };
            Ok(skip_value(data, typ, depth)?.map(|consumed| (placeholder.to_string(), consumed)))
        }
        _ => Err(Error::malformed("thrift", "unsupported field type")),
    }
}

/// Walk past one value of the given type without decoding it.
///
/// Returns the bytes it spans, or `None` when the value is not fully
/// buffered yet.
fn skip_value(data: &[u8], typ: u8, depth: u8) -> Result<Option<usize>> {
    if depth == 0 {
        return Err(Error::malformed("thrift", "containers nested too deeply"));
    }
    let fixed = |n: usize| -> Result<Option<usize>> {
        if data.len() < n {
            Ok(None)
        } else {
            Ok(Some(n))
        }
    };
    match typ {
        TYPE_BOOL | TYPE_BYTE => fixed(1),
        TYPE_I16 => fixed(2),
        TYPE_I32 => fixed(4),
        TYPE_I64 | TYPE_DOUBLE => fixed(8),
        TYPE_STRING => Ok(read_string(data)?.map(|(_, consumed)| consumed)),
        TYPE_STRUCT => {
            let mut offset = 0;
            loop {
                let ftype = match data.get(offset) {
                    Some(&t) => t,
                    None => return Ok(None),
                };
                offset += 1;
                if ftype == TYPE_STOP {
                    return Ok(Some(offset));
                }
                if data.len() < offset + 2 {
                    return Ok(None);
                }
                offset += 2;
                match skip_value(&data[offset..], ftype, depth - 1)? {
                    Some(consumed) => offset += consumed,
                    None => return Ok(None),
                }
            }
        }
        TYPE_MAP => {
            if data.len() < 6 {
                return Ok(None);
            }
            let key_type = data[0];
            let value_type = data[1];
            let count = BigEndian::read_u32(&data[2..6]) as usize;
            let mut offset = 6;
            for _ in 0..count {
                for elem_type in [key_type, value_type] {
                    match skip_value(&data[offset..], elem_type, depth - 1)? {
                        Some(consumed) => offset += consumed,
                        None => return Ok(None),
                    }
                }
            }
            Ok(Some(offset))
        }
        TYPE_SET | TYPE_LIST => {
            if data.len() < 5 {
                return Ok(None);
            }
            let elem_type = data[0];
            let count = BigEndian::read_u32(&data[1..5]) as usize;
            let mut offset = 5;
            for _ in 0..count {
                match skip_value(&data[offset..], elem_type, depth - 1)? {
                    Some(consumed) => offset += consumed,
                    None => return Ok(None),
                }
            }
            Ok(Some(offset))
        }
        _ => Err(Error::malformed("thrift", "unsupported field type")),
    }
}

fn format_fields(fields: &[ThriftField]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.id, f.value))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug)]
struct ThriftPending {
    method: String,
    params: String,
    request_raw: String,
    src: Endpoint,
    dst: Endpoint,
}

pub struct ThriftAnalyzer {
    transactions: TransactionMap<ThriftPending>,
}

impl ThriftAnalyzer {
    pub fn new(config: &Config) -> Self {
        Self {
            transactions: TransactionMap::new(Protocol::Thrift, config.transaction_timeout()),
        }
    }

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
        stream: &mut ThriftStream,
        ts: OffsetDateTime,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        while let Some((msg, _raw)) = stream.parse(ts)? {
            if msg.is_request {
                self.on_request(tuple, dir, msg, ctx);
            } else {
                self.on_response(tuple, msg, ctx);
            }
        }
        Ok(())
    }

    fn on_request(
        &mut self,
        tuple: &FourTuple,
        dir: Direction,
        msg: ThriftMessage,
        ctx: &mut Ctx<'_>,
    ) {
        let (src, dst) = endpoints(&tuple.ip, dir, ctx.procs);
        let params = format_fields(&msg.fields);
        let pending = ThriftPending {
            request_raw: format!("{}({})", msg.method, params),
            method: msg.method,
            params,
            src,
            dst,
        };
        if self.transactions.begin(*tuple, pending, msg.ts, ctx.timers) {
            warn!("two thrift calls without a reply on {}; dropping the old one", tuple);
        }
    }

    fn on_response(&mut self, tuple: &FourTuple, msg: ThriftMessage, ctx: &mut Ctx<'_>) {
        let pending = match self.transactions.resolve(tuple, ctx.timers) {
            Some(pending) => pending,
            None => {
                ctx.stats.orphan_responses += 1;
                warn!("thrift reply on {} without a call; ignoring", tuple);
                return;
            }
        };
        let responsetime = pending.response_time_ms(msg.ts);
        let request_ts = pending.ts;
        let ThriftPending {
            method,
            params,
            request_raw,
            src,
            dst,
        } = pending.request;

        let returned = format_fields(&msg.fields);
        let mut thrift = Map::new();
        thrift.insert("params".into(), json!(params));
        thrift.insert("seq".into(), json!(msg.seq));
        if msg.typ == MSG_EXCEPTION {
            thrift.insert("exceptions".into(), json!(returned));
        } else {
            thrift.insert("return_value".into(), json!(returned));
        }

        let mut event = Event::new("thrift", request_ts, src, dst);
        event.set_status(msg.typ != MSG_EXCEPTION);
        event.responsetime = responsetime;
        event.method = method;
        event.request_raw = Some(request_raw);
        event.response_raw = Some(returned);
        event.details.insert("thrift".into(), Value::Object(thrift));
        ctx.publisher.publish(event);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn parse_one(wire: &[u8]) -> ThriftMessage {
        let mut stream = ThriftStream::new();
        stream.buf.append(wire);
        stream
            .parse(OffsetDateTime::UNIX_EPOCH)
            .expect("parse ok")
            .expect("complete")
            .0
    }

    #[rstest]
    #[case::complete(b"\x00\x00\x00\x04ping".as_ref(), Some(("ping".to_string(), 8)))]
    #[case::complete_with_tail(b"\x00\x00\x00\x04ping\x00\x00".as_ref(), Some(("ping".to_string(), 8)))]
    #[case::short_bytes(b"\x00\x00\x00\x04pin".as_ref(), None)]
    #[case::short_prefix(b"\x00\x00\x00".as_ref(), None)]
    fn test_read_string(#[case] input: &[u8], #[case] expected: Option<(String, usize)>) {
        assert_eq!(read_string(input).unwrap(), expected);
    }

    #[test]
    fn negative_string_length_is_fatal() {
        assert!(read_string(b"\xff\xff\xff\xff----").is_err());
    }

    #[test]
    fn strict_ping_call() {
        let wire = hex::decode("800100010000000470696e670000000000").unwrap();
        let msg = parse_one(&wire);
        assert_eq!(msg.version, VERSION_1);
        assert_eq!(msg.typ, MSG_CALL);
        assert!(msg.is_request);
        assert_eq!(msg.method, "ping");
        assert_eq!(msg.seq, 0);
        assert!(msg.fields.is_empty());
    }

    #[test]
    fn non_versioned_call() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"\x00\x00\x00\x04ping");
        wire.push(MSG_CALL as u8);
        wire.extend_from_slice(&[0, 0, 0, 7]); // seq
        wire.push(TYPE_STOP);
        let msg = parse_one(&wire);
        assert_eq!(msg.version, 0);
        assert!(msg.is_request);
        assert_eq!(msg.method, "ping");
        assert_eq!(msg.seq, 7);
    }

    #[test]
    fn reply_with_primitive_fields() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0x80, 0x01, 0x00, MSG_REPLY as u8]);
        wire.extend_from_slice(b"\x00\x00\x00\x04ping");
        wire.extend_from_slice(&[0, 0, 0, 1]); // seq
        wire.push(TYPE_I32);
        wire.extend_from_slice(&[0, 0]); // id 0
        wire.extend_from_slice(&[0, 0, 0, 10]);
        wire.push(TYPE_BOOL);
        wire.extend_from_slice(&[0, 1]); // id 1
        wire.push(1);
        wire.push(TYPE_STOP);
        let msg = parse_one(&wire);
        assert!(!msg.is_request);
        assert_eq!(
            msg.fields,
            vec![
                ThriftField {
                    typ: TYPE_I32,
                    id: 0,
                    value: "10".into()
                },
                ThriftField {
                    typ: TYPE_BOOL,
                    id: 1,
                    value: "true".into()
                },
            ]
        );
        assert_eq!(format_fields(&msg.fields), "0: 10, 1: true");
    }

    #[test]
    fn struct_fields_are_skipped_safely() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0x80, 0x01, 0x00, MSG_CALL as u8]);
        wire.extend_from_slice(b"\x00\x00\x00\x03add");
        wire.extend_from_slice(&[0, 0, 0, 2]); // seq
        wire.push(TYPE_STRUCT);
        wire.extend_from_slice(&[0, 1]); // id 1
        // struct { 4: bool true; stop }
        wire.push(TYPE_BOOL);
        wire.extend_from_slice(&[0, 4]);
        wire.push(1);
        wire.push(TYPE_STOP);
        wire.push(TYPE_STOP);
        let msg = parse_one(&wire);
        assert_eq!(msg.fields.len(), 1);
        assert_eq!(msg.fields[0].value, "<struct>");
    }

    #[test]
    fn list_of_strings_is_skipped_by_length() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0x80, 0x01, 0x00, MSG_CALL as u8]);
        wire.extend_from_slice(b"\x00\x00\x00\x03add");
        wire.extend_from_slice(&[0, 0, 0, 3]); // seq
        wire.push(TYPE_LIST);
        wire.extend_from_slice(&[0, 1]); // id 1
        wire.push(TYPE_STRING);
        wire.extend_from_slice(&[0, 0, 0, 2]); // two elements
        wire.extend_from_slice(b"\x00\x00\x00\x02ab");
        wire.extend_from_slice(b"\x00\x00\x00\x01c");
        wire.push(TYPE_STOP);
        let msg = parse_one(&wire);
        assert_eq!(msg.fields[0].value, "<list>");
    }

    #[test]
    fn byte_at_a_time_feeding_completes_once() {
        let wire = hex::decode("800100010000000470696e670000000000").unwrap();
        let mut stream = ThriftStream::new();
        let mut complete = 0;
        for byte in &wire {
            stream.buf.append(&[*byte]);
            if stream
                .parse(OffsetDateTime::UNIX_EPOCH)
                .expect("parse ok")
                .is_some()
            {
                complete += 1;
            }
        }
        assert_eq!(complete, 1);
        assert!(stream.buf.is_empty());
    }

    #[test]
    fn unsupported_field_type_is_fatal() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0x80, 0x01, 0x00, MSG_CALL as u8]);
        wire.extend_from_slice(b"\x00\x00\x00\x04ping");
        wire.extend_from_slice(&[0, 0, 0, 0]);
        wire.push(99); // no such field type
        wire.extend_from_slice(&[0, 1, 0]);
        let mut stream = ThriftStream::new();
        stream.buf.append(&wire);
        assert!(stream.parse(OffsetDateTime::UNIX_EPOCH).is_err());
    }
}
