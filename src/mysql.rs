//! MySQL wire-protocol analyzer.
//!
//! Parses COM_QUERY requests and their OK / ERR / result-set responses
//! from reassembled client and server streams. Only queries are surfaced;
//! other commands are consumed to keep packet framing aligned and then
//! ignored.

use crate::config::Config;
use crate::engine::Ctx;
use crate::error::{Error, Progress, Result};
use crate::event::Event;
use crate::net::{endpoints, Direction, Endpoint, FourTuple, Protocol};
use crate::stream::StreamBuffer;
use crate::timer::{TimerId, TimerService};
use crate::transactions::TransactionMap;
use crate::util::{first_word, lossy};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

const CMD_QUERY: u8 = 0x03;
const EOF_MARKER: u8 = 0xfe;
const NULL_MARKER: u8 = 0xfb;

/// Responses larger than this keep their framing consumed but stop
/// contributing bytes to the emitted raw.
pub const MAX_PAYLOAD_SIZE: usize = 100 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Start,
    EatMessage,
    EatFields,
    EatRows,
}

/// One parsed request or response.
#[derive(Debug)]
pub struct MysqlMessage {
    pub ts: OffsetDateTime,
    pub is_request: bool,
    pub seq: u8,
    pub typ: u8,
    packet_length: usize,
    pub num_fields: usize,
    pub num_rows: usize,
    pub size: u64,
    pub tables: String,
    pub is_ok: bool,
    pub affected_rows: u64,
    pub insert_id: u64,
    pub is_error: bool,
    pub error_code: u16,
    pub error_message: String,
    pub query: String,
    pub is_truncated: bool,
    /// Commands other than QUERY are consumed but produce no event.
    pub ignore: bool,
    pub start: usize,
    pub end: usize,
}

impl MysqlMessage {
    fn new(ts: OffsetDateTime) -> Self {
        Self {
            ts,
            is_request: false,
            seq: 0,
            typ: 0,
            packet_length: 0,
            num_fields: 0,
            num_rows: 0,
            size: 0,
            tables: String::new(),
            is_ok: false,
            affected_rows: 0,
            insert_id: 0,
            is_error: false,
            error_code: 0,
            error_message: String::new(),
            query: String::new(),
            is_truncated: false,
            ignore: false,
            start: 0,
            end: 0,
        }
    }
}

/// Per-direction MySQL stream state.
#[derive(Debug)]
pub struct MysqlStream {
    pub buf: StreamBuffer,
    state: ParseState,
    /// Latched once a `seq == 0` packet is seen on this direction, so the
    /// server side of the flow is never mistaken for a command stream.
    client_seen: bool,
    message: Option<MysqlMessage>,
}

impl MysqlStream {
    pub fn new() -> Self {
        Self {
            buf: StreamBuffer::new(),
            state: ParseState::Start,
            client_seen: false,
            message: None,
        }
    }

    /// Frame the next message from the buffered bytes.
    ///
    /// On completion the raw covers `start..end`, which for truncated
    /// result sets stops short of the bytes consumed for framing.
    pub fn parse(&mut self, ts: OffsetDateTime) -> Result<Option<(MysqlMessage, Vec<u8>)>> {
        let mut msg = match self.message.take() {
            Some(msg) => msg,
            None => MysqlMessage::new(ts),
        };
        match parse_message(&mut self.buf, &mut self.state, &mut self.client_seen, &mut msg)? {
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
    client_seen: &mut bool,
    msg: &mut MysqlMessage,
) -> Result<Progress> {
    while buf.parse_offset() < buf.len() {
        match *state {
            ParseState::Start => {
                if buf.remaining() < 5 {
                    return Ok(Progress::More);
                }
                buf.mark_message_start();
                msg.start = buf.parse_offset();
                {
                    let input = buf.unparsed();
                    msg.packet_length = LittleEndian::read_u24(&input[..3]) as usize;
                    msg.seq = input[3];
                    msg.typ = input[4];
                }
                debug!(
                    "mysql packet: length {} seq {} type 0x{:02x}",
                    msg.packet_length, msg.seq, msg.typ
                );

                if msg.seq == 0 {
                    // Command phase.
                    *client_seen = true;
                    if msg.typ == CMD_QUERY {
                        msg.is_request = true;
                    } else {
                        msg.ignore = true;
                    }
                    *state = ParseState::EatMessage;
                } else if !*client_seen {
                    msg.is_request = false;
                    if msg.typ == 0x00 {
                        msg.is_ok = true;
                        *state = ParseState::EatMessage;
                    } else if msg.typ == 0xff {
                        msg.is_error = true;
                        *state = ParseState::EatMessage;
                    } else if msg.packet_length == 1 {
                        msg.num_fields = msg.typ as usize;
                        buf.advance(5);
                        *state = ParseState::EatFields;
                    } else {
                        msg.ignore = true;
                        *state = ParseState::EatMessage;
                    }
                } else {
                    return Err(Error::malformed("mysql", "unexpected packet in command phase"));
                }
            }
            ParseState::EatMessage => {
                if buf.remaining() < msg.packet_length + 4 {
                    return Ok(Progress::More);
                }
                buf.advance(msg.packet_length + 4);
                msg.end = buf.parse_offset();
                msg.size = (msg.end - msg.start) as u64;
                let data = buf.data();
                if msg.is_request {
                    if msg.end > msg.start + 5 {
                        msg.query = lossy(&data[msg.start + 5..msg.end]);
                    }
                } else if msg.is_ok {
                    parse_ok_payload(&data[msg.start + 4..msg.end], msg);
                } else if msg.is_error {
                    parse_err_payload(&data[msg.start + 4..msg.end], msg);
                }
                return Ok(Progress::Complete);
            }
            ParseState::EatFields => {
                let input = buf.unparsed();
                if input.len() < 4 {
                    return Ok(Progress::More);
                }
                let packet_length = LittleEndian::read_u24(&input[..3]) as usize;
                if input.len() < packet_length + 4 {
                    return Ok(Progress::More);
                }
                msg.packet_length = packet_length;
                msg.seq = input[3];
                let payload = &input[4..4 + packet_length];
                if payload.first() == Some(&EOF_MARKER) {
                    buf.advance(packet_length + 4);
                    *state = ParseState::EatRows;
                } else {
                    if let Some(db_table) = parse_field_packet(payload) {
                        if msg.tables.is_empty() {
                            msg.tables = db_table;
                        } else if !msg.tables.contains(&db_table) {
                            msg.tables.push_str(", ");
                            msg.tables.push_str(&db_table);
                        }
                    }
                    buf.advance(packet_length + 4);
                }
            }
            ParseState::EatRows => {
                let input = buf.unparsed();
                if input.len() < 4 {
                    return Ok(Progress::More);
                }
                let packet_length = LittleEndian::read_u24(&input[..3]) as usize;
                if input.len() < packet_length + 4 {
                    return Ok(Progress::More);
                }
                msg.packet_length = packet_length;
                msg.seq = input[3];
                let eof = input.get(4) == Some(&EOF_MARKER);
                buf.advance(packet_length + 4);
                if eof {
                    if msg.end == 0 {
                        msg.end = buf.parse_offset();
                    } else {
                        msg.is_truncated = true;
                    }
                    msg.size = (buf.parse_offset() - msg.start) as u64;
                    if !msg.is_error {
                        msg.is_ok = true;
                    }
                    return Ok(Progress::Complete);
                }
                // Past the cap the raw stops growing but framing goes on.
                if msg.end == 0 && buf.parse_offset() - msg.start > MAX_PAYLOAD_SIZE {
                    msg.end = buf.parse_offset();
                }
                msg.num_rows += 1;
            }
        }
    }
    Ok(Progress::More)
}

/// OK packet: `[0x00][affected_rows:lenenc][insert_id:lenenc]...`.
fn parse_ok_payload(payload: &[u8], msg: &mut MysqlMessage) {
    if let Some((affected, next)) = read_lenenc_int(payload, 1) {
        msg.affected_rows = affected;
        if let Some((insert_id, _)) = read_lenenc_int(payload, next) {
            msg.insert_id = insert_id;
        }
    }
}

/// ERR packet: `[0xff][code:2 LE][#sqlstate]?[message]`.
fn parse_err_payload(payload: &[u8], msg: &mut MysqlMessage) {
    if payload.len() >= 3 {
        msg.error_code = LittleEndian::read_u16(&payload[1..3]);
    }
    if payload.len() >= 9 && payload[3] == b'#' {
        msg.error_message = format!("{}: {}", lossy(&payload[4..9]), lossy(&payload[9..]));
    } else if payload.len() > 3 {
        msg.error_message = lossy(&payload[3..]);
    }
}

/// Column descriptor packet: `schema.table` from its length-coded strings.
fn parse_field_packet(payload: &[u8]) -> Option<String> {
    let (_catalog, off) = read_lenenc_string(payload, 0)?;
    let (schema, off) = read_lenenc_string(payload, off)?;
    let (table, _off) = read_lenenc_string(payload, off)?;
    Some(format!("{}.{}", lossy(schema), lossy(table)))
}

/// Canonical MySQL length-coded integer, little-endian.
///
/// `0xfb` (NULL in row context) and `0xff` are not values.
pub fn read_lenenc_int(data: &[u8], offset: usize) -> Option<(u64, usize)> {
    let first = *data.get(offset)?;
    match first {
        0xfc => {
            let bytes = data.get(offset + 1..offset + 3)?;
            Some((u64::from(LittleEndian::read_u16(bytes)), offset + 3))
        }
        0xfd => {
            let bytes = data.get(offset + 1..offset + 4)?;
            Some((u64::from(LittleEndian::read_u24(bytes)), offset + 4))
        }
        0xfe => {
            let bytes = data.get(offset + 1..offset + 9)?;
            Some((LittleEndian::read_u64(bytes), offset + 9))
        }
        0xfb | 0xff => None,
        _ => Some((u64::from(first), offset + 1)),
    }
}

/// Length-coded string: a length-coded integer followed by that many bytes.
pub fn read_lenenc_string(data: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let (length, off) = read_lenenc_int(data, offset)?;
    let end = off.checked_add(length as usize)?;
    let bytes = data.get(off..end)?;
    Some((bytes, end))
}

/// Re-walk a result-set response into column names and row values.
fn parse_response_rows(data: &[u8]) -> (Vec<String>, Vec<Vec<String>>) {
    let mut fields = Vec::new();
    let mut rows = Vec::new();
    if data.len() < 5 || data[4] == 0x00 || data[4] == 0xff {
        return (fields, rows);
    }

    // Column descriptors follow the column-count packet.
    let mut offset = 5;
    loop {
        if offset + 5 > data.len() {
            return (fields, rows);
        }
        let length = LittleEndian::read_u24(&data[offset..]) as usize;
        if data[offset + 4] == EOF_MARKER {
            offset += length + 4;
            break;
        }
        if offset + 4 + length > data.len() {
            return (fields, rows);
        }
        let name = read_lenenc_string(data, offset + 4)
            .and_then(|(_, off)| read_lenenc_string(data, off))
            .and_then(|(_, off)| read_lenenc_string(data, off))
            .and_then(|(_, off)| read_lenenc_string(data, off))
            .and_then(|(_, off)| read_lenenc_string(data, off).map(|(name, _)| name));
        match name {
            Some(name) => fields.push(lossy(name)),
            None => return (fields, rows),
        }
        offset += length + 4;
    }

    while offset + 5 <= data.len() {
        if data[offset + 4] == EOF_MARKER {
            break;
        }
        let length = LittleEndian::read_u24(&data[offset..]) as usize;
        if offset + 4 + length > data.len() {
            break;
        }
        let row_end = offset + 4 + length;
        let mut off = offset + 4;
        let mut row = Vec::new();
        while off < row_end {
            if data[off] == NULL_MARKER {
                row.push("NULL".to_string());
                off += 1;
            } else {
                match read_lenenc_string(data, off) {
                    Some((text, next)) => {
                        row.push(lossy(text));
                        off = next;
                    }
                    None => return (fields, rows),
                }
            }
        }
        rows.push(row);
        offset = row_end;
    }
    (fields, rows)
}

fn csv_escape(field: &str) -> String {
    let cleaned = field.replace('\n', "\\n").replace('\r', "\\r");
    if cleaned.contains(',') || cleaned.contains('"') {
        format!("\"{}\"", cleaned.replace('"', "\"\""))
    } else {
        cleaned
    }
}

/// Render column names and rows in CSV form for the response raw.
fn dump_csv(fields: &[String], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    if !fields.is_empty() {
        out.push_str(
            &fields
                .iter()
                .map(|f| csv_escape(f))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
    }
    for row in rows {
        out.push_str(&row.iter().map(|f| csv_escape(f)).collect::<Vec<_>>().join(","));
        out.push('\n');
    }
    out
}

#[derive(Debug)]
struct MysqlPending {
    method: String,
    query: String,
    mysql: Map<String, Value>,
    src: Endpoint,
    dst: Endpoint,
}

pub struct MysqlAnalyzer {
    transactions: TransactionMap<MysqlPending>,
}

impl MysqlAnalyzer {
    pub fn new(config: &Config) -> Self {
        Self {
            transactions: TransactionMap::new(Protocol::Mysql, config.transaction_timeout()),
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
        stream: &mut MysqlStream,
        ts: OffsetDateTime,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        while let Some((msg, raw)) = stream.parse(ts)? {
            if msg.ignore {
                continue;
            }
            if msg.is_request {
                self.on_request(tuple, dir, msg, ctx);
            } else {
                self.on_response(tuple, msg, &raw, ctx);
            }
        }
        Ok(())
    }

    fn on_request(
        &mut self,
        tuple: &FourTuple,
        dir: Direction,
        msg: MysqlMessage,
        ctx: &mut Ctx<'_>,
    ) {
        let (src, dst) = endpoints(&tuple.ip, dir, ctx.procs);
        let query = msg
            .query
            .trim_matches(|c| c == ' ' || c == '\n' || c == '\t')
            .to_string();
        let method = lossy(first_word(query.as_bytes())).to_ascii_uppercase();
        let mut mysql = Map::new();
        mysql.insert("query".into(), json!(query));
        mysql.insert("method".into(), json!(method));
        let pending = MysqlPending {
            method,
            query,
            mysql,
            src,
            dst,
        };
        if self.transactions.begin(*tuple, pending, msg.ts, ctx.timers) {
            warn!("two mysql queries without a response on {}; dropping the old one", tuple);
        }
    }

    fn on_response(&mut self, tuple: &FourTuple, msg: MysqlMessage, raw: &[u8], ctx: &mut Ctx<'_>) {
        let pending = match self.transactions.resolve(tuple, ctx.timers) {
            Some(pending) => pending,
            None => {
                ctx.stats.orphan_responses += 1;
                warn!("mysql response on {} without a query; ignoring", tuple);
                return;
            }
        };
        let responsetime = pending.response_time_ms(msg.ts);
        let request_ts = pending.ts;
        let MysqlPending {
            method,
            query,
            mut mysql,
            src,
            dst,
        } = pending.request;

        mysql.insert("isok".into(), json!(msg.is_ok));
        mysql.insert("affected_rows".into(), json!(msg.affected_rows));
        mysql.insert("insert_id".into(), json!(msg.insert_id));
        mysql.insert("tables".into(), json!(msg.tables));
        mysql.insert("num_rows".into(), json!(msg.num_rows));
        mysql.insert("size".into(), json!(msg.size));
        mysql.insert("num_fields".into(), json!(msg.num_fields));
        mysql.insert("iserror".into(), json!(msg.is_error));
        mysql.insert("error_code".into(), json!(msg.error_code));
        mysql.insert("error_message".into(), json!(msg.error_message));
        if msg.is_truncated {
            mysql.insert("truncated".into(), json!(true));
        }

        let mut event = Event::new("mysql", request_ts, src, dst);
        event.set_status(!msg.is_error);
        event.responsetime = responsetime;
        event.method = method;
        event.query = Some(query.clone());
        event.request_raw = Some(query);
        if !raw.is_empty() {
            let (fields, rows) = parse_response_rows(raw);
            event.response_raw = Some(dump_csv(&fields, &rows));
        }
        event.details.insert("mysql".into(), Value::Object(mysql));
        ctx.publisher.publish(event);
    }
}
