//! Redis (RESP) analyzer.
//!
//! Frames one logical reply at a time from either direction. A multi-bulk
//! reply whose first bulk is a known command name is a request; everything
//! else is a response.

use crate::config::Config;
use crate::engine::Ctx;
use crate::error::{Error, Progress, Result};
use crate::event::Event;
use crate::net::{endpoints, Direction, Endpoint, FourTuple, Protocol};
use crate::stream::StreamBuffer;
use crate::timer::{TimerId, TimerService};
use crate::transactions::TransactionMap;
use crate::util::{lossy, read_crlf_line};
use lazy_static::lazy_static;
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use time::OffsetDateTime;

lazy_static! {
    /// Command names that mark a multi-bulk reply as a request.
    static ref REDIS_COMMANDS: HashSet<&'static str> = [
        "APPEND", "AUTH", "BGREWRITEAOF", "BGSAVE", "BITCOUNT", "BITOP", "BITPOS", "BLPOP",
        "BRPOP", "BRPOPLPUSH", "CLIENT GETNAME", "CLIENT KILL", "CLIENT LIST", "CLIENT PAUSE",
        "CLIENT SETNAME", "CONFIG GET", "CONFIG RESETSTAT", "CONFIG REWRITE", "CONFIG SET",
        "DBSIZE", "DEBUG OBJECT", "DEBUG SEGFAULT", "DECR", "DECRBY", "DEL", "DISCARD", "DUMP",
        "ECHO", "EVAL", "EVALSHA", "EXEC", "EXISTS", "EXPIRE", "EXPIREAT", "FLUSHALL", "FLUSHDB",
        "GET", "GETBIT", "GETRANGE", "GETSET", "HDEL", "HEXISTS", "HGET", "HGETALL", "HINCRBY",
        "HINCRBYFLOAT", "HKEYS", "HLEN", "HMGET", "HMSET", "HSCAN", "HSET", "HSETINX", "HVALS",
        "INCR", "INCRBY", "INCRBYFLOAT", "INFO", "KEYS", "LASTSAVE", "LINDEX", "LINSERT", "LLEN",
        "LPOP", "LPUSH", "LPUSHX", "LRANGE", "LREM", "LSET", "LTRIM", "MGET", "MIGRATE",
        "MONITOR", "MOVE", "MSET", "MSETNX", "MULTI", "OBJECT", "PERSIST", "PEXPIRE",
        "PEXPIREAT", "PFADD", "PFCOUNT", "PFMERGE", "PING", "PSETEX", "PSUBSCRIBE", "PTTL",
        "PUBLISH", "PUBSUB", "PUNSUBSCRIBE", "QUIT", "RANDOMKEY", "RENAME", "RENAMENX",
        "RESTORE", "RPOP", "RPOPLPUSH", "RPUSH", "RPUSHX", "SADD", "SAVE", "SCAN", "SCARD",
        "SCRIPT EXISTS", "SCRIPT FLUSH", "SCRIPT KILL", "SCRIPT LOAD", "SDIFF", "SDIFFSTORE",
        "SELECT", "SET", "SETBIT", "SETEX", "SETNX", "SETRANGE", "SHUTDOWN", "SINTER",
        "SINTERSTORE", "SISMEMBER", "SLAVEOF", "SLOWLOG", "SMEMBERS", "SMOVE", "SORT", "SPOP",
        "SRANDMEMBER", "SREM", "SSCAN", "STRLEN", "SUBSCRIBE", "SUNION", "SUNIONSTORE", "SYNC",
        "TIME", "TTL", "TYPE", "UNSUBSCRIBE", "UNWATCH", "WATCH", "ZADD", "ZCARD", "ZCOUNT",
        "ZINCRBY", "ZINTERSTORE", "ZRANGE", "ZRANGEBYSCORE", "ZRANK", "ZREM", "ZREMRANGEBYLEX",
        "ZREMRANGEBYRANK", "ZREMRANGEBYSCORE", "ZREVRANGE", "ZREVRANGEBYSCORE", "ZREVRANK",
        "ZSCAN", "ZSCORE", "ZUNIONSTORE",
    ]
    .iter()
    .copied()
    .collect();
}

fn is_redis_command(word: &str) -> bool {
    REDIS_COMMANDS.contains(word.to_ascii_uppercase().as_str())
}

/// One parsed reply.
#[derive(Debug)]
pub struct RedisMessage {
    pub ts: OffsetDateTime,
    number_of_bulks: i64,
    pub bulks: Vec<String>,
    pub is_request: bool,
    pub is_error: bool,
    pub message: String,
    pub method: String,
    pub path: String,
    /// Consumed bytes of this reply.
    pub size: usize,
}

impl RedisMessage {
    fn new(ts: OffsetDateTime) -> Self {
        Self {
            ts,
            number_of_bulks: 0,
            bulks: Vec::new(),
            is_request: false,
            is_error: false,
            message: String::new(),
            method: String::new(),
            path: String::new(),
            size: 0,
        }
    }
}

/// Per-direction RESP stream state.
#[derive(Debug)]
pub struct RedisStream {
    pub buf: StreamBuffer,
    message: Option<RedisMessage>,
}

impl RedisStream {
    pub fn new() -> Self {
        Self {
            buf: StreamBuffer::new(),
            message: None,
        }
    }

    pub fn parse(&mut self, ts: OffsetDateTime) -> Result<Option<RedisMessage>> {
        let mut msg = match self.message.take() {
            Some(msg) => msg,
            None => RedisMessage::new(ts),
        };
        match parse_message(&mut self.buf, &mut msg)? {
            Progress::Complete => {
                let consumed = self.buf.parse_offset();
                self.buf.compact(consumed);
                Ok(Some(msg))
            }
            Progress::More => {
                self.message = Some(msg);
                Ok(None)
            }
        }
    }
}

fn parse_message(buf: &mut StreamBuffer, msg: &mut RedisMessage) -> Result<Progress> {
    while buf.parse_offset() < buf.len() {
        let value = match buf.unparsed()[0] {
            b'*' => {
                let (line, consumed) = match read_crlf_line(buf.unparsed()) {
                    Some(found) => found,
                    None => return Ok(Progress::More),
                };
                if line == b"*-1" {
                    // Null multi-bulk reads as a nil scalar.
                    buf.advance(consumed);
                    "nil".to_string()
                } else {
                    let count = parse_resp_int(&line[1..])
                        .ok_or_else(|| Error::malformed("redis", "bad multi-bulk count"))?;
                    buf.advance(consumed);
                    msg.number_of_bulks = count;
                    msg.bulks = Vec::new();
                    if count == 0 {
                        // Empty array; nothing will follow for it.
                        msg.message = String::new();
                        msg.size = buf.parse_offset();
                        return Ok(Progress::Complete);
                    }
                    continue;
                }
            }
            b'$' => {
                let input = buf.unparsed();
                let (line, consumed) = match read_crlf_line(input) {
                    Some(found) => found,
                    None => return Ok(Progress::More),
                };
                if line == b"$-1" {
                    buf.advance(consumed);
                    "nil".to_string()
                } else {
                    let length = parse_resp_int(&line[1..])
                        .ok_or_else(|| Error::malformed("redis", "bad bulk length"))?;
                    if length < 0 {
                        return Err(Error::malformed("redis", "bad bulk length"));
                    }
                    let length = length as usize;
                    // The declared bytes plus their trailing CRLF.
                    if input.len() < consumed + length + 2 {
                        return Ok(Progress::More);
                    }
                    let bytes = &input[consumed..consumed + length];
                    if &input[consumed + length..consumed + length + 2] != b"\r\n" {
                        return Err(Error::malformed("redis", "bulk not CRLF terminated"));
                    }
                    let value = lossy(bytes);
                    buf.advance(consumed + length + 2);
                    value
                }
            }
            b':' => {
                let (line, consumed) = match read_crlf_line(buf.unparsed()) {
                    Some(found) => found,
                    None => return Ok(Progress::More),
                };
                let n = parse_resp_int(&line[1..])
                    .ok_or_else(|| Error::malformed("redis", "bad integer reply"))?;
                buf.advance(consumed);
                n.to_string()
            }
            b'+' => {
                let (line, consumed) = match read_crlf_line(buf.unparsed()) {
                    Some(found) => found,
                    None => return Ok(Progress::More),
                };
                let value = lossy(&line[1..]);
                buf.advance(consumed);
                value
            }
            b'-' => {
                let (line, consumed) = match read_crlf_line(buf.unparsed()) {
                    Some(found) => found,
                    None => return Ok(Progress::More),
                };
                msg.is_error = true;
                let value = lossy(&line[1..]);
                buf.advance(consumed);
                value
            }
            _ => return Err(Error::malformed("redis", "unexpected reply type byte")),
        };

        if msg.number_of_bulks > 0 {
            msg.number_of_bulks -= 1;
            msg.bulks.push(value);
            if msg.bulks.len() == 1 {
                // First bulk: a known command name marks a request.
                let first = &msg.bulks[0];
                if is_redis_command(first) {
                    debug!("redis request {}", first);
                    msg.is_request = true;
                    msg.method = first.clone();
                }
            }
            if msg.bulks.len() == 2 && msg.is_request {
                msg.path = msg.bulks[1].clone();
            }
            if msg.number_of_bulks == 0 {
                msg.message = msg.bulks.join(" ");
                msg.size = buf.parse_offset();
                return Ok(Progress::Complete);
            }
        } else {
            msg.message = value;
            msg.size = buf.parse_offset();
            return Ok(Progress::Complete);
        }
    }
    Ok(Progress::More)
}

/// Signed decimal integer as RESP writes them.
fn parse_resp_int(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

#[derive(Debug)]
struct RedisPending {
    method: String,
    path: String,
    query: String,
    bytes_in: usize,
    src: Endpoint,
    dst: Endpoint,
}

pub struct RedisAnalyzer {
    transactions: TransactionMap<RedisPending>,
}

impl RedisAnalyzer {
    pub fn new(config: &Config) -> Self {
        Self {
            transactions: TransactionMap::new(Protocol::Redis, config.transaction_timeout()),
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
        stream: &mut RedisStream,
        ts: OffsetDateTime,
        ctx: &mut Ctx<'_>,
    ) -> Result<()> {
        while let Some(msg) = stream.parse(ts)? {
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
        msg: RedisMessage,
        ctx: &mut Ctx<'_>,
    ) {
        let (src, dst) = endpoints(&tuple.ip, dir, ctx.procs);
        let pending = RedisPending {
            method: msg.method,
            path: msg.path,
            query: msg.message,
            bytes_in: msg.size,
            src,
            dst,
        };
        if self.transactions.begin(*tuple, pending, msg.ts, ctx.timers) {
            warn!("two redis requests without a response on {}; dropping the old one", tuple);
        }
    }

    fn on_response(&mut self, tuple: &FourTuple, msg: RedisMessage, ctx: &mut Ctx<'_>) {
        let pending = match self.transactions.resolve(tuple, ctx.timers) {
            Some(pending) => pending,
            None => {
                ctx.stats.orphan_responses += 1;
                warn!("redis response on {} without a request; ignoring", tuple);
                return;
            }
        };
        let responsetime = pending.response_time_ms(msg.ts);
        let request_ts = pending.ts;
        let RedisPending {
            method,
            path,
            query,
            bytes_in,
            src,
            dst,
        } = pending.request;

        let mut redis = Map::new();
        if msg.is_error {
            redis.insert("error".into(), json!(msg.message));
        } else {
            redis.insert("return_value".into(), json!(msg.message));
        }

        let mut event = Event::new("redis", request_ts, src, dst);
        event.set_status(!msg.is_error);
        event.responsetime = responsetime;
        event.method = method.to_ascii_uppercase();
        event.path = path;
        event.query = Some(query.clone());
        event.request_raw = Some(query);
        event.response_raw = Some(msg.message);
        event.bytes_in = Some(bytes_in as u64);
        event.bytes_out = Some(msg.size as u64);
        event.details.insert("redis".into(), Value::Object(redis));
        ctx.publisher.publish(event);
    }
}
