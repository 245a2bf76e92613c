#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use tapwire::{Config, Direction, Engine, EventQueue, IpPortTuple};
use time::{Duration, OffsetDateTime};

pub const HTTP_PORT: u16 = 80;
pub const MYSQL_PORT: u16 = 3306;
pub const REDIS_PORT: u16 = 6379;
pub const THRIFT_PORT: u16 = 9090;

pub fn tuple_to(dst_port: u16) -> IpPortTuple {
    tuple_between(40112, dst_port)
}

pub fn tuple_between(src_port: u16, dst_port: u16) -> IpPortTuple {
    IpPortTuple::new(
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, 10)),
        src_port,
        IpAddr::V4(Ipv4Addr::new(192, 168, 0, 20)),
        dst_port,
    )
}

pub fn engine() -> (Engine, EventQueue) {
    Engine::new(Config::default())
}

pub fn at_ms(ms: i64) -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::milliseconds(ms)
}

pub fn request(engine: &mut Engine, tuple: IpPortTuple, ms: i64, payload: &[u8]) {
    engine.on_packet(at_ms(ms), tuple, Direction::Forward, payload);
}

pub fn response(engine: &mut Engine, tuple: IpPortTuple, ms: i64, payload: &[u8]) {
    engine.on_packet(at_ms(ms), tuple, Direction::Reverse, payload);
}

/// A MySQL packet: `[len:3 LE][seq:1][payload]`.
pub fn mysql_packet(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = vec![
        (len & 0xff) as u8,
        ((len >> 8) & 0xff) as u8,
        ((len >> 16) & 0xff) as u8,
        seq,
    ];
    out.extend_from_slice(payload);
    out
}

/// A one-byte-length MySQL length-coded string.
pub fn mysql_lenenc_str(text: &[u8]) -> Vec<u8> {
    let mut out = vec![text.len() as u8];
    out.extend_from_slice(text);
    out
}
