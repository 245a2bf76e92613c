//! End-to-end scenarios: capture-order payloads in, one event per
//! completed transaction out.

mod common;

use common::*;
use tapwire::{Config, Direction, Engine};

#[test]
fn http_basic_get_200() {
    let (mut engine, queue) = engine();
    let tuple = tuple_to(HTTP_PORT);
    request(&mut engine, tuple, 0, b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
    response(
        &mut engine,
        tuple,
        7,
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
    );

    let event = queue.pop().expect("one event");
    assert_eq!(event.kind, "http");
    assert_eq!(event.method, "GET");
    assert_eq!(event.path, "/a");
    assert_eq!(event.status, "OK");
    assert_eq!(event.responsetime, 7);
    assert_eq!(event.details["http"]["code"], 200);
    assert_eq!(event.details["http"]["phrase"], "OK");
    assert_eq!(event.src.port, 40112);
    assert_eq!(event.dst.port, HTTP_PORT);
    assert!(queue.pop().is_none());
}

#[test]
fn http_chunked_response() {
    let (mut engine, queue) = engine();
    let tuple = tuple_to(HTTP_PORT);
    request(&mut engine, tuple, 0, b"GET /c HTTP/1.1\r\nHost: x\r\n\r\n");
    response(
        &mut engine,
        tuple,
        3,
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    );

    let event = queue.pop().expect("one event");
    assert_eq!(event.status, "OK");
    // The reassembled chunk data is the body: 5 bytes.
    assert_eq!(event.details["http"]["content_length"], 5);
    assert!(queue.pop().is_none());
}

#[test]
fn http_10_close_delimited_completes_on_fin() {
    let (mut engine, queue) = engine();
    let tuple = tuple_to(HTTP_PORT);
    request(&mut engine, tuple, 0, b"GET /x HTTP/1.0\r\nHost: x\r\n\r\n");
    response(
        &mut engine,
        tuple,
        2,
        b"HTTP/1.0 200 OK\r\nConnection: close\r\n\r\nbody",
    );
    assert!(queue.is_empty());

    engine.on_fin(&tuple, Direction::Reverse);
    let event = queue.pop().expect("event flushed on fin");
    assert_eq!(event.status, "OK");
    assert_eq!(event.details["http"]["content_length"], 4);
}

#[test]
fn http_close_delimited_body_lands_in_the_raw() {
    let mut config = Config::default();
    config.protocols.http.include_body_for = vec!["html".to_string()];
    let (mut engine, queue) = Engine::new(config);
    let tuple = tuple_to(HTTP_PORT);
    request(&mut engine, tuple, 0, b"GET /x HTTP/1.0\r\nHost: x\r\n\r\n");
    response(
        &mut engine,
        tuple,
        2,
        b"HTTP/1.0 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\nbody",
    );
    engine.on_fin(&tuple, Direction::Reverse);

    let event = queue.pop().expect("event flushed on fin");
    let raw = event.response_raw.expect("raw captured");
    assert!(raw.ends_with("body"));
}

#[test]
fn redis_set_round_trip() {
    let (mut engine, queue) = engine();
    let tuple = tuple_to(REDIS_PORT);
    let wire =
        hex::decode("2a330d0a24330d0a5345540d0a24340d0a6b6579310d0a24350d0a48656c6c6f0d0a")
            .unwrap();
    request(&mut engine, tuple, 0, &wire);
    response(&mut engine, tuple, 1, b"+OK\r\n");

    let event = queue.pop().expect("one event");
    assert_eq!(event.kind, "redis");
    assert_eq!(event.method, "SET");
    assert_eq!(event.path, "key1");
    assert_eq!(event.query.as_deref(), Some("SET key1 Hello"));
    assert_eq!(event.status, "OK");
    assert_eq!(event.response_raw.as_deref(), Some("OK"));
    assert_eq!(event.bytes_in, Some(wire.len() as u64));
    assert_eq!(event.bytes_out, Some(5));
}

#[test]
fn redis_error_reply_marks_the_transaction() {
    let (mut engine, queue) = engine();
    let tuple = tuple_to(REDIS_PORT);
    request(
        &mut engine,
        tuple,
        0,
        b"*2\r\n$3\r\nGET\r\n$4\r\nkey1\r\n",
    );
    response(&mut engine, tuple, 1, b"-ERR wrong type\r\n");

    let event = queue.pop().expect("one event");
    assert_eq!(event.status, "Error");
    assert_eq!(event.details["redis"]["error"], "ERR wrong type");
}

#[test]
fn mysql_query_with_two_row_result() {
    let (mut engine, queue) = engine();
    let tuple = tuple_to(MYSQL_PORT);

    let mut query = vec![0x03];
    query.extend_from_slice(b"SELECT 1");
    request(&mut engine, tuple, 0, &mysql_packet(0, &query));

    let mut wire = mysql_packet(1, &[0x01]); // one column
    let mut field = Vec::new();
    field.extend_from_slice(&mysql_lenenc_str(b"def"));
    field.extend_from_slice(&mysql_lenenc_str(b"db"));
    field.extend_from_slice(&mysql_lenenc_str(b"tbl"));
    field.extend_from_slice(&mysql_lenenc_str(b"tbl"));
    field.extend_from_slice(&mysql_lenenc_str(b"one"));
    field.extend_from_slice(&mysql_lenenc_str(b"one"));
    wire.extend_from_slice(&mysql_packet(2, &field));
    wire.extend_from_slice(&mysql_packet(3, &[0xfe, 0, 0, 0, 0]));
    wire.extend_from_slice(&mysql_packet(4, &mysql_lenenc_str(b"1")));
    wire.extend_from_slice(&mysql_packet(5, &mysql_lenenc_str(b"1")));
    wire.extend_from_slice(&mysql_packet(6, &[0xfe, 0, 0, 0, 0]));
    response(&mut engine, tuple, 4, &wire);

    let event = queue.pop().expect("one event");
    assert_eq!(event.kind, "mysql");
    assert_eq!(event.method, "SELECT");
    assert_eq!(event.status, "OK");
    assert_eq!(event.details["mysql"]["num_rows"], 2);
    assert_eq!(event.details["mysql"]["isok"], true);
    assert_eq!(event.details["mysql"]["num_fields"], 1);
    assert_eq!(event.details["mysql"]["tables"], "db.tbl");
    assert_eq!(event.response_raw.as_deref(), Some("one\n1\n1\n"));
}

#[test]
fn thrift_strict_ping_round_trip() {
    let (mut engine, queue) = engine();
    let tuple = tuple_to(THRIFT_PORT);

    let call = hex::decode("800100010000000470696e670000000000").unwrap();
    request(&mut engine, tuple, 0, &call);

    let mut reply = Vec::new();
    reply.extend_from_slice(&[0x80, 0x01, 0x00, 0x02]);
    reply.extend_from_slice(b"\x00\x00\x00\x04ping");
    reply.extend_from_slice(&[0, 0, 0, 0]); // seq
    reply.push(0); // stop
    response(&mut engine, tuple, 2, &reply);

    let event = queue.pop().expect("one event");
    assert_eq!(event.kind, "thrift");
    assert_eq!(event.method, "ping");
    assert_eq!(event.status, "OK");
    assert_eq!(event.request_raw.as_deref(), Some("ping()"));
}

#[test]
fn password_fields_are_censored_in_the_request_raw() {
    let mut config = Config::default();
    config.passwords.hide_keywords = vec!["pass=".to_string()];
    config.protocols.http.include_body_for = vec!["urlencoded".to_string()];
    let (mut engine, queue) = Engine::new(config);
    let tuple = tuple_to(HTTP_PORT);

    request(
        &mut engine,
        tuple,
        0,
        b"POST /login HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 22\r\n\r\nuser=admin&pass=hunter",
    );
    response(
        &mut engine,
        tuple,
        3,
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    );

    let event = queue.pop().expect("one event");
    let raw = event.request_raw.expect("raw captured");
    assert!(raw.contains("user=admin"), "raw: {}", raw);
    assert!(!raw.contains("hunter"), "raw: {}", raw);
    assert!(raw.contains("pass=******"), "raw: {}", raw);
}

#[test]
fn header_whitelist_and_cookie_splitting() {
    let mut config = Config::default();
    config.protocols.http.send_headers = vec!["cookie".to_string(), "host".to_string()];
    config.protocols.http.split_cookie = true;
    let (mut engine, queue) = Engine::new(config);
    let tuple = tuple_to(HTTP_PORT);

    request(
        &mut engine,
        tuple,
        0,
        b"GET / HTTP/1.1\r\nHost: x\r\nUser-Agent: probe\r\nCookie: SID=abc; theme=dark\r\n\r\n",
    );
    response(
        &mut engine,
        tuple,
        1,
        b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
    );

    let event = queue.pop().expect("one event");
    let headers = &event.details["http"]["request_headers"];
    assert_eq!(headers["host"], "x");
    assert!(headers.get("user-agent").is_none());
    assert_eq!(headers["cookie"]["sid"], "abc");
    assert_eq!(headers["cookie"]["theme"], "dark");
}

#[test]
fn real_ip_header_surfaces_in_the_event() {
    let mut config = Config::default();
    config.protocols.http.real_ip_header = "X-Forwarded-For".to_string();
    let (mut engine, queue) = Engine::new(config);
    let tuple = tuple_to(HTTP_PORT);

    request(
        &mut engine,
        tuple,
        0,
        b"GET / HTTP/1.1\r\nHost: x\r\nX-Forwarded-For: 203.0.113.9\r\n\r\n",
    );
    response(
        &mut engine,
        tuple,
        1,
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
    );

    let event = queue.pop().expect("one event");
    assert_eq!(event.real_ip.as_deref(), Some("203.0.113.9"));
    assert_eq!(event.status, "Error");
    assert_eq!(event.details["http"]["code"], 404);
}
