//! Flow tracking: one entry per TCP connection, holding the per-direction
//! parser slots. The protocol binding is decided once, when the flow is
//! first seen, and persists for its life.

use crate::http::HttpStream;
use crate::mysql::MysqlStream;
use crate::net::{FourTuple, IpPortTuple, Protocol};
use crate::redis::RedisStream;
use crate::stream::StreamBuffer;
use crate::thrift::ThriftStream;
use std::collections::HashMap;
use time::OffsetDateTime;

/// Per-direction parser state for the flow's bound protocol.
#[derive(Debug)]
pub enum ParserSlot {
    Http(HttpStream),
    Mysql(MysqlStream),
    Redis(RedisStream),
    Thrift(ThriftStream),
}

impl ParserSlot {
    pub fn new(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Http => ParserSlot::Http(HttpStream::new()),
            Protocol::Mysql => ParserSlot::Mysql(MysqlStream::new()),
            Protocol::Redis => ParserSlot::Redis(RedisStream::new()),
            Protocol::Thrift => ParserSlot::Thrift(ThriftStream::new()),
        }
    }

    pub fn buf(&self) -> &StreamBuffer {
        match self {
            ParserSlot::Http(s) => &s.buf,
            ParserSlot::Mysql(s) => &s.buf,
            ParserSlot::Redis(s) => &s.buf,
            ParserSlot::Thrift(s) => &s.buf,
        }
    }

    pub fn buf_mut(&mut self) -> &mut StreamBuffer {
        match self {
            ParserSlot::Http(s) => &mut s.buf,
            ParserSlot::Mysql(s) => &mut s.buf,
            ParserSlot::Redis(s) => &mut s.buf,
            ParserSlot::Thrift(s) => &mut s.buf,
        }
    }
}

/// Per-connection aggregate.
#[derive(Debug)]
pub struct Flow {
    pub tuple: FourTuple,
    pub protocol: Protocol,
    pub dirs: [Option<ParserSlot>; 2],
    pub last_seen: OffsetDateTime,
}

impl Flow {
    /// True once both directions are gone.
    pub fn is_drained(&self) -> bool {
        self.dirs.iter().all(Option::is_none)
    }
}

#[derive(Debug, Default)]
pub struct FlowTable {
    flows: HashMap<IpPortTuple, Flow>,
    next_stream_id: u64,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_mut(&mut self, tuple: &IpPortTuple) -> Option<&mut Flow> {
        self.flows.get_mut(tuple)
    }

    /// Create the entry for a newly seen connection, assigning it the next
    /// stream id.
    pub fn create(&mut self, tuple: IpPortTuple, protocol: Protocol, now: OffsetDateTime) {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.flows.insert(
            tuple,
            Flow {
                tuple: FourTuple {
                    ip: tuple,
                    stream_id,
                },
                protocol,
                dirs: [None, None],
                last_seen: now,
            },
        );
    }

    pub fn remove(&mut self, tuple: &IpPortTuple) -> Option<Flow> {
        self.flows.remove(tuple)
    }

    /// Drop flows silent since before `cutoff`; returns how many went.
    pub fn evict_idle(&mut self, cutoff: OffsetDateTime) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, flow| flow.last_seen >= cutoff);
        before - self.flows.len()
    }

    pub fn clear(&mut self) {
        self.flows.clear();
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use time::Duration;

    fn tuple(src_port: u16) -> IpPortTuple {
        IpPortTuple::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            src_port,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
        )
    }

    #[test]
    fn stream_ids_are_monotonic() {
        let mut flows = FlowTable::new();
        let now = OffsetDateTime::UNIX_EPOCH;
        flows.create(tuple(1), Protocol::Http, now);
        flows.create(tuple(2), Protocol::Redis, now);
        let a = flows.get_mut(&tuple(1)).unwrap().tuple.stream_id;
        let b = flows.get_mut(&tuple(2)).unwrap().tuple.stream_id;
        assert!(b > a);
    }

    #[test]
    fn reused_tuple_gets_a_fresh_stream_id() {
        let mut flows = FlowTable::new();
        let now = OffsetDateTime::UNIX_EPOCH;
        flows.create(tuple(1), Protocol::Http, now);
        let first = flows.get_mut(&tuple(1)).unwrap().tuple;
        flows.remove(&tuple(1));
        flows.create(tuple(1), Protocol::Http, now);
        let second = flows.get_mut(&tuple(1)).unwrap().tuple;
        assert_ne!(first, second);
    }

    #[test]
    fn idle_flows_are_evicted() {
        let mut flows = FlowTable::new();
        let t0 = OffsetDateTime::UNIX_EPOCH;
        flows.create(tuple(1), Protocol::Http, t0);
        flows.create(tuple(2), Protocol::Http, t0 + Duration::seconds(60));
        assert_eq!(flows.evict_idle(t0 + Duration::seconds(30)), 1);
        assert!(flows.get_mut(&tuple(1)).is_none());
        assert!(flows.get_mut(&tuple(2)).is_some());
    }
}
