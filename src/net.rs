use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

/// Application protocols the analyzer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Mysql,
    Redis,
    Thrift,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Mysql => "mysql",
            Protocol::Redis => "redis",
            Protocol::Thrift => "thrift",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of a payload relative to the flow's initiator.
///
/// Established by the capture layer when the flow is first seen and never
/// re-detected here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// The wire identity of a TCP connection, as delivered by the capture
/// layer. Always oriented the same way for both directions of one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPortTuple {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl IpPortTuple {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }
}

impl fmt::Display for IpPortTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Flow identity: the wire tuple plus a monotonically assigned stream id,
/// so a reused port pair never collides with a dead flow's transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub ip: IpPortTuple,
    pub stream_id: u64,
}

impl fmt::Display for FourTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (stream {})", self.ip, self.stream_id)
    }
}

/// Display information for one side of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    pub proc: String,
    pub server: String,
}

/// Socket-to-process attribution seam. Attribution itself is out of scope;
/// the default implementation reports nothing.
pub trait ProcessLookup {
    /// Process names for the (initiator, responder) sides of the tuple.
    fn processes_for(&self, tuple: &IpPortTuple) -> (String, String);
}

/// Lookup that attributes no processes.
#[derive(Debug, Default)]
pub struct NoProcessLookup;

impl ProcessLookup for NoProcessLookup {
    fn processes_for(&self, _tuple: &IpPortTuple) -> (String, String) {
        (String::new(), String::new())
    }
}

/// Build the (src, dst) endpoint pair for a message that arrived in `dir`.
///
/// `src` is always the side that sent the message, so the pair is swapped
/// when the message travelled against the flow orientation.
pub fn endpoints(
    tuple: &IpPortTuple,
    dir: Direction,
    procs: &dyn ProcessLookup,
) -> (Endpoint, Endpoint) {
    let (src_proc, dst_proc) = procs.processes_for(tuple);
    let src = Endpoint {
        ip: tuple.src_ip.to_string(),
        port: tuple.src_port,
        proc: src_proc,
        server: String::new(),
    };
    let dst = Endpoint {
        ip: tuple.dst_ip.to_string(),
        port: tuple.dst_port,
        proc: dst_proc,
        server: String::new(),
    };
    match dir {
        Direction::Forward => (src, dst),
        Direction::Reverse => (dst, src),
    }
}
