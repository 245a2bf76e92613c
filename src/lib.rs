//! Passive TCP application-transaction analyzer.
//!
//! Reassembled per-direction byte streams go in; one structured event per
//! correlated request/response pair comes out. The crate is the protocol
//! parsing and correlation core only: packet capture, TCP reassembly and
//! concrete output sinks are external collaborators behind the seams in
//! [`engine::Engine`] and [`publish`].
//!
//! Supported protocols: HTTP/1.x, MySQL, Redis (RESP) and Thrift binary.
//! Each parser is an incremental state machine over a per-direction
//! [`stream::StreamBuffer`]: it makes forward progress on partial input
//! without re-scanning, and a malformed stream only ever costs its own
//! direction's buffer.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod flow;
pub mod http;
pub mod mysql;
pub mod net;
pub mod publish;
pub mod redis;
pub mod stream;
pub mod table;
pub mod thrift;
pub mod timer;
pub mod transactions;
pub mod util;

pub use config::Config;
pub use engine::{Engine, Stats};
pub use error::{Error, Result};
pub use event::Event;
pub use net::{Direction, Endpoint, FourTuple, IpPortTuple, Protocol};
pub use publish::EventQueue;
