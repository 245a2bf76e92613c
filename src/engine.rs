//! The parser actor: owns the flow table, the four protocol analyzers,
//! the timer service and the publisher handle. All parser state is
//! mutated from here, one packet at a time, in capture order. Timer
//! expiry and idle eviction are driven by [`Engine::on_tick`], never by
//! background threads.

use crate::config::{ports_or_default, Config};
use crate::flow::{FlowTable, ParserSlot};
use crate::http::HttpAnalyzer;
use crate::mysql::MysqlAnalyzer;
use crate::net::{Direction, IpPortTuple, NoProcessLookup, ProcessLookup, Protocol};
use crate::publish::{EventQueue, NameResolver, NoNames, Publisher};
use crate::redis::RedisAnalyzer;
use crate::thrift::ThriftAnalyzer;
use crate::timer::TimerService;
use log::{debug, warn};
use time::OffsetDateTime;

const DEFAULT_HTTP_PORTS: &[u16] = &[80, 8080];
const DEFAULT_MYSQL_PORTS: &[u16] = &[3306];
const DEFAULT_REDIS_PORTS: &[u16] = &[6379];
const DEFAULT_THRIFT_PORTS: &[u16] = &[9090];

/// Named counters exposed by the engine. Resource-exhaustion and parse
/// failures are counted here instead of escaping as errors.
#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub packets: u64,
    pub bytes: u64,
    pub unknown_port_packets: u64,
    pub stream_overflow_drops: u64,
    pub parse_errors: u64,
    pub transaction_timeouts: u64,
    pub orphan_responses: u64,
    pub flows_created: u64,
    pub flows_evicted: u64,
}

/// Context handles passed by reference into the protocol analyzers.
pub struct Ctx<'a> {
    pub timers: &'a mut TimerService,
    pub publisher: &'a mut Publisher,
    pub stats: &'a mut Stats,
    pub procs: &'a dyn ProcessLookup,
}

pub struct Engine {
    config: Config,
    flows: FlowTable,
    http: HttpAnalyzer,
    mysql: MysqlAnalyzer,
    redis: RedisAnalyzer,
    thrift: ThriftAnalyzer,
    timers: TimerService,
    publisher: Publisher,
    procs: Box<dyn ProcessLookup>,
    http_ports: Vec<u16>,
    mysql_ports: Vec<u16>,
    redis_ports: Vec<u16>,
    thrift_ports: Vec<u16>,
    pub stats: Stats,
}

impl Engine {
    pub fn new(config: Config) -> (Self, EventQueue) {
        Self::with_hooks(config, Box::new(NoNames), Box::new(NoProcessLookup))
    }

    /// Build an engine with explicit topology and process lookup seams.
    pub fn with_hooks(
        mut config: Config,
        resolver: Box<dyn NameResolver>,
        procs: Box<dyn ProcessLookup>,
    ) -> (Self, EventQueue) {
        config.normalize();
        let (publisher, queue) = Publisher::new(&config, resolver);
        let http_ports = if config.protocols.http.ports.is_empty() {
            DEFAULT_HTTP_PORTS.to_vec()
        } else {
            config.protocols.http.ports.clone()
        };
        let engine = Self {
            http: HttpAnalyzer::new(&config),
            mysql: MysqlAnalyzer::new(&config),
            redis: RedisAnalyzer::new(&config),
            thrift: ThriftAnalyzer::new(&config),
            flows: FlowTable::new(),
            timers: TimerService::new(),
            publisher,
            procs,
            http_ports,
            mysql_ports: ports_or_default(&config.protocols.mysql, DEFAULT_MYSQL_PORTS),
            redis_ports: ports_or_default(&config.protocols.redis, DEFAULT_REDIS_PORTS),
            thrift_ports: ports_or_default(&config.protocols.thrift, DEFAULT_THRIFT_PORTS),
            stats: Stats::default(),
            config,
        };
        (engine, queue)
    }

    /// Port-based protocol classifier, applied to the first packet of a
    /// flow only.
    fn classify(&self, tuple: &IpPortTuple) -> Option<Protocol> {
        let hit = |ports: &[u16]| {
            ports.contains(&tuple.dst_port) || ports.contains(&tuple.src_port)
        };
        if hit(&self.http_ports) {
            Some(Protocol::Http)
        } else if hit(&self.mysql_ports) {
            Some(Protocol::Mysql)
        } else if hit(&self.redis_ports) {
            Some(Protocol::Redis)
        } else if hit(&self.thrift_ports) {
            Some(Protocol::Thrift)
        } else {
            None
        }
    }

    /// Feed one TCP segment's payload, in capture order.
    pub fn on_packet(
        &mut self,
        ts: OffsetDateTime,
        tuple: IpPortTuple,
        dir: Direction,
        payload: &[u8],
    ) {
        self.stats.packets += 1;
        self.stats.bytes += payload.len() as u64;
        if payload.is_empty() {
            return;
        }

        if self.flows.get_mut(&tuple).is_none() {
            let protocol = match self.classify(&tuple) {
                Some(protocol) => protocol,
                None => {
                    self.stats.unknown_port_packets += 1;
                    return;
                }
            };
            self.flows.create(tuple, protocol, ts);
            self.stats.flows_created += 1;
        }
        let flow = match self.flows.get_mut(&tuple) {
            Some(flow) => flow,
            None => return,
        };
        flow.last_seen = ts;
        let protocol = flow.protocol;
        let idx = dir.index();

        flow.dirs[idx]
            .get_or_insert_with(|| ParserSlot::new(protocol))
            .buf_mut()
            .append(payload);
        let max_stream_bytes = self.config.max_stream_bytes;
        let too_big = flow.dirs[idx]
            .as_ref()
            .map_or(false, |slot| slot.buf().len() > max_stream_bytes);
        if too_big {
            warn!("stream data too large on {}; dropping direction", flow.tuple);
            flow.dirs[idx] = None;
            self.stats.stream_overflow_drops += 1;
            return;
        }

        let four = flow.tuple;
        let mut ctx = Ctx {
            timers: &mut self.timers,
            publisher: &mut self.publisher,
            stats: &mut self.stats,
            procs: self.procs.as_ref(),
        };
        let result = match flow.dirs[idx].as_mut() {
            Some(ParserSlot::Http(stream)) => self.http.on_data(&four, dir, stream, ts, &mut ctx),
            Some(ParserSlot::Mysql(stream)) => self.mysql.on_data(&four, dir, stream, ts, &mut ctx),
            Some(ParserSlot::Redis(stream)) => self.redis.on_data(&four, dir, stream, ts, &mut ctx),
            Some(ParserSlot::Thrift(stream)) => {
                self.thrift.on_data(&four, dir, stream, ts, &mut ctx)
            }
            None => Ok(()),
        };
        if let Err(err) = result {
            debug!("{}; dropping direction buffer", err);
            flow.dirs[idx] = None;
            self.stats.parse_errors += 1;
        }
    }

    /// The capture layer saw a FIN (or RST) for one direction.
    pub fn on_fin(&mut self, tuple: &IpPortTuple, dir: Direction) {
        let flow = match self.flows.get_mut(tuple) {
            Some(flow) => flow,
            None => return,
        };
        let idx = dir.index();
        let four = flow.tuple;
        if let Some(ParserSlot::Http(stream)) = flow.dirs[idx].as_mut() {
            // Residual close-delimited messages flush before the drop.
            let mut ctx = Ctx {
                timers: &mut self.timers,
                publisher: &mut self.publisher,
                stats: &mut self.stats,
                procs: self.procs.as_ref(),
            };
            self.http.on_fin(&four, dir, stream, &mut ctx);
        }
        flow.dirs[idx] = None;
        if flow.is_drained() {
            self.flows.remove(tuple);
        }
    }

    /// Fire due transaction deadlines and evict idle flows.
    pub fn on_tick(&mut self, now: OffsetDateTime) {
        for (timer, key) in self.timers.poll_expired(now) {
            let removed = match key.protocol {
                Protocol::Http => self.http.expire(&key.tuple, timer),
                Protocol::Mysql => self.mysql.expire(&key.tuple, timer),
                Protocol::Redis => self.redis.expire(&key.tuple, timer),
                Protocol::Thrift => self.thrift.expire(&key.tuple, timer),
            };
            if removed {
                debug!("transaction on {} timed out", key.tuple);
                self.stats.transaction_timeouts += 1;
            }
        }
        let cutoff = now - self.config.flow_ttl();
        let evicted = self.flows.evict_idle(cutoff);
        self.stats.flows_evicted += evicted as u64;
    }

    /// Drop all pending state. Queued events stay for the consumer.
    pub fn shutdown(&mut self) {
        self.http.clear(&mut self.timers);
        self.mysql.clear(&mut self.timers);
        self.redis.clear(&mut self.timers);
        self.thrift.clear(&mut self.timers);
        self.timers.clear();
        self.flows.clear();
    }

    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    pub fn pending_transactions(&self) -> usize {
        self.http.pending_transactions()
            + self.mysql.pending_transactions()
            + self.redis.pending_transactions()
            + self.thrift.pending_transactions()
    }

    pub fn events_published(&self) -> u64 {
        self.publisher.published
    }

    pub fn events_dropped(&self) -> u64 {
        self.publisher.dropped
    }
}
