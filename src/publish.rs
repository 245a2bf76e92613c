//! Publisher seam between the parser actor and the sink side.
//!
//! The core never talks to a sink directly: completed events are enriched
//! (server names, duplicate suppression) and pushed onto a bounded queue.
//! The consumer half is handed out at construction and drained by the
//! sink actor at its own pace. When the queue saturates the oldest event
//! is displaced and counted, never the parser blocked.

use crate::config::Config;
use crate::event::Event;
use crossbeam_queue::ArrayQueue;
use log::{debug, warn};
use std::net::IpAddr;
use std::sync::Arc;

/// Reverse lookup from peer IP to agent name, fed by the (external)
/// topology cache. The default resolves nothing.
pub trait NameResolver {
    fn get_name_by_ip(&self, ip: &str) -> Option<String>;
}

/// Resolver that knows no peers.
#[derive(Debug, Default)]
pub struct NoNames;

impl NameResolver for NoNames {
    fn get_name_by_ip(&self, _ip: &str) -> Option<String> {
        None
    }
}

/// Consumer half of the publisher queue.
#[derive(Clone)]
pub struct EventQueue {
    queue: Arc<ArrayQueue<Event>>,
}

impl EventQueue {
    pub fn pop(&self) -> Option<Event> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Producer half, owned by the parser actor.
pub struct Publisher {
    agent_name: String,
    ignore_outgoing: bool,
    queue: Arc<ArrayQueue<Event>>,
    resolver: Box<dyn NameResolver>,
    pub published: u64,
    pub dropped: u64,
    pub suppressed: u64,
}

impl Publisher {
    pub fn new(config: &Config, resolver: Box<dyn NameResolver>) -> (Self, EventQueue) {
        let queue = Arc::new(ArrayQueue::new(config.queue_size.max(1)));
        let consumer = EventQueue {
            queue: Arc::clone(&queue),
        };
        let publisher = Self {
            agent_name: config.agent.name.clone(),
            ignore_outgoing: config.agent.ignore_outgoing,
            queue,
            resolver,
            published: 0,
            dropped: 0,
            suppressed: 0,
        };
        (publisher, consumer)
    }

    /// Name of the agent behind `ip`: ourselves for loopback addresses,
    /// otherwise whatever the resolver knows.
    fn server_name(&self, ip: &str) -> String {
        match ip.parse::<IpAddr>() {
            Ok(addr) if addr.is_loopback() => self.agent_name.clone(),
            Ok(_) => self.resolver.get_name_by_ip(ip).unwrap_or_default(),
            Err(_) => {
                warn!("unparseable endpoint ip {:?}", ip);
                String::new()
            }
        }
    }

    /// Enrich and enqueue one completed transaction event.
    pub fn publish(&mut self, mut event: Event) {
        event.src.server = self.server_name(&event.src.ip);
        event.dst.server = self.server_name(&event.dst.ip);

        if self.ignore_outgoing
            && !event.dst.server.is_empty()
            && event.dst.server != self.agent_name
        {
            // The receiving agent will report this transaction itself.
            debug!(
                "suppressing duplicated {} transaction towards {}",
                event.kind, event.dst.server
            );
            self.suppressed += 1;
            return;
        }

        if self.queue.force_push(event).is_some() {
            self.dropped += 1;
        }
        self.published += 1;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::Endpoint;
    use time::OffsetDateTime;

    fn endpoint(ip: &str) -> Endpoint {
        Endpoint {
            ip: ip.to_string(),
            port: 80,
            proc: String::new(),
            server: String::new(),
        }
    }

    fn event(src: &str, dst: &str) -> Event {
        Event::new(
            "http",
            OffsetDateTime::UNIX_EPOCH,
            endpoint(src),
            endpoint(dst),
        )
    }

    struct StaticNames;
    impl NameResolver for StaticNames {
        fn get_name_by_ip(&self, ip: &str) -> Option<String> {
            (ip == "10.0.0.9").then(|| "peer-agent".to_string())
        }
    }

    fn config_with(ignore_outgoing: bool) -> Config {
        let mut config = Config::default();
        config.agent.name = "this-agent".into();
        config.agent.ignore_outgoing = ignore_outgoing;
        config.queue_size = 2;
        config
    }

    #[test]
    fn enriches_server_names() {
        let (mut publisher, queue) = Publisher::new(&config_with(false), Box::new(StaticNames));
        publisher.publish(event("127.0.0.1", "10.0.0.9"));
        let out = queue.pop().unwrap();
        assert_eq!(out.src.server, "this-agent");
        assert_eq!(out.dst.server, "peer-agent");
    }

    #[test]
    fn ignore_outgoing_suppresses_peer_bound_events() {
        let (mut publisher, queue) = Publisher::new(&config_with(true), Box::new(StaticNames));
        publisher.publish(event("10.0.0.1", "10.0.0.9"));
        assert!(queue.is_empty());
        assert_eq!(publisher.suppressed, 1);
        assert_eq!(publisher.published, 0);

        // Unknown destinations still publish.
        publisher.publish(event("10.0.0.1", "10.0.0.8"));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn saturation_displaces_the_oldest() {
        let (mut publisher, queue) = Publisher::new(&config_with(false), Box::new(NoNames));
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            publisher.publish(event(ip, "10.0.0.99"));
        }
        assert_eq!(publisher.dropped, 1);
        assert_eq!(queue.pop().unwrap().src.ip, "10.0.0.2");
        assert_eq!(queue.pop().unwrap().src.ip, "10.0.0.3");
        assert!(queue.pop().is_none());
    }
}
