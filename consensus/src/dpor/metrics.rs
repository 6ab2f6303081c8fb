//! Metrics for the [`dpor`](super) state machine.

use super::types::{MsgCode, Phase};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

/// Message label for metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Message {
    pub message: MsgCode,
}

impl Message {
    pub fn new(message: MsgCode) -> Self {
        Self { message }
    }
}

/// Metrics tracked by the [`StateMachine`](super::StateMachine).
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    /// Messages stepped, by code.
    pub inbound: Family<Message, Counter>,
    /// Messages that produced an error, by code.
    pub rejected: Family<Message, Counter>,
    /// Blocks handed to the chain for insertion.
    pub finalized: Counter,
    /// Impeachment blocks proposed locally.
    pub impeachments: Counter,
    /// Blocks evicted from the block cache.
    pub evictions: Counter,
    /// Current phase (see [`Phase::id`]).
    pub phase: Gauge,
}

impl Metrics {
    /// Registers all metrics in `registry`.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "inbound_messages",
            "messages stepped",
            self.inbound.clone(),
        );
        registry.register(
            "rejected_messages",
            "messages that produced an error",
            self.rejected.clone(),
        );
        registry.register(
            "finalized_blocks",
            "blocks handed to the chain",
            self.finalized.clone(),
        );
        registry.register(
            "impeachments",
            "impeachment blocks proposed",
            self.impeachments.clone(),
        );
        registry.register(
            "cache_evictions",
            "blocks evicted from the block cache",
            self.evictions.clone(),
        );
        registry.register("phase", "current phase", self.phase.clone());
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.set(phase.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_register_and_encode() {
        let metrics = Metrics::default();
        let mut registry = Registry::default();
        metrics.register(&mut registry);

        metrics
            .inbound
            .get_or_create(&Message::new(MsgCode::Prepare))
            .inc();
        metrics.finalized.inc();
        metrics.set_phase(Phase::Prepared);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("inbound_messages_total{message=\"Prepare\"} 1"));
        assert!(buffer.contains("finalized_blocks_total 1"));
        assert!(buffer.contains("phase 2"));
    }
}
