use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    config::TransportConfig,
    dispatch::Dispatcher,
    event_store::{EventStore, InMemoryEventStore},
    gate::SecurityGate,
    session::SessionTable,
};

/// Shared handles passed to every request handler.
#[derive(Clone)]
pub struct AppState {
    sessions: SessionTable,
    gate: SecurityGate,
    started_at: Instant,
    max_body_bytes: usize,
    keep_alive: Duration,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: &TransportConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let events: Arc<dyn EventStore> =
            Arc::new(InMemoryEventStore::new(config.max_events_per_stream));
        Self::with_event_store(config, events, dispatcher)
    }

    pub fn with_event_store(
        config: &TransportConfig,
        events: Arc<dyn EventStore>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            sessions: SessionTable::new(config.session_config(), events, dispatcher),
            gate: SecurityGate::new(config.gate_config()),
            started_at: Instant::now(),
            max_body_bytes: config.max_body_bytes,
            keep_alive: config.keep_alive,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn gate(&self) -> &SecurityGate {
        &self.gate
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}
