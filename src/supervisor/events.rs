use std::fmt;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::StatusReport;

/// Receives the push feed of lifecycle and output notifications.
///
/// Called while per-service ordering is held, so implementations must not block.
pub trait EventSink: Send + Sync + fmt::Debug {
    fn status_changed(&self, report: &StatusReport);

    fn log_line(&self, service: &str, line: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SupervisorEvent {
    StatusChanged { services: StatusReport },
    LogLine { service: String, line: String },
}

/// Fans events out to any number of subscribers; events are dropped while nobody listens.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<SupervisorEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(16));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.sender.subscribe()
    }

    fn send(&self, event: SupervisorEvent) {
        let _ = self.sender.send(event);
    }
}

impl EventSink for BroadcastSink {
    fn status_changed(&self, report: &StatusReport) {
        self.send(SupervisorEvent::StatusChanged {
            services: report.clone(),
        });
    }

    fn log_line(&self, service: &str, line: &str) {
        self.send(SupervisorEvent::LogLine {
            service: service.to_string(),
            line: line.to_string(),
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<SupervisorEvent>>,
    }

    impl RecordingSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn events(&self) -> Vec<SupervisorEvent> {
            self.events.lock().clone()
        }

        /// Running flags reported for `service`, one per status event.
        pub fn running_history(&self, service: &str) -> Vec<bool> {
            self.events
                .lock()
                .iter()
                .filter_map(|event| match event {
                    SupervisorEvent::StatusChanged { services } => {
                        services.get(service).map(|status| status.running)
                    }
                    SupervisorEvent::LogLine { .. } => None,
                })
                .collect()
        }

        pub fn status_event_count(&self) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|event| matches!(event, SupervisorEvent::StatusChanged { .. }))
                .count()
        }

        pub fn log_lines(&self, service: &str) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .filter_map(|event| match event {
                    SupervisorEvent::LogLine { service: name, line } if name == service => {
                        Some(line.clone())
                    }
                    _ => None,
                })
                .collect()
        }
    }

    impl EventSink for RecordingSink {
        fn status_changed(&self, report: &StatusReport) {
            self.events.lock().push(SupervisorEvent::StatusChanged {
                services: report.clone(),
            });
        }

        fn log_line(&self, service: &str, line: &str) {
            self.events.lock().push(SupervisorEvent::LogLine {
                service: service.to_string(),
                line: line.to_string(),
            });
        }
    }
}
