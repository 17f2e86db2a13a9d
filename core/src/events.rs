//! Broadcast diagnostics bus shared by timeout machines, sessions and the
//! pool. Subscribers can never block or corrupt the engine: send failures and
//! lagging receivers are ignored.

use chrono::SecondsFormat;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::pattern::OutputClass;
use crate::session::SessionId;
use crate::timeout::TerminationReason;
use crate::timeout::TimeoutStage;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    /// RFC 3339 timestamp with millisecond precision.
    pub at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(flatten)]
    pub kind: EngineEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEventKind {
    StateChange {
        from: TimeoutStage,
        to: TimeoutStage,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    PatternMatch {
        class: OutputClass,
        pattern: String,
        matched: String,
    },
    Terminate {
        reason: TerminationReason,
    },
    SessionSpawned,
    SessionRetired,
}

#[derive(Debug, Clone)]
pub struct EngineEventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EngineEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(
        &self,
        session: Option<SessionId>,
        command: Option<String>,
        kind: EngineEventKind,
    ) {
        let event = EngineEvent {
            at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session,
            command,
            kind,
        };
        if let Ok(json) = serde_json::to_string(&event) {
            tracing::debug!(target: "shellherd::events", "{json}");
        }
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn events_serialize_with_flattened_kind() {
        let bus = EngineEventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(
            Some(SessionId(3)),
            Some("sleep 30".to_string()),
            EngineEventKind::Terminate {
                reason: TerminationReason::GraceExpired,
            },
        );
        let event = rx.recv().await.unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "terminate");
        assert_eq!(json["reason"], "grace_expired");
        assert_eq!(json["session"], 3);
    }

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        let bus = EngineEventBus::new();
        bus.emit(None, None, EngineEventKind::SessionSpawned);
    }
}
