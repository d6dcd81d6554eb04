//! IPC message contract (§6).
//!
//! The daemon that would own `swarmfs.sock` / the Windows named pipe is an
//! external collaborator (§1 Out of scope) — this module only defines the
//! newline-delimited JSON envelopes and the typed `params`/`result`/`data`
//! payloads for each method and event named in §6, so a future daemon crate
//! and the CLI agree on a wire contract without either depending on the
//! other's internals. Nothing here opens a socket or a pipe.
//!
//! The envelopes are the same shape the CLI and core would exchange if
//! they were calling each other in-process, just serialized instead of
//! called directly: `{id, type:"req", method, params}`,
//! `{id, type:"res", ok, result|error}`, `{type:"evt", event, data}`.

use serde::{Deserialize, Serialize};

/// A single newline-delimited JSON request to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Correlates this request with its eventual [`IpcResponse`].
    pub id: u64,
    /// Always `"req"`; present so requests, responses, and events are
    /// distinguishable without peeking at other fields.
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// The method-specific payload.
    #[serde(flatten)]
    pub method: IpcMethod,
}

/// Discriminant for [`IpcRequest::kind`]. Only one variant exists; it
/// exists so the field round-trips as the literal string `"req"` the way
/// §6 specifies rather than being inferred from context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Tags an [`IpcRequest`].
    Req,
}

/// One call per method named in §6, tagged on the wire by `method` with
/// its parameters inlined (`#[serde(flatten)]` on the enclosing
/// [`IpcRequest`] keeps the envelope flat: `{id, type, method, params...}`
/// rather than a nested `params` object, matching how compact
/// line-delimited protocols are usually hand-read during debugging).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum IpcMethod {
    /// `daemon.ping` — liveness check, no parameters.
    #[serde(rename = "daemon.ping")]
    DaemonPing,
    /// `daemon.shutdown` — ask the daemon to exit cleanly.
    #[serde(rename = "daemon.shutdown")]
    DaemonShutdown,
    /// `node.status` — this node's identity, uptime, and share summary.
    #[serde(rename = "node.status")]
    NodeStatus,
    /// `network.stats` — aggregate transport counters.
    #[serde(rename = "network.stats")]
    NetworkStats,
    /// `topic.list` — every known topic.
    #[serde(rename = "topic.list")]
    TopicList,
    /// `topic.join` — derive a topic key and join the swarm.
    #[serde(rename = "topic.join")]
    TopicJoin {
        /// Topic name.
        name: String,
        /// Password for a private topic, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        /// Whether to auto-join this topic on future daemon starts.
        #[serde(default)]
        auto_join: bool,
    },
    /// `topic.leave` — leave a previously joined topic.
    #[serde(rename = "topic.leave")]
    TopicLeave {
        /// Topic name.
        name: String,
    },
    /// `logs.tail` — stream recent log lines, then keep following.
    #[serde(rename = "logs.tail")]
    LogsTail {
        /// Number of historical lines to replay before following.
        #[serde(default)]
        lines: u32,
    },
    /// `events.subscribe` — subscribe to one or more event channels
    /// (`log`, `network`, §6).
    #[serde(rename = "events.subscribe")]
    EventsSubscribe {
        /// Channel names to subscribe to.
        channels: Vec<String>,
    },
}

/// A single newline-delimited JSON response from the daemon, correlated
/// to its [`IpcRequest`] by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    /// Matches the originating [`IpcRequest::id`].
    pub id: u64,
    /// Always `"res"`.
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Present when `ok` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<IpcResult>,
    /// Present when `ok` is false: a human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Discriminant for [`IpcResponse::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Tags an [`IpcResponse`].
    Res,
}

/// The successful result payload for each method in [`IpcMethod`]. Methods
/// with no meaningful result (`daemon.ping`, `daemon.shutdown`,
/// `topic.join`, `topic.leave`, `events.subscribe`) resolve to
/// [`IpcResult::Ack`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IpcResult {
    /// No payload beyond success.
    Ack,
    /// Result of `node.status`.
    NodeStatus(NodeStatusResult),
    /// Result of `network.stats`.
    NetworkStats(NetworkStatsResult),
    /// Result of `topic.list`.
    TopicList(Vec<TopicSummary>),
    /// Replayed history for `logs.tail`.
    LogLines(Vec<String>),
}

/// `node.status` result (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusResult {
    /// This node's peer id, hex-encoded.
    pub peer_id: String,
    /// Seconds since the daemon started.
    pub uptime_secs: u64,
    /// Number of files currently shared across all topics.
    pub shared_file_count: u64,
    /// Number of topics currently joined.
    pub joined_topic_count: u64,
}

/// `network.stats` result (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatsResult {
    /// Currently connected peers, across all topics.
    pub connected_peers: u64,
    /// Total bytes sent since daemon start.
    pub bytes_sent: u64,
    /// Total bytes received since daemon start.
    pub bytes_received: u64,
}

/// One entry of a `topic.list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSummary {
    /// Topic name.
    pub name: String,
    /// Whether this topic is auto-joined on daemon start.
    pub auto_join: bool,
    /// Unix seconds of the last successful join, if ever joined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_joined_at: Option<i64>,
}

/// A single newline-delimited JSON event, pushed by the daemon on a
/// channel the client subscribed to via `events.subscribe` (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcEvent {
    /// Always `"evt"`.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// The event-specific payload, tagged by channel name.
    #[serde(flatten)]
    pub event: IpcEventBody,
}

/// Discriminant for [`IpcEvent::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Tags an [`IpcEvent`].
    Evt,
}

/// Per-channel event payloads (§6 channels: `log`, `network`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum IpcEventBody {
    /// A single structured log line, forwarded from `tracing` (§6
    /// ambient logging).
    #[serde(rename = "log")]
    Log {
        /// Log level (`trace`, `debug`, `info`, `warn`, `error`).
        level: String,
        /// Rendered message.
        message: String,
    },
    /// A peer connection transition on the transport.
    #[serde(rename = "network")]
    Network {
        /// Peer id, hex-encoded.
        peer_id: String,
        /// Whether the peer connected (`true`) or disconnected (`false`).
        connected: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = IpcRequest {
            id: 7,
            kind: RequestKind::Req,
            method: IpcMethod::TopicJoin {
                name: "demo".to_string(),
                password: None,
                auto_join: true,
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"method\":\"topic.join\""));
        let back: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 7);
        match back.method {
            IpcMethod::TopicJoin { name, password, auto_join } => {
                assert_eq!(name, "demo");
                assert_eq!(password, None);
                assert!(auto_join);
            }
            other => panic!("unexpected method: {other:?}"),
        }
    }

    #[test]
    fn ping_has_no_params_field_baggage() {
        let req = IpcRequest {
            id: 1,
            kind: RequestKind::Req,
            method: IpcMethod::DaemonPing,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"method\":\"daemon.ping\""));
    }

    #[test]
    fn response_error_round_trips() {
        let resp = IpcResponse {
            id: 1,
            kind: ResponseKind::Res,
            ok: false,
            result: None,
            error: Some("topic not found".to_string()),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: IpcResponse = serde_json::from_str(&json).unwrap();
        assert!(!back.ok);
        assert_eq!(back.error.as_deref(), Some("topic not found"));
    }

    #[test]
    fn event_round_trips_on_log_channel() {
        let evt = IpcEvent {
            kind: EventKind::Evt,
            event: IpcEventBody::Log {
                level: "info".to_string(),
                message: "hello".to_string(),
            },
        };
        let json = serde_json::to_string(&evt).unwrap();
        let back: IpcEvent = serde_json::from_str(&json).unwrap();
        match back.event {
            IpcEventBody::Log { level, message } => {
                assert_eq!(level, "info");
                assert_eq!(message, "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn node_status_result_round_trips() {
        let result = IpcResult::NodeStatus(NodeStatusResult {
            peer_id: "ab".repeat(16),
            uptime_secs: 42,
            shared_file_count: 3,
            joined_topic_count: 1,
        });
        let json = serde_json::to_string(&result).unwrap();
        let back: IpcResult = serde_json::from_str(&json).unwrap();
        match back {
            IpcResult::NodeStatus(s) => assert_eq!(s.uptime_secs, 42),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
