//! Actions: small messages delivered hop-by-hop between neighbouring
//! nodes.
//!
//! An action is comparable to a command. Nodes send actions to each
//! other through the graph, which routes them across edges; a node may
//! rewrite an action before reposting it (e.g. a decimator rescaling the
//! sample count of a stream command crossing it). Every action carries a
//! process-wide unique, monotonically increasing id for tracing.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Key used for stream-command actions.
pub const STREAM_CMD_ACTION_KEY: &str = "stream_cmd";

/// Key used for RX event actions (overruns and friends).
pub const RX_EVENT_ACTION_KEY: &str = "rx_event";

// A process-wide counter, used to uniquely label actions.
static ACTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How a stream command bounds the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMode {
    StartContinuous,
    StopContinuous,
    NumSampsAndDone,
    NumSampsAndMore,
}

/// Payload of a stream-command action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCmd {
    pub mode: StreamMode,
    pub num_samps: u64,
    pub stream_now: bool,
    /// Time at which the command takes effect, in seconds. `None` means
    /// immediately.
    pub time_spec: Option<f64>,
}

impl StreamCmd {
    pub fn new(mode: StreamMode) -> Self {
        StreamCmd {
            mode,
            num_samps: 0,
            stream_now: true,
            time_spec: None,
        }
    }

    pub fn num_samps_and_done(num_samps: u64) -> Self {
        StreamCmd {
            mode: StreamMode::NumSampsAndDone,
            num_samps,
            stream_now: true,
            time_spec: None,
        }
    }
}

/// Error condition reported by an RX event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RxErrorCode {
    Timeout,
    LateCommand,
    BrokenChain,
    Overflow,
    Alignment,
    BadPacket,
}

/// Payload of an RX event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxEventInfo {
    pub error_code: RxErrorCode,
}

/// The payload carried by an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionPayload {
    None,
    StreamCmd(StreamCmd),
    RxEvent(RxEventInfo),
    /// Application-defined payload; producers and consumers agree on the
    /// encoding.
    Opaque(Vec<u8>),
}

/// A message delivered between neighbouring nodes.
#[derive(Debug, Clone)]
pub struct Action {
    key: String,
    id: u64,
    payload: ActionPayload,
}

impl Action {
    /// Creates an action with a fresh id.
    pub fn new(key: impl Into<String>, payload: ActionPayload) -> Self {
        Action {
            key: key.into(),
            id: ACTION_COUNTER.fetch_add(1, Ordering::Relaxed),
            payload,
        }
    }

    /// Creates a stream-command action under the conventional key.
    pub fn stream_cmd(cmd: StreamCmd) -> Self {
        Action::new(STREAM_CMD_ACTION_KEY, ActionPayload::StreamCmd(cmd))
    }

    /// Creates an RX event action under the conventional key.
    pub fn rx_event(event: RxEventInfo) -> Self {
        Action::new(RX_EVENT_ACTION_KEY, ActionPayload::RxEvent(event))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &ActionPayload {
        &self.payload
    }
}
