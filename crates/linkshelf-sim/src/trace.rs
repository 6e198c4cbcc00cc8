use serde::{Deserialize, Serialize};

use crate::network::{ClientId, SendOutcome};

/// One observable step of a simulation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub round: u64,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEventKind {
    /// A client started an operation.
    Action { client: ClientId, action: ClientAction },
    /// The store processed a queued call.
    Call {
        client: ClientId,
        op: CallOp,
        outcome: CallOutcome,
    },
    /// The store pushed a committed change toward a subscription.
    FeedSend {
        client: ClientId,
        subscription: u64,
        send: SendOutcome,
    },
    /// Messages arrived this round.
    Deliver { delivered: usize, reordered: bool },
    /// The store closed a subscription.
    FeedDropped { client: ClientId },
    /// Another owner's event was pushed to a client.
    Leak { client: ClientId },
    /// A client's feed task finished.
    FeedExit { client: ClientId, exit: String },
    /// The network stopped losing messages and clients stopped acting.
    Settle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Create,
    /// A create with input that fails local validation.
    CreateInvalid,
    Delete { id: String },
    Resync,
    /// Tear the session down and activate a fresh one.
    Restart,
    Activate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOp {
    Create,
    Delete,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Committed,
    /// Read-only call answered.
    Answered,
    /// Injected failure; nothing committed.
    Failed,
    Rejected,
}
