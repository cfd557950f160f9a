//! Failure trees
//!
//! Every failed unit of work produces a [`Fault`]. A fault is either a leaf
//! cause (network, timeout, HTTP status, ...) or an aggregate that summarizes
//! the failures of its children. Leaf failures compose into group-level
//! aggregates, which compose into a batch-level aggregate, via [`assert_all`].
//!
//! Each node carries a [`TraceId`] generated at construction so the same
//! failure can be recognised when it is shared between several waiters.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Longest HTTP error body kept on a [`FaultKind::Status`] fault
const MAX_STATUS_BODY_CHARS: usize = 512;

/// Globally unique identifier of a single failure event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TraceId(Uuid);

impl TraceId {
    fn generate() -> Self {
        TraceId(Uuid::new_v4())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What went wrong
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    /// Connection-level failure (DNS, refused connection, reset, broken body stream)
    #[error("failed to connect to {url}: {reason}")]
    Network {
        /// Target of the request
        url: String,
        /// Underlying transport error
        reason: String,
    },

    /// The per-attempt deadline elapsed
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout {
        /// Target of the request
        url: String,
        /// Deadline that elapsed
        timeout_ms: u64,
    },

    /// Non-2xx response
    #[error("request to {url} failed. {status}: {body}")]
    Status {
        /// Target of the request
        url: String,
        /// HTTP status code
        status: u16,
        /// Response body text (truncated)
        body: String,
    },

    /// The caller cancelled the request
    #[error("request to {url} was cancelled")]
    Cancelled {
        /// Target of the request
        url: String,
    },

    /// The server answered 2xx with a zero-length payload
    #[error("{url} returned an empty payload")]
    EmptyPayload {
        /// Target of the request
        url: String,
    },

    /// The payload could not be decoded into the expected type
    #[error("failed to decode response from {url}: {reason}")]
    Decode {
        /// Target of the request
        url: String,
        /// Decoder error
        reason: String,
    },

    /// The request could not be built (bad method, bad URL)
    #[error("invalid request to {url}: {reason}")]
    InvalidRequest {
        /// Target of the request
        url: String,
        /// Why the request was rejected
        reason: String,
    },

    /// Handing a payload to its sink failed
    #[error("failed to store {target}: {reason}")]
    Storage {
        /// Where the payload was being written
        target: String,
        /// Underlying error
        reason: String,
    },

    /// Summary of one or more child failures
    #[error("{message}")]
    Aggregate {
        /// Human-readable summary
        message: String,
    },
}

/// A node in a failure tree
///
/// Leaf nodes have no children and describe a single cause. Aggregate nodes
/// have at least one child and no cause of their own.
#[derive(Clone, Debug, Serialize, Error)]
#[error("{kind}")]
pub struct Fault {
    trace_id: TraceId,
    #[serde(flatten)]
    kind: FaultKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<Fault>,
}

impl Fault {
    /// Create a leaf fault
    pub fn new(kind: FaultKind) -> Self {
        Self {
            trace_id: TraceId::generate(),
            kind,
            origin: None,
            children: Vec::new(),
        }
    }

    /// Create an aggregate fault summarizing `children`
    pub fn aggregate(message: impl Into<String>, children: Vec<Fault>) -> Self {
        Self {
            trace_id: TraceId::generate(),
            kind: FaultKind::Aggregate {
                message: message.into(),
            },
            origin: None,
            children,
        }
    }

    /// Connection-level failure
    pub fn network(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::new(FaultKind::Network {
            url: url.into(),
            reason: reason.to_string(),
        })
    }

    /// Per-attempt deadline elapsed
    pub fn timeout(url: impl Into<String>, after: Duration) -> Self {
        Self::new(FaultKind::Timeout {
            url: url.into(),
            timeout_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Non-2xx response
    pub fn status(url: impl Into<String>, status: u16, body: impl AsRef<str>) -> Self {
        let body: String = body.as_ref().chars().take(MAX_STATUS_BODY_CHARS).collect();
        Self::new(FaultKind::Status {
            url: url.into(),
            status,
            body,
        })
    }

    /// Caller-initiated cancellation
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::new(FaultKind::Cancelled { url: url.into() })
    }

    /// Zero-length payload
    pub fn empty_payload(url: impl Into<String>) -> Self {
        Self::new(FaultKind::EmptyPayload { url: url.into() })
    }

    /// Payload decoding failure
    pub fn decode(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::new(FaultKind::Decode {
            url: url.into(),
            reason: reason.to_string(),
        })
    }

    /// Request could not be built
    pub fn invalid_request(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::new(FaultKind::InvalidRequest {
            url: url.into(),
            reason: reason.to_string(),
        })
    }

    /// Sink failure
    pub fn storage(target: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::new(FaultKind::Storage {
            target: target.into(),
            reason: reason.to_string(),
        })
    }

    /// Record the URL as listed by the caller, before any rewriting
    ///
    /// Keeps the trace id, so the result is still the same failure event.
    pub fn with_origin(mut self, url: impl Into<String>) -> Self {
        self.origin = Some(url.into());
        self
    }

    /// URL the work was listed under: the recorded origin, else [`Fault::url`]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref().or_else(|| self.url())
    }

    /// Identifier assigned when this fault was created
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// What went wrong at this node
    pub fn kind(&self) -> &FaultKind {
        &self.kind
    }

    /// Child failures, in discovery order
    pub fn children(&self) -> &[Fault] {
        &self.children
    }

    /// Human-readable message of this node alone
    pub fn message(&self) -> String {
        self.kind.to_string()
    }

    /// True if this node is a leaf cause
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// True if this node summarizes other failures
    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, FaultKind::Aggregate { .. })
    }

    /// HTTP status, for [`FaultKind::Status`] faults
    pub fn status_code(&self) -> Option<u16> {
        match &self.kind {
            FaultKind::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True for a 404 response
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// Request target this fault refers to, if it is a request-level fault
    pub fn url(&self) -> Option<&str> {
        match &self.kind {
            FaultKind::Network { url, .. }
            | FaultKind::Timeout { url, .. }
            | FaultKind::Status { url, .. }
            | FaultKind::Cancelled { url }
            | FaultKind::EmptyPayload { url }
            | FaultKind::Decode { url, .. }
            | FaultKind::InvalidRequest { url, .. } => Some(url),
            FaultKind::Storage { .. } | FaultKind::Aggregate { .. } => None,
        }
    }

    /// Depth-first, pre-order walk: visits `self`, then each child in order
    ///
    /// The visitor receives each node together with its depth (0 for `self`).
    pub fn traverse<F>(&self, mut visitor: F)
    where
        F: FnMut(&Fault, usize),
    {
        fn walk<F: FnMut(&Fault, usize)>(node: &Fault, depth: usize, visitor: &mut F) {
            visitor(node, depth);
            for child in &node.children {
                walk(child, depth + 1, visitor);
            }
        }

        walk(self, 0, &mut visitor);
    }

    /// Every leaf cause in the tree, in pre-order
    pub fn leaves(&self) -> Vec<&Fault> {
        let mut leaves = Vec::new();
        fn collect<'a>(node: &'a Fault, out: &mut Vec<&'a Fault>) {
            if node.is_leaf() {
                out.push(node);
            }
            for child in &node.children {
                collect(child, out);
            }
        }
        collect(self, &mut leaves);
        leaves
    }

    /// Render the whole tree, one indented line per node
    pub fn report(&self) -> String {
        let mut out = String::new();
        self.traverse(|node, depth| {
            out.push_str(&"  ".repeat(depth));
            out.push_str("- ");
            out.push_str(&node.message());
            out.push_str(" [");
            out.push_str(&node.trace_id.to_string());
            out.push_str("]\n");
        });
        out
    }
}

/// Raise an aggregate fault if any result failed
///
/// Returns the success values, in input order, when every result is `Ok`.
/// Otherwise returns an aggregate fault whose message is `summary` and whose
/// children are every failure, in input order. Successes contribute nothing
/// to the aggregate.
pub fn assert_all<T, I>(results: I, summary: impl Into<String>) -> Result<Vec<T>, Fault>
where
    I: IntoIterator<Item = Result<T, Fault>>,
{
    let mut successes = Vec::new();
    let mut failures = Vec::new();

    for result in results {
        match result {
            Ok(value) => successes.push(value),
            Err(fault) => failures.push(fault),
        }
    }

    if failures.is_empty() {
        Ok(successes)
    } else {
        Err(Fault::aggregate(summary, failures))
    }
}
