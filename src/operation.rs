use bytes::Bytes;
use std::fmt;

use crate::command::Command;
use crate::frame::Frame;
use crate::{Error, Result};

/// Invoked with the decoded reply of an operation.
///
/// Callbacks are `FnMut` so that a transaction can hand the same callbacks to a replay.
pub type Callback<'a> = Box<dyn FnMut(Frame) + Send + 'a>;

/// The reply an operation expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// `+<text>`
    Status,
    /// `:<integer>`
    Integer,
    /// `$<len>` or a nil bulk string.
    Bulk,
    /// `*<len>` or a nil array.
    Array,
    /// Whatever the server answers with.
    Any,
    /// A status reply that must be this exact word, e.g. `OK` or `QUEUED`.
    Ack(&'static str),
    /// The reply to EXEC: either the array of results of the queued commands or nil when a watched
    /// key changed.
    ExecCount,
}

impl ReplyKind {
    /// Whether a non-error reply satisfies this expectation.
    pub fn accepts(&self, frame: &Frame) -> bool {
        match (self, frame) {
            (_, Frame::Error(_)) => false,
            (ReplyKind::Any, _) => true,
            (ReplyKind::Status, Frame::Simple(_)) => true,
            (ReplyKind::Integer, Frame::Integer(_)) => true,
            (ReplyKind::Bulk, Frame::Bulk(_) | Frame::Null) => true,
            (ReplyKind::Array | ReplyKind::ExecCount, Frame::Array(_) | Frame::Null) => true,
            (ReplyKind::Ack(word), frame) => frame.is_status(word),
            _ => false,
        }
    }
}

impl fmt::Display for ReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyKind::Status => write!(f, "status reply"),
            ReplyKind::Integer => write!(f, "integer reply"),
            ReplyKind::Bulk => write!(f, "bulk reply"),
            ReplyKind::Array => write!(f, "array reply"),
            ReplyKind::Any => write!(f, "any reply"),
            ReplyKind::Ack(word) => write!(f, "+{}", word),
            ReplyKind::ExecCount => write!(f, "EXEC result array"),
        }
    }
}

/// Where the reply of an operation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Send only, nothing is read for this operation.
    None,
    /// The next reply on the wire.
    Wire(ReplyKind),
    /// One element of the EXEC reply that closes the transaction.
    Deferred(ReplyKind),
}

impl Reply {
    pub fn kind(&self) -> Option<ReplyKind> {
        match self {
            Reply::None => None,
            Reply::Wire(kind) | Reply::Deferred(kind) => Some(*kind),
        }
    }
}

/// A unit of deferred work: request bytes, the reply they produce and what to do with it.
pub struct QueuedOperation<'a> {
    pub(crate) request: Option<Bytes>,
    pub(crate) reply: Reply,
    pub(crate) on_success: Option<Callback<'a>>,
}

impl<'a> QueuedOperation<'a> {
    /// Operations that neither send nor receive anything are rejected.
    pub fn new(
        request: Option<Bytes>,
        reply: Reply,
        on_success: Option<Callback<'a>>,
    ) -> Result<QueuedOperation<'a>> {
        if request.is_none() && reply == Reply::None {
            return Err(Error::invalid_usage(
                "an operation needs a request, a reply expectation or both",
            ));
        }
        if request.is_none() && matches!(reply, Reply::Deferred(_)) {
            return Err(Error::invalid_usage(
                "a deferred reply needs the request that produces it",
            ));
        }

        Ok(QueuedOperation {
            request,
            reply,
            on_success,
        })
    }

    /// Sends `command` and reads its reply from the wire.
    pub fn command<F>(command: &Command, kind: ReplyKind, on_success: F) -> QueuedOperation<'a>
    where
        F: FnMut(Frame) + Send + 'a,
    {
        QueuedOperation {
            request: Some(command.encode()),
            reply: Reply::Wire(kind),
            on_success: Some(Box::new(on_success)),
        }
    }

    /// Reads a reply produced by a request sent by an earlier operation.
    pub fn expect(kind: ReplyKind) -> QueuedOperation<'a> {
        QueuedOperation {
            request: None,
            reply: Reply::Wire(kind),
            on_success: None,
        }
    }

    /// Sends `command` without reading anything for it.
    pub fn send_only(command: &Command) -> QueuedOperation<'a> {
        QueuedOperation {
            request: Some(command.encode()),
            reply: Reply::None,
            on_success: None,
        }
    }

    /// Sends and acknowledges in one step, for the framing commands.
    pub(crate) fn acknowledged(command: &Command, word: &'static str) -> QueuedOperation<'a> {
        QueuedOperation {
            request: Some(command.encode()),
            reply: Reply::Wire(ReplyKind::Ack(word)),
            on_success: None,
        }
    }

    pub fn request(&self) -> Option<&Bytes> {
        self.request.as_ref()
    }

    pub fn reply(&self) -> Reply {
        self.reply
    }

    pub fn reads_from_wire(&self) -> bool {
        matches!(self.reply, Reply::Wire(_))
    }

    /// Turns a deferred transaction step into a plain pipelined one, keeping request and callback.
    pub(crate) fn into_replay(self) -> Option<QueuedOperation<'a>> {
        match self.reply {
            Reply::Deferred(kind) => Some(QueuedOperation {
                reply: Reply::Wire(kind),
                ..self
            }),
            _ => None,
        }
    }

    pub(crate) fn into_deferred(self) -> QueuedOperation<'a> {
        match self.reply {
            Reply::Wire(kind) => QueuedOperation {
                reply: Reply::Deferred(kind),
                ..self
            },
            _ => self,
        }
    }
}

impl fmt::Debug for QueuedOperation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("request", &self.request)
            .field("reply", &self.reply)
            .field("has_callback", &self.on_success.is_some())
            .finish()
    }
}
