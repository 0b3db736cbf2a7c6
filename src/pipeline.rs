//! Ordered batching of commands on a single connection.
//!
//! All requests of a batch are written with one write, then the replies are read back one by one
//! in the order the requests were queued. The servers guarantee that replies come back in request
//! order, so the n-th reply always belongs to the n-th operation that expects one.
//!
//! The ordering rules live in [`Resolver`], which knows nothing about I/O. The blocking and the
//! async drivers only feed it frames, so both execution modes behave the same way.

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, instrument};

use crate::command::{reply, Command};
use crate::connection::{AsyncTransport, Link, Transport};
use crate::frame::Frame;
use crate::operation::{QueuedOperation, Reply, ReplyKind};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum PipelineState {
    Idle,
    Buffering,
    Flushing,
    Closed,
}

/// How a batch ended, when it didn't fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Completed,
    /// EXEC answered nil, a watched key changed.
    WatchFailed,
    /// EXEC answered with an error, e.g. EXECABORT after a command was rejected while queuing.
    /// Holds the first error the server sent in this batch.
    ExecAborted(String),
}

impl Outcome {
    pub(crate) fn into_flush_result(self) -> Result<()> {
        match self {
            Outcome::Completed | Outcome::WatchFailed => Ok(()),
            Outcome::ExecAborted(msg) => Err(Error::Server(msg)),
        }
    }
}

/// A batch of operations bound to a connection.
///
/// The pipeline borrows the connection mutably for its whole life, so nothing else can write to
/// or read from it while operations are buffered or being flushed.
pub struct Pipeline<'a, C> {
    pub(crate) conn: &'a mut C,
    pub(crate) operations: Vec<QueuedOperation<'a>>,
    pub(crate) buffer: BytesMut,
    state: PipelineState,
}

impl<'a, C: Link> Pipeline<'a, C> {
    pub fn new(conn: &'a mut C) -> Pipeline<'a, C> {
        Pipeline {
            conn,
            operations: Vec::new(),
            buffer: BytesMut::new(),
            state: PipelineState::Idle,
        }
    }

    /// Queues raw request bytes whose reply is read from the wire and handed to `on_success`.
    pub fn enqueue<F>(&mut self, request: Bytes, kind: ReplyKind, on_success: F) -> Result<()>
    where
        F: FnMut(Frame) + Send + 'a,
    {
        let op = QueuedOperation::new(
            Some(request),
            Reply::Wire(kind),
            Some(Box::new(on_success)),
        )?;
        self.enqueue_operation(op)
    }

    pub fn enqueue_command<F>(&mut self, command: &Command, kind: ReplyKind, on_success: F) -> Result<()>
    where
        F: FnMut(Frame) + Send + 'a,
    {
        self.enqueue_operation(QueuedOperation::command(command, kind, on_success))
    }

    pub fn enqueue_operation(&mut self, op: QueuedOperation<'a>) -> Result<()> {
        match self.state {
            PipelineState::Idle | PipelineState::Buffering => {
                self.operations.push(op);
                self.state = PipelineState::Buffering;
                Ok(())
            }
            state => Err(Error::invalid_usage(format!(
                "can't enqueue on a pipeline that is {}",
                state
            ))),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[QueuedOperation<'a>] {
        &self.operations
    }

    fn start_flush(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Idle | PipelineState::Buffering => {
                check_deferred(&self.operations)?;
                self.state = PipelineState::Flushing;
                Ok(())
            }
            state => Err(Error::invalid_usage(format!(
                "can't flush a pipeline that is {}",
                state
            ))),
        }
    }
}

impl<'a, C: Transport> Pipeline<'a, C> {
    /// Writes every queued request and blocks until all replies were read and dispatched.
    pub fn flush(&mut self) -> Result<()> {
        self.execute().and_then(Outcome::into_flush_result)
    }

    pub(crate) fn execute(&mut self) -> Result<Outcome> {
        self.start_flush()?;
        let result = if self.operations.is_empty() {
            Ok(Outcome::Completed)
        } else {
            run(&mut *self.conn, &mut self.buffer, &mut self.operations)
        };
        self.state = PipelineState::Closed;
        result
    }
}

impl<'a, C: AsyncTransport> Pipeline<'a, C> {
    /// Same as [`Pipeline::flush`], suspending on the write and on each reply.
    pub async fn flush_async(&mut self) -> Result<()> {
        self.execute_async().await.and_then(Outcome::into_flush_result)
    }

    pub(crate) async fn execute_async(&mut self) -> Result<Outcome> {
        self.start_flush()?;
        let result = if self.operations.is_empty() {
            Ok(Outcome::Completed)
        } else {
            run_async(&mut *self.conn, &mut self.buffer, &mut self.operations).await
        };
        self.state = PipelineState::Closed;
        result
    }
}

/// Matches replies to operations, in order.
///
/// Call [`Resolver::next_read`] to learn whether another reply is needed, read it, hand it to
/// [`Resolver::feed`], repeat, then [`Resolver::finish`].
pub(crate) struct Resolver<'p, 'a> {
    ops: &'p mut [QueuedOperation<'a>],
    cursor: usize,
    // Operations whose result arrives inside the EXEC reply, in queue order.
    deferred: Vec<usize>,
    server_error: Option<String>,
    outcome: Outcome,
    replies: usize,
}

impl<'p, 'a> Resolver<'p, 'a> {
    pub(crate) fn new(ops: &'p mut [QueuedOperation<'a>]) -> Resolver<'p, 'a> {
        Resolver {
            ops,
            cursor: 0,
            deferred: Vec::new(),
            server_error: None,
            outcome: Outcome::Completed,
            replies: 0,
        }
    }

    /// Skips operations that don't read from the wire and returns what the next reply should be.
    pub(crate) fn next_read(&mut self) -> Option<ReplyKind> {
        while let Some(op) = self.ops.get(self.cursor) {
            match op.reply {
                Reply::Wire(kind) => return Some(kind),
                Reply::Deferred(_) => self.deferred.push(self.cursor),
                Reply::None => {}
            }
            self.cursor += 1;
        }
        None
    }

    pub(crate) fn feed(&mut self, frame: Frame) -> Result<()> {
        let index = self.cursor;
        let kind = match self.ops.get(index).map(|op| op.reply) {
            Some(Reply::Wire(kind)) => kind,
            _ => return Err(Error::protocol("no more replies", frame)),
        };
        self.cursor += 1;
        self.replies += 1;

        match kind {
            ReplyKind::ExecCount => self.resolve_exec(frame),
            kind => self.dispatch(index, kind, frame),
        }
    }

    fn dispatch(&mut self, index: usize, kind: ReplyKind, frame: Frame) -> Result<()> {
        if let Frame::Error(msg) = frame {
            debug!(operation = index, error = %msg, "server replied with an error");
            self.server_error.get_or_insert(msg);
            return Ok(());
        }
        if !kind.accepts(&frame) {
            return Err(Error::protocol(kind, frame));
        }
        if let Some(on_success) = self.ops[index].on_success.as_mut() {
            on_success(frame);
        }
        Ok(())
    }

    fn resolve_exec(&mut self, frame: Frame) -> Result<()> {
        let pending = std::mem::take(&mut self.deferred);

        match frame {
            Frame::Null => {
                self.outcome = Outcome::WatchFailed;
                Ok(())
            }
            Frame::Error(msg) => {
                let first = self.server_error.take().unwrap_or(msg);
                self.outcome = Outcome::ExecAborted(first);
                Ok(())
            }
            Frame::Array(results) => {
                if results.len() != pending.len() {
                    return Err(Error::protocol(
                        format!("{} transaction results", pending.len()),
                        format!("{} results", results.len()),
                    ));
                }
                for (index, result) in pending.into_iter().zip(results) {
                    let kind = self.ops[index].reply.kind().unwrap_or(ReplyKind::Any);
                    self.dispatch(index, kind, result)?;
                }
                Ok(())
            }
            frame => Err(Error::protocol(ReplyKind::ExecCount, frame)),
        }
    }

    pub(crate) fn finish(self) -> Result<Outcome> {
        if !self.deferred.is_empty() {
            return Err(Error::invalid_usage(format!(
                "{} deferred replies are not followed by an EXEC result",
                self.deferred.len()
            )));
        }
        debug!(replies = self.replies, outcome = ?self.outcome, "batch resolved");

        match (self.outcome, self.server_error) {
            (outcome @ Outcome::ExecAborted(_), _) => Ok(outcome),
            (_, Some(msg)) => Err(Error::Server(msg)),
            (outcome, None) => Ok(outcome),
        }
    }
}

/// Every deferred reply must be carried by an EXEC result queued after it.
fn check_deferred(ops: &[QueuedOperation<'_>]) -> Result<()> {
    let mut pending = 0;
    for op in ops {
        match op.reply {
            Reply::Deferred(_) => pending += 1,
            Reply::Wire(ReplyKind::ExecCount) => pending = 0,
            _ => {}
        }
    }

    if pending > 0 {
        return Err(Error::invalid_usage(format!(
            "{} deferred replies are not followed by an EXEC result",
            pending
        )));
    }
    Ok(())
}

fn encode_batch(buffer: &mut BytesMut, unwatch: bool, ops: &[QueuedOperation<'_>]) {
    buffer.clear();
    if unwatch {
        Command::unwatch().encode_into(buffer);
    }
    for request in ops.iter().filter_map(|op| op.request.as_ref()) {
        buffer.extend_from_slice(request);
    }
}

#[instrument(name = "flush", skip_all, fields(connection_id = %conn.id(), operations = ops.len()))]
pub(crate) fn run<C: Transport + ?Sized>(
    conn: &mut C,
    buffer: &mut BytesMut,
    ops: &mut [QueuedOperation<'_>],
) -> Result<Outcome> {
    conn.begin_exchange()?;
    let result = exchange(conn, buffer, ops);
    conn.end_exchange(&result);
    if let Err(err) = &result {
        if err.is_fatal() {
            error!(error = %err, "pipeline flush failed");
        }
    }
    result
}

fn exchange<C: Transport + ?Sized>(
    conn: &mut C,
    buffer: &mut BytesMut,
    ops: &mut [QueuedOperation<'_>],
) -> Result<Outcome> {
    let unwatch = conn.unwatch_pending();
    encode_batch(buffer, unwatch, ops);
    debug!(bytes = buffer.len(), unwatch, "writing batch");
    let written = if buffer.is_empty() {
        Ok(())
    } else {
        conn.write_bytes(buffer)
    };
    buffer.clear();
    written?;

    if unwatch {
        conn.set_unwatch_pending(false);
        expect_unwatched(conn.read_frame()?)?;
    }

    let mut resolver = Resolver::new(ops);
    while resolver.next_read().is_some() {
        let frame = conn.read_frame()?;
        resolver.feed(frame)?;
    }
    resolver.finish()
}

#[instrument(name = "flush", skip_all, fields(connection_id = %conn.id(), operations = ops.len()))]
pub(crate) async fn run_async<C: AsyncTransport + ?Sized>(
    conn: &mut C,
    buffer: &mut BytesMut,
    ops: &mut [QueuedOperation<'_>],
) -> Result<Outcome> {
    conn.begin_exchange()?;
    // Dropping this future before it resolves leaves the connection in flight, which makes it
    // unusable from then on.
    let result = exchange_async(conn, buffer, ops).await;
    conn.end_exchange(&result);
    if let Err(err) = &result {
        if err.is_fatal() {
            error!(error = %err, "pipeline flush failed");
        }
    }
    result
}

async fn exchange_async<C: AsyncTransport + ?Sized>(
    conn: &mut C,
    buffer: &mut BytesMut,
    ops: &mut [QueuedOperation<'_>],
) -> Result<Outcome> {
    let unwatch = conn.unwatch_pending();
    encode_batch(buffer, unwatch, ops);
    debug!(bytes = buffer.len(), unwatch, "writing batch");
    let written = if buffer.is_empty() {
        Ok(())
    } else {
        conn.write_bytes(buffer).await
    };
    buffer.clear();
    written?;

    if unwatch {
        conn.set_unwatch_pending(false);
        expect_unwatched(conn.read_frame().await?)?;
    }

    let mut resolver = Resolver::new(ops);
    while resolver.next_read().is_some() {
        let frame = conn.read_frame().await?;
        resolver.feed(frame)?;
    }
    resolver.finish()
}

fn expect_unwatched(frame: Frame) -> Result<()> {
    let kind = ReplyKind::Ack(reply::OK);
    if kind.accepts(&frame) {
        Ok(())
    } else {
        Err(Error::protocol(kind, frame))
    }
}

/// One command, one reply.
pub(crate) fn round_trip<C: Transport + ?Sized>(
    conn: &mut C,
    command: &Command,
    kind: ReplyKind,
) -> Result<Frame> {
    let mut reply = None;
    {
        let mut ops = [QueuedOperation::command(command, kind, |frame| {
            reply = Some(frame)
        })];
        run(conn, &mut BytesMut::new(), &mut ops)?;
    }
    reply.ok_or_else(|| Error::protocol(kind, "no reply"))
}

pub(crate) async fn round_trip_async<C: AsyncTransport + ?Sized>(
    conn: &mut C,
    command: &Command,
    kind: ReplyKind,
) -> Result<Frame> {
    let mut reply = None;
    {
        let mut ops = [QueuedOperation::command(command, kind, |frame| {
            reply = Some(frame)
        })];
        run_async(conn, &mut BytesMut::new(), &mut ops).await?;
    }
    reply.ok_or_else(|| Error::protocol(kind, "no reply"))
}
