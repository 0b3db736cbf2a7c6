//! MULTI/EXEC transactions on top of [`Pipeline`].
//!
//! Nothing reaches the connection before [`Transaction::commit`] (or a rollback): MULTI, every
//! queued command and EXEC go out in a single write. The operations queued for `n` commands are
//!
//! ```text
//! MULTI          -> +OK
//! cmd 1          -> result 1, taken from the EXEC reply
//!                -> +QUEUED
//! ...
//! cmd n          -> result n, taken from the EXEC reply
//!                -> +QUEUED
//!                -> *n (or nil when a watched key changed)
//! EXEC
//! ```
//!
//! that is `1 + 2n + 2` operations.

use bytes::Bytes;
use std::mem;
use tracing::{debug, info, warn};

use crate::command::{reply, Command};
use crate::connection::{AsyncTransport, Link, Transport};
use crate::frame::Frame;
use crate::operation::{QueuedOperation, Reply, ReplyKind};
use crate::pipeline::{self, Outcome, Pipeline};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, strum_macros::EnumIter)]
pub enum TransactionState {
    NotStarted,
    Began,
    Queuing,
    Committing,
    Committed,
    /// EXEC did not run the commands, a watched key changed or the server refused the batch.
    Aborted,
    RolledBack,
}

impl TransactionState {
    /// Still collecting commands, nothing has been sent yet.
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionState::Began | TransactionState::Queuing)
    }

    pub fn accepts_commands(&self) -> bool {
        matches!(
            self,
            TransactionState::NotStarted | TransactionState::Began | TransactionState::Queuing
        )
    }
}

/// A single-use MULTI/EXEC transaction bound to a connection.
///
/// A transaction that is dropped while still open is rolled back locally: since none of its
/// requests were written yet, the connection is left exactly as it was. A WATCH it issued is
/// released by the next exchange on the connection.
pub struct Transaction<'a, C: Link> {
    pipeline: Pipeline<'a, C>,
    state: TransactionState,
    user_command_count: usize,
    // A WATCH sent by this transaction is armed on the server until EXEC, DISCARD or UNWATCH.
    watching: bool,
}

impl<'a, C: Link> Transaction<'a, C> {
    pub fn new(conn: &'a mut C) -> Transaction<'a, C> {
        Transaction {
            pipeline: Pipeline::new(conn),
            state: TransactionState::NotStarted,
            user_command_count: 0,
            watching: false,
        }
    }

    /// Queues MULTI as the first operation. Called implicitly by the first
    /// [`Transaction::queue_command`] or by [`Transaction::commit`].
    pub fn begin(&mut self) -> Result<()> {
        if self.state != TransactionState::NotStarted {
            return Err(Error::invalid_usage(format!(
                "transaction can't begin, it is {}",
                self.state
            )));
        }

        self.pipeline
            .enqueue_operation(QueuedOperation::acknowledged(&Command::multi(), reply::OK))?;
        self.state = TransactionState::Began;
        Ok(())
    }

    /// Queues a command whose result, known only after EXEC, is passed to `on_success`.
    pub fn queue_command<F>(&mut self, command: &Command, kind: ReplyKind, on_success: F) -> Result<()>
    where
        F: FnMut(Frame) + Send + 'a,
    {
        self.ensure_began("queue a command")?;

        let op = QueuedOperation::new(
            Some(command.encode()),
            Reply::Deferred(kind),
            Some(Box::new(on_success)),
        )?;
        self.pipeline.enqueue_operation(op)?;
        self.pipeline
            .enqueue_operation(QueuedOperation::expect(ReplyKind::Ack(reply::QUEUED)))?;

        self.user_command_count += 1;
        self.state = TransactionState::Queuing;
        Ok(())
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of commands queued by the caller.
    pub fn user_command_count(&self) -> usize {
        self.user_command_count
    }

    /// Number of protocol operations, framing included.
    pub fn operation_count(&self) -> usize {
        self.pipeline.len()
    }

    fn ensure_began(&mut self, action: &str) -> Result<()> {
        match self.state {
            TransactionState::NotStarted => self.begin(),
            TransactionState::Began | TransactionState::Queuing => Ok(()),
            state => Err(Error::invalid_usage(format!(
                "can't {} on a transaction that is {}",
                action, state
            ))),
        }
    }

    fn watch_command<I, K>(&self, keys: I) -> Result<Command>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        // MULTI is only buffered at this point, WATCH still reaches the server before it.
        match self.state {
            TransactionState::NotStarted | TransactionState::Began => Ok(Command::watch(keys)),
            state => Err(Error::invalid_usage(format!(
                "WATCH must come before any queued command, transaction is {}",
                state
            ))),
        }
    }

    fn prepare_commit(&mut self) -> Result<()> {
        self.ensure_began("commit")?;

        self.pipeline
            .enqueue_operation(QueuedOperation::expect(ReplyKind::ExecCount))?;
        self.pipeline
            .enqueue_operation(QueuedOperation::send_only(&Command::exec()))?;
        self.state = TransactionState::Committing;
        self.watching = false;

        debug!(
            commands = self.user_command_count,
            operations = self.pipeline.len(),
            "committing transaction"
        );
        Ok(())
    }

    fn complete_commit(&mut self, result: Result<Outcome>) -> Result<bool> {
        match result {
            Ok(Outcome::Completed) => {
                self.state = TransactionState::Committed;
                Ok(true)
            }
            Ok(Outcome::WatchFailed) => {
                info!(
                    commands = self.user_command_count,
                    "transaction aborted, a watched key was modified"
                );
                self.state = TransactionState::Aborted;
                Ok(false)
            }
            Ok(Outcome::ExecAborted(msg)) => {
                self.state = TransactionState::Aborted;
                Err(Error::Server(msg))
            }
            // EXEC ran, some of the commands failed on the server.
            Err(Error::Server(msg)) => {
                self.state = TransactionState::Committed;
                Err(Error::Server(msg))
            }
            Err(err) => {
                self.state = TransactionState::Aborted;
                Err(err)
            }
        }
    }

    fn prepare_rollback(&mut self) -> Result<Vec<QueuedOperation<'a>>> {
        if !self.state.is_open() {
            return Err(Error::NoActiveTransaction);
        }

        debug!(commands = self.user_command_count, "rolling back transaction");
        self.pipeline.operations.clear();
        self.state = TransactionState::RolledBack;
        self.watching = false;

        // The buffered MULTI was never sent, it goes out together with the DISCARD.
        Ok(vec![
            QueuedOperation::acknowledged(&Command::multi(), reply::OK),
            QueuedOperation::acknowledged(&Command::discard(), reply::OK),
        ])
    }

    fn prepare_replay(&mut self) -> Result<Vec<QueuedOperation<'a>>> {
        if !matches!(
            self.state,
            TransactionState::Committed | TransactionState::Aborted
        ) {
            return Err(Error::invalid_usage(format!(
                "can't replay a transaction that is {}",
                self.state
            )));
        }

        let commands: Vec<_> = mem::take(&mut self.pipeline.operations)
            .into_iter()
            .filter_map(QueuedOperation::into_replay)
            .collect();
        if commands.is_empty() {
            return Err(Error::invalid_usage("transaction has no commands to replay"));
        }

        debug!(commands = commands.len(), "replaying transaction commands");
        Ok(commands)
    }

    fn restore_replay(&mut self, commands: Vec<QueuedOperation<'a>>) {
        self.pipeline.operations = commands
            .into_iter()
            .map(QueuedOperation::into_deferred)
            .collect();
    }
}

impl<'a, C: Transport> Transaction<'a, C> {
    /// Sends `WATCH` right away. Only valid before the first queued command.
    pub fn watch<I, K>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let command = self.watch_command(keys)?;
        pipeline::round_trip(&mut *self.pipeline.conn, &command, ReplyKind::Ack(reply::OK))?;
        self.watching = true;
        Ok(())
    }

    /// Sends the whole transaction and dispatches the results.
    ///
    /// Returns `Ok(false)` when a watched key changed and the server refused to run the commands,
    /// in which case no callback was invoked.
    pub fn commit(&mut self) -> Result<bool> {
        self.prepare_commit()?;
        let result = self.pipeline.execute();
        self.complete_commit(result)
    }

    pub fn rollback(&mut self) -> Result<()> {
        let mut ops = self.prepare_rollback()?;
        pipeline::run(&mut *self.pipeline.conn, &mut self.pipeline.buffer, &mut ops)
            .and_then(Outcome::into_flush_result)
    }

    /// Sends the queued commands again as a plain pipeline, without MULTI/EXEC, invoking the same
    /// callbacks in the same order.
    pub fn replay(&mut self) -> Result<bool> {
        let mut commands = self.prepare_replay()?;
        let result = pipeline::run(
            &mut *self.pipeline.conn,
            &mut self.pipeline.buffer,
            &mut commands,
        );
        self.restore_replay(commands);
        result.and_then(Outcome::into_flush_result).map(|_| true)
    }

    /// Rolls back if the transaction is still open, otherwise releases a WATCH it issued.
    pub fn close(mut self) -> Result<()> {
        if self.state.is_open() {
            self.rollback()
        } else if self.watching {
            let unwatch = Command::unwatch();
            pipeline::round_trip(&mut *self.pipeline.conn, &unwatch, ReplyKind::Ack(reply::OK))?;
            self.watching = false;
            Ok(())
        } else {
            Ok(())
        }
    }
}

impl<'a, C: AsyncTransport> Transaction<'a, C> {
    pub async fn watch_async<I, K>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Bytes>,
    {
        let command = self.watch_command(keys)?;
        pipeline::round_trip_async(&mut *self.pipeline.conn, &command, ReplyKind::Ack(reply::OK))
            .await?;
        self.watching = true;
        Ok(())
    }

    pub async fn commit_async(&mut self) -> Result<bool> {
        self.prepare_commit()?;
        let result = self.pipeline.execute_async().await;
        self.complete_commit(result)
    }

    pub async fn rollback_async(&mut self) -> Result<()> {
        let mut ops = self.prepare_rollback()?;
        pipeline::run_async(&mut *self.pipeline.conn, &mut self.pipeline.buffer, &mut ops)
            .await
            .and_then(Outcome::into_flush_result)
    }

    pub async fn replay_async(&mut self) -> Result<bool> {
        let mut commands = self.prepare_replay()?;
        let result = pipeline::run_async(
            &mut *self.pipeline.conn,
            &mut self.pipeline.buffer,
            &mut commands,
        )
        .await;
        self.restore_replay(commands);
        result.and_then(Outcome::into_flush_result).map(|_| true)
    }

    pub async fn close_async(mut self) -> Result<()> {
        if self.state.is_open() {
            self.rollback_async().await
        } else if self.watching {
            pipeline::round_trip_async(
                &mut *self.pipeline.conn,
                &Command::unwatch(),
                ReplyKind::Ack(reply::OK),
            )
            .await?;
            self.watching = false;
            Ok(())
        } else {
            Ok(())
        }
    }
}

impl<'a, C: Link> Drop for Transaction<'a, C> {
    fn drop(&mut self) {
        if self.state.is_open() {
            warn!(
                connection_id = %self.pipeline.conn.id(),
                commands = self.user_command_count,
                "transaction dropped while open, rolling back"
            );
            self.pipeline.operations.clear();
            self.state = TransactionState::RolledBack;
        }
        if self.watching {
            debug!(
                connection_id = %self.pipeline.conn.id(),
                "transaction dropped with WATCH armed, next exchange sends UNWATCH"
            );
            self.pipeline.conn.set_unwatch_pending(true);
        }
    }
}
