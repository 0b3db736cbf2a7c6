//! A scripted transport for unit tests.

use futures::future::{BoxFuture, FutureExt};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::connection::{AsyncTransport, Link, LinkState, Transport};
use crate::frame::Frame;
use crate::{Error, Result};

/// Answers with scripted frames and records what was written.
pub(crate) struct Script {
    pub(crate) replies: VecDeque<Frame>,
    pub(crate) written: Vec<u8>,
    pub(crate) writes: usize,
    state: LinkState,
    unwatch_pending: bool,
}

impl Script {
    pub(crate) fn new(replies: Vec<Frame>) -> Script {
        Script {
            replies: replies.into(),
            written: Vec::new(),
            writes: 0,
            state: LinkState::Ready,
            unwatch_pending: false,
        }
    }
}

impl Link for Script {
    fn id(&self) -> Uuid {
        Uuid::nil()
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }

    fn unwatch_pending(&self) -> bool {
        self.unwatch_pending
    }

    fn set_unwatch_pending(&mut self, pending: bool) {
        self.unwatch_pending = pending;
    }
}

impl Transport for Script {
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.writes += 1;
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.replies.pop_front().ok_or(Error::ConnectionClosed)
    }
}

impl AsyncTransport for Script {
    fn write_bytes<'s>(&'s mut self, buf: &'s [u8]) -> BoxFuture<'s, Result<()>> {
        async move { Transport::write_bytes(self, buf) }.boxed()
    }

    fn read_frame(&mut self) -> BoxFuture<'_, Result<Frame>> {
        async move {
            tokio::task::yield_now().await;
            Transport::read_frame(self)
        }
        .boxed()
    }
}

pub(crate) fn ok() -> Frame {
    Frame::Simple("OK".to_string())
}
