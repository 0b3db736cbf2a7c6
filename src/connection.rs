use bytes::BytesMut;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::command::{reply, Command};
use crate::config::Config;
use crate::frame::Frame;
use crate::operation::ReplyKind;
use crate::pipeline;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum LinkState {
    /// No exchange in progress, replies are in sync with requests.
    Ready,
    /// Requests were written and not all replies have been read yet.
    InFlight,
    /// A fatal error or an abandoned exchange left the stream in an unknown position.
    Broken,
}

/// Bookkeeping shared by blocking and async connections.
///
/// Every batch runs between `begin_exchange` and `end_exchange`. If the batch never reaches
/// `end_exchange`, because its future was dropped or a callback panicked, the connection stays
/// `InFlight` and the next batch refuses to run on it.
pub trait Link {
    fn id(&self) -> Uuid;

    fn state(&self) -> LinkState;

    fn set_state(&mut self, state: LinkState);

    /// Set when a transaction that issued WATCH was dropped without releasing it. The next
    /// exchange sends UNWATCH ahead of its own requests.
    fn unwatch_pending(&self) -> bool;

    fn set_unwatch_pending(&mut self, pending: bool);

    fn is_usable(&self) -> bool {
        self.state() == LinkState::Ready
    }

    fn begin_exchange(&mut self) -> Result<()> {
        match self.state() {
            LinkState::Ready => {
                self.set_state(LinkState::InFlight);
                Ok(())
            }
            LinkState::InFlight => {
                warn!(connection_id = %self.id(), "previous exchange was abandoned mid-way");
                self.set_state(LinkState::Broken);
                Err(Error::ConnectionBroken)
            }
            LinkState::Broken => Err(Error::ConnectionBroken),
        }
    }

    fn end_exchange<T>(&mut self, result: &Result<T>) {
        match result {
            Err(err) if err.is_fatal() => {
                debug!(connection_id = %self.id(), error = %err, "connection marked unusable");
                self.set_state(LinkState::Broken);
            }
            _ => self.set_state(LinkState::Ready),
        }
    }
}

/// Blocking transport.
pub trait Transport: Link {
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;

    fn read_frame(&mut self) -> Result<Frame>;
}

/// Suspending transport, suspends only while writing and while waiting for a reply.
pub trait AsyncTransport: Link {
    fn write_bytes<'s>(&'s mut self, buf: &'s [u8]) -> BoxFuture<'s, Result<()>>;

    fn read_frame(&mut self) -> BoxFuture<'_, Result<Frame>>;
}

/// A blocking connection over any byte stream.
pub struct Connection<S> {
    id: Uuid,
    stream: S,
    codec: FrameCodec,
    // Data is read from the stream into the buffer. When a frame is parsed, the corresponding
    // data is removed from the buffer.
    buffer: BytesMut,
    state: LinkState,
    unwatch_pending: bool,
}

impl Connection<TcpStream> {
    pub fn connect(addr: impl ToSocketAddrs, config: &Config) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;

        Ok(Connection::with_config(stream, config))
    }
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Connection<S> {
        Connection::with_config(stream, &Config::default())
    }

    pub fn with_config(stream: S, config: &Config) -> Connection<S> {
        Connection {
            id: Uuid::new_v4(),
            stream,
            codec: FrameCodec::new(config.max_frame_size),
            buffer: BytesMut::with_capacity(config.read_buffer_capacity),
            state: LinkState::Ready,
            unwatch_pending: false,
        }
    }

    /// Sends a single command and waits for its reply.
    pub fn send(&mut self, command: &Command) -> Result<Frame> {
        pipeline::round_trip(self, command, ReplyKind::Any)
    }

    /// Watches keys for the next transaction on this connection.
    pub fn watch<I, K>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<bytes::Bytes>,
    {
        let command = Command::watch(keys);
        pipeline::round_trip(self, &command, ReplyKind::Ack(reply::OK)).map(|_| ())
    }

    pub fn unwatch(&mut self) -> Result<()> {
        pipeline::round_trip(self, &Command::unwatch(), ReplyKind::Ack(reply::OK)).map(|_| ())
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> Link for Connection<S> {
    fn id(&self) -> Uuid {
        self.id
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

impl<S: Read + Write> Transport for Connection<S> {
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        let mut chunk = [0u8; 4096];

        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(frame);
            }

            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// A tokio connection over any async byte stream.
pub struct AsyncConnection<S> {
    id: Uuid,
    reader: FramedRead<ReadHalf<S>, FrameCodec>,
    writer: WriteHalf<S>,
    state: LinkState,
    unwatch_pending: bool,
}

impl AsyncConnection<tokio::net::TcpStream> {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs, config: &Config) -> Result<Self> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(AsyncConnection::with_config(stream, config))
    }
}

impl<S> AsyncConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(stream: S) -> AsyncConnection<S> {
        AsyncConnection::with_config(stream, &Config::default())
    }

    pub fn with_config(stream: S, config: &Config) -> AsyncConnection<S> {
        let (reader, writer) = tokio::io::split(stream);

        AsyncConnection {
            id: Uuid::new_v4(),
            reader: FramedRead::with_capacity(
                reader,
                FrameCodec::new(config.max_frame_size),
                config.read_buffer_capacity,
            ),
            writer,
            state: LinkState::Ready,
            unwatch_pending: false,
        }
    }

    pub async fn send(&mut self, command: &Command) -> Result<Frame> {
        pipeline::round_trip_async(self, command, ReplyKind::Any).await
    }

    pub async fn watch<I, K>(&mut self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<bytes::Bytes>,
    {
        let command = Command::watch(keys);
        pipeline::round_trip_async(self, &command, ReplyKind::Ack(reply::OK))
            .await
            .map(|_| ())
    }

    pub async fn unwatch(&mut self) -> Result<()> {
        pipeline::round_trip_async(self, &Command::unwatch(), ReplyKind::Ack(reply::OK))
            .await
            .map(|_| ())
    }
}

impl<S> Link for AsyncConnection<S> {
    fn id(&self) -> Uuid {
        self.id
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

impl<S> AsyncTransport for AsyncConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn write_bytes<'s>(&'s mut self, buf: &'s [u8]) -> BoxFuture<'s, Result<()>> {
        async move {
            self.writer.write_all(buf).await?;
            self.writer.flush().await?;
            Ok(())
        }
        .boxed()
    }

    fn read_frame(&mut self) -> BoxFuture<'_, Result<Frame>> {
        async move {
            match self.reader.next().await {
                Some(frame) => frame,
                None => Err(Error::ConnectionClosed),
            }
        }
        .boxed()
    }
}
