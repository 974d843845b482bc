//! The seam between the connection core and whatever carries its frames.
//!
//! Socket setup, authentication and header encoding belong to the
//! transport. The core only needs an ordered stream of frames in each
//! direction, so a transport splits into a [`FrameSink`] and a
//! [`FrameSource`] that the connection's writer and read loop own.

use crate::error::{Error, Result};
use crate::message::{Frame, Message};

use std::future::Future;
use tokio::sync::mpsc;

pub trait FrameSink: Send + 'static {
    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<()>> + Send;
}

pub trait FrameSource: Send + 'static {
    /// The next frame from the peer, or `Ok(None)` once the peer has
    /// closed its side.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Frame>>> + Send;
}

pub trait Transport: Send + 'static {
    type Sink: FrameSink;
    type Source: FrameSource;

    fn split(self) -> (Self::Sink, Self::Source);
}

/// In-process transport backed by channels. The other end is a [`PeerEnd`].
pub struct ChannelTransport {
    sink: ChannelSink,
    source: ChannelSource,
}

pub struct ChannelSink(mpsc::UnboundedSender<Frame>);

pub struct ChannelSource(mpsc::UnboundedReceiver<Result<Frame>>);

/// The far side of a [`ChannelTransport`], standing in for the bus.
///
/// Dropping it looks to the connection like the socket closing.
pub struct PeerEnd {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<Result<Frame>>,
    next_serial: u32,
}

pub fn channel_pair() -> (ChannelTransport, PeerEnd) {
    let (to_peer, from_connection) = mpsc::unbounded_channel();
    let (to_connection, from_peer) = mpsc::unbounded_channel();
    let transport = ChannelTransport {
        sink: ChannelSink(to_peer),
        source: ChannelSource(from_peer),
    };
    let peer = PeerEnd {
        incoming: from_connection,
        outgoing: to_connection,
        next_serial: 1,
    };
    (transport, peer)
}

impl Transport for ChannelTransport {
    type Sink = ChannelSink;
    type Source = ChannelSource;

    fn split(self) -> (ChannelSink, ChannelSource) {
        (self.sink, self.source)
    }
}

impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.0
            .send(frame)
            .map_err(|_| Error::ConnectionBroken("peer end dropped".to_owned()))
    }
}

impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Frame>> {
        self.0.recv().await.transpose()
    }
}

impl PeerEnd {
    /// Next frame sent by the connection, `None` once it is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    pub fn send(&self, frame: Frame) -> Result<()> {
        self.outgoing.send(Ok(frame)).map_err(|_| Error::NotConnected)
    }

    /// Marshal `message` under the peer's own serial counter and send it.
    pub fn reply(&mut self, message: Message) -> Result<()> {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        self.send(message.into_frame(serial)?)
    }

    /// Make the connection's next read fail as if the socket errored.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self
            .outgoing
            .send(Err(Error::ConnectionBroken(reason.into())));
    }
}
