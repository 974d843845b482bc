//! Connection lifetime and call correlation.
//!
//! A connection lives inside the scope opened by [`MessageBus::connect`].
//! The scope supervises every task working on the connection: the read
//! loop, the writer, and anything started through [`Connection::spawn`].
//! When the scope ends, for whatever reason, it cancels and joins all of
//! them and fails every call still waiting for a reply. Nothing is left
//! running and nobody is left waiting.
//!
//! ```ignore
//! let bus = MessageBus::new(BusConfig::default());
//! let reply = bus
//!     .connect(transport, |conn| async move {
//!         conn.call(Message::method_call(
//!             "org.freedesktop.DBus",
//!             "/org/freedesktop/DBus",
//!             "org.freedesktop.DBus",
//!             "GetId",
//!         ))
//!         .await
//!     })
//!     .await?;
//! ```

use crate::error::{Error, Result};
use crate::message::{Frame, Message, MessageType};

use log::{debug, error, trace};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

mod config;
mod pending;
pub mod transport;

pub use config::BusConfig;
use pending::{PendingCalls, PendingGuard};
use transport::{FrameSink, FrameSource, Transport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Entry point: holds configuration and reports connection state.
pub struct MessageBus {
    config: BusConfig,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Run `body` inside a connection scope over `transport`.
    ///
    /// Returns `Ok(Some(_))` with the body's result when it completes,
    /// `Ok(None)` when [`Connection::disconnect`] ended the scope first, and
    /// `Err(_)` when the body failed or the transport broke. A transport
    /// failure wins over whatever the body returned, so the owner of the
    /// connection always learns about it.
    pub async fn connect<T, F, Fut, R>(&self, transport: T, body: F) -> Result<Option<R>>
    where
        T: Transport,
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let acquired = self.state.send_if_modified(|state| {
            if *state != ConnectionState::Disconnected {
                return false;
            }
            *state = ConnectionState::Connecting;
            true
        });
        if !acquired {
            return Err(Error::AlreadyConnected);
        }
        debug!("connecting");

        let (sink, source) = transport.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let scope = Arc::new(Scope {
            config: self.config.clone(),
            state: watch::channel(ConnectionState::Connecting).0,
            bus_state: Arc::clone(&self.state),
            transition: Mutex::new(()),
            pending: PendingCalls::default(),
            next_serial: AtomicU32::new(self.config.first_serial.max(1)),
            token: CancellationToken::new(),
            outgoing,
            children: Mutex::new(Some(JoinSet::new())),
            failure: Mutex::new(None),
        });
        let guard = ScopeGuard(Arc::clone(&scope));

        scope.spawn_child(read_loop(Arc::clone(&scope), source))?;
        scope.spawn_child(write_loop(Arc::clone(&scope), sink, outgoing_rx))?;
        scope.set_state(ConnectionState::Connected);
        debug!("connected");

        let mut body = Box::pin(body(Connection {
            scope: Arc::clone(&scope),
        }));
        let outcome = tokio::select! {
            biased;
            result = &mut body => Some(result),
            _ = scope.token.cancelled() => None,
        };
        drop(body);

        scope.shutdown().await;
        drop(guard);

        if let Some(failure) = scope.failure() {
            return Err(failure);
        }
        outcome.transpose()
    }
}

/// Handle to a live connection, usable from inside its scope.
///
/// A handle belongs to one scope. Once that scope has ended the handle
/// reports `Disconnected` and refuses new work, even if the bus has
/// connected again since.
#[derive(Clone)]
pub struct Connection {
    scope: Arc<Scope>,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        *self.scope.state.borrow()
    }

    /// Send a method call and wait for its reply.
    ///
    /// An error reply comes back as [`Error::MethodError`]. If the
    /// connection ends first the call fails with
    /// [`Error::ConnectionBroken`]. A call flagged `no_reply_expected` is
    /// only sent and yields `Ok(None)`.
    pub async fn call(&self, message: Message) -> Result<Option<Message>> {
        if message.no_reply_expected {
            self.send(message).await?;
            return Ok(None);
        }

        let scope = &self.scope;
        if scope.token.is_cancelled() {
            return Err(Error::NotConnected);
        }

        let serial = scope.next_serial();
        let frame = scope.prepare(message, serial)?;

        let slot = scope.pending.register(serial)?;
        let _guard = PendingGuard {
            pending: &scope.pending,
            serial,
        };
        scope
            .outgoing
            .send(frame)
            .map_err(|_| Error::NotConnected)?;
        trace!("call {} sent", serial);

        let reply = match scope.config.call_timeout {
            Some(timeout) => tokio::time::timeout(timeout, slot)
                .await
                .map_err(|_| Error::Timeout(serial))?,
            None => slot.await,
        };
        let reply = reply
            .map_err(|_| Error::ConnectionBroken("reply slot dropped".to_owned()))??
            .into_message()?;

        match reply.message_type {
            MessageType::Error => Err(reply.into()),
            _ => Ok(Some(reply)),
        }
    }

    /// Send a message without waiting for anything back. Returns its serial.
    pub async fn send(&self, message: Message) -> Result<u32> {
        let scope = &self.scope;
        if scope.token.is_cancelled() {
            return Err(Error::NotConnected);
        }

        let serial = scope.next_serial();
        let frame = scope.prepare(message, serial)?;
        scope
            .outgoing
            .send(frame)
            .map_err(|_| Error::NotConnected)?;
        Ok(serial)
    }

    /// End the connection and wait until it is torn down.
    ///
    /// Teardown cancels everything running in the scope. Called from inside
    /// the scope, this call therefore never returns: the caller is
    /// cancelled at this await point. On a handle whose scope has already
    /// ended it returns at once.
    pub async fn disconnect(&self) {
        let scope = &self.scope;
        let mut state = scope.state.subscribe();
        if scope.set_state(ConnectionState::Disconnecting) {
            debug!("disconnect requested");
        }
        scope.token.cancel();

        let _ = state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    /// Run `task` as a child of the connection scope. It is cancelled when
    /// the scope ends.
    pub fn spawn<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.scope.token.clone();
        self.scope.spawn_child(async move {
            tokio::select! {
                _ = token.cancelled() => (),
                _ = task => (),
            }
        })
    }

    pub fn serial_is_pending(&self, serial: u32) -> bool {
        self.scope.pending.contains(serial)
    }

    pub fn pending_calls(&self) -> usize {
        self.scope.pending.len()
    }
}

struct Scope {
    config: BusConfig,
    state: watch::Sender<ConnectionState>,
    bus_state: Arc<watch::Sender<ConnectionState>>,
    // Serializes state changes so the bus never sees them out of order.
    transition: Mutex<()>,
    pending: PendingCalls,
    next_serial: AtomicU32,
    token: CancellationToken,
    outgoing: mpsc::UnboundedSender<Frame>,
    children: Mutex<Option<JoinSet<()>>>,
    failure: Mutex<Option<Error>>,
}

impl Scope {
    /// Move this scope to `state` and mirror it on the bus. `Disconnected`
    /// is final: once there, the scope no longer touches the bus, which may
    /// already belong to a newer scope. Returns whether anything changed.
    fn set_state(&self, state: ConnectionState) -> bool {
        let _transition = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = self.state.send_if_modified(|current| {
            if *current == ConnectionState::Disconnected || *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            self.bus_state.send_replace(state);
        }
        changed
    }

    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    fn prepare(&self, message: Message, serial: u32) -> Result<Frame> {
        let frame = message.into_frame(serial)?;
        if !frame.unix_fds.is_empty() && !self.config.negotiate_unix_fd {
            return Err(Error::UnixFdNotNegotiated);
        }
        Ok(frame)
    }

    fn spawn_child<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
        match children.as_mut() {
            Some(children) => {
                children.spawn(task);
                Ok(())
            }
            None => Err(Error::NotConnected),
        }
    }

    fn failure(&self) -> Option<Error> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn dispatch(&self, frame: Frame) {
        match frame.reply_serial {
            Some(serial) if frame.is_reply() => {
                if !self.pending.resolve(serial, frame) {
                    debug!("reply to {} matches no pending call", serial);
                }
            }
            _ => trace!(
                "dropping unsolicited {:?} with serial {}",
                frame.message_type,
                frame.serial
            ),
        }
    }

    /// Unexpected end of the connection: record why, fail every waiting
    /// call, and ask the scope to end.
    fn fail(&self, err: Error) {
        let err = match err {
            Error::ConnectionBroken(_) => err,
            other => Error::ConnectionBroken(other.to_string()),
        };
        {
            let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if failure.is_some() {
                return;
            }
            *failure = Some(err.clone());
        }

        error!("{}", err);
        self.set_state(ConnectionState::Disconnected);
        let failed = self.pending.close(&err);
        debug!("failed {} pending calls", failed);
        self.token.cancel();
    }

    async fn shutdown(&self) {
        self.set_state(ConnectionState::Disconnecting);
        self.token.cancel();

        let children = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut children) = children {
            children.abort_all();
            while children.join_next().await.is_some() {}
        }

        let err = self
            .failure()
            .unwrap_or_else(|| Error::ConnectionBroken("disconnected".to_owned()));
        let failed = self.pending.close(&err);
        if failed > 0 {
            debug!("failed {} pending calls on disconnect", failed);
        }
        self.set_state(ConnectionState::Disconnected);
        debug!("disconnected");
    }
}

// Tears the scope down if `connect` is dropped before it could do so
// itself. Dropping the JoinSet aborts every child. Everything here is a
// no-op after a completed shutdown.
struct ScopeGuard(Arc<Scope>);

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let scope = &self.0;
        scope.token.cancel();
        drop(
            scope
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        scope
            .pending
            .close(&Error::ConnectionBroken("connection scope dropped".to_owned()));
        scope.set_state(ConnectionState::Disconnected);
    }
}

async fn read_loop<S: FrameSource>(scope: Arc<Scope>, mut source: S) {
    loop {
        let received = tokio::select! {
            biased;
            _ = scope.token.cancelled() => return,
            received = source.recv() => received,
        };
        match received {
            Ok(Some(frame)) => scope.dispatch(frame),
            Ok(None) => {
                scope.fail(Error::ConnectionBroken("transport closed".to_owned()));
                return;
            }
            Err(err) => {
                scope.fail(err);
                return;
            }
        }
    }
}

async fn write_loop<S: FrameSink>(
    scope: Arc<Scope>,
    mut sink: S,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = scope.token.cancelled() => return,
            frame = outgoing.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        let serial = frame.serial;
        if let Err(err) = sink.send(frame).await {
            scope.fail(err);
            return;
        }
        trace!("frame {} written", serial);
    }
}

#[cfg(test)]
mod tests {
    use super::transport::{channel_pair, PeerEnd};
    use super::*;
    use crate::value::Value;
    use std::time::Duration;
    use test_log::test;
    use tokio::sync::oneshot;

    fn ping() -> Message {
        Message::method_call(
            "org.freedesktop.DBus",
            "/org/freedesktop/DBus",
            "org.freedesktop.DBus",
            "Ping",
        )
    }

    // Answers every call with its own body, until the connection goes away.
    async fn echo(mut peer: PeerEnd) {
        while let Some(frame) = peer.recv().await {
            let serial = frame.serial;
            let call = frame.into_message().expect("valid call");
            let reply = Message::method_return(serial).with_body(call.signature, call.body);
            if peer.reply(reply).is_err() {
                return;
            }
        }
    }

    #[test(tokio::test)]
    async fn call_gets_reply() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        let (transport, peer) = channel_pair();
        tokio::spawn(echo(peer));

        let reply = bus
            .connect(transport, |conn| async move {
                assert_eq!(conn.state(), ConnectionState::Connected);
                conn.call(ping().with_body("s", vec!["hello".into()])).await
            })
            .await?
            .flatten()
            .expect("reply");

        assert_eq!(reply.message_type, MessageType::MethodReturn);
        assert_eq!(reply.reply_serial, Some(1));
        assert_eq!(reply.body, vec![Value::from("hello")]);
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        Ok(())
    }

    #[test(tokio::test)]
    async fn replies_matched_by_serial() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, mut peer) = channel_pair();

        tokio::spawn(async move {
            let first = peer.recv().await.expect("first call");
            let second = peer.recv().await.expect("second call");
            // Answer in reverse order.
            for frame in [second, first] {
                let serial = frame.serial;
                let reply = Message::method_return(serial).with_body("u", vec![serial.into()]);
                peer.reply(reply).expect("connection alive");
            }
            // Keep the transport open until the scope is done.
            while peer.recv().await.is_some() {}
        });

        bus.connect(transport, |conn| async move {
            let (a, b) = tokio::join!(conn.call(ping()), conn.call(ping()));
            let (a, b) = (a?.expect("reply"), b?.expect("reply"));
            assert_eq!(a.body, vec![Value::UInt32(a.reply_serial.expect("reply serial"))]);
            assert_eq!(b.body, vec![Value::UInt32(b.reply_serial.expect("reply serial"))]);
            assert_ne!(a.reply_serial, b.reply_serial);
            assert_eq!(conn.pending_calls(), 0);
            Ok(())
        })
        .await?;
        Ok(())
    }

    #[test(tokio::test)]
    async fn fds_cross_the_connection() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default().with_unix_fd(true));
        let (transport, mut peer) = channel_pair();

        tokio::spawn(async move {
            let frame = peer.recv().await.expect("call");
            assert_eq!(frame.unix_fds, vec![5]);
            assert_eq!(frame.data, vec![0, 0, 0, 0]);

            let mut reply = Message::method_return(frame.serial)
                .with_body("ah", vec![Value::Array(vec![Value::fd(7), Value::fd(8)])])
                .into_frame(1)
                .expect("reply marshals");
            // The peer only sends one of the two descriptors it refers to.
            reply.unix_fds.truncate(1);
            peer.send(reply).expect("connection alive");
            while peer.recv().await.is_some() {}
        });

        let reply = bus
            .connect(transport, |conn| async move {
                conn.call(ping().with_body("h", vec![Value::fd(5)])).await
            })
            .await?
            .flatten()
            .expect("reply");

        assert_eq!(
            reply.body,
            vec![Value::Array(vec![Value::fd(7), Value::UnixFd(None)])]
        );
        Ok(())
    }

    #[test(tokio::test)]
    async fn fds_need_negotiation() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, peer) = channel_pair();
        tokio::spawn(echo(peer));

        bus.connect(transport, |conn| async move {
            let result = conn.call(ping().with_body("h", vec![Value::fd(5)])).await;
            assert_eq!(result, Err(Error::UnixFdNotNegotiated));
            assert_eq!(conn.pending_calls(), 0);
            Ok(())
        })
        .await?;
        Ok(())
    }

    #[test(tokio::test)]
    async fn error_reply() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, mut peer) = channel_pair();

        tokio::spawn(async move {
            while let Some(frame) = peer.recv().await {
                let reply = Message::error(frame.serial, "test.error", "an error occurred");
                if peer.reply(reply).is_err() {
                    return;
                }
            }
        });

        let result = bus
            .connect(transport, |conn| async move { conn.call(ping()).await })
            .await;
        assert_eq!(
            result,
            Err(Error::MethodError {
                name: "test.error".to_owned(),
                text: "an error occurred".to_owned(),
                body: vec!["an error occurred".into()],
            })
        );
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        Ok(())
    }

    #[test(tokio::test)]
    #[allow(unreachable_code)]
    async fn disconnect_before_reply() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default().with_first_serial(7));
        let (transport, mut peer) = channel_pair();
        let (conn_tx, conn_rx) = oneshot::channel::<Connection>();

        // A caller outside the scope, so it sees how its call ends.
        let caller = tokio::spawn(async move {
            let conn = conn_rx.await.expect("connection handed over");
            let result = conn.call(ping()).await;
            (result, conn)
        });

        let outcome = bus
            .connect(transport, |conn| async move {
                let _ = conn_tx.send(conn.clone());
                let frame = peer.recv().await.expect("call sent");
                assert_eq!(frame.serial, 7);
                assert!(conn.serial_is_pending(7));

                conn.disconnect().await;
                panic!("disconnect returned inside its own scope");
                Ok(())
            })
            .await;
        assert_eq!(outcome, Ok(None));
        assert!(!bus.connected());

        let (result, conn) = caller.await.expect("caller finished");
        assert!(matches!(result, Err(Error::ConnectionBroken(_))), "{:?}", result);
        assert!(!conn.serial_is_pending(7));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // The scope is gone; new calls fail without being registered.
        assert_eq!(conn.call(ping()).await, Err(Error::NotConnected));
        assert_eq!(conn.pending_calls(), 0);
        Ok(())
    }

    #[test(tokio::test)]
    async fn unexpected_disconnect() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default().with_first_serial(3));
        let (transport, mut peer) = channel_pair();
        let (results_tx, results_rx) = oneshot::channel();

        let outcome = bus
            .connect(transport, |conn| async move {
                let (a, b, ()) = tokio::join!(conn.call(ping()), conn.call(ping()), async move {
                    let first = peer.recv().await.expect("first call");
                    let second = peer.recv().await.expect("second call");
                    let mut serials = [first.serial, second.serial];
                    serials.sort_unstable();
                    assert_eq!(serials, [3, 4]);
                    // The bus goes away without answering.
                    drop(peer);
                });
                let _ = results_tx.send((a, b, conn.clone()));
                Ok(())
            })
            .await;

        let failure = Error::ConnectionBroken("transport closed".to_owned());
        assert_eq!(outcome, Err(failure.clone()));

        let (a, b, conn) = results_rx.await.expect("body saw both results");
        assert_eq!(a, Err(failure.clone()));
        assert_eq!(b, Err(failure));
        assert!(!conn.serial_is_pending(3));
        assert!(!conn.serial_is_pending(4));
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        Ok(())
    }

    #[test(tokio::test)]
    async fn transport_error_ends_scope() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, mut peer) = channel_pair();

        tokio::spawn(async move {
            let _call = peer.recv().await;
            peer.fail("socket reset");
            while peer.recv().await.is_some() {}
        });

        let outcome = bus
            .connect(transport, |conn| async move { conn.call(ping()).await })
            .await;
        assert_eq!(
            outcome,
            Err(Error::ConnectionBroken("socket reset".to_owned()))
        );
        Ok(())
    }

    #[test(tokio::test(start_paused = true))]
    async fn call_timeout() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default().with_call_timeout(Duration::from_secs(5)));
        let (transport, mut peer) = channel_pair();

        tokio::spawn(async move { while peer.recv().await.is_some() {} });

        bus.connect(transport, |conn| async move {
            let result = conn.call(ping()).await;
            assert_eq!(result, Err(Error::Timeout(1)));
            assert!(!conn.serial_is_pending(1));
            Ok(())
        })
        .await?;
        Ok(())
    }

    #[test(tokio::test)]
    async fn dropped_call_is_forgotten() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, mut peer) = channel_pair();

        bus.connect(transport, |conn| async move {
            let mut call = Box::pin(conn.call(ping()));
            tokio::select! {
                _ = &mut call => panic!("nobody replies"),
                frame = peer.recv() => assert_eq!(frame.map(|frame| frame.serial), Some(1)),
            }
            assert!(conn.serial_is_pending(1));
            drop(call);
            assert!(!conn.serial_is_pending(1));
            Ok(())
        })
        .await?;
        Ok(())
    }

    #[test(tokio::test)]
    async fn no_reply_expected_is_not_tracked() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, mut peer) = channel_pair();

        bus.connect(transport, |conn| async move {
            let reply = conn.call(ping().with_no_reply_expected()).await?;
            assert_eq!(reply, None);
            assert_eq!(conn.pending_calls(), 0);

            let frame = peer.recv().await.expect("call sent");
            assert_eq!(frame.serial, 1);
            assert!(frame.no_reply_expected);
            assert_eq!(conn.send(ping()).await?, 2);
            Ok(())
        })
        .await?;
        Ok(())
    }

    #[test(tokio::test)]
    async fn body_error_propagates() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, peer) = channel_pair();
        tokio::spawn(echo(peer));

        let outcome: Result<Option<()>> = bus
            .connect(transport, |_conn| async move { Err(Error::NotConnected) })
            .await;
        assert_eq!(outcome, Err(Error::NotConnected));
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        Ok(())
    }

    #[test(tokio::test)]
    async fn children_end_with_scope() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, peer) = channel_pair();
        tokio::spawn(echo(peer));
        let (alive_tx, alive_rx) = oneshot::channel::<()>();

        bus.connect(transport, |conn| async move {
            conn.spawn(async move {
                let _alive = alive_tx;
                std::future::pending::<()>().await;
            })?;
            Ok(())
        })
        .await?;

        // The child was stopped, dropping its sender.
        assert!(alive_rx.await.is_err());
        Ok(())
    }

    #[test(tokio::test)]
    async fn connect_twice_at_once() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, peer) = channel_pair();
        tokio::spawn(echo(peer));

        bus.connect(transport, |_conn| async {
            let (again, _peer) = channel_pair();
            let nested = bus.connect(again, |_conn| async { Ok(()) }).await;
            assert_eq!(nested, Err(Error::AlreadyConnected));
            Ok(())
        })
        .await?;

        // Sequential reuse is fine.
        let (transport, peer) = channel_pair();
        tokio::spawn(echo(peer));
        let reply = bus
            .connect(transport, |conn| async move { conn.call(ping()).await })
            .await?;
        assert!(reply.flatten().is_some());
        Ok(())
    }

    #[test(tokio::test)]
    async fn old_handle_outlives_its_scope() -> Result<()> {
        let bus = MessageBus::new(BusConfig::default());
        let (transport, peer) = channel_pair();
        tokio::spawn(echo(peer));
        let old = bus
            .connect(transport, |conn| async move { Ok(conn) })
            .await?
            .expect("body completed");
        assert_eq!(old.state(), ConnectionState::Disconnected);

        let (transport, peer) = channel_pair();
        tokio::spawn(echo(peer));
        let reply = bus
            .connect(transport, |conn| async move {
                // The old handle speaks for its own, finished scope only.
                assert_eq!(old.state(), ConnectionState::Disconnected);
                let stopped = tokio::time::timeout(Duration::from_secs(2), old.disconnect()).await;
                assert!(stopped.is_ok(), "disconnect on an ended scope must return");
                assert_eq!(old.call(ping()).await, Err(Error::NotConnected));

                assert_eq!(conn.state(), ConnectionState::Connected);
                conn.call(ping()).await
            })
            .await?;
        assert!(reply.flatten().is_some());
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        Ok(())
    }

    async fn connect_until_released(
        bus: Arc<MessageBus>,
        mut release: watch::Receiver<bool>,
    ) -> Result<Option<()>> {
        let (transport, _peer) = channel_pair();
        bus.connect(transport, |_conn| async move {
            let _ = release.wait_for(|released| *released).await;
            Ok(())
        })
        .await
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn racing_connects_admit_one() -> Result<()> {
        let bus = Arc::new(MessageBus::new(BusConfig::default()));
        let (release_tx, release_rx) = watch::channel(false);

        let mut first = tokio::spawn(connect_until_released(Arc::clone(&bus), release_rx.clone()));
        let mut second = tokio::spawn(connect_until_released(Arc::clone(&bus), release_rx));

        // The loser returns right away; the winner holds the bus until released.
        let first_lost;
        let loser = tokio::select! {
            result = &mut first => {
                first_lost = true;
                result
            }
            result = &mut second => {
                first_lost = false;
                result
            }
        };
        let winner = if first_lost { second } else { first };
        assert_eq!(loser.expect("task finished"), Err(Error::AlreadyConnected));
        assert_ne!(bus.state(), ConnectionState::Disconnected);

        let _ = release_tx.send(true);
        assert_eq!(winner.await.expect("task finished"), Ok(Some(())));
        assert_eq!(bus.state(), ConnectionState::Disconnected);
        Ok(())
    }
}
