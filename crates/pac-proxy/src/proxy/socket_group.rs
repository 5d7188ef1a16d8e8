//! Fault correlation for the sockets of one proxied request.
//!
//! Every endpoint taking part in a session (client connection, upstream
//! connection, upgraded tunnel halves) is registered in one [`SocketGroup`].
//! The first error reported by any member destroys all of them; later errors
//! from members that are already gone are ignored.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, warn};

/// Something a group can tear down.
pub trait Endpoint: Send + Sync {
    fn label(&self) -> &str;
    fn destroy(&self);
}

/// A destroyable endpoint backed by a cancellation token.
///
/// Whoever owns the actual socket watches [`SocketHandle::destroyed`] (or wraps
/// the socket in a [`GroupedStream`]) and drops it once the handle fires.
#[derive(Debug)]
pub struct SocketHandle {
    label: &'static str,
    token: CancellationToken,
}

impl SocketHandle {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            token: CancellationToken::new(),
        })
    }

    pub fn is_destroyed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the handle has been destroyed.
    pub async fn destroyed(&self) {
        self.token.cancelled().await
    }

    fn destroyed_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }
}

impl Endpoint for SocketHandle {
    fn label(&self) -> &str {
        self.label
    }

    fn destroy(&self) {
        self.token.cancel();
    }
}

#[derive(Default)]
struct GroupState {
    members: Vec<Arc<dyn Endpoint>>,
    closed: bool,
}

struct Inner {
    target: String,
    state: Mutex<GroupState>,
}

/// The set of endpoints participating in one session.
#[derive(Clone)]
pub struct SocketGroup {
    inner: Arc<Inner>,
}

impl SocketGroup {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                target: target.into(),
                state: Mutex::new(GroupState::default()),
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Add an endpoint. Registering the same endpoint twice is a no-op.
    ///
    /// If the group is already closed the endpoint is destroyed right away so
    /// a late connection cannot outlive a failed session. Returns whether the
    /// endpoint became a member.
    pub fn register(&self, endpoint: Arc<dyn Endpoint>) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            drop(state);
            debug!(
                "{}: {} registered after teardown, destroying",
                self.inner.target,
                endpoint.label()
            );
            endpoint.destroy();
            return false;
        }
        if state
            .members
            .iter()
            .any(|member| std::ptr::addr_eq(Arc::as_ptr(member), Arc::as_ptr(&endpoint)))
        {
            return false;
        }
        state.members.push(endpoint);
        true
    }

    /// Report an error from `source`. The first report tears down every member.
    pub fn fail(&self, source: &str, err: &dyn fmt::Display) {
        let Some(members) = self.take_members() else {
            return;
        };
        warn!(
            "{}: {} error: {}; closing {} socket(s)",
            self.inner.target,
            source,
            err,
            members.len()
        );
        for member in members {
            member.destroy();
        }
    }

    /// End the session normally, destroying every member.
    pub fn close(&self) {
        let Some(members) = self.take_members() else {
            return;
        };
        debug!(
            "{}: closing {} socket(s)",
            self.inner.target,
            members.len()
        );
        for member in members {
            member.destroy();
        }
    }

    /// Mark the group closed and hand back its members, once.
    fn take_members(&self) -> Option<Vec<Arc<dyn Endpoint>>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        Some(std::mem::take(&mut state.members))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SocketGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SocketGroup")
            .field("target", &self.inner.target)
            .field("members", &state.members.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// A stream registered in a [`SocketGroup`].
///
/// I/O errors are reported to the group. Once the stream's handle is
/// destroyed every further operation fails with `ConnectionAborted`, which
/// unblocks whatever task is driving it.
pub struct GroupedStream<S> {
    inner: S,
    handle: Arc<SocketHandle>,
    group: SocketGroup,
    destroyed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl<S> GroupedStream<S> {
    pub fn register(group: &SocketGroup, label: &'static str, inner: S) -> Self {
        let handle = SocketHandle::new(label);
        group.register(handle.clone());
        let destroyed = Box::pin(handle.destroyed_owned());
        Self {
            inner,
            handle,
            group: group.clone(),
            destroyed,
        }
    }

    pub fn handle(&self) -> &Arc<SocketHandle> {
        &self.handle
    }

    fn poll_destroyed(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        let gone =
            self.handle.is_destroyed() || self.destroyed.as_mut().poll(cx).is_ready();
        gone.then(|| {
            io::Error::new(
                io::ErrorKind::ConnectionAborted,
                format!("{} socket destroyed", self.handle.label),
            )
        })
    }

    fn report<T>(&self, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(e)) = &poll {
            self.group.fail(self.handle.label, e);
        }
        poll
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for GroupedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_destroyed(cx) {
            return Poll::Ready(Err(e));
        }
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.report(poll)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for GroupedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_destroyed(cx) {
            return Poll::Ready(Err(e));
        }
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.report(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_destroyed(cx) {
            return Poll::Ready(Err(e));
        }
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.report(poll)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(e) = this.poll_destroyed(cx) {
            return Poll::Ready(Err(e));
        }
        // A peer that already hung up makes shutdown fail; that is not a fault.
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
