//! The connector contract for attaching pipeline components.
//!
//! A [`Connector`] opens exactly one bidirectional frame channel to a
//! component (client, proxy, or agent). Connecting yields a [`Channel`]
//! (a stream of inbound frames plus a sender for outbound frames) and a
//! boxed IO-driver future that must be polled for the transport to make
//! progress. Closing a connection is dropping its channel; the driver then
//! drains whatever was queued and finishes.

use futures::channel::mpsc;
use futures::future::BoxFuture;

use crate::jsonrpc::Message;
use crate::Error;

/// One side of a bidirectional frame channel.
///
/// `rx` yields inbound frames in arrival order; a parse failure arrives as an
/// `Err` item and the stream ends when the peer goes away. `tx` accepts
/// outbound frames.
pub struct Channel {
    pub rx: mpsc::UnboundedReceiver<Result<Message, Error>>,
    pub tx: mpsc::UnboundedSender<Result<Message, Error>>,
}

impl Channel {
    /// Create a crosswired in-process pair: frames sent on one side arrive
    /// on the other.
    pub fn duplex() -> (Channel, Channel) {
        let (a_tx, b_rx) = mpsc::unbounded();
        let (b_tx, a_rx) = mpsc::unbounded();
        (Channel { rx: a_rx, tx: a_tx }, Channel { rx: b_rx, tx: b_tx })
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// Future driving a connector's IO until the connection ends.
pub type IoFuture = BoxFuture<'static, Result<(), Error>>;

/// Something the conductor can open a frame channel to.
pub trait Connector: Send {
    /// Open the connection, yielding the conductor-side channel and the
    /// IO-driver future.
    fn connect(self: Box<Self>) -> Result<(Channel, IoFuture), Error>;
}

/// An already-established in-process channel is itself a connector.
///
/// Used by tests and embedders that wire components over [`Channel::duplex`]
/// rather than byte streams; there is no IO to drive.
impl Connector for Channel {
    fn connect(self: Box<Self>) -> Result<(Channel, IoFuture), Error> {
        Ok((*self, Box::pin(futures::future::ready(Ok(())))))
    }
}
