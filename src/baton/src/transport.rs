//! Newline-delimited JSON-RPC framing over byte streams.
//!
//! Two transport actors per connection: a reader that parses each line into
//! a [`Message`] (malformed lines surface as `Err` items for the consumer to
//! act on), and a writer that serializes frames one per line, flushing after
//! each. No batching. The actors know nothing about ids, correlation, or
//! routing.

use futures::channel::mpsc;
use futures::future;
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::connector::{Channel, Connector, IoFuture};
use crate::jsonrpc::Message;
use crate::Error;

pub(crate) async fn read_frames(
    reader: impl AsyncRead + Unpin,
    tx: mpsc::UnboundedSender<Result<Message, Error>>,
) -> Result<(), Error> {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            // EOF: drop the sender so the consumer observes the close.
            Ok(None) => return Ok(()),
            Err(err) => return Err(Error::into_internal_error(err)),
        };
        if line.trim().is_empty() {
            continue;
        }
        tracing::trace!(frame = %line, "received frame");
        let parsed = Message::from_line(&line).map_err(|err| err.with_data(json!({ "line": line })));
        if tx.unbounded_send(parsed).is_err() {
            // Consumer is gone; nothing left to deliver to.
            return Ok(());
        }
    }
}

pub(crate) async fn write_frames(
    mut rx: mpsc::UnboundedReceiver<Result<Message, Error>>,
    writer: impl AsyncWrite + Unpin,
) -> Result<(), Error> {
    let mut writer = writer;
    while let Some(frame) = rx.next().await {
        let message = frame?;
        let mut line = serde_json::to_string(&message).map_err(Error::into_internal_error)?;
        tracing::trace!(frame = %line, "sending frame");
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(Error::into_internal_error)?;
        writer.flush().await.map_err(Error::into_internal_error)?;
    }
    Ok(())
}

/// A connector over any byte stream pair (sockets, pipes, duplex streams).
pub struct ByteStreams<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> ByteStreams<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        ByteStreams { reader, writer }
    }
}

impl<R, W> Connector for ByteStreams<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn connect(self: Box<Self>) -> Result<(Channel, IoFuture), Error> {
        let (near, far) = Channel::duplex();
        let ByteStreams { reader, writer } = *self;
        let driver = async move {
            future::try_join(read_frames(reader, far.tx), write_frames(far.rx, writer)).await?;
            Ok(())
        };
        Ok((near, Box::pin(driver)))
    }
}

/// A connector speaking on the process's own stdin/stdout.
///
/// Stdout carries frames only; diagnostics must go to stderr.
pub struct Stdio;

impl Connector for Stdio {
    fn connect(self: Box<Self>) -> Result<(Channel, IoFuture), Error> {
        Box::new(ByteStreams::new(tokio::io::stdin(), tokio::io::stdout())).connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{Id, Request};

    #[tokio::test]
    async fn frames_round_trip_over_duplex_streams() {
        let (near_io, far_io) = tokio::io::duplex(1024);
        let (near_read, near_write) = tokio::io::split(near_io);
        let (far_read, far_write) = tokio::io::split(far_io);

        let (near, near_driver) =
            Box::new(ByteStreams::new(near_read, near_write)).connect().unwrap();
        let (mut far, far_driver) =
            Box::new(ByteStreams::new(far_read, far_write)).connect().unwrap();
        tokio::spawn(near_driver);
        tokio::spawn(far_driver);

        near.tx
            .unbounded_send(Ok(Message::Request(Request::new(Id::from(1), "ping", None))))
            .unwrap();
        let frame = far.rx.next().await.unwrap().unwrap();
        assert_eq!(frame.method(), Some("ping"));
    }

    #[tokio::test]
    async fn malformed_line_surfaces_as_error_item() {
        let (near_io, far_io) = tokio::io::duplex(1024);
        let (_near_read, mut near_write) = tokio::io::split(near_io);
        let (far_read, far_write) = tokio::io::split(far_io);

        let (mut far, far_driver) =
            Box::new(ByteStreams::new(far_read, far_write)).connect().unwrap();
        tokio::spawn(far_driver);

        near_write.write_all(b"this is not json\n").await.unwrap();
        let item = far.rx.next().await.unwrap();
        assert_eq!(item.unwrap_err().code, crate::error::PARSE_ERROR);
    }
}
