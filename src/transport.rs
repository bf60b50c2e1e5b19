//! Line-delimited JSON transport over any async byte stream.
//!
//! One reader task decodes inbound lines into [`StreamingMessage`]s, one
//! writer task owns the write half and serializes every outbound message.
//! Lines are read as raw bytes, so invalid UTF-8 is just another malformed
//! message. Malformed or oversized lines are dropped; I/O errors end the
//! session.

use crate::errors::TransportError;
use crate::protocol::{Content, StartStream, StreamingMessage};
use crate::runtime::Worker;
use crate::runtime::limits::MESSAGE_QUEUE_CAPACITY;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tracing::{debug, error, info, warn};

/// One newline-delimited frame, or the marker left by a frame that exceeded
/// the length limit and was discarded.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(Bytes),
    Oversized,
}

/// Splits the inbound byte stream on `\n` without buffering more than
/// `max_length` bytes of any one frame. Oversized frames surface as
/// [`Frame::Oversized`] instead of an error so the stream keeps going.
#[derive(Debug)]
pub struct FrameDecoder {
    inner: AnyDelimiterCodec,
}

impl FrameDecoder {
    pub fn new(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length),
        }
    }

    fn map(result: Result<Option<Bytes>, AnyDelimiterCodecError>) -> std::io::Result<Option<Frame>> {
        match result {
            Ok(frame) => Ok(frame.map(Frame::Line)),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(AnyDelimiterCodecError::Io(e)) => Err(e),
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        Self::map(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        Self::map(self.inner.decode_eof(buf))
    }
}

/// Decode inbound frames until EOF. Returns `Ok(())` on a clean close.
pub fn spawn_reader<R>(
    reader: R,
    max_message_length: usize,
    inbound: mpsc::Sender<StreamingMessage>,
) -> JoinHandle<Result<(), TransportError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut frames = FramedRead::new(reader, FrameDecoder::new(max_message_length));
        while let Some(frame) = frames.next().await {
            let line = match frame? {
                Frame::Line(line) => line,
                Frame::Oversized => {
                    warn!(limit = max_message_length, "transport: oversized message dropped");
                    continue;
                }
            };
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<StreamingMessage>(line) {
                Ok(message) => {
                    if inbound.send(message).await.is_err() {
                        debug!("transport: worker stopped reading; closing reader");
                        break;
                    }
                }
                Err(e) => warn!(error = %e, length = line.len(), "transport: malformed message dropped"),
            }
        }
        Ok(())
    })
}

/// Encode and write outbound messages until every sender is dropped.
pub fn spawn_writer<W>(
    writer: W,
    mut outbound: mpsc::Receiver<StreamingMessage>,
) -> JoinHandle<Result<(), TransportError>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outbound.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!(request_id = %message.request_id, error = %e, "transport: cannot encode message; dropped");
                    continue;
                }
            };
            line.push(b'\n');
            writer.write_all(&line).await?;
            writer.flush().await?;
        }
        writer.shutdown().await?;
        Ok(())
    })
}

/// Run a worker session over an established stream: announce the worker,
/// then serve until the host terminates or disconnects.
pub async fn serve<R, W>(
    worker: Arc<Worker>,
    reader: R,
    writer: W,
    worker_id: &str,
    max_message_length: usize,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (inbound_tx, inbound_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);

    let writer_task = spawn_writer(writer, outbound_rx);
    outbound_tx
        .send(StreamingMessage::new(
            "",
            Content::StartStream(StartStream {
                worker_id: worker_id.to_string(),
            }),
        ))
        .await
        .map_err(|_| TransportError::Closed)?;
    let reader_task = spawn_reader(reader, max_message_length, inbound_tx);

    let run_result = worker.run(inbound_rx, outbound_tx).await;
    reader_task.abort();

    let writer_result = match writer_task.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "transport: writer task failed");
            Err(TransportError::Closed)
        }
    };
    let reader_result = match reader_task.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => {
            error!(error = %e, "transport: reader task failed");
            Err(TransportError::Closed)
        }
    };

    info!(worker_id = %worker_id, "session ended");
    run_result.and(reader_result).and(writer_result)
}

/// Connect to the host over TCP and serve one session.
pub async fn connect(
    worker: Arc<Worker>,
    host: &str,
    port: u16,
    worker_id: &str,
    max_message_length: usize,
) -> Result<(), TransportError> {
    info!(host = %host, port, worker_id = %worker_id, "connecting to host");
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    serve(worker, reader, writer, worker_id, max_message_length).await
}
