//! Framed RPC transport over a plugin's stdio.
//!
//! One [`Connection`] per plugin process. Frames are u32 big-endian
//! length-prefixed JSON ([`crate::protocol::Frame`]). The connection runs two
//! background tasks: a writer fed by an mpsc channel (serializing the write
//! side) and a reader that routes `Response` frames to pending callers and
//! `SdkRequest` frames to the host SDK handler. EOF or a read failure fails
//! every pending call with [`TransportError::ProcessExited`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    Frame, Hello, HelloAck, HostCall, PluginReply, SdkCall, SdkReply, PROTOCOL_VERSION,
};

/// Upper bound on a single frame's JSON payload.
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;

/// Transport and handshake failures.
///
/// Cloneable so a single read failure can be fanned out to every pending
/// caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    FrameTooLarge(usize),

    #[error("plugin process exited")]
    ProcessExited,

    #[error("connection closed")]
    Closed,

    #[error("protocol version mismatch: host speaks {expected}, plugin speaks {actual}")]
    ProtocolMismatch { expected: u32, actual: u32 },

    #[error("handshake token mismatch")]
    TokenMismatch,

    #[error("expected a hello frame, got something else")]
    UnexpectedFrame,

    #[error("timed out after {0:?} waiting for the plugin")]
    Timeout(Duration),
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        TransportError::Codec(e.to_string())
    }
}

fn map_io(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ProcessExited
    } else {
        TransportError::Io(e.to_string())
    }
}

/// Decode one frame payload (without the length prefix).
pub fn decode_frame(payload: &[u8]) -> Result<Frame, TransportError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Read one length-prefixed frame. EOF maps to `ProcessExited`.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Frame, TransportError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.map_err(map_io)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len as usize));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await.map_err(map_io)?;
    decode_frame(&payload)
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    w: &mut W,
    frame: &Frame,
) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes())
        .await
        .map_err(map_io)?;
    w.write_all(&payload).await.map_err(map_io)?;
    w.flush().await.map_err(map_io)?;
    Ok(())
}

/// Host-side handler for plugin-initiated SDK calls.
#[async_trait]
pub trait SdkHandler: Send + Sync {
    async fn handle(&self, plugin_id: &str, call: SdkCall) -> SdkReply;
}

enum WriterCommand {
    Frame(Frame),
    Shutdown,
}

#[derive(Debug)]
struct ConnState {
    pending: HashMap<u64, oneshot::Sender<Result<PluginReply, TransportError>>>,
    closed: bool,
}

/// An established, handshaken connection to one plugin process.
#[derive(Debug)]
pub struct Connection {
    plugin_id: String,
    writer_tx: mpsc::Sender<WriterCommand>,
    state: Arc<Mutex<ConnState>>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    api_in_flight: Arc<AtomicUsize>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Connection {
    /// Perform the handshake over the given byte streams and start the
    /// background tasks.
    ///
    /// The plugin must open with a `Hello` frame echoing `token` and speaking
    /// [`PROTOCOL_VERSION`], within `handshake_timeout`. Anything else leaves
    /// the streams dropped and the error returned; the caller owns killing
    /// the process.
    pub async fn establish<R, W>(
        stdout: R,
        stdin: W,
        token: &str,
        handshake_timeout: Duration,
        sdk: Arc<dyn SdkHandler>,
    ) -> Result<(Self, Hello), TransportError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = BufReader::new(stdout);
        let mut writer = BufWriter::new(stdin);

        let frame = tokio::time::timeout(handshake_timeout, read_frame(&mut reader))
            .await
            .map_err(|_| TransportError::Timeout(handshake_timeout))??;
        let hello = match frame {
            Frame::Hello(hello) => hello,
            _ => return Err(TransportError::UnexpectedFrame),
        };
        if hello.token != token {
            return Err(TransportError::TokenMismatch);
        }
        if hello.protocol != PROTOCOL_VERSION {
            return Err(TransportError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                actual: hello.protocol,
            });
        }
        write_frame(
            &mut writer,
            &Frame::HelloAck(HelloAck {
                protocol: PROTOCOL_VERSION,
            }),
        )
        .await?;

        let (writer_tx, writer_rx) = mpsc::channel::<WriterCommand>(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let state = Arc::new(Mutex::new(ConnState {
            pending: HashMap::new(),
            closed: false,
        }));
        let closed = Arc::new(AtomicBool::new(false));
        let api_in_flight = Arc::new(AtomicUsize::new(0));

        let writer_handle = tokio::spawn(Self::writer_loop(
            hello.plugin_id.clone(),
            writer,
            writer_rx,
            Arc::clone(&state),
            Arc::clone(&closed),
        ));
        let reader_handle = tokio::spawn(Self::reader_loop(
            hello.plugin_id.clone(),
            reader,
            Arc::clone(&state),
            Arc::clone(&closed),
            writer_tx.clone(),
            sdk,
            Arc::clone(&api_in_flight),
            shutdown_rx,
        ));

        let conn = Self {
            plugin_id: hello.plugin_id.clone(),
            writer_tx,
            state,
            closed,
            next_id: AtomicU64::new(0),
            api_in_flight,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            reader_handle,
            writer_handle,
        };
        Ok((conn, hello))
    }

    /// Send one call and wait for its correlated reply.
    pub async fn call(&self, call: HostCall) -> Result<PluginReply, TransportError> {
        let _guard = match call {
            HostCall::HandleApi(_) => Some(ApiGuard::enter(&self.api_in_flight)),
            _ => None,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state.lock().await;
            if st.closed {
                return Err(TransportError::Closed);
            }
            st.pending.insert(id, tx);
        }
        if self
            .writer_tx
            .send(WriterCommand::Frame(Frame::Request { id, call }))
            .await
            .is_err()
        {
            self.state.lock().await.pending.remove(&id);
            return Err(TransportError::Closed);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ProcessExited),
        }
    }

    /// Whether the read side has failed or the connection was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the background tasks and fail any pending calls.
    pub async fn close(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        fail_pending(&self.state, &self.closed, TransportError::Closed).await;
        self.reader_handle.abort();
        self.writer_handle.abort();
    }

    async fn writer_loop<W: AsyncWrite + Unpin>(
        plugin_id: String,
        mut writer: BufWriter<W>,
        mut rx: mpsc::Receiver<WriterCommand>,
        state: Arc<Mutex<ConnState>>,
        closed: Arc<AtomicBool>,
    ) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriterCommand::Frame(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        warn!(plugin = %plugin_id, error = %e, "Plugin write side failed");
                        fail_pending(&state, &closed, TransportError::ProcessExited).await;
                        break;
                    }
                }
                WriterCommand::Shutdown => break,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn reader_loop<R: AsyncRead + Unpin>(
        plugin_id: String,
        mut reader: BufReader<R>,
        state: Arc<Mutex<ConnState>>,
        closed: Arc<AtomicBool>,
        writer_tx: mpsc::Sender<WriterCommand>,
        sdk: Arc<dyn SdkHandler>,
        api_in_flight: Arc<AtomicUsize>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(plugin = %plugin_id, "Connection reader shutting down");
                    break;
                }
                frame = read_frame(&mut reader) => match frame {
                    Ok(Frame::Response { id, reply }) => {
                        let waiter = state.lock().await.pending.remove(&id);
                        match waiter {
                            Some(tx) => {
                                // Caller may have timed out and dropped the
                                // receiver; that is not an error.
                                let _ = tx.send(Ok(reply));
                            }
                            None => {
                                warn!(plugin = %plugin_id, id, "Response with no pending call")
                            }
                        }
                    }
                    Ok(Frame::SdkRequest { id, call }) => {
                        // The reverse channel is only granted while a
                        // HandleApi call is being serviced.
                        if api_in_flight.load(Ordering::SeqCst) == 0 {
                            warn!(plugin = %plugin_id, "SDK call outside an API call window");
                            let reply = SdkReply::Error(
                                "no API call in flight; SDK access is per-call".to_string(),
                            );
                            let _ = writer_tx
                                .send(WriterCommand::Frame(Frame::SdkResponse { id, reply }))
                                .await;
                        } else {
                            let sdk = Arc::clone(&sdk);
                            let writer_tx = writer_tx.clone();
                            let plugin_id = plugin_id.clone();
                            tokio::spawn(async move {
                                let reply = sdk.handle(&plugin_id, call).await;
                                let _ = writer_tx
                                    .send(WriterCommand::Frame(Frame::SdkResponse { id, reply }))
                                    .await;
                            });
                        }
                    }
                    Ok(_) => {
                        warn!(plugin = %plugin_id, "Unexpected frame type; ignoring");
                    }
                    Err(e) => {
                        match e {
                            TransportError::ProcessExited => {
                                debug!(plugin = %plugin_id, "Plugin closed its write side")
                            }
                            ref other => {
                                warn!(plugin = %plugin_id, error = %other, "Plugin read failed")
                            }
                        }
                        fail_pending(&state, &closed, e).await;
                        break;
                    }
                }
            }
        }
        fail_pending(&state, &closed, TransportError::Closed).await;
    }
}

async fn fail_pending(
    state: &Arc<Mutex<ConnState>>,
    closed: &Arc<AtomicBool>,
    err: TransportError,
) {
    let mut st = state.lock().await;
    st.closed = true;
    closed.store(true, Ordering::SeqCst);
    for (_, tx) in st.pending.drain() {
        let _ = tx.send(Err(err.clone()));
    }
}

/// Scope marker for an in-flight `HandleApi` call; the SDK gate counts these.
struct ApiGuard<'a>(&'a AtomicUsize);

impl<'a> ApiGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ApiGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
