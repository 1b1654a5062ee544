// network.rs
// Client session: fragments over UDP, control and filler stream over one TCP connection.
use crate::config::ConfigError;
use crate::packet::{self, ControlMessage, RunFlags, DATAGRAM_LEN, REGISTRATION_LEN};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STREAM_READ_BUF: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
    #[error("handshake failed: {0}")]
    HandshakeError(String),
    #[error("timed out")]
    Timeout,
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("task failed: {0}")]
    TaskFailed(String),
}

/// Closes every channel of a session. Cloned into whoever may end it.
#[derive(Debug, Clone)]
pub struct SessionCloser(Arc<watch::Sender<bool>>);

impl SessionCloser {
    pub fn close(&self) {
        self.0.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

/// Resolves once the session is closed, or once every closer is gone.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

/// An open session, not yet split into its channels.
pub struct Session {
    pub datagrams: DatagramChannel,
    pub stream: StreamChannel,
    pub control: ControlChannel,
    closer: SessionCloser,
}

impl Session {
    /// Connects the stream and datagram channels to `remote_addr` and registers the datagram address.
    pub async fn connect(remote_addr: SocketAddr) -> Result<Session, NetworkError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(remote_addr))
            .await
            .map_err(|_| NetworkError::Timeout)??;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to disable Nagle on the stream");
        }
        let stream_port = stream.local_addr()?.port();

        let local_bind = if remote_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local_bind).await?;
        socket.connect(remote_addr).await?;
        tracing::info!(
            remote = %remote_addr,
            datagram_addr = %socket.local_addr()?,
            "session connected"
        );

        let session = Session::from_parts(stream, stream_port, socket);
        session.control.register().await?;
        Ok(session)
    }

    fn from_parts(stream: TcpStream, stream_port: u16, socket: UdpSocket) -> Session {
        let (tx, rx) = watch::channel(false);
        let closer = SessionCloser(Arc::new(tx));
        let socket = Arc::new(socket);
        let (reader, writer) = stream.into_split();

        Session {
            datagrams: DatagramChannel {
                socket: Arc::clone(&socket),
                closed: rx.clone(),
                buf: vec![0u8; DATAGRAM_LEN * 2],
            },
            stream: StreamChannel {
                reader,
                closed: rx.clone(),
                closer: closer.clone(),
                buf: vec![0u8; STREAM_READ_BUF],
            },
            control: ControlChannel {
                writer,
                socket,
                registration: packet::registration_datagram(stream_port),
                closed: rx,
            },
            closer,
        }
    }

    pub fn closer(&self) -> SessionCloser {
        self.closer.clone()
    }

    pub fn into_parts(self) -> (DatagramChannel, StreamChannel, ControlChannel, SessionCloser) {
        (self.datagrams, self.stream, self.control, self.closer)
    }
}

/// Unreliable channel carrying fragment datagrams.
pub struct DatagramChannel {
    socket: Arc<UdpSocket>,
    closed: watch::Receiver<bool>,
    buf: Vec<u8>,
}

impl DatagramChannel {
    /// Next inbound datagram, `None` once the session is closed.
    pub async fn recv(&mut self) -> Result<Option<&[u8]>, NetworkError> {
        let len = tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => return Ok(None),
            result = self.socket.recv(&mut self.buf) => result?,
        };
        Ok(Some(&self.buf[..len]))
    }
}

/// Reliable channel whose bytes only matter for their arrival.
pub struct StreamChannel {
    reader: OwnedReadHalf,
    closed: watch::Receiver<bool>,
    closer: SessionCloser,
    buf: Vec<u8>,
}

impl StreamChannel {
    /// Reads and discards the next chunk, returning its length. End of stream closes the session.
    pub async fn recv_chunk(&mut self) -> Result<Option<usize>, NetworkError> {
        let read = tokio::select! {
            biased;
            _ = wait_closed(&mut self.closed) => return Ok(None),
            result = self.reader.read(&mut self.buf) => result,
        };
        match read {
            Ok(0) => {
                tracing::debug!("stream reached end of stream, closing session");
                self.closer.close();
                Ok(None)
            }
            Ok(n) => Ok(Some(n)),
            Err(e) => {
                self.closer.close();
                Err(e.into())
            }
        }
    }
}

/// Outbound control messages.
pub struct ControlChannel {
    writer: OwnedWriteHalf,
    socket: Arc<UdpSocket>,
    registration: [u8; REGISTRATION_LEN],
    closed: watch::Receiver<bool>,
}

impl ControlChannel {
    pub async fn send(&mut self, message: ControlMessage) -> Result<(), NetworkError> {
        self.writer.write_all(message.as_bytes()).await?;
        Ok(())
    }

    /// `RUNTESTS` followed by the warm-up and inter-fragment delay flags.
    pub async fn start_tests(&mut self, flags: RunFlags) -> Result<(), NetworkError> {
        let mut message = ControlMessage::RunTests.as_bytes().to_vec();
        message.extend_from_slice(&flags.to_bytes());
        self.writer.write_all(&message).await?;
        Ok(())
    }

    /// Tells the server which address fragments for this session go to.
    pub async fn register(&self) -> Result<(), NetworkError> {
        self.socket.send(&self.registration).await?;
        Ok(())
    }

    pub async fn closed(&mut self) {
        wait_closed(&mut self.closed).await
    }

    pub async fn shutdown(&mut self) -> Result<(), NetworkError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
