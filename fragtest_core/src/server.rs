// Fragment server: the remote peer that runs the test battery for one client session.
use crate::config::ServerConfig;
use crate::network::NetworkError;
use crate::packet::{
    self, parse_flag_byte, ControlMessage, FragmentHeader, RunFlags, TestIndex, TestSize, CONTROL_LEN,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

// How long to wait for the optional flag bytes after RUNTESTS.
const FLAG_WAIT: Duration = Duration::from_millis(250);

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerSummary {
    pub flags: Option<RunFlags>,
    pub warmup_datagrams: u64,
    pub fragments_sent: u64,
    /// Fragments withheld by the simulated loss.
    pub fragments_dropped: u64,
    pub send_errors: u64,
    pub stream_chunks: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct InstanceResult {
    sent: u64,
    dropped: u64,
    errors: u64,
}

pub struct FragmentServer {
    config: Arc<ServerConfig>,
    listener: TcpListener,
    socket: Arc<UdpSocket>,
}

impl FragmentServer {
    /// Binds the stream listener and the datagram socket on the same port.
    pub async fn bind(config: ServerConfig) -> Result<Self, NetworkError> {
        config.validate()?;
        let addr = config.bind_addr()?;
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        let socket = UdpSocket::bind(SocketAddr::new(addr.ip(), port)).await?;
        info!(addr = %listener.local_addr()?, "fragment server listening");

        Ok(FragmentServer {
            config: Arc::new(config),
            listener,
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one client and runs the battery once it asks for it.
    pub async fn serve_session(&self) -> Result<ServerSummary, NetworkError> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to disable Nagle on the stream");
        }
        info!(%peer, "accepted session");

        let client = tokio::time::timeout(
            self.config.registration_timeout(),
            wait_for_registration(&self.socket, peer),
        )
        .await
        .map_err(|_| NetworkError::HandshakeError(format!("{} never registered a datagram address", peer)))??;
        debug!(%client, "datagram address registered");

        let (mut reader, writer) = stream.into_split();
        let mut summary = ServerSummary::default();

        let Some(flags) = read_start(&mut reader).await? else {
            info!(%peer, "session closed before RUNTESTS");
            return Ok(summary);
        };
        info!(?flags, "RUNTESTS received");
        summary.flags = Some(flags);

        let drain: JoinHandle<()> = tokio::spawn(drain_control(reader));
        let (done_tx, done_rx) = watch::channel(false);

        let battery = async {
            if flags.warmup {
                summary.warmup_datagrams = self.warmup(client).await;
            }
            let result = self.run_battery(client, flags).await;
            tokio::time::sleep(self.config.grace_period()).await;
            let _ = done_tx.send(true);
            result
        };
        let (battery_result, stream_chunks) = tokio::join!(battery, self.fill_stream(writer, done_rx));
        drain.abort();

        summary.fragments_sent = battery_result.sent;
        summary.fragments_dropped = battery_result.dropped;
        summary.send_errors = battery_result.errors;
        summary.stream_chunks = stream_chunks;
        info!(
            sent = summary.fragments_sent,
            dropped = summary.fragments_dropped,
            "battery finished, session closed"
        );
        Ok(summary)
    }

    async fn warmup(&self, client: SocketAddr) -> u64 {
        let datagram = packet::warmup_datagram();
        let deadline = tokio::time::Instant::now() + self.config.warmup_duration();
        let mut ticker = tokio::time::interval(self.config.instance_interval().max(Duration::from_millis(1)));
        let mut sent = 0;
        while tokio::time::Instant::now() < deadline {
            ticker.tick().await;
            match self.socket.send_to(&datagram, client).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(error = %e, "warm-up send failed"),
            }
        }
        debug!(sent, "warm-up finished");
        sent
    }

    async fn run_battery(&self, client: SocketAddr, flags: RunFlags) -> InstanceResult {
        let mut rng = match self.config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let gap = flags.inter_fragment_delay.then(|| self.config.fragment_gap());
        let mut instances = Vec::new();

        for &test_size in &self.config.test_sizes {
            info!(test_size, "running test");
            for test_index in 0..self.config.population {
                let keep: Vec<bool> = (0..test_size)
                    .map(|_| !rng.gen_bool(self.config.loss_probability))
                    .collect();
                instances.push(tokio::spawn(send_instance(
                    Arc::clone(&self.socket),
                    client,
                    test_size,
                    test_index,
                    keep,
                    self.config.padding_len,
                    gap,
                )));
                tokio::time::sleep(self.config.instance_interval()).await;
            }
        }

        let mut total = InstanceResult::default();
        for handle in instances {
            match handle.await {
                Ok(result) => {
                    total.sent += result.sent;
                    total.dropped += result.dropped;
                    total.errors += result.errors;
                }
                Err(e) => warn!(error = %e, "instance task failed"),
            }
        }
        total
    }

    async fn fill_stream(&self, mut writer: OwnedWriteHalf, mut done: watch::Receiver<bool>) -> u64 {
        let chunk = vec![b'a'; self.config.stream_chunk_bytes];
        let mut ticker = tokio::time::interval(self.config.stream_interval());
        let mut sent = 0;

        loop {
            tokio::select! {
                biased;
                _ = done.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = writer.write_all(&chunk).await {
                        debug!(error = %e, "stream write failed");
                        break;
                    }
                    sent += 1;
                }
            }
        }

        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "stream shutdown failed");
        }
        sent
    }
}

async fn send_instance(
    socket: Arc<UdpSocket>,
    client: SocketAddr,
    test_size: TestSize,
    test_index: TestIndex,
    keep: Vec<bool>,
    padding_len: usize,
    gap: Option<Duration>,
) -> InstanceResult {
    let mut result = InstanceResult::default();
    for (fragment_index, keep) in keep.into_iter().enumerate() {
        if keep {
            let header = FragmentHeader::stamped_now(test_size, test_index, fragment_index as u8);
            let sent = match header.encode_datagram(padding_len) {
                Ok(datagram) => socket.send_to(&datagram, client).await.map(|_| ()).map_err(NetworkError::from),
                Err(e) => Err(NetworkError::from(e)),
            };
            match sent {
                Ok(()) => result.sent += 1,
                Err(e) => {
                    result.errors += 1;
                    trace!(error = %e, test_size, test_index, fragment_index, "fragment send failed");
                }
            }
        } else {
            result.dropped += 1;
        }
        if let Some(gap) = gap {
            tokio::time::sleep(gap).await;
        }
    }
    result
}

/// Waits for the registration datagram naming the stream `peer` connected from, and
/// returns its source address. Registrations of earlier sessions are skipped.
async fn wait_for_registration(socket: &UdpSocket, peer: SocketAddr) -> Result<SocketAddr, NetworkError> {
    let mut buf = [0u8; 64];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        if from.ip() == peer.ip() && packet::parse_registration(&buf[..len]) == Some(peer.port()) {
            return Ok(from);
        }
        trace!(%from, len, "ignored datagram while waiting for registration");
    }
}

/// Reads control messages until `RUNTESTS`. `None` when the client hangs up first.
async fn read_start(reader: &mut OwnedReadHalf) -> Result<Option<RunFlags>, NetworkError> {
    let mut message = [0u8; CONTROL_LEN];
    loop {
        match reader.read_exact(&mut message).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        match ControlMessage::parse(&message) {
            Some(ControlMessage::RunTests) => {
                let warmup = read_flag(reader).await;
                let inter_fragment_delay = match warmup {
                    Some(_) => read_flag(reader).await,
                    None => None,
                };
                return Ok(Some(RunFlags {
                    warmup: warmup.unwrap_or(false),
                    inter_fragment_delay: inter_fragment_delay.unwrap_or(false),
                }));
            }
            Some(other) => trace!(?other, "control message before RUNTESTS"),
            None => debug!(message = ?String::from_utf8_lossy(&message), "unknown control message"),
        }
    }
}

/// Consumes one flag byte if the next byte on the stream is one. Never eats a control message.
async fn read_flag(reader: &mut OwnedReadHalf) -> Option<bool> {
    let mut next = [0u8; 1];
    let peeked = tokio::time::timeout(FLAG_WAIT, reader.peek(&mut next)).await.ok()?.ok()?;
    if peeked == 0 {
        return None;
    }
    let flag = parse_flag_byte(next[0])?;
    reader.read_exact(&mut next).await.ok()?;
    Some(flag)
}

async fn drain_control(mut reader: OwnedReadHalf) {
    let mut message = [0u8; CONTROL_LEN];
    while reader.read_exact(&mut message).await.is_ok() {
        trace!(message = ?ControlMessage::parse(&message), "control message");
    }
}
