// Client-side run: start the remote battery and record everything that arrives.
use crate::config::RunConfig;
use crate::network::{ControlChannel, DatagramChannel, NetworkError, Session, SessionCloser, StreamChannel};
use crate::packet::{now_millis, ControlMessage, TestIndex, TestSize};
use crate::registry::RecordOutcome;
use crate::state::SharedRunState;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

/// Progress signals for whoever renders the run while it is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunNotification {
    TestStarted { test_size: TestSize },
    StateChanged { test_size: TestSize, test_index: TestIndex },
    SessionClosed,
}

#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub datagrams_received: u64,
    pub datagrams_rejected: u64,
    pub fragments_recorded: u64,
    pub duplicate_fragments: u64,
    pub fragments_out_of_range: u64,
    pub stream_chunks: u64,
    pub keepalives_sent: u64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub counters: RunCounters,
}

fn notify(notifier: &Option<UnboundedSender<RunNotification>>, notification: RunNotification) {
    if let Some(tx) = notifier {
        // nobody listening is fine
        let _ = tx.send(notification);
    }
}

/// Runs one test battery over `session` until the session closes or goes idle.
///
/// The state is reset and its clock started right before `RUNTESTS` goes out. It stays
/// readable through `state` during and after the run.
pub async fn run_session(
    config: &RunConfig,
    session: Session,
    state: SharedRunState,
    notifier: Option<UnboundedSender<RunNotification>>,
) -> Result<RunOutcome, NetworkError> {
    let (datagrams, stream, mut control, closer) = session.into_parts();

    let started_at_ms = now_millis();
    state.with(|s| s.start_run(started_at_ms, &config.test_sizes));
    control.start_tests(config.run_flags()).await?;
    info!(flags = ?config.run_flags(), "sent RUNTESTS");

    let (datagram_counters, stream_chunks, keepalives_sent) = tokio::join!(
        datagram_loop(datagrams, &state, &notifier, config.idle_timeout(), closer.clone()),
        stream_loop(stream, &state),
        keepalive_loop(control, config.keepalive_interval()),
    );
    closer.close();
    notify(&notifier, RunNotification::SessionClosed);

    let finished_at_ms = now_millis();
    let counters = RunCounters {
        stream_chunks,
        keepalives_sent,
        ..datagram_counters
    };
    info!(
        duration = ?Duration::from_millis(finished_at_ms.saturating_sub(started_at_ms)),
        datagrams = counters.datagrams_received,
        fragments = counters.fragments_recorded,
        "run finished"
    );

    Ok(RunOutcome {
        started_at_ms,
        finished_at_ms,
        counters,
    })
}

async fn datagram_loop(
    mut datagrams: DatagramChannel,
    state: &SharedRunState,
    notifier: &Option<UnboundedSender<RunNotification>>,
    idle_timeout: Option<Duration>,
    closer: SessionCloser,
) -> RunCounters {
    let mut counters = RunCounters::default();

    loop {
        let received = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, datagrams.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    info!(idle = ?limit, "no datagram within idle timeout, ending run");
                    closer.close();
                    break;
                }
            },
            None => datagrams.recv().await,
        };
        let raw = match received {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "datagram receive failed");
                continue;
            }
        };
        counters.datagrams_received += 1;

        let arrival_ms = now_millis();
        match state.with(|s| s.record_datagram(raw, arrival_ms)) {
            Ok(None) => {
                counters.datagrams_rejected += 1;
                trace!(len = raw.len(), "ignored non-fragment datagram");
            }
            Ok(Some((event, RecordOutcome::Recorded { started, newly_delivered }))) => {
                counters.fragments_recorded += 1;
                if !newly_delivered {
                    counters.duplicate_fragments += 1;
                }
                if let Some(test_size) = started {
                    info!("Test for {} fragments started", test_size);
                    notify(notifier, RunNotification::TestStarted { test_size });
                }
                notify(
                    notifier,
                    RunNotification::StateChanged {
                        test_size: event.test_size,
                        test_index: event.test_index,
                    },
                );
            }
            Ok(Some((event, RecordOutcome::OutOfRange))) => {
                counters.fragments_out_of_range += 1;
                warn!(
                    test_size = event.test_size,
                    test_index = event.test_index,
                    fragment_index = event.fragment_index,
                    "dropped fragment outside the configured population"
                );
            }
            Err(e) => warn!(error = %e, "fragment not recorded"),
        }
    }

    debug!(received = counters.datagrams_received, "datagram loop finished");
    counters
}

async fn stream_loop(mut stream: StreamChannel, state: &SharedRunState) -> u64 {
    let mut chunks = 0;
    loop {
        match stream.recv_chunk().await {
            Ok(Some(len)) => {
                chunks += 1;
                state.with(|s| s.record_stream_chunk(len, now_millis()));
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stream read failed");
                break;
            }
        }
    }
    debug!(chunks, "stream loop finished");
    chunks
}

async fn keepalive_loop(mut control: ControlChannel, interval: Duration) -> u64 {
    let mut sent = 0;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            biased;
            _ = control.closed() => break,
            _ = ticker.tick() => {
                let result = match control.send(ControlMessage::Ping).await {
                    Ok(()) => control.register().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(error = %e, "keep-alive failed");
                    break;
                }
                sent += 1;
            }
        }
    }

    if let Err(e) = control.shutdown().await {
        debug!(error = %e, "control shutdown failed");
    }
    sent
}
