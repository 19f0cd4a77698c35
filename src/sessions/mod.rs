/// Per-peer session machinery shared by both connection roles.
///
/// Every accepted socket becomes a session task registered here with its
/// activity timestamps and an interrupt flag. A sweeper drives
/// [`SessionRegistry::sweep`] once a second and interrupts sessions whose
/// last-received and last-sent instants are both older than the timeout;
/// session loops observe the flag between socket polls.
pub mod client;
pub mod solver;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{WmError, WmResult};
use crate::protocol::codec;
use crate::types::{now_ms, Timestamp};

/// Seconds of mutual silence before a peer is reaped.
pub const DEFAULT_TIMEOUT_SECS: i64 = 60;

/// Attempts before a transiently unavailable socket tears the session down.
const SEND_RETRY_BUDGET: u32 = 10;

/// Which listener a session arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Solver,
    Client,
}

/// Shared bookkeeping for one live session.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub kind: SessionKind,
    last_received: Arc<AtomicI64>,
    last_sent: Arc<AtomicI64>,
    interrupted: Arc<AtomicBool>,
    timeout_secs: i64,
}

impl SessionHandle {
    pub fn new(kind: SessionKind, timeout_secs: i64) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            kind,
            last_received: Arc::new(AtomicI64::new(now)),
            last_sent: Arc::new(AtomicI64::new(now)),
            interrupted: Arc::new(AtomicBool::new(false)),
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs as u64)
    }

    pub fn touch_received(&self) {
        self.last_received.store(now_ms(), Ordering::Relaxed);
    }

    pub fn touch_sent(&self) {
        self.last_sent.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_sent(&self) -> Timestamp {
        self.last_sent.load(Ordering::Relaxed)
    }

    /// Ask the session to stop at its next poll.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// True when neither side of the connection has been active within the
    /// timeout.
    fn idle_past_timeout(&self, now: Timestamp) -> bool {
        let cutoff = now - self.timeout_secs * 1000;
        self.last_received.load(Ordering::Relaxed) < cutoff
            && self.last_sent.load(Ordering::Relaxed) < cutoff
    }

    /// Half the timeout has passed without anything being sent.
    pub(crate) fn keep_alive_due(&self, now: Timestamp) -> bool {
        now - self.last_sent() > self.timeout_secs * 1000 / 2
    }
}

/// All live sessions, for the sweeper and for shutdown.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id, handle);
    }

    pub fn unregister(&self, id: &Uuid) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn interrupt_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().interrupt();
        }
    }

    /// Interrupt sessions idle past their timeout. Returns how many were
    /// reaped.
    pub fn sweep(&self, now: Timestamp) -> usize {
        let mut reaped = 0;
        for entry in self.sessions.iter() {
            let handle = entry.value();
            if !handle.is_interrupted() && handle.idle_past_timeout(now) {
                warn!(session = %handle.id, kind = ?handle.kind, "reaping idle session");
                handle.interrupt();
                reaped += 1;
            }
        }
        reaped
    }
}

/// Exchange the fixed handshake; anything else closes the connection.
pub(crate) async fn exchange_handshake(
    stream: &mut TcpStream,
    handle: &SessionHandle,
) -> WmResult<()> {
    let ours = codec::handshake_bytes();
    codec::write_all(stream, &ours).await?;
    handle.touch_sent();

    let mut theirs = vec![0u8; ours.len()];
    tokio::time::timeout(handle.timeout(), stream.read_exact(&mut theirs))
        .await
        .map_err(|_| WmError::PeerTimeout(handle.timeout_secs))??;
    handle.touch_received();

    if theirs != ours {
        return Err(WmError::Protocol("handshake mismatch".to_string()));
    }
    Ok(())
}

/// Send one frame under the session's transmit mutex, retrying a bounded
/// number of times while the socket is transiently unavailable.
pub(crate) async fn send_frame(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    handle: &SessionHandle,
    bytes: &[u8],
) -> WmResult<()> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let outcome = {
            let mut guard = writer.lock().await;
            codec::write_all(&mut *guard, bytes).await
        };
        match outcome {
            Ok(()) => {
                handle.touch_sent();
                return Ok(());
            }
            Err(WmError::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                if attempts >= SEND_RETRY_BUDGET {
                    return Err(WmError::SendExhausted { attempts });
                }
                tokio::time::sleep(Duration::from_micros(100)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run the read side of a session as its own task, forwarding frames into
/// a channel; closing the channel ends the session loop.
pub(crate) fn spawn_reader(
    mut read_half: OwnedReadHalf,
    handle: SessionHandle,
) -> mpsc::Receiver<(u8, Vec<u8>)> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        loop {
            match codec::read_frame(&mut read_half).await {
                Ok(frame) => {
                    handle.touch_received();
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!(session = %handle.id, %err, "session read side closed");
                    return;
                }
            }
        }
    });
    rx
}
