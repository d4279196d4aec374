//! Liveness probes: interval pings, idle-timeout disconnect, latency.
//!
//! When enabled, one side pings on an interval and re-arms after each
//! pong; every inbound heartbeat (ping or pong) pushes the receive
//! timeout out. A side with a zero send interval is receive-only; it
//! still answers pings, so at least one probing side keeps both alive.

use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use super::{ConnInner, Connection};
use crate::counter::Counter;
use crate::proto::{DataKind, TransportData};

/// Per-connection heartbeat state. Timers are armed only while the
/// connection is connected and the option is enabled.
pub(crate) struct Heartbeat {
    sn: Counter,
    last_send: Mutex<Option<Instant>>,
    latency: Mutex<Option<Duration>>,
    send_task: Mutex<Option<JoinHandle<()>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub(crate) fn new() -> Self {
        Self {
            sn: Counter::new(),
            last_send: Mutex::new(None),
            latency: Mutex::new(None),
            send_task: Mutex::new(None),
            recv_task: Mutex::new(None),
        }
    }

    /// Round-trip time of the most recent ping/pong pair.
    pub(crate) fn latency(&self) -> Option<Duration> {
        *self.latency.lock().unwrap()
    }
}

/// Arm the subsystem on a freshly connected connection.
pub(super) fn start(conn: &Connection) {
    if conn.inner.options.heartbeat_send_interval > Duration::ZERO {
        spawn_ping(conn, Duration::ZERO);
    }
    arm_recv_timeout(conn);
}

/// Disarm all timers.
pub(super) fn stop(conn: &Connection) {
    let hb = &conn.inner.heartbeat;
    if let Some(task) = hb.send_task.lock().unwrap().take() {
        task.abort();
    }
    if let Some(task) = hb.recv_task.lock().unwrap().take() {
        task.abort();
    }
    *hb.last_send.lock().unwrap() = None;
}

/// React to an inbound heartbeat envelope.
pub(super) async fn on_recv(conn: &Connection, sn: u32, is_reply: bool, kind: DataKind) {
    if conn.inner.options.heartbeat {
        arm_recv_timeout(conn);
    }

    if !is_reply {
        // Answer pings even when our own heartbeat is disabled; the peer
        // may be the only probing side. The pong mirrors the ping's wire
        // mode.
        let pong = TransportData::Heartbeat { sn, is_reply: true };
        if let Err(err) = conn.send_transport_data(pong, kind).await {
            tracing::debug!("Failed to answer heartbeat #{}: {}", sn, err);
        }
        return;
    }

    // A pong: sample the round trip and line up the next ping.
    let hb = &conn.inner.heartbeat;
    if let Some(sent_at) = *hb.last_send.lock().unwrap() {
        let latency = sent_at.elapsed();
        *hb.latency.lock().unwrap() = Some(latency);
        tracing::debug!("[Heartbeat] #{} latency {:?}", sn, latency);
    }
    let interval = conn.inner.options.heartbeat_send_interval;
    if conn.inner.options.heartbeat && interval > Duration::ZERO {
        spawn_ping(conn, interval);
    }
}

fn spawn_ping(conn: &Connection, delay: Duration) {
    let weak: Weak<ConnInner> = conn.downgrade();
    let task = tokio::spawn(async move {
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let Some(conn) = Connection::upgrade(&weak) else {
            return;
        };
        send_ping(&conn).await;
    });
    if let Some(old) = conn
        .inner
        .heartbeat
        .send_task
        .lock()
        .unwrap()
        .replace(task)
    {
        old.abort();
    }
}

async fn send_ping(conn: &Connection) {
    let hb = &conn.inner.heartbeat;
    let sn = hb.sn.next();
    *hb.last_send.lock().unwrap() = Some(Instant::now());

    let ping = TransportData::Heartbeat {
        sn,
        is_reply: false,
    };
    if let Err(err) = conn
        .send_transport_data(ping, conn.inner.options.default_data_kind)
        .await
    {
        tracing::debug!("Failed to send heartbeat #{}: {}", sn, err);
    }
}

fn arm_recv_timeout(conn: &Connection) {
    let timeout = conn.inner.options.heartbeat_recv_timeout;
    if timeout == Duration::ZERO {
        return;
    }

    let weak: Weak<ConnInner> = conn.downgrade();
    let task = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let Some(conn) = Connection::upgrade(&weak) else {
            return;
        };
        // Drop our own handle first: the disconnect below stops the
        // heartbeat, and it must not abort the task running it.
        conn.inner.heartbeat.recv_task.lock().unwrap().take();
        let _ = conn
            .disconnect_inner(false, Some("Receive heartbeat timeout".to_string()))
            .await;
    });
    if let Some(old) = conn
        .inner
        .heartbeat
        .recv_task
        .lock()
        .unwrap()
        .replace(task)
    {
        old.abort();
    }
}
