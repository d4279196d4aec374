//! Connection-wide and per-call configuration.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::proto::DataKind;

/// Connection-wide options.
///
/// On a server, one bundle is shared read-only by every connection.
/// Durations of `Duration::ZERO` mean "disabled" wherever a timeout or
/// interval is optional.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Log connect/disconnect transitions.
    pub log_connect: bool,
    /// Log API requests and their returns.
    pub log_api: bool,
    /// Log sent and received messages.
    pub log_msg: bool,
    /// Include request bodies in API logs.
    pub log_req_body: bool,
    /// Include response bodies in API logs.
    pub log_res_body: bool,
    /// Log every raw frame that enters or leaves the transport.
    pub debug_buf: bool,

    /// Default deadline for outgoing calls; `ZERO` disables it.
    pub call_api_timeout: Duration,
    /// Deadline for local handlers to reply; `ZERO` disables it.
    pub api_call_timeout: Duration,

    /// Skip service validation when encoding (trusted peers only).
    pub skip_encode_validate: bool,
    /// Skip service validation when decoding (trusted peers only).
    pub skip_decode_validate: bool,

    /// Embed the original failure in replies to handler crashes.
    pub return_inner_error: bool,

    /// Enable the heartbeat subsystem once connected.
    pub heartbeat: bool,
    /// Interval between pings; `ZERO` makes this side receive-only.
    pub heartbeat_send_interval: Duration,
    /// Disconnect after this long without any inbound heartbeat.
    pub heartbeat_recv_timeout: Duration,

    /// Wire mode used when a call doesn't override it.
    pub default_data_kind: DataKind,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            log_connect: true,
            log_api: true,
            log_msg: true,
            log_req_body: true,
            log_res_body: true,
            debug_buf: false,
            call_api_timeout: Duration::from_secs(15),
            api_call_timeout: Duration::from_secs(30),
            skip_encode_validate: false,
            skip_decode_validate: false,
            return_inner_error: true,
            heartbeat: false,
            heartbeat_send_interval: Duration::from_secs(5),
            heartbeat_recv_timeout: Duration::from_secs(15),
            default_data_kind: DataKind::Buffer,
        }
    }
}

/// Per-call options for `call_api` / `send_msg`.
#[derive(Debug, Default)]
pub struct CallOptions {
    /// Deadline override; `Some(ZERO)` disables the timeout entirely.
    pub timeout: Option<Duration>,
    /// Groups this call for `abort_by_key`.
    pub abort_key: Option<String>,
    /// External cancellation: completing this channel aborts the call.
    pub abort_signal: Option<oneshot::Receiver<()>>,
    /// Wire mode override for this one send.
    pub data_kind: Option<DataKind>,
}

impl CallOptions {
    /// Options with a deadline override.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Options with an abort key.
    pub fn with_abort_key(key: impl Into<String>) -> Self {
        Self {
            abort_key: Some(key.into()),
            ..Self::default()
        }
    }
}
