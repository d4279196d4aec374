//! The seam between a connection and whatever actually moves bytes.
//!
//! A concrete transport (WebSocket, pipe, in-memory pair, ...) implements
//! this trait and, for inbound traffic, calls
//! [`Connection::recv_data`](crate::Connection::recv_data) with every raw
//! frame it yields. Reliability and framing of the underlying byte stream
//! are the transport's problem; the connection hands it whole frames and
//! expects whole frames back.

use crate::error::OpResult;
use crate::flow::BoxFuture;
use crate::proto::{TransportData, WireData};

/// Downstream hooks a transport provides to its connection.
pub trait Transport: Send + Sync + 'static {
    /// Hand one encoded frame to the wire.
    ///
    /// `Ok(())` means "accepted by the transport", not "processed by the
    /// peer". The structured `data` is provided for transports that route
    /// on it; most ignore it.
    fn send_raw<'a>(
        &'a self,
        raw: WireData,
        data: &'a TransportData,
    ) -> BoxFuture<'a, OpResult<()>>;

    /// Establish the underlying link.
    ///
    /// Server-side transports are typically born connected and keep the
    /// default no-op.
    fn do_connect(&self) -> BoxFuture<'_, OpResult<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Tear the underlying link down.
    ///
    /// `is_manual` is false when the connection itself initiated the
    /// teardown (e.g. heartbeat timeout). The connection bounds this call
    /// at 3 seconds.
    fn do_disconnect(
        &self,
        is_manual: bool,
        reason: Option<String>,
    ) -> BoxFuture<'_, OpResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullTransport {
        sent: AtomicUsize,
    }

    impl Transport for NullTransport {
        fn send_raw<'a>(
            &'a self,
            _raw: WireData,
            _data: &'a TransportData,
        ) -> BoxFuture<'a, OpResult<()>> {
            Box::pin(async move {
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn do_disconnect(
            &self,
            _is_manual: bool,
            _reason: Option<String>,
        ) -> BoxFuture<'_, OpResult<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_default_do_connect_is_noop() {
        let t = NullTransport {
            sent: AtomicUsize::new(0),
        };
        assert!(t.do_connect().await.is_ok());

        let data = TransportData::Heartbeat {
            sn: 1,
            is_reply: false,
        };
        t.send_raw(WireData::Text("{}".into()), &data).await.unwrap();
        assert_eq!(t.sent.load(Ordering::SeqCst), 1);
    }
}
