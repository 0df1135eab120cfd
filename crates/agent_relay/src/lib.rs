//! agent_relay — Relay Client Pool (C3): per-server connection cache,
//! queue operations, and the merged inbound event stream.
//!
//! The actual SMP wire transport (TCP/TLS framing, request signing) is out
//! of scope; [`transport::RelayTransport`] is the seam a real client plugs
//! into. [`transport::SimulatedTransport`] is the in-memory stand-in used
//! by tests and by [`pool::RelayPool::simulated`].

pub mod error;
pub mod events;
pub mod pool;
pub mod transport;

pub use error::{BrokerErrorKind, RelayError, SmpErrorCode};
pub use events::{BrokerMsg, InboundEvent};
pub use pool::{RelayPool, SubscribeOutcome};
pub use transport::{RelayTransport, SimulatedTransport};

#[cfg(test)]
mod tests {
    use super::*;
    use agent_proto::ServerRef;

    fn test_server() -> ServerRef {
        ServerRef { host: "relay.example".into(), port: 443, fingerprint: "deadbeef".into() }
    }

    #[tokio::test]
    async fn create_and_subscribe_queue() {
        let (pool, _rx) = RelayPool::simulated();
        let server = test_server();
        let (recipient_id, _sender_id, _uri) = pool.create_rcv_queue(&server).await.unwrap();
        pool.subscribe_queue(&server, &recipient_id).await.unwrap();
    }

    #[tokio::test]
    async fn send_then_suspend_reports_remaining() {
        let (pool, _rx) = RelayPool::simulated();
        let server = test_server();
        let (recipient_id, sender_id, _uri) = pool.create_rcv_queue(&server).await.unwrap();
        pool.send_agent_message(&server, &sender_id, b"hi".to_vec()).await.unwrap();
        let remaining = pool.suspend_queue(&server, &recipient_id).await.unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn subscribe_queues_reports_one_result_per_input() {
        let (pool, _rx) = RelayPool::simulated();
        let server = test_server();
        let (r1, _, _) = pool.create_rcv_queue(&server).await.unwrap();
        let (r2, _, _) = pool.create_rcv_queue(&server).await.unwrap();
        let outcomes = pool.subscribe_queues(&server, &[r1, r2]).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
    }
}
