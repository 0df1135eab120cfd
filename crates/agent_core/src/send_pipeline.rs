//! Send Pipeline (C6, §4.6) — one serial worker task per `(server,
//! senderId)` key, draining the persistent outbox FIFO. Grounded on
//! `guard-service::engine`'s `spawn_maintenance_watcher` shape: a
//! `tokio::spawn` loop selecting between a wake signal and shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use agent_proto::ServerRef;
use agent_relay::{BrokerErrorKind, RelayError, SmpErrorCode};
use agent_store::models::OutboxMessageRow;
use agent_store::types::{ConnVariant, MessageKind};

use crate::api::{AgentEvent, AppEvent};
use crate::conn_manager;
use crate::context::AgentContext;
use crate::error::{AgentError, ConnErrorKind};
use crate::op_gate::OpClass;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct WorkerKey {
    server: ServerRef,
    sender_id: String,
}

/// Owns the set of running per-`(server, senderId)` workers and the
/// `Notify` used to wake a worker immediately after `sendMessage` appends
/// to its outbox, instead of waiting out the retry interval.
pub struct SendPipeline {
    ctx: AgentContext,
    gate: Arc<crate::op_gate::OperationGate>,
    workers: Mutex<HashMap<WorkerKey, Arc<Notify>>>,
    shutdown: watch::Receiver<bool>,
}

impl SendPipeline {
    pub fn new(ctx: AgentContext, gate: Arc<crate::op_gate::OperationGate>, shutdown: watch::Receiver<bool>) -> Self {
        Self { ctx, gate, workers: Mutex::new(HashMap::new()), shutdown }
    }

    /// Ensures a worker is running for `(server, sender_id)` and wakes it.
    /// Idempotent — called after every outbox append so a freshly
    /// appended message is picked up without waiting for the retry timer.
    pub fn notify(&self, server: ServerRef, sender_id: String) {
        let key = WorkerKey { server: server.clone(), sender_id: sender_id.clone() };
        let notify = {
            let mut workers = self.workers.lock();
            workers
                .entry(key)
                .or_insert_with(|| {
                    let notify = Arc::new(Notify::new());
                    self.spawn_worker(server.clone(), sender_id.clone(), notify.clone());
                    notify
                })
                .clone()
        };
        notify.notify_one();
    }

    fn spawn_worker(&self, server: ServerRef, sender_id: String, notify: Arc<Notify>) {
        let ctx = self.ctx.clone();
        let gate = self.gate.clone();
        let mut shutdown = self.shutdown.clone();
        let retry_interval = ctx.agent_config.message_retry_interval;

        tokio::spawn(async move {
            info!(%server, sender_id, "send worker started");
            loop {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(retry_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(%server, sender_id, "send worker shutting down");
                            return;
                        }
                    }
                }

                let Some(_lease) = gate.begin(OpClass::SndNetwork) else { continue };

                let pending = match ctx
                    .store
                    .read_pending_outbox_for_snd_key(&server.host, server.port as i64, &server.fingerprint, &sender_id)
                    .await
                {
                    Ok(rows) => rows,
                    Err(err) => {
                        warn!(%server, sender_id, %err, "failed to read pending outbox");
                        continue;
                    }
                };

                for row in pending {
                    if !deliver_one(&ctx, &server, &sender_id, &row).await {
                        // transient failure: stop this pass, the retry timer or
                        // a future notify() will resume from the same message.
                        break;
                    }
                }
            }
        });
    }
}

/// Delivers one outbox row. Returns `true` if the worker should continue to
/// the next row, `false` if a transient failure means this pass should stop
/// and retry later.
async fn deliver_one(ctx: &AgentContext, server: &ServerRef, sender_id: &str, row: &OutboxMessageRow) -> bool {
    let plaintext = match ctx.store.decrypt_value(&row.body_enc).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(conn_id = %row.conn_id, internal_id = row.internal_id, %err, "outbox entry failed to decrypt, dropping");
            let _ = ctx.store.delete_outbox_message(&row.conn_id, row.internal_id).await;
            return true;
        }
    };

    match ctx.relay.send_agent_message(server, sender_id, plaintext).await {
        Ok(()) => {
            handle_send_success(ctx, row).await;
            if let Err(err) = ctx.store.delete_outbox_message(&row.conn_id, row.internal_id).await {
                warn!(conn_id = %row.conn_id, internal_id = row.internal_id, %err, "failed to clear delivered outbox entry");
            }
            true
        }
        Err(err) => handle_send_error(ctx, row, err).await,
    }
}

/// Dispatches on the delivered row's kind (§4.6 success table): `conn-info`
/// advances the Sq and may queue `HELLO`; `hello` advances it again and may
/// surface `CON` or queue the legacy `REPLY`; `a-msg` surfaces `SENT`;
/// everything else (rotation control messages) has no app-visible effect.
async fn handle_send_success(ctx: &AgentContext, row: &OutboxMessageRow) {
    let conn_id = agent_proto::ConnId(row.conn_id.clone());
    let result = match MessageKind::parse(&row.kind) {
        Some(MessageKind::ConnInfo) => conn_manager::on_conn_info_sent(ctx, &conn_id).await,
        Some(MessageKind::Hello) => conn_manager::on_hello_sent(ctx, &conn_id).await,
        Some(MessageKind::AMsg) => {
            ctx.emit(AppEvent {
                corr_id: agent_proto::CorrId(String::new()),
                conn_id: Some(conn_id),
                event: AgentEvent::Sent { internal_id: row.internal_id },
            });
            Ok(())
        }
        _ => Ok(()),
    };
    if let Err(err) = result {
        warn!(conn_id = %row.conn_id, internal_id = row.internal_id, %err, "post-delivery handling failed");
    }
}

/// Classifies a relay send failure against the per-kind table (§4.6): most
/// causes leave the row in the outbox for the next pass; the rest drop it
/// and, depending on kind, surface `ERR`/`MERR` to the application or just
/// cancel an in-flight rotation.
async fn handle_send_error(ctx: &AgentContext, row: &OutboxMessageRow, err: RelayError) -> bool {
    let kind = MessageKind::parse(&row.kind);
    let age = chrono::Utc::now().signed_duration_since(row.ts);
    let hello_timeout = chrono::Duration::from_std(ctx.agent_config.hello_timeout).unwrap_or(chrono::Duration::max_value());
    let message_timeout = chrono::Duration::from_std(ctx.agent_config.message_timeout).unwrap_or(chrono::Duration::max_value());
    let timeout = if kind == Some(MessageKind::Hello) { hello_timeout } else { message_timeout };

    match &err {
        RelayError::Smp(SmpErrorCode::Quota) => match kind {
            Some(MessageKind::ConnInfo) | Some(MessageKind::Reply) => {
                return drop_with_event(ctx, row, Some(AgentError::Conn(ConnErrorKind::NotAvailable))).await;
            }
            Some(MessageKind::QTest) | Some(MessageKind::QHello) => {
                warn!(conn_id = %row.conn_id, internal_id = row.internal_id, "QUOTA during rotation handshake, cancelling rotation");
                if let Err(store_err) = ctx.store.cancel_snd_rotation(&row.conn_id).await {
                    warn!(conn_id = %row.conn_id, %store_err, "failed to cancel rotation after QUOTA");
                }
                let _ = ctx.store.delete_outbox_message(&row.conn_id, row.internal_id).await;
                return true;
            }
            _ => {
                warn!(conn_id = %row.conn_id, internal_id = row.internal_id, "QUOTA, will retry with backoff");
                return false;
            }
        },
        RelayError::Smp(SmpErrorCode::Auth) => match kind {
            Some(MessageKind::ConnInfo) => {
                return drop_with_event(ctx, row, Some(AgentError::Conn(ConnErrorKind::NotAvailable))).await;
            }
            Some(MessageKind::Hello) => {
                let duplex_handshake = ctx
                    .store
                    .get_connection(&row.conn_id)
                    .await
                    .map(|c| c.duplex_handshake == Some(true))
                    .unwrap_or(false);
                if duplex_handshake || age >= hello_timeout {
                    let is_initiator = ctx
                        .store
                        .get_connection(&row.conn_id)
                        .await
                        .ok()
                        .and_then(|c| ConnVariant::parse(&c.variant))
                        == Some(ConnVariant::Snd);
                    let kind = if is_initiator { ConnErrorKind::NotAvailable } else { ConnErrorKind::NotAccepted };
                    return drop_with_event(ctx, row, Some(AgentError::Conn(kind))).await;
                }
                warn!(conn_id = %row.conn_id, internal_id = row.internal_id, "AUTH on legacy HELLO, retrying until helloTimeout");
                return false;
            }
            Some(MessageKind::Reply) => return drop_with_event(ctx, row, Some(AgentError::Conn(ConnErrorKind::NotAvailable))).await,
            Some(MessageKind::AMsg) => {
                return drop_with_event(ctx, row, Some(AgentError::Smp(SmpErrorCode::Auth))).await;
            }
            _ => return drop_with_event(ctx, row, None).await,
        },
        RelayError::Network(_) | RelayError::Broker(BrokerErrorKind::Host) | RelayError::Broker(BrokerErrorKind::Timeout) => {
            if age >= timeout {
                warn!(conn_id = %row.conn_id, internal_id = row.internal_id, "transient failure exceeded timeout, surfacing");
                let event = if kind == Some(MessageKind::AMsg) { None } else { Some(err.into()) };
                return drop_with_event(ctx, row, event).await;
            }
            warn!(conn_id = %row.conn_id, internal_id = row.internal_id, %err, "transient send failure, will retry");
            false
        }
        _ => drop_with_event(ctx, row, Some(err.into())).await,
    }
}

/// Deletes `row` from the outbox and, if `event` is some, surfaces it —
/// `Merr` for an `a-msg` row (the app is waiting on that specific send),
/// `Err` for everything else. Always returns `true` (worker continues to
/// the next row).
async fn drop_with_event(ctx: &AgentContext, row: &OutboxMessageRow, event: Option<AgentError>) -> bool {
    if let Err(store_err) = ctx.store.delete_outbox_message(&row.conn_id, row.internal_id).await {
        warn!(conn_id = %row.conn_id, %store_err, "failed to drop undeliverable outbox entry");
    }
    if let Some(agent_err) = event {
        let conn_id = Some(agent_proto::ConnId(row.conn_id.clone()));
        let event = if MessageKind::parse(&row.kind) == Some(MessageKind::AMsg) {
            AgentEvent::Merr { internal_id: row.internal_id, err: agent_err }
        } else {
            AgentEvent::Err { err: agent_err }
        };
        ctx.emit(AppEvent { corr_id: agent_proto::CorrId(String::new()), conn_id, event });
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_store::{types::ConnVariant, Store, Vault};
    use agent_proto::AgentConfig;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn test_ctx() -> (AgentContext, tokio::sync::mpsc::UnboundedReceiver<crate::api::AppEvent>, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/agent-core-sendpipe-{}.db", Uuid::new_v4()));
        let vault = Vault::new();
        vault.unlock(b"pw", &[0u8; 16]).await.unwrap();
        let store = Arc::new(Store::open(&db_path, vault).await.unwrap());
        let (relay, _rx) = agent_relay::RelayPool::simulated();
        let (_ntf_tx, ntf_rx) = tokio::sync::watch::channel(false);
        let ntf = Arc::new(agent_ntf::NtfSupervisor::new(
            agent_ntf::token::NtfToken::new("t", "dev", "ntf.example", agent_ntf::token::NtfMode::Instant),
            Arc::new(agent_ntf::supervisor::NoopNtfRelay),
            ntf_rx,
        ));
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = AgentContext::new(
            store,
            Arc::new(relay),
            ntf,
            agent_proto::NetworkConfig::default(),
            AgentConfig { message_retry_interval: Duration::from_millis(20), ..AgentConfig::default() },
            events_tx,
        );
        (ctx, events_rx, db_path)
    }

    fn cleanup(path: PathBuf) {
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn delivers_pending_outbox_entry_and_clears_it() {
        let (ctx, _events, db_path) = test_ctx().await;
        ctx.store.create_connection("c1", ConnVariant::Duplex, 4, true, Some(true)).await.unwrap();
        let server = ServerRef { host: "relay.example".into(), port: 443, fingerprint: "fp".into() };
        let (recipient_id, sender_id, _uri) = ctx.relay.create_rcv_queue(&server).await.unwrap();
        let _ = recipient_id;

        let body_enc = ctx.store.encrypt_value(b"hello").await.unwrap();
        ctx.store
            .append_outbox_message("c1", agent_store::types::MessageKind::AMsg, 0, &body_enc, "h1")
            .await
            .unwrap();

        let gate = Arc::new(crate::op_gate::OperationGate::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline = SendPipeline::new(ctx.clone(), gate, shutdown_rx);
        pipeline.notify(server, sender_id);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let remaining = ctx.store.read_pending_outbox("c1").await.unwrap();
        assert!(remaining.is_empty());

        cleanup(db_path);
    }
}
