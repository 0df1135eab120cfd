//! Receive Dispatcher (C7, §4.7) — consumes the merged relay inbound
//! stream, opens each envelope, and routes the result to the app or back
//! into the Connection Manager's rotation handlers. Grounded on
//! `guard-service::engine`'s inbound-frame loop: one `tokio::spawn`d task
//! owning a single `mpsc::UnboundedReceiver`, dispatching by frame kind.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use agent_crypto::ratchet::RatchetSession;
use agent_proto::{
    agent_message::{AgentMessage, AgentMsgPayload},
    codec, AgentConnInfo, AgentConnInfoReply, ClientEnvelope, ConfirmationId, ConnId, CorrId,
    InvitationId, ServerRef,
};
use agent_relay::{BrokerMsg, InboundEvent};
use agent_store::models::RcvQueueRow;
use agent_store::types::{ConnVariant, RcvQueueStatus, SndQueueStatus};

use crate::api::{AgentEvent, AppEvent, MsgIntegrity, MsgMeta};
use crate::context::AgentContext;
use crate::conn_manager::ConnectionManager;
use crate::crypto_mediator;
use crate::error::{AgentError, AgentErrorKind};

/// An `a-msg` that arrived on `nextRq` mid-rotation, parked until the swap
/// releases it in arrival order (§5 ordering guarantees).
struct BufferedMsg {
    meta: MsgMeta,
    flags: i64,
    body: Vec<u8>,
}

/// Owns the rotation buffer and drives the inbound event loop. One instance
/// per agent, spawned alongside the send pipeline.
pub struct ReceiveDispatcher {
    ctx: AgentContext,
    conn_mgr: Arc<ConnectionManager>,
    rotation_buffer: Mutex<HashMap<String, Vec<BufferedMsg>>>,
}

impl ReceiveDispatcher {
    pub fn new(ctx: AgentContext, conn_mgr: Arc<ConnectionManager>) -> Self {
        Self { ctx, conn_mgr, rotation_buffer: Mutex::new(HashMap::new()) }
    }

    /// Drains `inbound` until the channel closes. Intended to run for the
    /// lifetime of the agent in its own task.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<InboundEvent>) {
        while let Some(event) = inbound.recv().await {
            if let Err(err) = self.handle_event(event).await {
                warn!(%err, "inbound event handling failed");
            }
        }
        info!("receive dispatcher: inbound stream closed");
    }

    async fn handle_event(&self, event: InboundEvent) -> Result<(), AgentError> {
        match event.broker_msg.clone() {
            BrokerMsg::End => self.handle_end(event).await,
            BrokerMsg::Msg { server_msg_id, body } => self.handle_msg(event, server_msg_id, body).await,
        }
    }

    /// `END`: only meaningful if `sessionId` still matches the client we
    /// currently hold bound to that server; a reset-then-reconnect can race
    /// an `END` for the stale session past a fresh subscribe.
    async fn handle_end(&self, event: InboundEvent) -> Result<(), AgentError> {
        let current = self.ctx.relay.session_id(&event.server).await;
        match current {
            Ok(session_id) if session_id == event.session_id => {
                self.ctx.emit(AppEvent { corr_id: CorrId::generate(), conn_id: None, event: AgentEvent::End });
                Ok(())
            }
            _ => {
                info!(server = %event.server, "END for stale session ignored");
                Ok(())
            }
        }
    }

    async fn handle_msg(&self, event: InboundEvent, server_msg_id: String, body: Vec<u8>) -> Result<(), AgentError> {
        let rq = self.ctx.store.get_rcv_queue(&event.recipient_id).await?;
        let conn_id = ConnId(rq.conn_id.clone());

        let envelope: ClientEnvelope =
            serde_json::from_slice(&body).map_err(|e| AgentError::Internal(format!("malformed envelope: {e}")))?;

        let ratchet_row = self.ctx.store.load_ratchet(&conn_id.0).await?;

        let result = match ratchet_row {
            None => self.handle_initial_envelope(&event.server, &rq, &conn_id, envelope).await,
            Some(ratchet_row) => {
                self.handle_ratchet_envelope(&event.server, &rq, &conn_id, envelope, &ratchet_row.state_enc, &server_msg_id)
                    .await
            }
        };

        if result.is_ok() {
            self.ctx.relay.send_ack(&event.server, &rq.recipient_id, &server_msg_id).await.ok();
        }
        result
    }

    /// First `MSG` on a `New` Rq: `AgentConfirmation` on a regular queue,
    /// `AgentInvitation` on a `Contact` queue. Both are opened with the
    /// Rq's own one-time DH keypair.
    async fn handle_initial_envelope(
        &self,
        server: &ServerRef,
        rq: &RcvQueueRow,
        conn_id: &ConnId,
        envelope: ClientEnvelope,
    ) -> Result<(), AgentError> {
        match envelope {
            ClientEnvelope::AgentConfirmation { agent_version, enc_conn_info, .. } => {
                self.negotiate_version(agent_version)?;
                let plaintext = self.open_initial_box(rq, &enc_conn_info, b"conn-info").await?;
                let info: AgentConnInfo =
                    serde_json::from_slice(&plaintext).map_err(|e| AgentError::Internal(format!("malformed conn info: {e}")))?;

                let conf_id = ConfirmationId::generate();
                self.ctx
                    .store
                    .stage_confirmation(
                        &conf_id.0,
                        &conn_id.0,
                        &info.sender_verify_key,
                        &info.sender_e2e_pub_key,
                        &serde_json::to_string(&info.smp_reply_queues)?,
                        &info.conn_info,
                    )
                    .await?;

                let conn_info_bytes = URL_SAFE_NO_PAD.decode(&info.conn_info).unwrap_or_default();
                self.ctx.emit(AppEvent {
                    corr_id: CorrId::generate(),
                    conn_id: Some(conn_id.clone()),
                    event: AgentEvent::Conf { conf_id, servers: vec![server.clone()], info: conn_info_bytes },
                });
                Ok(())
            }
            ClientEnvelope::AgentInvitation { conn_req, conn_info } => {
                let plaintext = self.open_initial_box(rq, &conn_info, b"conn-info-reply").await?;
                let reply: AgentConnInfoReply =
                    serde_json::from_slice(&plaintext).map_err(|e| AgentError::Internal(format!("malformed conn info reply: {e}")))?;

                let invitation_id = InvitationId::generate();
                self.ctx.store.stage_invitation(&invitation_id.0, &conn_req, &reply.conn_info).await?;

                let connection = self.ctx.store.get_connection(&conn_id.0).await?;
                let event = match ConnVariant::parse(&connection.variant) {
                    Some(ConnVariant::Contact) => AgentEvent::Req { invitation_id },
                    _ => AgentEvent::Inv { invitation_id },
                };
                self.ctx.emit(AppEvent { corr_id: CorrId::generate(), conn_id: Some(conn_id.clone()), event });
                Ok(())
            }
            ClientEnvelope::AgentMsgEnvelope { .. } => Err(AgentError::Agent(AgentErrorKind::Message)),
        }
    }

    /// Opens a one-time confirmation/invitation box with the Rq's own DH
    /// keypair standing in on both sides. The sender's real ephemeral
    /// public key normally travels in the cleartext queue URI; parsing that
    /// URI is out of scope (§1 Non-goals), matching the same placeholder
    /// `ConnectionManager::join_connection` uses on the sending side.
    async fn open_initial_box(&self, rq: &RcvQueueRow, enc_b64: &str, aad: &[u8]) -> Result<Vec<u8>, AgentError> {
        let dh_priv_bytes = self.ctx.store.decrypt_value(&rq.e2e_dh_priv_enc).await?;
        let dh_priv: [u8; 32] = dh_priv_bytes
            .as_slice()
            .try_into()
            .map_err(|_| AgentError::Internal("malformed rq dh secret".into()))?;
        let dh_secret = StaticSecret::from(dh_priv);
        let dh_pub = X25519Public::from(&dh_secret);

        let sealed = URL_SAFE_NO_PAD
            .decode(enc_b64)
            .map_err(|e| AgentError::Internal(format!("bad base64 envelope body: {e}")))?;
        let padded = crypto_mediator::box_decrypt(&dh_secret, &dh_pub, &sealed, aad).map_err(AgentError::Crypto)?;
        codec::unpad(&padded).map_err(agent_proto::ProtoError::Codec).map_err(AgentError::from)
    }

    fn negotiate_version(&self, agent_version: u16) -> Result<(), AgentError> {
        let range = self.ctx.agent_config.smp_agent_v_range;
        if agent_version < range.min_version || agent_version > range.max_version {
            return Err(AgentError::Agent(AgentErrorKind::Version));
        }
        Ok(())
    }

    /// Any message on an established ratchet: decrypt, check integrity,
    /// route by inner payload kind.
    async fn handle_ratchet_envelope(
        &self,
        server: &ServerRef,
        rq: &RcvQueueRow,
        conn_id: &ConnId,
        envelope: ClientEnvelope,
        state_enc: &str,
        server_msg_id: &str,
    ) -> Result<(), AgentError> {
        let (enc_agent_message, ratchet_header) = match envelope {
            ClientEnvelope::AgentMsgEnvelope { enc_agent_message, ratchet_header, .. } => (enc_agent_message, ratchet_header),
            _ => return Err(AgentError::Agent(AgentErrorKind::Message)),
        };
        let ciphertext = URL_SAFE_NO_PAD
            .decode(&enc_agent_message)
            .map_err(|e| AgentError::Internal(format!("bad base64 agent message: {e}")))?;

        let state_bytes = self.ctx.store.decrypt_value(state_enc).await?;
        let mut rc = RatchetSession::from_bytes(&state_bytes).map_err(AgentError::Crypto)?;
        let padded = crypto_mediator::ratchet_decrypt(&mut rc, &ratchet_header, &ciphertext, conn_id.0.as_bytes())
            .map_err(AgentError::Crypto)?;
        let new_state_enc = self.ctx.store.encrypt_value(&rc.to_bytes().map_err(AgentError::Crypto)?).await?;
        self.ctx.store.store_ratchet(&conn_id.0, &new_state_enc).await?;

        let plaintext = codec::unpad(&padded).map_err(agent_proto::ProtoError::Codec)?;
        let inner: AgentMessage =
            serde_json::from_slice(&plaintext).map_err(|e| AgentError::Internal(format!("malformed agent message: {e}")))?;

        match inner.payload {
            AgentMsgPayload::AMsg { body } => self.handle_a_msg(rq, conn_id, &inner, body, server_msg_id).await,
            AgentMsgPayload::Hello => self.handle_hello(conn_id).await,
            AgentMsgPayload::Reply { .. } => {
                info!(%conn_id, "REPLY received (legacy duplex handshake)");
                Ok(())
            }
            AgentMsgPayload::QNew { next_queue_uri, .. } => self.conn_mgr.on_qnew(conn_id, &next_queue_uri).await,
            AgentMsgPayload::QKeys { next_sender_key, .. } => self.conn_mgr.on_qkeys(conn_id, &next_sender_key).await,
            AgentMsgPayload::QReady { .. } => self.conn_mgr.on_qready(conn_id).await,
            AgentMsgPayload::QTest => self.conn_mgr.on_qtest(conn_id).await,
            AgentMsgPayload::QSwitch { .. } => self.conn_mgr.on_qswitch(conn_id).await,
            AgentMsgPayload::QHello => {
                // `on_qhello` performs the current-Rq swap (`switchCurrRcvQueue`);
                // this is the exact point §5 calls "swap time" for releasing
                // whatever arrived on `nextRq` while rotation was pending.
                self.conn_mgr.on_qhello(conn_id).await?;
                self.release_buffered(conn_id).await;
                Ok(())
            }
        }
    }

    /// `HELLO`: the peer's send side is now `Active`. Mark our receive side
    /// `Active` too, and if the peer is already `Active` on their receive
    /// side as well, the duplex is up — emit `CON` (§4.6 on-success table).
    async fn handle_hello(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        if let Some(rq) = self.ctx.store.current_rcv_queue(&conn_id.0).await? {
            if RcvQueueStatus::parse(&rq.status) != Some(RcvQueueStatus::Active) {
                self.ctx.store.set_rcv_queue_status(&rq.id, RcvQueueStatus::Active).await?;
            }
        }
        let snd_active = self
            .ctx
            .store
            .current_snd_queue(&conn_id.0)
            .await?
            .is_some_and(|sq| SndQueueStatus::parse(&sq.status) == Some(SndQueueStatus::Active));
        if snd_active {
            self.ctx.emit(AppEvent { corr_id: CorrId(String::new()), conn_id: Some(conn_id.clone()), event: AgentEvent::Con });
        }
        Ok(())
    }

    /// `a-msg`: compute `MsgIntegrity` against the connection's receive
    /// tracking row, handle `A_DUPLICATE` idempotently, buffer during
    /// rotation, otherwise emit straight to the app.
    async fn handle_a_msg(
        &self,
        rq: &RcvQueueRow,
        conn_id: &ConnId,
        inner: &AgentMessage,
        body: Vec<u8>,
        server_msg_id: &str,
    ) -> Result<(), AgentError> {
        let ext_snd_id = inner.priv_header.snd_msg_id as i64;
        let claimed_prev_hash = inner.priv_header.prev_msg_hash.clone();

        let tracking = self.ctx.store.load_rcv_tracking(&conn_id.0).await?;
        let (prev_ext_snd_id, prev_hash) = match &tracking {
            Some(row) => (row.last_ext_snd_id, row.last_rcv_hash.clone()),
            None => (0, None),
        };

        let integrity = classify_integrity(prev_ext_snd_id, &prev_hash, ext_snd_id, &claimed_prev_hash);

        if integrity == MsgIntegrity::Duplicate {
            let Some(row) = tracking else {
                return Err(AgentError::Agent(AgentErrorKind::Duplicate));
            };
            if row.last_acked {
                // Already delivered and acked: the relay is retrying a
                // `server_msg_id` we already consumed. ACK again, nothing
                // else to do.
                return Ok(());
            }
            let last_body = match row.last_body_enc.as_deref() {
                Some(enc) => self.ctx.store.decrypt_value(enc).await?,
                None => Vec::new(),
            };
            self.emit_msg(conn_id, row.last_internal_id, MsgIntegrity::Duplicate, 0, last_body);
            return Ok(());
        }

        let hash = hex::encode(crypto_mediator::content_hash(&body));
        let body_enc = self.ctx.store.encrypt_value(&body).await?;
        let internal_id = self.ctx.store.record_rcv_message(&conn_id.0, ext_snd_id, &hash, &body_enc, server_msg_id).await?;

        // During rotation the old and new Rq rows briefly coexist; the
        // connection's designated current Rq (by id, not by the transient
        // `current_flag` both rows carry pre-swap) tells us whether this
        // message landed on the one the app already knows about or on the
        // new one still awaiting swap.
        let current = self.ctx.store.current_rcv_queue(&conn_id.0).await?;
        let is_rotating = current.as_ref().is_some_and(|c| c.id != rq.id);
        if is_rotating {
            let mut buf = self.rotation_buffer.lock();
            buf.entry(conn_id.0.clone()).or_default().push(BufferedMsg {
                meta: MsgMeta { internal_id, ts: chrono::Utc::now(), integrity },
                flags: 0,
                body,
            });
            return Ok(());
        }

        self.emit_msg(conn_id, internal_id, integrity, 0, body);
        Ok(())
    }

    /// Flushes any messages parked on `nextRq` during rotation, in arrival
    /// order, exactly once (§5 ordering guarantees). Called once the
    /// connection's current Rq has swapped.
    async fn release_buffered(&self, conn_id: &ConnId) {
        let buffered = {
            let mut buf = self.rotation_buffer.lock();
            buf.remove(&conn_id.0)
        };
        let Some(buffered) = buffered else { return };
        for msg in buffered {
            self.ctx.emit(AppEvent {
                corr_id: CorrId::generate(),
                conn_id: Some(conn_id.clone()),
                event: AgentEvent::Msg { meta: msg.meta, flags: msg.flags, body: msg.body },
            });
        }
    }

    fn emit_msg(&self, conn_id: &ConnId, internal_id: i64, integrity: MsgIntegrity, flags: i64, body: Vec<u8>) {
        self.ctx.emit(AppEvent {
            corr_id: CorrId::generate(),
            conn_id: Some(conn_id.clone()),
            event: AgentEvent::Msg {
                meta: MsgMeta { internal_id, ts: chrono::Utc::now(), integrity },
                flags,
                body,
            },
        });
    }
}

/// Pure `MsgIntegrity` classification (§4.7): exact resend is `Duplicate`
/// regardless of hash, a regression is `BadId`, a gap is `Skipped`, a
/// consecutive id with a mismatched chain link is `BadHash`, else `Ok`.
fn classify_integrity(
    prev_ext_snd_id: i64,
    prev_hash: &Option<String>,
    ext_snd_id: i64,
    claimed_prev_hash: &Option<String>,
) -> MsgIntegrity {
    if ext_snd_id == prev_ext_snd_id {
        MsgIntegrity::Duplicate
    } else if ext_snd_id < prev_ext_snd_id {
        MsgIntegrity::BadId
    } else if ext_snd_id > prev_ext_snd_id + 1 {
        MsgIntegrity::Skipped { lo: prev_ext_snd_id + 1, hi: ext_snd_id - 1 }
    } else if claimed_prev_hash != prev_hash {
        MsgIntegrity::BadHash
    } else {
        MsgIntegrity::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_message_after_none_is_ok() {
        assert_eq!(classify_integrity(0, &None, 1, &None), MsgIntegrity::Ok);
    }

    #[test]
    fn consecutive_with_matching_hash_is_ok() {
        let h = Some("h1".to_string());
        assert_eq!(classify_integrity(1, &h, 2, &h), MsgIntegrity::Ok);
    }

    #[test]
    fn exact_resend_is_duplicate_even_with_wrong_hash() {
        let h = Some("h1".to_string());
        let bad = Some("wrong".to_string());
        assert_eq!(classify_integrity(5, &h, 5, &bad), MsgIntegrity::Duplicate);
    }

    #[test]
    fn regression_is_bad_id() {
        assert_eq!(classify_integrity(5, &None, 3, &None), MsgIntegrity::BadId);
    }

    #[test]
    fn gap_is_skipped_with_bounds() {
        assert_eq!(classify_integrity(5, &None, 9, &None), MsgIntegrity::Skipped { lo: 6, hi: 8 });
    }

    #[test]
    fn consecutive_with_mismatched_hash_is_bad_hash() {
        let prev = Some("h1".to_string());
        let claimed = Some("h-wrong".to_string());
        assert_eq!(classify_integrity(1, &prev, 2, &claimed), MsgIntegrity::BadHash);
    }

    async fn test_ctx() -> (AgentContext, mpsc::UnboundedReceiver<AppEvent>, std::path::PathBuf) {
        let db_path = std::path::PathBuf::from(format!("/tmp/agent-core-recvdisp-{}.db", uuid::Uuid::new_v4()));
        let vault = agent_store::Vault::new();
        vault.unlock(b"pw", &[0u8; 16]).await.unwrap();
        let store = Arc::new(agent_store::Store::open(&db_path, vault).await.unwrap());
        let (relay, _rx) = agent_relay::RelayPool::simulated();
        let (_ntf_tx, ntf_rx) = tokio::sync::watch::channel(false);
        let ntf = Arc::new(agent_ntf::NtfSupervisor::new(
            agent_ntf::token::NtfToken::new("t", "dev", "ntf.example", agent_ntf::token::NtfMode::Instant),
            Arc::new(agent_ntf::supervisor::NoopNtfRelay),
            ntf_rx,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = AgentContext::new(
            store,
            Arc::new(relay),
            ntf,
            agent_proto::NetworkConfig::default(),
            agent_proto::AgentConfig::default(),
            events_tx,
        );
        (ctx, events_rx, db_path)
    }

    fn cleanup(path: std::path::PathBuf) {
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    fn dispatcher(ctx: &AgentContext) -> ReceiveDispatcher {
        let gate = Arc::new(crate::op_gate::OperationGate::new());
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let pipeline = Arc::new(crate::send_pipeline::SendPipeline::new(ctx.clone(), gate.clone(), shutdown_rx));
        let conn_mgr = Arc::new(ConnectionManager::new(ctx.clone(), gate, pipeline));
        ReceiveDispatcher::new(ctx.clone(), conn_mgr)
    }

    fn a_msg(ext_snd_id: i64, body: &[u8]) -> AgentMessage {
        AgentMessage {
            priv_header: agent_proto::agent_message::PrivHeader { snd_msg_id: ext_snd_id as u64, prev_msg_hash: None },
            payload: AgentMsgPayload::AMsg { body: body.to_vec() },
        }
    }

    #[tokio::test]
    async fn duplicate_redelivery_is_tagged_and_acked_without_a_second_record() {
        let (ctx, mut events, db_path) = test_ctx().await;
        let disp = dispatcher(&ctx);

        ctx.store.create_connection("c1", agent_store::types::ConnVariant::Duplex, 4, true, Some(true)).await.unwrap();
        let server = agent_proto::ServerRef { host: "relay.example".into(), port: 443, fingerprint: "fp".into() };
        let (recipient_id, sender_id, _uri) = ctx.relay.create_rcv_queue(&server).await.unwrap();
        let signing_enc = ctx.store.encrypt_value(b"sk").await.unwrap();
        let dh_enc = ctx.store.encrypt_value(b"dk").await.unwrap();
        ctx.store
            .create_rcv_queue(&recipient_id, "c1", &server.host, server.port as i64, &server.fingerprint, &recipient_id, &sender_id, &signing_enc, &dh_enc, 6)
            .await
            .unwrap();
        let rq = ctx.store.current_rcv_queue("c1").await.unwrap().unwrap();
        let conn_id = ConnId("c1".to_string());

        let first = a_msg(1, b"hello");
        disp.handle_a_msg(&rq, &conn_id, &first, b"hello".to_vec(), "smsg-1").await.unwrap();
        let ev = events.recv().await.unwrap();
        let AgentEvent::Msg { meta, .. } = ev.event else { panic!("expected Msg event") };
        assert_eq!(meta.integrity, MsgIntegrity::Ok);

        // Same `ext_snd_id` redelivered (the relay retrying an unacked
        // `server_msg_id`): tagged `Duplicate`, no second tracking row write.
        let replay = a_msg(1, b"hello");
        disp.handle_a_msg(&rq, &conn_id, &replay, b"hello".to_vec(), "smsg-1").await.unwrap();
        let ev = events.recv().await.unwrap();
        let AgentEvent::Msg { meta, .. } = ev.event else { panic!("expected Msg event") };
        assert_eq!(meta.integrity, MsgIntegrity::Duplicate);

        let tracking = ctx.store.load_rcv_tracking("c1").await.unwrap().unwrap();
        assert_eq!(tracking.last_ext_snd_id, 1);

        cleanup(db_path);
    }

    #[tokio::test]
    async fn rotation_buffer_releases_in_arrival_order() {
        let dispatcher_buffer: Mutex<HashMap<String, Vec<BufferedMsg>>> = Mutex::new(HashMap::new());
        {
            let mut buf = dispatcher_buffer.lock();
            let entry = buf.entry("c1".to_string()).or_default();
            entry.push(BufferedMsg {
                meta: MsgMeta { internal_id: 1, ts: chrono::Utc::now(), integrity: MsgIntegrity::Ok },
                flags: 0,
                body: b"first".to_vec(),
            });
            entry.push(BufferedMsg {
                meta: MsgMeta { internal_id: 2, ts: chrono::Utc::now(), integrity: MsgIntegrity::Ok },
                flags: 0,
                body: b"second".to_vec(),
            });
        }
        let released = dispatcher_buffer.lock().remove("c1").unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].body, b"first");
        assert_eq!(released[1].body, b"second");
    }
}
