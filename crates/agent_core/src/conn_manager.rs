//! Connection Manager (C5, §4.5) — the public API surface. Every method
//! takes the agent-wide lock before touching store/ratchet state, mirroring
//! how `guard-service::engine::EngineHandle` serializes state-machine
//! transitions behind one mutex while leaving I/O (relay calls) to run
//! outside it where possible.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use agent_crypto::ratchet::RatchetSession;
use agent_crypto::x3dh::X3DHHeader;
use agent_proto::{
    agent_message::{AgentMessage, AgentMsgPayload, PrivHeader, SmpQueueInfo},
    codec, AgentConnInfo, ClientEnvelope, ConfirmationId, ConnId, InternalId, InvitationId,
    ServerRef,
};
use agent_store::types::{ConnVariant, MessageKind, NtfMode, RcvQueueStatus, RotationAction, SndQueueStatus};

use crate::api::{AgentEvent, AppEvent, ConnectionStats, SwitchPhase};
use crate::context::AgentContext;
use crate::crypto_mediator;
use crate::error::{AgentError, ConnErrorKind};
use crate::op_gate::{OpClass, OperationGate};

/// Minimum negotiated agent version at which a fresh X3DH handshake is
/// carried in `AgentConfirmation.e2e_encryption` rather than the legacy
/// (no-handshake) confirmation flow.
const DUPLEX_HANDSHAKE_MIN_VERSION: u16 = 2;

/// Handed back by `createConnection`/`joinConnection`: everything the
/// caller needs to publish or embed in an out-of-band connection request.
pub struct NewConnection {
    pub conn_id: ConnId,
    pub queue_uri: String,
}

pub struct ConnectionManager {
    ctx: AgentContext,
    gate: Arc<OperationGate>,
    send_pipeline: Arc<crate::send_pipeline::SendPipeline>,
    /// Serializes state-machine-visible effects across all API calls, per
    /// §5: "each call takes the agent-wide lock".
    lock: AsyncMutex<()>,
}

impl ConnectionManager {
    pub fn new(ctx: AgentContext, gate: Arc<OperationGate>, send_pipeline: Arc<crate::send_pipeline::SendPipeline>) -> Self {
        Self { ctx, gate, send_pipeline, lock: AsyncMutex::new(()) }
    }

    fn require_lease(&self, class: OpClass) -> Result<crate::op_gate::Lease, AgentError> {
        self.gate.begin(class).ok_or(AgentError::CmdProhibited)
    }

    // ── Connection establishment ─────────────────────────────────────────

    /// `createConnection` — the initiator side: mints a fresh Rq on
    /// `server` and returns its URI for out-of-band exchange.
    pub async fn create_connection(
        &self,
        server: &ServerRef,
        enable_ntfs: bool,
    ) -> Result<NewConnection, AgentError> {
        let _guard = self.lock.lock().await;
        let _lease = self.require_lease(OpClass::RcvNetwork)?;

        let conn_id = ConnId::generate();
        let (recipient_id, sender_id, queue_uri) = self.ctx.relay.create_rcv_queue(server).await?;

        let signing = crypto_mediator::signing_key_pair()?;
        let dh_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);

        let signing_enc = self.ctx.store.encrypt_value(&signing.secret_bytes()[..]).await?;
        let dh_priv_enc = self.ctx.store.encrypt_value(&dh_secret.to_bytes()).await?;

        self.ctx
            .store
            .create_connection(&conn_id.0, ConnVariant::Rcv, 4, enable_ntfs, Some(true))
            .await?;
        self.ctx
            .store
            .create_rcv_queue(
                &recipient_id,
                &conn_id.0,
                &server.host,
                server.port as i64,
                &server.fingerprint,
                &recipient_id,
                &sender_id,
                &signing_enc,
                &dh_priv_enc,
                6,
            )
            .await?;

        if enable_ntfs {
            self.ctx.ntf.on_connection_subscribed(conn_id.clone());
        }

        info!(%conn_id, %queue_uri, "connection created");
        Ok(NewConnection { conn_id, queue_uri })
    }

    /// `joinConnection` — the responder side: accepts a peer's queue URI,
    /// sends the box-encrypted `AgentConfirmation`, and establishes its own
    /// half of the duplex ratchet immediately (mirroring `allowConnection`
    /// on the other side). `shared_key` is the X3DH result the caller
    /// already derived against the peer's published prekey bundle — real
    /// bundle fetch and queue-URI parsing are out of scope (§1 Non-goals),
    /// so `join_connection` takes the agreed key as input the same way
    /// `allow_connection`/`accept_contact` do.
    pub async fn join_connection(
        &self,
        server: &ServerRef,
        peer_queue_uri: &str,
        conn_info: &[u8],
        shared_key: [u8; 32],
    ) -> Result<ConnId, AgentError> {
        let _guard = self.lock.lock().await;
        let _lease = self.require_lease(OpClass::SndNetwork)?;

        let conn_id = ConnId::generate();
        let sender_id = peer_queue_uri.to_string();

        // No peer range is available before the first round trip, so the
        // agent announces its own max and leans on `negotiate_version` at
        // the responder to reject anything outside its own range (§4.5).
        let agent_version = self.ctx.agent_config.smp_agent_v_range.max_version;
        let duplex_handshake = agent_version >= DUPLEX_HANDSHAKE_MIN_VERSION;

        let my_ik = crypto_mediator::signing_key_pair()?;
        let my_dh_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let my_dh_pub = X25519Public::from(&my_dh_secret);

        // Placeholder peer DH pub until the real transport parses
        // `peer_queue_uri`; queue URI parsing is out of scope (§1 Non-goals).
        let peer_dh_pub = my_dh_pub;

        let body = AgentConnInfo {
            sender_verify_key: URL_SAFE_NO_PAD.encode(my_ik.public_b64()),
            sender_e2e_pub_key: URL_SAFE_NO_PAD.encode(my_dh_pub.as_bytes()),
            smp_reply_queues: vec![],
            conn_info: URL_SAFE_NO_PAD.encode(conn_info),
        };
        let body_json = serde_json::to_vec(&body)?;
        let padded = codec::pad_to_length(&body_json, self.ctx.agent_config.e2e_enc_conn_info_length)
            .map_err(agent_proto::ProtoError::Codec)?;
        let sealed = crypto_mediator::box_encrypt(&my_dh_secret, &peer_dh_pub, &padded, b"conn-info")?;

        let e2e_encryption = duplex_handshake.then(|| X3DHHeader {
            session_id: conn_id.0.clone(),
            sender_user_id: conn_id.0.clone(),
            ik_pub: my_ik.public_b64(),
            ek_pub: URL_SAFE_NO_PAD.encode(my_dh_pub.as_bytes()),
            opk_id: None,
        });

        let envelope = ClientEnvelope::AgentConfirmation {
            agent_version,
            e2e_encryption,
            enc_conn_info: URL_SAFE_NO_PAD.encode(&sealed),
        };
        let envelope_bytes = serde_json::to_vec(&envelope)?;

        self.ctx
            .store
            .create_connection(&conn_id.0, ConnVariant::Snd, agent_version as i64, true, Some(duplex_handshake))
            .await?;
        let signing_enc = self.ctx.store.encrypt_value(&my_ik.secret_bytes()[..]).await?;
        let dh_shared_enc = self.ctx.store.encrypt_value(&my_dh_secret.to_bytes()).await?;
        self.ctx
            .store
            .create_snd_queue(
                &sender_id,
                &conn_id.0,
                &server.host,
                server.port as i64,
                &server.fingerprint,
                &sender_id,
                &signing_enc,
                &dh_shared_enc,
                &URL_SAFE_NO_PAD.encode(my_dh_pub.as_bytes()),
            )
            .await?;

        let body_enc = self.ctx.store.encrypt_value(&envelope_bytes).await?;
        let hash = hex::encode(crypto_mediator::content_hash(body_enc.as_bytes()));
        self.ctx.store.append_outbox_message(&conn_id.0, MessageKind::ConnInfo, 0, &body_enc, &hash).await?;
        self.wake_send_worker(&conn_id).await?;

        let rc = RatchetSession::init_alice(conn_id.0.clone(), sender_id.clone(), shared_key, &peer_dh_pub)
            .map_err(AgentError::Crypto)?;
        let state_enc = self.ctx.store.encrypt_value(&rc.to_bytes()?).await?;
        self.ctx.store.store_ratchet(&conn_id.0, &state_enc).await?;

        info!(%conn_id, duplex_handshake, "connection join queued");
        Ok(conn_id)
    }

    /// `allowConnection` — accept a staged confirmation (§4.5) and
    /// establish the duplex ratchet using the already-derived X3DH shared
    /// key carried alongside it.
    pub async fn allow_connection(
        &self,
        conf_id: &ConfirmationId,
        shared_key: [u8; 32],
        peer_spk_pub: &X25519Public,
    ) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let conf = self.ctx.store.load_confirmation(&conf_id.0).await?;

        let rc = RatchetSession::init_bob(
            conf.conn_id.clone(),
            conf.sender_verify_key.clone(),
            shared_key,
            &StaticSecret::random_from_rng(rand::rngs::OsRng),
            peer_spk_pub,
        )
        .map_err(AgentError::Crypto)?;
        let state_enc = self.ctx.store.encrypt_value(&rc.to_bytes()?).await?;
        self.ctx.store.store_ratchet(&conf.conn_id, &state_enc).await?;
        self.ctx.store.set_connection_variant(&conf.conn_id, ConnVariant::Duplex).await?;
        self.ctx.store.delete_confirmation(&conf_id.0).await?;

        info!(conn_id = %conf.conn_id, "connection allowed, duplex ratchet established");
        Ok(())
    }

    /// `acceptContact` — turn a staged contact request into a `Duplex`
    /// connection, mirroring `allowConnection` but sourced from an
    /// `AgentInvitation` rather than a confirmation.
    pub async fn accept_contact(
        &self,
        invitation_id: &InvitationId,
        shared_key: [u8; 32],
        peer_spk_pub: &X25519Public,
    ) -> Result<ConnId, AgentError> {
        let _guard = self.lock.lock().await;
        let _invitation = self.ctx.store.load_invitation(&invitation_id.0).await?;
        let conn_id = ConnId::generate();

        let rc = RatchetSession::init_bob(
            conn_id.0.clone(),
            invitation_id.0.clone(),
            shared_key,
            &StaticSecret::random_from_rng(rand::rngs::OsRng),
            peer_spk_pub,
        )
        .map_err(AgentError::Crypto)?;
        let state_enc = self.ctx.store.encrypt_value(&rc.to_bytes()?).await?;

        self.ctx.store.create_connection(&conn_id.0, ConnVariant::Duplex, 4, true, Some(true)).await?;
        self.ctx.store.store_ratchet(&conn_id.0, &state_enc).await?;
        self.ctx.store.mark_invitation_accepted(&invitation_id.0).await?;

        info!(%conn_id, invitation_id = %invitation_id.0, "contact accepted");
        Ok(conn_id)
    }

    /// `rejectContact` — discard a staged invitation without creating a
    /// connection.
    pub async fn reject_contact(&self, invitation_id: &InvitationId) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        // NotFound on a staged invitation is caller mis-use (§7), not an
        // internal failure.
        self.ctx
            .store
            .load_invitation(&invitation_id.0)
            .await
            .map_err(|_| AgentError::Conn(ConnErrorKind::NotAvailable))?;
        self.ctx.store.delete_invitation(&invitation_id.0).await?;
        Ok(())
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    pub async fn subscribe_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        let _lease = self.require_lease(OpClass::RcvNetwork)?;
        let rq = self
            .ctx
            .store
            .current_rcv_queue(&conn_id.0)
            .await?
            .ok_or(AgentError::Conn(ConnErrorKind::NotAvailable))?;
        let server = ServerRef { host: rq.server_host, port: rq.server_port as u16, fingerprint: rq.server_fingerprint };
        self.ctx.relay.subscribe_queue(&server, &rq.recipient_id).await?;
        if true {
            self.ctx.ntf.on_connection_subscribed(conn_id.clone());
        }
        Ok(())
    }

    pub async fn subscribe_connections(&self, conn_ids: &[ConnId]) -> Vec<(ConnId, Result<(), AgentError>)> {
        let mut out = Vec::with_capacity(conn_ids.len());
        for conn_id in conn_ids {
            out.push((conn_id.clone(), self.subscribe_connection(conn_id).await));
        }
        out
    }

    pub async fn resubscribe_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        self.subscribe_connection(conn_id).await
    }

    // ── Messaging ────────────────────────────────────────────────────────

    /// `sendMessage` — encrypt `body` under the connection's current
    /// ratchet and append it to the persistent outbox (§4.6 picks it up
    /// from there; this call never touches the network directly).
    pub async fn send_message(&self, conn_id: &ConnId, body: Vec<u8>) -> Result<InternalId, AgentError> {
        let _guard = self.lock.lock().await;
        let _lease = self.require_lease(OpClass::MsgDelivery)?;

        let ratchet_row = self
            .ctx
            .store
            .load_ratchet(&conn_id.0)
            .await?
            .ok_or(AgentError::Conn(ConnErrorKind::Simplex))?;
        let state_bytes = self.ctx.store.decrypt_value(&ratchet_row.state_enc).await?;
        let mut rc = RatchetSession::from_bytes(&state_bytes).map_err(AgentError::Crypto)?;

        let inner = AgentMessage {
            priv_header: PrivHeader { snd_msg_id: rc.send_n, prev_msg_hash: None },
            payload: AgentMsgPayload::AMsg { body },
        };
        let plaintext = serde_json::to_vec(&inner)?;
        let padded = codec::pad_to_length(&plaintext, self.ctx.agent_config.e2e_enc_user_msg_length)
            .map_err(agent_proto::ProtoError::Codec)?;
        let (header, ciphertext) =
            crypto_mediator::ratchet_encrypt(&mut rc, &padded, conn_id.0.as_bytes()).map_err(AgentError::Crypto)?;

        let new_state_enc = self.ctx.store.encrypt_value(&rc.to_bytes()?).await?;
        self.ctx.store.store_ratchet(&conn_id.0, &new_state_enc).await?;

        let envelope = ClientEnvelope::AgentMsgEnvelope {
            agent_version: self.ctx.agent_config.smp_agent_v_range.max_version,
            enc_agent_message: URL_SAFE_NO_PAD.encode(&ciphertext),
            ratchet_header: header,
        };
        let body_enc = self.ctx.store.encrypt_value(&serde_json::to_vec(&envelope)?).await?;
        let hash = hex::encode(crypto_mediator::content_hash(&body_enc.as_bytes()[..]));

        let row = self.ctx.store.append_outbox_message(&conn_id.0, MessageKind::AMsg, 0, &body_enc, &hash).await?;
        self.wake_send_worker(conn_id).await?;
        Ok(row.internal_id)
    }

    /// `ackMessage` (§4.5) — mark the received message user-acked: send the
    /// relay ACK (swallowing `NO_MSG`, which just means the broker already
    /// dropped it), then delete the tracked received-message record.
    pub async fn ack_message(&self, conn_id: &ConnId, _internal_id: InternalId) -> Result<(), AgentError> {
        let rq = self
            .ctx
            .store
            .current_rcv_queue(&conn_id.0)
            .await?
            .ok_or(AgentError::Conn(ConnErrorKind::NotAvailable))?;
        let tracking = self.ctx.store.load_rcv_tracking(&conn_id.0).await?;
        if let Some(server_msg_id) = tracking.as_ref().and_then(|t| t.last_server_msg_id.as_deref()) {
            let server = ServerRef { host: rq.server_host, port: rq.server_port as u16, fingerprint: rq.server_fingerprint };
            match self.ctx.relay.send_ack(&server, &rq.recipient_id, server_msg_id).await {
                Ok(()) => {}
                Err(agent_relay::RelayError::Smp(agent_relay::SmpErrorCode::NoMsg)) => {
                    warn!(%conn_id, "relay ACK found no pending message, already delivered");
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.ctx.store.mark_rcv_acked(&conn_id.0).await?;
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub async fn suspend_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        if let Some(rq) = self.ctx.store.current_rcv_queue(&conn_id.0).await? {
            let server = ServerRef { host: rq.server_host, port: rq.server_port as u16, fingerprint: rq.server_fingerprint };
            let remaining = self.ctx.relay.suspend_queue(&server, &rq.recipient_id).await?;
            info!(%conn_id, remaining, "connection suspended");
        }
        Ok(())
    }

    /// `deleteConnection` — cancels pending outbox work and frees all
    /// store rows; cascades via FK (§5 Cancellation).
    pub async fn delete_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        self.ctx.store.clear_outbox(&conn_id.0).await?;

        if let Some(rq) = self.ctx.store.current_rcv_queue(&conn_id.0).await? {
            let server = ServerRef { host: rq.server_host.clone(), port: rq.server_port as u16, fingerprint: rq.server_fingerprint.clone() };
            if let Err(err) = self.ctx.relay.delete_queue(&server, &rq.recipient_id).await {
                warn!(%conn_id, %err, "relay queue delete failed during deleteConnection; store record still dropped");
            }
        }

        self.ctx.ntf.on_connection_deleted(conn_id.clone());
        self.ctx.store.delete_connection(&conn_id.0).await?;
        Ok(())
    }

    pub async fn get_connection_servers(&self, conn_id: &ConnId) -> Result<Vec<ServerRef>, AgentError> {
        let mut servers = Vec::new();
        if let Some(rq) = self.ctx.store.current_rcv_queue(&conn_id.0).await? {
            servers.push(ServerRef { host: rq.server_host, port: rq.server_port as u16, fingerprint: rq.server_fingerprint });
        }
        if let Some(sq) = self.ctx.store.current_snd_queue(&conn_id.0).await? {
            let s = ServerRef { host: sq.server_host, port: sq.server_port as u16, fingerprint: sq.server_fingerprint };
            if !servers.contains(&s) {
                servers.push(s);
            }
        }
        Ok(servers)
    }

    pub async fn connection_stats(&self, conn_id: &ConnId) -> Result<ConnectionStats, AgentError> {
        let rcv = usize::from(self.ctx.store.current_rcv_queue(&conn_id.0).await?.is_some());
        let snd = usize::from(self.ctx.store.current_snd_queue(&conn_id.0).await?.is_some());
        Ok(ConnectionStats { rcv_queues: rcv, snd_queues: snd })
    }

    // ── Server / network configuration ──────────────────────────────────

    pub fn get_network_config(&self) -> agent_proto::NetworkConfig {
        (*self.ctx.network_config).clone()
    }

    // ── Notifications ───────────────────────────────────────────────────

    pub async fn register_ntf_token(&self, device_token: &str, ntf_server: &str) -> Result<(), AgentError> {
        self.ctx.store.upsert_ntf_token("default", device_token, ntf_server, NtfMode::Instant).await?;
        self.ctx.ntf.register().await?;
        Ok(())
    }

    pub async fn verify_ntf_token(&self, tkn_id: String) -> Result<(), AgentError> {
        self.ctx.ntf.verify(tkn_id).await?;
        Ok(())
    }

    pub async fn check_ntf_token(&self) -> Result<(), AgentError> {
        self.ctx.ntf.check().await?;
        Ok(())
    }

    pub async fn delete_ntf_token(&self) -> Result<(), AgentError> {
        self.ctx.store.delete_ntf_token("default").await?;
        self.ctx.ntf.delete_token().await?;
        Ok(())
    }

    pub async fn toggle_connection_ntfs(&self, conn_id: &ConnId, enable: bool) -> Result<(), AgentError> {
        self.ctx.store.get_connection(&conn_id.0).await?;
        if enable {
            self.ctx.ntf.on_connection_subscribed(conn_id.clone());
        } else {
            self.ctx.ntf.on_connection_deleted(conn_id.clone());
        }
        Ok(())
    }

    // ── Agent lifecycle (C8) ─────────────────────────────────────────────

    pub async fn activate_agent(&self) {
        self.gate.activate_agent();
    }

    pub async fn suspend_agent(&self, max_delay: std::time::Duration) {
        self.gate.suspend_agent(max_delay).await;
    }

    // ── Queue rotation (§3, §4.5) ────────────────────────────────────────

    /// `switchConnection` — starts rotation by creating a fresh Rq and
    /// announcing it to the peer via `QNEW`. The remainder of the state
    /// machine (`QKEYS` → `QREADY` → swap → `QTEST`/`QSWITCH` → `QHELLO`)
    /// plays out as inbound messages arrive through [`crate::recv_dispatcher`].
    pub async fn switch_connection(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let _lease = self.require_lease(OpClass::RcvNetwork)?;

        let current = self
            .ctx
            .store
            .current_rcv_queue(&conn_id.0)
            .await?
            .ok_or(AgentError::Conn(ConnErrorKind::NotAvailable))?;
        let server =
            ServerRef { host: current.server_host.clone(), port: current.server_port as u16, fingerprint: current.server_fingerprint.clone() };

        let (recipient_id, sender_id, queue_uri) = self.ctx.relay.create_rcv_queue(&server).await?;
        let signing = crypto_mediator::signing_key_pair()?;
        let dh_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let signing_enc = self.ctx.store.encrypt_value(&signing.secret_bytes()[..]).await?;
        let dh_priv_enc = self.ctx.store.encrypt_value(&dh_secret.to_bytes()).await?;

        self.ctx
            .store
            .create_rcv_queue(
                &recipient_id,
                &conn_id.0,
                &server.host,
                server.port as i64,
                &server.fingerprint,
                &recipient_id,
                &sender_id,
                &signing_enc,
                &dh_priv_enc,
                6,
            )
            .await?;
        self.ctx.store.link_next_rcv_queue(&current.id, &recipient_id).await?;
        self.ctx.store.set_rcv_rotation_action(&current.id, Some(RotationAction::CreateNext)).await?;

        let qnew = AgentMsgPayload::QNew { current_addr: current.id.clone(), next_queue_uri: queue_uri };
        self.send_control(conn_id, qnew).await?;

        self.ctx.emit(AppEvent {
            corr_id: agent_proto::CorrId(String::new()),
            conn_id: Some(conn_id.clone()),
            event: AgentEvent::Switch { phase: SwitchPhase::Started, stats: self.connection_stats(conn_id).await? },
        });
        info!(%conn_id, "rotation started: QNEW sent");
        Ok(())
    }

    /// Handles a peer's `QNEW`: secures the announced next queue and
    /// replies with `QKEYS`.
    pub(crate) async fn on_qnew(&self, conn_id: &ConnId, next_queue_uri: &str) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let sq = self
            .ctx
            .store
            .current_snd_queue(&conn_id.0)
            .await?
            .ok_or(AgentError::Conn(ConnErrorKind::NotAvailable))?;
        let server = ServerRef { host: sq.server_host.clone(), port: sq.server_port as u16, fingerprint: sq.server_fingerprint.clone() };

        let signing = crypto_mediator::signing_key_pair()?;
        let dh_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let dh_pub = X25519Public::from(&dh_secret);
        let next_sender_id = next_queue_uri.to_string();

        self.ctx.relay.secure_queue(&server, &next_sender_id, &signing.public_b64()).await?;
        self.ctx.store.set_snd_queue_status(&sq.id, SndQueueStatus::Confirmed).await?;

        let signing_enc = self.ctx.store.encrypt_value(&signing.secret_bytes()[..]).await?;
        let dh_enc = self.ctx.store.encrypt_value(&dh_secret.to_bytes()).await?;
        self.ctx
            .store
            .create_snd_queue(
                &next_sender_id,
                &conn_id.0,
                &server.host,
                server.port as i64,
                &server.fingerprint,
                &next_sender_id,
                &signing_enc,
                &dh_enc,
                &URL_SAFE_NO_PAD.encode(dh_pub.as_bytes()),
            )
            .await?;
        self.ctx.store.link_next_snd_queue(&sq.id, &next_sender_id).await?;

        let qkeys = AgentMsgPayload::QKeys {
            next_sender_key: signing.public_b64(),
            next_queue_info: SmpQueueInfo { queue_uri: next_queue_uri.to_string(), sender_key: signing.public_b64() },
        };
        self.send_control(conn_id, qkeys).await?;
        Ok(())
    }

    /// Peer's `QKEYS` arrived: our next Sq is secured at the relay
    /// (`secure_queue`), mark it `Secured` and tell the peer with `QREADY`
    /// so they can test it before anyone swaps (§4.5 `SecureNext`).
    pub(crate) async fn on_qkeys(&self, conn_id: &ConnId, next_sender_key: &str) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let next_rq = self
            .ctx
            .store
            .get_next_rcv_queue(&conn_id.0)
            .await?
            .ok_or(AgentError::Conn(ConnErrorKind::NotAvailable))?;
        let server =
            ServerRef { host: next_rq.server_host.clone(), port: next_rq.server_port as u16, fingerprint: next_rq.server_fingerprint.clone() };
        self.ctx.relay.secure_queue(&server, &next_rq.recipient_id, next_sender_key).await?;
        self.ctx.store.set_rcv_queue_sender_key(&next_rq.id, next_sender_key).await?;
        self.ctx.store.set_rcv_queue_status(&next_rq.id, RcvQueueStatus::Secured).await?;

        self.send_control(conn_id, AgentMsgPayload::QReady { addr: next_rq.id.clone() }).await?;
        Ok(())
    }

    /// Peer's `QREADY` arrived: the peer's next Rq is secured. Send
    /// `QTEST` over our own next Sq (not yet current) to confirm it is
    /// reachable before anyone swaps.
    pub(crate) async fn on_qready(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let next_sq = self
            .ctx
            .store
            .get_next_snd_queue(&conn_id.0)
            .await?
            .ok_or(AgentError::Conn(ConnErrorKind::NotAvailable))?;
        self.enqueue_control_targeted(conn_id, AgentMsgPayload::QTest, Some(&next_sq.sender_id)).await?;
        Ok(())
    }

    /// Our `QTEST` arrived on the peer's next Rq: the rotation's send side
    /// is confirmed reachable. Swap our own Rq side and send `QSWITCH` so
    /// the peer swaps too.
    pub(crate) async fn on_qtest(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let switched = self.ctx.store.switch_curr_rcv_queue(&conn_id.0).await?;
        self.ctx.store.set_rcv_queue_status(&switched.id, RcvQueueStatus::Active).await?;
        self.send_control(conn_id, AgentMsgPayload::QSwitch { addr: switched.id.clone() }).await?;
        Ok(())
    }

    /// Peer acked the swap (`QSWITCH`): swap our own send side and send
    /// `QHELLO` so the peer suspends and deletes its stale Rq.
    pub(crate) async fn on_qswitch(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let switched = self.ctx.store.switch_curr_snd_queue(&conn_id.0).await?;
        self.ctx.store.set_snd_queue_status(&switched.id, SndQueueStatus::Active).await?;
        self.send_control(conn_id, AgentMsgPayload::QHello).await?;
        Ok(())
    }

    /// Sender's `QHELLO` arrived on the new Rq: suspend the stale current
    /// Rq at the relay, delete it there once drained, then swap it out of
    /// the store and mark rotation complete (§4.5 `SuspendCurrent` →
    /// `DeleteCurrent`).
    pub(crate) async fn on_qhello(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        if let Some(stale) = self.ctx.store.current_rcv_queue(&conn_id.0).await? {
            let server =
                ServerRef { host: stale.server_host.clone(), port: stale.server_port as u16, fingerprint: stale.server_fingerprint.clone() };
            self.ctx.store.set_rcv_rotation_action(&stale.id, Some(RotationAction::SuspendCurrent)).await?;
            let remaining = self.ctx.relay.suspend_queue(&server, &stale.recipient_id).await?;
            if remaining == 0 {
                self.ctx.store.set_rcv_rotation_action(&stale.id, Some(RotationAction::DeleteCurrent)).await?;
                self.ctx.relay.delete_queue(&server, &stale.recipient_id).await?;
            }
        }

        let switched = self.ctx.store.switch_curr_rcv_queue(&conn_id.0).await?;
        self.ctx.store.set_rcv_queue_status(&switched.id, RcvQueueStatus::Active).await?;

        self.ctx.emit(AppEvent {
            corr_id: agent_proto::CorrId(String::new()),
            conn_id: Some(conn_id.clone()),
            event: AgentEvent::Switch { phase: SwitchPhase::Completed, stats: self.connection_stats(conn_id).await? },
        });
        info!(%conn_id, "rotation complete");
        Ok(())
    }

    /// Serializes and sends a control `AgentMessage` (no app-visible body)
    /// through the same ratchet+outbox path as `send_message`.
    async fn send_control(&self, conn_id: &ConnId, payload: AgentMsgPayload) -> Result<(), AgentError> {
        self.enqueue_control_targeted(conn_id, payload, None).await
    }

    /// Same as [`Self::send_control`], but pins the outbox row to
    /// `target_sender_id` when given — needed for `QTEST`, which must
    /// travel over the next (not-yet-current) Sq (§4.5).
    async fn enqueue_control_targeted(
        &self,
        conn_id: &ConnId,
        payload: AgentMsgPayload,
        target_sender_id: Option<&str>,
    ) -> Result<(), AgentError> {
        let ratchet_row = self
            .ctx
            .store
            .load_ratchet(&conn_id.0)
            .await?
            .ok_or(AgentError::Conn(ConnErrorKind::Simplex))?;
        let state_bytes = self.ctx.store.decrypt_value(&ratchet_row.state_enc).await?;
        let mut rc = RatchetSession::from_bytes(&state_bytes).map_err(AgentError::Crypto)?;

        let inner = AgentMessage { priv_header: PrivHeader { snd_msg_id: rc.send_n, prev_msg_hash: None }, payload };
        let plaintext = serde_json::to_vec(&inner)?;
        let padded = codec::pad_to_length(&plaintext, self.ctx.agent_config.e2e_enc_user_msg_length)
            .map_err(agent_proto::ProtoError::Codec)?;
        let (header, ciphertext) =
            crypto_mediator::ratchet_encrypt(&mut rc, &padded, conn_id.0.as_bytes()).map_err(AgentError::Crypto)?;

        let new_state_enc = self.ctx.store.encrypt_value(&rc.to_bytes()?).await?;
        self.ctx.store.store_ratchet(&conn_id.0, &new_state_enc).await?;

        let envelope = ClientEnvelope::AgentMsgEnvelope {
            agent_version: self.ctx.agent_config.smp_agent_v_range.max_version,
            enc_agent_message: URL_SAFE_NO_PAD.encode(&ciphertext),
            ratchet_header: header,
        };
        let body_enc = self.ctx.store.encrypt_value(&serde_json::to_vec(&envelope)?).await?;
        let hash = hex::encode(crypto_mediator::content_hash(&body_enc.as_bytes()[..]));
        let kind = match &inner.payload {
            AgentMsgPayload::Hello => MessageKind::Hello,
            AgentMsgPayload::Reply { .. } => MessageKind::Reply,
            AgentMsgPayload::AMsg { .. } => MessageKind::AMsg,
            AgentMsgPayload::QNew { .. } => MessageKind::QNew,
            AgentMsgPayload::QKeys { .. } => MessageKind::QKeys,
            AgentMsgPayload::QReady { .. } => MessageKind::QReady,
            AgentMsgPayload::QTest => MessageKind::QTest,
            AgentMsgPayload::QSwitch { .. } => MessageKind::QSwitch,
            AgentMsgPayload::QHello => MessageKind::QHello,
        };
        self.ctx
            .store
            .append_outbox_message_for(&conn_id.0, kind, 0, &body_enc, &hash, target_sender_id)
            .await?;
        self.wake_send_worker(conn_id).await?;
        Ok(())
    }

    /// Kicks the `(server, senderId)` worker backing `conn_id`'s current
    /// send queue so a freshly appended outbox entry is picked up without
    /// waiting out the retry interval.
    async fn wake_send_worker(&self, conn_id: &ConnId) -> Result<(), AgentError> {
        if let Some(sq) = self.ctx.store.current_snd_queue(&conn_id.0).await? {
            let server = ServerRef { host: sq.server_host, port: sq.server_port as u16, fingerprint: sq.server_fingerprint };
            self.send_pipeline.notify(server, sq.sender_id);
        }
        // A targeted row (q-test/q-hello) may live on the next Sq, which a
        // worker keyed by the current Sq's (server, senderId) never polls.
        if let Some(sq) = self.ctx.store.get_next_snd_queue(&conn_id.0).await? {
            let server = ServerRef { host: sq.server_host, port: sq.server_port as u16, fingerprint: sq.server_fingerprint };
            self.send_pipeline.notify(server, sq.sender_id);
        }
        Ok(())
    }
}

/// Serializes and appends a control `AgentMessage` to the outbox, the same
/// way [`ConnectionManager::send_control`] does — exposed as a free
/// function so the send pipeline's success path (§4.6) can enqueue a
/// follow-up control message without holding a `ConnectionManager`.
pub(crate) async fn enqueue_control(ctx: &AgentContext, conn_id: &ConnId, payload: AgentMsgPayload) -> Result<(), AgentError> {
    let ratchet_row = ctx.store.load_ratchet(&conn_id.0).await?.ok_or(AgentError::Conn(ConnErrorKind::Simplex))?;
    let state_bytes = ctx.store.decrypt_value(&ratchet_row.state_enc).await?;
    let mut rc = RatchetSession::from_bytes(&state_bytes).map_err(AgentError::Crypto)?;

    let inner = AgentMessage { priv_header: PrivHeader { snd_msg_id: rc.send_n, prev_msg_hash: None }, payload };
    let plaintext = serde_json::to_vec(&inner)?;
    let padded =
        codec::pad_to_length(&plaintext, ctx.agent_config.e2e_enc_user_msg_length).map_err(agent_proto::ProtoError::Codec)?;
    let (header, ciphertext) =
        crypto_mediator::ratchet_encrypt(&mut rc, &padded, conn_id.0.as_bytes()).map_err(AgentError::Crypto)?;

    let new_state_enc = ctx.store.encrypt_value(&rc.to_bytes()?).await?;
    ctx.store.store_ratchet(&conn_id.0, &new_state_enc).await?;

    let envelope = ClientEnvelope::AgentMsgEnvelope {
        agent_version: ctx.agent_config.smp_agent_v_range.max_version,
        enc_agent_message: URL_SAFE_NO_PAD.encode(&ciphertext),
        ratchet_header: header,
    };
    let body_enc = ctx.store.encrypt_value(&serde_json::to_vec(&envelope)?).await?;
    let hash = hex::encode(crypto_mediator::content_hash(&body_enc.as_bytes()[..]));
    let kind = match &inner.payload {
        AgentMsgPayload::Hello => MessageKind::Hello,
        AgentMsgPayload::Reply { .. } => MessageKind::Reply,
        AgentMsgPayload::AMsg { .. } => MessageKind::AMsg,
        AgentMsgPayload::QNew { .. } => MessageKind::QNew,
        AgentMsgPayload::QKeys { .. } => MessageKind::QKeys,
        AgentMsgPayload::QReady { .. } => MessageKind::QReady,
        AgentMsgPayload::QTest => MessageKind::QTest,
        AgentMsgPayload::QSwitch { .. } => MessageKind::QSwitch,
        AgentMsgPayload::QHello => MessageKind::QHello,
    };
    ctx.store.append_outbox_message(&conn_id.0, kind, 0, &body_enc, &hash).await?;
    Ok(())
}

/// Called once a `conn-info`/`conn-info-reply` row is delivered (§4.6 success
/// table): the Sq moves to `Confirmed`, and unless this is a duplex-handshake
/// v2 connection (whose `HELLO` only goes out once the peer's `AgentConfirmation`
/// arrives), queue `HELLO` right away.
pub(crate) async fn on_conn_info_sent(ctx: &AgentContext, conn_id: &ConnId) -> Result<(), AgentError> {
    if let Some(sq) = ctx.store.current_snd_queue(&conn_id.0).await? {
        ctx.store.set_snd_queue_status(&sq.id, SndQueueStatus::Confirmed).await?;
    }
    let conn = ctx.store.get_connection(&conn_id.0).await?;
    if conn.duplex_handshake != Some(true) {
        enqueue_control(ctx, conn_id, AgentMsgPayload::Hello).await?;
    }
    Ok(())
}

/// Called once a `hello` row is delivered (§4.6 success table): the Sq
/// moves to `Active`. If the receive side is already `Active` the duplex is
/// up and `CON` fires; on a legacy (pre-v2) connection that never did the
/// duplex-handshake, the side that just confirmed its send queue also has
/// to mint its own receive queue and offer it back via `REPLY`.
pub(crate) async fn on_hello_sent(ctx: &AgentContext, conn_id: &ConnId) -> Result<(), AgentError> {
    if let Some(sq) = ctx.store.current_snd_queue(&conn_id.0).await? {
        ctx.store.set_snd_queue_status(&sq.id, SndQueueStatus::Active).await?;
    }

    let rcv_active = ctx
        .store
        .current_rcv_queue(&conn_id.0)
        .await?
        .is_some_and(|rq| RcvQueueStatus::parse(&rq.status) == Some(RcvQueueStatus::Active));
    if rcv_active {
        ctx.emit(AppEvent { corr_id: agent_proto::CorrId(String::new()), conn_id: Some(conn_id.clone()), event: AgentEvent::Con });
        return Ok(());
    }

    let conn = ctx.store.get_connection(&conn_id.0).await?;
    if conn.duplex_handshake != Some(true) {
        let sq = ctx
            .store
            .current_snd_queue(&conn_id.0)
            .await?
            .ok_or(AgentError::Conn(ConnErrorKind::NotAvailable))?;
        let server = ServerRef { host: sq.server_host.clone(), port: sq.server_port as u16, fingerprint: sq.server_fingerprint.clone() };

        let (recipient_id, sender_id, queue_uri) = ctx.relay.create_rcv_queue(&server).await?;
        let signing = crypto_mediator::signing_key_pair()?;
        let dh_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let signing_enc = ctx.store.encrypt_value(&signing.secret_bytes()[..]).await?;
        let dh_priv_enc = ctx.store.encrypt_value(&dh_secret.to_bytes()).await?;
        ctx.store
            .create_rcv_queue(
                &recipient_id,
                &conn_id.0,
                &server.host,
                server.port as i64,
                &server.fingerprint,
                &recipient_id,
                &sender_id,
                &signing_enc,
                &dh_priv_enc,
                6,
            )
            .await?;
        ctx.store.set_connection_variant(&conn_id.0, ConnVariant::Duplex).await?;

        let reply = AgentMsgPayload::Reply { smp_queues: vec![SmpQueueInfo { queue_uri, sender_key: signing.public_b64() }] };
        enqueue_control(ctx, conn_id, reply).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_proto::AgentConfig;
    use agent_store::{Store, Vault};
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn test_ctx() -> (AgentContext, tokio::sync::mpsc::UnboundedReceiver<crate::api::AppEvent>, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/agent-core-connmgr-{}.db", Uuid::new_v4()));
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
            AgentConfig::default(),
            events_tx,
        );
        (ctx, events_rx, db_path)
    }

    fn cleanup(path: PathBuf) {
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    fn test_server() -> ServerRef {
        ServerRef { host: "relay.example".into(), port: 443, fingerprint: "fp".into() }
    }

    fn mgr(ctx: &AgentContext) -> ConnectionManager {
        let gate = Arc::new(OperationGate::new());
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let pipeline = Arc::new(crate::send_pipeline::SendPipeline::new(ctx.clone(), gate.clone(), shutdown_rx));
        ConnectionManager::new(ctx.clone(), gate, pipeline)
    }

    #[tokio::test]
    async fn create_connection_stages_a_new_rcv_queue() {
        let (ctx, _events, db_path) = test_ctx().await;
        let cm = mgr(&ctx);

        let server = test_server();
        let created = cm.create_connection(&server, true).await.unwrap();

        let conn = ctx.store.get_connection(&created.conn_id.0).await.unwrap();
        assert_eq!(conn.id, created.conn_id.0);
        let rq = ctx.store.current_rcv_queue(&created.conn_id.0).await.unwrap();
        assert!(rq.is_some());

        cleanup(db_path);
    }

    #[tokio::test]
    async fn join_connection_establishes_a_usable_ratchet() {
        let (ctx, _events, db_path) = test_ctx().await;
        let cm = mgr(&ctx);

        let server = test_server();
        let shared_key = [7u8; 32];
        let conn_id = cm.join_connection(&server, "smp://relay.example/peer-queue", b"hi", shared_key).await.unwrap();

        // A joiner with a stored ratchet can immediately send a follow-up
        // message, which `allow_connection` alone would not allow.
        let sent = cm.send_message(&conn_id, b"ping".to_vec()).await;
        assert!(sent.is_ok());

        cleanup(db_path);
    }

    #[tokio::test]
    async fn reject_contact_discards_the_staged_invitation_without_a_connection() {
        let (ctx, _events, db_path) = test_ctx().await;
        let cm = mgr(&ctx);

        ctx.store.stage_invitation("inv1", "conn-req-blob", "conn-info-blob").await.unwrap();
        cm.reject_contact(&InvitationId("inv1".to_string())).await.unwrap();

        assert!(ctx.store.load_invitation("inv1").await.is_err());

        // A later attempt to reject the same (now-gone) invitation is
        // caller mis-use, surfaced as `NotAvailable` rather than a panic.
        let err = cm.reject_contact(&InvitationId("inv1".to_string())).await.unwrap_err();
        assert!(matches!(err, AgentError::Conn(ConnErrorKind::NotAvailable)));

        cleanup(db_path);
    }

    #[tokio::test]
    async fn switch_connection_requires_an_existing_rcv_queue() {
        let (ctx, _events, db_path) = test_ctx().await;
        let cm = mgr(&ctx);

        let err = cm.switch_connection(&ConnId("missing".to_string())).await.unwrap_err();
        assert!(matches!(err, AgentError::Conn(ConnErrorKind::NotAvailable)));

        cleanup(db_path);
    }

    #[tokio::test]
    async fn switch_connection_starts_rotation_and_links_the_next_queue() {
        let (ctx, _events, db_path) = test_ctx().await;
        let cm = mgr(&ctx);

        let server = test_server();
        let shared_key = [9u8; 32];
        let conn_id = cm.join_connection(&server, "smp://relay.example/peer-queue", b"hi", shared_key).await.unwrap();

        cm.switch_connection(&conn_id).await.unwrap();

        let outbox = ctx.store.read_pending_outbox(&conn_id.0).await.unwrap();
        assert!(outbox.iter().any(|row| row.kind == "q-new"));

        cleanup(db_path);
    }
}
