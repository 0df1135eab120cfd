//! Database abstraction over SQLite via sqlx — the C1 Persistence Gateway
//! contract (§4.1): connection/queue CRUD, outbox append/read/delete,
//! ratchet state load/store, confirmation/invitation staging,
//! notification-token record, next-queue linkage.
//!
//! Every mutating method here runs inside its own `sqlx` transaction so
//! callers never observe a partially-applied multi-row update.

use std::path::Path;

use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
    Row, SqlitePool as Pool,
};

use crate::{
    error::StoreError,
    models::{
        ConfirmationRow, ConnectionRow, InvitationRow, NtfTokenRow, OutboxMessageRow,
        RatchetRow, RcvQueueRow, RcvTrackingRow, SndQueueRow,
    },
    types::{ConnVariant, MessageKind, NtfMode, NtfTokenStatus, RcvQueueStatus, RotationAction, SndQueueStatus},
    vault::Vault,
};

/// Central store handle. Cheap to clone (`Arc` internally via `SqlitePool`).
#[derive(Clone)]
pub struct Store {
    pub pool: Pool,
    pub vault: Vault,
}

impl Store {
    /// Open (or create) the SQLite database at `db_path`.
    /// Runs all pending migrations automatically.
    ///
    /// WAL journal mode and foreign-key enforcement are configured at connection
    /// time here — NOT inside a migration, because SQLite forbids changing
    /// `journal_mode` inside a transaction and sqlx wraps every migration in
    /// one.
    pub async fn open(db_path: &Path, vault: Vault) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, vault })
    }

    // ── Crypto helpers ──────────────────────────────────────────────────

    pub async fn encrypt_value(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        self.vault
            .with_key(|key| {
                let ct = agent_crypto::aead::encrypt(key, plaintext, b"agent-store-v1")
                    .map_err(StoreError::Crypto)?;
                Ok(base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, &ct))
            })
            .await
    }

    pub async fn decrypt_value(&self, b64: &str) -> Result<Vec<u8>, StoreError> {
        let ct = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, b64)
            .map_err(|e| StoreError::Crypto(agent_crypto::CryptoError::Base64Decode(e)))?;

        self.vault
            .with_key(|key| {
                let pt = agent_crypto::aead::decrypt(key, &ct, b"agent-store-v1").map_err(StoreError::Crypto)?;
                Ok(pt.to_vec())
            })
            .await
    }

    // ── Connections ──────────────────────────────────────────────────────

    pub async fn create_connection(
        &self,
        conn_id: &str,
        variant: ConnVariant,
        conn_agent_version: i64,
        enable_ntfs: bool,
        duplex_handshake: Option<bool>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO connections (conn_id, variant, conn_agent_version, enable_ntfs, duplex_handshake, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conn_id)
        .bind(variant.as_str())
        .bind(conn_agent_version)
        .bind(enable_ntfs)
        .bind(duplex_handshake)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_connection(&self, conn_id: &str) -> Result<ConnectionRow, StoreError> {
        sqlx::query_as::<_, ConnectionRow>("SELECT * FROM connections WHERE conn_id = ?")
            .bind(conn_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("connection {conn_id}")))
    }

    /// Promotes a `Rcv`/`Snd` connection to `Duplex` once the peer's reply
    /// queue arrives.
    pub async fn set_connection_variant(&self, conn_id: &str, variant: ConnVariant) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE connections SET variant = ?, updated_at = ? WHERE conn_id = ?")
            .bind(variant.as_str())
            .bind(Utc::now())
            .bind(conn_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("connection {conn_id}")));
        }
        Ok(())
    }

    pub async fn set_duplex_handshake(&self, conn_id: &str, value: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE connections SET duplex_handshake = ?, updated_at = ? WHERE conn_id = ?")
            .bind(value)
            .bind(Utc::now())
            .bind(conn_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_connection(&self, conn_id: &str) -> Result<(), StoreError> {
        // Cascades to queues, outbox, ratchet, skipped keys via FK ON DELETE CASCADE.
        sqlx::query("DELETE FROM connections WHERE conn_id = ?")
            .bind(conn_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Receive queues ───────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_rcv_queue(
        &self,
        id: &str,
        conn_id: &str,
        server_host: &str,
        server_port: i64,
        server_fingerprint: &str,
        recipient_id: &str,
        sender_id: &str,
        recipient_signing_key_enc: &str,
        e2e_dh_priv_enc: &str,
        smp_client_version: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO rcv_queues
               (id, conn_id, server_host, server_port, server_fingerprint, recipient_id, sender_id,
                recipient_signing_key_enc, e2e_dh_priv_enc, smp_client_version, status, current_flag, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'new', 1, ?)",
        )
        .bind(id)
        .bind(conn_id)
        .bind(server_host)
        .bind(server_port)
        .bind(server_fingerprint)
        .bind(recipient_id)
        .bind(sender_id)
        .bind(recipient_signing_key_enc)
        .bind(e2e_dh_priv_enc)
        .bind(smp_client_version)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_rcv_queue(&self, id: &str) -> Result<RcvQueueRow, StoreError> {
        sqlx::query_as::<_, RcvQueueRow>("SELECT * FROM rcv_queues WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("rcv_queue {id}")))
    }

    /// The current (`current_flag = 1`) Rq for a connection, if any.
    pub async fn current_rcv_queue(&self, conn_id: &str) -> Result<Option<RcvQueueRow>, StoreError> {
        Ok(sqlx::query_as::<_, RcvQueueRow>(
            "SELECT * FROM rcv_queues WHERE conn_id = ? AND current_flag = 1",
        )
        .bind(conn_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// `getNextRcvQueue` (§4.1).
    pub async fn get_next_rcv_queue(&self, conn_id: &str) -> Result<Option<RcvQueueRow>, StoreError> {
        Ok(sqlx::query_as::<_, RcvQueueRow>(
            "SELECT * FROM rcv_queues WHERE conn_id = ? AND current_flag = 0",
        )
        .bind(conn_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn set_rcv_queue_status(&self, id: &str, next: RcvQueueStatus) -> Result<(), StoreError> {
        let current = self.get_rcv_queue(id).await?;
        let current_status = RcvQueueStatus::parse(&current.status)
            .ok_or_else(|| StoreError::Integrity(format!("unknown rcv_queue status {}", current.status)))?;
        if !current_status.can_advance_to(next) {
            return Err(StoreError::Integrity(format!(
                "illegal rcv_queue transition {current_status:?} -> {next:?}"
            )));
        }
        sqlx::query("UPDATE rcv_queues SET status = ? WHERE id = ?")
            .bind(next.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_rcv_queue_sender_key(&self, id: &str, sender_public_verify_key: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE rcv_queues SET sender_public_verify_key = ? WHERE id = ?")
            .bind(sender_public_verify_key)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_rcv_queue_dh_secret(&self, id: &str, e2e_dh_secret_enc: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE rcv_queues SET e2e_dh_secret_enc = ? WHERE id = ?")
            .bind(e2e_dh_secret_enc)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Sets or clears (`None`) the pending rotation action. Only
    /// `rotationAction` may move backward, to `None`, on cancellation
    /// (§3 invariants).
    pub async fn set_rcv_rotation_action(&self, id: &str, action: Option<RotationAction>) -> Result<(), StoreError> {
        sqlx::query("UPDATE rcv_queues SET rotation_action = ?, rotation_action_ts = ? WHERE id = ?")
            .bind(action.map(|a| a.as_str()))
            .bind(action.map(|_| Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn link_next_rcv_queue(&self, current_id: &str, next_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE rcv_queues SET next_rcv_queue_id = ? WHERE id = ?")
            .bind(next_id)
            .bind(current_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `switchCurrRcvQueue` (§4.1): the paired next-queue row becomes
    /// current, the old current row is dropped.
    pub async fn switch_curr_rcv_queue(&self, conn_id: &str) -> Result<RcvQueueRow, StoreError> {
        let mut tx = self.pool.begin().await?;

        let old = sqlx::query_as::<_, RcvQueueRow>(
            "SELECT * FROM rcv_queues WHERE conn_id = ? AND current_flag = 1",
        )
        .bind(conn_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("current rcv_queue for {conn_id}")))?;

        let next_id = old
            .next_rcv_queue_id
            .clone()
            .ok_or_else(|| StoreError::Integrity("no next_rcv_queue_id linked for switch".into()))?;

        sqlx::query("UPDATE rcv_queues SET current_flag = 1 WHERE id = ?")
            .bind(&next_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM rcv_queues WHERE id = ?")
            .bind(&old.id)
            .execute(&mut *tx)
            .await?;

        let switched = sqlx::query_as::<_, RcvQueueRow>("SELECT * FROM rcv_queues WHERE id = ?")
            .bind(&next_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(switched)
    }

    pub async fn delete_rcv_queue(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM rcv_queues WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    // ── Send queues ──────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_snd_queue(
        &self,
        id: &str,
        conn_id: &str,
        server_host: &str,
        server_port: i64,
        server_fingerprint: &str,
        sender_id: &str,
        send_signing_key_enc: &str,
        e2e_dh_shared_secret_enc: &str,
        e2e_dh_public_key: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO snd_queues
               (id, conn_id, server_host, server_port, server_fingerprint, sender_id,
                send_signing_key_enc, e2e_dh_shared_secret_enc, e2e_dh_public_key, status, current_flag, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'new', 1, ?)",
        )
        .bind(id)
        .bind(conn_id)
        .bind(server_host)
        .bind(server_port)
        .bind(server_fingerprint)
        .bind(sender_id)
        .bind(send_signing_key_enc)
        .bind(e2e_dh_shared_secret_enc)
        .bind(e2e_dh_public_key)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_snd_queue(&self, id: &str) -> Result<SndQueueRow, StoreError> {
        sqlx::query_as::<_, SndQueueRow>("SELECT * FROM snd_queues WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("snd_queue {id}")))
    }

    pub async fn current_snd_queue(&self, conn_id: &str) -> Result<Option<SndQueueRow>, StoreError> {
        Ok(sqlx::query_as::<_, SndQueueRow>(
            "SELECT * FROM snd_queues WHERE conn_id = ? AND current_flag = 1",
        )
        .bind(conn_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// `getNextSndQueue` (§4.1) — mirror of [`Self::get_next_rcv_queue`].
    pub async fn get_next_snd_queue(&self, conn_id: &str) -> Result<Option<SndQueueRow>, StoreError> {
        Ok(sqlx::query_as::<_, SndQueueRow>(
            "SELECT * FROM snd_queues WHERE conn_id = ? AND current_flag = 0",
        )
        .bind(conn_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn set_snd_queue_status(&self, id: &str, next: SndQueueStatus) -> Result<(), StoreError> {
        let current = self.get_snd_queue(id).await?;
        let current_status = SndQueueStatus::parse(&current.status)
            .ok_or_else(|| StoreError::Integrity(format!("unknown snd_queue status {}", current.status)))?;
        if !current_status.can_advance_to(next) {
            return Err(StoreError::Integrity(format!(
                "illegal snd_queue transition {current_status:?} -> {next:?}"
            )));
        }
        sqlx::query("UPDATE snd_queues SET status = ? WHERE id = ?")
            .bind(next.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn link_next_snd_queue(&self, current_id: &str, next_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE snd_queues SET next_snd_queue_id = ? WHERE id = ?")
            .bind(next_id)
            .bind(current_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `switchCurrSndQueue` (§4.1) — mirror of [`Self::switch_curr_rcv_queue`].
    pub async fn switch_curr_snd_queue(&self, conn_id: &str) -> Result<SndQueueRow, StoreError> {
        let mut tx = self.pool.begin().await?;

        let old = sqlx::query_as::<_, SndQueueRow>(
            "SELECT * FROM snd_queues WHERE conn_id = ? AND current_flag = 1",
        )
        .bind(conn_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("current snd_queue for {conn_id}")))?;

        let next_id = old
            .next_snd_queue_id
            .clone()
            .ok_or_else(|| StoreError::Integrity("no next_snd_queue_id linked for switch".into()))?;

        sqlx::query("UPDATE snd_queues SET current_flag = 1 WHERE id = ?")
            .bind(&next_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM snd_queues WHERE id = ?")
            .bind(&old.id)
            .execute(&mut *tx)
            .await?;

        let switched = sqlx::query_as::<_, SndQueueRow>("SELECT * FROM snd_queues WHERE id = ?")
            .bind(&next_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(switched)
    }

    pub async fn delete_snd_queue(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM snd_queues WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Aborts an in-progress send-side rotation (§4.6 `QUOTA` on `q-test`/
    /// `q-hello`): drops the staged next Sq and unlinks it, leaving the
    /// current Sq untouched so ordinary sends keep flowing.
    pub async fn cancel_snd_rotation(&self, conn_id: &str) -> Result<(), StoreError> {
        let Some(sq) = self.current_snd_queue(conn_id).await? else { return Ok(()) };
        let Some(next_id) = sq.next_snd_queue_id.clone() else { return Ok(()) };
        self.delete_snd_queue(&next_id).await?;
        sqlx::query("UPDATE snd_queues SET next_snd_queue_id = NULL WHERE id = ?")
            .bind(&sq.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Outbox ───────────────────────────────────────────────────────────

    /// Appends a message, assigning `internal_id` and `hash`/`prev_hash`
    /// under one transaction (§3 invariants).
    pub async fn append_outbox_message(
        &self,
        conn_id: &str,
        kind: MessageKind,
        flags: i64,
        body_enc: &str,
        hash: &str,
    ) -> Result<OutboxMessageRow, StoreError> {
        self.append_outbox_message_for(conn_id, kind, flags, body_enc, hash, None).await
    }

    /// Same as [`Self::append_outbox_message`], but pins the row to a
    /// specific `senderId` instead of whichever Sq is `current` at send
    /// time — needed for `q-test`/`q-hello`, which must travel on the next
    /// Sq while it is still staged (§4.5).
    pub async fn append_outbox_message_for(
        &self,
        conn_id: &str,
        kind: MessageKind,
        flags: i64,
        body_enc: &str,
        hash: &str,
        target_sender_id: Option<&str>,
    ) -> Result<OutboxMessageRow, StoreError> {
        let mut tx = self.pool.begin().await?;

        let last: Option<(i64, i64, Option<String>)> = sqlx::query_as(
            "SELECT internal_id, internal_snd_id, hash FROM outbox_messages
             WHERE conn_id = ? ORDER BY internal_id DESC LIMIT 1",
        )
        .bind(conn_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (internal_id, internal_snd_id, prev_hash) = match last {
            Some((prev_internal, prev_snd, prev_hash)) => {
                let bump_snd = matches!(kind, MessageKind::AMsg);
                (prev_internal + 1, if bump_snd { prev_snd + 1 } else { prev_snd }, prev_hash)
            }
            None => (1, if matches!(kind, MessageKind::AMsg) { 1 } else { 0 }, None),
        };

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO outbox_messages (internal_id, conn_id, internal_snd_id, ts, kind, flags, body_enc, hash, prev_hash, target_sender_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(internal_id)
        .bind(conn_id)
        .bind(internal_snd_id)
        .bind(now)
        .bind(kind.as_str())
        .bind(flags)
        .bind(body_enc)
        .bind(hash)
        .bind(&prev_hash)
        .bind(target_sender_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(OutboxMessageRow {
            internal_id,
            conn_id: conn_id.to_string(),
            internal_snd_id,
            ts: now,
            kind: kind.as_str().to_string(),
            flags,
            body_enc: body_enc.to_string(),
            hash: hash.to_string(),
            prev_hash,
            target_sender_id: target_sender_id.map(str::to_string),
        })
    }

    /// Pending outbox entries for one connection, oldest first — the order
    /// the send-pipeline worker must drain them in (§5 ordering guarantees).
    pub async fn read_pending_outbox(&self, conn_id: &str) -> Result<Vec<OutboxMessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, OutboxMessageRow>(
            "SELECT * FROM outbox_messages WHERE conn_id = ? ORDER BY internal_id ASC",
        )
        .bind(conn_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Pending outbox entries across every connection sharing one `(server,
    /// senderId)` worker key (§3: "worker identity keyed by (server, senderId)").
    pub async fn read_pending_outbox_for_snd_key(
        &self,
        server_host: &str,
        server_port: i64,
        server_fingerprint: &str,
        sender_id: &str,
    ) -> Result<Vec<OutboxMessageRow>, StoreError> {
        Ok(sqlx::query_as::<_, OutboxMessageRow>(
            "SELECT om.* FROM outbox_messages om
             JOIN snd_queues sq ON sq.conn_id = om.conn_id
                AND ((om.target_sender_id IS NULL AND sq.current_flag = 1) OR om.target_sender_id = sq.sender_id)
             WHERE sq.server_host = ? AND sq.server_port = ? AND sq.server_fingerprint = ? AND sq.sender_id = ?
             ORDER BY om.internal_id ASC",
        )
        .bind(server_host)
        .bind(server_port)
        .bind(server_fingerprint)
        .bind(sender_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn delete_outbox_message(&self, conn_id: &str, internal_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM outbox_messages WHERE conn_id = ? AND internal_id = ?")
            .bind(conn_id)
            .bind(internal_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drops every pending outbox record for a connection — used by
    /// `deleteConnection` to cancel in-flight sends (§5 Cancellation).
    pub async fn clear_outbox(&self, conn_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM outbox_messages WHERE conn_id = ?")
            .bind(conn_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Ratchet state ────────────────────────────────────────────────────

    pub async fn load_ratchet(&self, conn_id: &str) -> Result<Option<RatchetRow>, StoreError> {
        Ok(sqlx::query_as::<_, RatchetRow>("SELECT * FROM ratchets WHERE conn_id = ?")
            .bind(conn_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Persists the full ratchet state blob (§3 Ratchet lifecycle). The
    /// skipped-message-key table travels inside the encrypted ratchet state
    /// itself (`RatchetSession` bounds and evicts it internally), so there
    /// is nothing further to reconcile here.
    pub async fn store_ratchet(&self, conn_id: &str, state_enc: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ratchets (conn_id, state_enc, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(conn_id) DO UPDATE SET state_enc = excluded.state_enc, updated_at = excluded.updated_at",
        )
        .bind(conn_id)
        .bind(state_enc)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Receive-side tracking ────────────────────────────────────────────

    pub async fn load_rcv_tracking(&self, conn_id: &str) -> Result<Option<RcvTrackingRow>, StoreError> {
        Ok(sqlx::query_as::<_, RcvTrackingRow>("SELECT * FROM rcv_tracking WHERE conn_id = ?")
            .bind(conn_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Records the last successfully decrypted `a-msg` for a connection,
    /// assigning it a fresh locally-assigned `internal_id`. Returns the
    /// assigned id.
    pub async fn record_rcv_message(
        &self,
        conn_id: &str,
        ext_snd_id: i64,
        hash: &str,
        body_enc: &str,
        server_msg_id: &str,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let prev: Option<(i64,)> = sqlx::query_as(
            "SELECT last_internal_id FROM rcv_tracking WHERE conn_id = ?",
        )
        .bind(conn_id)
        .fetch_optional(&mut *tx)
        .await?;
        let internal_id = prev.map(|(id,)| id + 1).unwrap_or(1);

        sqlx::query(
            "INSERT INTO rcv_tracking (conn_id, last_ext_snd_id, last_rcv_hash, last_internal_id, last_body_enc, last_acked, last_server_msg_id, updated_at)
             VALUES (?, ?, ?, ?, ?, 0, ?, ?)
             ON CONFLICT(conn_id) DO UPDATE SET
                last_ext_snd_id = excluded.last_ext_snd_id,
                last_rcv_hash = excluded.last_rcv_hash,
                last_internal_id = excluded.last_internal_id,
                last_body_enc = excluded.last_body_enc,
                last_acked = 0,
                last_server_msg_id = excluded.last_server_msg_id,
                updated_at = excluded.updated_at",
        )
        .bind(conn_id)
        .bind(ext_snd_id)
        .bind(hash)
        .bind(internal_id)
        .bind(body_enc)
        .bind(server_msg_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(internal_id)
    }

    /// Marks the connection's last delivered message as app-acked and
    /// drops the cached plaintext body — a later redelivery of the same
    /// `ext_snd_id` still classifies `Duplicate` (§4.7), but now
    /// short-circuits to a bare re-ack instead of re-emitting a body we no
    /// longer hold.
    pub async fn mark_rcv_acked(&self, conn_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE rcv_tracking SET last_acked = 1, last_body_enc = NULL WHERE conn_id = ?")
            .bind(conn_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Confirmation / invitation staging ───────────────────────────────

    pub async fn stage_confirmation(
        &self,
        conf_id: &str,
        conn_id: &str,
        sender_verify_key: &str,
        sender_e2e_pub_key: &str,
        smp_reply_queues_json: &str,
        conn_info: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO confirmations (conf_id, conn_id, sender_verify_key, sender_e2e_pub_key, smp_reply_queues_json, conn_info, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conf_id)
        .bind(conn_id)
        .bind(sender_verify_key)
        .bind(sender_e2e_pub_key)
        .bind(smp_reply_queues_json)
        .bind(conn_info)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_confirmation(&self, conf_id: &str) -> Result<ConfirmationRow, StoreError> {
        sqlx::query_as::<_, ConfirmationRow>("SELECT * FROM confirmations WHERE conf_id = ?")
            .bind(conf_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("confirmation {conf_id}")))
    }

    pub async fn delete_confirmation(&self, conf_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM confirmations WHERE conf_id = ?").bind(conf_id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn stage_invitation(&self, invitation_id: &str, conn_req: &str, conn_info: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO invitations (invitation_id, conn_req, conn_info, accepted, created_at) VALUES (?, ?, ?, 0, ?)",
        )
        .bind(invitation_id)
        .bind(conn_req)
        .bind(conn_info)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_invitation(&self, invitation_id: &str) -> Result<InvitationRow, StoreError> {
        sqlx::query_as::<_, InvitationRow>("SELECT * FROM invitations WHERE invitation_id = ?")
            .bind(invitation_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("invitation {invitation_id}")))
    }

    pub async fn mark_invitation_accepted(&self, invitation_id: &str) -> Result<(), StoreError> {
        let res = sqlx::query("UPDATE invitations SET accepted = 1 WHERE invitation_id = ?")
            .bind(invitation_id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("invitation {invitation_id}")));
        }
        Ok(())
    }

    pub async fn delete_invitation(&self, invitation_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM invitations WHERE invitation_id = ?")
            .bind(invitation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Notification tokens ──────────────────────────────────────────────

    pub async fn upsert_ntf_token(
        &self,
        id: &str,
        device_token: &str,
        ntf_server: &str,
        mode: NtfMode,
    ) -> Result<NtfTokenRow, StoreError> {
        sqlx::query(
            "INSERT INTO ntf_tokens (id, device_token, ntf_server, status, mode, created_at) VALUES (?, ?, ?, 'none', ?, ?)
             ON CONFLICT(id) DO UPDATE SET device_token = excluded.device_token, ntf_server = excluded.ntf_server, mode = excluded.mode",
        )
        .bind(id)
        .bind(device_token)
        .bind(ntf_server)
        .bind(mode.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        self.get_ntf_token(id).await
    }

    pub async fn get_ntf_token(&self, id: &str) -> Result<NtfTokenRow, StoreError> {
        sqlx::query_as::<_, NtfTokenRow>("SELECT * FROM ntf_tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("ntf_token {id}")))
    }

    pub async fn set_ntf_token_status(&self, id: &str, status: NtfTokenStatus, tkn_id: Option<&str>) -> Result<(), StoreError> {
        sqlx::query("UPDATE ntf_tokens SET status = ?, tkn_id = COALESCE(?, tkn_id) WHERE id = ?")
            .bind(status.as_str())
            .bind(tkn_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_ntf_token(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM ntf_tokens WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    /// Count of connections that still have notifications enabled — used by
    /// the notification supervisor to decide whether any subscriptions
    /// remain live after a bulk `toggleConnectionNtfs`.
    pub async fn count_ntf_enabled_connections(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM connections WHERE enable_ntfs = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::Vault;
    use std::path::PathBuf;
    use uuid::Uuid;

    async fn open_test_store() -> (Store, PathBuf) {
        let db_path = PathBuf::from(format!("/tmp/agent-store-test-{}.db", Uuid::new_v4()));
        let vault = Vault::new();
        vault.unlock(b"password", &[0u8; 16]).await.expect("unlock");
        let store = Store::open(&db_path, vault).await.expect("open store");
        (store, db_path)
    }

    fn cleanup(db_path: PathBuf) {
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn outbox_assigns_strictly_increasing_internal_ids() {
        let (store, db_path) = open_test_store().await;
        store.create_connection("c1", ConnVariant::Duplex, 4, true, Some(true)).await.unwrap();

        let m1 = store.append_outbox_message("c1", MessageKind::Hello, 0, "enc1", "h1").await.unwrap();
        let m2 = store.append_outbox_message("c1", MessageKind::AMsg, 0, "enc2", "h2").await.unwrap();

        assert_eq!(m1.internal_id, 1);
        assert_eq!(m2.internal_id, 2);
        assert_eq!(m2.prev_hash.as_deref(), Some("h1"));
        assert_eq!(m2.internal_snd_id, 1); // only a-msg bumps internal_snd_id

        cleanup(db_path);
    }

    #[tokio::test]
    async fn rcv_queue_status_transitions_are_monotone() {
        let (store, db_path) = open_test_store().await;
        store.create_connection("c1", ConnVariant::Rcv, 4, true, None).await.unwrap();
        store
            .create_rcv_queue("rq1", "c1", "relay.example", 443, "fp", "rid", "sid", "enc1", "enc2", 6)
            .await
            .unwrap();

        store.set_rcv_queue_status("rq1", RcvQueueStatus::Confirmed).await.unwrap();
        assert!(store.set_rcv_queue_status("rq1", RcvQueueStatus::New).await.is_err());

        cleanup(db_path);
    }

    #[tokio::test]
    async fn delete_connection_cascades_to_outbox_and_queues() {
        let (store, db_path) = open_test_store().await;
        store.create_connection("c1", ConnVariant::Rcv, 4, true, None).await.unwrap();
        store
            .create_rcv_queue("rq1", "c1", "relay.example", 443, "fp", "rid", "sid", "enc1", "enc2", 6)
            .await
            .unwrap();
        store.append_outbox_message("c1", MessageKind::Hello, 0, "enc", "h").await.unwrap();

        store.delete_connection("c1").await.unwrap();

        assert!(store.get_connection("c1").await.is_err());
        assert!(store.get_rcv_queue("rq1").await.is_err());
        assert!(store.read_pending_outbox("c1").await.unwrap().is_empty());

        cleanup(db_path);
    }
}
