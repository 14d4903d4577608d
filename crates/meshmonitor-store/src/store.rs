//! Persistent storage manager
//!
//! One SQLite database holds the whole durable mesh model. All access goes
//! through `Store` operations; writes are serialized by the pool and the
//! few read-modify-write paths (welcome mark, delivery state) are expressed
//! as single conditional statements so concurrent producers cannot race.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{
    AuditEntry, Channel, DeliveryState, Message, MessagePage, NeighborEdge, Node, NodePatch,
    RawPacket, TelemetryKind, TelemetrySample, TracerouteRecord,
};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Persistent storage manager
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("meshmonitor.db");
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

        info!("Opening database: {}", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        debug!("Running database migrations...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                node_num INTEGER PRIMARY KEY,
                node_id TEXT NOT NULL,
                long_name TEXT,
                short_name TEXT,
                hw_model INTEGER,
                role INTEGER,
                public_key BLOB,
                is_licensed INTEGER NOT NULL DEFAULT 0,
                snr REAL,
                last_heard INTEGER,
                hops_away INTEGER,
                via_mqtt INTEGER NOT NULL DEFAULT 0,
                channel INTEGER,
                latitude REAL,
                longitude REAL,
                altitude INTEGER,
                position_time INTEGER,
                battery_level INTEGER,
                voltage REAL,
                channel_utilization REAL,
                air_util_tx REAL,
                uptime_seconds INTEGER,
                is_favorite INTEGER NOT NULL DEFAULT 0,
                is_ignored INTEGER NOT NULL DEFAULT 0,
                welcomed_at INTEGER,
                firmware_version TEXT,
                reboot_count INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS channels (
                idx INTEGER PRIMARY KEY,
                name TEXT,
                psk BLOB,
                role INTEGER NOT NULL DEFAULT 0,
                uplink_enabled INTEGER NOT NULL DEFAULT 0,
                downlink_enabled INTEGER NOT NULL DEFAULT 0,
                position_precision INTEGER,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER NOT NULL,
                from_node_num INTEGER NOT NULL,
                to_node_num INTEGER NOT NULL,
                from_node_id TEXT NOT NULL,
                to_node_id TEXT NOT NULL,
                channel INTEGER NOT NULL,
                text TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                portnum INTEGER NOT NULL,
                reply_id INTEGER,
                emoji INTEGER NOT NULL DEFAULT 0,
                hop_start INTEGER,
                hop_limit INTEGER,
                via_mqtt INTEGER NOT NULL DEFAULT 0,
                delivery_state TEXT,
                ack_failed INTEGER NOT NULL DEFAULT 0,
                request_id INTEGER,
                is_local INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (from_node_id, id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_channel_ts
             ON messages (channel, timestamp DESC)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traceroutes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_node_num INTEGER NOT NULL,
                to_node_num INTEGER NOT NULL,
                route TEXT,
                route_back TEXT,
                snr_towards TEXT,
                snr_back TEXT,
                timestamp INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS telemetry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_num INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                kind TEXT NOT NULL,
                metrics TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_telemetry_node_ts
             ON telemetry (node_num, timestamp DESC)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_packets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_node_num INTEGER NOT NULL,
                to_node_num INTEGER NOT NULL,
                portnum INTEGER NOT NULL,
                payload BLOB NOT NULL,
                rx_time INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS neighbors (
                node_num INTEGER NOT NULL,
                neighbor_num INTEGER NOT NULL,
                snr REAL NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (node_num, neighbor_num)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                resource TEXT,
                details TEXT,
                ip TEXT,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS read_marks (
                conversation TEXT PRIMARY KEY,
                last_read_ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        debug!("Database migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // === Nodes ===

    /// Merge a partial update into the node row. Fields the patch leaves
    /// unset keep their stored value; `created_at` is never overwritten.
    pub async fn upsert_node(&self, patch: &NodePatch) -> Result<()> {
        let ts = now();
        let node_id = meshmonitor_proto::node_id_from_num(patch.node_num);

        sqlx::query(
            r#"
            INSERT INTO nodes (
                node_num, node_id, long_name, short_name, hw_model, role,
                public_key, is_licensed, snr, last_heard, hops_away, via_mqtt,
                channel, latitude, longitude, altitude, position_time,
                battery_level, voltage, channel_utilization, air_util_tx,
                uptime_seconds, is_favorite, is_ignored, firmware_version,
                reboot_count, created_at, updated_at
            )
            VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, 0), ?9, ?10, ?11,
                COALESCE(?12, 0), ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
                ?21, ?22, COALESCE(?23, 0), COALESCE(?24, 0), ?25, ?26, ?27, ?27
            )
            ON CONFLICT (node_num) DO UPDATE SET
                long_name = COALESCE(excluded.long_name, nodes.long_name),
                short_name = COALESCE(excluded.short_name, nodes.short_name),
                hw_model = COALESCE(excluded.hw_model, nodes.hw_model),
                role = COALESCE(excluded.role, nodes.role),
                public_key = COALESCE(excluded.public_key, nodes.public_key),
                is_licensed = CASE WHEN ?8 IS NULL THEN nodes.is_licensed ELSE ?8 END,
                snr = COALESCE(excluded.snr, nodes.snr),
                last_heard = COALESCE(excluded.last_heard, nodes.last_heard),
                hops_away = COALESCE(excluded.hops_away, nodes.hops_away),
                via_mqtt = CASE WHEN ?12 IS NULL THEN nodes.via_mqtt ELSE ?12 END,
                channel = COALESCE(excluded.channel, nodes.channel),
                latitude = COALESCE(excluded.latitude, nodes.latitude),
                longitude = COALESCE(excluded.longitude, nodes.longitude),
                altitude = COALESCE(excluded.altitude, nodes.altitude),
                position_time = COALESCE(excluded.position_time, nodes.position_time),
                battery_level = COALESCE(excluded.battery_level, nodes.battery_level),
                voltage = COALESCE(excluded.voltage, nodes.voltage),
                channel_utilization = COALESCE(excluded.channel_utilization, nodes.channel_utilization),
                air_util_tx = COALESCE(excluded.air_util_tx, nodes.air_util_tx),
                uptime_seconds = COALESCE(excluded.uptime_seconds, nodes.uptime_seconds),
                is_favorite = CASE WHEN ?23 IS NULL THEN nodes.is_favorite ELSE ?23 END,
                is_ignored = CASE WHEN ?24 IS NULL THEN nodes.is_ignored ELSE ?24 END,
                firmware_version = COALESCE(excluded.firmware_version, nodes.firmware_version),
                reboot_count = COALESCE(excluded.reboot_count, nodes.reboot_count),
                updated_at = ?27
            "#,
        )
        .bind(patch.node_num)
        .bind(&node_id)
        .bind(&patch.long_name)
        .bind(&patch.short_name)
        .bind(patch.hw_model)
        .bind(patch.role)
        .bind(&patch.public_key)
        .bind(patch.is_licensed)
        .bind(patch.snr)
        .bind(patch.last_heard)
        .bind(patch.hops_away)
        .bind(patch.via_mqtt)
        .bind(patch.channel)
        .bind(patch.latitude)
        .bind(patch.longitude)
        .bind(patch.altitude)
        .bind(patch.position_time)
        .bind(patch.battery_level)
        .bind(patch.voltage)
        .bind(patch.channel_utilization)
        .bind(patch.air_util_tx)
        .bind(patch.uptime_seconds)
        .bind(patch.is_favorite)
        .bind(patch.is_ignored)
        .bind(&patch.firmware_version)
        .bind(patch.reboot_count)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_node(&self, node_num: u32) -> Result<Option<Node>> {
        let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE node_num = ?1")
            .bind(node_num)
            .fetch_optional(&self.pool)
            .await?;
        Ok(node)
    }

    pub async fn get_all_nodes(&self) -> Result<Vec<Node>> {
        let nodes = sqlx::query_as::<_, Node>(
            "SELECT * FROM nodes ORDER BY last_heard DESC NULLS LAST",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(nodes)
    }

    /// Nodes heard within the age window, newest first.
    pub async fn get_active_nodes(&self, max_age_hours: u32) -> Result<Vec<Node>> {
        let cutoff = now() - i64::from(max_age_hours) * 3600;
        let nodes = sqlx::query_as::<_, Node>(
            "SELECT * FROM nodes WHERE last_heard IS NOT NULL AND last_heard >= ?1
             ORDER BY last_heard DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(nodes)
    }

    /// Atomically set `welcomed_at` if it is still unset.
    ///
    /// Returns true exactly once per node regardless of how many callers
    /// race; the losers see false and must not send a greeting.
    pub async fn mark_node_welcomed_if_not_already(&self, node_num: u32) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE nodes SET welcomed_at = ?2, updated_at = ?2
             WHERE node_num = ?1 AND welcomed_at IS NULL",
        )
        .bind(node_num)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_favorite(&self, node_num: u32, favorite: bool) -> Result<()> {
        sqlx::query("UPDATE nodes SET is_favorite = ?2, updated_at = ?3 WHERE node_num = ?1")
            .bind(node_num)
            .bind(favorite)
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_ignored(&self, node_num: u32, ignored: bool) -> Result<()> {
        sqlx::query("UPDATE nodes SET is_ignored = ?2, updated_at = ?3 WHERE node_num = ?1")
            .bind(node_num)
            .bind(ignored)
            .bind(now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a node and everything recorded about it, atomically.
    pub async fn delete_node(&self, node_num: u32) -> Result<()> {
        let node_id = meshmonitor_proto::node_id_from_num(node_num);
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE from_node_id = ?1 OR to_node_id = ?1")
            .bind(&node_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM traceroutes WHERE from_node_num = ?1 OR to_node_num = ?1")
            .bind(node_num)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM telemetry WHERE node_num = ?1")
            .bind(node_num)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM raw_packets WHERE from_node_num = ?1")
            .bind(node_num)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM nodes WHERE node_num = ?1")
            .bind(node_num)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // === Channels ===

    pub async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (idx, name, psk, role, uplink_enabled,
                                  downlink_enabled, position_precision, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (idx) DO UPDATE SET
                name = excluded.name,
                psk = excluded.psk,
                role = excluded.role,
                uplink_enabled = excluded.uplink_enabled,
                downlink_enabled = excluded.downlink_enabled,
                position_precision = excluded.position_precision,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(channel.idx)
        .bind(&channel.name)
        .bind(&channel.psk)
        .bind(channel.role)
        .bind(channel.uplink_enabled)
        .bind(channel.downlink_enabled)
        .bind(channel.position_precision)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_channels(&self) -> Result<Vec<Channel>> {
        let channels = sqlx::query_as::<_, Channel>("SELECT * FROM channels ORDER BY idx")
            .fetch_all(&self.pool)
            .await?;
        Ok(channels)
    }

    // === Messages ===

    /// Idempotent upsert keyed by `(from_node_id, id)`.
    ///
    /// A replay of an already-stored message (the radio echoing a local
    /// send, a VNS echo racing the radio) refreshes metadata but never
    /// touches `delivery_state`; that column only moves through
    /// [`Store::set_message_delivery_state`].
    pub async fn upsert_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                id, from_node_num, to_node_num, from_node_id, to_node_id,
                channel, text, timestamp, portnum, reply_id, emoji, hop_start,
                hop_limit, via_mqtt, delivery_state, ack_failed, request_id,
                is_local, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT (from_node_id, id) DO UPDATE SET
                text = excluded.text,
                timestamp = excluded.timestamp,
                hop_start = COALESCE(excluded.hop_start, messages.hop_start),
                hop_limit = COALESCE(excluded.hop_limit, messages.hop_limit),
                via_mqtt = excluded.via_mqtt,
                request_id = COALESCE(excluded.request_id, messages.request_id)
            "#,
        )
        .bind(message.id)
        .bind(message.from_node_num)
        .bind(message.to_node_num)
        .bind(&message.from_node_id)
        .bind(&message.to_node_id)
        .bind(message.channel)
        .bind(&message.text)
        .bind(message.timestamp)
        .bind(message.portnum)
        .bind(message.reply_id)
        .bind(message.emoji)
        .bind(message.hop_start)
        .bind(message.hop_limit)
        .bind(message.via_mqtt)
        .bind(message.delivery_state)
        .bind(message.ack_failed)
        .bind(message.request_id)
        .bind(message.is_local)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance a local message's delivery state.
    ///
    /// The guard makes the transition monotonic: pending may move anywhere,
    /// delivered may move to confirmed or failed, and confirmed/failed are
    /// terminal. Returns whether a row actually changed.
    pub async fn set_message_delivery_state(
        &self,
        message_id: u32,
        state: DeliveryState,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET delivery_state = ?2,
                ack_failed = CASE WHEN ?2 = 'failed' THEN 1 ELSE ack_failed END
            WHERE id = ?1 AND is_local = 1
              AND (
                    delivery_state IS NULL
                    OR delivery_state = 'pending'
                    OR (delivery_state = 'delivered' AND ?2 IN ('confirmed', 'failed'))
              )
            "#,
        )
        .bind(message_id)
        .bind(state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_message(&self, message_id: u32) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(message)
    }

    pub async fn recent_messages(&self, limit: u32) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages ORDER BY timestamp DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    pub async fn get_channel_messages(
        &self,
        channel: i32,
        limit: u32,
        offset: u32,
    ) -> Result<MessagePage> {
        let mut messages = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE channel = ?1
             ORDER BY timestamp DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(channel)
        .bind(limit + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);
        Ok(MessagePage { messages, has_more })
    }

    pub async fn get_direct_messages(
        &self,
        a: &str,
        b: &str,
        limit: u32,
        offset: u32,
    ) -> Result<MessagePage> {
        let mut messages = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE channel = -1
               AND ((from_node_id = ?1 AND to_node_id = ?2)
                 OR (from_node_id = ?2 AND to_node_id = ?1))
             ORDER BY timestamp DESC LIMIT ?3 OFFSET ?4",
        )
        .bind(a)
        .bind(b)
        .bind(limit + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let has_more = messages.len() > limit as usize;
        messages.truncate(limit as usize);
        Ok(MessagePage { messages, has_more })
    }

    pub async fn delete_message(&self, message_id: u32) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_channel_messages(&self, channel: i32) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE channel = ?1")
            .bind(channel)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete the DM conversation with one peer.
    pub async fn delete_direct_messages(&self, peer_node_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM messages WHERE channel = -1
               AND (from_node_id = ?1 OR to_node_id = ?1)",
        )
        .bind(peer_node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete every message a node sent or received, on any channel.
    pub async fn delete_node_messages(&self, node_num: u32) -> Result<u64> {
        let node_id = meshmonitor_proto::node_id_from_num(node_num);
        let result =
            sqlx::query("DELETE FROM messages WHERE from_node_id = ?1 OR to_node_id = ?1")
                .bind(&node_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    // === Traceroutes ===

    #[allow(clippy::too_many_arguments)]
    pub async fn append_traceroute(
        &self,
        from_node_num: u32,
        to_node_num: u32,
        route: Option<&str>,
        route_back: Option<&str>,
        snr_towards: Option<&str>,
        snr_back: Option<&str>,
        timestamp: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO traceroutes (from_node_num, to_node_num, route, route_back,
                                      snr_towards, snr_back, timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(from_node_num)
        .bind(to_node_num)
        .bind(route)
        .bind(route_back)
        .bind(snr_towards)
        .bind(snr_back)
        .bind(timestamp)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn recent_traceroutes(&self, limit: u32) -> Result<Vec<TracerouteRecord>> {
        let records = sqlx::query_as::<_, TracerouteRecord>(
            "SELECT * FROM traceroutes ORDER BY timestamp DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    // === Telemetry ===

    pub async fn append_telemetry(
        &self,
        node_num: u32,
        timestamp: i64,
        kind: TelemetryKind,
        metrics_json: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO telemetry (node_num, timestamp, kind, metrics)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(node_num)
        .bind(timestamp)
        .bind(kind)
        .bind(metrics_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Nodes that have at least one telemetry sample (gauge candidates).
    pub async fn telemetry_node_nums(&self) -> Result<Vec<u32>> {
        let rows = sqlx::query("SELECT DISTINCT node_num FROM telemetry")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<u32, _>(0)).collect())
    }

    pub async fn recent_telemetry(
        &self,
        node_num: u32,
        limit: u32,
    ) -> Result<Vec<TelemetrySample>> {
        let samples = sqlx::query_as::<_, TelemetrySample>(
            "SELECT * FROM telemetry WHERE node_num = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )
        .bind(node_num)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(samples)
    }

    /// Drop old telemetry. Samples from favorite nodes are kept for
    /// `favorite_keep_hours`, everything else for `default_keep_hours`.
    pub async fn prune_telemetry(
        &self,
        favorite_keep_hours: u32,
        default_keep_hours: u32,
    ) -> Result<u64> {
        let ts = now();
        let favorite_cutoff = ts - i64::from(favorite_keep_hours) * 3600;
        let default_cutoff = ts - i64::from(default_keep_hours) * 3600;

        let result = sqlx::query(
            r#"
            DELETE FROM telemetry
            WHERE timestamp < ?1
               OR (timestamp < ?2 AND node_num NOT IN
                    (SELECT node_num FROM nodes WHERE is_favorite = 1))
            "#,
        )
        .bind(favorite_cutoff)
        .bind(default_cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // === Raw packets ===

    pub async fn store_raw_packet(
        &self,
        from_node_num: u32,
        to_node_num: u32,
        portnum: i32,
        payload: &[u8],
        rx_time: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO raw_packets (from_node_num, to_node_num, portnum, payload,
                                      rx_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(from_node_num)
        .bind(to_node_num)
        .bind(portnum)
        .bind(payload)
        .bind(rx_time)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_raw_packets(&self, limit: u32) -> Result<Vec<RawPacket>> {
        let packets = sqlx::query_as::<_, RawPacket>(
            "SELECT * FROM raw_packets ORDER BY rx_time DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(packets)
    }

    /// Keep only the newest `keep` raw packets.
    pub async fn prune_raw_packets(&self, keep: u32) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM raw_packets WHERE id NOT IN
               (SELECT id FROM raw_packets ORDER BY id DESC LIMIT ?1)",
        )
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // === Neighbor graph ===

    /// Replace a node's reported neighbor set.
    pub async fn replace_neighbors(
        &self,
        node_num: u32,
        neighbors: &[(u32, f64)],
    ) -> Result<()> {
        let ts = now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM neighbors WHERE node_num = ?1")
            .bind(node_num)
            .execute(&mut *tx)
            .await?;
        for &(neighbor_num, snr) in neighbors {
            sqlx::query(
                "INSERT INTO neighbors (node_num, neighbor_num, snr, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(node_num)
            .bind(neighbor_num)
            .bind(snr)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_neighbors(&self, node_num: u32) -> Result<Vec<NeighborEdge>> {
        let edges = sqlx::query_as::<_, NeighborEdge>(
            "SELECT * FROM neighbors WHERE node_num = ?1 ORDER BY neighbor_num",
        )
        .bind(node_num)
        .fetch_all(&self.pool)
        .await?;
        Ok(edges)
    }

    // === Settings ===

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    // === Audit log ===

    pub async fn audit_log(
        &self,
        actor: &str,
        action: &str,
        resource: Option<&str>,
        details: Option<&str>,
        ip: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (actor, action, resource, details, ip, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(actor)
        .bind(action)
        .bind(resource)
        .bind(details)
        .bind(ip)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        let entries = sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_log ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    // === Read marks / unread counts ===

    pub async fn mark_conversation_read(&self, conversation: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO read_marks (conversation, last_read_ts) VALUES (?1, ?2)
             ON CONFLICT (conversation) DO UPDATE SET last_read_ts = excluded.last_read_ts",
        )
        .bind(conversation)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Unread message counts keyed `ch:<n>` / `dm:<peer id>`, excluding
    /// messages the local node sent itself.
    pub async fn unread_counts(&self, local_node_id: &str) -> Result<Vec<(String, i64)>> {
        let mut counts = Vec::new();

        let channel_rows = sqlx::query(
            r#"
            SELECT 'ch:' || m.channel AS conversation, COUNT(*) AS unread
            FROM messages m
            LEFT JOIN read_marks r ON r.conversation = 'ch:' || m.channel
            WHERE m.channel >= 0
              AND m.from_node_id != ?1
              AND m.timestamp > COALESCE(r.last_read_ts, 0)
            GROUP BY m.channel
            "#,
        )
        .bind(local_node_id)
        .fetch_all(&self.pool)
        .await?;

        for row in channel_rows {
            counts.push((row.get::<String, _>(0), row.get::<i64, _>(1)));
        }

        let dm_rows = sqlx::query(
            r#"
            SELECT 'dm:' || m.from_node_id AS conversation, COUNT(*) AS unread
            FROM messages m
            LEFT JOIN read_marks r ON r.conversation = 'dm:' || m.from_node_id
            WHERE m.channel = -1
              AND m.to_node_id = ?1
              AND m.timestamp > COALESCE(r.last_read_ts, 0)
            GROUP BY m.from_node_id
            "#,
        )
        .bind(local_node_id)
        .fetch_all(&self.pool)
        .await?;

        for row in dm_rows {
            counts.push((row.get::<String, _>(0), row.get::<i64, _>(1)));
        }

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn test_store() -> (Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        (Arc::new(store), dir)
    }

    fn test_message(id: u32, from: u32, to: u32, channel: i32, text: &str) -> Message {
        Message {
            id,
            from_node_num: from,
            to_node_num: to,
            from_node_id: meshmonitor_proto::node_id_from_num(from),
            to_node_id: meshmonitor_proto::node_id_from_num(to),
            channel,
            text: text.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            portnum: 1,
            reply_id: None,
            emoji: false,
            hop_start: Some(3),
            hop_limit: Some(3),
            via_mqtt: false,
            delivery_state: None,
            ack_failed: false,
            request_id: None,
            is_local: false,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    #[tokio::test]
    async fn test_upsert_node_merges_fields() {
        let (store, _dir) = test_store().await;

        let mut patch = NodePatch::new(0x10);
        patch.long_name = Some("Alpha".to_string());
        patch.snr = Some(7.25);
        store.upsert_node(&patch).await.unwrap();

        // Second writer updates only last_heard; identity must survive.
        let mut patch = NodePatch::new(0x10);
        patch.last_heard = Some(1_700_000_000);
        store.upsert_node(&patch).await.unwrap();

        let node = store.get_node(0x10).await.unwrap().unwrap();
        assert_eq!(node.long_name.as_deref(), Some("Alpha"));
        assert_eq!(node.snr, Some(7.25));
        assert_eq!(node.last_heard, Some(1_700_000_000));
        assert_eq!(node.node_id, "!00000010");
    }

    #[tokio::test]
    async fn test_created_at_preserved_across_upserts() {
        let (store, _dir) = test_store().await;

        store.upsert_node(&NodePatch::new(0x11)).await.unwrap();
        let created = store.get_node(0x11).await.unwrap().unwrap().created_at;

        let mut patch = NodePatch::new(0x11);
        patch.long_name = Some("Renamed".to_string());
        store.upsert_node(&patch).await.unwrap();

        let node = store.get_node(0x11).await.unwrap().unwrap();
        assert_eq!(node.created_at, created);
    }

    #[tokio::test]
    async fn test_welcome_mark_is_atomic() {
        let (store, _dir) = test_store().await;
        store.upsert_node(&NodePatch::new(0x42)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.mark_node_welcomed_if_not_already(0x42).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(store
            .get_node(0x42)
            .await
            .unwrap()
            .unwrap()
            .welcomed_at
            .is_some());
    }

    #[tokio::test]
    async fn test_message_upsert_is_idempotent() {
        let (store, _dir) = test_store().await;

        let mut message = test_message(1000, 0x10, 0xFFFF_FFFF, 0, "hi");
        message.is_local = true;
        message.delivery_state = Some(DeliveryState::Pending);
        store.upsert_message(&message).await.unwrap();
        store
            .set_message_delivery_state(1000, DeliveryState::Delivered)
            .await
            .unwrap();

        // The radio echoing the same packet back must not reset state.
        store.upsert_message(&message).await.unwrap();

        let stored = store.get_message(1000).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Delivered));

        let page = store.get_channel_messages(0, 10, 0).await.unwrap();
        assert_eq!(page.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_state_is_monotonic() {
        let (store, _dir) = test_store().await;

        let mut message = test_message(2000, 0x10, 0x20, -1, "dm");
        message.is_local = true;
        message.delivery_state = Some(DeliveryState::Pending);
        store.upsert_message(&message).await.unwrap();

        assert!(store
            .set_message_delivery_state(2000, DeliveryState::Delivered)
            .await
            .unwrap());
        assert!(store
            .set_message_delivery_state(2000, DeliveryState::Confirmed)
            .await
            .unwrap());

        // Terminal: neither a late failure nor a replayed echo may move it.
        assert!(!store
            .set_message_delivery_state(2000, DeliveryState::Failed)
            .await
            .unwrap());
        assert!(!store
            .set_message_delivery_state(2000, DeliveryState::Delivered)
            .await
            .unwrap());

        let stored = store.get_message(2000).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Confirmed));
    }

    #[tokio::test]
    async fn test_failed_sets_ack_failed() {
        let (store, _dir) = test_store().await;

        let mut message = test_message(2001, 0x10, 0x20, -1, "dm");
        message.is_local = true;
        message.delivery_state = Some(DeliveryState::Pending);
        store.upsert_message(&message).await.unwrap();

        store
            .set_message_delivery_state(2001, DeliveryState::Failed)
            .await
            .unwrap();
        let stored = store.get_message(2001).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, Some(DeliveryState::Failed));
        assert!(stored.ack_failed);
    }

    #[tokio::test]
    async fn test_channel_pagination_has_more() {
        let (store, _dir) = test_store().await;

        for i in 0..15u32 {
            let mut message = test_message(3000 + i, 0x10, 0xFFFF_FFFF, 2, "m");
            message.timestamp = 1_700_000_000 + i64::from(i);
            store.upsert_message(&message).await.unwrap();
        }

        let page = store.get_channel_messages(2, 10, 0).await.unwrap();
        assert_eq!(page.messages.len(), 10);
        assert!(page.has_more);
        // Reverse chronological: newest first.
        assert_eq!(page.messages[0].id, 3014);

        let page = store.get_channel_messages(2, 10, 10).await.unwrap();
        assert_eq!(page.messages.len(), 5);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_direct_messages_both_directions() {
        let (store, _dir) = test_store().await;

        store
            .upsert_message(&test_message(1, 0x10, 0x20, -1, "a to b"))
            .await
            .unwrap();
        store
            .upsert_message(&test_message(2, 0x20, 0x10, -1, "b to a"))
            .await
            .unwrap();
        store
            .upsert_message(&test_message(3, 0x30, 0x10, -1, "other peer"))
            .await
            .unwrap();

        let page = store
            .get_direct_messages("!00000010", "!00000020", 10, 0)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_node_cascades() {
        let (store, _dir) = test_store().await;

        store.upsert_node(&NodePatch::new(0x99)).await.unwrap();
        store
            .upsert_message(&test_message(10, 0x99, 0x10, 0, "bye"))
            .await
            .unwrap();
        store
            .append_traceroute(0x10, 0x99, Some("[153]"), None, None, None, 0)
            .await
            .unwrap();
        store
            .append_telemetry(0x99, 0, TelemetryKind::Device, "{}")
            .await
            .unwrap();

        store.delete_node(0x99).await.unwrap();

        assert!(store.get_node(0x99).await.unwrap().is_none());
        assert!(store.get_message(10).await.unwrap().is_none());
        assert!(store.recent_traceroutes(10).await.unwrap().is_empty());
        assert!(store.telemetry_node_nums().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_telemetry_retention_favors_favorites() {
        let (store, _dir) = test_store().await;

        let mut favorite = NodePatch::new(0x01);
        favorite.is_favorite = Some(true);
        store.upsert_node(&favorite).await.unwrap();
        store.upsert_node(&NodePatch::new(0x02)).await.unwrap();

        let old = chrono::Utc::now().timestamp() - 48 * 3600;
        store
            .append_telemetry(0x01, old, TelemetryKind::Device, "{}")
            .await
            .unwrap();
        store
            .append_telemetry(0x02, old, TelemetryKind::Device, "{}")
            .await
            .unwrap();

        // Favorites keep a week; everyone else keeps 24 hours.
        let pruned = store.prune_telemetry(168, 24).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.telemetry_node_nums().await.unwrap(), vec![0x01]);
    }

    #[tokio::test]
    async fn test_unread_counts_exclude_local_and_read() {
        let (store, _dir) = test_store().await;
        let local = "!00000010";

        // Two from a peer on channel 0, one local, one DM to us.
        store
            .upsert_message(&test_message(1, 0x20, 0xFFFF_FFFF, 0, "one"))
            .await
            .unwrap();
        store
            .upsert_message(&test_message(2, 0x20, 0xFFFF_FFFF, 0, "two"))
            .await
            .unwrap();
        store
            .upsert_message(&test_message(3, 0x10, 0xFFFF_FFFF, 0, "mine"))
            .await
            .unwrap();
        store
            .upsert_message(&test_message(4, 0x20, 0x10, -1, "psst"))
            .await
            .unwrap();

        let counts = store.unread_counts(local).await.unwrap();
        assert!(counts.contains(&("ch:0".to_string(), 2)));
        assert!(counts.contains(&("dm:!00000020".to_string(), 1)));

        store.mark_conversation_read("ch:0").await.unwrap();
        let counts = store.unread_counts(local).await.unwrap();
        assert!(!counts.iter().any(|(k, _)| k == "ch:0"));
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let (store, _dir) = test_store().await;

        assert!(store.get_setting("auto_ack").await.unwrap().is_none());
        store.set_setting("auto_ack", "true").await.unwrap();
        store.set_setting("auto_ack", "false").await.unwrap();
        assert_eq!(
            store.get_setting("auto_ack").await.unwrap().as_deref(),
            Some("false")
        );
    }

    #[tokio::test]
    async fn test_audit_log_appends() {
        let (store, _dir) = test_store().await;

        store
            .audit_log("vn-1", "admin_denied", Some("!00000020"), None, Some("10.0.0.5"))
            .await
            .unwrap();
        store
            .audit_log("vn-1", "client_disconnected", None, None, None)
            .await
            .unwrap();

        let entries = store.recent_audit(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        // Newest first.
        assert_eq!(entries[0].action, "client_disconnected");
    }
}
