//! Subscription and assignment queries for the vpnfleet engine.

use sqlx::{QueryBuilder, Sqlite};
use vpnfleet_core::db::{DatabaseError, unix_timestamp};

use super::db::FleetDatabase;
use super::models::{
    Subscription, SubscriptionSource, SubscriptionStats, SubscriptionStatus,
};

/// Parameters for inserting a subscription.
pub struct NewSubscription<'a> {
    pub id: &'a str,
    pub client_id: &'a str,
    pub owner_ref: Option<&'a str>,
    pub source: SubscriptionSource,
    pub note: Option<&'a str>,
    pub start_date: i64,
    pub end_date: i64,
    pub period_days: i64,
    pub device_limit: i64,
    pub traffic_limit: Option<i64>,
}

/// Filters for listing subscriptions. All fields are optional and combine
/// with AND.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// Substring matched against client id, owner reference and note.
    pub search: Option<String>,
    pub source: Option<SubscriptionSource>,
    pub status: Option<SubscriptionStatus>,
    pub owner_ref: Option<String>,
}

impl FleetDatabase {
    // =========================================================================
    // Subscription queries
    // =========================================================================

    /// Insert a new subscription in `active` state.
    pub async fn create_subscription(
        &self,
        params: &NewSubscription<'_>,
    ) -> Result<Subscription, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO subscriptions (id, client_id, owner_ref, status, source, note, start_date, end_date, period_days, device_limit, traffic_limit, created_at, updated_at) VALUES (?, ?, ?, 'active', ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.id)
        .bind(params.client_id)
        .bind(params.owner_ref)
        .bind(params.source)
        .bind(params.note)
        .bind(params.start_date)
        .bind(params.end_date)
        .bind(params.period_days)
        .bind(params.device_limit)
        .bind(params.traffic_limit)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_subscription(params.id).await
    }

    /// Get a subscription by ID.
    pub async fn get_subscription(&self, id: &str) -> Result<Subscription, DatabaseError> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Subscription {id}")))
    }

    /// Look up subscriptions by their credential keys.
    pub async fn get_subscriptions_by_client_ids(
        &self,
        client_ids: &[String],
    ) -> Result<Vec<Subscription>, DatabaseError> {
        if client_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM subscriptions WHERE client_id IN (");
        let mut sep = qb.separated(", ");
        for id in client_ids {
            sep.push_bind(id);
        }
        sep.push_unseparated(")");

        Ok(qb
            .build_query_as::<Subscription>()
            .fetch_all(self.pool())
            .await?)
    }

    /// List subscriptions matching a filter, newest first.
    pub async fn list_subscriptions(
        &self,
        filter: &SubscriptionFilter,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM subscriptions WHERE 1 = 1");

        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            let pattern = format!("%{search}%");
            qb.push(" AND (client_id LIKE ")
                .push_bind(pattern.clone())
                .push(" OR owner_ref LIKE ")
                .push_bind(pattern.clone())
                .push(" OR note LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(source) = filter.source {
            qb.push(" AND source = ").push_bind(source);
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status);
        }
        if let Some(owner) = &filter.owner_ref {
            qb.push(" AND owner_ref = ").push_bind(owner.clone());
        }
        qb.push(" ORDER BY created_at DESC, id");

        Ok(qb
            .build_query_as::<Subscription>()
            .fetch_all(self.pool())
            .await?)
    }

    /// All subscriptions currently in `active` state.
    pub async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, DatabaseError> {
        Ok(sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE status = 'active' ORDER BY end_date",
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Transition `active` -> `expired`. Returns `false` if the subscription
    /// was no longer active (someone else got there first).
    pub async fn expire_subscription(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = 'expired', updated_at = ? WHERE id = ? AND status = 'active'",
        )
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Overwrite the end date and period of a subscription.
    pub async fn update_subscription_term(
        &self,
        id: &str,
        end_date: i64,
        period_days: i64,
        status: SubscriptionStatus,
    ) -> Result<Subscription, DatabaseError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET end_date = ?, period_days = ?, status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(end_date)
        .bind(period_days)
        .bind(status)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Subscription {id}")));
        }
        self.get_subscription(id).await
    }

    /// Remove a subscription. Assignments cascade.
    pub async fn delete_subscription(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Total / active / expired counters.
    pub async fn subscription_stats(&self) -> Result<SubscriptionStats, DatabaseError> {
        let row: (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END), 0), \
             COALESCE(SUM(CASE WHEN status = 'expired' THEN 1 ELSE 0 END), 0) \
             FROM subscriptions",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(SubscriptionStats {
            total: row.0,
            active: row.1,
            expired: row.2,
        })
    }

    // =========================================================================
    // Assignment queries
    // =========================================================================

    /// Record the servers a subscription is intended for. Existing rows are
    /// left untouched.
    pub async fn assign_servers(
        &self,
        subscription_id: &str,
        server_ids: &[i64],
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;
        for server_id in server_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO subscription_servers (subscription_id, server_id, provisioned, updated_at) VALUES (?, ?, 0, ?)",
            )
            .bind(subscription_id)
            .bind(server_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Assign every active subscription to a server. Returns rows added.
    pub async fn assign_active_subscriptions_to_server(
        &self,
        server_id: i64,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO subscription_servers (subscription_id, server_id, provisioned, updated_at) \
             SELECT id, ?, 0, ? FROM subscriptions WHERE status = 'active'",
        )
        .bind(server_id)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Mark an assignment as present (or absent) on the remote panel.
    pub async fn set_provisioned(
        &self,
        subscription_id: &str,
        server_id: i64,
        provisioned: bool,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO subscription_servers (subscription_id, server_id, provisioned, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (subscription_id, server_id) DO UPDATE SET provisioned = excluded.provisioned, updated_at = excluded.updated_at",
        )
        .bind(subscription_id)
        .bind(server_id)
        .bind(provisioned)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Mark an assignment provisioned, but only while the subscription is
    /// still `active`. Returns `false` when it expired or was deleted, in
    /// which case nothing is written.
    pub async fn mark_provisioned_if_active(
        &self,
        subscription_id: &str,
        server_id: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO subscription_servers (subscription_id, server_id, provisioned, updated_at) \
             SELECT id, ?, 1, ? FROM subscriptions WHERE id = ? AND status = 'active' \
             ON CONFLICT (subscription_id, server_id) DO UPDATE SET provisioned = 1, updated_at = excluded.updated_at",
        )
        .bind(server_id)
        .bind(unix_timestamp())
        .bind(subscription_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop an assignment after the client was revoked from the server.
    pub async fn remove_assignment(
        &self,
        subscription_id: &str,
        server_id: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM subscription_servers WHERE subscription_id = ? AND server_id = ?",
        )
        .bind(subscription_id)
        .bind(server_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// IDs of servers the subscription is believed to be provisioned on.
    pub async fn provisioned_server_ids(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT server_id FROM subscription_servers WHERE subscription_id = ? AND provisioned = 1 ORDER BY server_id",
        )
        .bind(subscription_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Expired subscriptions still believed present on at least one server,
    /// i.e. whose earlier revoke did not go through.
    pub async fn expired_with_provisioned(&self) -> Result<Vec<Subscription>, DatabaseError> {
        Ok(sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE status = 'expired' AND id IN \
             (SELECT subscription_id FROM subscription_servers WHERE provisioned = 1) \
             ORDER BY end_date, id",
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Active subscriptions intended for a server, whether or not they were
    /// provisioned successfully.
    pub async fn roster_for_server(
        &self,
        server_id: i64,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        Ok(sqlx::query_as::<_, Subscription>(
            "SELECT s.* FROM subscriptions s \
             JOIN subscription_servers a ON a.subscription_id = s.id \
             WHERE a.server_id = ? AND s.status = 'active' \
             ORDER BY s.created_at, s.id",
        )
        .bind(server_id)
        .fetch_all(self.pool())
        .await?)
    }
}
