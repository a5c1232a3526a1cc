//! Server and server-pool queries for the vpnfleet engine.

use serde::Deserialize;
use sqlx::{QueryBuilder, Sqlite};
use vpnfleet_core::db::{DatabaseError, unix_timestamp};

use super::db::FleetDatabase;
use super::models::{Server, ServerPool, ServerStatus};

/// Parameters for creating a server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServer {
    pub name: String,
    pub api_url: String,
    #[serde(default)]
    pub web_base_path: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default = "default_inbound_id")]
    pub inbound_id: i64,
    #[serde(default)]
    pub public_host: String,
    #[serde(default = "default_public_port")]
    pub public_port: i64,
    #[serde(default = "default_security")]
    pub security: String,
    #[serde(default)]
    pub pbk: Option<String>,
    #[serde(default = "default_fp")]
    pub fp: Option<String>,
    #[serde(default)]
    pub sni: Option<String>,
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default = "default_spx")]
    pub spx: Option<String>,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(default = "default_users_limit")]
    pub users_limit: i64,
    #[serde(default)]
    pub status: ServerStatus,
    #[serde(default, alias = "serverPoolId")]
    pub pool_id: Option<i64>,
}

const fn default_inbound_id() -> i64 {
    1
}

const fn default_public_port() -> i64 {
    443
}

fn default_security() -> String {
    "reality".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_fp() -> Option<String> {
    Some("chrome".to_string())
}

#[allow(clippy::unnecessary_wraps)]
fn default_spx() -> Option<String> {
    Some("/".to_string())
}

const fn default_users_limit() -> i64 {
    100
}

/// Partial update of a server; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub api_url: Option<String>,
    pub web_base_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub inbound_id: Option<i64>,
    pub public_host: Option<String>,
    pub public_port: Option<i64>,
    pub security: Option<String>,
    pub pbk: Option<String>,
    pub fp: Option<String>,
    pub sni: Option<String>,
    pub sid: Option<String>,
    pub spx: Option<String>,
    pub flow: Option<String>,
    pub users_limit: Option<i64>,
    pub status: Option<ServerStatus>,
    #[serde(alias = "serverPoolId")]
    pub pool_id: Option<i64>,
}

impl ServerUpdate {
    fn apply(self, server: &mut Server) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *slot = v;
            }
        }
        fn set_opt<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        set(&mut server.name, self.name);
        set(&mut server.api_url, self.api_url);
        set_opt(&mut server.web_base_path, self.web_base_path);
        set(&mut server.username, self.username);
        set(&mut server.password, self.password);
        set(&mut server.inbound_id, self.inbound_id);
        set(&mut server.public_host, self.public_host);
        set(&mut server.public_port, self.public_port);
        set(&mut server.security, self.security);
        set_opt(&mut server.pbk, self.pbk);
        set_opt(&mut server.fp, self.fp);
        set_opt(&mut server.sni, self.sni);
        set_opt(&mut server.sid, self.sid);
        set_opt(&mut server.spx, self.spx);
        set_opt(&mut server.flow, self.flow);
        set(&mut server.users_limit, self.users_limit);
        set(&mut server.status, self.status);
        set_opt(&mut server.pool_id, self.pool_id);
    }
}

/// Parameters for creating a server pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServerPool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

const fn default_true() -> bool {
    true
}

/// Partial update of a server pool.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerPoolUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

impl FleetDatabase {
    // =========================================================================
    // Server queries
    // =========================================================================

    /// Register a server.
    pub async fn create_server(&self, params: &NewServer) -> Result<Server, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO servers (name, api_url, web_base_path, username, password, inbound_id, public_host, public_port, security, pbk, fp, sni, sid, spx, flow, users_limit, status, pool_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&params.name)
        .bind(&params.api_url)
        .bind(&params.web_base_path)
        .bind(&params.username)
        .bind(&params.password)
        .bind(params.inbound_id)
        .bind(&params.public_host)
        .bind(params.public_port)
        .bind(&params.security)
        .bind(&params.pbk)
        .bind(&params.fp)
        .bind(&params.sni)
        .bind(&params.sid)
        .bind(&params.spx)
        .bind(&params.flow)
        .bind(params.users_limit)
        .bind(params.status)
        .bind(params.pool_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_server(result.last_insert_rowid()).await
    }

    /// Get a server by ID.
    pub async fn get_server(&self, id: i64) -> Result<Server, DatabaseError> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Server {id}")))
    }

    /// List all servers, optionally restricted to one pool.
    pub async fn list_servers(&self, pool_id: Option<i64>) -> Result<Vec<Server>, DatabaseError> {
        let servers = if let Some(pool_id) = pool_id {
            sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE pool_id = ? ORDER BY id")
                .bind(pool_id)
                .fetch_all(self.pool())
                .await?
        } else {
            sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY id")
                .fetch_all(self.pool())
                .await?
        };

        Ok(servers)
    }

    /// Fetch the given servers, ordered by ID. Unknown IDs are skipped.
    pub async fn get_servers(&self, ids: &[i64]) -> Result<Vec<Server>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("SELECT * FROM servers WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(") ORDER BY id");

        Ok(qb.build_query_as::<Server>().fetch_all(self.pool()).await?)
    }

    /// Servers eligible for fan-out: `active` servers whose pool is absent or
    /// active. With `pool_id`, only servers of that (active) pool.
    pub async fn fanout_targets(&self, pool_id: Option<i64>) -> Result<Vec<Server>, DatabaseError> {
        let servers = if let Some(pool_id) = pool_id {
            sqlx::query_as::<_, Server>(
                "SELECT s.* FROM servers s JOIN server_pools p ON p.id = s.pool_id \
                 WHERE s.status = 'active' AND p.is_active = 1 AND p.id = ? ORDER BY s.id",
            )
            .bind(pool_id)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, Server>(
                "SELECT s.* FROM servers s LEFT JOIN server_pools p ON p.id = s.pool_id \
                 WHERE s.status = 'active' AND (s.pool_id IS NULL OR p.is_active = 1) ORDER BY s.id",
            )
            .fetch_all(self.pool())
            .await?
        };

        Ok(servers)
    }

    /// Apply a partial update to a server.
    pub async fn update_server(
        &self,
        id: i64,
        update: ServerUpdate,
    ) -> Result<Server, DatabaseError> {
        let mut server = self.get_server(id).await?;
        update.apply(&mut server);

        sqlx::query(
            "UPDATE servers SET name = ?, api_url = ?, web_base_path = ?, username = ?, password = ?, inbound_id = ?, \
             public_host = ?, public_port = ?, security = ?, pbk = ?, fp = ?, sni = ?, sid = ?, spx = ?, flow = ?, \
             users_limit = ?, status = ?, pool_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&server.name)
        .bind(&server.api_url)
        .bind(&server.web_base_path)
        .bind(&server.username)
        .bind(&server.password)
        .bind(server.inbound_id)
        .bind(&server.public_host)
        .bind(server.public_port)
        .bind(&server.security)
        .bind(&server.pbk)
        .bind(&server.fp)
        .bind(&server.sni)
        .bind(&server.sid)
        .bind(&server.spx)
        .bind(&server.flow)
        .bind(server.users_limit)
        .bind(server.status)
        .bind(server.pool_id)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        self.get_server(id).await
    }

    /// Remove a server. Its assignments cascade.
    pub async fn delete_server(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM servers WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Server pool queries
    // =========================================================================

    /// Create a server pool.
    pub async fn create_pool(&self, params: &NewServerPool) -> Result<ServerPool, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO server_pools (name, description, is_active, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&params.name)
        .bind(&params.description)
        .bind(params.is_active)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_pool(result.last_insert_rowid()).await
    }

    /// Get a pool by ID.
    pub async fn get_pool(&self, id: i64) -> Result<ServerPool, DatabaseError> {
        sqlx::query_as::<_, ServerPool>("SELECT * FROM server_pools WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Server pool {id}")))
    }

    /// List all pools.
    pub async fn list_pools(&self) -> Result<Vec<ServerPool>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, ServerPool>("SELECT * FROM server_pools ORDER BY id")
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// Apply a partial update to a pool.
    pub async fn update_pool(
        &self,
        id: i64,
        update: ServerPoolUpdate,
    ) -> Result<ServerPool, DatabaseError> {
        let mut pool = self.get_pool(id).await?;
        if let Some(name) = update.name {
            pool.name = name;
        }
        if update.description.is_some() {
            pool.description = update.description;
        }
        if let Some(active) = update.is_active {
            pool.is_active = active;
        }

        sqlx::query(
            "UPDATE server_pools SET name = ?, description = ?, is_active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&pool.name)
        .bind(&pool.description)
        .bind(pool.is_active)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        self.get_pool(id).await
    }

    /// Remove a pool. Member servers are detached, not deleted.
    pub async fn delete_pool(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM server_pools WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
