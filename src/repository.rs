use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        DeviceClass, NewRoute, NewUser, Role, RouteEntry, RouteOrder, Session, SessionCursor, SessionDraft, User,
        UserRecord,
    },
};

// --- Collaborator Contracts ---

/// UserDirectory
///
/// Read access to accounts and their resolved roles, plus the one mutation the
/// authorization core owns: flipping the active flag.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// The user with its role references resolved, or `None` if no such user exists.
    /// Inactive and soft-deleted users are still returned; callers decide.
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, AppError>;

    /// Lookup by lower-cased email or username. Soft-deleted users are not returned.
    async fn find_user_by_login(&self, identifier: &str) -> Result<Option<UserRecord>, AppError>;

    /// Returns false if the user does not exist.
    async fn set_user_active(&self, id: Uuid, active: bool) -> Result<bool, AppError>;

    /// create_user
    ///
    /// Inserts an active account holding the default role. Fails with `Conflict`
    /// when the email or username is taken and with `Internal` when no active
    /// default role is configured.
    async fn create_user(&self, user: NewUser) -> Result<UserRecord, AppError>;
}

/// RouteCatalog
///
/// The persisted route forest. Read at cache load; written by catalog administration.
#[async_trait]
pub trait RouteCatalog: Send + Sync {
    /// Every catalog entry, ordered by sort key then path.
    async fn list_routes(&self) -> Result<Vec<RouteEntry>, AppError>;

    async fn count_routes(&self) -> Result<u64, AppError>;

    /// Fails with `Conflict` on a duplicate path and `Validation` on an unknown parent.
    async fn create_route(&self, route: NewRoute) -> Result<RouteEntry, AppError>;

    /// Replaces every field of `id`. `Ok(None)` if absent, `Conflict` on a path
    /// clash, `Validation` on an unknown parent or a parent cycle.
    async fn update_route(&self, id: Uuid, route: NewRoute) -> Result<Option<RouteEntry>, AppError>;

    /// Fails with `Conflict` if the route still has children. `Ok(false)` if absent.
    async fn delete_route(&self, id: Uuid) -> Result<bool, AppError>;

    /// Applies all parent/sort changes together or none of them. Rejects a
    /// result that is not a forest.
    async fn reorder_routes(&self, changes: &[RouteOrder]) -> Result<(), AppError>;
}

/// SessionStore
///
/// Persistence of device sessions. Uniqueness of (user, device) is the store's
/// responsibility: `upsert_session` must converge concurrent writers on a single
/// row, last writer wins. Reads return rows as stored; the expiry rule is applied
/// by `SessionManager`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert_session(&self, draft: SessionDraft) -> Result<Session, AppError>;

    async fn find_session_by_token(&self, user_id: Uuid, refresh_token: &str) -> Result<Option<Session>, AppError>;

    /// Compare-and-swap of the stored refresh token. Returns false when the stored
    /// token is no longer `expected_token`.
    async fn replace_session_token(
        &self,
        id: Uuid,
        expected_token: &str,
        new_token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    async fn delete_session(&self, user_id: Uuid, id: Uuid) -> Result<bool, AppError>;

    async fn delete_session_by_token(&self, refresh_token: &str) -> Result<bool, AppError>;

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, AppError>;

    /// Live sessions (expiry after `now`) of one user, newest activity first,
    /// strictly after `cursor`, at most `limit`.
    async fn list_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
        cursor: Option<SessionCursor>,
    ) -> Result<Vec<Session>, AppError>;

    /// Live sessions of one user and device class, newest activity first.
    async fn list_class_sessions(
        &self,
        user_id: Uuid,
        class: DeviceClass,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AppError>;

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

pub type UserDirectoryState = Arc<dyn UserDirectory>;
pub type RouteCatalogState = Arc<dyn RouteCatalog>;
pub type SessionStoreState = Arc<dyn SessionStore>;

// --- Postgres Implementation ---

/// PostgresRepository
///
/// The concrete implementation of all three collaborator traits, backed by the
/// tables in `migrations/`.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn roles_for(&self, role_ids: &[Uuid]) -> Result<Vec<Role>, AppError> {
        if role_ids.is_empty() {
            return Ok(vec![]);
        }
        let roles = sqlx::query_as::<_, Role>(
            r#"
            SELECT id, name, description, permissions, is_default, is_active, is_deleted, deleted_at
            FROM roles
            WHERE id = ANY($1)
            "#,
        )
        .bind(role_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(roles)
    }

    /// Rejects the transaction's catalog if any of `ids` reaches itself by
    /// following parent links. Must run after the writes, before commit.
    async fn assert_forest(tx: &mut Transaction<'_, Postgres>, ids: &[Uuid]) -> Result<(), AppError> {
        let cyclic: Option<Uuid> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE walk (origin, parent_id, depth) AS (
                SELECT id, parent_id, 1 FROM system_routes WHERE id = ANY($1)
                UNION ALL
                SELECT w.origin, r.parent_id, w.depth + 1
                FROM walk w
                JOIN system_routes r ON r.id = w.parent_id
                WHERE w.parent_id <> w.origin
                  AND w.depth <= (SELECT COUNT(*) FROM system_routes)
            )
            SELECT origin FROM walk WHERE parent_id = origin LIMIT 1
            "#,
        )
        .bind(ids)
        .fetch_optional(&mut **tx)
        .await?;

        match cyclic {
            Some(id) => Err(AppError::Validation(format!("moving route {id} would create a cycle"))),
            None => Ok(()),
        }
    }

    async fn with_roles(&self, user: Option<User>) -> Result<Option<UserRecord>, AppError> {
        match user {
            Some(user) => {
                let roles = self.roles_for(&user.role_ids).await?;
                Ok(Some(UserRecord { user, roles }))
            }
            None => Ok(None),
        }
    }
}

const USER_COLUMNS: &str = r#"
    u.id, u.email, u.username, u.name, u.password_hash, u.is_active, u.is_deleted,
    ARRAY(SELECT ur.role_id FROM user_roles ur WHERE ur.user_id = u.id) AS role_ids
"#;

const SESSION_COLUMNS: &str = r#"
    id, user_id, device_id, device_class, refresh_token, user_agent, ip,
    last_active_at, expires_at, created_at, updated_at
"#;

const ROUTE_COLUMNS: &str = "id, path, name, icon, sort, is_visible, permissions, parent_id";

/// SessionRow
///
/// Raw row of the `user_sessions` table; `device_class` is stored as text.
#[derive(FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    device_id: String,
    device_class: String,
    refresh_token: String,
    user_agent: Option<String>,
    ip: Option<String>,
    last_active_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let device_class = row.device_class.parse::<DeviceClass>().map_err(AppError::Internal)?;
        Ok(Session {
            id: row.id,
            user_id: row.user_id,
            device_id: row.device_id,
            device_class,
            refresh_token: row.refresh_token,
            user_agent: row.user_agent,
            ip: row.ip,
            last_active_at: row.last_active_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_sessions(rows: Vec<SessionRow>) -> Result<Vec<Session>, AppError> {
    rows.into_iter().map(Session::try_from).collect()
}

#[async_trait]
impl UserDirectory for PostgresRepository {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, AppError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = $1");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        self.with_roles(user).await
    }

    async fn find_user_by_login(&self, identifier: &str) -> Result<Option<UserRecord>, AppError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users u WHERE (u.email = $1 OR u.username = $1) AND u.is_deleted = false"
        );
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(identifier.trim().to_lowercase())
            .fetch_optional(&self.pool)
            .await?;
        self.with_roles(user).await
    }

    async fn set_user_active(&self, id: Uuid, active: bool) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE users SET is_active = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_user(&self, user: NewUser) -> Result<UserRecord, AppError> {
        let mut tx = self.pool.begin().await?;

        let default_role: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM roles WHERE is_default AND is_active AND NOT is_deleted LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(role_id) = default_role else {
            return Err(AppError::Internal("no default role configured".to_string()));
        };

        let taken: Option<String> = sqlx::query_scalar(
            "SELECT CASE WHEN email = $1 THEN 'email' ELSE 'username' END FROM users WHERE email = $1 OR username = $2 LIMIT 1",
        )
        .bind(&user.email)
        .bind(&user.username)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(field) = taken {
            return Err(AppError::Conflict(format!("{field} already in use")));
        }

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, email, username, name, password_hash)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(&user.name)
        .bind(&user.password_hash)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            // Lost a race with a concurrent registration.
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(AppError::Conflict("email or username already in use".to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        sqlx::query("INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2)")
            .bind(id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.find_user_by_id(id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("user {id} missing after insert")))
    }
}

#[async_trait]
impl RouteCatalog for PostgresRepository {
    async fn list_routes(&self) -> Result<Vec<RouteEntry>, AppError> {
        let sql = format!("SELECT {ROUTE_COLUMNS} FROM system_routes ORDER BY sort ASC, path ASC");
        let routes = sqlx::query_as::<_, RouteEntry>(&sql).fetch_all(&self.pool).await?;
        Ok(routes)
    }

    async fn count_routes(&self) -> Result<u64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM system_routes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn create_route(&self, route: NewRoute) -> Result<RouteEntry, AppError> {
        if let Some(parent) = route.parent_id {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM system_routes WHERE id = $1)")
                .bind(parent)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                return Err(AppError::Validation(format!("parent route {parent} does not exist")));
            }
        }

        let sql = format!(
            r#"
            INSERT INTO system_routes (id, path, name, icon, sort, is_visible, permissions, parent_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (path) DO NOTHING
            RETURNING {ROUTE_COLUMNS}
            "#
        );
        sqlx::query_as::<_, RouteEntry>(&sql)
            .bind(Uuid::new_v4())
            .bind(route.path.trim())
            .bind(route.name.trim())
            .bind(route.icon)
            .bind(route.sort)
            .bind(route.is_visible)
            .bind(route.permissions)
            .bind(route.parent_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::Conflict(format!("route path '{}' already exists", route.path.trim())))
    }

    async fn update_route(&self, id: Uuid, route: NewRoute) -> Result<Option<RouteEntry>, AppError> {
        let mut tx = self.pool.begin().await?;
        // Concurrent catalog writers (other instances included) queue here.
        sqlx::query("LOCK TABLE system_routes IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        if let Some(parent) = route.parent_id {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM system_routes WHERE id = $1)")
                .bind(parent)
                .fetch_one(&mut *tx)
                .await?;
            if !exists {
                return Err(AppError::Validation(format!("parent route {parent} does not exist")));
            }
        }

        let sql = format!(
            r#"
            UPDATE system_routes
            SET path = $2, name = $3, icon = $4, sort = $5, is_visible = $6, permissions = $7,
                parent_id = $8, updated_at = NOW()
            WHERE id = $1
            RETURNING {ROUTE_COLUMNS}
            "#
        );
        let path = route.path.trim().to_string();
        let updated = sqlx::query_as::<_, RouteEntry>(&sql)
            .bind(id)
            .bind(&path)
            .bind(route.name.trim())
            .bind(route.icon)
            .bind(route.sort)
            .bind(route.is_visible)
            .bind(route.permissions)
            .bind(route.parent_id)
            .fetch_optional(&mut *tx)
            .await;
        let updated = match updated {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(AppError::Conflict(format!("route path '{path}' already exists")));
            }
            Err(e) => return Err(e.into()),
        };

        Self::assert_forest(&mut tx, &[id]).await?;
        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn delete_route(&self, id: Uuid) -> Result<bool, AppError> {
        let has_children: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM system_routes WHERE parent_id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if has_children {
            return Err(AppError::Conflict("route still has child routes".to_string()));
        }

        let result = sqlx::query("DELETE FROM system_routes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reorder_routes(&self, changes: &[RouteOrder]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("LOCK TABLE system_routes IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        for change in changes {
            let result = sqlx::query(
                "UPDATE system_routes SET parent_id = $2, sort = $3, updated_at = NOW() WHERE id = $1",
            )
            .bind(change.id)
            .bind(change.parent_id)
            .bind(change.sort)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                // Dropping the transaction rolls back the changes applied so far.
                return Err(AppError::Validation(format!("route {} does not exist", change.id)));
            }
        }
        let ids: Vec<Uuid> = changes.iter().map(|c| c.id).collect();
        Self::assert_forest(&mut tx, &ids).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PostgresRepository {
    /// upsert_session
    ///
    /// `ON CONFLICT (user_id, device_id)` against the unique index makes concurrent
    /// logins from one device converge on one row without application locking.
    async fn upsert_session(&self, draft: SessionDraft) -> Result<Session, AppError> {
        let sql = format!(
            r#"
            INSERT INTO user_sessions
                (id, user_id, device_id, device_class, refresh_token, user_agent, ip,
                 last_active_at, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $8, $8)
            ON CONFLICT (user_id, device_id) DO UPDATE SET
                device_class = EXCLUDED.device_class,
                refresh_token = EXCLUDED.refresh_token,
                user_agent = EXCLUDED.user_agent,
                ip = EXCLUDED.ip,
                last_active_at = EXCLUDED.last_active_at,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at
            RETURNING {SESSION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(draft.user_id)
            .bind(&draft.device_id)
            .bind(draft.device_class.as_str())
            .bind(&draft.refresh_token)
            .bind(draft.metadata.user_agent)
            .bind(draft.metadata.ip)
            .bind(draft.now)
            .bind(draft.expires_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn find_session_by_token(&self, user_id: Uuid, refresh_token: &str) -> Result<Option<Session>, AppError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM user_sessions WHERE user_id = $1 AND refresh_token = $2");
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(user_id)
            .bind(refresh_token)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Session::try_from).transpose()
    }

    async fn replace_session_token(
        &self,
        id: Uuid,
        expected_token: &str,
        new_token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE user_sessions
            SET refresh_token = $3, last_active_at = $4, updated_at = $4
            WHERE id = $1 AND refresh_token = $2
            "#,
        )
        .bind(id)
        .bind(expected_token)
        .bind(new_token)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_session(&self, user_id: Uuid, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_session_by_token(&self, refresh_token: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE refresh_token = $1")
            .bind(refresh_token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
        cursor: Option<SessionCursor>,
    ) -> Result<Vec<Session>, AppError> {
        let sql = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM user_sessions
            WHERE user_id = $1
              AND expires_at > $2
              AND ($3::timestamptz IS NULL OR (last_active_at, id) < ($3, $4))
            ORDER BY last_active_at DESC, id DESC
            LIMIT $5
            "#
        );
        let rows = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(user_id)
            .bind(now)
            .bind(cursor.map(|c| c.last_active_at))
            .bind(cursor.map(|c| c.id))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        into_sessions(rows)
    }

    async fn list_class_sessions(
        &self,
        user_id: Uuid,
        class: DeviceClass,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AppError> {
        let sql = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM user_sessions
            WHERE user_id = $1 AND device_class = $2 AND expires_at > $3
            ORDER BY last_active_at DESC, id DESC
            "#
        );
        let rows = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(user_id)
            .bind(class.as_str())
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        into_sessions(rows)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM user_sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
