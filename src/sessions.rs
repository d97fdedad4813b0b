use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    config::DeviceLimits,
    error::AppError,
    models::{DeviceClass, RequestMetadata, Session, SessionCursor, SessionDraft},
    repository::SessionStoreState,
};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// SessionManager
///
/// Device-scoped session lifecycle on top of a `SessionStore`. Applies the expiry
/// rule on every read used for authentication (`expires_at <= now` is "not found",
/// whether or not cleanup has run) and the per-device-class session caps.
#[derive(Clone)]
pub struct SessionManager {
    store: SessionStoreState,
    limits: DeviceLimits,
}

/// One page of a user's sessions plus the cursor for the next page.
#[derive(Debug, Clone)]
pub struct SessionListing {
    pub sessions: Vec<Session>,
    pub next_cursor: Option<SessionCursor>,
}

impl SessionManager {
    pub fn new(store: SessionStoreState, limits: DeviceLimits) -> Self {
        Self { store, limits }
    }

    /// upsert
    ///
    /// Create the session of (user, device), or overwrite its refresh token, class,
    /// activity, expiry and metadata in place. Afterwards, enforce the device-class
    /// cap by revoking the least recently active other sessions of that class.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        user_id: Uuid,
        device_id: &str,
        device_class: DeviceClass,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
        metadata: RequestMetadata,
        now: DateTime<Utc>,
    ) -> Result<Session, AppError> {
        let session = self
            .store
            .upsert_session(SessionDraft {
                user_id,
                device_id: device_id.to_string(),
                device_class,
                refresh_token: refresh_token.to_string(),
                expires_at,
                metadata,
                now,
            })
            .await?;

        self.enforce_limit(&session, now).await?;
        Ok(session)
    }

    async fn enforce_limit(&self, current: &Session, now: DateTime<Utc>) -> Result<(), AppError> {
        let Some(limit) = self.limits.limit_for(current.device_class) else {
            return Ok(());
        };

        let others: Vec<Session> = self
            .store
            .list_class_sessions(current.user_id, current.device_class, now)
            .await?
            .into_iter()
            .filter(|s| s.id != current.id)
            .collect();

        // The current session takes one slot; the newest others keep the rest.
        let keep = (limit as usize).saturating_sub(1);
        for evicted in others.iter().skip(keep) {
            tracing::info!(
                user_id = %current.user_id,
                session_id = %evicted.id,
                device_class = %current.device_class,
                limit,
                "evicting session over device class limit"
            );
            self.store.delete_session(evicted.user_id, evicted.id).await?;
        }
        Ok(())
    }

    /// find_by_refresh_token
    ///
    /// The live session of `user_id` whose *currently stored* token is
    /// `refresh_token`. A superseded token finds nothing.
    pub async fn find_by_refresh_token(
        &self,
        user_id: Uuid,
        refresh_token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, AppError> {
        let session = self.store.find_session_by_token(user_id, refresh_token).await?;
        Ok(session.filter(|s| s.is_live(now)))
    }

    /// touch
    ///
    /// Record activity without changing the stored token. Returns false if the
    /// session's token was superseded concurrently.
    pub async fn touch(&self, session: &Session, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.store
            .replace_session_token(session.id, &session.refresh_token, &session.refresh_token, now)
            .await
    }

    /// rotate
    ///
    /// Replace the stored refresh token (and record activity) only if it is still
    /// the one presented. Exactly one of two concurrent refreshes with the same
    /// token wins.
    pub async fn rotate(&self, session: &Session, new_token: &str, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.store
            .replace_session_token(session.id, &session.refresh_token, new_token, now)
            .await
    }

    /// Explicit logout of one device by session id, scoped to its owner.
    pub async fn revoke(&self, user_id: Uuid, session_id: Uuid) -> Result<bool, AppError> {
        self.store.delete_session(user_id, session_id).await
    }

    /// Explicit logout of the device holding `refresh_token`.
    pub async fn revoke_by_refresh_token(&self, refresh_token: &str) -> Result<bool, AppError> {
        self.store.delete_session_by_token(refresh_token).await
    }

    /// Logout everywhere.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64, AppError> {
        self.store.delete_user_sessions(user_id).await
    }

    /// list_by_user
    ///
    /// Live sessions, most recent activity first. `page_size` is clamped to
    /// `1..=MAX_PAGE_SIZE`. A next cursor is returned only when more rows exist.
    pub async fn list_by_user(
        &self,
        user_id: Uuid,
        page_size: Option<u32>,
        cursor: Option<SessionCursor>,
        now: DateTime<Utc>,
    ) -> Result<SessionListing, AppError> {
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        // One extra row tells us whether another page exists.
        let mut sessions = self.store.list_sessions(user_id, now, page_size + 1, cursor).await?;
        let next_cursor = if sessions.len() > page_size as usize {
            sessions.truncate(page_size as usize);
            sessions.last().map(SessionCursor::after)
        } else {
            None
        };

        Ok(SessionListing { sessions, next_cursor })
    }

    /// Physically remove rows that are already logically absent.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        self.store.delete_expired_sessions(now).await
    }
}
