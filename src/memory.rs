use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        DeviceClass, NewRoute, NewUser, Role, RouteEntry, RouteOrder, Session, SessionCursor, SessionDraft,
        User, UserRecord,
    },
    repository::{RouteCatalog, SessionStore, UserDirectory},
    route_cache::validate_reorder,
};

/// MemoryStore
///
/// An in-process implementation of every collaborator trait. Used by the test
/// suites in place of Postgres. `set_unavailable(true)` makes every call fail
/// with `Internal`, simulating a persistence outage.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<Uuid, User>>,
    roles: RwLock<HashMap<Uuid, Role>>,
    routes: RwLock<Vec<RouteEntry>>,
    sessions: RwLock<HashMap<Uuid, Session>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Internal("memory store unavailable".to_string()));
        }
        Ok(())
    }

    pub fn insert_role(&self, role: Role) {
        self.roles.write().insert(role.id, role);
    }

    pub fn insert_user(&self, user: User) {
        self.users.write().insert(user.id, user);
    }

    pub fn insert_route(&self, route: RouteEntry) {
        self.routes.write().push(route);
    }

    pub fn update_role(&self, id: Uuid, update: impl FnOnce(&mut Role)) {
        if let Some(role) = self.roles.write().get_mut(&id) {
            update(role);
        }
    }

    /// Every stored session row, expired or not.
    pub fn all_sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    fn resolve(&self, user: User) -> UserRecord {
        let roles = self.roles.read();
        let resolved = user.role_ids.iter().filter_map(|id| roles.get(id).cloned()).collect();
        UserRecord { user, roles: resolved }
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<UserRecord>, AppError> {
        self.check()?;
        let user = self.users.read().get(&id).cloned();
        Ok(user.map(|u| self.resolve(u)))
    }

    async fn find_user_by_login(&self, identifier: &str) -> Result<Option<UserRecord>, AppError> {
        self.check()?;
        let identifier = identifier.trim().to_lowercase();
        let user = self
            .users
            .read()
            .values()
            .find(|u| !u.is_deleted && (u.email == identifier || u.username == identifier))
            .cloned();
        Ok(user.map(|u| self.resolve(u)))
    }

    async fn set_user_active(&self, id: Uuid, active: bool) -> Result<bool, AppError> {
        self.check()?;
        match self.users.write().get_mut(&id) {
            Some(user) => {
                user.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_user(&self, user: NewUser) -> Result<UserRecord, AppError> {
        self.check()?;
        let role_id = self
            .roles
            .read()
            .values()
            .find(|r| r.is_default && r.is_effective())
            .map(|r| r.id)
            .ok_or_else(|| AppError::Internal("no default role configured".to_string()))?;

        let created = {
            let mut users = self.users.write();
            if let Some(existing) = users
                .values()
                .find(|u| u.email == user.email || u.username == user.username)
            {
                let field = if existing.email == user.email { "email" } else { "username" };
                return Err(AppError::Conflict(format!("{field} already in use")));
            }
            let created = User {
                id: Uuid::new_v4(),
                email: user.email,
                username: user.username,
                name: user.name,
                password_hash: user.password_hash,
                is_active: true,
                is_deleted: false,
                role_ids: vec![role_id],
            };
            users.insert(created.id, created.clone());
            created
        };
        Ok(self.resolve(created))
    }
}

#[async_trait]
impl RouteCatalog for MemoryStore {
    async fn list_routes(&self) -> Result<Vec<RouteEntry>, AppError> {
        self.check()?;
        let mut routes = self.routes.read().clone();
        routes.sort_by(|a, b| a.sort.cmp(&b.sort).then_with(|| a.path.cmp(&b.path)));
        Ok(routes)
    }

    async fn count_routes(&self) -> Result<u64, AppError> {
        self.check()?;
        Ok(self.routes.read().len() as u64)
    }

    async fn create_route(&self, route: NewRoute) -> Result<RouteEntry, AppError> {
        self.check()?;
        let mut routes = self.routes.write();
        let path = route.path.trim().to_string();
        if routes.iter().any(|r| r.path == path) {
            return Err(AppError::Conflict(format!("route path '{path}' already exists")));
        }
        if let Some(parent) = route.parent_id {
            if !routes.iter().any(|r| r.id == parent) {
                return Err(AppError::Validation(format!("parent route {parent} does not exist")));
            }
        }
        let entry = RouteEntry {
            id: Uuid::new_v4(),
            path,
            name: route.name.trim().to_string(),
            icon: route.icon,
            sort: route.sort,
            is_visible: route.is_visible,
            permissions: route.permissions,
            parent_id: route.parent_id,
        };
        routes.push(entry.clone());
        Ok(entry)
    }

    async fn update_route(&self, id: Uuid, route: NewRoute) -> Result<Option<RouteEntry>, AppError> {
        self.check()?;
        let mut routes = self.routes.write();
        let Some(existing) = routes.iter().find(|r| r.id == id) else {
            return Ok(None);
        };
        let path = route.path.trim().to_string();
        if routes.iter().any(|r| r.id != id && r.path == path) {
            return Err(AppError::Conflict(format!("route path '{path}' already exists")));
        }
        if route.parent_id != existing.parent_id {
            let change = RouteOrder {
                id,
                parent_id: route.parent_id,
                sort: route.sort,
            };
            validate_reorder(&routes, &[change])?;
        }

        let Some(entry) = routes.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        *entry = RouteEntry {
            id,
            path,
            name: route.name.trim().to_string(),
            icon: route.icon,
            sort: route.sort,
            is_visible: route.is_visible,
            permissions: route.permissions,
            parent_id: route.parent_id,
        };
        Ok(Some(entry.clone()))
    }

    async fn delete_route(&self, id: Uuid) -> Result<bool, AppError> {
        self.check()?;
        let mut routes = self.routes.write();
        if routes.iter().any(|r| r.parent_id == Some(id)) {
            return Err(AppError::Conflict("route still has child routes".to_string()));
        }
        let before = routes.len();
        routes.retain(|r| r.id != id);
        Ok(routes.len() < before)
    }

    async fn reorder_routes(&self, changes: &[RouteOrder]) -> Result<(), AppError> {
        self.check()?;
        let mut routes = self.routes.write();
        validate_reorder(&routes, changes)?;
        for change in changes {
            if let Some(route) = routes.iter_mut().find(|r| r.id == change.id) {
                route.parent_id = change.parent_id;
                route.sort = change.sort;
            }
        }
        Ok(())
    }
}

fn newest_first(a: &Session, b: &Session) -> std::cmp::Ordering {
    (b.last_active_at, b.id).cmp(&(a.last_active_at, a.id))
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert_session(&self, draft: SessionDraft) -> Result<Session, AppError> {
        self.check()?;
        // The write lock spans lookup and write, so (user, device) stays unique.
        let mut sessions = self.sessions.write();
        let existing = sessions
            .values_mut()
            .find(|s| s.user_id == draft.user_id && s.device_id == draft.device_id);

        let session = match existing {
            Some(session) => {
                session.device_class = draft.device_class;
                session.refresh_token = draft.refresh_token;
                session.user_agent = draft.metadata.user_agent;
                session.ip = draft.metadata.ip;
                session.last_active_at = draft.now;
                session.expires_at = draft.expires_at;
                session.updated_at = draft.now;
                session.clone()
            }
            None => {
                let session = Session {
                    id: Uuid::new_v4(),
                    user_id: draft.user_id,
                    device_id: draft.device_id,
                    device_class: draft.device_class,
                    refresh_token: draft.refresh_token,
                    user_agent: draft.metadata.user_agent,
                    ip: draft.metadata.ip,
                    last_active_at: draft.now,
                    expires_at: draft.expires_at,
                    created_at: draft.now,
                    updated_at: draft.now,
                };
                sessions.insert(session.id, session.clone());
                session
            }
        };
        Ok(session)
    }

    async fn find_session_by_token(&self, user_id: Uuid, refresh_token: &str) -> Result<Option<Session>, AppError> {
        self.check()?;
        Ok(self
            .sessions
            .read()
            .values()
            .find(|s| s.user_id == user_id && s.refresh_token == refresh_token)
            .cloned())
    }

    async fn replace_session_token(
        &self,
        id: Uuid,
        expected_token: &str,
        new_token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.check()?;
        match self.sessions.write().get_mut(&id) {
            Some(session) if session.refresh_token == expected_token => {
                session.refresh_token = new_token.to_string();
                session.last_active_at = now;
                session.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_session(&self, user_id: Uuid, id: Uuid) -> Result<bool, AppError> {
        self.check()?;
        let mut sessions = self.sessions.write();
        match sessions.get(&id) {
            Some(session) if session.user_id == user_id => Ok(sessions.remove(&id).is_some()),
            _ => Ok(false),
        }
    }

    async fn delete_session_by_token(&self, refresh_token: &str) -> Result<bool, AppError> {
        self.check()?;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.refresh_token != refresh_token);
        Ok(sessions.len() < before)
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, AppError> {
        self.check()?;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - sessions.len()) as u64)
    }

    async fn list_sessions(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
        cursor: Option<SessionCursor>,
    ) -> Result<Vec<Session>, AppError> {
        self.check()?;
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.user_id == user_id && s.is_live(now))
            .filter(|s| cursor.is_none_or(|c| c.precedes(s)))
            .cloned()
            .collect();
        sessions.sort_by(newest_first);
        sessions.truncate(limit as usize);
        Ok(sessions)
    }

    async fn list_class_sessions(
        &self,
        user_id: Uuid,
        class: DeviceClass,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AppError> {
        self.check()?;
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.user_id == user_id && s.device_class == class && s.is_live(now))
            .cloned()
            .collect();
        sessions.sort_by(newest_first);
        Ok(sessions)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        self.check()?;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.is_live(now));
        Ok((before - sessions.len()) as u64)
    }
}
