use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use ts_rs::TS;
use utoipa::ToSchema;
use uuid::Uuid;

// --- Core Records (Mapped to Database) ---

/// DeviceClass
///
/// The closed set of client kinds a session can belong to. Sent by the client at
/// login and carried inside both token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS, ToSchema)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum DeviceClass {
    Pc,
    Mobile,
    Tablet,
    #[default]
    Web,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 4] = [
        DeviceClass::Pc,
        DeviceClass::Mobile,
        DeviceClass::Tablet,
        DeviceClass::Web,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Pc => "pc",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Web => "web",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pc" => Ok(DeviceClass::Pc),
            "mobile" => Ok(DeviceClass::Mobile),
            "tablet" => Ok(DeviceClass::Tablet),
            "web" => Ok(DeviceClass::Web),
            other => Err(format!("unknown device class '{other}'")),
        }
    }
}

/// Role
///
/// A named bundle of permission patterns. Users reference roles by id only; the
/// full value is resolved once per request by the user directory.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, FromRow, Default)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub permissions: Vec<String>,
    /// At most one role is the fallback for self-registration.
    pub is_default: bool,
    pub is_active: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Role {
    /// Whether this role still contributes permissions to its holders.
    pub fn is_effective(&self) -> bool {
        self.is_active && !self.is_deleted
    }
}

/// User
///
/// The account record as stored. `role_ids` is the at-rest representation of role
/// membership (zero or more references).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, Default)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub name: String,
    /// Argon2 PHC string. Never serialized to clients.
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub role_ids: Vec<Uuid>,
}

/// UserRecord
///
/// A user with its role references resolved to full role values. Produced by the
/// user directory; consumed by effective permission resolution.
#[derive(Debug, Clone, Default)]
pub struct UserRecord {
    pub user: User,
    pub roles: Vec<Role>,
}

impl UserRecord {
    /// Active and not soft-deleted.
    pub fn can_authenticate(&self) -> bool {
        self.user.is_active && !self.user.is_deleted
    }
}

/// NewUser
///
/// A validated self-registration, ready to store. Email and username are
/// already lower-cased and the password already hashed.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub name: String,
    pub password_hash: String,
}

/// RequestMetadata
///
/// Client facts captured at login and stored on the device session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    pub user_agent: Option<String>,
    pub ip: Option<String>,
}

/// Session
///
/// The single login record of one (user, device) pair. Holds the only refresh
/// token that is currently accepted for that device.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub device_id: String,
    pub device_class: DeviceClass,
    pub refresh_token: String,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A session whose expiry has passed is treated as absent, whether or not the
    /// row has been physically removed yet.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// SessionDraft
///
/// Everything needed to create or overwrite the session of a (user, device) pair.
#[derive(Debug, Clone)]
pub struct SessionDraft {
    pub user_id: Uuid,
    pub device_id: String,
    pub device_class: DeviceClass,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub metadata: RequestMetadata,
    pub now: DateTime<Utc>,
}

/// SessionCursor
///
/// Keyset position for reverse-chronological session listing: sessions strictly
/// older than (`last_active_at`, `id`) come next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCursor {
    pub last_active_at: DateTime<Utc>,
    pub id: Uuid,
}

impl SessionCursor {
    pub fn after(session: &Session) -> Self {
        Self {
            last_active_at: session.last_active_at,
            id: session.id,
        }
    }

    /// Whether `session` sorts strictly after this cursor in (last_active desc, id desc) order.
    pub fn precedes(&self, session: &Session) -> bool {
        (session.last_active_at, session.id) < (self.last_active_at, self.id)
    }

    pub fn encode(&self) -> String {
        format!(
            "{}.{:09}.{}",
            self.last_active_at.timestamp(),
            self.last_active_at.timestamp_subsec_nanos(),
            self.id
        )
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, '.');
        let secs: i64 = parts.next()?.parse().ok()?;
        let nanos: u32 = parts.next()?.parse().ok()?;
        let id = parts.next()?;
        let last_active_at = DateTime::<Utc>::from_timestamp(secs, nanos)?;
        let id = Uuid::parse_str(id).ok()?;
        Some(Self { last_active_at, id })
    }
}

/// RouteEntry
///
/// One node of the persisted route catalog. `parent_id` links nodes into a forest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema, FromRow, Default)]
#[ts(export)]
pub struct RouteEntry {
    pub id: Uuid,
    pub path: String,
    pub name: String,
    pub icon: Option<String>,
    pub sort: i32,
    pub is_visible: bool,
    /// Required permission patterns; empty means "inherit only".
    pub permissions: Vec<String>,
    pub parent_id: Option<Uuid>,
}

// --- Request Payloads ---

/// LoginRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct LoginRequest {
    pub username_or_email: String,
    pub password: String,
    /// Client-persisted random value, stable across logins from the same device.
    pub device_id: String,
    #[serde(default)]
    pub device_type: DeviceClass,
}

/// RegisterRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    pub name: String,
}

/// RefreshRequest
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

/// LogoutRequest
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
}

/// SessionQuery
///
/// Cursor pagination parameters for session listings.
#[derive(Debug, Clone, Default, Deserialize, utoipa::IntoParams)]
pub struct SessionQuery {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

/// UpdateUserStatusRequest
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct UpdateUserStatusRequest {
    pub is_active: bool,
}

/// NewRoute
///
/// Input payload for adding a catalog entry (POST /api/system/routes) or
/// replacing one (PUT /api/system/routes/{id}).
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema, Default)]
#[ts(export)]
pub struct NewRoute {
    pub path: String,
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub sort: i32,
    #[serde(default = "default_true")]
    pub is_visible: bool,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

fn default_true() -> bool {
    true
}

/// RouteOrder
///
/// One element of a bulk re-parent/re-sort request (PUT /api/system/routes/order).
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct RouteOrder {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub sort: i32,
}

// --- Response Payloads ---

/// UserSummary
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct UserSummary {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub name: String,
    pub role_ids: Vec<Uuid>,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            username: user.username.clone(),
            name: user.name.clone(),
            role_ids: user.role_ids.clone(),
        }
    }
}

/// TokenPair
///
/// Issued by login and by refresh. `expires_at` is the absolute expiry of the
/// device session (and therefore of the refresh token).
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    #[ts(type = "string")]
    pub expires_at: DateTime<Utc>,
}

/// LoginResponse
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct LoginResponse {
    pub user: UserSummary,
    #[serde(flatten)]
    #[ts(flatten)]
    pub tokens: TokenPair,
}

/// ProfileResponse
///
/// The caller's identity with the permission set resolved for this request.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct ProfileResponse {
    pub user: UserSummary,
    pub permissions: Vec<String>,
    pub device_class: DeviceClass,
}

/// SessionView
///
/// A session as shown in "manage your devices". The refresh token never leaves
/// the server.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct SessionView {
    pub id: Uuid,
    pub device_id: String,
    pub device_class: DeviceClass,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    #[ts(type = "string")]
    pub last_active_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub expires_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    /// True for the session the request was made from.
    pub current: bool,
}

impl SessionView {
    pub fn from_session(session: &Session, current_device: Option<&str>) -> Self {
        Self {
            id: session.id,
            device_id: session.device_id.clone(),
            device_class: session.device_class,
            user_agent: session.user_agent.clone(),
            ip: session.ip.clone(),
            last_active_at: session.last_active_at,
            expires_at: session.expires_at,
            created_at: session.created_at,
            current: current_device == Some(session.device_id.as_str()),
        }
    }
}

/// SessionPage
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct SessionPage {
    pub items: Vec<SessionView>,
    pub next_cursor: Option<String>,
}

/// RouteNode
///
/// A visible catalog entry with its visible children, as returned by GET /api/routes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct RouteNode {
    pub id: Uuid,
    pub path: String,
    pub name: String,
    pub icon: Option<String>,
    pub sort: i32,
    pub is_visible: bool,
    #[schema(no_recursion)]
    pub children: Vec<RouteNode>,
}

/// ActionResponse
///
/// Acknowledgement for operations that report nothing but success.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct ActionResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }
}
