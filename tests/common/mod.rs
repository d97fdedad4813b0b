#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHasher, SaltString},
};
use chrono::Utc;
use cms_access::{
    AppConfig, AppState, MemoryStore,
    models::{DeviceClass, Role, RouteEntry, User},
    tokens::{TokenKind, TokenSubject},
};
use uuid::Uuid;

pub const PASSWORD: &str = "correct-horse";

/// Argon2id hash of `PASSWORD` with minimal cost parameters. Verification
/// reads the parameters from the hash, so tests stay fast.
pub fn password_hash() -> String {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| {
        let params = Params::new(8, 1, 1, None).unwrap();
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let salt = SaltString::encode_b64(b"fixture-salt-0001").unwrap();
        argon.hash_password(PASSWORD.as_bytes(), &salt).unwrap().to_string()
    })
    .clone()
}

pub fn role(name: &str, permissions: &[&str]) -> Role {
    Role {
        id: Uuid::new_v4(),
        name: name.to_string(),
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
        is_active: true,
        ..Default::default()
    }
}

pub fn user(username: &str, role_ids: Vec<Uuid>) -> User {
    User {
        id: Uuid::new_v4(),
        email: format!("{username}@example.com"),
        username: username.to_string(),
        name: username.to_uppercase(),
        password_hash: password_hash(),
        is_active: true,
        is_deleted: false,
        role_ids,
    }
}

pub fn route(path: &str, parent: Option<&RouteEntry>, permissions: &[&str], sort: i32) -> RouteEntry {
    RouteEntry {
        id: Uuid::new_v4(),
        path: path.to_string(),
        name: path.trim_start_matches('/').to_string(),
        icon: None,
        sort,
        is_visible: true,
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
        parent_id: parent.map(|p| p.id),
    }
}

/// Store one role with `permissions` and one active user holding it.
pub fn seed_user(store: &MemoryStore, username: &str, permissions: &[&str]) -> (User, Role) {
    let role = role(&format!("{username}-role"), permissions);
    let user = user(username, vec![role.id]);
    store.insert_role(role.clone());
    store.insert_user(user.clone());
    (user, role)
}

pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub state: AppState,
}

pub fn context() -> TestContext {
    context_with(AppConfig::default())
}

pub fn context_with(config: AppConfig) -> TestContext {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::in_memory(config, store.clone());
    TestContext { store, state }
}

/// A valid access token for `user` on a web device.
pub fn access_token(state: &AppState, user: &User) -> String {
    let subject = TokenSubject::new(user, "test-device", DeviceClass::Web);
    state.tokens.issue(TokenKind::Access, &subject, Utc::now()).unwrap()
}
