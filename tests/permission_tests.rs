use cms_access::{
    models::{Role, User, UserRecord},
    permissions::{PermissionSet, effective_permissions, matches},
};
use uuid::Uuid;

fn role(permissions: &[&str], is_active: bool, is_deleted: bool) -> Role {
    Role {
        id: Uuid::new_v4(),
        name: "r".to_string(),
        permissions: permissions.iter().map(|p| p.to_string()).collect(),
        is_active,
        is_deleted,
        ..Default::default()
    }
}

fn record(roles: Vec<Role>, is_active: bool, is_deleted: bool) -> UserRecord {
    UserRecord {
        user: User {
            id: Uuid::new_v4(),
            is_active,
            is_deleted,
            role_ids: roles.iter().map(|r| r.id).collect(),
            ..Default::default()
        },
        roles,
    }
}

#[test]
fn test_wildcard_matches_everything() {
    for path in ["/", "/api/users", "", "/anything/at/all"] {
        assert!(matches(path, ["*"]), "{path}");
    }
}

#[test]
fn test_prefix_pattern_covers_any_suffix() {
    for suffix in ["", "/", "/5", "abc", "/deeply/nested"] {
        let path = format!("/api/posts{suffix}");
        assert!(matches(&path, ["/api/posts*"]), "{path}");
    }
}

#[test]
fn test_prefix_is_literal_not_segment_bound() {
    assert!(matches("/a/b", ["/a/*"]));
    assert!(!matches("/ab", ["/a/*"]));
    // Without the slash the literal prefix also covers sibling names.
    assert!(matches("/ab", ["/a*"]));
}

#[test]
fn test_exact_pattern_requires_equality() {
    assert!(matches("/api/users", ["/api/users"]));
    assert!(!matches("/api/users/1", ["/api/users"]));
    assert!(!matches("/api/user", ["/api/users"]));
}

#[test]
fn test_only_trailing_star_is_special() {
    assert!(!matches("/api/x/edit", ["/api/*/edit"]));
    assert!(matches("/api/*/edit", ["/api/*/edit"]));
}

#[test]
fn test_no_patterns_matches_nothing() {
    assert!(!matches("/api/users", std::iter::empty::<&str>()));
    assert!(!PermissionSet::new().allows("/"));
}

#[test]
fn test_pattern_order_is_irrelevant() {
    let a: PermissionSet = ["/api/users", "/api/posts*"].into_iter().collect();
    let b: PermissionSet = ["/api/posts*", "/api/users"].into_iter().collect();
    for path in ["/api/users", "/api/posts/1", "/api/tags"] {
        assert_eq!(a.allows(path), b.allows(path));
    }
}

#[test]
fn test_satisfies_all_treats_requirements_as_paths() {
    let perms: PermissionSet = ["/admin*"].into_iter().collect();
    let required = vec!["/admin/commerce*".to_string(), "/admin/users".to_string()];
    assert!(perms.satisfies_all(&required));

    let narrow: PermissionSet = ["/admin/commerce/orders"].into_iter().collect();
    assert!(!narrow.satisfies_all(&vec!["/admin/commerce*".to_string()]));
    assert!(narrow.satisfies_all(&Vec::<String>::new()));
}

#[test]
fn test_effective_permissions_union_deduplicates() {
    let r = record(
        vec![
            role(&["/api/posts*", "/api/tags"], true, false),
            role(&["/api/tags", " /api/users ", ""], true, false),
        ],
        true,
        false,
    );
    let perms = effective_permissions(&r);
    assert_eq!(perms.to_vec(), vec!["/api/posts*", "/api/tags", "/api/users"]);
}

#[test]
fn test_inactive_and_deleted_roles_contribute_nothing() {
    let r = record(
        vec![role(&["*"], false, false), role(&["/api/users"], true, true)],
        true,
        false,
    );
    assert!(effective_permissions(&r).is_empty());
}

#[test]
fn test_deactivated_or_deleted_user_has_no_permissions() {
    let roles = vec![role(&["*"], true, false)];
    assert!(effective_permissions(&record(roles.clone(), false, false)).is_empty());
    assert!(effective_permissions(&record(roles.clone(), true, true)).is_empty());
    assert_eq!(effective_permissions(&record(roles, true, false)).len(), 1);
}
