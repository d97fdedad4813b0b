use std::collections::BTreeSet;

use crate::models::UserRecord;

/// matches
///
/// Does `path` satisfy any of `patterns`? A pattern is one of:
/// - `*`: every path,
/// - `<prefix>*`: any path that starts with `<prefix>` (a literal string prefix,
///   not a path-segment boundary: `/a*` covers `/ab`),
/// - anything else: exactly that path.
///
/// Only a single trailing `*` is special. No globbing or regex.
pub fn matches<'a, I>(path: &str, patterns: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    patterns.into_iter().any(|pattern| match pattern.strip_suffix('*') {
        // `*` strips to the empty prefix, which every path starts with.
        Some(prefix) => path.starts_with(prefix),
        None => path == pattern,
    })
}

/// PermissionSet
///
/// A deduplicated set of permission patterns, as granted to one caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `path` is covered by at least one pattern in the set.
    pub fn allows(&self, path: &str) -> bool {
        matches(path, self.0.iter().map(String::as_str))
    }

    /// Whether every pattern in `required` is itself covered by this set. Used for
    /// route catalog entries, whose requirements are expressed as patterns.
    pub fn satisfies_all<'a, I>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        required.into_iter().all(|pattern| self.allows(pattern))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|pattern| {
                    let pattern: String = pattern.into();
                    pattern.trim().to_string()
                })
                .filter(|pattern| !pattern.is_empty())
                .collect(),
        )
    }
}

/// effective_permissions
///
/// The one place where a user's permission set is computed: the union of the
/// patterns of every active, non-deleted role the user holds. An inactive or
/// deleted user gets an empty set regardless of membership.
pub fn effective_permissions(record: &UserRecord) -> PermissionSet {
    if !record.can_authenticate() {
        return PermissionSet::new();
    }

    record
        .roles
        .iter()
        .filter(|role| role.is_effective())
        .flat_map(|role| role.permissions.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_wildcard_matches_everything() {
        assert!(matches("/anything/at/all", ["*"]));
        assert!(matches("", ["*"]));
    }

    #[test]
    fn prefix_respects_literal_boundary_only() {
        assert!(matches("/a/b", ["/a/*"]));
        assert!(!matches("/ab", ["/a/*"]));
        assert!(matches("/ab", ["/a*"]));
    }

    #[test]
    fn exact_pattern_needs_equality() {
        assert!(matches("/api/users", ["/api/users"]));
        assert!(!matches("/api/users/1", ["/api/users"]));
        assert!(!matches("/api/user", ["/api/users"]));
    }

    #[test]
    fn no_patterns_no_match() {
        assert!(!matches("/api", std::iter::empty::<&str>()));
    }

    #[test]
    fn interior_star_is_literal() {
        assert!(!matches("/api/x/list", ["/api/*/list"]));
        assert!(matches("/api/*/list", ["/api/*/list"]));
    }
}
