use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{NewRoute, RouteEntry, RouteNode, RouteOrder},
    permissions::PermissionSet,
    repository::RouteCatalogState,
};

/// RouteSnapshot
///
/// An immutable copy of the whole route catalog. Built off to the side and
/// published in one pointer swap, so readers always see a complete tree.
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    routes: Vec<RouteEntry>,
    index: HashMap<Uuid, usize>,
}

impl RouteSnapshot {
    pub fn new(mut routes: Vec<RouteEntry>) -> Self {
        routes.sort_by(|a, b| a.sort.cmp(&b.sort).then_with(|| a.path.cmp(&b.path)));
        let index = routes.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
        Self { routes, index }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn get(&self, id: Uuid) -> Option<&RouteEntry> {
        self.index.get(&id).map(|&i| &self.routes[i])
    }

    /// is_visible
    ///
    /// A route is visible iff it and every ancestor up to its root have all their
    /// required patterns covered by `permissions`. A route without requirements
    /// only inherits its ancestors' constraints. A parent id that is not in the
    /// catalog ends the chain. A cycle denies.
    pub fn is_visible(&self, route: &RouteEntry, permissions: &PermissionSet) -> bool {
        let mut seen = HashSet::new();
        let mut current = Some(route);

        while let Some(node) = current {
            if !seen.insert(node.id) {
                tracing::warn!(route_id = %node.id, "cycle in route catalog, denying");
                return false;
            }
            if !permissions.satisfies_all(&node.permissions) {
                return false;
            }
            current = node.parent_id.and_then(|parent| self.get(parent));
        }
        true
    }

    /// Visible routes in catalog order (sort key, then path).
    pub fn visible_for(&self, permissions: &PermissionSet) -> Vec<RouteEntry> {
        self.routes
            .iter()
            .filter(|route| self.is_visible(route, permissions))
            .cloned()
            .collect()
    }
}

/// RouteCache
///
/// Process-wide holder of the current `RouteSnapshot`. Readers only clone the
/// `Arc`. Writers (reloads and catalog mutations) are serialized on `writer`, so
/// a snapshot is always published by the last catalog read, never by an older
/// one that finished late.
pub struct RouteCache {
    catalog: RouteCatalogState,
    current: RwLock<Arc<RouteSnapshot>>,
    writer: Mutex<()>,
}

impl RouteCache {
    /// An empty (cold) cache over `catalog`. Call `load` to populate it.
    pub fn new(catalog: RouteCatalogState) -> Self {
        Self {
            catalog,
            current: RwLock::new(Arc::new(RouteSnapshot::default())),
            writer: Mutex::new(()),
        }
    }

    /// The snapshot readers should use for the rest of their work.
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current.read().clone()
    }

    /// load
    ///
    /// Read the whole catalog and publish it as the new snapshot. On failure the
    /// previous snapshot stays in place and the error propagates.
    pub async fn load(&self) -> Result<usize, AppError> {
        let _writer = self.writer.lock().await;
        self.publish().await
    }

    /// Fetch and swap. Callers hold `writer`.
    async fn publish(&self) -> Result<usize, AppError> {
        let routes = self.catalog.list_routes().await?;
        let snapshot = Arc::new(RouteSnapshot::new(routes));
        let count = snapshot.len();
        *self.current.write() = snapshot;
        tracing::info!(routes = count, "route catalog loaded");
        Ok(count)
    }

    /// Visible routes from the current snapshot, with no fallback.
    pub fn visible_for(&self, permissions: &PermissionSet) -> Vec<RouteEntry> {
        self.snapshot().visible_for(permissions)
    }

    /// current_or_reload
    ///
    /// The current snapshot, except that a cold one (empty while the catalog
    /// holds routes) is reloaded once first. An unloaded cache is never
    /// reported as "no routes".
    pub async fn current_or_reload(&self) -> Result<Arc<RouteSnapshot>, AppError> {
        let snapshot = self.snapshot();
        if !snapshot.is_empty() || self.catalog.count_routes().await? == 0 {
            return Ok(snapshot);
        }
        let _writer = self.writer.lock().await;
        // Another request may have warmed it while we waited.
        if self.snapshot().is_empty() {
            tracing::warn!("route cache is cold, reloading");
            self.publish().await?;
        }
        Ok(self.snapshot())
    }

    /// Like `visible_for`, with the cold-cache fallback of `current_or_reload`.
    pub async fn visible_for_or_reload(&self, permissions: &PermissionSet) -> Result<Vec<RouteEntry>, AppError> {
        Ok(self.current_or_reload().await?.visible_for(permissions))
    }

    // --- Catalog mutations: write, then reload, under `writer` ---

    pub async fn create_route(&self, route: NewRoute) -> Result<RouteEntry, AppError> {
        let _writer = self.writer.lock().await;
        let created = self.catalog.create_route(route).await?;
        self.publish().await?;
        Ok(created)
    }

    /// Replace the entry `id`. `Ok(None)` if it does not exist; `Validation` if
    /// the new parent is unknown or would close a cycle.
    pub async fn update_route(&self, id: Uuid, route: NewRoute) -> Result<Option<RouteEntry>, AppError> {
        let _writer = self.writer.lock().await;
        let routes = self.catalog.list_routes().await?;
        let Some(existing) = routes.iter().find(|r| r.id == id) else {
            return Ok(None);
        };
        if route.parent_id != existing.parent_id {
            let change = RouteOrder {
                id,
                parent_id: route.parent_id,
                sort: route.sort,
            };
            validate_reorder(&routes, &[change])?;
        }

        let updated = self.catalog.update_route(id, route).await?;
        self.publish().await?;
        Ok(updated)
    }

    /// `Ok(false)` if absent; `Conflict` if the route still has children.
    pub async fn delete_route(&self, id: Uuid) -> Result<bool, AppError> {
        let _writer = self.writer.lock().await;
        let deleted = self.catalog.delete_route(id).await?;
        if deleted {
            self.publish().await?;
        }
        Ok(deleted)
    }

    /// reorder_routes
    ///
    /// Validate a bulk parent/sort change against the catalog as it is now and
    /// apply it. Validation and write happen under the same writer lock, so two
    /// reorders that are each acyclic cannot combine into a cycle.
    pub async fn reorder_routes(&self, changes: &[RouteOrder]) -> Result<(), AppError> {
        let _writer = self.writer.lock().await;
        let routes = self.catalog.list_routes().await?;
        validate_reorder(&routes, changes)?;
        self.catalog.reorder_routes(changes).await?;
        self.publish().await?;
        Ok(())
    }
}

/// build_tree
///
/// Nest a visible route list into a forest. A route whose parent is not in the
/// list becomes a root. Sibling order follows the input order. Nodes on a
/// parent cycle have no root and are never reached.
pub fn build_tree(routes: &[RouteEntry]) -> Vec<RouteNode> {
    let present: HashSet<Uuid> = routes.iter().map(|r| r.id).collect();
    let mut children: HashMap<Uuid, Vec<&RouteEntry>> = HashMap::new();
    let mut roots = Vec::new();

    for route in routes {
        match route.parent_id.filter(|p| present.contains(p) && *p != route.id) {
            Some(parent) => children.entry(parent).or_default().push(route),
            None => roots.push(route),
        }
    }

    fn node(route: &RouteEntry, children: &HashMap<Uuid, Vec<&RouteEntry>>) -> RouteNode {
        RouteNode {
            id: route.id,
            path: route.path.clone(),
            name: route.name.clone(),
            icon: route.icon.clone(),
            sort: route.sort,
            is_visible: route.is_visible,
            children: children
                .get(&route.id)
                .map(|list| list.iter().map(|c| node(c, children)).collect())
                .unwrap_or_default(),
        }
    }

    roots.into_iter().map(|r| node(r, &children)).collect()
}

/// validate_reorder
///
/// Check a bulk parent/sort change against `routes`: every id and parent must
/// exist and the resulting parent links must still form a forest.
pub fn validate_reorder(routes: &[RouteEntry], changes: &[RouteOrder]) -> Result<(), AppError> {
    let mut parents: HashMap<Uuid, Option<Uuid>> = routes.iter().map(|r| (r.id, r.parent_id)).collect();

    for change in changes {
        if !parents.contains_key(&change.id) {
            return Err(AppError::Validation(format!("route {} does not exist", change.id)));
        }
        if let Some(parent) = change.parent_id {
            if !parents.contains_key(&parent) {
                return Err(AppError::Validation(format!("parent route {parent} does not exist")));
            }
        }
    }
    for change in changes {
        parents.insert(change.id, change.parent_id);
    }

    for change in changes {
        let mut seen = HashSet::new();
        let mut current = Some(change.id);
        while let Some(id) = current {
            if !seen.insert(id) {
                return Err(AppError::Validation(format!("moving route {} would create a cycle", change.id)));
            }
            current = parents.get(&id).copied().flatten();
        }
    }
    Ok(())
}
