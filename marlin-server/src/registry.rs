//! The site registry: port-scoped longest-prefix routing over registered
//! sites and their sub-sites.
//!
//! Sites live in an arena of slots owned by the registry; every reference
//! between sites is a [`SiteId`] index, never a pointer, which keeps the
//! natural site/sub-site cycles trivially safe. The lookup key is
//! `"{port}:{canonical path}"` and the longest-prefix walk shrinks the key
//! only at path separators.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::site::Site;

/// Index of a site in the registry arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SiteId(usize);

/// Errors from site registration and removal.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// A site with the same key is already registered.
    #[error("site already registered: {0}")]
    AlreadyExists(String),
    /// No site is registered under the key.
    #[error("site not found: {0}")]
    NotFound(String),
    /// Sub-sites still reference the site.
    #[error("site has sub-sites: {0}")]
    HasChildren(String),
    /// The declared parent does not exist or does not cover the child.
    #[error("bad parent site: {0}")]
    BadParent(String),
}

/// Builds the canonical registration key for `(port, path)`.
///
/// The path is lowercased, stripped of query and fragment (a `?` or `#`
/// inside a quoted region does not count), and loses trailing slashes:
/// `key(port, p) == key(port, p + "/")`.
pub fn make_site_key(port: u16, path: &str) -> String {
    let mut path = path.to_ascii_lowercase();

    let first_quote = path.find('\'');
    let cut = [path.find('?'), path.find('#')]
        .into_iter()
        .flatten()
        .filter(|pos| first_quote.is_none_or(|quote| *pos < quote))
        .min();
    if let Some(cut) = cut {
        path.truncate(cut);
    }
    let path = path.trim_end_matches('/');
    format!("{port}:{path}")
}

#[derive(Default)]
struct RegistryInner {
    slots: Vec<Option<Arc<Site>>>,
    by_key: HashMap<String, SiteId>,
}

/// The registry itself. All methods take interior locks.
#[derive(Default)]
pub struct SiteRegistry {
    inner: RwLock<RegistryInner>,
}

impl SiteRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a site, resolving its parent when it is a sub-site.
    ///
    /// A sub-site must share the parent's port and extend the parent's
    /// base path.
    pub fn register(
        &self,
        mut site: Site,
        parent: Option<(u16, String)>,
    ) -> Result<SiteId, RouterError> {
        let key = site.site_key();
        let mut inner = self.inner.write();

        if inner.by_key.contains_key(&key) {
            tracing::error!("duplicate site registration for {key}");
            return Err(RouterError::AlreadyExists(key));
        }

        if let Some((parent_port, parent_path)) = parent {
            let parent_key = make_site_key(parent_port, &parent_path);
            let parent_id = *inner
                .by_key
                .get(&parent_key)
                .ok_or_else(|| RouterError::BadParent(parent_key.clone()))?;
            if parent_port != site.port {
                return Err(RouterError::BadParent(format!(
                    "sub-site port {} differs from parent port {parent_port}",
                    site.port
                )));
            }
            let parent_base = parent_path.to_ascii_lowercase();
            if !site.base_path.to_ascii_lowercase().starts_with(&parent_base) {
                return Err(RouterError::BadParent(format!(
                    "sub-site path {} does not extend {parent_path}",
                    site.base_path
                )));
            }
            site.main_site = Some(parent_id);
        }

        let id = SiteId(inner.slots.len());
        inner.slots.push(Some(Arc::new(site)));
        inner.by_key.insert(key.clone(), id);
        tracing::info!("registered site {key}");
        Ok(id)
    }

    /// The site stored under an id.
    pub fn get(&self, id: SiteId) -> Option<Arc<Site>> {
        self.inner.read().slots.get(id.0)?.clone()
    }

    /// Longest-prefix lookup of the site owning `(port, path)`.
    pub fn find(&self, port: u16, path: &str) -> Option<(SiteId, Arc<Site>)> {
        let inner = self.inner.read();
        let search = make_site_key(port, path);

        let mut end = search.len();
        while end > 0 {
            if let Some(id) = inner.by_key.get(&search[..end]) {
                let site = inner.slots.get(id.0)?.clone()?;
                return Some((*id, site));
            }
            // Shrink back to the previous path separator
            end -= 1;
            while end > 0 {
                let byte = search.as_bytes()[end];
                if byte == b'/' || byte == b'\\' {
                    break;
                }
                end -= 1;
            }
        }
        None
    }

    /// Lookup scoped to a parent site.
    ///
    /// Returns the matched sub-site only when its main-site pointer is
    /// `parent`; otherwise the parent itself. Clients see the main site
    /// unless a sub-site was explicitly configured for them.
    pub fn find_in(&self, parent: SiteId, port: u16, path: &str) -> Option<(SiteId, Arc<Site>)> {
        match self.find(port, path) {
            Some((id, site)) if site.main_site == Some(parent) || id == parent => Some((id, site)),
            _ => {
                let site = self.get(parent)?;
                Some((parent, site))
            }
        }
    }

    /// Removes the site registered under `(port, base)`.
    ///
    /// Fails with [`RouterError::HasChildren`] while sub-sites reference
    /// it, unless `force` is set, which detaches the children.
    pub fn unregister(&self, port: u16, base: &str, force: bool) -> Result<(), RouterError> {
        let key = make_site_key(port, base);
        let mut inner = self.inner.write();
        let id = *inner
            .by_key
            .get(&key)
            .ok_or_else(|| RouterError::NotFound(key.clone()))?;

        let children: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let site = slot.as_ref()?;
                (site.main_site == Some(id)).then_some(index)
            })
            .collect();
        if !children.is_empty() && !force {
            return Err(RouterError::HasChildren(key));
        }
        // Forced removal orphans the children: their main-site id now
        // resolves to an empty slot (slots are never reused)
        inner.by_key.remove(&key);
        inner.slots[id.0] = None;
        tracing::info!("unregistered site {key}");
        Ok(())
    }

    /// Every registered site.
    pub fn all(&self) -> Vec<Arc<Site>> {
        self.inner.read().slots.iter().flatten().cloned().collect()
    }

    /// The distinct ports sites are registered on.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.all().iter().map(|site| site.port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    /// Number of registered sites.
    pub fn len(&self) -> usize {
        self.inner.read().by_key.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::SiteBuilder;

    fn register(registry: &SiteRegistry, port: u16, path: &str) -> SiteId {
        let (site, parent) = SiteBuilder::new(port, path).build().unwrap();
        registry.register(site, parent).unwrap()
    }

    fn register_sub(registry: &SiteRegistry, port: u16, path: &str, parent: &str) -> SiteId {
        let (site, parent) = SiteBuilder::new(port, path)
            .sub_site_of(parent)
            .build()
            .unwrap();
        registry.register(site, parent).unwrap()
    }

    #[test]
    fn keys_are_canonical() {
        assert_eq!(make_site_key(8080, "/Hello/"), "8080:/hello");
        assert_eq!(make_site_key(8080, "/hello"), make_site_key(8080, "/hello/"));
        assert_eq!(make_site_key(80, "/a?x=1"), "80:/a");
        assert_eq!(make_site_key(80, "/a#frag"), "80:/a");
        // A ? inside a quoted region does not start the query
        assert_eq!(make_site_key(80, "/a'?'/b"), "80:/a'?'/b");
    }

    #[test]
    fn longest_prefix_wins() {
        let registry = SiteRegistry::new();
        let root = register(&registry, 8080, "/");
        let hello = register(&registry, 8080, "/hello/");
        let deep = register(&registry, 8080, "/hello/world/deep/");

        assert_eq!(registry.find(8080, "/hello/world").unwrap().0, hello);
        assert_eq!(registry.find(8080, "/hello/world/deep/x").unwrap().0, deep);
        assert_eq!(registry.find(8080, "/other").unwrap().0, root);
        assert!(registry.find(9090, "/hello/world").is_none());
    }

    #[test]
    fn no_site_between_match_and_path() {
        let registry = SiteRegistry::new();
        register(&registry, 80, "/a/");
        let ab = register(&registry, 80, "/a/b/");
        // /a/b/c matches /a/b/, not /a/
        assert_eq!(registry.find(80, "/a/b/c").unwrap().0, ab);
    }

    #[test]
    fn duplicates_are_rejected() {
        let registry = SiteRegistry::new();
        register(&registry, 80, "/svc/");
        let (dup, parent) = SiteBuilder::new(80, "/SVC").build().unwrap();
        assert!(matches!(
            registry.register(dup, parent),
            Err(RouterError::AlreadyExists(_))
        ));
    }

    #[test]
    fn sub_sites_must_extend_their_parent() {
        let registry = SiteRegistry::new();
        register(&registry, 80, "/svc/");

        let (bad, parent) = SiteBuilder::new(80, "/other/")
            .sub_site_of("/svc/")
            .build()
            .unwrap();
        assert!(matches!(
            registry.register(bad, parent),
            Err(RouterError::BadParent(_))
        ));

        let sub = register_sub(&registry, 80, "/svc/inner/", "/svc/");
        let site = registry.get(sub).unwrap();
        assert!(site.main_site.is_some());
    }

    #[test]
    fn parent_scoped_lookup_prefers_the_main_site() {
        let registry = SiteRegistry::new();
        let parent = register(&registry, 80, "/svc/");
        let sub = register_sub(&registry, 80, "/svc/inner/", "/svc/");
        let other = register(&registry, 80, "/elsewhere/");

        assert_eq!(registry.find_in(parent, 80, "/svc/inner/x").unwrap().0, sub);
        // A hit outside the parent's family folds back to the parent
        assert_eq!(registry.find_in(parent, 80, "/elsewhere/x").unwrap().0, parent);
        assert_eq!(registry.find_in(other, 80, "/elsewhere/x").unwrap().0, other);
    }

    #[test]
    fn deletion_is_guarded_by_children() {
        let registry = SiteRegistry::new();
        register(&registry, 80, "/svc/");
        register_sub(&registry, 80, "/svc/inner/", "/svc/");

        assert!(matches!(
            registry.unregister(80, "/svc/", false),
            Err(RouterError::HasChildren(_))
        ));
        registry.unregister(80, "/svc/", true).unwrap();
        assert!(registry.find(80, "/svc/x").map(|(_, s)| s.base_path.clone()) == Some("/svc/inner/".to_owned()) || registry.find(80, "/svc/inner/x").is_some());
        assert!(matches!(
            registry.unregister(80, "/svc/", false),
            Err(RouterError::NotFound(_))
        ));
    }
}
