//! Organizational location tree backed by materialized paths
//!
//! A location's path is its ancestor chain of numeric segments joined by
//! dots (`1`, `1.4`, `1.4.2`), so subtree membership is a prefix test.

pub mod cache;

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::models::{Location, LocationId};
use crate::store::Store;

pub use cache::{DescendantCache, DescendantSet, NoCache, TtlCache};

/// True iff `path` is `ancestor_path` itself or lies in its subtree
pub fn path_is_descendant(path: &str, ancestor_path: &str) -> bool {
    path == ancestor_path
        || (path.len() > ancestor_path.len()
            && path.starts_with(ancestor_path)
            && path.as_bytes()[ancestor_path.len()] == b'.')
}

/// Paths of every proper ancestor, root first
pub fn ancestor_paths(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('.').collect();
    (1..segments.len())
        .map(|n| segments[..n].join("."))
        .collect()
}

fn last_segment(path: &str) -> Option<u64> {
    path.rsplit('.').next()?.parse().ok()
}

fn is_numeric_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.chars().all(|c| c.is_ascii_digit())
}

/// Tree queries over the locations read model
#[derive(Clone)]
pub struct LocationHierarchy {
    store: Store,
    cache: Arc<dyn DescendantCache>,
}

impl LocationHierarchy {
    pub fn new(store: Store, cache: Arc<dyn DescendantCache>) -> Self {
        Self { store, cache }
    }

    /// Path for a new node under `parent_id` (or a new root)
    pub async fn calculate_path(&self, parent_id: Option<LocationId>) -> Result<String> {
        let siblings = self.store.list_child_locations(parent_id).await?;
        let next = siblings
            .iter()
            .filter_map(|l| last_segment(&l.path))
            .max()
            .unwrap_or(0)
            + 1;

        match parent_id {
            None => Ok(next.to_string()),
            Some(id) => {
                let parent = self.store.get_location(id).await?;
                Ok(format!("{}.{}", parent.path, next))
            }
        }
    }

    /// Insert a location with its path and level assigned
    pub async fn create_location(&self, name: &str, parent_id: Option<LocationId>) -> Result<Location> {
        if name.trim().is_empty() {
            return Err(AppError::Validation("location name is required".to_string()));
        }

        let path = self.calculate_path(parent_id).await?;
        let level = path.split('.').count() as i64 - 1;
        let location = self
            .store
            .insert_location_row(name, parent_id, &path, level)
            .await?;

        for ancestor in self.get_ancestors(location.id).await? {
            self.cache.invalidate(ancestor.id);
        }

        tracing::debug!(location_id = location.id, path = %location.path, "Location created");
        Ok(location)
    }

    /// Ids of `ancestor_id` and everything below it, through the cache
    pub async fn descendant_ids(&self, ancestor_id: LocationId) -> Result<DescendantSet> {
        if let Some(hit) = self.cache.get(ancestor_id) {
            return Ok(hit);
        }

        let ancestor = self.store.get_location(ancestor_id).await?;
        let mut ids: HashSet<LocationId> = self
            .store
            .list_locations_below(&ancestor.path)
            .await?
            .into_iter()
            .map(|l| l.id)
            .collect();
        ids.insert(ancestor.id);

        let set = Arc::new(ids);
        self.cache.set(ancestor_id, set.clone());
        Ok(set)
    }

    /// Subtree membership (a location counts as its own descendant). May be
    /// stale within the cache TTL.
    pub async fn is_descendant_of(&self, location_id: LocationId, ancestor_id: LocationId) -> Result<bool> {
        if location_id == ancestor_id {
            return Ok(true);
        }
        Ok(self.descendant_ids(ancestor_id).await?.contains(&location_id))
    }

    /// Subtree membership read straight from the store, bypassing the cache
    pub async fn is_descendant_uncached(
        &self,
        location_id: LocationId,
        ancestor_id: LocationId,
    ) -> Result<bool> {
        if location_id == ancestor_id {
            return Ok(true);
        }
        let location = self.store.get_location(location_id).await?;
        let ancestor = self.store.get_location(ancestor_id).await?;
        Ok(path_is_descendant(&location.path, &ancestor.path))
    }

    pub async fn get_descendants(&self, location_id: LocationId) -> Result<Vec<Location>> {
        let location = self.store.get_location(location_id).await?;
        self.store.list_locations_below(&location.path).await
    }

    /// Proper ancestors, root first
    pub async fn get_ancestors(&self, location_id: LocationId) -> Result<Vec<Location>> {
        let location = self.store.get_location(location_id).await?;
        self.store
            .list_locations_by_paths(&ancestor_paths(&location.path))
            .await
    }

    pub async fn get_parent(&self, location_id: LocationId) -> Result<Option<Location>> {
        let location = self.store.get_location(location_id).await?;
        match location.parent_id {
            Some(parent_id) => self.store.find_location(parent_id).await,
            None => Ok(None),
        }
    }

    /// Check that a stored node agrees with its parent and its own level
    pub async fn validate_tree_integrity(&self, location_id: LocationId) -> Result<()> {
        let location = self.store.get_location(location_id).await?;

        match location.parent_id {
            Some(parent_id) => {
                let parent = self.store.get_location(parent_id).await?;
                if !location.path.starts_with(&format!("{}.", parent.path)) {
                    return Err(AppError::Validation(format!(
                        "location {} path '{}' does not extend parent path '{}'",
                        location.id, location.path, parent.path
                    )));
                }
            }
            None => {
                if !is_numeric_segment(&location.path) {
                    return Err(AppError::Validation(format!(
                        "root location {} path '{}' is not a single numeric segment",
                        location.id, location.path
                    )));
                }
            }
        }

        let expected_level = location.depth() as i64 - 1;
        if location.level != expected_level {
            return Err(AppError::Validation(format!(
                "location {} has level {} but its path implies {}",
                location.id, location.level, expected_level
            )));
        }

        Ok(())
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::setup_test_db;
    use std::time::Duration;

    async fn hierarchy() -> (LocationHierarchy, Store) {
        let store = setup_test_db().await;
        let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));
        (LocationHierarchy::new(store.clone(), cache), store)
    }

    #[test]
    fn test_path_is_descendant() {
        assert!(path_is_descendant("1.2.3", "1.2"));
        assert!(path_is_descendant("1.2", "1.2"));
        assert!(!path_is_descendant("1.3", "1.2"));
        assert!(!path_is_descendant("1.23", "1.2"));
        assert!(!path_is_descendant("1", "1.2"));
    }

    #[test]
    fn test_ancestor_paths() {
        assert_eq!(ancestor_paths("1.4.2"), vec!["1".to_string(), "1.4".to_string()]);
        assert!(ancestor_paths("7").is_empty());
    }

    #[tokio::test]
    async fn test_calculate_path_for_roots_and_children() {
        let (h, _) = hierarchy().await;

        assert_eq!(h.calculate_path(None).await.unwrap(), "1");
        let root = h.create_location("HQ", None).await.unwrap();
        assert_eq!(root.path, "1");
        assert_eq!(root.level, 0);

        let second_root = h.create_location("Other", None).await.unwrap();
        assert_eq!(second_root.path, "2");

        let a = h.create_location("A", Some(root.id)).await.unwrap();
        let b = h.create_location("B", Some(root.id)).await.unwrap();
        assert_eq!(a.path, "1.1");
        assert_eq!(b.path, "1.2");
        assert_eq!(b.level, 1);

        let deep = h.create_location("B1", Some(b.id)).await.unwrap();
        assert_eq!(deep.path, "1.2.1");
        assert_eq!(deep.level, 2);
    }

    #[tokio::test]
    async fn test_calculate_path_skips_past_highest_segment() {
        let (h, store) = hierarchy().await;
        let root = h.create_location("HQ", None).await.unwrap();
        store
            .insert_location_row("Imported", Some(root.id), "1.7", 1)
            .await
            .unwrap();

        assert_eq!(h.calculate_path(Some(root.id)).await.unwrap(), "1.8");
    }

    #[tokio::test]
    async fn test_descendants_and_ancestors() {
        let (h, _) = hierarchy().await;
        let root = h.create_location("HQ", None).await.unwrap();
        let a = h.create_location("A", Some(root.id)).await.unwrap();
        let a1 = h.create_location("A1", Some(a.id)).await.unwrap();
        let b = h.create_location("B", Some(root.id)).await.unwrap();

        assert!(h.is_descendant_of(a1.id, root.id).await.unwrap());
        assert!(h.is_descendant_of(a1.id, a.id).await.unwrap());
        assert!(h.is_descendant_of(a.id, a.id).await.unwrap());
        assert!(!h.is_descendant_of(b.id, a.id).await.unwrap());
        assert!(!h.is_descendant_of(root.id, a.id).await.unwrap());

        let below_root: Vec<_> = h
            .get_descendants(root.id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(below_root.len(), 3);

        let ancestors: Vec<_> = h
            .get_ancestors(a1.id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ancestors, vec![root.id, a.id]);

        assert_eq!(h.get_parent(a1.id).await.unwrap().unwrap().id, a.id);
        assert!(h.get_parent(root.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_invalidates_ancestor_sets() {
        let (h, _) = hierarchy().await;
        let root = h.create_location("HQ", None).await.unwrap();
        let a = h.create_location("A", Some(root.id)).await.unwrap();

        // Warm the cache, then grow the subtree
        assert_eq!(h.descendant_ids(root.id).await.unwrap().len(), 2);
        let a1 = h.create_location("A1", Some(a.id)).await.unwrap();

        assert!(h.is_descendant_of(a1.id, root.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_uncached_check_sees_fresh_rows() {
        let store = setup_test_db().await;
        let h = LocationHierarchy::new(store.clone(), Arc::new(TtlCache::new(Duration::from_secs(60))));
        let root = h.create_location("HQ", None).await.unwrap();
        h.descendant_ids(root.id).await.unwrap();

        // Written behind the hierarchy's back, so the cached set is stale
        let child = store
            .insert_location_row("Late", Some(root.id), "1.1", 1)
            .await
            .unwrap();

        assert!(!h.is_descendant_of(child.id, root.id).await.unwrap());
        assert!(h.is_descendant_uncached(child.id, root.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_validate_tree_integrity() {
        let (h, store) = hierarchy().await;
        let root = h.create_location("HQ", None).await.unwrap();
        let a = h.create_location("A", Some(root.id)).await.unwrap();
        assert!(h.validate_tree_integrity(root.id).await.is_ok());
        assert!(h.validate_tree_integrity(a.id).await.is_ok());

        let wrong_prefix = store
            .insert_location_row("Stray", Some(root.id), "2.1", 1)
            .await
            .unwrap();
        assert!(matches!(
            h.validate_tree_integrity(wrong_prefix.id).await,
            Err(AppError::Validation(_))
        ));

        let bad_root = store.insert_location_row("Bad", None, "x9", 0).await.unwrap();
        assert!(h.validate_tree_integrity(bad_root.id).await.is_err());

        let bad_level = store
            .insert_location_row("Deep", Some(a.id), "1.1.5", 1)
            .await
            .unwrap();
        assert!(h.validate_tree_integrity(bad_level.id).await.is_err());
    }
}
