//! Instance map keyed by caller-chosen id.

use std::collections::BTreeMap;

/// Something that can be created on first use of an id.
pub trait RegistryEntry {
    fn create(instance_id: &str) -> Self;
}

/// Instances of one role. Only reachable through the locked
/// [`BackendState`](super::BackendState), so every call happens under the
/// context mutex.
#[derive(Debug)]
pub struct InstanceRegistry<T> {
    entries: BTreeMap<String, T>,
}

impl<T> Default for InstanceRegistry<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: RegistryEntry> InstanceRegistry<T> {
    /// Return the instance for `id`, creating it if unseen.
    pub fn get_or_create(&mut self, id: &str) -> &mut T {
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| T::create(id))
    }
}

impl<T> InstanceRegistry<T> {
    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut T> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.entries.remove(id)
    }

    /// Instances ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(id, inst)| (id.as_str(), inst))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Counter {
        id: String,
        hits: u32,
    }

    impl RegistryEntry for Counter {
        fn create(instance_id: &str) -> Self {
            Counter {
                id: instance_id.to_string(),
                hits: 0,
            }
        }
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let mut registry = InstanceRegistry::<Counter>::default();
        registry.get_or_create("a").hits += 1;
        registry.get_or_create("a").hits += 1;

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").map(|c| c.hits), Some(2));
        assert_eq!(registry.get("a").map(|c| c.id.as_str()), Some("a"));
    }

    #[test]
    fn test_remove_then_get_is_none() {
        let mut registry = InstanceRegistry::<Counter>::default();
        registry.get_or_create("a");
        assert!(registry.remove("a").is_some());
        assert!(registry.get("a").is_none());
        assert!(registry.remove("a").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_iter_is_ordered_by_id() {
        let mut registry = InstanceRegistry::<Counter>::default();
        for id in ["c", "a", "b"] {
            registry.get_or_create(id);
        }
        let ids: Vec<&str> = registry.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
