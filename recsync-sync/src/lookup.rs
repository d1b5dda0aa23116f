//! Mapping and dependency lookups injected into the sync loop, with the
//! store-backed implementations and per-run memoization.

use std::cell::RefCell;
use std::collections::HashMap;

use recsync_core::{JobConfig, JobId, RecordKey};
use recsync_store::{MappingStore, RecordStore};

use crate::error::UnitError;

/// `(map_type, key) -> remote id`.
pub trait MappingLookup {
    /// A missing mapping is `Ok(None)` unless `required`, then `MappingMissing`.
    fn lookup(&self, map_type: &str, key: &str, required: bool) -> Result<Option<String>, UnitError>;
}

/// Remote id of an entity owned by another job, if it has been synced.
pub trait DependencyLookup {
    fn remote_id(&self, entity: &JobId, key: &RecordKey) -> Result<Option<String>, UnitError>;
}

pub struct StoreMappings<'a> {
    store: &'a dyn MappingStore,
}

impl<'a> StoreMappings<'a> {
    pub fn new(store: &'a dyn MappingStore) -> Self {
        Self { store }
    }
}

impl MappingLookup for StoreMappings<'_> {
    fn lookup(&self, map_type: &str, key: &str, required: bool) -> Result<Option<String>, UnitError> {
        match self.store.get_mapping(map_type, key)? {
            Some(mapping) => Ok(Some(mapping.remote_id)),
            None if required => Err(UnitError::MappingMissing {
                map_type: map_type.to_owned(),
                key: key.to_owned(),
            }),
            None => Ok(None),
        }
    }
}

/// Resolves against the dependency job's own table: newest row with the
/// key in its grouping column and a non-sentinel remote id.
pub struct StoreDependencies<'a> {
    records: &'a dyn RecordStore,
    jobs: &'a [JobConfig],
}

impl<'a> StoreDependencies<'a> {
    pub fn new(records: &'a dyn RecordStore, jobs: &'a [JobConfig]) -> Self {
        Self { records, jobs }
    }
}

impl DependencyLookup for StoreDependencies<'_> {
    fn remote_id(&self, entity: &JobId, key: &RecordKey) -> Result<Option<String>, UnitError> {
        let Some(job) = self.jobs.iter().find(|job| &job.id == entity) else {
            return Err(UnitError::Store(format!("no job '{entity}' to resolve dependency")));
        };
        Ok(self
            .records
            .latest_remote_id(&job.table, job.table.grouping_key(), key)?)
    }
}

/// Caches successful lookups for the lifetime of one run. Errors are not cached.
pub struct Memoized<L> {
    inner: L,
    mappings: RefCell<HashMap<(String, String), Option<String>>>,
    dependencies: RefCell<HashMap<(JobId, RecordKey), Option<String>>>,
}

impl<L> Memoized<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            mappings: RefCell::default(),
            dependencies: RefCell::default(),
        }
    }
}

impl<L: MappingLookup> MappingLookup for Memoized<L> {
    fn lookup(&self, map_type: &str, key: &str, required: bool) -> Result<Option<String>, UnitError> {
        let cache_key = (map_type.to_owned(), key.to_owned());
        let cached = self.mappings.borrow().get(&cache_key).cloned();
        let value = match cached {
            Some(value) => value,
            None => {
                let value = self.inner.lookup(map_type, key, false)?;
                self.mappings.borrow_mut().insert(cache_key, value.clone());
                value
            }
        };
        match value {
            None if required => Err(UnitError::MappingMissing {
                map_type: map_type.to_owned(),
                key: key.to_owned(),
            }),
            value => Ok(value),
        }
    }
}

impl<L: DependencyLookup> DependencyLookup for Memoized<L> {
    fn remote_id(&self, entity: &JobId, key: &RecordKey) -> Result<Option<String>, UnitError> {
        let cache_key = (entity.clone(), key.clone());
        if let Some(hit) = self.dependencies.borrow().get(&cache_key) {
            return Ok(hit.clone());
        }
        let value = self.inner.remote_id(entity, key)?;
        self.dependencies.borrow_mut().insert(cache_key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct Counting {
        calls: Cell<usize>,
    }

    impl MappingLookup for Counting {
        fn lookup(&self, _: &str, key: &str, _: bool) -> Result<Option<String>, UnitError> {
            self.calls.set(self.calls.get() + 1);
            Ok((key == "R").then(|| "100".to_owned()))
        }
    }

    impl DependencyLookup for Counting {
        fn remote_id(&self, _: &JobId, key: &RecordKey) -> Result<Option<String>, UnitError> {
            self.calls.set(self.calls.get() + 1);
            Ok((key == &RecordKey::Int(7)).then(|| "p7".to_owned()))
        }
    }

    #[test]
    fn memoizes_hits_and_misses() {
        let memo = Memoized::new(Counting { calls: Cell::new(0) });
        assert_eq!(memo.lookup("color", "R", true).expect("hit"), Some("100".into()));
        assert_eq!(memo.lookup("color", "R", true).expect("hit"), Some("100".into()));
        assert_eq!(memo.lookup("color", "G", false).expect("miss"), None);
        assert!(matches!(
            memo.lookup("color", "G", true),
            Err(UnitError::MappingMissing { .. })
        ));
        assert_eq!(memo.inner.calls.get(), 2);
    }

    #[test]
    fn memoizes_dependencies() {
        let memo = Memoized::new(Counting { calls: Cell::new(0) });
        let people = JobId::from("people");
        assert_eq!(memo.remote_id(&people, &RecordKey::Int(7)).expect("dep"), Some("p7".into()));
        assert_eq!(memo.remote_id(&people, &RecordKey::Int(7)).expect("dep"), Some("p7".into()));
        assert_eq!(memo.remote_id(&people, &RecordKey::Int(8)).expect("dep"), None);
        assert_eq!(memo.inner.calls.get(), 2);
    }
}
