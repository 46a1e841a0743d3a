use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{ID_FIELD, StudentId};
use crate::pipeline::Pipeline;
use crate::query::{self, Projection, Query};
use crate::update;

/// The document collection the service runs against.
///
/// Filters, projections, updates and pipelines are passed in the store's
/// native JSON syntax. Every single-document write is atomic; nothing spans
/// more than one document.
pub trait Store: Send + Sync {
    fn exists(&self, id: StudentId) -> Result<bool>;

    /// Insert a new document. Fails with `Conflict` if its id is taken.
    fn insert(&self, doc: Value) -> Result<()>;

    fn find(&self, filter: &Value, projection: Option<&Value>) -> Result<Vec<Value>>;

    fn find_one(&self, filter: &Value, projection: Option<&Value>) -> Result<Option<Value>> {
        Ok(self.find(filter, projection)?.into_iter().next())
    }

    /// Apply `update` to every matching document. Returns the matched count.
    fn update(&self, filter: &Value, update: &Value) -> Result<u64>;

    /// Delete every matching document and return the deleted documents.
    fn find_and_delete(&self, filter: &Value) -> Result<Vec<Value>>;

    fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>>;
}

impl<S: Store + ?Sized> Store for Arc<S> {
    fn exists(&self, id: StudentId) -> Result<bool> {
        (**self).exists(id)
    }

    fn insert(&self, doc: Value) -> Result<()> {
        (**self).insert(doc)
    }

    fn find(&self, filter: &Value, projection: Option<&Value>) -> Result<Vec<Value>> {
        (**self).find(filter, projection)
    }

    fn update(&self, filter: &Value, update: &Value) -> Result<u64> {
        (**self).update(filter, update)
    }

    fn find_and_delete(&self, filter: &Value) -> Result<Vec<Value>> {
        (**self).find_and_delete(filter)
    }

    fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>> {
        (**self).aggregate(pipeline)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// A single in-memory collection keyed by the integer `id` field.
///
/// Thread-safe: readers share a `RwLock`, writers hold it exclusively, so
/// each call observes and produces a consistent collection.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<StudentId, Value>>,
}

fn key_of(doc: &Value) -> Result<StudentId> {
    if !doc.is_object() {
        return Err(Error::NotAnObject);
    }
    doc.get(ID_FIELD)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::QuerySyntax(format!("document requires an integer '{ID_FIELD}'")))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<StudentId, Value>>> {
        self.docs
            .read()
            .map_err(|_| Error::StoreUnavailable("collection lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<StudentId, Value>>> {
        self.docs
            .write()
            .map_err(|_| Error::StoreUnavailable("collection lock poisoned".into()))
    }

    fn matching_ids(docs: &BTreeMap<StudentId, Value>, query: &Query) -> Vec<StudentId> {
        docs.iter()
            .filter(|(_, doc)| query::matches_value(query, doc))
            .map(|(&id, _)| id)
            .collect()
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Leave the collection lock poisoned by panicking while holding it.
    pub(crate) fn poison(&self) {
        let _ = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = self.docs.write();
                panic!("writer died holding the collection lock");
            })
            .join()
        });
    }
}

impl Store for MemoryStore {
    fn exists(&self, id: StudentId) -> Result<bool> {
        Ok(self.read()?.contains_key(&id))
    }

    fn insert(&self, doc: Value) -> Result<()> {
        let id = key_of(&doc)?;
        let mut docs = self.write()?;
        if docs.contains_key(&id) {
            return Err(Error::Conflict(id));
        }
        docs.insert(id, doc);
        Ok(())
    }

    fn find(&self, filter: &Value, projection: Option<&Value>) -> Result<Vec<Value>> {
        let query = query::parse_query(filter)?;
        let projection = projection.map(Projection::parse).transpose()?;
        let docs = self.read()?;
        Ok(docs
            .values()
            .filter(|doc| query::matches_value(&query, doc))
            .map(|doc| match &projection {
                Some(p) => p.apply(doc),
                None => doc.clone(),
            })
            .collect())
    }

    fn update(&self, filter: &Value, update: &Value) -> Result<u64> {
        let query = query::parse_query(filter)?;
        let mut docs = self.write()?;
        let ids = Self::matching_ids(&docs, &query);

        // Apply to copies first so a failing operator leaves nothing half-updated
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = docs.get(&id) {
                let mut doc = doc.clone();
                update::apply_update(&mut doc, update)?;
                updated.push((id, doc));
            }
        }
        let count = updated.len() as u64;
        docs.extend(updated);
        Ok(count)
    }

    fn find_and_delete(&self, filter: &Value) -> Result<Vec<Value>> {
        let query = query::parse_query(filter)?;
        let mut docs = self.write()?;
        let ids = Self::matching_ids(&docs, &query);
        Ok(ids.into_iter().filter_map(|id| docs.remove(&id)).collect())
    }

    fn aggregate(&self, pipeline: &Value) -> Result<Vec<Value>> {
        let pipeline = Pipeline::parse(pipeline)?;
        let (leading_match, start_idx) = pipeline.take_leading_match();

        let initial_docs: Vec<Value> = {
            let docs = self.read()?;
            docs.values()
                .filter(|doc| leading_match.is_none_or(|q| query::matches_value(q, doc)))
                .cloned()
                .collect()
        };

        Ok(pipeline.execute_from(start_idx, initial_docs))
    }
}
