//! In-memory [`ObjectStore`] for reconcile tests
//!
//! Objects are held as JSON keyed by kind, namespace and name. The store
//! mimics the API server behaviour the controllers depend on:
//! - resource versions are bumped on every write and stale writes conflict
//! - `update` never touches status and `update_status` never touches spec
//! - uids and generations are assigned like the API server does
//!
//! Failures and racing writers can be injected per kind and operation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use workload_identity_operator::controller::error::{Error, Result};
use workload_identity_operator::store::{ObjectStore, StoreObject, object_key};

/// Store operation, used to target injected failures and count writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Op {
    Get,
    Create,
    Update,
    UpdateStatus,
}

/// Failure returned instead of performing an operation
#[derive(Clone, Debug)]
pub enum Failure {
    Conflict,
    NotFound,
    Transient(&'static str),
}

impl Failure {
    fn into_error(self, key: &str) -> Error {
        match self {
            Failure::Conflict => Error::ConflictError(format!("{} has been modified", key)),
            Failure::NotFound => Error::NotFound(key.to_string()),
            Failure::Transient(msg) => Error::TransientError(msg.to_string()),
        }
    }
}

type ObjectKey = (String, Option<String>, String);
type Racer = Box<dyn FnOnce(&mut Value) + Send>;

struct Injected {
    kind: String,
    op: Op,
    failure: Failure,
    remaining: usize,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    resource_version: u64,
    uid: u64,
    failures: Vec<Injected>,
    racers: Vec<(String, Racer)>,
    writes: BTreeMap<(String, Op), usize>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn take_failure(&mut self, kind: &str, op: Op) -> Option<Failure> {
        let pos = self
            .failures
            .iter()
            .position(|f| f.kind == kind && f.op == op && f.remaining > 0)?;
        let injected = &mut self.failures[pos];
        injected.remaining -= 1;
        let failure = injected.failure.clone();
        if injected.remaining == 0 {
            self.failures.remove(pos);
        }
        Some(failure)
    }

    fn count(&mut self, kind: &str, op: Op) {
        *self.writes.entry((kind.to_string(), op)).or_default() += 1;
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn kind_of<K: StoreObject>() -> String {
    K::kind(&()).to_string()
}

fn key_of<K: StoreObject>(namespace: Option<&str>, name: &str) -> ObjectKey {
    (kind_of::<K>(), namespace.map(str::to_string), name.to_string())
}

fn identity<K: StoreObject>(obj: &K) -> Result<(Option<String>, String)> {
    let meta = obj.meta();
    let name = meta
        .name
        .clone()
        .ok_or(Error::MissingObjectKey("metadata.name"))?;
    Ok((meta.namespace.clone(), name))
}

fn set_meta(value: &mut Value, field: &str, v: Value) {
    if let Some(meta) = value.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert(field.to_string(), v);
    }
}

fn meta_field<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    value.get("metadata").and_then(|m| m.get(field))
}

/// Everything except metadata and status
fn spec_part(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    value
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object directly, bypassing injection and write counting
    pub fn seed<K: StoreObject>(&self, obj: K) -> K {
        let (namespace, name) = identity(&obj).unwrap();
        let mut inner = self.inner.lock().unwrap();
        let mut value = serde_json::to_value(&obj).unwrap();
        inner.uid += 1;
        let uid = format!("uid-{}", inner.uid);
        let rv = inner.next_version();
        if meta_field(&value, "uid").is_none() {
            set_meta(&mut value, "uid", Value::String(uid));
        }
        set_meta(&mut value, "resourceVersion", Value::String(rv));
        if meta_field(&value, "generation").is_none() {
            set_meta(&mut value, "generation", Value::from(1));
        }
        inner
            .objects
            .insert((kind_of::<K>(), namespace, name), value.clone());
        serde_json::from_value(value).unwrap()
    }

    /// Latest stored copy of an object
    pub fn fetch<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(&key_of::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Number of stored objects of a kind
    pub fn len_of<K: StoreObject>(&self) -> usize {
        let kind = kind_of::<K>();
        let inner = self.inner.lock().unwrap();
        inner.objects.keys().filter(|(k, _, _)| *k == kind).count()
    }

    /// Fail the next `times` calls of `op` on kind `K`
    pub fn fail_next<K: StoreObject>(&self, op: Op, failure: Failure, times: usize) {
        self.inner.lock().unwrap().failures.push(Injected {
            kind: kind_of::<K>(),
            op,
            failure,
            remaining: times,
        });
    }

    /// Let another writer change `K`'s status right before the next status
    /// write of that kind lands; the pending write then conflicts
    pub fn race_next_status_write<K, F>(&self, mutate: F)
    where
        K: StoreObject,
        F: FnOnce(&mut K) + Send + 'static,
    {
        let racer: Racer = Box::new(move |value: &mut Value| {
            let mut obj: K = serde_json::from_value(value.clone()).unwrap();
            mutate(&mut obj);
            let updated = serde_json::to_value(&obj).unwrap();
            if let (Some(map), Some(status)) = (value.as_object_mut(), updated.get("status")) {
                map.insert("status".to_string(), status.clone());
            }
        });
        self.inner
            .lock()
            .unwrap()
            .racers
            .push((kind_of::<K>(), racer));
    }

    /// Successful writes of `op` on kind `K`
    pub fn writes_of<K: StoreObject>(&self, op: Op) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .writes
            .get(&(kind_of::<K>(), op))
            .copied()
            .unwrap_or_default()
    }

    /// Successful writes across all kinds and operations
    pub fn total_writes(&self) -> usize {
        self.inner.lock().unwrap().writes.values().sum()
    }

    pub fn reset_writes(&self) {
        self.inner.lock().unwrap().writes.clear();
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get<K: StoreObject>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let object = object_key::<K>(namespace, name);
        let value = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(failure) = inner.take_failure(&kind_of::<K>(), Op::Get) {
                return Err(failure.into_error(&object));
            }
            inner.objects.get(&key_of::<K>(namespace, name)).cloned()
        };

        match value {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Err(Error::NotFound(object)),
        }
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let object = object_key::<K>(namespace.as_deref(), &name);
        let kind = kind_of::<K>();
        let mut inner = self.inner.lock().unwrap();
        if let Some(failure) = inner.take_failure(&kind, Op::Create) {
            return Err(failure.into_error(&object));
        }

        let key = (kind.clone(), namespace, name);
        if inner.objects.contains_key(&key) {
            return Err(Error::ConflictError(format!("{} already exists", object)));
        }

        let mut value = serde_json::to_value(obj)?;
        inner.uid += 1;
        let uid = format!("uid-{}", inner.uid);
        let rv = inner.next_version();
        set_meta(&mut value, "uid", Value::String(uid));
        set_meta(&mut value, "resourceVersion", Value::String(rv));
        set_meta(&mut value, "generation", Value::from(1));
        inner.objects.insert(key, value.clone());
        inner.count(&kind, Op::Create);
        Ok(serde_json::from_value(value)?)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let object = object_key::<K>(namespace.as_deref(), &name);
        let kind = kind_of::<K>();
        let mut inner = self.inner.lock().unwrap();
        if let Some(failure) = inner.take_failure(&kind, Op::Update) {
            return Err(failure.into_error(&object));
        }

        let key = (kind.clone(), namespace, name);
        let Some(stored) = inner.objects.get(&key).cloned() else {
            return Err(Error::NotFound(object));
        };
        let incoming_rv = obj.meta().resource_version.clone();
        if incoming_rv.is_some() && meta_field(&stored, "resourceVersion").and_then(Value::as_str) != incoming_rv.as_deref() {
            return Err(Error::ConflictError(format!("{} has been modified", object)));
        }

        let mut value = serde_json::to_value(obj)?;
        if let Some(map) = value.as_object_mut() {
            match stored.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        for field in ["uid", "creationTimestamp"] {
            if let Some(v) = meta_field(&stored, field) {
                set_meta(&mut value, field, v.clone());
            }
        }
        let generation = meta_field(&stored, "generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if spec_part(&stored) == spec_part(&value) {
            generation
        } else {
            generation + 1
        };
        set_meta(&mut value, "generation", Value::from(generation));
        let rv = inner.next_version();
        set_meta(&mut value, "resourceVersion", Value::String(rv));

        inner.objects.insert(key, value.clone());
        inner.count(&kind, Op::Update);
        Ok(serde_json::from_value(value)?)
    }

    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = identity(obj)?;
        let object = object_key::<K>(namespace.as_deref(), &name);
        let kind = kind_of::<K>();
        let mut inner = self.inner.lock().unwrap();
        if let Some(failure) = inner.take_failure(&kind, Op::UpdateStatus) {
            return Err(failure.into_error(&object));
        }

        let key = (kind.clone(), namespace, name);
        if let Some(pos) = inner.racers.iter().position(|(k, _)| *k == kind) {
            let (_, racer) = inner.racers.remove(pos);
            let rv = inner.next_version();
            if let Some(stored) = inner.objects.get_mut(&key) {
                racer(stored);
                set_meta(stored, "resourceVersion", Value::String(rv));
            }
        }

        let Some(mut stored) = inner.objects.get(&key).cloned() else {
            return Err(Error::NotFound(object));
        };
        let incoming_rv = obj.meta().resource_version.clone();
        if meta_field(&stored, "resourceVersion").and_then(Value::as_str) != incoming_rv.as_deref() {
            return Err(Error::ConflictError(format!("{} has been modified", object)));
        }

        let incoming = serde_json::to_value(obj)?;
        if let Some(map) = stored.as_object_mut() {
            match incoming.get("status") {
                Some(status) => map.insert("status".to_string(), status.clone()),
                None => map.remove("status"),
            };
        }
        let rv = inner.next_version();
        set_meta(&mut stored, "resourceVersion", Value::String(rv));

        inner.objects.insert(key, stored.clone());
        inner.count(&kind, Op::UpdateStatus);
        Ok(serde_json::from_value(stored)?)
    }
}
