use futures::{future::BoxFuture, FutureExt};
use serde_json::{Map, Value};

use super::{notify, Inner, LocalBroker};
use crate::broker::{same_callback, BrokerError, DataCallback, RecordHandle, RecordKind};

pub(super) fn empty(kind: RecordKind) -> Value {
    match kind {
        RecordKind::Record => Value::Object(Map::new()),
        RecordKind::List => Value::Array(vec![]),
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub(super) fn read(value: &Value, path: Option<&str>) -> Value {
    match path {
        None => value.clone(),
        Some(path) => lookup(value, path).cloned().unwrap_or(Value::Null),
    }
}

pub(super) fn write(target: &mut Value, path: Option<&str>, value: Value) {
    let Some(path) = path else {
        *target = value;
        return;
    };
    let mut slot = target;
    for key in path.split('.') {
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(map) = slot else {
            return;
        };
        slot = map.entry(key).or_insert(Value::Null);
    }
    *slot = value;
}

pub(super) struct LocalRecord {
    pub(super) broker: LocalBroker,
    pub(super) id: u64,
    pub(super) name: String,
    pub(super) kind: RecordKind,
}

impl LocalRecord {
    fn value(inner: &Inner, name: &str, kind: RecordKind) -> Value {
        inner.records.get(name).cloned().unwrap_or_else(|| empty(kind))
    }
}

impl RecordHandle for LocalRecord {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RecordKind {
        self.kind
    }

    fn subscribe(&self, path: Option<&str>, callback: DataCallback, now: bool) {
        let mut inner = self.broker.lock();
        let current = Self::value(&inner, &self.name, self.kind);
        let Some(handle) = inner.handles.get_mut(&self.id) else {
            return;
        };
        handle
            .subscriptions
            .push((path.map(str::to_string), callback.clone()));
        drop(inner);

        if now {
            callback(read(&current, path));
        }
    }

    fn unsubscribe(&self, callback: &DataCallback) {
        if let Some(handle) = self.broker.lock().handles.get_mut(&self.id) {
            handle
                .subscriptions
                .retain(|(_, cb)| !same_callback(cb, callback));
        }
    }

    fn get(&self, path: Option<&str>) -> Value {
        let inner = self.broker.lock();
        read(&Self::value(&inner, &self.name, self.kind), path)
    }

    fn set(&self, path: Option<&str>, value: Value) {
        let mut inner = self.broker.lock();
        if !inner.handles.contains_key(&self.id) {
            log::warn!("Dropping write to discarded record {}", self.name);
            return;
        }
        let notifications = inner.write_record(&self.name, path, value);
        drop(inner);
        notify(notifications);
    }

    fn when_ready(&self) -> BoxFuture<'static, Result<Value, BrokerError>> {
        let inner = self.broker.lock();
        let res = if inner.handles.contains_key(&self.id) {
            Ok(Self::value(&inner, &self.name, self.kind))
        } else {
            Err(BrokerError::Record(self.name.clone()))
        };
        futures::future::ready(res).boxed()
    }

    fn discard(&self) {
        let mut inner = self.broker.lock();
        if inner.handles.remove(&self.id).is_some() {
            inner.check_interest(&self.broker, &self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        local::testing::{open, recorder},
        BrokerSession,
    };
    use serde_json::json;

    #[test]
    fn path_writes_create_intermediate_objects() {
        let mut value = Value::Null;
        write(&mut value, Some("a.b"), json!(1));
        assert_eq!(value, json!({"a": {"b": 1}}));
        assert_eq!(read(&value, Some("a.b")), json!(1));
        assert_eq!(read(&value, Some("a.c")), Value::Null);
        assert_eq!(read(&json!({"xs": [4, 5]}), Some("xs.1")), json!(5));
    }

    #[test]
    fn subscribers_see_changes_on_their_path_only() {
        let broker = LocalBroker::new();
        let (mut session, _rx) = open(&broker, "a");
        let record = session.record("plants/basil", RecordKind::Record);

        let (whole, whole_seen) = recorder();
        let (moisture, moisture_seen) = recorder();
        record.subscribe(None, whole.clone(), false);
        record.subscribe(Some("moisture"), moisture, true);
        assert_eq!(*moisture_seen.lock().unwrap(), vec![Value::Null]);

        broker.set("plants/basil", Some("temp"), json!(21));
        record.set(Some("moisture"), json!(40));
        assert_eq!(whole_seen.lock().unwrap().len(), 2);
        assert_eq!(moisture_seen.lock().unwrap().last(), Some(&json!(40)));

        record.unsubscribe(&whole);
        broker.set("plants/basil", None, json!({}));
        assert_eq!(whole_seen.lock().unwrap().len(), 2);
        assert_eq!(broker.subscriber_count("plants/basil"), 1);
    }

    #[test]
    fn discarded_handle_drops_writes_and_readiness() {
        let broker = LocalBroker::new();
        let (mut session, _rx) = open(&broker, "a");
        let record = session.record("lights", RecordKind::Record);
        record.discard();

        record.set(None, json!({"on": true}));
        assert_eq!(broker.get("lights"), None);
        assert!(record.when_ready().now_or_never().unwrap().is_err());
    }
}
