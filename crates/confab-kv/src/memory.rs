//! In-memory backend for tests and single-replica local runs.
//!
//! Expiry is enforced lazily on access. Semantics mirror the Redis backend
//! closely enough that the test suite exercises the same code paths as
//! production.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::store::{KvBackend, ListEnd};
use crate::KvResult;

#[derive(Debug, Clone)]
enum Item {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    item: Item,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(item: Item, ex: Option<u64>) -> Self {
        Self {
            item,
            expires_at: ex.map(|secs| Instant::now() + Duration::from_secs(secs)),
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    items: Mutex<HashMap<String, Entry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_items<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> R) -> R {
        let mut items = self.items.lock().unwrap();
        items.retain(|_, entry| !entry.expired());
        f(&mut items)
    }
}

fn list_mut<'a>(items: &'a mut HashMap<String, Entry>, key: &str) -> &'a mut VecDeque<String> {
    let entry = items
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Item::List(VecDeque::new()), None));
    if !matches!(entry.item, Item::List(_)) {
        entry.item = Item::List(VecDeque::new());
    }
    match &mut entry.item {
        Item::List(list) => list,
        _ => unreachable!(),
    }
}

fn hash_mut<'a>(items: &'a mut HashMap<String, Entry>, key: &str) -> &'a mut HashMap<String, String> {
    let entry = items
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Item::Hash(HashMap::new()), None));
    if !matches!(entry.item, Item::Hash(_)) {
        entry.item = Item::Hash(HashMap::new());
    }
    match &mut entry.item {
        Item::Hash(hash) => hash,
        _ => unreachable!(),
    }
}

fn set_mut<'a>(items: &'a mut HashMap<String, Entry>, key: &str) -> &'a mut BTreeSet<String> {
    let entry = items
        .entry(key.to_string())
        .or_insert_with(|| Entry::new(Item::Set(BTreeSet::new()), None));
    if !matches!(entry.item, Item::Set(_)) {
        entry.item = Item::Set(BTreeSet::new());
    }
    match &mut entry.item {
        Item::Set(set) => set,
        _ => unreachable!(),
    }
}

/// Redis is inclusive of the end index, and -1 means "through the end".
fn range_bounds(len: usize, start: i64, end: i64) -> (usize, usize) {
    let resolve = |index: i64| -> i64 {
        if index < 0 {
            len as i64 + index
        } else {
            index
        }
    };
    let start = resolve(start).clamp(0, len as i64) as usize;
    let end = (resolve(end) + 1).clamp(0, len as i64) as usize;
    (start, end.max(start))
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.with_items(|items| match items.get(key) {
            Some(Entry {
                item: Item::Str(value),
                ..
            }) => Some(value.clone()),
            _ => None,
        }))
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        Ok(self.with_items(|items| {
            keys.iter()
                .map(|key| match items.get(key) {
                    Some(Entry {
                        item: Item::Str(value),
                        ..
                    }) => Some(value.clone()),
                    _ => None,
                })
                .collect()
        }))
    }

    async fn set(&self, key: &str, value: String, ex: Option<u64>) -> KvResult<()> {
        self.with_items(|items| {
            items.insert(key.to_string(), Entry::new(Item::Str(value), ex));
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.with_items(|items| {
            items.remove(key);
        });
        Ok(())
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        Ok(self.with_items(|items| items.contains_key(key)))
    }

    async fn expire(&self, key: &str, ex: u64) -> KvResult<bool> {
        Ok(self.with_items(|items| match items.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ex));
                true
            }
            None => false,
        }))
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        Ok(self.with_items(|items| match items.get(key) {
            Some(Entry {
                item: Item::Hash(hash),
                ..
            }) => hash.get(field).cloned(),
            _ => None,
        }))
    }

    async fn hset(&self, key: &str, field: &str, value: String, ex: Option<u64>) -> KvResult<()> {
        self.with_items(|items| {
            hash_mut(items, key).insert(field.to_string(), value);
            if let (Some(ex), Some(entry)) = (ex, items.get_mut(key)) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ex));
            }
        });
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>> {
        Ok(self.with_items(|items| match items.get(key) {
            Some(Entry {
                item: Item::Hash(hash),
                ..
            }) => hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => Vec::new(),
        }))
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<()> {
        self.with_items(|items| {
            if let Some(Entry {
                item: Item::Hash(hash),
                ..
            }) = items.get_mut(key)
            {
                hash.remove(field);
            }
        });
        Ok(())
    }

    async fn lpush(&self, key: &str, value: String, ex: u64) -> KvResult<()> {
        self.with_items(|items| {
            list_mut(items, key).push_front(value);
            if let Some(entry) = items.get_mut(key) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ex));
            }
        });
        Ok(())
    }

    async fn rpush(&self, key: &str, value: String, ex: u64) -> KvResult<()> {
        self.with_items(|items| {
            list_mut(items, key).push_back(value);
            if let Some(entry) = items.get_mut(key) {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ex));
            }
        });
        Ok(())
    }

    async fn lpop(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.with_items(|items| match items.get_mut(key) {
            Some(Entry {
                item: Item::List(list),
                ..
            }) => list.pop_front(),
            _ => None,
        }))
    }

    async fn rpop(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.with_items(|items| match items.get_mut(key) {
            Some(Entry {
                item: Item::List(list),
                ..
            }) => list.pop_back(),
            _ => None,
        }))
    }

    async fn lrange(&self, key: &str, start: i64, end: i64) -> KvResult<Vec<String>> {
        Ok(self.with_items(|items| match items.get(key) {
            Some(Entry {
                item: Item::List(list),
                ..
            }) => {
                let (start, end) = range_bounds(list.len(), start, end);
                list.iter().skip(start).take(end - start).cloned().collect()
            }
            _ => Vec::new(),
        }))
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<()> {
        self.with_items(|items| {
            if let Some(Entry {
                item: Item::List(list),
                ..
            }) = items.get_mut(key)
            {
                if let Some(index) = list.iter().position(|item| item == value) {
                    list.remove(index);
                }
            }
        });
        Ok(())
    }

    async fn lmove(
        &self,
        source_key: &str,
        target_key: &str,
        source_end: ListEnd,
        target_end: ListEnd,
    ) -> KvResult<Option<String>> {
        Ok(self.with_items(|items| {
            let value = match items.get_mut(source_key) {
                Some(Entry {
                    item: Item::List(list),
                    ..
                }) => match source_end {
                    ListEnd::Left => list.pop_front(),
                    ListEnd::Right => list.pop_back(),
                },
                _ => None,
            }?;

            let target = list_mut(items, target_key);
            match target_end {
                ListEnd::Left => target.push_front(value.clone()),
                ListEnd::Right => target.push_back(value.clone()),
            }
            Some(value)
        }))
    }

    async fn sadd(&self, key: &str, value: String) -> KvResult<()> {
        self.with_items(|items| {
            set_mut(items, key).insert(value);
        });
        Ok(())
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        Ok(self.with_items(|items| match items.get(key) {
            Some(Entry {
                item: Item::Set(set),
                ..
            }) => set.iter().cloned().collect(),
            _ => Vec::new(),
        }))
    }

    async fn srem(&self, key: &str, value: &str) -> KvResult<()> {
        self.with_items(|items| {
            if let Some(Entry {
                item: Item::Set(set),
                ..
            }) = items.get_mut(key)
            {
                set.remove(value);
            }
        });
        Ok(())
    }

    async fn smove(&self, source_key: &str, target_key: &str, value: &str) -> KvResult<bool> {
        Ok(self.with_items(|items| {
            let removed = match items.get_mut(source_key) {
                Some(Entry {
                    item: Item::Set(set),
                    ..
                }) => set.remove(value),
                _ => false,
            };
            if removed {
                set_mut(items, target_key).insert(value.to_string());
            }
            removed
        }))
    }

    async fn spop(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.with_items(|items| match items.get_mut(key) {
            Some(Entry {
                item: Item::Set(set),
                ..
            }) => {
                let value = set.iter().next_back().cloned()?;
                set.remove(&value);
                Some(value)
            }
            _ => None,
        }))
    }

    async fn try_lock(&self, key: &str, token: &str, ttl_secs: u64) -> KvResult<bool> {
        Ok(self.with_items(|items| {
            if items.contains_key(key) {
                false
            } else {
                items.insert(
                    key.to_string(),
                    Entry::new(Item::Str(token.to_string()), Some(ttl_secs)),
                );
                true
            }
        }))
    }

    async fn refresh_lock(&self, key: &str, token: &str, ttl_secs: u64) -> KvResult<bool> {
        Ok(self.with_items(|items| match items.get_mut(key) {
            Some(entry) => match &entry.item {
                Item::Str(held) if held == token => {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_secs));
                    true
                }
                _ => false,
            },
            None => false,
        }))
    }

    async fn release_lock(&self, key: &str, token: &str) -> KvResult<bool> {
        Ok(self.with_items(|items| {
            let owned = matches!(
                items.get(key),
                Some(Entry { item: Item::Str(held), .. }) if held == token
            );
            if owned {
                items.remove(key);
            }
            owned
        }))
    }
}
