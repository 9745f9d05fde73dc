//! An in-process fake broker for tests, grounded on
//! `guts-storage::backend::MemoryBackend`: a single lock-guarded store
//! standing in for the real Redis-compatible wire protocol.

use crate::error::Result;
use crate::traits::{
    Broker, BrokerMessage, SetOptions, StreamEntry, StreamStart, VectorHit,
};
use async_trait::async_trait;
use nexus_types::now_unix_ms;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{broadcast, mpsc};

#[derive(Default)]
struct PendingEntry {
    consumer: String,
    delivered_at_ms: i64,
    delivery_count: u32,
}

#[derive(Default)]
struct GroupState {
    next_index: usize,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
    seq: u64,
}

struct Inner {
    strings: HashMap<String, Vec<u8>>,
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    zsets: HashMap<String, BTreeMap<String, f64>>,
    streams: HashMap<String, StreamState>,
    expirations: HashMap<String, i64>,
    vector_indexes: HashMap<String, (String, String, usize)>,
}

/// In-memory stand-in for a Redis-compatible broker.
///
/// Faithful enough to drive every `nexus-cluster` component under test:
/// consumer-group semantics (pending entry list, idle time, auto-claim),
/// sorted-set range queries, and a single shared pub/sub fan-out so
/// multiple `MemoryBroker` handles backed by the same `Arc` observe each
/// other's publishes (used to simulate a multi-agent cluster in-process).
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    pubsub: broadcast::Sender<BrokerMessage>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                strings: HashMap::new(),
                hashes: HashMap::new(),
                zsets: HashMap::new(),
                streams: HashMap::new(),
                expirations: HashMap::new(),
                vector_indexes: HashMap::new(),
            }),
            pubsub: tx,
        }
    }

    fn check_expired(inner: &mut Inner, key: &str) {
        if let Some(&exp) = inner.expirations.get(key) {
            if now_unix_ms() >= exp {
                inner.strings.remove(key);
                inner.hashes.remove(key);
                inner.zsets.remove(key);
                inner.expirations.remove(key);
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8], opts: SetOptions) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        if opts.nx && inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner.strings.insert(key.to_string(), value.to_vec());
        if let Some(ex) = opts.ex {
            inner
                .expirations
                .insert(key.to_string(), now_unix_ms() + ex as i64 * 1000);
        } else {
            inner.expirations.remove(key);
        }
        Ok(true)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.incrby(key, 1).await
    }

    async fn incrby(&self, key: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        let current = inner
            .strings
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        inner
            .strings
            .insert(key.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        let exists = inner.strings.contains_key(key)
            || inner.hashes.contains_key(key)
            || inner.zsets.contains_key(key);
        if exists {
            inner
                .expirations
                .insert(key.to_string(), now_unix_ms() + seconds as i64 * 1000);
        }
        Ok(exists)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        let existed = inner.strings.remove(key).is_some()
            | inner.hashes.remove(key).is_some()
            | inner.zsets.remove(key).is_some();
        inner.expirations.remove(key);
        Ok(existed)
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        if inner.strings.get(key).map(|v| v.as_slice()) == Some(expected) {
            inner.strings.remove(key);
            inner.expirations.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        Ok(inner
            .expirations
            .get(key)
            .map(|exp| ((exp - now_unix_ms()).max(0)) / 1000))
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn hset_all(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        Ok(inner.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Ok(inner
            .hashes
            .get_mut(key)
            .map(|h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        let entry = inner.hashes.entry(key.to_string()).or_default();
        let current = entry
            .get(field)
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        entry.insert(field.to_string(), next.to_string().into_bytes());
        Ok(next)
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        let hash = inner.hashes.get(key).cloned().unwrap_or_default();
        Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        Ok(inner.zsets.get(key).map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        let mut entries: Vec<(&String, &f64)> =
            inner.zsets.get(key).map(|z| z.iter().collect()).unwrap_or_default();
        entries.sort_by(|a, b| a.1.partial_cmp(b.1).unwrap().then(a.0.cmp(b.0)));
        Ok(slice_range(&entries, start, stop)
            .into_iter()
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let mut forward = self.zrange(key, 0, -1).await?;
        forward.reverse();
        let len = forward.len() as i64;
        let (s, e) = normalize_range(start, stop, len);
        Ok(forward.into_iter().skip(s as usize).take((e - s + 1).max(0) as usize).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Ok(inner
            .zsets
            .get_mut(key)
            .map(|z| z.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut inner = self.inner.lock();
        if let Some(z) = inner.zsets.get_mut(key) {
            let before = z.len();
            z.retain(|_, score| *score < min || *score > max);
            Ok((before - z.len()) as u64)
        } else {
            Ok(0)
        }
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        Ok(inner.zsets.get(key).and_then(|z| z.get(member).copied()))
    }

    async fn zrangebyscore_lt(&self, key: &str, cutoff: f64) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        Self::check_expired(&mut inner, key);
        Ok(inner
            .zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|(_, score)| **score < cutoff)
                    .map(|(m, _)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64> {
        let count = self.pubsub.receiver_count() as i64;
        let _ = self.pubsub.send(BrokerMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        });
        Ok(count)
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<mpsc::UnboundedReceiver<BrokerMessage>> {
        let mut rx = self.pubsub.subscribe();
        let wanted: Vec<String> = channels.to_vec();
        let (tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if wanted.iter().any(|c| c == &msg.channel) && tx.send(msg).is_err() {
                    break;
                }
            }
        });
        Ok(out_rx)
    }

    async fn xadd(&self, stream: &str, fields: &[(&str, Vec<u8>)]) -> Result<String> {
        let mut inner = self.inner.lock();
        let now = now_unix_ms();
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.seq += 1;
        let id = format!("{now}-{}", state.seq);
        state.entries.push(StreamEntry {
            id: id.clone(),
            fields: fields.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect(),
        });
        Ok(id)
    }

    async fn xgroup_create(&self, stream: &str, group: &str, start: StreamStart) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.streams.entry(stream.to_string()).or_default();
        let next_index = match start {
            StreamStart::Beginning => 0,
            StreamStart::NewOnly => state.entries.len(),
        };
        state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                next_index,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn xreadgroup(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, StreamEntry)>> {
        let out = {
            let mut inner = self.inner.lock();
            let now = now_unix_ms();
            let mut out = Vec::new();
            for stream in streams {
                let state = match inner.streams.get_mut(*stream) {
                    Some(s) => s,
                    None => continue,
                };
                let group_state = match state.groups.get_mut(group) {
                    Some(g) => g,
                    None => continue,
                };
                let mut taken = 0;
                while taken < count && group_state.next_index < state.entries.len() {
                    let entry = state.entries[group_state.next_index].clone();
                    group_state.pending.insert(
                        entry.id.clone(),
                        PendingEntry {
                            consumer: consumer.to_string(),
                            delivered_at_ms: now,
                            delivery_count: 1,
                        },
                    );
                    group_state.next_index += 1;
                    out.push(((*stream).to_string(), entry));
                    taken += 1;
                }
                if taken > 0 {
                    break;
                }
            }
            out
        };
        // The real broker parks the connection for up to `block_ms` when
        // nothing is ready; this fake just yields for a bounded slice of it
        // so a polling loop doesn't spin the executor with no entries.
        if out.is_empty() && block_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(block_ms.min(50))).await;
        }
        Ok(out)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Ok(inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Option<Vec<StreamEntry>>> {
        let mut inner = self.inner.lock();
        let now = now_unix_ms();
        let state = match inner.streams.get_mut(stream) {
            Some(s) => s,
            None => return Ok(Some(Vec::new())),
        };
        let entries_by_id: HashMap<String, StreamEntry> =
            state.entries.iter().map(|e| (e.id.clone(), e.clone())).collect();
        let group_state = match state.groups.get_mut(group) {
            Some(g) => g,
            None => return Ok(Some(Vec::new())),
        };
        let mut ids: Vec<String> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now - p.delivered_at_ms >= min_idle_ms as i64)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids.truncate(count);
        let mut reclaimed = Vec::new();
        for id in &ids {
            if let Some(p) = group_state.pending.get_mut(id) {
                p.consumer = consumer.to_string();
                p.delivered_at_ms = now;
                p.delivery_count += 1;
            }
            if let Some(entry) = entries_by_id.get(id) {
                reclaimed.push(entry.clone());
            }
        }
        Ok(Some(reclaimed))
    }

    async fn xpending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn xlen(&self, stream: &str) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner.streams.get(stream).map(|s| s.entries.len() as u64).unwrap_or(0))
    }

    async fn xrevrange(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>> {
        let inner = self.inner.lock();
        let mut entries = inner
            .streams
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default();
        entries.reverse();
        entries.truncate(count);
        Ok(entries)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.hashes.keys())
            .chain(inner.zsets.keys())
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn vector_index_create(
        &self,
        index_name: &str,
        prefix: &str,
        field: &str,
        dims: usize,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.vector_indexes.insert(
            index_name.to_string(),
            (prefix.to_string(), field.to_string(), dims),
        );
        Ok(())
    }

    async fn vector_search(
        &self,
        _index_name: &str,
        _query: &[f32],
        _k: usize,
    ) -> Result<Vec<VectorHit>> {
        // The fake never declares real HNSW support; callers fall back to
        // brute-force scan, matching the reference's degrade-on-missing-module path.
        Err(crate::error::BrokerError::Unavailable(
            "vector search module not loaded",
        ))
    }

    async fn vector_index_info(&self, index_name: &str) -> Result<Option<(usize, u64)>> {
        let inner = self.inner.lock();
        Ok(inner.vector_indexes.get(index_name).map(|(_, _, dims)| (*dims, 0)))
    }
}

fn slice_range<'a, T>(items: &'a [T], start: i64, stop: i64) -> Vec<&'a T> {
    let len = items.len() as i64;
    let (s, e) = normalize_range(start, stop, len);
    if s > e || s >= len {
        return Vec::new();
    }
    items[s as usize..=(e as usize)].iter().collect()
}

fn normalize_range(start: i64, stop: i64, len: i64) -> (i64, i64) {
    let norm = |i: i64| -> i64 {
        if i < 0 {
            (len + i).max(0)
        } else {
            i
        }
    };
    let s = norm(start);
    let e = norm(stop).min(len - 1);
    (s, e)
}

/// Matches a `*`-glob pattern (the only wildcard `SCAN MATCH` uses in this
/// codebase, e.g. `{prefix}agent:*`) against a key.
fn glob_match(pattern: &str, text: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (i, seg) in segments.iter().enumerate() {
        if i == 0 {
            if !rest.starts_with(seg) {
                return false;
            }
            rest = &rest[seg.len()..];
        } else if i == segments.len() - 1 {
            if !rest.ends_with(seg) {
                return false;
            }
        } else if let Some(pos) = rest.find(seg) {
            rest = &rest[pos + seg.len()..];
        } else {
            return false;
        }
    }
    true
}
