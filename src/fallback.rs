//! Cache-first, then per-service handler, then rule chain.
//!
//! Cache keys use a stable structural hash (FNV-1a over a canonical
//! `serde_json::Value` encoding of `(method, payload)`), resolving spec.md
//! §9's open question: the original's `hash(str(request))` is not portable
//! across processes; `std::collections::hash_map::DefaultHasher` isn't
//! either (it's keyed by a process-random `RandomState`).

use crate::telemetry::{emit_best_effort, FabricEvent, FallbackEvent, NullSink, TelemetrySink};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Deterministic FNV-1a hash of `(method, payload)`, stable across processes
/// and platforms.
pub fn stable_key(method: &str, payload: &serde_json::Value) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for &b in bytes {
            hash ^= b as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };

    feed(method.as_bytes());
    feed(b"\0");
    // serde_json's Value Display / to_string is not guaranteed stable across
    // arbitrary maps, but our canonical form sorts object keys first.
    let canonical = canonicalize(payload);
    feed(canonical.to_string().as_bytes());
    hash
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    created_ts: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_ts) > self.ttl
    }
}

/// TTL cache keyed by `(method, stable-hash(payload))`, creation-time LRU
/// eviction at `max_size`, lazy expiration on read.
pub struct FallbackCache {
    max_size: usize,
    entries: Mutex<HashMap<u64, CacheEntry>>,
    insertion_order: Mutex<Vec<u64>>,
}

impl FallbackCache {
    pub fn new(max_size: usize) -> Self {
        Self { max_size: max_size.max(1), entries: Mutex::new(HashMap::new()), insertion_order: Mutex::new(Vec::new()) }
    }

    pub fn set(&self, method: &str, payload: &serde_json::Value, value: serde_json::Value, ttl: Duration) {
        let key = stable_key(method, payload);
        let mut entries = self.entries.lock().unwrap();
        let mut order = self.insertion_order.lock().unwrap();

        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            if let Some(oldest) = order.first().copied() {
                entries.remove(&oldest);
                order.remove(0);
            }
        }
        if !entries.contains_key(&key) {
            order.push(key);
        }
        entries.insert(key, CacheEntry { value, created_ts: Instant::now(), ttl });
    }

    pub fn get(&self, method: &str, payload: &serde_json::Value) -> Option<serde_json::Value> {
        let key = stable_key(method, payload);
        let entries = self.entries.lock().unwrap();
        match entries.get(&key) {
            Some(entry) if !entry.expired(Instant::now()) => Some(entry.value.clone()),
            _ => None,
        }
    }
}

/// Degraded response returned by a service handler or rule match.
pub type DegradedResponse = serde_json::Value;

/// Per-service handler: maps a method name to a canned degraded response.
pub trait ServiceHandler: Send + Sync {
    fn handle(&self, method: &str) -> Option<DegradedResponse>;
}

/// Built-in handlers for the three backend services named in spec.md §4.5.
pub struct BuiltinServiceHandler {
    service: String,
}

impl BuiltinServiceHandler {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }
}

impl ServiceHandler for BuiltinServiceHandler {
    fn handle(&self, method: &str) -> Option<DegradedResponse> {
        match (self.service.as_str(), method) {
            (_, "health") => Some(serde_json::json!({ "status": "Degraded" })),
            ("planner", "plan") => Some(serde_json::json!({ "steps": [{ "placeholder": true }] })),
            ("analyst", "analyze") => Some(serde_json::json!({ "findings": [] })),
            ("executor", "execute") => Some(serde_json::json!({ "error": "execution unavailable", "exit_code": -1 })),
            _ => None,
        }
    }
}

/// Ordered `(substring, handler)` rule chain; first match wins.
pub struct RuleChain {
    rules: Vec<(String, Box<dyn Fn(&str) -> Option<DegradedResponse> + Send + Sync>)>,
}

impl Default for RuleChain {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleChain {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(
        mut self,
        substring: impl Into<String>,
        handler: impl Fn(&str) -> Option<DegradedResponse> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push((substring.into(), Box::new(handler)));
        self
    }

    fn resolve(&self, method: &str) -> Option<DegradedResponse> {
        self.rules.iter().find(|(substring, _)| method.contains(substring.as_str())).and_then(|(_, h)| h(method))
    }
}

/// Cache-first, then per-service handler, then rule chain. Returns `None`
/// (surface the original failure) if nothing resolves.
pub struct FallbackRegistry<Sink = NullSink> {
    cache: FallbackCache,
    handlers: HashMap<String, Box<dyn ServiceHandler>>,
    rules: RuleChain,
    sink: Sink,
}

impl FallbackRegistry<NullSink> {
    pub fn new(cache_max_size: usize) -> Self {
        Self { cache: FallbackCache::new(cache_max_size), handlers: HashMap::new(), rules: RuleChain::new(), sink: NullSink }
    }
}

impl<Sink> FallbackRegistry<Sink> {
    pub fn with_sink<NewSink>(self, sink: NewSink) -> FallbackRegistry<NewSink> {
        FallbackRegistry { cache: self.cache, handlers: self.handlers, rules: self.rules, sink }
    }

    pub fn register_handler(mut self, service: impl Into<String>, handler: impl ServiceHandler + 'static) -> Self {
        self.handlers.insert(service.into(), Box::new(handler));
        self
    }

    pub fn with_rules(mut self, rules: RuleChain) -> Self {
        self.rules = rules;
        self
    }

    pub fn cache(&self) -> &FallbackCache {
        &self.cache
    }
}

impl<Sink> FallbackRegistry<Sink>
where
    Sink: TelemetrySink + Clone + Send + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub async fn resolve(&self, service: &str, method: &str, payload: &serde_json::Value) -> Option<DegradedResponse> {
        if let Some(cached) = self.cache.get(method, payload) {
            self.emit(FabricEvent::Fallback(FallbackEvent::CacheHit { method: method.to_string() })).await;
            return Some(cached);
        }

        if let Some(handler) = self.handlers.get(service) {
            if let Some(response) = handler.handle(method) {
                self.emit(FabricEvent::Fallback(FallbackEvent::HandlerMatched {
                    service: service.to_string(),
                    method: method.to_string(),
                }))
                .await;
                return Some(response);
            }
        }

        if let Some(response) = self.rules.resolve(method) {
            self.emit(FabricEvent::Fallback(FallbackEvent::RuleMatched { method: method.to_string() })).await;
            return Some(response);
        }

        self.emit(FabricEvent::Fallback(FallbackEvent::Exhausted { method: method.to_string() })).await;
        None
    }

    async fn emit(&self, event: FabricEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}
