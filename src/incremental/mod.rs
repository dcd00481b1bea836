//! Incremental multi-unit compilation: content hashing, an import
//! dependency graph, dirty propagation, and a cache with an injectable
//! storage backend. Changing one unit recompiles exactly that unit and
//! its transitive dependents, nothing else.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::bytecode::CodeObject;
use crate::lexer::{lex, Token};
use crate::optimizer::OptLevel;
use crate::CompileError;

/// A registered source file. A changed source produces a new hash; the
/// unit is never mutated into a half-updated state.
#[derive(Debug, Clone)]
struct Unit {
    source: String,
    hash: u64,
    deps: Vec<String>,
    /// Hash of the source this unit was last successfully compiled from.
    compiled_hash: Option<u64>,
}

fn content_hash(source: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    hasher.finish()
}

/// Imports are read straight off the token stream so registration stays
/// cheap; a source that fails to lex simply has no declared imports and
/// reports its error at compile time.
fn scan_imports(source: &str) -> Vec<String> {
    let Ok(tokens) = lex(source) else {
        return Vec::new();
    };
    let mut deps = Vec::new();
    for pair in tokens.windows(2) {
        if let [(Token::Import, _), (Token::Ident(name), _)] = pair {
            if !deps.contains(name) {
                deps.push(name.clone());
            }
        }
    }
    deps
}

// ---- Cache ----

/// Storage backend for compiled artifacts, injected so tests (or an
/// embedder) can run isolated caches. An entry is only valid for the
/// exact `(id, hash)` pair it was stored under.
pub trait CacheStorage {
    fn get(&self, id: &str, hash: u64) -> Option<Arc<CodeObject>>;
    /// Stores under the new hash, superseding any entry for `id`.
    fn put(&self, id: &str, hash: u64, code: Arc<CodeObject>);
    fn len(&self) -> usize;
}

/// Default in-memory backend. The mutex serializes writers per call;
/// superseded hashes are evicted on insert.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (u64, Arc<CodeObject>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache::default()
    }
}

impl CacheStorage for MemoryCache {
    fn get(&self, id: &str, hash: u64) -> Option<Arc<CodeObject>> {
        let entries = self.entries.lock().expect("cache mutex poisoned");
        entries
            .get(id)
            .filter(|(h, _)| *h == hash)
            .map(|(_, code)| Arc::clone(code))
    }

    fn put(&self, id: &str, hash: u64, code: Arc<CodeObject>) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        entries.insert(id.to_string(), (hash, code));
    }

    fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }
}

// ---- Results ----

#[derive(Debug, thiserror::Error)]
#[error("dependency cycle: {}", cycle.join(" -> "))]
pub struct CycleError {
    /// Every unit participating in a cycle, sorted by id.
    pub cycle: Vec<String>,
}

/// What happened to one unit during a compile call.
#[derive(Debug)]
pub enum UnitOutcome {
    /// Rebuilt this call.
    Compiled(Arc<CodeObject>),
    /// Clean; served from the cache untouched.
    Cached(Arc<CodeObject>),
    /// This unit's own pipeline failed.
    Failed(CompileError),
    /// A (transitive) dependency failed or is missing; not silently
    /// skipped.
    Blocked { dependency: String },
}

impl UnitOutcome {
    pub fn code(&self) -> Option<&Arc<CodeObject>> {
        match self {
            UnitOutcome::Compiled(c) | UnitOutcome::Cached(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileStats {
    pub compiled: usize,
    pub cache_hits: usize,
}

#[derive(Debug)]
pub struct CompileReport {
    pub units: HashMap<String, UnitOutcome>,
    pub stats: CompileStats,
}

// ---- Compiler ----

pub struct IncrementalCompiler {
    units: HashMap<String, Unit>,
    cache: Box<dyn CacheStorage>,
    level: OptLevel,
}

impl Default for IncrementalCompiler {
    fn default() -> Self {
        IncrementalCompiler::new()
    }
}

impl IncrementalCompiler {
    pub fn new() -> Self {
        IncrementalCompiler::with_cache(Box::new(MemoryCache::new()))
    }

    pub fn with_cache(cache: Box<dyn CacheStorage>) -> Self {
        IncrementalCompiler { units: HashMap::new(), cache, level: OptLevel::default() }
    }

    pub fn with_opt_level(mut self, level: OptLevel) -> Self {
        self.level = level;
        self
    }

    pub fn cache(&self) -> &dyn CacheStorage {
        self.cache.as_ref()
    }

    /// Register or update units. A source identical to the registered
    /// one is a no-op; a changed source gets a fresh hash and fresh
    /// import list.
    pub fn register_units<I, K, V>(&mut self, units: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (id, source) in units {
            let id = id.into();
            let source = source.into();
            let hash = content_hash(&source);
            match self.units.get_mut(&id) {
                Some(unit) if unit.hash == hash => {}
                Some(unit) => {
                    unit.deps = scan_imports(&source);
                    unit.source = source;
                    unit.hash = hash;
                }
                None => {
                    let deps = scan_imports(&source);
                    self.units.insert(
                        id,
                        Unit { source, hash, deps, compiled_hash: None },
                    );
                }
            }
        }
    }

    /// Register the given sources, then rebuild whatever is dirty.
    pub fn compile_incremental<I, K, V>(&mut self, units: I) -> Result<CompileReport, CycleError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.register_units(units);
        self.compile_all()
    }

    /// Rebuild every dirty registered unit in dependency order. Fails as
    /// a whole — caching nothing — if the import graph has a cycle.
    pub fn compile_all(&mut self) -> Result<CompileReport, CycleError> {
        let order = self.topo_order()?;

        // Dirty propagation along the order: a unit rebuilds when its own
        // content changed or any dependency rebuilt (or is unknown).
        let mut dirty: HashMap<&str, bool> = HashMap::new();
        let mut missing: HashMap<&str, String> = HashMap::new();
        for id in &order {
            let unit = &self.units[id.as_str()];
            let own = unit.compiled_hash != Some(unit.hash);
            let mut is_dirty = own;
            for dep in &unit.deps {
                match self.units.contains_key(dep) {
                    true => is_dirty |= dirty.get(dep.as_str()).copied().unwrap_or(true),
                    false => {
                        missing.insert(id.as_str(), dep.clone());
                    }
                }
            }
            dirty.insert(id.as_str(), is_dirty);
        }

        let mut outcomes: HashMap<String, UnitOutcome> = HashMap::new();
        let mut stats = CompileStats::default();

        for id in &order {
            let unit = self.units[id.as_str()].clone();

            if let Some(dep) = missing.get(id.as_str()) {
                outcomes.insert(id.clone(), UnitOutcome::Blocked { dependency: dep.clone() });
                continue;
            }
            // A failed or blocked dependency blocks its dependents; they
            // are reported, never silently dropped.
            if let Some(dep) = unit.deps.iter().find(|d| {
                matches!(
                    outcomes.get(d.as_str()),
                    Some(UnitOutcome::Failed(_) | UnitOutcome::Blocked { .. })
                )
            }) {
                outcomes.insert(id.clone(), UnitOutcome::Blocked { dependency: dep.clone() });
                continue;
            }

            let clean = !dirty.get(id.as_str()).copied().unwrap_or(true);
            if clean {
                if let Some(code) = self.cache.get(id, unit.hash) {
                    stats.cache_hits += 1;
                    outcomes.insert(id.clone(), UnitOutcome::Cached(code));
                    continue;
                }
                // Entry evicted behind our back; fall through and rebuild.
            }

            match crate::compile_with(&unit.source, self.level) {
                Ok(code) => {
                    let code = Arc::new(code);
                    self.cache.put(id, unit.hash, Arc::clone(&code));
                    if let Some(u) = self.units.get_mut(id.as_str()) {
                        u.compiled_hash = Some(unit.hash);
                    }
                    stats.compiled += 1;
                    outcomes.insert(id.clone(), UnitOutcome::Compiled(code));
                }
                Err(err) => {
                    if let Some(u) = self.units.get_mut(id.as_str()) {
                        u.compiled_hash = None;
                    }
                    outcomes.insert(id.clone(), UnitOutcome::Failed(err));
                }
            }
        }

        Ok(CompileReport { units: outcomes, stats })
    }

    /// Kahn's algorithm over every registered unit, deterministic by id.
    /// Unregistered imports carry no edge here; they surface as blocked
    /// units during compilation.
    fn topo_order(&self) -> Result<Vec<String>, CycleError> {
        let mut ids: Vec<&String> = self.units.keys().collect();
        ids.sort();

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for id in &ids {
            in_degree.entry(id.as_str()).or_insert(0);
            for dep in &self.units[id.as_str()].deps {
                if self.units.contains_key(dep) {
                    *in_degree.entry(id.as_str()).or_insert(0) += 1;
                    dependents.entry(dep.as_str()).or_default().push(id.as_str());
                }
            }
        }

        let mut ready: Vec<&str> = ids
            .iter()
            .filter(|id| in_degree[id.as_str()] == 0)
            .map(|id| id.as_str())
            .collect();
        let mut order = Vec::with_capacity(ids.len());

        while let Some(id) = ready.pop() {
            order.push(id.to_string());
            for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                let d = in_degree.get_mut(dependent).expect("dependent was registered");
                *d -= 1;
                if *d == 0 {
                    ready.push(dependent);
                }
            }
            ready.sort();
        }

        if order.len() < ids.len() {
            let mut cycle: Vec<String> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            cycle.sort();
            return Err(CycleError { cycle });
        }
        Ok(order)
    }
}
