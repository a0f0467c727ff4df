use models::Backend;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Error is a reason why a pool operation was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("backend {0:?} is already registered")]
    Duplicate(String),
    #[error("backend is missing a required {0} field")]
    MissingField(&'static str),
    #[error("backend {0:?} is not registered")]
    NotFound(String),
    #[error("refusing to remove the last backend of the pool")]
    LastBackend,
    #[error("no backend matches architecture {0:?}")]
    NoArchMatch(String),
    #[error("no {arch} backend matches selector {selector:?}")]
    NoSelectorMatch {
        arch: String,
        selector: BTreeMap<String, String>,
    },
}

/// BackendPool is the dynamic set of worker endpoints the scheduler may
/// dispatch to.
///
/// Backends are kept in insertion order so that per-arch round-robin
/// rotation is stable for the lifetime of the process. Removal of a
/// backend which still has running jobs is tolerated: the pool carries
/// no job state, and an executor stream against a vanished worker fails
/// like any other executor error.
pub struct BackendPool {
    inner: Mutex<Inner>,
}

struct Inner {
    backends: Vec<Backend>,
    // Round-robin cursor, keyed by arch so selections for different
    // architectures don't interfere.
    counters: HashMap<String, u64>,
}

impl BackendPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                backends: Vec::new(),
                counters: HashMap::new(),
            }),
        }
    }

    /// Build a pool pre-seeded with `backends`, validating each.
    pub fn with_backends<I>(backends: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = Backend>,
    {
        let pool = Self::new();
        for backend in backends {
            pool.add(backend)?;
        }
        Ok(pool)
    }

    /// Register a backend. The address and architecture are required,
    /// and the address must not already be registered.
    pub fn add(&self, backend: Backend) -> Result<(), Error> {
        if backend.addr.is_empty() {
            return Err(Error::MissingField("addr"));
        }
        if backend.arch.is_empty() {
            return Err(Error::MissingField("arch"));
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.backends.iter().any(|b| b.addr == backend.addr) {
            return Err(Error::Duplicate(backend.addr));
        }
        tracing::info!(addr = %backend.addr, arch = %backend.arch, "registered backend");
        inner.backends.push(backend);
        Ok(())
    }

    /// Deregister the backend at `addr`. Refuses to leave the pool
    /// empty; teardown is done by replacing the pool, not draining it.
    pub fn remove(&self, addr: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner
            .backends
            .iter()
            .position(|b| b.addr == addr)
            .ok_or_else(|| Error::NotFound(addr.to_string()))?;
        if inner.backends.len() == 1 {
            return Err(Error::LastBackend);
        }
        let removed = inner.backends.remove(index);
        tracing::info!(addr = %removed.addr, arch = %removed.arch, "removed backend");
        Ok(())
    }

    /// Snapshot of every registered backend, in insertion order.
    pub fn list(&self) -> Vec<Backend> {
        self.inner.lock().unwrap().backends.clone()
    }

    /// Snapshot of the backends tagged with `arch`.
    pub fn list_by_arch(&self, arch: &str) -> Vec<Backend> {
        self.inner
            .lock()
            .unwrap()
            .backends
            .iter()
            .filter(|b| b.arch == arch)
            .cloned()
            .collect()
    }

    /// Sorted, de-duplicated set of registered architectures.
    pub fn architectures(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut archs: Vec<String> = inner.backends.iter().map(|b| b.arch.clone()).collect();
        archs.sort();
        archs.dedup();
        archs
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select a backend for `arch` whose labels satisfy every entry of
    /// `selector`, rotating round-robin among the survivors.
    pub fn select(
        &self,
        arch: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Backend, Error> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let by_arch: Vec<&Backend> = inner.backends.iter().filter(|b| b.arch == arch).collect();
        if by_arch.is_empty() {
            return Err(Error::NoArchMatch(arch.to_string()));
        }
        let survivors: Vec<&Backend> = by_arch
            .into_iter()
            .filter(|b| b.matches_selector(selector))
            .collect();
        if survivors.is_empty() {
            return Err(Error::NoSelectorMatch {
                arch: arch.to_string(),
                selector: selector.clone(),
            });
        }

        let counter = inner.counters.entry(arch.to_string()).or_insert(0);
        let chosen = survivors[(*counter % survivors.len() as u64) as usize].clone();
        *counter += 1;
        Ok(chosen)
    }
}

impl Default for BackendPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn backend(addr: &str, arch: &str) -> Backend {
        Backend {
            addr: addr.to_string(),
            arch: arch.to_string(),
            labels: BTreeMap::new(),
        }
    }

    fn labeled(addr: &str, arch: &str, labels: &[(&str, &str)]) -> Backend {
        Backend {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..backend(addr, arch)
        }
    }

    #[test]
    fn add_validates_and_rejects_duplicates() {
        let pool = BackendPool::new();
        assert_eq!(
            pool.add(backend("", "x86_64")),
            Err(Error::MissingField("addr"))
        );
        assert_eq!(
            pool.add(backend("http://w1:9090", "")),
            Err(Error::MissingField("arch"))
        );

        pool.add(backend("http://w1:9090", "x86_64")).unwrap();
        assert_eq!(
            pool.add(backend("http://w1:9090", "aarch64")),
            Err(Error::Duplicate("http://w1:9090".to_string()))
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn remove_refuses_last_backend() {
        let pool = BackendPool::with_backends([
            backend("http://w1:9090", "x86_64"),
            backend("http://w2:9090", "x86_64"),
        ])
        .unwrap();

        assert_eq!(
            pool.remove("http://w9:9090"),
            Err(Error::NotFound("http://w9:9090".to_string()))
        );
        pool.remove("http://w1:9090").unwrap();
        assert_eq!(pool.remove("http://w2:9090"), Err(Error::LastBackend));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn architectures_are_sorted_and_unique() {
        let pool = BackendPool::with_backends([
            backend("http://w1:9090", "x86_64"),
            backend("http://w2:9090", "aarch64"),
            backend("http://w3:9090", "x86_64"),
        ])
        .unwrap();
        assert_eq!(pool.architectures(), vec!["aarch64", "x86_64"]);
        assert_eq!(pool.list_by_arch("x86_64").len(), 2);
        assert_eq!(pool.list_by_arch("riscv64").len(), 0);
    }

    #[test]
    fn round_robin_visits_each_backend_evenly() {
        let pool = BackendPool::with_backends([
            backend("http://w1:9090", "x86_64"),
            backend("http://w2:9090", "x86_64"),
            backend("http://w3:9090", "x86_64"),
        ])
        .unwrap();

        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut order = Vec::new();
        for _ in 0..9 {
            let chosen = pool.select("x86_64", &BTreeMap::new()).unwrap();
            *counts.entry(chosen.addr.clone()).or_default() += 1;
            order.push(chosen.addr);
        }
        for addr in ["http://w1:9090", "http://w2:9090", "http://w3:9090"] {
            assert_eq!(counts[addr], 3, "{addr} selected unevenly");
        }
        // Insertion-order cycle.
        assert_eq!(order[0..3], order[3..6]);
        assert_eq!(order[0], "http://w1:9090");
        assert_eq!(order[1], "http://w2:9090");
        assert_eq!(order[2], "http://w3:9090");
    }

    #[test]
    fn counters_are_independent_per_arch() {
        let pool = BackendPool::with_backends([
            backend("http://x1:9090", "x86_64"),
            backend("http://x2:9090", "x86_64"),
            backend("http://a1:9090", "aarch64"),
            backend("http://a2:9090", "aarch64"),
        ])
        .unwrap();

        // Interleave selections; each arch must still alternate cleanly.
        assert_eq!(pool.select("x86_64", &BTreeMap::new()).unwrap().addr, "http://x1:9090");
        assert_eq!(pool.select("aarch64", &BTreeMap::new()).unwrap().addr, "http://a1:9090");
        assert_eq!(pool.select("x86_64", &BTreeMap::new()).unwrap().addr, "http://x2:9090");
        assert_eq!(pool.select("aarch64", &BTreeMap::new()).unwrap().addr, "http://a2:9090");
    }

    #[test]
    fn select_filters_by_selector() {
        let pool = BackendPool::with_backends([
            labeled("http://w1:9090", "x86_64", &[("zone", "us-east1")]),
            labeled("http://w2:9090", "x86_64", &[("zone", "us-west1")]),
        ])
        .unwrap();

        let selector: BTreeMap<String, String> =
            [("zone".to_string(), "us-west1".to_string())].into_iter().collect();
        for _ in 0..3 {
            assert_eq!(pool.select("x86_64", &selector).unwrap().addr, "http://w2:9090");
        }

        let missing: BTreeMap<String, String> =
            [("zone".to_string(), "eu-west4".to_string())].into_iter().collect();
        assert!(matches!(
            pool.select("x86_64", &missing),
            Err(Error::NoSelectorMatch { .. })
        ));
        assert_eq!(
            pool.select("riscv64", &BTreeMap::new()),
            Err(Error::NoArchMatch("riscv64".to_string()))
        );
    }
}
