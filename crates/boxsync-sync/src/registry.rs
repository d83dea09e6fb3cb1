//! Process-wide registry of started engines
//!
//! Engines register on start and unregister on stop. The registry refuses a
//! second engine on a root that is already served and lets the host tear
//! every engine down deterministically before exiting.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::FatalEngineError;

/// An engine the registry can stop
#[async_trait]
pub trait ManagedEngine: Send + Sync {
    /// Sync root served by the engine
    fn root(&self) -> &Path;

    /// Stop the engine, waiting for its background work
    async fn stop(&self) -> Result<(), FatalEngineError>;
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: DashMap<PathBuf, Weak<dyn ManagedEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every engine of this process
    pub fn global() -> Arc<EngineRegistry> {
        static GLOBAL: OnceLock<Arc<EngineRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(EngineRegistry::new())))
    }

    /// Register `engine` for its root
    ///
    /// Registering the same engine twice is a no-op. Entries of engines
    /// that have been dropped are replaced.
    ///
    /// # Errors
    /// `FatalEngineError::DuplicateRoot` if another live engine serves the
    /// root
    pub fn register(&self, engine: Weak<dyn ManagedEngine>) -> Result<(), FatalEngineError> {
        let Some(live) = engine.upgrade() else {
            return Ok(());
        };
        let root = live.root().to_path_buf();

        match self.engines.entry(root.clone()) {
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if current.strong_count() > 0 && !Weak::ptr_eq(current, &engine) {
                    return Err(FatalEngineError::DuplicateRoot(root));
                }
                slot.insert(engine);
            }
            Entry::Vacant(slot) => {
                slot.insert(engine);
            }
        }
        debug!(root = %root.display(), "Engine registered");
        Ok(())
    }

    pub fn unregister(&self, root: &Path) {
        if self.engines.remove(root).is_some() {
            debug!(root = %root.display(), "Engine unregistered");
        }
    }

    pub fn is_registered(&self, root: &Path) -> bool {
        self.engines
            .get(root)
            .is_some_and(|engine| engine.strong_count() > 0)
    }

    /// Number of live engines
    pub fn len(&self) -> usize {
        self.engines.iter().filter(|e| e.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every registered engine and empty the registry
    pub async fn shutdown_all(&self) {
        let engines: Vec<Arc<dyn ManagedEngine>> = self
            .engines
            .iter()
            .filter_map(|e| e.value().upgrade())
            .collect();
        info!(count = engines.len(), "Stopping all engines");

        for engine in engines {
            if let Err(e) = engine.stop().await {
                warn!(root = %engine.root().display(), error = %e, "Engine did not stop cleanly");
            }
        }
        self.engines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeEngine {
        root: PathBuf,
        stops: AtomicUsize,
        registry: Arc<EngineRegistry>,
    }

    impl FakeEngine {
        fn new(root: &str, registry: &Arc<EngineRegistry>) -> Arc<Self> {
            Arc::new(Self {
                root: PathBuf::from(root),
                stops: AtomicUsize::new(0),
                registry: Arc::clone(registry),
            })
        }
    }

    #[async_trait]
    impl ManagedEngine for FakeEngine {
        fn root(&self) -> &Path {
            &self.root
        }

        async fn stop(&self) -> Result<(), FatalEngineError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.registry.unregister(&self.root);
            Ok(())
        }
    }

    fn weak(engine: &Arc<FakeEngine>) -> Weak<dyn ManagedEngine> {
        let engine: Arc<dyn ManagedEngine> = engine.clone();
        Arc::downgrade(&engine)
    }

    #[test]
    fn test_duplicate_root_is_rejected() {
        let registry = Arc::new(EngineRegistry::new());
        let first = FakeEngine::new("/sync/a", &registry);
        let second = FakeEngine::new("/sync/a", &registry);

        registry.register(weak(&first)).unwrap();
        registry.register(weak(&first)).unwrap();
        assert_eq!(
            registry.register(weak(&second)),
            Err(FatalEngineError::DuplicateRoot(PathBuf::from("/sync/a")))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_dropped_engine_frees_its_root() {
        let registry = Arc::new(EngineRegistry::new());
        let first = FakeEngine::new("/sync/a", &registry);
        registry.register(weak(&first)).unwrap();
        drop(first);

        assert!(!registry.is_registered(Path::new("/sync/a")));
        let second = FakeEngine::new("/sync/a", &registry);
        registry.register(weak(&second)).unwrap();
        assert!(registry.is_registered(Path::new("/sync/a")));
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_every_engine() {
        let registry = Arc::new(EngineRegistry::new());
        let a = FakeEngine::new("/sync/a", &registry);
        let b = FakeEngine::new("/sync/b", &registry);
        registry.register(weak(&a)).unwrap();
        registry.register(weak(&b)).unwrap();

        registry.shutdown_all().await;

        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
