use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::renderer::RenderWorker;
use crate::ssr::Props;
use crate::view::{View, ViewRef};
use crate::vm::VmFactory;

/// Identity of a registered view: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ViewKey(usize);

impl ViewKey {
    fn of(view: &ViewRef) -> Self {
        Self(Arc::as_ptr(view) as *const () as usize)
    }
}

struct Entry {
    // Holding the Arc keeps the address behind the key from being reused.
    view: ViewRef,
    pool: Arc<Pool<RenderWorker>>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<ViewKey, Entry>,
    closed: bool,
}

/// Maps registered views to their render worker pools.
///
/// The registry lock is held for lookups and inserts only; a render waits
/// for a worker and runs the script without holding it.
pub struct RenderEngine {
    config: EngineConfig,
    vms: Arc<dyn VmFactory>,
    registry: Mutex<Registry>,
}

impl RenderEngine {
    pub fn new(vms: Arc<dyn VmFactory>) -> Self {
        Self::with_config(vms, EngineConfig::default())
    }

    pub fn with_config(vms: Arc<dyn VmFactory>, config: EngineConfig) -> Self {
        Self {
            config,
            vms,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    /// Builds a worker pool for each view and registers it.
    ///
    /// Fails on a `None` view or a view that is already registered. Views
    /// registered before a failure stay registered.
    pub fn register_views<I>(&self, views: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<Option<ViewRef>>,
    {
        for view in views {
            let view = view.into().ok_or(Error::NilView)?;
            self.register(view)?;
        }
        Ok(())
    }

    fn register(&self, view: ViewRef) -> Result<()> {
        let key = ViewKey::of(&view);
        self.ensure_unregistered(key, view.as_ref())?;

        let pool = Pool::build(self.config.pool_capacity, || {
            let vm = self
                .vms
                .create()
                .map_err(|e| Error::Vm(format!("failed to start vm for {}: {e}", view.name())))?;
            RenderWorker::new(Arc::clone(&view), vm)
        })?;

        let mut registry = self.registry.lock();
        if registry.closed || registry.entries.contains_key(&key) {
            let err = if registry.closed {
                Error::EngineClosed
            } else {
                Error::DuplicateRegistration {
                    name: view.name().to_string(),
                }
            };
            drop(registry);
            if let Err(close_err) = pool.close() {
                warn!(view = view.name(), error = %close_err, "failed to close unused pool");
            }
            return Err(err);
        }
        info!(
            view = view.name(),
            workers = pool.capacity(),
            "view registered"
        );
        registry.entries.insert(
            key,
            Entry {
                view,
                pool: Arc::new(pool),
            },
        );
        Ok(())
    }

    fn ensure_unregistered(&self, key: ViewKey, view: &dyn View) -> Result<()> {
        let registry = self.registry.lock();
        if registry.closed {
            return Err(Error::EngineClosed);
        }
        if registry.entries.contains_key(&key) {
            return Err(Error::DuplicateRegistration {
                name: view.name().to_string(),
            });
        }
        Ok(())
    }

    pub fn is_registered(&self, view: &ViewRef) -> bool {
        self.registry
            .lock()
            .entries
            .contains_key(&ViewKey::of(view))
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders the hydrating HTML page of `view`.
    ///
    /// Blocks while every worker of the view is busy; there is no timeout.
    pub fn render(&self, view: &ViewRef, props: &Props) -> Result<Vec<u8>> {
        let pool = self.pool(view)?;
        let mut worker = pool.acquire()?;
        debug!(view = view.name(), "rendering");
        let page = worker.render_page(props);
        worker.release();
        page.map(String::into_bytes)
    }

    fn pool(&self, view: &ViewRef) -> Result<Arc<Pool<RenderWorker>>> {
        let registry = self.registry.lock();
        if registry.closed {
            return Err(Error::EngineClosed);
        }
        registry
            .entries
            .get(&ViewKey::of(view))
            .map(|entry| Arc::clone(&entry.pool))
            .ok_or_else(|| Error::ViewNotRegistered {
                name: view.name().to_string(),
            })
    }

    /// Closes every pool, continuing past failures. Renders and
    /// registrations after this return [`Error::EngineClosed`]; renders
    /// already holding a worker finish and the worker is closed on release.
    pub fn close(&self) -> Result<()> {
        let entries: Vec<Entry> = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            registry.entries.drain().map(|(_, entry)| entry).collect()
        };

        let mut failures = Vec::new();
        for entry in entries {
            let name = entry.view.name().to_string();
            match entry.pool.close() {
                Ok(()) => {}
                Err(Error::PoolClose { failures: errs }) => {
                    failures.extend(errs.into_iter().map(|e| format!("{name}: {e}")));
                }
                Err(other) => failures.push(format!("{name}: {other}")),
            }
        }
        info!(failed = failures.len(), "render engine closed");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PoolClose { failures })
        }
    }
}

impl fmt::Debug for RenderEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        let views: Vec<&str> = registry.entries.values().map(|e| e.view.name()).collect();
        f.debug_struct("RenderEngine")
            .field("config", &self.config)
            .field("views", &views)
            .field("closed", &registry.closed)
            .finish()
    }
}
