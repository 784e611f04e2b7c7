use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use super::axons_context::{AxonsContext, FreezeOutOverrides};
use super::ComponentId;
use crate::exec::WorkerPool;
use crate::{AxonsConfig, EngineConfig};

/// Everything a forward or backward call needs besides its tensors: the
/// worker pool, the training flag, the engine configuration and the map of
/// per-axons contexts. Clones share the pool and the map.
#[derive(Clone)]
pub struct GraphContext {
    training: bool,
    config: Arc<EngineConfig>,
    pool: Arc<WorkerPool>,
    axons: Arc<Mutex<HashMap<ComponentId, AxonsContext>>>,
    overrides: FreezeOutOverrides,
}

impl GraphContext {
    pub fn new(config: EngineConfig, training: bool) -> Self {
        let pool = Arc::new(WorkerPool::new(config.worker_threads));
        GraphContext {
            training,
            config: Arc::new(config),
            pool,
            axons: Default::default(),
            overrides: FreezeOutOverrides::new(),
        }
    }

    pub fn training(config: EngineConfig) -> Self {
        Self::new(config, true)
    }

    pub fn inference(config: EngineConfig) -> Self {
        Self::new(config, false)
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn with_training(&self, training: bool) -> Self {
        GraphContext { training, ..self.clone() }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn shared_pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.pool)
    }

    pub fn overrides(&self) -> &FreezeOutOverrides {
        &self.overrides
    }

    /// Looks up the context of an axons instance, creating it from `default`
    /// the first time it is requested.
    pub fn axons_context(&self, id: ComponentId, default: impl FnOnce() -> AxonsConfig) -> AxonsContext {
        let mut axons = self.axons.lock().unwrap_or_else(|p| p.into_inner());
        let context = axons.entry(id).or_insert_with(|| {
            debug!("creating axons context for {id}");
            AxonsContext::new(default(), self.overrides.clone(), self.training)
        });
        context.with_training(self.training)
    }

    /// Forces every axons context of this graph context to `freeze_out` until
    /// the returned guard is dropped.
    pub fn override_freeze_out(&self, freeze_out: bool) -> FreezeOutOverride {
        let context = AxonsContext::new(
            AxonsConfig::default().with_freeze_out(freeze_out),
            self.overrides.clone(),
            self.training,
        );
        context.register_override(&context);
        FreezeOutOverride { context }
    }
}

pub struct FreezeOutOverride {
    context: AxonsContext,
}

impl FreezeOutOverride {
    pub fn context(&self) -> &AxonsContext {
        &self.context
    }
}

impl Drop for FreezeOutOverride {
    fn drop(&mut self) {
        self.context.remove_override(&self.context);
    }
}

impl std::fmt::Debug for GraphContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphContext")
            .field("training", &self.training)
            .field("config", &self.config)
            .finish()
    }
}

#[test]
fn test_axons_context_lazily_populated() {
    let ctx = GraphContext::training(EngineConfig::sequential());
    let id = ComponentId::next();
    let first = ctx.axons_context(id, || AxonsConfig::default().with_regularisation_lambda(0.5));
    // the default is only consulted once
    let second = ctx.axons_context(id, || AxonsConfig::default().with_regularisation_lambda(9.0));
    assert!(first.same_context(&second));
    assert_eq!(second.regularisation_lambda(), 0.5);
    assert!(second.is_training());

    let inference = ctx.with_training(false);
    let third = inference.axons_context(id, AxonsConfig::default);
    assert!(third.same_context(&first));
    assert!(!third.is_training());
}

#[test]
fn test_override_guard() {
    let ctx = GraphContext::training(EngineConfig::sequential());
    let a = ctx.axons_context(ComponentId::next(), AxonsConfig::default);
    let b = ctx.axons_context(ComponentId::next(), || AxonsConfig::default().with_freeze_out(true));
    assert!(!a.is_with_freeze_out());
    assert!(b.is_with_freeze_out());
    {
        let _frozen = ctx.override_freeze_out(true);
        assert!(a.is_with_freeze_out());
        let _thawed = ctx.override_freeze_out(false);
        assert!(!b.is_with_freeze_out());
    }
    assert!(!a.is_with_freeze_out());
    assert!(b.is_with_freeze_out());
    assert!(ctx.overrides().is_empty());
}
