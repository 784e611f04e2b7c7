use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use log::trace;

use crate::AxonsConfig;

/// Ordered override list shared by every axons context of a sub-graph. The
/// last registered entry decides the freeze-out of all the others.
#[derive(Clone, Default)]
pub struct FreezeOutOverrides {
    list: Arc<Mutex<Vec<Weak<ContextState>>>>,
}

impl FreezeOutOverrides {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<Vec<Weak<ContextState>>> {
        // the list holds no invariant a panicking holder could have broken
        self.list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn same_list(&self, other: &FreezeOutOverrides) -> bool {
        Arc::ptr_eq(&self.list, &other.list)
    }

    pub fn len(&self) -> usize {
        self.lock().iter().filter(|w| w.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ContextState {
    config: RwLock<AxonsConfig>,
    freeze_out: AtomicBool,
    overrides: FreezeOutOverrides,
}

/// Per-axons configuration handle. Clones share state; the training flag is
/// a snapshot of the `GraphContext` the handle was fetched through.
#[derive(Clone)]
pub struct AxonsContext {
    state: Arc<ContextState>,
    training: bool,
}

impl AxonsContext {
    pub fn new(config: AxonsConfig, overrides: FreezeOutOverrides, training: bool) -> Self {
        let freeze_out = AtomicBool::new(config.freeze_out);
        AxonsContext {
            state: Arc::new(ContextState { config: RwLock::new(config), freeze_out, overrides }),
            training,
        }
    }

    pub fn standalone(config: AxonsConfig) -> Self {
        Self::new(config, FreezeOutOverrides::new(), true)
    }

    pub(crate) fn with_training(&self, training: bool) -> Self {
        AxonsContext { state: self.state.clone(), training }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn config(&self) -> AxonsConfig {
        let mut config = self.state.config.read().unwrap_or_else(|p| p.into_inner()).clone();
        config.freeze_out = self.local_freeze_out();
        config
    }

    pub fn regularisation_lambda(&self) -> f32 {
        self.state.config.read().unwrap_or_else(|p| p.into_inner()).regularisation_lambda
    }

    pub fn input_dropout_keep_probability(&self) -> f32 {
        self.state.config.read().unwrap_or_else(|p| p.into_inner()).input_dropout_keep_probability
    }

    pub fn set_regularisation_lambda(&self, lambda: f32) {
        self.state.config.write().unwrap_or_else(|p| p.into_inner()).regularisation_lambda = lambda;
    }

    pub fn set_input_dropout_keep_probability(&self, keep: f32) {
        self.state.config.write().unwrap_or_else(|p| p.into_inner()).input_dropout_keep_probability = keep;
    }

    pub fn overrides(&self) -> &FreezeOutOverrides {
        &self.state.overrides
    }

    pub fn same_context(&self, other: &AxonsContext) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    fn local_freeze_out(&self) -> bool {
        self.state.freeze_out.load(Ordering::SeqCst)
    }

    fn is_self(&self, weak: &Weak<ContextState>) -> bool {
        std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.state))
    }

    /// What `top` implies for contexts registered on `list`. An override
    /// living on the same list is its own top, so only its local flag counts;
    /// anything else is asked once.
    fn implied_by(top: &Arc<ContextState>, list: &FreezeOutOverrides) -> bool {
        let top = AxonsContext { state: top.clone(), training: true };
        if top.overrides().same_list(list) {
            top.local_freeze_out()
        } else {
            top.is_with_freeze_out()
        }
    }

    fn top_override(&self) -> Option<Arc<ContextState>> {
        self.overrides().lock().iter().rev().find_map(Weak::upgrade)
    }

    pub fn is_with_freeze_out(&self) -> bool {
        match self.top_override() {
            Some(top) if !Arc::ptr_eq(&top, &self.state) => Self::implied_by(&top, self.overrides()),
            _ => self.local_freeze_out(),
        }
    }

    /// Sets the local flag. When overrides are registered, this context puts
    /// itself on top of the list if the flag disagrees with the current top,
    /// and takes itself off otherwise.
    pub fn with_freeze_out(&self, freeze_out: bool) -> &Self {
        self.state.freeze_out.store(freeze_out, Ordering::SeqCst);
        let overrides = self.overrides();
        let mut list = overrides.lock();
        list.retain(|w| w.strong_count() > 0 && !self.is_self(w));
        let top = list.last().and_then(Weak::upgrade);
        if let Some(top) = top {
            let implied = if top.overrides.same_list(overrides) {
                top.freeze_out.load(Ordering::SeqCst)
            } else {
                // different list, its own lock is taken on the single hop
                drop(list);
                let implied = Self::implied_by(&top, overrides);
                list = overrides.lock();
                implied
            };
            if implied != freeze_out {
                list.push(Arc::downgrade(&self.state));
            }
        }
        trace!("freeze out set to {freeze_out}, {} overrides registered", list.len());
        self
    }

    pub fn register_override(&self, other: &AxonsContext) {
        let mut list = self.overrides().lock();
        list.retain(|w| w.strong_count() > 0 && !other.is_self(w));
        list.push(Arc::downgrade(&other.state));
    }

    pub fn remove_override(&self, other: &AxonsContext) {
        self.overrides().lock().retain(|w| w.strong_count() > 0 && !other.is_self(w));
    }
}

impl std::fmt::Debug for AxonsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AxonsContext")
            .field("config", &self.config())
            .field("training", &self.training)
            .field("freeze_out", &self.is_with_freeze_out())
            .finish()
    }
}
