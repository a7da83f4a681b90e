//! Structured lifetimes for forked fibers.

use std::convert::Infallible;
use std::fmt::{self, Debug};
use std::sync::{Arc, OnceLock};

use kempt::Map;
use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::instruction::ErasedExit;

/// A cleanup action run when a [`Scope`] closes.
pub type Finalizer = Box<dyn FnOnce(&ErasedExit) -> Effect<(), Infallible> + Send>;

/// Identifies a finalizer registered with a [`Scope`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScopeKey(u64);

/// A region that owns a set of finalizers.
///
/// Every fiber owns a scope that closes when the fiber completes. Fibers
/// forked into a scope register a finalizer that interrupts them, so that no
/// child outlives the scope it was forked into. The [global](Self::global)
/// scope never closes and ignores finalizers.
#[derive(Clone)]
pub struct Scope(Arc<ScopeData>);

struct ScopeData {
    global: bool,
    state: Mutex<ScopeState>,
}

#[derive(Default)]
struct ScopeState {
    closed: bool,
    next_key: u64,
    finalizers: Map<u64, Finalizer>,
}

impl Scope {
    /// Returns a new, open scope.
    #[must_use]
    pub fn open() -> Self {
        Self(Arc::new(ScopeData {
            global: false,
            state: Mutex::default(),
        }))
    }

    /// Returns the scope that never closes.
    #[must_use]
    pub fn global() -> Self {
        static GLOBAL: OnceLock<Scope> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                Self(Arc::new(ScopeData {
                    global: true,
                    state: Mutex::default(),
                }))
            })
            .clone()
    }

    /// Returns true if this is the global scope.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.0.global
    }

    /// Returns true once [`close`](Self::close) has started running.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.0.global && self.0.state.lock().closed
    }

    /// Returns the number of finalizers waiting for this scope to close.
    #[must_use]
    pub fn finalizer_count(&self) -> usize {
        self.0.state.lock().finalizers.len()
    }

    /// Registers `finalizer` to run when this scope closes.
    ///
    /// Returns `None` if the scope has already closed, in which case the
    /// finalizer is dropped without running. The global scope accepts and
    /// immediately discards every finalizer.
    pub fn add_finalizer(
        &self,
        finalizer: impl FnOnce(&ErasedExit) -> Effect<(), Infallible> + Send + 'static,
    ) -> Option<ScopeKey> {
        if self.0.global {
            return Some(ScopeKey(0));
        }
        let mut state = self.0.state.lock();
        if state.closed {
            return None;
        }
        state.next_key += 1;
        let key = state.next_key;
        state.finalizers.insert(key, Box::new(finalizer));
        Some(ScopeKey(key))
    }

    /// Removes the finalizer registered as `key`. Returns true if the
    /// finalizer was still pending.
    pub fn remove_finalizer(&self, key: ScopeKey) -> bool {
        self.0.state.lock().finalizers.remove(&key.0).is_some()
    }

    /// Returns an effect that closes this scope with `exit`.
    ///
    /// Finalizers run uninterruptibly in reverse registration order. Every
    /// finalizer runs even if an earlier one fails, and the failures are
    /// combined sequentially into the effect's cause. Closing a scope that
    /// is already closed, or the global scope, does nothing.
    #[must_use]
    pub fn close(&self, exit: ErasedExit) -> Effect<(), Infallible> {
        let scope = self.clone();
        Effect::suspend(move || {
            let Some(finalizers) = scope.begin_close() else {
                return Effect::unit();
            };
            trace!(finalizers = finalizers.len(), "closing scope");

            let exit = Arc::new(exit);
            let mut closing = Effect::<Cause<Infallible>>::succeed(Cause::empty());
            for finalizer in finalizers {
                let exit = exit.clone();
                closing = closing.flat_map(move |accumulated| {
                    Effect::suspend(move || finalizer(&exit))
                        .exit()
                        .map(move |result| match result {
                            Exit::Success(()) => accumulated,
                            Exit::Failure(cause) => accumulated.then(cause),
                        })
                });
            }
            closing
                .flat_map(|cause| {
                    if cause.is_empty() {
                        Effect::unit()
                    } else {
                        Effect::fail_cause(cause)
                    }
                })
                .uninterruptible()
        })
    }

    fn begin_close(&self) -> Option<Vec<Finalizer>> {
        if self.0.global {
            return None;
        }
        let mut state = self.0.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        let mut finalizers = std::mem::take(&mut state.finalizers)
            .into_iter()
            .map(|field| field.into_parts().1)
            .collect::<Vec<_>>();
        finalizers.reverse();
        Some(finalizers)
    }
}

impl Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("Scope")
            .field("global", &self.0.global)
            .field("closed", &state.closed)
            .field("finalizers", &state.finalizers.len())
            .finish()
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
