//! Fiber-local variables.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kempt::Map;

use crate::effect::Effect;
use crate::instruction::{Instruction, Shared};

static NEXT_REF: AtomicU64 = AtomicU64::new(1);

/// A variable whose value is local to each fiber.
///
/// When a fiber forks, the child starts with `fork` applied to each of the
/// parent's values. When a fiber joins a child, each of the child's values is
/// merged into the parent's with `join`. A `FiberRef` that has never been set
/// in a fiber reads as its initial value.
pub struct FiberRef<T> {
    inner: Arc<Definition<T>>,
}

struct Definition<T> {
    id: u64,
    initial: T,
    fork: Box<dyn Fn(&T) -> T + Send + Sync>,
    join: Box<dyn Fn(&T, &T) -> T + Send + Sync>,
}

impl<T> FiberRef<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Returns a new variable whose children inherit the parent's value and
    /// whose joins keep the child's value.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self::with_fork_join(initial, T::clone, |_parent, child| child.clone())
    }

    /// Returns a new variable with custom fork and join behavior.
    #[must_use]
    pub fn with_fork_join(
        initial: T,
        fork: impl Fn(&T) -> T + Send + Sync + 'static,
        join: impl Fn(&T, &T) -> T + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Definition {
                id: NEXT_REF.fetch_add(1, Ordering::Relaxed),
                initial,
                fork: Box::new(fork),
                join: Box::new(join),
            }),
        }
    }

    /// Returns an effect that creates a new variable and assigns `initial`
    /// to it in the current fiber.
    pub fn make<E>(
        initial: T,
        fork: impl Fn(&T) -> T + Send + Sync + 'static,
        join: impl Fn(&T, &T) -> T + Send + Sync + 'static,
    ) -> Effect<Self, E>
    where
        E: Send + 'static,
    {
        Effect::suspend(move || {
            let fiber_ref = Self::with_fork_join(initial.clone(), fork, join);
            fiber_ref.set(initial).map(move |()| fiber_ref)
        })
    }

    /// Returns the value this variable has in fibers that never set it.
    #[must_use]
    pub fn initial(&self) -> &T {
        &self.inner.initial
    }

    /// Returns an effect that reads the current fiber's value.
    #[must_use]
    pub fn get<E>(&self) -> Effect<T, E>
    where
        E: Send + 'static,
    {
        self.modify(|value| (value.clone(), value))
    }

    /// Returns an effect that replaces the current fiber's value.
    #[must_use]
    pub fn set<E>(&self, value: T) -> Effect<(), E>
    where
        E: Send + 'static,
    {
        self.modify(move |_| ((), value))
    }

    /// Returns an effect that transforms the current fiber's value.
    #[must_use]
    pub fn update<E>(&self, update: impl FnOnce(T) -> T + Send + 'static) -> Effect<(), E>
    where
        E: Send + 'static,
    {
        self.modify(move |value| ((), update(value)))
    }

    /// Returns an effect that transforms the current fiber's value and
    /// produces a result computed from the previous value.
    #[must_use]
    pub fn modify<B, E>(&self, modify: impl FnOnce(T) -> (B, T) + Send + 'static) -> Effect<B, E>
    where
        B: Send + 'static,
        E: Send + 'static,
    {
        let fiber_ref = self.clone();
        Effect::from_instruction(Instruction::WithFiberRefs(Box::new(move |refs| {
            let (result, value) = modify(refs.value_of(&fiber_ref));
            refs.insert(&fiber_ref, value);
            Instruction::succeed(result)
        })))
    }

    /// Returns an effect that runs `effect` with this variable set to
    /// `value`, restoring the previous value afterwards.
    #[must_use]
    pub fn locally<A, E>(&self, value: T, effect: Effect<A, E>) -> Effect<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let restore_ref = self.clone();
        self.modify(move |previous| (previous, value))
            .flat_map(move |previous| effect.ensuring(restore_ref.set(previous)))
    }

    fn erased(&self) -> Arc<dyn ErasedRef> {
        self.inner.clone()
    }
}

impl<T> Clone for FiberRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Debug for FiberRef<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberRef")
            .field("id", &self.inner.id)
            .field("initial", &self.inner.initial)
            .finish_non_exhaustive()
    }
}

trait ErasedRef: Send + Sync {
    fn id(&self) -> u64;
    fn fork(&self, value: &Shared) -> Shared;
    fn join(&self, parent: &Shared, child: &Shared) -> Shared;
    fn initial(&self) -> Shared;
}

impl<T> Definition<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn unshare<'a>(&'a self, value: &'a Shared) -> &'a T {
        value.downcast_ref::<T>().unwrap_or(&self.initial)
    }
}

impl<T> ErasedRef for Definition<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> u64 {
        self.id
    }

    fn fork(&self, value: &Shared) -> Shared {
        Arc::new((self.fork)(self.unshare(value)))
    }

    fn join(&self, parent: &Shared, child: &Shared) -> Shared {
        Arc::new((self.join)(self.unshare(parent), self.unshare(child)))
    }

    fn initial(&self) -> Shared {
        Arc::new(self.initial.clone())
    }
}

/// The values of every [`FiberRef`] a fiber has set.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs(Map<u64, Local>);

#[derive(Clone)]
struct Local {
    fiber_ref: Arc<dyn ErasedRef>,
    value: Shared,
}

impl FiberRefs {
    fn value_of<T>(&self, fiber_ref: &FiberRef<T>) -> T
    where
        T: Clone + Send + Sync + 'static,
    {
        self.0
            .get(&fiber_ref.inner.id)
            .and_then(|local| local.value.downcast_ref::<T>())
            .unwrap_or(&fiber_ref.inner.initial)
            .clone()
    }

    fn insert<T>(&mut self, fiber_ref: &FiberRef<T>, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.0.insert(
            fiber_ref.inner.id,
            Local {
                fiber_ref: fiber_ref.erased(),
                value: Arc::new(value),
            },
        );
    }

    /// Returns the values a child forked from this fiber starts with.
    pub fn forked(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|field| {
                    let local = &field.value;
                    (
                        *field.key(),
                        Local {
                            fiber_ref: local.fiber_ref.clone(),
                            value: local.fiber_ref.fork(&local.value),
                        },
                    )
                })
                .collect(),
        )
    }

    /// Merges every value of a joined child into this fiber's values.
    pub fn join(&mut self, child: &FiberRefs) {
        for field in child.0.iter() {
            let child_local = &field.value;
            let fiber_ref = &child_local.fiber_ref;
            let parent = self
                .0
                .get(&fiber_ref.id())
                .map_or_else(|| fiber_ref.initial(), |local| local.value.clone());
            let value = fiber_ref.join(&parent, &child_local.value);
            self.0.insert(
                fiber_ref.id(),
                Local {
                    fiber_ref: fiber_ref.clone(),
                    value,
                },
            );
        }
    }
}
