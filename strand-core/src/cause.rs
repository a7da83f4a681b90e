//! Structured descriptions of why a fiber did not succeed.

use std::any::Any;
use std::convert::Infallible;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use kempt::Set;

use crate::id::FiberId;

/// The reason a fiber did not produce a value.
///
/// A cause is a tree whose leaves are typed failures ([`Cause::Fail`]),
/// defects ([`Cause::Die`]) and interruptions ([`Cause::Interrupt`]). Leaves
/// are combined either sequentially ([`Cause::Then`]) or in parallel
/// ([`Cause::Both`]). Nothing is ever coalesced: every failure that happened
/// remains visible in the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// No failure.
    Empty,
    /// An expected, typed failure.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// The fiber was interrupted by the given fiber.
    Interrupt(FiberId),
    /// The left cause happened before the right cause.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Both causes happened concurrently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
    /// Returns an empty cause.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// Returns a cause containing a single typed failure.
    #[must_use]
    pub const fn fail(error: E) -> Self {
        Self::Fail(error)
    }

    /// Returns a cause containing a single defect.
    #[must_use]
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::Die(defect.into())
    }

    /// Returns a cause containing a single interruption by `by`.
    #[must_use]
    pub const fn interrupt(by: FiberId) -> Self {
        Self::Interrupt(by)
    }

    /// Combines `self` and `next` sequentially.
    ///
    /// Empty sides are elided, so `Empty.then(c) == c`.
    #[must_use]
    pub fn then(self, next: Self) -> Self {
        if self.is_empty() {
            next
        } else if next.is_empty() {
            self
        } else {
            Self::Then(Box::new(self), Box::new(next))
        }
    }

    /// Combines `self` and `other` in parallel.
    ///
    /// Empty sides are elided, so `Empty.both(c) == c`.
    #[must_use]
    pub fn both(self, other: Self) -> Self {
        if self.is_empty() {
            other
        } else if other.is_empty() {
            self
        } else {
            Self::Both(Box::new(self), Box::new(other))
        }
    }

    /// Returns true if this cause contains no failure, defect or
    /// interruption.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Cause::Empty => true,
            Cause::Fail(_) | Cause::Die(_) | Cause::Interrupt(_) => false,
            Cause::Then(left, right) | Cause::Both(left, right) => {
                left.is_empty() && right.is_empty()
            }
        }
    }

    /// Returns true if this cause contains a typed failure.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.any_leaf(&mut |leaf| matches!(leaf, Cause::Fail(_)))
    }

    /// Returns true if this cause contains a defect.
    #[must_use]
    pub fn died(&self) -> bool {
        self.any_leaf(&mut |leaf| matches!(leaf, Cause::Die(_)))
    }

    /// Returns true if this cause contains an interruption.
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.any_leaf(&mut |leaf| matches!(leaf, Cause::Interrupt(_)))
    }

    /// Returns true if this cause contains interruptions and nothing else.
    #[must_use]
    pub fn interrupted_only(&self) -> bool {
        self.interrupted() && !self.failed() && !self.died()
    }

    fn any_leaf(&self, predicate: &mut impl FnMut(&Self) -> bool) -> bool {
        match self {
            Cause::Then(left, right) | Cause::Both(left, right) => {
                left.any_leaf(predicate) || right.any_leaf(predicate)
            }
            leaf => predicate(leaf),
        }
    }

    fn for_each_leaf<'a>(&'a self, visit: &mut impl FnMut(&'a Self)) {
        match self {
            Cause::Then(left, right) | Cause::Both(left, right) => {
                left.for_each_leaf(visit);
                right.for_each_leaf(visit);
            }
            leaf => visit(leaf),
        }
    }

    /// Returns the set of fibers that interrupted the fiber this cause
    /// describes.
    #[must_use]
    pub fn interruptors(&self) -> Set<FiberId> {
        let mut interruptors = Set::new();
        self.for_each_leaf(&mut |leaf| {
            if let Cause::Interrupt(id) = leaf {
                interruptors.insert(*id);
            }
        });
        interruptors
    }

    /// Returns every typed failure in this cause, in order.
    #[must_use]
    pub fn failures(&self) -> Vec<&E> {
        let mut failures = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            if let Cause::Fail(error) = leaf {
                failures.push(error);
            }
        });
        failures
    }

    /// Returns every defect in this cause, in order.
    #[must_use]
    pub fn defects(&self) -> Vec<&Defect> {
        let mut defects = Vec::new();
        self.for_each_leaf(&mut |leaf| {
            if let Cause::Die(defect) = leaf {
                defects.push(defect);
            }
        });
        defects
    }

    /// Returns true if every interruption in `other` is already present in
    /// `self`.
    #[must_use]
    pub fn contains_interruptions_of<F>(&self, other: &Cause<F>) -> bool {
        let ours = self.interruptors();
        other.interruptors().iter().all(|id| ours.contains(id))
    }

    /// Extracts the first typed failure, or returns the cause unchanged if it
    /// contains none.
    pub fn failure_or_cause(self) -> Result<E, Self> {
        match self {
            Cause::Fail(error) => Ok(error),
            Cause::Then(left, right) => match left.failure_or_cause() {
                Ok(error) => Ok(error),
                Err(left) => right
                    .failure_or_cause()
                    .map_err(|right| Cause::Then(Box::new(left), Box::new(right))),
            },
            Cause::Both(left, right) => match left.failure_or_cause() {
                Ok(error) => Ok(error),
                Err(left) => right
                    .failure_or_cause()
                    .map_err(|right| Cause::Both(Box::new(left), Box::new(right))),
            },
            other => Err(other),
        }
    }

    /// Removes every typed failure, keeping defects and interruptions.
    #[must_use]
    pub fn strip_failures(self) -> Self {
        match self {
            Cause::Fail(_) => Cause::Empty,
            Cause::Then(left, right) => left.strip_failures().then(right.strip_failures()),
            Cause::Both(left, right) => left.strip_failures().both(right.strip_failures()),
            other => other,
        }
    }

    /// Transforms every typed failure with `map`.
    #[must_use]
    pub fn map<E2>(self, mut map: impl FnMut(E) -> E2) -> Cause<E2> {
        self.try_map(&mut |error| Ok(map(error)))
    }

    /// Transforms every typed failure with `map`, turning failures that can't
    /// be transformed into defects.
    #[must_use]
    pub fn try_map<E2>(self, map: &mut impl FnMut(E) -> Result<E2, Defect>) -> Cause<E2> {
        match self {
            Cause::Empty => Cause::Empty,
            Cause::Fail(error) => match map(error) {
                Ok(error) => Cause::Fail(error),
                Err(defect) => Cause::Die(defect),
            },
            Cause::Die(defect) => Cause::Die(defect),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(left, right) => {
                Cause::Then(Box::new(left.try_map(map)), Box::new(right.try_map(map)))
            }
            Cause::Both(left, right) => {
                Cause::Both(Box::new(left.try_map(map)), Box::new(right.try_map(map)))
            }
        }
    }
}

impl Cause<Infallible> {
    /// Widens a cause that can't contain typed failures into any error type.
    #[must_use]
    pub fn lift<E>(self) -> Cause<E> {
        self.map(|never| match never {})
    }
}

impl<E> Default for Cause<E> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<E> Display for Cause<E>
where
    E: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => f.write_str("empty"),
            Cause::Fail(error) => write!(f, "fail({error:?})"),
            Cause::Die(defect) => write!(f, "die({defect})"),
            Cause::Interrupt(id) => write!(f, "interrupt({id})"),
            Cause::Then(left, right) => write!(f, "({left} then {right})"),
            Cause::Both(left, right) => write!(f, "({left} and {right})"),
        }
    }
}

/// An unexpected error, such as a panic raised by user code.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Defect(Arc<str>);

impl Defect {
    /// Returns a defect described by `message`.
    #[must_use]
    pub fn new(message: impl AsRef<str>) -> Self {
        Self(Arc::from(message.as_ref()))
    }

    /// Returns a defect describing a caught panic.
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => return Self(Arc::from(format!("panicked: {message}"))),
            Err(payload) => payload
                .downcast_ref::<&'static str>()
                .copied()
                .unwrap_or("panicked with a non-string payload"),
        };
        Self(Arc::from(format!("panicked: {message}")))
    }

    /// Returns the description of this defect.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Defect").field(&&*self.0).finish()
    }
}

impl Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Self(Arc::from(message))
    }
}
