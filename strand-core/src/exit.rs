//! The terminal result of a fiber.

use crate::cause::{Cause, Defect};

/// The result of running an effect to completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    /// The effect produced a value.
    Success(A),
    /// The effect failed.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// Returns a successful exit.
    pub const fn succeed(value: A) -> Self {
        Self::Success(value)
    }

    /// Returns an exit that failed with a typed error.
    pub const fn fail(error: E) -> Self {
        Self::Failure(Cause::Fail(error))
    }

    /// Returns an exit that failed with a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Self::Failure(Cause::die(defect))
    }

    /// Returns true if this exit is a success.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns true if this exit failed and its cause contains an
    /// interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Failure(cause) if cause.interrupted())
    }

    /// Returns the successful value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    /// Returns the failure cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// Converts this exit into a result.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(cause) => Err(cause),
        }
    }

    /// Transforms the successful value.
    pub fn map<B>(self, map: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Self::Success(value) => Exit::Success(map(value)),
            Self::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transforms the failure cause.
    pub fn map_cause<E2>(self, map: impl FnOnce(Cause<E>) -> Cause<E2>) -> Exit<A, E2> {
        match self {
            Self::Success(value) => Exit::Success(value),
            Self::Failure(cause) => Exit::Failure(map(cause)),
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(error) => Self::fail(error),
        }
    }
}
