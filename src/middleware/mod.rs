//! Dispatcher decorators.
//!
//! Each decorator wraps one [`Dispatcher`] into another. They compose with the free functions
//! in this module or through [`ClientBuilder::wrap`](crate::ClientBuilder::wrap).

mod defaultheaders;
mod map_err;
mod retry;

use std::marker::PhantomData;

use crate::{dispatch::Dispatcher, error::SendRequestError};

pub use self::defaultheaders::{DefaultHeaders, DefaultHeadersDispatcher};
pub use self::map_err::{MapErr, MapErrDispatcher};
pub use self::retry::{IntoRetryPolicy, Retry, RetryDispatcher, RetryPolicy};

/// Trait for transform a dispatcher to another one.
pub trait Transform<D> {
    type Transform: Dispatcher;

    /// Creates and returns a new Transform component.
    fn new_transform(self, dispatcher: D) -> Self::Transform;
}

#[doc(hidden)]
/// Helper struct for constructing Nested types that would call `Transform::new_transform`
/// in a chain.
///
/// The child field would be called first and the output `Dispatcher` type is
/// passed to parent as input type.
pub struct NestTransform<T1, T2, D>
where
    T1: Transform<D>,
    T2: Transform<T1::Transform>,
{
    child: T1,
    parent: T2,
    _dispatcher: PhantomData<D>,
}

impl<T1, T2, D> NestTransform<T1, T2, D>
where
    T1: Transform<D>,
    T2: Transform<T1::Transform>,
{
    pub(crate) fn new(child: T1, parent: T2) -> Self {
        NestTransform {
            child,
            parent,
            _dispatcher: PhantomData,
        }
    }
}

impl<T1, T2, D> Transform<D> for NestTransform<T1, T2, D>
where
    T1: Transform<D>,
    T2: Transform<T1::Transform>,
{
    type Transform = T2::Transform;

    fn new_transform(self, dispatcher: D) -> Self::Transform {
        let dispatcher = self.child.new_transform(dispatcher);
        self.parent.new_transform(dispatcher)
    }
}

/// Dummy impl for kick start `NestTransform` type in `ClientBuilder` type
impl<D> Transform<D> for ()
where
    D: Dispatcher,
{
    type Transform = D;

    fn new_transform(self, dispatcher: D) -> Self::Transform {
        dispatcher
    }
}

/// Retries failed connects and responses matching `retry`'s policies.
pub fn retry<D>(dispatcher: D, retry: Retry) -> RetryDispatcher<D>
where
    D: Dispatcher + 'static,
{
    retry.new_transform(dispatcher)
}

/// Adds `headers` to requests that do not carry them yet.
pub fn default_headers<D>(dispatcher: D, headers: DefaultHeaders) -> DefaultHeadersDispatcher<D>
where
    D: Dispatcher,
{
    headers.new_transform(dispatcher)
}

/// Maps every error produced by `dispatcher` through `f`.
pub fn map_err<D, F>(dispatcher: D, f: F) -> MapErrDispatcher<D, F>
where
    D: Dispatcher,
    F: Fn(SendRequestError) -> SendRequestError + 'static,
{
    MapErr::new(f).new_transform(dispatcher)
}
