use std::{rc::Rc, time::Duration};

use actix_http::{header::HeaderMap, ResponseHead, StatusCode};
use futures_core::future::LocalBoxFuture;

use super::Transform;
use crate::{
    connection::Tunnel, dispatch::Dispatcher, error::SendRequestError, request::ClientRequest,
    response::ClientResponse,
};

/// Retry decorator.
///
/// A request is tried at most `max_retry + 1` times. Errors are retried only when
/// [`SendRequestError::is_retryable`] holds. Responses are retried when a policy rejects them;
/// the rejected response is dropped, which discards its connection.
pub struct Retry(Inner);

struct Inner {
    /// Number of retries. So each request will be tried [max_retry + 1] times
    max_retry: u8,
    policies: Vec<RetryPolicy>,
    backoff: Option<Duration>,
}

impl Retry {
    pub fn new(retries: u8) -> Self {
        Retry(Inner {
            max_retry: retries,
            policies: vec![],
            backoff: None,
        })
    }

    /// Allows you to add a retry policy to the [`policies`]
    /// It allows two types of policy:
    ///  - `Vec<StatusCode>` and will retry if one of them is received
    ///  - `Fn(StatusCode, &HeaderMap) -> bool` and will retry when this function resolves to false
    ///
    /// # example
    ///
    ///```
    /// use courier::http::{header::HeaderMap, StatusCode};
    /// use courier::middleware::Retry;
    ///
    /// // retry on 500 and 401, and whenever `SOME_HEADER` is missing
    /// let retry = Retry::new(5)
    ///     .policy(vec![StatusCode::INTERNAL_SERVER_ERROR, StatusCode::UNAUTHORIZED])
    ///     .policy(|_code: StatusCode, headers: &HeaderMap| headers.contains_key("SOME_HEADER"));
    ///```
    pub fn policy<T>(mut self, p: T) -> Self
    where
        T: IntoRetryPolicy,
    {
        self.0.policies.push(p.into_policy());
        self
    }

    /// Waits `dur` between attempts.
    pub fn backoff(mut self, dur: Duration) -> Self {
        self.0.backoff = Some(dur);
        self
    }
}

#[non_exhaustive]
pub enum RetryPolicy {
    Status(Vec<StatusCode>),
    Custom(Box<dyn Fn(StatusCode, &HeaderMap) -> bool>),
}

pub trait IntoRetryPolicy {
    fn into_policy(self) -> RetryPolicy;
}

impl<T> IntoRetryPolicy for T
where
    T: for<'a> Fn(StatusCode, &'a HeaderMap) -> bool + 'static,
{
    fn into_policy(self) -> RetryPolicy {
        RetryPolicy::Custom(Box::new(self))
    }
}

impl IntoRetryPolicy for Vec<StatusCode> {
    fn into_policy(self) -> RetryPolicy {
        RetryPolicy::Status(self)
    }
}

impl<D> Transform<D> for Retry
where
    D: Dispatcher + 'static,
{
    type Transform = RetryDispatcher<D>;

    fn new_transform(self, dispatcher: D) -> Self::Transform {
        RetryDispatcher {
            max_retry: self.0.max_retry,
            policies: self.0.policies.into_boxed_slice().into(),
            backoff: self.0.backoff,
            dispatcher: Rc::new(dispatcher),
        }
    }
}

pub struct RetryDispatcher<D> {
    policies: Rc<[RetryPolicy]>,
    max_retry: u8,
    backoff: Option<Duration>,
    dispatcher: Rc<D>,
}

impl<D> Clone for RetryDispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            policies: self.policies.clone(),
            max_retry: self.max_retry,
            backoff: self.backoff,
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<D> RetryDispatcher<D> {
    /// Whether another attempt follows a failed one. Waits out the backoff if so.
    async fn again(&self, tries: &mut u8, err: &SendRequestError) -> bool {
        if !err.is_retryable() {
            return false;
        }

        if *tries == self.max_retry {
            log::debug!("Request max retry reached");
            return false;
        }

        log::debug!("retrying request after error: {err}");
        self.next_attempt(tries).await;
        true
    }

    async fn next_attempt(&self, tries: &mut u8) {
        *tries += 1;

        if let Some(backoff) = self.backoff {
            actix_rt::time::sleep(backoff).await;
        }
    }
}

impl<D> Dispatcher for RetryDispatcher<D>
where
    D: Dispatcher + 'static,
{
    fn dispatch(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        let this = self.clone();

        Box::pin(async move {
            let mut tries = 0;

            loop {
                match this.dispatcher.dispatch(req.clone()).await {
                    Ok(res) => {
                        if is_valid_response(&this.policies, res.status(), res.headers()) {
                            return Ok(res);
                        }

                        if tries == this.max_retry {
                            log::debug!("Request max retry reached");
                            return Ok(res);
                        }

                        drop(res);
                        this.next_attempt(&mut tries).await;
                    }

                    Err(err) => {
                        if !this.again(&mut tries, &err).await {
                            return Err(err);
                        }
                    }
                }
            }
        })
    }

    fn dispatch_streaming(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<(ResponseHead, Tunnel), SendRequestError>> {
        let this = self.clone();

        Box::pin(async move {
            let mut tries = 0;

            loop {
                match this.dispatcher.dispatch_streaming(req.clone()).await {
                    Ok((head, tunnel)) => {
                        if is_valid_response(&this.policies, head.status, &head.headers) {
                            return Ok((head, tunnel));
                        }

                        if tries == this.max_retry {
                            log::debug!("Request max retry reached");
                            return Ok((head, tunnel));
                        }

                        drop(tunnel);
                        this.next_attempt(&mut tries).await;
                    }

                    Err(err) => {
                        if !this.again(&mut tries, &err).await {
                            return Err(err);
                        }
                    }
                }
            }
        })
    }
}

/// Checks whether the response matches the policies
fn is_valid_response(
    policies: &[RetryPolicy],
    status_code: StatusCode,
    headers: &HeaderMap,
) -> bool {
    policies.iter().all(|policy| {
        match policy {
            RetryPolicy::Status(v) => {
                // is valid if:
                // - the list of status codes is empty
                // or
                // - the list doesn't contain the received status code
                v.is_empty() || !v.contains(&status_code)
            }
            RetryPolicy::Custom(func) => func(status_code, headers),
        }
    })
}
