use actix_http::{header::HeaderMap, Method, RequestHead, Uri};
use bytes::Bytes;

/// An encoded request ready to be handed to a driver.
///
/// The body is held as [`Bytes`] so that decorators such as [`Retry`](crate::middleware::Retry)
/// can replay the request cheaply.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    head: RequestHead,
    body: Bytes,
}

impl ClientRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        let mut head = RequestHead::default();
        head.method = method;
        head.uri = uri;

        ClientRequest {
            head,
            body: Bytes::new(),
        }
    }

    /// Replaces the request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut RequestHead {
        &mut self.head
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    /// Adds every header of `defaults` whose name the request does not carry yet.
    ///
    /// All values of a missing name are appended.
    pub(crate) fn set_default_headers(&mut self, defaults: &HeaderMap) {
        for key in defaults.keys() {
            if self.head.headers.contains_key(key) {
                continue;
            }

            for value in defaults.get_all(key) {
                self.head.headers.append(key.clone(), value.clone());
            }
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_parts(self) -> (RequestHead, Bytes) {
        (self.head, self.body)
    }
}

#[cfg(test)]
mod tests {
    use actix_http::header::{HeaderName, HeaderValue, ACCEPT, USER_AGENT};

    use super::*;

    #[test]
    fn default_headers_fill_only_missing_names() {
        let mut defaults = HeaderMap::new();
        defaults.insert(USER_AGENT, HeaderValue::from_static("courier"));
        defaults.append(ACCEPT, HeaderValue::from_static("text/plain"));
        defaults.append(ACCEPT, HeaderValue::from_static("text/html"));

        let mut req = ClientRequest::new(Method::GET, Uri::from_static("http://localhost/"));
        req.headers_mut()
            .insert(USER_AGENT, HeaderValue::from_static("custom"));
        req.headers_mut().insert(
            HeaderName::from_static("x-trace"),
            HeaderValue::from_static("1"),
        );

        req.set_default_headers(&defaults);

        assert_eq!(req.headers().get_all(USER_AGENT).count(), 1);
        assert_eq!(req.headers().get(USER_AGENT).unwrap(), "custom");
        assert_eq!(req.headers().get_all(ACCEPT).count(), 2);
        assert_eq!(req.headers().get("x-trace").unwrap(), "1");
    }
}
