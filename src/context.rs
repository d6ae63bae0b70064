use actix_http::Version;
use actix_web::body::BodySize;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use actix_web::http::{Method, StatusCode};
use time::OffsetDateTime;

/// Per-request view handed to tokens, custom formats and skip predicates.
///
/// The request side is snapshotted when the middleware first sees the
/// request, so it stays readable after the request itself has been consumed
/// by downstream handlers. The response side is filled in once the response
/// head exists; until then [`status`](LogContext::status) and
/// [`response_header`](LogContext::response_header) return `None`.
#[derive(Debug)]
pub struct LogContext {
    method: Method,
    uri: String,
    version: Version,
    request_headers: HeaderMap,
    remote_addr: Option<String>,
    started_at: OffsetDateTime,
    status: Option<StatusCode>,
    response_headers: HeaderMap,
    completed_at: Option<OffsetDateTime>,
    completed: bool,
}

impl LogContext {
    pub(crate) fn from_request(req: &ServiceRequest, now: OffsetDateTime) -> LogContext {
        let remote_addr = req
            .connection_info()
            .realip_remote_addr()
            .map(|addr| addr.to_string());

        LogContext {
            method: req.method().clone(),
            uri: req.uri().to_string(),
            version: req.version(),
            request_headers: req.headers().clone(),
            remote_addr,
            started_at: now,
            status: None,
            response_headers: HeaderMap::new(),
            completed_at: None,
            completed: false,
        }
    }

    /// Record the response head once the inner service has produced it.
    ///
    /// actix computes `Content-Length` while encoding the response, after
    /// this middleware runs, so a sized body that did not set the header
    /// explicitly is recorded here under `content-length`, the value that
    /// reaches the wire. Streaming bodies are sent chunked and stay absent.
    pub(crate) fn record_response(
        &mut self,
        status: StatusCode,
        mut headers: HeaderMap,
        body_size: BodySize,
    ) {
        if !headers.contains_key(header::CONTENT_LENGTH) {
            if let BodySize::Sized(len) = body_size {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
        }
        self.status = Some(status);
        self.response_headers = headers;
    }

    /// Mark the request completed, stamping the end time. Idempotent.
    pub(crate) fn complete(&mut self, now: OffsetDateTime) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.completed_at = Some(now);
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Effective request URI (path plus query string).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// HTTP protocol version of the request.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Response status, once the response head exists.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Client address, proxy-aware (`Forwarded`/`X-Forwarded-For` first,
    /// peer address otherwise).
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// When the middleware started handling the request.
    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    /// When the request completed; `None` while still in flight.
    pub fn completed_at(&self) -> Option<OffsetDateTime> {
        self.completed_at
    }

    /// Whether the request has reached its terminal state.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Elapsed whole milliseconds between start and completion.
    pub fn response_time_millis(&self) -> Option<i128> {
        self.completed_at
            .map(|end| (end - self.started_at).whole_milliseconds())
    }

    /// Named request header; multiple values are joined with `", "`.
    pub fn request_header(&self, name: &str) -> Option<String> {
        joined_values(&self.request_headers, name)
    }

    /// Named response header; multiple values are joined with `", "`.
    pub fn response_header(&self, name: &str) -> Option<String> {
        joined_values(&self.response_headers, name)
    }
}

fn joined_values(headers: &HeaderMap, name: &str) -> Option<String> {
    let name = HeaderName::try_from(name).ok()?;
    let values: Vec<&str> = headers
        .get_all(&name)
        .filter_map(|value| value.to_str().ok())
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}
