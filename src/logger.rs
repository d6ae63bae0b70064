use std::cell::RefCell;
use std::future::Future;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::ready;
use pin_project_lite::pin_project;
use time::OffsetDateTime;

use actix_service::{Service, Transform};
use actix_utils::future::{Ready, ready};
use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::http::header::HeaderMap;
use actix_web::{Error, Result};

use crate::context::LogContext;
use crate::format::{Format, FormatError, FormatSpec, FormatTable, Renderer};
use crate::token::TokenRegistry;

/// Middleware that writes one formatted line per request to a sink.
///
/// The format (a preset name, a `:token` pattern, or a custom function)
/// is compiled once at construction and reused for every request.
///
/// # Examples
/// ```rust
/// use actix_web::App;
/// use actix_web_middleware_accesslog::AccessLogger;
///
/// let app = App::new()
///     .wrap(AccessLogger::new(":method :url :status - :response-time ms"));
/// ```
///
/// By default the line is emitted when the response has finished; tokens
/// that depend on the response (`:status`, `:response-time`, `:res[..]`)
/// carry their final values. With [`Builder::immediate`] the line is
/// emitted on request arrival instead and those tokens render `-`.
pub struct AccessLogger(Rc<Inner>);

struct Inner {
    renderer: Renderer,
    immediate: bool,
    skip: Option<SkipFn>,
    sink: Rc<RefCell<dyn io::Write>>,
}

type SkipFn = Rc<dyn Fn(&LogContext) -> bool>;

impl AccessLogger {
    /// Create the middleware with the given format and default options
    /// (deferred emission, no skip predicate, standard output).
    ///
    /// # Panics
    /// Panics if the format resolves to a pattern without token references.
    /// Use [`Builder::build`] to handle the failure instead.
    pub fn new(format: impl Into<FormatSpec>) -> AccessLogger {
        AccessLogger::builder().build(format).unwrap()
    }

    /// Configure tokens, presets, emission policy, skip predicate and sink.
    pub fn builder() -> Builder {
        Builder::default()
    }
}

impl Default for AccessLogger {
    /// The `combined` preset, written to standard output.
    fn default() -> AccessLogger {
        AccessLogger::new("combined")
    }
}

/// Configures and builds an [`AccessLogger`].
///
/// The builder owns the token registry and preset table the format is
/// compiled against; both start with the built-in entries and are frozen
/// into the middleware by [`build`](Builder::build).
///
/// # Examples
/// ```rust
/// use actix_web_middleware_accesslog::AccessLogger;
///
/// let logger = AccessLogger::builder()
///     .token("request-path", |ctx, _| Some(ctx.uri().to_string()))
///     .format("mine", ":method :request-path :status")
///     .skip(|ctx| ctx.uri().starts_with("/health"))
///     .build("mine")
///     .unwrap();
/// ```
pub struct Builder {
    tokens: TokenRegistry,
    formats: FormatTable,
    immediate: bool,
    skip: Option<SkipFn>,
    sink: Option<Rc<RefCell<dyn io::Write>>>,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            tokens: TokenRegistry::default(),
            formats: FormatTable::default(),
            immediate: false,
            skip: None,
            sink: None,
        }
    }
}

impl Builder {
    /// Register a token, overwriting any existing one with the same name.
    pub fn token<F>(mut self, name: impl Into<String>, token: F) -> Builder
    where
        F: Fn(&LogContext, Option<&str>) -> Option<String> + 'static,
    {
        self.tokens.register(name, token);
        self
    }

    /// Register a preset (pattern string or [`Format::custom`] function),
    /// overwriting any existing one with the same name.
    pub fn format(mut self, name: impl Into<String>, format: impl Into<Format>) -> Builder {
        self.formats.register(name, format);
        self
    }

    /// Emit on request arrival instead of on completion.
    pub fn immediate(mut self, immediate: bool) -> Builder {
        self.immediate = immediate;
        self
    }

    /// Suppress the line for requests where the predicate returns `true`.
    /// The predicate sees the same context state the tokens would.
    pub fn skip<F>(mut self, skip: F) -> Builder
    where
        F: Fn(&LogContext) -> bool + 'static,
    {
        self.skip = Some(Rc::new(skip));
        self
    }

    /// Write lines to `sink` instead of standard output.
    pub fn sink(mut self, sink: impl io::Write + 'static) -> Builder {
        self.sink = Some(Rc::new(RefCell::new(sink)));
        self
    }

    /// Resolve and compile the format, freezing the registries.
    pub fn build(self, format: impl Into<FormatSpec>) -> Result<AccessLogger, FormatError> {
        let tokens = Rc::new(self.tokens);
        let renderer = self.formats.resolve(format.into(), &tokens)?;

        Ok(AccessLogger(Rc::new(Inner {
            renderer,
            immediate: self.immediate,
            skip: self.skip,
            sink: self
                .sink
                .unwrap_or_else(|| Rc::new(RefCell::new(io::stdout()))),
        })))
    }
}

impl<S, B> Transform<S, ServiceRequest> for AccessLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Transform = AccessLoggerService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AccessLoggerService {
            service,
            inner: Rc::clone(&self.0),
        }))
    }
}

/// Logger middleware service.
pub struct AccessLoggerService<S> {
    inner: Rc<Inner>,
    service: S,
}

impl<S, B> Service<ServiceRequest> for AccessLoggerService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    type Response = ServiceResponse<StreamLog<B>>;
    type Error = Error;
    type Future = AccessLogResponse<S, B>;

    actix_service::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let ctx = LogContext::from_request(&req, OffsetDateTime::now_utc());
        let emit = Emit {
            ctx: Rc::new(RefCell::new(ctx)),
            inner: Rc::clone(&self.inner),
        };

        let emit = if self.inner.immediate {
            // Before downstream handling: completion-dependent tokens
            // render "-".
            emit.emit();
            None
        } else {
            Some(emit)
        };

        AccessLogResponse {
            fut: self.service.call(req),
            emit,
            _phantom: PhantomData,
        }
    }
}

/// The pending emission for one request: the shared context plus everything
/// needed to render and write the line. Consumed exactly once.
struct Emit {
    ctx: Rc<RefCell<LogContext>>,
    inner: Rc<Inner>,
}

impl Emit {
    fn record_response(&self, status: StatusCode, headers: HeaderMap, body_size: BodySize) {
        self.ctx
            .borrow_mut()
            .record_response(status, headers, body_size);
    }

    fn complete_and_emit(self) {
        self.ctx.borrow_mut().complete(OffsetDateTime::now_utc());
        self.emit();
    }

    fn emit(self) {
        let ctx = self.ctx.borrow();

        if let Some(skip) = &self.inner.skip {
            if skip(&ctx) {
                return;
            }
        }

        // A custom format returning None suppresses the line; an empty
        // string still produces a bare newline.
        let Some(line) = self.inner.renderer.render(&ctx) else {
            return;
        };

        let mut sink = self.inner.sink.borrow_mut();
        if let Err(err) = writeln!(sink, "{line}") {
            log::debug!("access log write failed: {err}");
        }
    }
}

pin_project! {
    pub struct AccessLogResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        #[pin]
        fut: S::Future,
        emit: Option<Emit>,
        _phantom: PhantomData<B>,
    }

    impl<S, B> PinnedDrop for AccessLogResponse<S, B>
    where
        B: MessageBody,
        S: Service<ServiceRequest>,
    {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            // Dropped before a response was produced: the request aborted.
            // Complete with no response data so :status and :res[..] render
            // "-", and still emit the line.
            if let Some(emit) = this.emit.take() {
                emit.complete_and_emit();
            }
        }
    }
}

impl<S, B> Future for AccessLogResponse<S, B>
where
    B: MessageBody,
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
{
    type Output = Result<ServiceResponse<StreamLog<B>>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let res = match ready!(this.fut.poll(cx)) {
            Ok(res) => res,
            Err(err) => {
                // The response never materializes; treat like an abort.
                if let Some(emit) = this.emit.take() {
                    emit.complete_and_emit();
                }
                return Poll::Ready(Err(err));
            }
        };

        if let Some(err) = res.response().error() {
            log::debug!("error in response: {err:?}");
        }

        if let Some(emit) = this.emit.as_ref() {
            emit.record_response(
                res.status(),
                res.response().headers().clone(),
                res.response().body().size(),
            );
        }

        // Hand the pending emission to the body wrapper; its drop marks
        // completion.
        let emit = this.emit.take();
        Poll::Ready(Ok(res.map_body(move |_, body| StreamLog { body, emit })))
    }
}

pin_project! {
    /// Response body wrapper. Dropping it (the response finished streaming,
    /// or the client went away mid-body) completes the request and emits
    /// the log line.
    pub struct StreamLog<B> {
        #[pin]
        body: B,
        emit: Option<Emit>,
    }

    impl<B> PinnedDrop for StreamLog<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(emit) = this.emit.take() {
                emit.complete_and_emit();
            }
        }
    }
}

impl<B: MessageBody> MessageBody for StreamLog<B> {
    type Error = B::Error;

    #[inline]
    fn size(&self) -> BodySize {
        self.body.size()
    }

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.project();

        match ready!(this.body.poll_next(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_service::fn_service;
    use actix_web::error::ErrorInternalServerError;
    use actix_web::{App, HttpResponse, test, web};
    use regex::Regex;
    use std::task::Waker;

    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl SharedSink {
        fn contents(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    impl io::Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logger(sink: &SharedSink, format: impl Into<FormatSpec>) -> AccessLogger {
        AccessLogger::builder()
            .sink(sink.clone())
            .build(format)
            .unwrap()
    }

    #[actix_web::test]
    async fn renders_method_and_url() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new()
                .wrap(logger(&sink, ":method :url"))
                .route("/foo", web::get().to(|| async { HttpResponse::Ok().body("hi") })),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/foo").to_request()).await;
        assert!(res.status().is_success());
        drop(res);

        assert_eq!(sink.contents(), "GET /foo\n");
    }

    #[actix_web::test]
    async fn tiny_preset_logs_status_length_and_time() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new().wrap(logger(&sink, "tiny")).route(
                "/",
                web::get().to(|| async { HttpResponse::Ok().body("hello, world!") }),
            ),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
        drop(res);

        let line = sink.contents();
        let shape = Regex::new(r"^GET / 200 13 - \d+ ms\n$").unwrap();
        assert!(shape.is_match(&line), "unexpected line: {line:?}");
    }

    #[actix_web::test]
    async fn immediate_emits_before_completion() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new()
                .wrap(
                    AccessLogger::builder()
                        .sink(sink.clone())
                        .immediate(true)
                        .build(":method :url :status :response-time :res[content-length]")
                        .unwrap(),
                )
                .route("/foo", web::get().to(|| async { HttpResponse::Ok().body("hi") })),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/foo").to_request()).await;

        // Already written while the request was still pending.
        assert_eq!(sink.contents(), "GET /foo - - -\n");
        drop(res);
        assert_eq!(sink.contents(), "GET /foo - - -\n");
    }

    #[actix_web::test]
    async fn skip_predicate_suppresses_output() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new()
                .wrap(
                    AccessLogger::builder()
                        .sink(sink.clone())
                        .skip(|ctx| ctx.uri().starts_with("/health"))
                        .build(":method :url")
                        .unwrap(),
                )
                .route("/health", web::get().to(|| async { HttpResponse::Ok().finish() }))
                .route("/work", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let res =
            test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        drop(res);
        assert_eq!(sink.contents(), "");

        let res =
            test::call_service(&app, test::TestRequest::get().uri("/work").to_request()).await;
        drop(res);
        assert_eq!(sink.contents(), "GET /work\n");
    }

    #[actix_web::test]
    async fn custom_format_none_suppresses_line() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new()
                .wrap(logger(&sink, FormatSpec::custom(|_| None)))
                .route("/foo", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/foo").to_request()).await;
        drop(res);

        assert_eq!(sink.contents(), "");
    }

    #[actix_web::test]
    async fn custom_format_empty_string_writes_bare_newline() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new()
                .wrap(logger(&sink, FormatSpec::custom(|_| Some(String::new()))))
                .route("/foo", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/foo").to_request()).await;
        drop(res);

        assert_eq!(sink.contents(), "\n");
    }

    #[actix_web::test]
    async fn request_header_token_reads_request() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new()
                .wrap(logger(&sink, ":req[x-from-string]"))
                .route("/foo", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let res = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/foo")
                .insert_header(("x-from-string", "me"))
                .to_request(),
        )
        .await;
        drop(res);

        assert_eq!(sink.contents(), "me\n");
    }

    #[actix_web::test]
    async fn response_header_token_joins_multiple_values() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new().wrap(logger(&sink, ":res[x-keys]")).route(
                "/foo",
                web::get().to(|| async {
                    HttpResponse::Ok()
                        .append_header(("x-keys", "foo"))
                        .append_header(("x-keys", "bar"))
                        .finish()
                }),
            ),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/foo").to_request()).await;
        drop(res);

        assert_eq!(sink.contents(), "foo, bar\n");
    }

    #[actix_web::test]
    async fn one_line_per_request() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new()
                .wrap(logger(&sink, ":method :url"))
                .route("/foo", web::get().to(|| async { HttpResponse::Ok().body("hi") })),
        )
        .await;

        for _ in 0..2 {
            let res =
                test::call_service(&app, test::TestRequest::get().uri("/foo").to_request()).await;
            let body = test::read_body(res).await;
            assert_eq!(body, "hi");
        }

        assert_eq!(sink.contents(), "GET /foo\nGET /foo\n");
    }

    #[actix_web::test]
    async fn handler_error_logs_final_status() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new().wrap(logger(&sink, ":method :url :status")).route(
                "/err",
                web::get()
                    .to(|| async { Err::<HttpResponse, _>(ErrorInternalServerError("boom")) }),
            ),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/err").to_request()).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        drop(res);

        assert_eq!(sink.contents(), "GET /err 500\n");
    }

    #[actix_web::test]
    async fn aborted_request_emits_with_unavailable_values() {
        let sink = SharedSink::default();
        let srv = logger(&sink, ":method :url :status")
            .new_transform(fn_service(|_req: ServiceRequest| async {
                std::future::pending::<Result<ServiceResponse, Error>>().await
            }))
            .await
            .unwrap();

        {
            let fut = srv.call(test::TestRequest::get().uri("/slow").to_srv_request());
            let mut fut = std::pin::pin!(fut);
            let mut cx = Context::from_waker(Waker::noop());
            assert!(fut.as_mut().poll(&mut cx).is_pending());
            // Dropping the in-flight future is the client going away.
        }

        assert_eq!(sink.contents(), "GET /slow -\n");
    }

    #[actix_web::test]
    async fn dev_preset_colors_status() {
        let sink = SharedSink::default();
        let app = test::init_service(
            App::new()
                .wrap(logger(&sink, "dev"))
                .route("/foo", web::get().to(|| async { HttpResponse::Ok().body("hi") })),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/foo").to_request()).await;
        drop(res);

        assert!(
            sink.contents().contains("\x1b[32m200"),
            "line: {:?}",
            sink.contents()
        );
    }
}
