//! Actix-web middleware for format-string access logs.
//! This middleware is inspired by the `actix-web`'s `Logger` middleware.
//!
//! For each request it renders one line from a compiled format (a named
//! preset, a `:token[arg]` pattern string, or a custom function) and
//! writes it to a sink (standard output by default).
//!
//! # Examples:
//! ## Presets
//! ```rust,no_run
//! use actix_web::{web, App, HttpServer};
//! use actix_web_middleware_accesslog::AccessLogger;
//!
//! #[actix_web::main] // or #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     HttpServer::new(|| {
//!         App::new()
//!             .wrap(AccessLogger::new("tiny"))
//!             .route("/", web::get().to(|| async { "Hello world!" }))
//!     })
//!     .bind("127.0.0.1:8080")?
//!     .run()
//!     .await
//! }
//! ```
//! With the `tiny` preset the example above logs lines like:
//! ```text
//! GET / 200 12 - 0 ms
//! ```
//!
//! ## Pattern strings
//! Any string with at least one `:token` reference is a valid format:
//! ```rust
//! use actix_web_middleware_accesslog::AccessLogger;
//!
//! let logger = AccessLogger::new(":remote-addr :method :url -> :status (:response-time ms)");
//! ```
//!
//! ## Custom tokens, presets and options
//! ```rust
//! use actix_web_middleware_accesslog::AccessLogger;
//!
//! let logger = AccessLogger::builder()
//!     .token("short-ua", |ctx, _| {
//!         ctx.request_header("user-agent")
//!             .map(|ua| ua.chars().take(16).collect())
//!     })
//!     .format("audit", ":date[iso] :method :url :status :short-ua")
//!     .skip(|ctx| ctx.uri().starts_with("/health"))
//!     .build("audit")
//!     .unwrap();
//! ```
//!
//! # Built-in presets
//! - `combined`: Apache combined log format
//! - `common`: Apache common log format
//! - `short`: shorter than `common`, with response time
//! - `tiny`: the minimal output
//! - `dev`: concise output colored by response status, for development
//!
//! # Built-in tokens
//! - `:method`, `:url`, `:http-version`: the request line
//! - `:status`: response status code, `-` until the response head exists
//! - `:response-time`: milliseconds from request arrival to completion
//! - `:date[clf|iso|web]`: timestamp in the given shape, UTC (default `web`)
//! - `:remote-addr`: client address, proxy-aware
//! - `:remote-user`: always `-` (no authentication integration)
//! - `:referrer`, `:user-agent`: the matching request headers
//! - `:req[name]`, `:res[name]`: any request/response header, multiple
//!   values joined with `", "`
//!
//! Tokens with nothing to report render `-`; unknown token names do too,
//! without failing.

mod context;
mod date;
mod format;
mod logger;
mod token;

pub use crate::context::LogContext;
pub use crate::format::{Format, FormatError, FormatFn, FormatSpec, FormatTable};
pub use crate::logger::{AccessLogResponse, AccessLogger, AccessLoggerService, Builder, StreamLog};
pub use crate::token::{TokenFn, TokenRegistry};
