//! Token registry: named extractors of one piece of loggable data.
//!
//! A token is a function from the request's [`LogContext`] and an optional
//! bracketed argument (`:req[x-request-id]`) to a value. Tokens producing
//! `None` or an empty string render as `-` in the finished line.

use std::collections::HashMap;
use std::rc::Rc;

use actix_http::Version;
use time::OffsetDateTime;

use crate::context::LogContext;
use crate::date;

/// A registered token function.
pub type TokenFn = Rc<dyn Fn(&LogContext, Option<&str>) -> Option<String>>;

/// Name → token map. [`TokenRegistry::default`] carries the built-ins;
/// registering an existing name overwrites it.
pub struct TokenRegistry {
    tokens: HashMap<String, TokenFn>,
}

impl TokenRegistry {
    /// A registry with no tokens at all. Patterns compiled against it
    /// render `-` for every token reference.
    pub fn empty() -> TokenRegistry {
        TokenRegistry {
            tokens: HashMap::new(),
        }
    }

    /// Add or overwrite a token under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, token: F)
    where
        F: Fn(&LogContext, Option<&str>) -> Option<String> + 'static,
    {
        self.tokens.insert(name.into(), Rc::new(token));
    }

    /// Look up a token by name.
    pub fn resolve(&self, name: &str) -> Option<TokenFn> {
        self.tokens.get(name).cloned()
    }
}

impl Default for TokenRegistry {
    /// The built-in token set.
    fn default() -> TokenRegistry {
        let mut reg = TokenRegistry::empty();

        reg.register("method", |ctx, _| Some(ctx.method().to_string()));

        reg.register("url", |ctx, _| Some(ctx.uri().to_string()));

        // Numeric code only once the response head exists; "-" before that
        // (immediate emission, aborted request).
        reg.register("status", |ctx, _| {
            ctx.status().map(|status| status.as_u16().to_string())
        });

        reg.register("response-time", |ctx, _| {
            ctx.response_time_millis().map(|ms| ms.to_string())
        });

        // Completion time once the request finished, wall clock before.
        reg.register("date", |ctx, arg| {
            let when = ctx.completed_at().unwrap_or_else(OffsetDateTime::now_utc);
            match arg.unwrap_or("web") {
                "clf" => date::clf(when),
                "iso" => date::iso(when),
                "web" => date::web(when),
                _ => None,
            }
        });

        reg.register("remote-addr", |ctx, _| {
            ctx.remote_addr().map(|addr| addr.to_string())
        });

        // No authentication integration.
        reg.register("remote-user", |_, _| Some("-".to_string()));

        reg.register("http-version", |ctx, _| {
            Some(version_token(ctx.version()).to_string())
        });

        reg.register("referrer", |ctx, _| ctx.request_header("referer"));

        reg.register("user-agent", |ctx, _| ctx.request_header("user-agent"));

        reg.register("req", |ctx, arg| {
            arg.and_then(|name| ctx.request_header(name))
        });

        reg.register("res", |ctx, arg| {
            arg.and_then(|name| ctx.response_header(name))
        });

        reg
    }
}

/// Version without the `HTTP/` prefix; the presets spell that part out
/// (`"HTTP/:http-version"`).
fn version_token(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2.0",
        Version::HTTP_3 => "3.0",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::BodySize;
    use actix_web::http::StatusCode;
    use actix_web::http::header::HeaderMap;
    use actix_web::test::TestRequest;
    use time::macros::datetime;

    fn pending_context(req: TestRequest) -> LogContext {
        LogContext::from_request(&req.to_srv_request(), datetime!(2026-01-02 03:04:05 UTC))
    }

    fn completed_context(req: TestRequest) -> LogContext {
        let mut ctx = pending_context(req);
        ctx.record_response(StatusCode::OK, HeaderMap::new(), BodySize::Sized(5));
        ctx.complete(datetime!(2026-01-02 03:04:06 UTC));
        ctx
    }

    fn render(ctx: &LogContext, name: &str, arg: Option<&str>) -> Option<String> {
        let reg = TokenRegistry::default();
        let token = reg.resolve(name).unwrap();
        token(ctx, arg)
    }

    #[test]
    fn request_line_tokens() {
        let ctx = pending_context(TestRequest::post().uri("/submit?draft=1"));

        assert_eq!(render(&ctx, "method", None).as_deref(), Some("POST"));
        assert_eq!(render(&ctx, "url", None).as_deref(), Some("/submit?draft=1"));
        assert_eq!(render(&ctx, "http-version", None).as_deref(), Some("1.1"));
        assert_eq!(render(&ctx, "remote-user", None).as_deref(), Some("-"));
    }

    #[test]
    fn completion_tokens_empty_while_pending() {
        let ctx = pending_context(TestRequest::default());

        assert_eq!(render(&ctx, "status", None), None);
        assert_eq!(render(&ctx, "response-time", None), None);
        assert_eq!(render(&ctx, "res", Some("content-length")), None);
    }

    #[test]
    fn completion_tokens_after_completion() {
        let ctx = completed_context(TestRequest::default());

        assert_eq!(render(&ctx, "status", None).as_deref(), Some("200"));
        assert_eq!(render(&ctx, "response-time", None).as_deref(), Some("1000"));
        assert_eq!(render(&ctx, "res", Some("content-length")).as_deref(), Some("5"));
    }

    #[test]
    fn header_tokens() {
        let ctx = pending_context(
            TestRequest::default()
                .insert_header(("user-agent", "curl/8.5.0"))
                .insert_header(("referer", "https://example.com/"))
                .insert_header(("x-from-string", "me")),
        );

        assert_eq!(render(&ctx, "user-agent", None).as_deref(), Some("curl/8.5.0"));
        assert_eq!(
            render(&ctx, "referrer", None).as_deref(),
            Some("https://example.com/")
        );
        assert_eq!(render(&ctx, "req", Some("x-from-string")).as_deref(), Some("me"));
        // req/res without an argument have nothing to look up.
        assert_eq!(render(&ctx, "req", None), None);
    }

    #[test]
    fn date_token_uses_completion_time() {
        let ctx = completed_context(TestRequest::default());

        assert_eq!(
            render(&ctx, "date", Some("clf")).as_deref(),
            Some("02/Jan/2026:03:04:06 +0000")
        );
        assert_eq!(
            render(&ctx, "date", Some("iso")).as_deref(),
            Some("2026-01-02T03:04:06Z")
        );
        assert_eq!(
            render(&ctx, "date", Some("web")).as_deref(),
            Some("Fri, 02 Jan 2026 03:04:06 GMT")
        );
        assert_eq!(render(&ctx, "date", Some("bogus")), None);
    }

    #[test]
    fn register_overwrites() {
        let mut reg = TokenRegistry::default();
        reg.register("method", |_, _| Some("always".to_string()));

        let ctx = pending_context(TestRequest::get());
        assert_eq!(reg.resolve("method").unwrap()(&ctx, None).as_deref(), Some("always"));
        assert!(reg.resolve("no-such-token").is_none());
    }
}
