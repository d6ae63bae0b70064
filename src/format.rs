//! Format specifications and the pattern compiler.
//!
//! A format is resolved once, at middleware construction, into a renderer
//! that is reused for every request. Pattern strings use `:token` references
//! with an optional bracketed argument, e.g.
//! `:method :url :status :res[content-length] - :response-time ms`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;
use thiserror::Error;

use crate::context::LogContext;
use crate::token::{TokenFn, TokenRegistry};

/// Token reference syntax: `:<name>` with two or more word/hyphen
/// characters, optionally followed by `[<argument>]`.
const TOKEN_SYNTAX: &str = r":([-\w]{2,})(?:\[([^\]]+)\])?";

/// A custom line renderer. Returning `None` suppresses the line entirely.
pub type FormatFn = Rc<dyn Fn(&LogContext) -> Option<String>>;

/// Construction-time format failures. Never raised per request.
#[derive(Debug, Error)]
pub enum FormatError {
    /// A pattern string with no token references compiles to a constant
    /// line, which is always a configuration mistake.
    #[error("invalid format {pattern:?}: contains no token references")]
    Empty { pattern: String },
}

/// What a caller hands to the middleware: a preset name, a literal pattern,
/// or a custom function.
///
/// `From<&str>`/`From<String>` produce [`Named`](FormatSpec::Named); a name
/// missing from the [`FormatTable`] is then compiled as a pattern, so any
/// string with at least one token reference is a valid format.
pub enum FormatSpec {
    /// Key into the preset table.
    Named(String),
    /// Literal `:token` pattern, compiled without a preset lookup.
    Pattern(String),
    /// Caller-supplied renderer, used verbatim.
    Custom(FormatFn),
}

impl FormatSpec {
    /// A literal pattern, bypassing the preset table.
    pub fn pattern(pattern: impl Into<String>) -> FormatSpec {
        FormatSpec::Pattern(pattern.into())
    }

    /// A custom renderer; returning `None` suppresses the line.
    pub fn custom<F>(format: F) -> FormatSpec
    where
        F: Fn(&LogContext) -> Option<String> + 'static,
    {
        FormatSpec::Custom(Rc::new(format))
    }
}

impl From<&str> for FormatSpec {
    fn from(name: &str) -> FormatSpec {
        FormatSpec::Named(name.to_string())
    }
}

impl From<String> for FormatSpec {
    fn from(name: String) -> FormatSpec {
        FormatSpec::Named(name)
    }
}

/// A preset table entry.
pub enum Format {
    /// A `:token` pattern string.
    Pattern(String),
    /// A custom renderer.
    Custom(FormatFn),
    /// The colored development format; compiled lazily per status color.
    Dev,
}

impl Format {
    /// A custom renderer entry.
    pub fn custom<F>(format: F) -> Format
    where
        F: Fn(&LogContext) -> Option<String> + 'static,
    {
        Format::Custom(Rc::new(format))
    }
}

impl From<&str> for Format {
    fn from(pattern: &str) -> Format {
        Format::Pattern(pattern.to_string())
    }
}

impl From<String> for Format {
    fn from(pattern: String) -> Format {
        Format::Pattern(pattern)
    }
}

/// Named presets. [`FormatTable::default`] carries the built-ins;
/// registering an existing name overwrites it.
pub struct FormatTable {
    formats: HashMap<String, Format>,
}

impl FormatTable {
    /// A table with no presets.
    pub fn empty() -> FormatTable {
        FormatTable {
            formats: HashMap::new(),
        }
    }

    /// Add or overwrite a preset under `name`.
    pub fn register(&mut self, name: impl Into<String>, format: impl Into<Format>) {
        self.formats.insert(name.into(), format.into());
    }

    pub(crate) fn resolve(
        &self,
        spec: FormatSpec,
        tokens: &Rc<TokenRegistry>,
    ) -> Result<Renderer, FormatError> {
        match spec {
            FormatSpec::Named(name) => match self.formats.get(&name) {
                Some(Format::Pattern(pattern)) => {
                    Ok(Renderer::Compiled(compile(pattern, tokens)?))
                }
                Some(Format::Custom(format)) => Ok(Renderer::Custom(Rc::clone(format))),
                Some(Format::Dev) => Ok(Renderer::Dev(DevRenderer::new(Rc::clone(tokens)))),
                // Unregistered names are treated as literal patterns.
                None => Ok(Renderer::Compiled(compile(&name, tokens)?)),
            },
            FormatSpec::Pattern(pattern) => Ok(Renderer::Compiled(compile(&pattern, tokens)?)),
            FormatSpec::Custom(format) => Ok(Renderer::Custom(format)),
        }
    }
}

impl Default for FormatTable {
    /// The built-in presets: `combined`, `common`, `short`, `tiny`, `dev`.
    fn default() -> FormatTable {
        let mut table = FormatTable::empty();

        // Apache combined log format.
        table.register(
            "combined",
            ":remote-addr - :remote-user [:date[clf]] \":method :url HTTP/:http-version\" :status :res[content-length] \":referrer\" \":user-agent\"",
        );

        // Apache common log format.
        table.register(
            "common",
            ":remote-addr - :remote-user [:date[clf]] \":method :url HTTP/:http-version\" :status :res[content-length]",
        );

        table.register(
            "short",
            ":remote-addr :remote-user :method :url HTTP/:http-version :status :res[content-length] - :response-time ms",
        );

        table.register(
            "tiny",
            ":method :url :status :res[content-length] - :response-time ms",
        );

        table.register("dev", Format::Dev);

        table
    }
}

/// The executable form of a format specification.
pub(crate) enum Renderer {
    Compiled(CompiledFormat),
    Custom(FormatFn),
    Dev(DevRenderer),
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Renderer::Compiled(_) => "Compiled",
            Renderer::Custom(_) => "Custom",
            Renderer::Dev(_) => "Dev",
        };
        f.debug_tuple(name).finish()
    }
}

impl Renderer {
    pub(crate) fn render(&self, ctx: &LogContext) -> Option<String> {
        match self {
            Renderer::Compiled(compiled) => Some(compiled.render(ctx)),
            Renderer::Custom(format) => format(ctx),
            Renderer::Dev(dev) => Some(dev.render(ctx)),
        }
    }
}

/// An ordered sequence of literal and token segments, bound to their token
/// functions at compile time. Immutable once built.
pub(crate) struct CompiledFormat {
    segments: Vec<Segment>,
}

enum Segment {
    Literal(String),
    Token {
        // Unresolved names bind no function and render "-".
        func: Option<TokenFn>,
        arg: Option<String>,
    },
}

impl CompiledFormat {
    fn render(&self, ctx: &LogContext) -> String {
        let mut line = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => line.push_str(text),
                Segment::Token { func, arg } => {
                    let value = func.as_ref().and_then(|func| func(ctx, arg.as_deref()));
                    match value {
                        Some(value) if !value.is_empty() => line.push_str(&value),
                        _ => line.push('-'),
                    }
                }
            }
        }
        line
    }
}

fn compile(pattern: &str, tokens: &TokenRegistry) -> Result<CompiledFormat, FormatError> {
    let syntax = Regex::new(TOKEN_SYNTAX).unwrap();

    let mut segments = Vec::new();
    let mut token_refs = 0;
    let mut tail = 0;

    for caps in syntax.captures_iter(pattern) {
        let reference = caps.get(0).unwrap();
        if reference.start() > tail {
            segments.push(Segment::Literal(pattern[tail..reference.start()].to_string()));
        }

        token_refs += 1;
        segments.push(Segment::Token {
            func: tokens.resolve(&caps[1]),
            arg: caps.get(2).map(|arg| arg.as_str().to_string()),
        });

        tail = reference.end();
    }

    if token_refs == 0 {
        return Err(FormatError::Empty {
            pattern: pattern.to_string(),
        });
    }

    if tail < pattern.len() {
        segments.push(Segment::Literal(pattern[tail..].to_string()));
    }

    Ok(CompiledFormat { segments })
}

/// The `dev` preset: concise line with the status colored by class.
///
/// The wrapping pattern is compiled once per distinct color and cached, so
/// steady-state rendering costs one map lookup.
pub(crate) struct DevRenderer {
    tokens: Rc<TokenRegistry>,
    by_color: RefCell<HashMap<u8, Rc<CompiledFormat>>>,
}

impl DevRenderer {
    fn new(tokens: Rc<TokenRegistry>) -> DevRenderer {
        DevRenderer {
            tokens,
            by_color: RefCell::new(HashMap::new()),
        }
    }

    fn render(&self, ctx: &LogContext) -> String {
        let status = ctx.status().map(|status| status.as_u16()).unwrap_or(0);
        let color: u8 = if status >= 500 {
            31 // red
        } else if status >= 400 {
            33 // yellow
        } else if status >= 300 {
            36 // cyan
        } else if status >= 200 {
            32 // green
        } else {
            0 // no color
        };

        let compiled = {
            let mut cache = self.by_color.borrow_mut();
            match cache.get(&color) {
                Some(compiled) => Rc::clone(compiled),
                None => {
                    let pattern = format!(
                        "\x1b[0m:method :url \x1b[{color}m:status \x1b[0m:response-time ms - :res[content-length]\x1b[0m"
                    );
                    let compiled = Rc::new(compile(&pattern, &self.tokens).unwrap());
                    cache.insert(color, Rc::clone(&compiled));
                    compiled
                }
            }
        };

        compiled.render(ctx)
    }
}
