//! Heuristics for spotting dev-server launches and the ports they bind.

use std::sync::LazyLock;

use regex::Regex;

/// Recognizes server-launch commands and the ports they listen on.
pub trait ServerMatcher: Send + Sync {
    /// Family of server the command launches, or `None` for ordinary commands.
    fn server_kind(&self, command: &str) -> Option<&'static str>;

    /// Port mentioned in a command line or in server output.
    fn detect_port(&self, text: &str) -> Option<u16>;

    /// Whether `new_command` would collide with the already running `existing_command`.
    ///
    /// Same family or same explicit port collide; two explicit, different ports never do.
    fn is_compatible(&self, new_command: &str, existing_command: &str) -> bool {
        let (Some(new_kind), Some(old_kind)) = (
            self.server_kind(new_command),
            self.server_kind(existing_command),
        ) else {
            return false;
        };
        match (self.detect_port(new_command), self.detect_port(existing_command)) {
            (Some(a), Some(b)) => a == b,
            _ => new_kind == old_kind,
        }
    }
}

static SERVER_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("node", r"\b(?:npm|pnpm|yarn|bun)\s+(?:run\s+)?(?:dev|start|serve|preview)\b"),
        ("vite", r"\b(?:npx\s+)?vite(?:\s+(?:dev|preview|serve))?(?:\s|$)"),
        ("next", r"\bnext\s+(?:dev|start)\b"),
        ("node", r"\b(?:nodemon|http-server|live-server)\b"),
        ("python-http", r"\bpython3?\s+-m\s+http\.server\b"),
        ("django", r"\bmanage\.py\s+runserver\b"),
        ("flask", r"\bflask\s+run\b"),
        ("asgi", r"\b(?:uvicorn|gunicorn|hypercorn)\b"),
        ("rails", r"\brails\s+s(?:erver)?\b"),
        ("php", r"\bphp\s+(?:-S\b|artisan\s+serve\b)"),
        ("hugo", r"\bhugo\s+serve(?:r)?\b"),
        ("jekyll", r"\bjekyll\s+serve\b"),
        ("cargo", r"\bcargo\s+(?:watch|leptos\s+watch|shuttle\s+run)\b"),
    ]
    .into_iter()
    .filter_map(|(kind, p)| Regex::new(p).ok().map(|re| (kind, re)))
    .collect()
});

static PORT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::\]|\[::1\]):(\d{4,5})\b",
        r"(?i)\bport\b\D{0,12}?(\d{4,5})\b",
        r"\bhttp\.server\s+(\d{4,5})\b",
        r"\brunserver\s+(?:[\d.]+:)?(\d{4,5})\b",
        r"\s-p\s*(\d{4,5})\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Regex-based matcher covering common web tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternMatcher;

impl ServerMatcher for PatternMatcher {
    fn server_kind(&self, command: &str) -> Option<&'static str> {
        SERVER_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(command))
            .map(|(kind, _)| *kind)
    }

    fn detect_port(&self, text: &str) -> Option<u16> {
        PORT_PATTERNS.iter().find_map(|re| {
            re.captures_iter(text)
                .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
                .find(|port| *port >= 1000)
        })
    }
}
