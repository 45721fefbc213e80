//! Path pattern compiler.
//!
//! Turns a route path such as `/users/:id(\d+)/files/:rest*` into an anchored
//! [`Regex`] plus the ordered list of parameter names it captures.
//!
//! | Syntax          | Meaning                                   |
//! |-----------------|-------------------------------------------|
//! | `:name`         | one segment, captured as `name`           |
//! | `:name(re)`     | captured as `name`, must match `re`       |
//! | `(re)`          | unnamed capture, keyed `"0"`, `"1"`, ...  |
//! | `?` `*` `+`     | optional, zero-or-more, one-or-more       |
//! | `\x`            | literal `x`                               |

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::context::Parameters;

// escaped char | prefix, name, inline pattern | unnamed group, modifier | bare `*`
static PATH_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\\.)|([/.])?(?:(?::(\w+)(?:\(((?:\\.|[^\\()])+)\))?|\(((?:\\.|[^\\()])+)\))([+*?])?|(\*))")
        .expect("path token pattern is valid")
});

/// Regex flavour knobs for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherOptions {
    /// Match letter case exactly.
    pub sensitive: bool,
    /// Require the trailing slash to match exactly.
    pub strict: bool,
    /// Anchor at the end of the path; `false` matches path prefixes on a
    /// segment boundary.
    pub end: bool,
}

impl Default for MatcherOptions {
    fn default() -> Self {
        Self {
            sensitive: false,
            strict: false,
            end: true,
        }
    }
}

/// Why a path could not be compiled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatcherError {
    DuplicateParam(String),
    InvalidPattern(String),
}

#[derive(Debug, Clone)]
enum Token {
    Literal(String),
    Param(Key),
}

#[derive(Debug, Clone)]
struct Key {
    name: String,
    prefix: String,
    pattern: String,
    optional: bool,
    repeat: bool,
    partial: bool,
}

/// A compiled route pattern.
///
/// # Examples
///
/// ```
/// use routeway::router::matcher::{Matcher, MatcherOptions};
///
/// let m = Matcher::compile("/users/:id(\\d+)", MatcherOptions::default()).unwrap();
/// assert_eq!(m.keys(), ["id"]);
/// assert!(m.is_match("/users/42"));
/// assert!(m.is_match("/USERS/42/"));
/// assert!(!m.is_match("/users/ada"));
/// assert_eq!(m.captures("/users/42").unwrap().get("id"), Some("42"));
/// ```
#[derive(Debug, Clone)]
pub struct Matcher {
    regex: Regex,
    keys: Vec<String>,
}

impl Matcher {
    pub fn compile(path: &str, options: MatcherOptions) -> Result<Self, MatcherError> {
        let tokens = tokenize(path);
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        let mut route = String::new();

        for token in &tokens {
            match token {
                Token::Literal(text) => route.push_str(&regex::escape(text)),
                Token::Param(key) => {
                    if !seen.insert(key.name.clone()) {
                        return Err(MatcherError::DuplicateParam(key.name.clone()));
                    }
                    let group = format!("p{}", keys.len());
                    keys.push(key.name.clone());

                    let prefix = regex::escape(&key.prefix);
                    let mut capture = format!("(?:{})", key.pattern);
                    if key.repeat {
                        capture = format!("{capture}(?:{prefix}{capture})*");
                    }
                    let capture = if !key.optional {
                        format!("{prefix}(?P<{group}>{capture})")
                    } else if key.partial {
                        format!("{prefix}(?P<{group}>{capture})?")
                    } else {
                        format!("(?:{prefix}(?P<{group}>{capture}))?")
                    };
                    route.push_str(&capture);
                }
            }
        }

        if !options.strict {
            if let Some(stripped) = route.strip_suffix("/") {
                route.truncate(stripped.len());
            }
            route.push_str("[/#?]?");
        }
        if options.end {
            route.push('$');
        } else {
            route.push_str("(?:[/#?]|$)");
        }

        let flags = if options.sensitive { "" } else { "(?i)" };
        let regex = Regex::new(&format!("{flags}^{route}"))
            .map_err(|e| MatcherError::InvalidPattern(e.to_string()))?;
        Ok(Self { regex, keys })
    }

    /// Parameter names in capture order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Percent-decoded parameter values, or `None` when `path` does not match.
    /// Optional parameters that did not participate are left out.
    pub fn captures(&self, path: &str) -> Option<Parameters> {
        let caps = self.regex.captures(path)?;
        let mut params = Parameters::new();
        for (i, key) in self.keys.iter().enumerate() {
            if let Some(value) = caps.name(&format!("p{i}")) {
                let raw = value.as_str();
                let decoded = urlencoding::decode(raw).map_or_else(|_| raw.to_owned(), |d| d.into_owned());
                params.insert(key.as_str(), decoded);
            }
        }
        Some(params)
    }

    /// The generated regular expression.
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

fn tokenize(path: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut index = 0;
    let mut unnamed = 0usize;

    for caps in PATH_TOKEN.captures_iter(path) {
        let Some(whole) = caps.get(0) else { continue };
        literal.push_str(&path[index..whole.start()]);
        index = whole.end();

        if let Some(escaped) = caps.get(1) {
            literal.push_str(&escaped.as_str()[1..]);
            continue;
        }

        let prefix = caps.get(2).map(|m| m.as_str());
        let name = caps.get(3).map(|m| m.as_str());
        let capture = caps.get(4).or_else(|| caps.get(5)).map(|m| m.as_str());
        let modifier = caps.get(6).map(|m| m.as_str());
        let asterisk = caps.get(7).is_some();

        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }

        let delimiter = prefix.unwrap_or("/");
        let next = path[index..].chars().next();
        let partial = prefix.is_some_and(|p| next.is_some_and(|c| !p.starts_with(c)));
        let pattern = match (capture, asterisk) {
            (Some(p), _) => p.to_owned(),
            (None, true) => ".*".to_owned(),
            (None, false) => format!("[^{}]+?", regex::escape(delimiter)),
        };
        let name = match name {
            Some(n) => n.to_owned(),
            None => {
                unnamed += 1;
                (unnamed - 1).to_string()
            }
        };

        tokens.push(Token::Param(Key {
            name,
            prefix: prefix.unwrap_or_default().to_owned(),
            pattern,
            optional: asterisk || matches!(modifier, Some("?") | Some("*")),
            repeat: asterisk || matches!(modifier, Some("+") | Some("*")),
            partial,
        }));
    }

    literal.push_str(&path[index..]);
    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }
    tokens
}
