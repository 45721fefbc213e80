//! Cookie staging options, validation and `Set-Cookie` serialization.

use std::fmt;
use std::time::{Duration, SystemTime};

use thiserror::Error;

// 9999-12-31T23:59:59Z, the last instant an HTTP-date can express.
const LAST_HTTP_DATE_SECS: u64 = 253_402_300_799;

fn last_http_date() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(LAST_HTTP_DATE_SECS)
}

/// Errors raised while validating cookie options.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("sameSite must be one of 'lax', 'none', or 'strict', got {0:?}")]
    InvalidSameSite(String),

    #[error("expires: {0:?} is not a valid date")]
    InvalidExpires(String),
}

/// The validated `SameSite` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SameSite::Lax => f.write_str("Lax"),
            SameSite::Strict => f.write_str("Strict"),
            SameSite::None => f.write_str("None"),
        }
    }
}

/// `SameSite` as supplied by callers, before validation.
///
/// `true` means "lax", `false` means no attribute, and names are matched
/// case-insensitively against `lax`, `strict` and `none`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SameSiteSetting {
    Flag(bool),
    Named(String),
}

impl SameSiteSetting {
    /// Validates the setting. `Ok(None)` means the attribute is omitted.
    pub fn resolve(&self) -> Result<Option<SameSite>, CookieError> {
        match self {
            SameSiteSetting::Flag(true) => Ok(Some(SameSite::Lax)),
            SameSiteSetting::Flag(false) => Ok(None),
            SameSiteSetting::Named(name) => match name.to_ascii_lowercase().as_str() {
                "lax" => Ok(Some(SameSite::Lax)),
                "strict" => Ok(Some(SameSite::Strict)),
                "none" => Ok(Some(SameSite::None)),
                _ => Err(CookieError::InvalidSameSite(name.clone())),
            },
        }
    }

    /// `true` unless the policy is explicitly `none` (or disabled).
    pub(crate) fn is_restrictive(&self) -> bool {
        match self {
            SameSiteSetting::Flag(flag) => *flag,
            SameSiteSetting::Named(name) => !name.eq_ignore_ascii_case("none"),
        }
    }
}

impl From<bool> for SameSiteSetting {
    fn from(flag: bool) -> Self {
        SameSiteSetting::Flag(flag)
    }
}

impl From<&str> for SameSiteSetting {
    fn from(name: &str) -> Self {
        SameSiteSetting::Named(name.to_owned())
    }
}

impl From<String> for SameSiteSetting {
    fn from(name: String) -> Self {
        SameSiteSetting::Named(name)
    }
}

impl From<SameSite> for SameSiteSetting {
    fn from(policy: SameSite) -> Self {
        SameSiteSetting::Named(policy.to_string())
    }
}

/// Expiry as supplied by callers: a point in time or an HTTP-date string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expires {
    At(SystemTime),
    HttpDate(String),
}

impl Expires {
    fn resolve(&self) -> Result<SystemTime, CookieError> {
        match self {
            Expires::At(at) => Ok(*at),
            Expires::HttpDate(raw) => httpdate::parse_http_date(raw)
                .map_err(|_| CookieError::InvalidExpires(raw.clone())),
        }
    }
}

impl From<SystemTime> for Expires {
    fn from(at: SystemTime) -> Self {
        Expires::At(at)
    }
}

impl From<&str> for Expires {
    fn from(raw: &str) -> Self {
        Expires::HttpDate(raw.to_owned())
    }
}

impl From<String> for Expires {
    fn from(raw: String) -> Self {
        Expires::HttpDate(raw)
    }
}

/// Serialization options for one staged cookie.
///
/// Unset fields take the defaults applied by [`Cookie::resolve`]: path `/`,
/// `Secure` on, `HttpOnly` off, no `SameSite`.
///
/// # Examples
///
/// ```
/// use routeway::http::cookie::{Cookie, CookieOptions};
///
/// let opts = CookieOptions::new().max_age(60).same_site(true).http_only(true);
/// let cookie = Cookie::resolve("theme", "dark", opts).unwrap();
/// let line = cookie.serialize();
/// assert!(line.starts_with("theme=dark; Max-Age=60; Path=/; Expires="));
/// assert!(line.ends_with("; HttpOnly; Secure; SameSite=Lax"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CookieOptions {
    pub max_age: Option<u64>,
    pub expires: Option<Expires>,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub secure: Option<bool>,
    pub http_only: bool,
    pub same_site: Option<SameSiteSetting>,
}

impl CookieOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifetime in seconds.
    #[must_use]
    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    #[must_use]
    pub fn expires(mut self, expires: impl Into<Expires>) -> Self {
        self.expires = Some(expires.into());
        self
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    #[must_use]
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    #[must_use]
    pub fn same_site(mut self, same_site: impl Into<SameSiteSetting>) -> Self {
        self.same_site = Some(same_site.into());
        self
    }
}

/// A validated cookie ready for serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub max_age: Option<u64>,
    pub expires: Option<SystemTime>,
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

impl Cookie {
    /// Validates `options` and resolves the expiry pair.
    ///
    /// When `expires` is given without `max_age`, `max_age` becomes the whole
    /// number of seconds until `expires`, clamped at zero. When only `max_age`
    /// is given, `expires` is derived from it.
    ///
    /// # Errors
    ///
    /// [`CookieError::InvalidSameSite`] for an unknown policy name and
    /// [`CookieError::InvalidExpires`] for an unparseable date.
    pub fn resolve(
        name: impl Into<String>,
        value: impl Into<String>,
        options: CookieOptions,
    ) -> Result<Self, CookieError> {
        Self::resolve_at(name, value, options, SystemTime::now())
    }

    fn resolve_at(
        name: impl Into<String>,
        value: impl Into<String>,
        options: CookieOptions,
        now: SystemTime,
    ) -> Result<Self, CookieError> {
        let same_site = match &options.same_site {
            Some(setting) => setting.resolve()?,
            None => None,
        };

        let mut max_age = options.max_age;
        let expires = match &options.expires {
            Some(raw) => {
                let at = raw.resolve()?;
                if max_age.is_none() {
                    max_age = Some(at.duration_since(now).map_or(0, |d| d.as_secs()));
                }
                Some(at)
            }
            None => max_age.map(|secs| {
                now.checked_add(Duration::from_secs(secs))
                    .unwrap_or_else(last_http_date)
            }),
        };
        let expires = expires.map(|at| at.min(last_http_date()));

        Ok(Self {
            name: name.into(),
            value: value.into(),
            max_age,
            expires,
            path: options.path.unwrap_or_else(|| "/".to_owned()),
            domain: options.domain,
            secure: options.secure.unwrap_or(true),
            http_only: options.http_only,
            same_site,
        })
    }

    /// Renders the `Set-Cookie` header value.
    pub fn serialize(&self) -> String {
        let mut line = format!("{}={}", self.name, urlencoding::encode(&self.value));
        if let Some(max_age) = self.max_age {
            line.push_str(&format!("; Max-Age={max_age}"));
        }
        if let Some(domain) = &self.domain {
            line.push_str(&format!("; Domain={domain}"));
        }
        line.push_str(&format!("; Path={}", self.path));
        if let Some(expires) = self.expires {
            line.push_str(&format!("; Expires={}", httpdate::fmt_http_date(expires)));
        }
        if self.http_only {
            line.push_str("; HttpOnly");
        }
        if self.secure {
            line.push_str("; Secure");
        }
        if let Some(same_site) = self.same_site {
            line.push_str(&format!("; SameSite={same_site}"));
        }
        line
    }
}

/// `true` when the cookie name uses a `__Secure-` / `__Host-` style prefix.
pub(crate) fn has_security_prefix(name: &str) -> bool {
    name.starts_with("__Secure") || name.starts_with("__Host")
}
