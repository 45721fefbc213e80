//! Response hardening headers staged before any handler runs.

use futures::future::BoxFuture;

use crate::context::Context;
use crate::http::ResponseWriter;
use crate::middleware::Middleware;
use crate::view::HandlerError;

/// Stages browser hardening headers on the connection writer.
///
/// The headers are written to the [`ResponseWriter`] rather than to a
/// response object, so they go out whatever response the view produces.
///
/// | Header                   | Default        |
/// |--------------------------|----------------|
/// | `X-Frame-Options`        | `SAMEORIGIN`   |
/// | `X-Content-Type-Options` | `nosniff`      |
/// | `Referrer-Policy`        | `same-origin`  |
/// | `X-XSS-Protection`       | `1; mode=block`|
///
/// # Examples
///
/// ```rust
/// use routeway::security::SecurityHeadersMiddleware;
///
/// let headers = SecurityHeadersMiddleware::new()
///     .frame_options("DENY")
///     .referrer_policy("no-referrer");
/// ```
#[derive(Debug, Clone)]
pub struct SecurityHeadersMiddleware {
    frame_options: Option<String>,
    referrer_policy: Option<String>,
    no_sniff: bool,
    xss_protection: bool,
}

impl Default for SecurityHeadersMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityHeadersMiddleware {
    pub fn new() -> Self {
        Self {
            frame_options: Some("SAMEORIGIN".to_string()),
            referrer_policy: Some("same-origin".to_string()),
            no_sniff: true,
            xss_protection: true,
        }
    }

    /// `DENY`, `SAMEORIGIN` or `ALLOW-FROM <origin>`.
    #[must_use]
    pub fn frame_options(mut self, value: impl Into<String>) -> Self {
        self.frame_options = Some(value.into());
        self
    }

    /// Stops sending `X-Frame-Options`, allowing the site to be framed anywhere.
    #[must_use]
    pub fn allow_framing(mut self) -> Self {
        self.frame_options = None;
        self
    }

    #[must_use]
    pub fn referrer_policy(mut self, value: impl Into<String>) -> Self {
        self.referrer_policy = Some(value.into());
        self
    }

    #[must_use]
    pub fn no_sniff(mut self, enabled: bool) -> Self {
        self.no_sniff = enabled;
        self
    }

    #[must_use]
    pub fn xss_protection(mut self, enabled: bool) -> Self {
        self.xss_protection = enabled;
        self
    }

    fn apply(&self, out: &mut ResponseWriter) {
        if let Some(value) = &self.frame_options {
            out.set_header("X-Frame-Options", value.as_str());
        }
        if self.no_sniff {
            out.set_header("X-Content-Type-Options", "nosniff");
        }
        if let Some(value) = &self.referrer_policy {
            out.set_header("Referrer-Policy", value.as_str());
        }
        if self.xss_protection {
            out.set_header("X-XSS-Protection", "1; mode=block");
        }
    }
}

impl Middleware for SecurityHeadersMiddleware {
    fn name(&self) -> &str {
        "security-headers"
    }

    fn handle<'a>(
        &'a self,
        _ctx: &'a mut Context,
        out: &'a mut ResponseWriter,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.apply(out);
            Ok(())
        })
    }
}
