//! Route table: compiles a nested route declaration into flat path and name
//! indices and resolves request paths against them.
//!
//! Resolution order for a request path:
//!
//! 1. normalize it (collapse `//`, drop a trailing `/`);
//! 2. outside the configured base prefix, fall back to the `/404` record;
//! 3. strip the base prefix;
//! 4. exact lookup in the path index;
//! 5. otherwise scan every compiled matcher in registration order, first
//!    match wins;
//! 6. otherwise the `/404` record, if one was declared.
//!
//! | Declaration                         | Normalized path |
//! |-------------------------------------|-----------------|
//! | `/users/` (not strict)              | `/users`        |
//! | child `:id` under `/users`          | `/users/:id`    |
//! | child `/about` under `/users`       | `/about`        |

pub mod matcher;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Mode;
use crate::context::{Context, Parameters};
use crate::http::{HttpResponse, ResponseWriter};
use crate::view::{DispatchError, View};

pub use matcher::{Matcher, MatcherError, MatcherOptions};

/// Errors raised while building the table or resolving a request.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("duplicate named route definition: {{ name: \"{name}\", path: \"{path}\" }}")]
    DuplicateName { name: String, path: String },

    #[error("route with path {path:?} contains unencoded characters")]
    NonAscii { path: String },

    #[error("duplicate param key {param:?} in route with path {path:?}")]
    DuplicateParam { path: String, param: String },

    #[error("'path' is required in route config")]
    EmptyPath,

    #[error("route with path {path:?} does not compile: {reason}")]
    InvalidPattern { path: String, reason: String },

    #[error("unknown request")]
    UnknownRequest,

    #[error("request url {path} is not under the server base {base}")]
    OutsideBase { path: String, base: String },

    #[error("can not find page {path}")]
    NotFound { path: String },

    #[error("url {path} is registered but not implemented")]
    NotImplemented { path: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// One node of a route declaration tree.
///
/// # Examples
///
/// ```
/// use routeway::router::RouteDecl;
/// use routeway::view::View;
///
/// let tree = RouteDecl::new("/")
///     .name("home")
///     .view(View::new())
///     .child(RouteDecl::new("users/:id").name("user").view(View::new()))
///     .child(RouteDecl::new("old-users").redirect("/users"));
/// ```
#[derive(Clone, Default)]
pub struct RouteDecl {
    path: String,
    name: Option<String>,
    view: Option<Arc<View>>,
    redirect: Option<String>,
    children: Vec<RouteDecl>,
    case_sensitive: Option<bool>,
    options: MatcherOptions,
}

impl RouteDecl {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn view(mut self, view: View) -> Self {
        self.view = Some(Arc::new(view));
        self
    }

    /// Shares one view between several routes.
    #[must_use]
    pub fn shared_view(mut self, view: Arc<View>) -> Self {
        self.view = Some(view);
        self
    }

    /// Target answered with a `302` when the route has no view.
    #[must_use]
    pub fn redirect(mut self, to: impl Into<String>) -> Self {
        self.redirect = Some(to.into());
        self
    }

    #[must_use]
    pub fn child(mut self, child: RouteDecl) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn children(mut self, children: impl IntoIterator<Item = RouteDecl>) -> Self {
        self.children.extend(children);
        self
    }

    #[must_use]
    pub fn case_sensitive(mut self, sensitive: bool) -> Self {
        self.case_sensitive = Some(sensitive);
        self
    }

    #[must_use]
    pub fn matcher_options(mut self, options: MatcherOptions) -> Self {
        self.options = options;
        self
    }

    fn effective_options(&self) -> MatcherOptions {
        MatcherOptions {
            sensitive: self.case_sensitive.unwrap_or(self.options.sensitive),
            ..self.options
        }
    }
}

/// A compiled, immutable route.
#[derive(Debug)]
pub struct RouteRecord {
    path: String,
    name: Option<String>,
    matcher: Matcher,
    view: Option<Arc<View>>,
    redirect: Option<String>,
    parent: Option<usize>,
    match_as: Option<String>,
}

impl RouteRecord {
    /// Normalized absolute path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn view(&self) -> Option<&View> {
        self.view.as_deref()
    }

    pub fn redirect(&self) -> Option<&str> {
        self.redirect.as_deref()
    }

    /// Alias path accumulated from the declared root through the nesting.
    pub fn match_as(&self) -> Option<&str> {
        self.match_as.as_deref()
    }
}

/// A resolved record plus the parameters its pattern captured.
#[derive(Debug)]
pub struct RouteMatch<'t> {
    pub record: &'t RouteRecord,
    pub params: Parameters,
}

/// Base prefix and build mode for a [`RouteTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTableConfig {
    pub base: String,
    pub mode: Mode,
}

impl Default for RouteTableConfig {
    fn default() -> Self {
        Self::new("/")
    }
}

impl RouteTableConfig {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            mode: Mode::Development,
        }
    }

    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

/// Immutable path and name indices over the compiled records.
pub struct RouteTable {
    base: String,
    mode: Mode,
    records: Vec<RouteRecord>,
    by_path: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl RouteTable {
    /// Compiles `routes` into a table.
    ///
    /// # Errors
    ///
    /// In [`Mode::Development`] any invalid declaration aborts the build. In
    /// [`Mode::Production`] the offending declaration is logged and skipped;
    /// a duplicate name keeps its first registration.
    ///
    /// A declaration whose path is already registered is dropped along with
    /// its name; its children still mount under the first record.
    pub fn build(
        config: RouteTableConfig,
        routes: impl IntoIterator<Item = RouteDecl>,
    ) -> Result<Self, RouteError> {
        let start = Instant::now();
        let mut table = Self {
            base: normalize(&config.base, None, false),
            mode: config.mode,
            records: Vec::new(),
            by_path: HashMap::new(),
            by_name: HashMap::new(),
        };
        for route in routes {
            let match_as = route.path.clone();
            table.add(&route, None, Some(match_as))?;
        }
        info!(
            records = table.records.len(),
            names = table.by_name.len(),
            base = %table.base,
            elapsed = ?start.elapsed(),
            "route table built"
        );
        Ok(table)
    }

    fn add(
        &mut self,
        decl: &RouteDecl,
        parent: Option<usize>,
        match_as: Option<String>,
    ) -> Result<(), RouteError> {
        if decl.path.is_empty() {
            return self.reject(RouteError::EmptyPath);
        }
        if decl.path.chars().any(|c| !(' '..='~').contains(&c)) {
            return self.reject(RouteError::NonAscii {
                path: decl.path.clone(),
            });
        }

        let options = decl.effective_options();
        let parent_path = parent.map(|i| self.records[i].path.as_str());
        let path = normalize(&decl.path, parent_path, options.strict);
        let matcher = match Matcher::compile(&path, options) {
            Ok(matcher) => matcher,
            Err(MatcherError::DuplicateParam(param)) => {
                return self.reject(RouteError::DuplicateParam { path, param });
            }
            Err(MatcherError::InvalidPattern(reason)) => {
                return self.reject(RouteError::InvalidPattern { path, reason });
            }
        };

        let (index, fresh) = match self.by_path.get(&path) {
            Some(&existing) => {
                debug!(path = %path, "duplicate route path, keeping the first registration");
                (existing, false)
            }
            None => {
                let index = self.records.len();
                self.records.push(RouteRecord {
                    path: path.clone(),
                    name: decl.name.clone(),
                    matcher,
                    view: decl.view.clone(),
                    redirect: decl.redirect.clone(),
                    parent,
                    match_as: match_as.clone(),
                });
                self.by_path.insert(path.clone(), index);
                (index, true)
            }
        };

        // A dropped duplicate does not lend its name to the surviving record.
        if let Some(name) = decl.name.as_ref().filter(|_| fresh) {
            if self.by_name.contains_key(name) {
                let err = RouteError::DuplicateName {
                    name: name.clone(),
                    path: decl.path.clone(),
                };
                if !self.mode.is_production() {
                    return Err(err);
                }
                warn!(error = %err, "keeping the first route with this name");
            } else {
                self.by_name.insert(name.clone(), index);
            }
        }

        for child in &decl.children {
            let child_match_as = match_as
                .as_deref()
                .map(|alias| clean(&format!("{alias}/{}", child.path)));
            self.add(child, Some(index), child_match_as)?;
        }
        Ok(())
    }

    // Fatal in development, logged and skipped in production.
    fn reject(&self, err: RouteError) -> Result<(), RouteError> {
        if self.mode.is_production() {
            warn!(error = %err, "skipping invalid route declaration");
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Normalized base prefix.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in registration order (every parent before its children).
    pub fn records(&self) -> impl Iterator<Item = &RouteRecord> {
        self.records.iter()
    }

    pub fn by_name(&self, name: &str) -> Option<&RouteRecord> {
        self.by_name.get(name).map(|&i| &self.records[i])
    }

    pub fn by_path(&self, path: &str) -> Option<&RouteRecord> {
        self.by_path.get(path).map(|&i| &self.records[i])
    }

    pub fn parent(&self, record: &RouteRecord) -> Option<&RouteRecord> {
        record.parent.map(|i| &self.records[i])
    }

    /// Resolves `request_path` to a record.
    ///
    /// Exact paths win over patterns; among patterns the first registered
    /// wins. Unmatched paths, and paths outside the base, resolve to the
    /// `/404` record when one exists.
    ///
    /// # Examples
    ///
    /// ```
    /// use routeway::router::{RouteDecl, RouteTable, RouteTableConfig};
    ///
    /// let table = RouteTable::build(
    ///     RouteTableConfig::new("/app"),
    ///     [RouteDecl::new("/users/:id"), RouteDecl::new("/404")],
    /// )
    /// .unwrap();
    ///
    /// let found = table.match_path("/app/users/7").unwrap();
    /// assert_eq!(found.record.path(), "/users/:id");
    /// assert_eq!(found.params.get("id"), Some("7"));
    /// assert_eq!(table.match_path("/elsewhere").unwrap().record.path(), "/404");
    /// ```
    pub fn match_path(&self, request_path: &str) -> Option<RouteMatch<'_>> {
        // Strict records keep their trailing slash, so it is only dropped
        // after the exact lookup on the path as sent.
        let cleaned = clean(request_path);
        let Some(path) = self.strip_base(&cleaned) else {
            return self.fallback();
        };
        let loose = match path.strip_suffix('/') {
            Some(trimmed) if !trimmed.is_empty() => trimmed,
            _ => path,
        };

        for candidate in [path, loose] {
            if let Some(record) = self.by_path(candidate) {
                let params = record.matcher.captures(candidate).unwrap_or_default();
                return Some(RouteMatch { record, params });
            }
        }

        self.records
            .iter()
            .find_map(|record| {
                record
                    .matcher
                    .captures(path)
                    .map(|params| RouteMatch { record, params })
            })
            .or_else(|| self.fallback())
    }

    fn fallback(&self) -> Option<RouteMatch<'_>> {
        self.by_path("/404").map(|record| RouteMatch {
            record,
            params: Parameters::new(),
        })
    }

    // Path relative to the base, on a segment boundary.
    fn strip_base<'p>(&self, path: &'p str) -> Option<&'p str> {
        if self.base == "/" {
            return Some(path);
        }
        match path.strip_prefix(self.base.as_str()) {
            Some("") => Some("/"),
            Some(rest) if rest.starts_with('/') => Some(rest),
            _ => None,
        }
    }

    // Absolute redirect targets are mounted under the base.
    fn mount(&self, target: &str) -> String {
        if self.base != "/" && target.starts_with('/') {
            clean(&format!("{}{target}", self.base))
        } else {
            target.to_owned()
        }
    }

    /// Routes one request: dispatches to the matched view, answers redirect
    /// records with `302`, and turns every miss into a finalized error
    /// response before returning the error.
    pub async fn handle(&self, ctx: &mut Context, out: &mut ResponseWriter) -> Result<(), RouteError> {
        let path = ctx.request().path().to_owned();
        if path.is_empty() {
            HttpResponse::bad_request("unknown request").finalize(out).await;
            return Err(RouteError::UnknownRequest);
        }
        if self.strip_base(&normalize(&path, None, false)).is_none() {
            let err = RouteError::OutsideBase {
                path,
                base: self.base.clone(),
            };
            HttpResponse::not_found(err.to_string()).finalize(out).await;
            return Err(err);
        }

        let Some(RouteMatch { record, params }) = self.match_path(&path) else {
            let err = RouteError::NotFound { path };
            HttpResponse::not_found(err.to_string()).finalize(out).await;
            return Err(err);
        };
        debug!(path = %path, route = %record.path, "route matched");
        ctx.set_params(params);

        if let Some(view) = &record.view {
            view.dispatch(ctx, out).await?;
            return Ok(());
        }
        if let Some(target) = &record.redirect {
            HttpResponse::redirect(ctx, &self.mount(target))
                .finalize(out)
                .await;
            return Ok(());
        }
        let err = RouteError::NotImplemented { path };
        HttpResponse::not_implemented(err.to_string())
            .finalize(out)
            .await;
        Err(err)
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("base", &self.base)
            .field("mode", &self.mode)
            .field(
                "paths",
                &self.records.iter().map(|r| r.path.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Resolves `path` against `parent`: a leading `/` makes it absolute,
/// otherwise it is appended to the parent path. Without `strict`, a
/// trailing slash is dropped.
fn normalize(path: &str, parent: Option<&str>, strict: bool) -> String {
    let path = if strict {
        path
    } else {
        path.strip_suffix('/').unwrap_or(path)
    };
    match parent {
        Some(parent) if !path.starts_with('/') => clean(&format!("{parent}/{path}")),
        _ => clean(path),
    }
}

/// Collapses runs of `/` and guarantees a leading `/`.
fn clean(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}
