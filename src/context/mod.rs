//! Per-request context: the parsed request plus everything interceptors
//! derive from it.
//!
//! A [`Context`] is created once per request by the server loop and handed by
//! `&mut` through the middleware pipeline and then into the matched view.
//! Interceptors attach derived state here:
//!
//! - the originating URL (see [`OriginUrlMiddleware`](crate::middleware::OriginUrlMiddleware)),
//! - a session accessor pair (see [`SessionMiddleware`](crate::security::SessionMiddleware)),
//! - arbitrary typed [`Extensions`].
//!
//! The router fills in [`Parameters`] when a pattern route matches.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use serde_json::Value;

use crate::http::{Request, ResponseWriter};
use crate::security::SessionStore;

/// Type-erased request extensions map, used to hand per-request state from
/// interceptors to handlers without either knowing the other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        return Self {
            map: HashMap::new(),
        };
    }

    /// Inserts a value, returning the previous one of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions").field("len", &self.map.len()).finish()
    }
}

/// Path parameters captured by the matched route pattern.
///
/// Unnamed groups are keyed by their position (`"0"`, `"1"`, ...).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    map: HashMap<String, String>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            map: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Per-request state shared by interceptors and handlers.
///
/// # Examples
///
/// ```
/// use routeway::context::Context;
/// use routeway::http::Request;
///
/// let (request, _) = Request::parse(b"GET /users/7 HTTP/1.1\r\nHost: a.example\r\n\r\n").unwrap();
/// let mut ctx = Context::new(request);
/// ctx.set_original_url("http://a.example/users/7");
///
/// assert_eq!(ctx.request().path(), "/users/7");
/// assert_eq!(ctx.original_url(), Some("http://a.example/users/7"));
/// assert!(ctx.session().is_none());
/// ```
pub struct Context {
    request: Request,
    params: Parameters,
    extensions: Extensions,
    original_url: Option<String>,
    sessions: Option<Arc<dyn SessionStore>>,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            params: Parameters::new(),
            extensions: Extensions::new(),
            original_url: None,
            sessions: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Shortcut for `self.params().get(key)`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub(crate) fn set_params(&mut self, params: Parameters) {
        self.params = params;
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Absolute URL the client asked for, once an interceptor resolved it.
    pub fn original_url(&self) -> Option<&str> {
        self.original_url.as_deref()
    }

    pub fn set_original_url(&mut self, url: impl Into<String>) {
        self.original_url = Some(url.into());
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }

    /// Binds the session accessors to `store` for the rest of this request.
    pub fn attach_sessions(&mut self, store: Arc<dyn SessionStore>) {
        self.sessions = Some(store);
    }

    /// Whether a session store has been attached.
    pub fn has_sessions(&self) -> bool {
        self.sessions.is_some()
    }

    /// Session content of the client, if it holds an active session.
    ///
    /// Always `None` when no session store was attached.
    pub fn session(&self) -> Option<Value> {
        self.sessions
            .as_ref()
            .and_then(|store| store.get_session(&self.request))
    }

    /// Starts (or replaces) the client's session, staging its token cookie on
    /// `out`. Returns the token, or `None` when no store was attached.
    pub fn set_session(&self, content: Value, out: &mut ResponseWriter) -> Option<String> {
        let store = self.sessions.as_ref()?;
        Some(store.set_session(content, &self.request, out))
    }

    /// Ends the client's session, if any.
    pub fn remove_session(&self, out: &mut ResponseWriter) {
        if let Some(store) = &self.sessions {
            store.remove_session(&self.request, out);
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("params", &self.params)
            .field("original_url", &self.original_url)
            .field("sessions", &self.sessions.is_some())
            .finish()
    }
}
