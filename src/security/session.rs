//! Session storage behind the [`Context`] session accessors.
//!
//! The core only talks to a [`SessionStore`]; [`MemorySessionStore`] keeps
//! sessions in process memory keyed by a random token carried in a cookie,
//! and [`DisabledSessions`] turns the accessors into no-ops.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::http::cookie::{Cookie, CookieOptions, SameSite};
use crate::http::{Request, ResponseWriter};
use crate::middleware::Middleware;
use crate::view::HandlerError;

/// External session storage keyed by the request (and, on writes, the
/// response that carries the session token back).
pub trait SessionStore: Send + Sync {
    /// Content of the client's active session, if any.
    fn get_session(&self, request: &Request) -> Option<Value>;

    /// Stores `content` as the client's session and returns its token.
    fn set_session(&self, content: Value, request: &Request, out: &mut ResponseWriter) -> String;

    /// Forgets the client's session.
    fn remove_session(&self, request: &Request, out: &mut ResponseWriter);
}

/// Store used when sessions are turned off: nothing is ever active.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledSessions;

impl SessionStore for DisabledSessions {
    fn get_session(&self, _request: &Request) -> Option<Value> {
        None
    }

    fn set_session(&self, _content: Value, _request: &Request, _out: &mut ResponseWriter) -> String {
        String::new()
    }

    fn remove_session(&self, _request: &Request, _out: &mut ResponseWriter) {}
}

/// Cookie and lifetime settings for [`MemorySessionStore`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Cookie carrying the session token.
    pub name: String,
    /// Session lifetime; `None` keeps sessions until removed.
    pub max_age: Option<Duration>,
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Also emit an `Expires` attribute next to `Max-Age`.
    pub use_expires: bool,
    pub same_site: Option<SameSite>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "SessionId".to_owned(),
            max_age: Some(Duration::from_secs(2 * 3600)),
            domain: None,
            path: "/".to_owned(),
            secure: true,
            http_only: true,
            use_expires: true,
            same_site: Some(SameSite::Lax),
        }
    }
}

impl Default for MemorySessionStore {
    /// Default settings over the plain TCP [`Server`](crate::server::Server).
    fn default() -> Self {
        Self::over_transport(SessionConfig::default(), false)
    }
}

struct Entry {
    content: Value,
    expires_at: Option<SystemTime>,
}

impl Entry {
    fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process session store.
///
/// Tokens are random v4 UUIDs. An expired session is dropped when its client
/// presents it, and every new session sweeps out all expired ones.
pub struct MemorySessionStore {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Entry>>,
}

impl MemorySessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Store whose cookies match the transport: without TLS the `Secure`
    /// flag is dropped, since browsers would not send the token back.
    pub fn over_transport(mut config: SessionConfig, tls: bool) -> Self {
        if config.secure && !tls {
            warn!(cookie = %config.name, "no TLS in front of the server, session cookie sent without Secure");
            config.secure = false;
        }
        Self::new(config)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of stored sessions, including ones that expired since the last
    /// sweep.
    pub fn len(&self) -> usize {
        self.sessions.read().map_or(0, |s| s.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stage_cookie(&self, out: &mut ResponseWriter, token: &str, max_age: Option<u64>) {
        let mut options = CookieOptions::new()
            .path(self.config.path.clone())
            .secure(self.config.secure)
            .http_only(self.config.http_only);
        options.domain = self.config.domain.clone();
        options.same_site = self.config.same_site.map(Into::into);
        if let Some(seconds) = max_age {
            options.max_age = Some(seconds);
        }

        match Cookie::resolve(self.config.name.clone(), token, options) {
            Ok(mut cookie) => {
                if !self.config.use_expires {
                    cookie.expires = None;
                }
                out.append_header("Set-Cookie", cookie.serialize());
            }
            Err(e) => warn!(error = %e, "session cookie rejected"),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn get_session(&self, request: &Request) -> Option<Value> {
        let token = request.cookie(&self.config.name)?;
        let now = SystemTime::now();
        {
            let sessions = self.sessions.read().ok()?;
            match sessions.get(&token) {
                Some(entry) if entry.is_live(now) => return Some(entry.content.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        debug!("dropping expired session");
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(&token);
        }
        None
    }

    fn set_session(&self, content: Value, request: &Request, out: &mut ResponseWriter) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let now = SystemTime::now();
        let expires_at = self.config.max_age.and_then(|age| now.checked_add(age));
        match self.sessions.write() {
            Ok(mut sessions) => {
                if let Some(old) = request.cookie(&self.config.name) {
                    sessions.remove(&old);
                }
                let before = sessions.len();
                sessions.retain(|_, entry| entry.is_live(now));
                if sessions.len() < before {
                    debug!(swept = before - sessions.len(), "dropped expired sessions");
                }
                sessions.insert(token.clone(), Entry { content, expires_at });
            }
            Err(_) => warn!("session table poisoned, session not stored"),
        }
        let max_age = self.config.max_age.map(|age| age.as_secs());
        self.stage_cookie(out, &token, max_age);
        token
    }

    fn remove_session(&self, request: &Request, out: &mut ResponseWriter) {
        let Some(token) = request.cookie(&self.config.name) else {
            return;
        };
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.remove(&token);
        }
        self.stage_cookie(out, "", Some(0));
    }
}

/// Interceptor attaching a [`SessionStore`] to every request's [`Context`].
#[derive(Clone)]
pub struct SessionMiddleware {
    store: Arc<dyn SessionStore>,
}

impl SessionMiddleware {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Middleware whose accessors never see a session.
    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledSessions))
    }
}

impl Middleware for SessionMiddleware {
    fn name(&self) -> &str {
        "session"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a mut Context,
        _out: &'a mut ResponseWriter,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            ctx.attach_sessions(Arc::clone(&self.store));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn token_from(out: &ResponseWriter) -> String {
        let cookie = out.headers().get_all("set-cookie").last().unwrap().to_owned();
        cookie
            .strip_prefix("SessionId=")
            .and_then(|rest| rest.split(';').next())
            .unwrap()
            .to_owned()
    }

    #[test]
    fn set_then_get_round_trips_through_cookie() {
        let store = MemorySessionStore::default();
        let mut out = ResponseWriter::new(tokio::io::sink());
        let token = store.set_session(
            serde_json::json!({"user": "ada"}),
            &request("GET / HTTP/1.1\r\n\r\n"),
            &mut out,
        );
        assert_eq!(token_from(&out), token);
        let cookie = out.header("set-cookie").unwrap();
        assert!(cookie.contains("Max-Age=7200"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));

        let next = request(&format!("GET / HTTP/1.1\r\nCookie: SessionId={token}\r\n\r\n"));
        assert_eq!(store.get_session(&next), Some(serde_json::json!({"user": "ada"})));
        assert_eq!(store.get_session(&request("GET / HTTP/1.1\r\n\r\n")), None);
    }

    #[test]
    fn set_session_rotates_token() {
        let store = MemorySessionStore::default();
        let mut out = ResponseWriter::new(tokio::io::sink());
        let first = store.set_session(Value::Bool(true), &request("GET / HTTP/1.1\r\n\r\n"), &mut out);
        let again = request(&format!("GET / HTTP/1.1\r\nCookie: SessionId={first}\r\n\r\n"));
        let second = store.set_session(Value::Bool(true), &again, &mut out);
        assert_ne!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_session(&again), None);
    }

    #[test]
    fn remove_session_expires_cookie() {
        let store = MemorySessionStore::default();
        let mut out = ResponseWriter::new(tokio::io::sink());
        let token = store.set_session(Value::Null, &request("GET / HTTP/1.1\r\n\r\n"), &mut out);
        let req = request(&format!("GET / HTTP/1.1\r\nCookie: SessionId={token}\r\n\r\n"));

        let mut out = ResponseWriter::new(tokio::io::sink());
        store.remove_session(&req, &mut out);
        assert!(store.is_empty());
        assert!(out.header("set-cookie").unwrap().starts_with("SessionId=; Max-Age=0"));
    }

    #[test]
    fn expired_sessions_are_dropped() {
        let config = SessionConfig {
            max_age: Some(Duration::ZERO),
            ..SessionConfig::default()
        };
        let store = MemorySessionStore::new(config);
        let mut out = ResponseWriter::new(tokio::io::sink());
        let token = store.set_session(Value::Bool(true), &request("GET / HTTP/1.1\r\n\r\n"), &mut out);
        let req = request(&format!("GET / HTTP/1.1\r\nCookie: SessionId={token}\r\n\r\n"));
        assert_eq!(store.get_session(&req), None);
        assert!(store.is_empty());
    }

    #[test]
    fn new_sessions_sweep_expired_ones() {
        let store = MemorySessionStore::default();
        let past = SystemTime::now() - Duration::from_secs(60);
        {
            let mut sessions = store.sessions.write().unwrap();
            for token in ["gone-1", "gone-2"] {
                sessions.insert(token.to_owned(), Entry { content: Value::Null, expires_at: Some(past) });
            }
            sessions.insert("forever".to_owned(), Entry { content: Value::Null, expires_at: None });
        }
        assert_eq!(store.len(), 3);

        let mut out = ResponseWriter::new(tokio::io::sink());
        let fresh = store.set_session(Value::Bool(true), &request("GET / HTTP/1.1\r\n\r\n"), &mut out);
        let sessions = store.sessions.read().unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.contains_key("forever"));
        assert!(sessions.contains_key(&fresh));
    }

    #[test]
    fn plain_transport_drops_secure_flag() {
        let store = MemorySessionStore::over_transport(SessionConfig::default(), false);
        assert!(!store.config().secure);
        let mut out = ResponseWriter::new(tokio::io::sink());
        store.set_session(Value::Null, &request("GET / HTTP/1.1\r\n\r\n"), &mut out);
        assert!(!out.header("set-cookie").unwrap().contains("; Secure"));

        let behind_tls = MemorySessionStore::over_transport(SessionConfig::default(), true);
        let mut out = ResponseWriter::new(tokio::io::sink());
        behind_tls.set_session(Value::Null, &request("GET / HTTP/1.1\r\n\r\n"), &mut out);
        assert!(out.header("set-cookie").unwrap().contains("; Secure"));
    }

    #[tokio::test]
    async fn middleware_attaches_store() {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::default());
        let mut ctx = Context::new(request("GET / HTTP/1.1\r\n\r\n"));
        let mut out = ResponseWriter::new(tokio::io::sink());
        SessionMiddleware::new(store).handle(&mut ctx, &mut out).await.unwrap();
        assert!(ctx.has_sessions());
        assert!(ctx.session().is_none());
        assert!(ctx.set_session(Value::Bool(true), &mut out).is_some());
    }

    #[test]
    fn disabled_store_never_has_sessions() {
        let mut out = ResponseWriter::new(tokio::io::sink());
        let req = request("GET / HTTP/1.1\r\nCookie: SessionId=abc\r\n\r\n");
        assert_eq!(DisabledSessions.set_session(Value::Bool(true), &req, &mut out), "");
        assert_eq!(DisabledSessions.get_session(&req), None);
        assert!(out.header("set-cookie").is_none());
    }
}
