use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use base64::Engine;
use parking_lot::RwLock;

use super::principal::Principal;
use crate::browser::BrowserState;
use crate::tprintln;

pub type SessionToken = String;

/// Logging in again past this many live sessions ends the user's oldest one.
pub const MAX_SESSIONS_PER_USER: usize = 16;

/// One logged-in client. The browser state sits behind an async mutex so a
/// session's requests are handled one at a time.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub token: SessionToken,
    pub csrf_token: String,
    pub principal: Principal,
    pub issued_at: Instant,
    pub browser: tokio::sync::Mutex<BrowserState>,
}

fn gen_id() -> Result<String> {
    // 256-bit random token, base64url without padding
    let mut buf = [0u8; 32];
    getrandom::getrandom(&mut buf).map_err(|e| anyhow!("token generation failed: {}", e))?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionToken, Arc<Session>>,
    /// Tokens per user, oldest first.
    by_user: HashMap<String, VecDeque<SessionToken>>,
}

/// Sessions live in process memory only; they end on logout or restart.
#[derive(Clone, Default)]
pub struct SessionManager {
    inner: Arc<RwLock<Registry>>,
}

impl SessionManager {
    pub fn new() -> Self { Self::default() }

    pub fn issue(&self, principal: Principal) -> Result<Arc<Session>> {
        let session = Arc::new(Session {
            session_id: gen_id()?,
            token: gen_id()?,
            csrf_token: gen_id()?,
            principal,
            issued_at: Instant::now(),
            browser: tokio::sync::Mutex::new(BrowserState::default()),
        });
        let mut reg = self.inner.write();
        reg.sessions.insert(session.token.clone(), session.clone());
        let tokens = reg.by_user.entry(session.principal.email.clone()).or_default();
        tokens.push_back(session.token.clone());
        let mut evicted = Vec::new();
        while tokens.len() > MAX_SESSIONS_PER_USER {
            if let Some(t) = tokens.pop_front() { evicted.push(t); }
        }
        for t in &evicted {
            reg.sessions.remove(t);
        }
        tprintln!("session.issue user={} sid={} evicted={}", session.principal.email, session.session_id, evicted.len());
        Ok(session)
    }

    pub fn get(&self, token: &str) -> Option<Arc<Session>> {
        self.inner.read().sessions.get(token).cloned()
    }

    /// Drop the session and everything it holds. Returns whether it existed.
    pub fn logout(&self, token: &str) -> bool {
        let mut reg = self.inner.write();
        let Some(sess) = reg.sessions.remove(token) else { return false; };
        if let Some(set) = reg.by_user.get_mut(&sess.principal.email) {
            set.retain(|t| t != token);
            if set.is_empty() {
                reg.by_user.remove(&sess.principal.email);
            }
        }
        tprintln!("session.logout user={} sid={}", sess.principal.email, sess.session_id);
        true
    }

    /// End every session of `email` except `keep`.
    pub fn revoke_user(&self, email: &str, keep: Option<&str>) -> usize {
        let mut reg = self.inner.write();
        let tokens: Vec<SessionToken> = reg
            .by_user
            .get(email)
            .map(|set| set.iter().filter(|t| Some(t.as_str()) != keep).cloned().collect())
            .unwrap_or_default();
        let mut count = 0usize;
        for t in &tokens {
            if reg.sessions.remove(t).is_some() { count += 1; }
        }
        if let Some(set) = reg.by_user.get_mut(email) {
            set.retain(|t| !tokens.contains(t));
        }
        tprintln!("session.revoke user={} count={}", email, count);
        count
    }

    pub fn len(&self) -> usize { self.inner.read().sessions.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
