use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::{info, warn};

use super::principal::{Principal, Role};
use super::session::{Session, SessionManager};
use crate::error::{AppError, AppResult};
use crate::security;
use crate::storage::{NewUser, SharedStore};
use crate::tprintln;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub confirmation: String,
    #[serde(default)]
    pub requested_role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangePasswordRequest {
    pub old_password: String,
    pub new_password: String,
    pub confirmation: String,
}

/// Verified against when the email is unknown, so both failure paths cost one hash.
static DUMMY_HASH: Lazy<Option<String>> = Lazy::new(|| security::hash_password("tabledesk-dummy").ok());

fn invalid_credentials() -> AppError {
    AppError::authentication("invalid_credentials", "invalid email or password")
}

fn check_new_password(password: &str, confirmation: &str) -> AppResult<()> {
    if password.is_empty() {
        return Err(AppError::validation("empty_password", "password must not be empty"));
    }
    if password != confirmation {
        return Err(AppError::validation("password_mismatch", "passwords do not match"));
    }
    Ok(())
}

/// Account operations over the credential store.
#[derive(Clone)]
pub struct AuthService {
    store: SharedStore,
    sessions: SessionManager,
}

impl AuthService {
    pub fn new(store: SharedStore, sessions: SessionManager) -> Self {
        Self { store, sessions }
    }

    pub fn sessions(&self) -> &SessionManager { &self.sessions }

    /// Create a viewer account, recording the role the user asked for.
    pub async fn register(&self, req: &RegisterRequest) -> AppResult<()> {
        let email = req.email.trim();
        if email.is_empty() {
            return Err(AppError::validation("empty_email", "email must not be empty"));
        }
        check_new_password(&req.password, &req.confirmation)?;
        let password_hash = security::hash_password_blocking(req.password.clone()).await?;
        self.store
            .insert_user(&NewUser {
                email: email.to_string(),
                password_hash,
                role: Role::Viewer,
                requested_role: req.requested_role,
            })
            .await?;
        info!(target: "tabledesk::auth", email = %email, requested_role = req.requested_role.as_str(), "registered user");
        Ok(())
    }

    pub async fn login(&self, req: &LoginRequest) -> AppResult<Arc<Session>> {
        let email = req.email.trim();
        let Some(user) = self.store.find_user(email).await? else {
            if let Some(dummy) = DUMMY_HASH.as_ref() {
                let _ = security::verify_password_blocking(dummy.clone(), req.password.clone()).await;
            }
            info!(target: "tabledesk::auth", email = %email, "login failed: unknown user");
            return Err(invalid_credentials());
        };
        if !security::verify_password_blocking(user.password_hash.clone(), req.password.clone()).await {
            info!(target: "tabledesk::auth", email = %email, "login failed: bad password");
            return Err(invalid_credentials());
        }
        if security::needs_rehash(&user.password_hash) {
            // upgrade legacy hashes while the plaintext is at hand
            match security::hash_password_blocking(req.password.clone()).await {
                Ok(h) => {
                    if let Err(e) = self.store.update_password_hash(email, &h).await {
                        warn!(target: "tabledesk::auth", email = %email, "password rehash not stored: {}", e);
                    }
                }
                Err(e) => warn!(target: "tabledesk::auth", email = %email, "password rehash failed: {}", e),
            }
        }
        let role = Role::parse(&user.role).unwrap_or_else(|| {
            warn!(target: "tabledesk::auth", email = %email, role = %user.role, "unknown role, treating as viewer");
            Role::Viewer
        });
        let session = self.sessions.issue(Principal { email: user.email.clone(), role })?;
        info!(target: "tabledesk::auth", email = %email, role = role.as_str(), "login");
        tprintln!("auth.login user={} sid={}", email, session.session_id);
        Ok(session)
    }

    /// Re-verify the old password of the session's user, then store the new one.
    /// Other sessions of the same user are ended.
    pub async fn change_password(&self, session: &Session, req: &ChangePasswordRequest) -> AppResult<()> {
        check_new_password(&req.new_password, &req.confirmation)?;
        let email = session.principal.email.as_str();
        let user = self.store.find_user(email).await?.ok_or_else(invalid_credentials)?;
        if !security::verify_password_blocking(user.password_hash, req.old_password.clone()).await {
            return Err(AppError::authentication("wrong_password", "current password is incorrect"));
        }
        let hash = security::hash_password_blocking(req.new_password.clone()).await?;
        self.store.update_password_hash(email, &hash).await?;
        let revoked = self.sessions.revoke_user(email, Some(&session.token));
        info!(target: "tabledesk::auth", email = %email, revoked_sessions = revoked, "password changed");
        Ok(())
    }

    pub fn logout(&self, token: &str) -> bool {
        let removed = self.sessions.logout(token);
        if removed {
            info!(target: "tabledesk::auth", "logout");
        }
        removed
    }
}
