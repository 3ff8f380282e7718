//! Identity and session management: who the caller is and what they may touch.
//! Keep the public surface thin and split implementation across sub-modules.

mod authorizer;
mod principal;
mod provider;
mod session;

pub use authorizer::{Permission, PermissionResolver};
pub use principal::{Principal, Role};
pub use provider::{AuthService, ChangePasswordRequest, LoginRequest, RegisterRequest};
pub use session::{Session, SessionManager, SessionToken};
