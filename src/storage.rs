//!
//! tabledesk storage module
//! ------------------------
//! Everything the service reads from or writes to the database goes through the
//! `Backend` trait: the credential store (`auth.users`), the permission tables
//! (`auth.user_groups`, `auth.group_schema_permissions`) and the user tables the
//! browser edits.
//!
//! Two implementations exist:
//! - `postgres::PgStore`, backed by one shared sqlx pool (production);
//! - `memory::MemoryStore`, an in-process catalog used by tests and `--memory`.
//!
//! Handlers hold a cloneable `SharedStore` handle.

pub mod memory;
pub mod postgres;

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::grid::filter::Filter;
use crate::grid::{TableId, TableSnapshot};
use crate::identity::Role;

/// A row of `auth.users`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub requested_role: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub requested_role: Role,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn find_user(&self, email: &str) -> AppResult<Option<UserRecord>>;

    /// Fails with a conflict error when the email is taken.
    async fn insert_user(&self, user: &NewUser) -> AppResult<()>;

    async fn update_password_hash(&self, email: &str, password_hash: &str) -> AppResult<()>;

    /// Distinct schemas granted to any of the user's groups, sorted.
    async fn visible_schemas(&self, email: &str) -> AppResult<Vec<String>>;

    /// Every permission value any of the user's groups holds on `schema`.
    async fn schema_permissions(&self, email: &str, schema: &str) -> AppResult<Vec<String>>;

    /// Table names in `schema`, sorted.
    async fn list_tables(&self, schema: &str) -> AppResult<Vec<String>>;

    async fn load_table(&self, id: &TableId, filter: Option<&Filter>) -> AppResult<TableSnapshot>;

    /// Drop, recreate and refill `id` from `snapshot` atomically.
    async fn replace_table(&self, id: &TableId, snapshot: &TableSnapshot) -> AppResult<()>;

    async fn close(&self);
}

#[derive(Clone)]
pub struct SharedStore(pub Arc<dyn Backend>);

impl SharedStore {
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        SharedStore(Arc::new(backend))
    }
}

impl Deref for SharedStore {
    type Target = dyn Backend;
    fn deref(&self) -> &Self::Target { self.0.as_ref() }
}
