use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::grid::TableId;
use crate::storage::SharedStore;

/// Resolved access level of a user on one schema. Only `"write"` is
/// distinguished; any other grant value reads as read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "level", content = "grant", rename_all = "lowercase")]
pub enum Permission {
    Write,
    Read(String),
}

impl Permission {
    /// Strongest level among the grant values of the user's groups.
    pub fn from_grants(grants: &[String]) -> Option<Permission> {
        if grants.iter().any(|g| g == "write") {
            return Some(Permission::Write);
        }
        grants.first().map(|g| Permission::Read(g.clone()))
    }

    pub fn can_write(&self) -> bool { matches!(self, Permission::Write) }
}

fn no_access() -> AppError {
    AppError::authorization("no_access", "you do not have access to any schema")
}

/// Schema-level permission checks over the group grant tables.
#[derive(Clone)]
pub struct PermissionResolver {
    store: SharedStore,
}

impl PermissionResolver {
    pub fn new(store: SharedStore) -> Self { Self { store } }

    /// Sorted visible schemas. A user without any is blocked from browsing.
    pub async fn list_visible_schemas(&self, email: &str) -> AppResult<Vec<String>> {
        let schemas = self.store.visible_schemas(email).await?;
        if schemas.is_empty() {
            debug!(target: "tabledesk::auth", email = %email, "no visible schemas");
            return Err(no_access());
        }
        Ok(schemas)
    }

    /// Display name to identifier for every table of a visible schema.
    pub async fn list_tables(&self, email: &str, schema: &str) -> AppResult<BTreeMap<String, TableId>> {
        self.ensure_schema_visible(email, schema).await?;
        let names = self.store.list_tables(schema).await?;
        Ok(names.into_iter().map(|t| (t.clone(), TableId::new(schema.to_string(), t))).collect())
    }

    pub async fn permission_for(&self, email: &str, schema: &str) -> AppResult<Option<Permission>> {
        let grants = self.store.schema_permissions(email, schema).await?;
        Ok(Permission::from_grants(&grants))
    }

    async fn ensure_schema_visible(&self, email: &str, schema: &str) -> AppResult<()> {
        match self.permission_for(email, schema).await? {
            Some(_) => Ok(()),
            None => Err(AppError::authorization(
                "schema_forbidden".to_string(),
                format!("schema {} is not visible to you", schema),
            )),
        }
    }

    pub async fn ensure_can_read(&self, email: &str, id: &TableId) -> AppResult<()> {
        self.ensure_schema_visible(email, &id.schema).await
    }

    pub async fn ensure_can_write(&self, email: &str, id: &TableId) -> AppResult<()> {
        match self.permission_for(email, &id.schema).await? {
            Some(p) if p.can_write() => Ok(()),
            _ => {
                debug!(target: "tabledesk::auth", email = %email, table = %id, "write denied");
                Err(AppError::authorization(
                    "write_forbidden".to_string(),
                    format!("you do not have write permission on schema {}", id.schema),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_wins_over_read_grants() {
        let g = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(Permission::from_grants(&g(&["read", "write"])), Some(Permission::Write));
        assert_eq!(Permission::from_grants(&g(&["read"])), Some(Permission::Read("read".into())));
        assert_eq!(Permission::from_grants(&g(&["WRITE"])), Some(Permission::Read("WRITE".into())));
        assert_eq!(Permission::from_grants(&[]), None);
    }

    #[test]
    fn permission_serializes_with_level() {
        assert_eq!(serde_json::to_value(Permission::Write).unwrap(), serde_json::json!({"level": "write"}));
        assert_eq!(
            serde_json::to_value(Permission::Read("read".into())).unwrap(),
            serde_json::json!({"level": "read", "grant": "read"})
        );
    }
}
