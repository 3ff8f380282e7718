//! In-process backend: users, grants and tables held in memory.
//!
//! Mirrors the PostgreSQL backend's observable behaviour (sorted listings,
//! duplicate detection, all-or-nothing replacement) so the service can run and
//! be tested without a database. Raw filter clauses are not supported here.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{Backend, NewUser, UserRecord};
use crate::error::{AppError, AppResult};
use crate::grid::filter::Filter;
use crate::grid::{Cell, Column, ColumnType, TableId, TableSnapshot};
use crate::identity::Role;
use crate::security;

pub const DEMO_ADMIN_EMAIL: &str = "admin@localhost";
pub const DEMO_ADMIN_PASSWORD: &str = "tabledesk";

#[derive(Default)]
struct Catalog {
    users: BTreeMap<String, (u64, UserRecord)>,
    next_user_id: u64,
    /// (user id, group)
    memberships: Vec<(u64, String)>,
    /// (group, schema, permission)
    grants: Vec<(String, String, String)>,
    tables: BTreeMap<TableId, TableSnapshot>,
}

impl Catalog {
    fn user_groups(&self, email: &str) -> Vec<&str> {
        let Some((uid, _)) = self.users.get(email) else { return Vec::new(); };
        self.memberships.iter().filter(|(u, _)| u == uid).map(|(_, g)| g.as_str()).collect()
    }
}

pub struct MemoryStore {
    inner: RwLock<Catalog>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self { Self::new() }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { inner: RwLock::new(Catalog::default()), available: AtomicBool::new(true) }
    }

    /// Store with a default admin and a demo table, for local runs without a database.
    pub fn with_demo_data() -> AppResult<Self> {
        let store = MemoryStore::new();
        store.add_user(DEMO_ADMIN_EMAIL, DEMO_ADMIN_PASSWORD, Role::Admin)?;
        store.add_member(DEMO_ADMIN_EMAIL, "admins");
        store.grant("admins", "public", "write");
        let mut demo = TableSnapshot::new(vec![
            Column::new("id", ColumnType::Integer),
            Column::new("name", ColumnType::Text),
            Column::new("price", ColumnType::Float),
            Column::new("in_stock", ColumnType::Boolean),
            Column::new("added", ColumnType::Date),
        ])?;
        let items = [("bolt", 0.25, true), ("nut", 0.1, true), ("washer", 0.05, false), ("bracket", 3.5, true)];
        for (i, (name, price, stock)) in items.iter().enumerate() {
            let added = NaiveDate::from_ymd_opt(2024, 1, 1 + i as u32).map(Cell::Date).unwrap_or(Cell::Null);
            demo.push_row(vec![Cell::Int(i as i64 + 1), Cell::Text(name.to_string()), Cell::Float(*price), Cell::Bool(*stock), added])?;
        }
        store.put_table(TableId::new("public", "demo"), demo);
        warn!(target: "startup", "in-memory backend seeded with default admin {}", DEMO_ADMIN_EMAIL);
        Ok(store)
    }

    /// Add a user with an Argon2 hash of `password`.
    pub fn add_user(&self, email: &str, password: &str, role: Role) -> AppResult<()> {
        let hash = security::hash_password(password)?;
        self.add_user_with_hash(email, &hash, role)
    }

    pub fn add_user_with_hash(&self, email: &str, password_hash: &str, role: Role) -> AppResult<()> {
        let mut cat = self.inner.write();
        if cat.users.contains_key(email) {
            return Err(AppError::conflict("duplicate_user".to_string(), format!("a user with email {} already exists", email)));
        }
        cat.next_user_id += 1;
        let id = cat.next_user_id;
        cat.users.insert(
            email.to_string(),
            (id, UserRecord { email: email.to_string(), password_hash: password_hash.to_string(), role: role.as_str().to_string(), requested_role: None }),
        );
        Ok(())
    }

    pub fn add_member(&self, email: &str, group: &str) {
        let mut cat = self.inner.write();
        if let Some(uid) = cat.users.get(email).map(|(id, _)| *id) {
            cat.memberships.push((uid, group.to_string()));
        }
    }

    pub fn grant(&self, group: &str, schema: &str, permission: &str) {
        self.inner.write().grants.push((group.to_string(), schema.to_string(), permission.to_string()));
    }

    pub fn put_table(&self, id: TableId, snapshot: TableSnapshot) {
        self.inner.write().tables.insert(id, snapshot);
    }

    pub fn table(&self, id: &TableId) -> Option<TableSnapshot> {
        self.inner.read().tables.get(id).cloned()
    }

    /// Simulate losing the database: every operation fails while unavailable.
    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::SeqCst);
    }

    fn check_available(&self) -> AppResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::database("db_unavailable", "database is unavailable"))
        }
    }
}

#[async_trait]
impl Backend for MemoryStore {
    fn name(&self) -> &'static str { "memory" }

    async fn find_user(&self, email: &str) -> AppResult<Option<UserRecord>> {
        self.check_available()?;
        Ok(self.inner.read().users.get(email).map(|(_, r)| r.clone()))
    }

    async fn insert_user(&self, user: &NewUser) -> AppResult<()> {
        self.check_available()?;
        let mut cat = self.inner.write();
        if cat.users.contains_key(&user.email) {
            return Err(AppError::conflict("duplicate_user".to_string(), format!("a user with email {} already exists", user.email)));
        }
        cat.next_user_id += 1;
        let id = cat.next_user_id;
        cat.users.insert(
            user.email.clone(),
            (id, UserRecord {
                email: user.email.clone(),
                password_hash: user.password_hash.clone(),
                role: user.role.as_str().to_string(),
                requested_role: Some(user.requested_role.as_str().to_string()),
            }),
        );
        Ok(())
    }

    async fn update_password_hash(&self, email: &str, password_hash: &str) -> AppResult<()> {
        self.check_available()?;
        match self.inner.write().users.get_mut(email) {
            Some((_, rec)) => {
                rec.password_hash = password_hash.to_string();
                Ok(())
            }
            None => Err(AppError::not_found("no_such_user".to_string(), format!("user {} does not exist", email))),
        }
    }

    async fn visible_schemas(&self, email: &str) -> AppResult<Vec<String>> {
        self.check_available()?;
        let cat = self.inner.read();
        let groups = cat.user_groups(email);
        let mut out: Vec<String> = cat
            .grants
            .iter()
            .filter(|(g, _, _)| groups.contains(&g.as_str()))
            .map(|(_, s, _)| s.clone())
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn schema_permissions(&self, email: &str, schema: &str) -> AppResult<Vec<String>> {
        self.check_available()?;
        let cat = self.inner.read();
        let groups = cat.user_groups(email);
        Ok(cat
            .grants
            .iter()
            .filter(|(g, s, _)| s == schema && groups.contains(&g.as_str()))
            .map(|(_, _, p)| p.clone())
            .collect())
    }

    async fn list_tables(&self, schema: &str) -> AppResult<Vec<String>> {
        self.check_available()?;
        Ok(self.inner.read().tables.keys().filter(|id| id.schema == schema).map(|id| id.table.clone()).collect())
    }

    async fn load_table(&self, id: &TableId, filter: Option<&Filter>) -> AppResult<TableSnapshot> {
        self.check_available()?;
        let snapshot = self
            .inner
            .read()
            .tables
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found("no_such_table".to_string(), format!("table {} does not exist", id)))?;
        let out = match filter {
            None => snapshot,
            Some(Filter::Raw(_)) => {
                return Err(AppError::validation(
                    "raw_filter_unsupported",
                    "raw filter clauses need a database backend",
                ));
            }
            Some(Filter::Expr(expr)) => {
                let bound = expr.bind(&snapshot.columns)?;
                let TableSnapshot { columns, rows } = snapshot;
                let rows = rows.into_iter().filter(|r| bound.matches(&columns, r)).collect();
                TableSnapshot { columns, rows }
            }
        };
        debug!(target: "tabledesk::store", table = %id, rows = out.height(), filtered = filter.is_some(), "loaded table");
        Ok(out)
    }

    async fn replace_table(&self, id: &TableId, snapshot: &TableSnapshot) -> AppResult<()> {
        self.check_available()?;
        // nothing is touched unless every row fits
        snapshot.validate()?;
        TableSnapshot::new(snapshot.columns.clone())?;
        self.inner.write().tables.insert(id.clone(), snapshot.clone());
        info!(target: "tabledesk::store", table = %id, rows = snapshot.height(), "replaced table");
        Ok(())
    }

    async fn close(&self) {
        debug!(target: "tabledesk::store", "memory store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orders() -> TableSnapshot {
        let mut t = TableSnapshot::new(vec![Column::new("id", ColumnType::Integer), Column::new("status", ColumnType::Text)]).unwrap();
        t.push_row(vec![Cell::Int(1), Cell::Text("open".into())]).unwrap();
        t.push_row(vec![Cell::Int(2), Cell::Text("closed".into())]).unwrap();
        t
    }

    #[tokio::test]
    async fn visible_schemas_union_groups_sorted() {
        let s = MemoryStore::new();
        s.add_user_with_hash("a@x.com", "h", Role::Viewer).unwrap();
        s.add_member("a@x.com", "g1");
        s.add_member("a@x.com", "g2");
        s.grant("g1", "sales", "read");
        s.grant("g2", "hr", "write");
        s.grant("g2", "sales", "write");
        s.grant("g3", "secret", "write");
        assert_eq!(s.visible_schemas("a@x.com").await.unwrap(), vec!["hr".to_string(), "sales".to_string()]);
        let mut perms = s.schema_permissions("a@x.com", "sales").await.unwrap();
        perms.sort();
        assert_eq!(perms, vec!["read".to_string(), "write".to_string()]);
        assert!(s.visible_schemas("nobody@x.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_with_bad_row_leaves_table_untouched() {
        let s = MemoryStore::new();
        let id = TableId::new("sales", "orders");
        s.put_table(id.clone(), orders());
        let mut bad = orders();
        bad.rows.push(vec![Cell::Text("x".into()), Cell::Null]);
        assert_eq!(s.replace_table(&id, &bad).await.unwrap_err().code_str(), "cell_type");
        assert_eq!(s.table(&id).unwrap(), orders());
    }

    #[tokio::test]
    async fn filters_apply_and_raw_is_refused() {
        let s = MemoryStore::new();
        let id = TableId::new("sales", "orders");
        s.put_table(id.clone(), orders());
        let f = Filter::parse("status = 'open'", false).unwrap();
        assert_eq!(s.load_table(&id, Some(&f)).await.unwrap().height(), 1);
        let raw = Filter::Raw("1=1".into());
        assert_eq!(s.load_table(&id, Some(&raw)).await.unwrap_err().code_str(), "raw_filter_unsupported");
    }

    #[tokio::test]
    async fn unavailable_store_reports_database_errors() {
        let s = MemoryStore::new();
        let id = TableId::new("sales", "orders");
        s.put_table(id.clone(), orders());
        s.set_available(false);
        let err = s.load_table(&id, None).await.unwrap_err();
        assert_eq!(err.http_status(), 502);
        s.set_available(true);
        assert_eq!(s.load_table(&id, None).await.unwrap().height(), 2);
    }

    #[tokio::test]
    async fn duplicate_insert_is_conflict() {
        let s = MemoryStore::new();
        let u = NewUser { email: "a@x.com".into(), password_hash: "h".into(), role: Role::Viewer, requested_role: Role::Editor };
        s.insert_user(&u).await.unwrap();
        let err = s.insert_user(&u).await.unwrap_err();
        assert_eq!(err.code_str(), "duplicate_user");
        assert_eq!(s.find_user("a@x.com").await.unwrap().unwrap().requested_role.as_deref(), Some("editor"));
    }
}
