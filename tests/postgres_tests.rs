//! Live PostgreSQL checks. Skipped unless TABLEDESK_TEST_PG_HOST is set; the
//! remaining connection settings come from the usual PG* variables.

use anyhow::Result;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

use tabledesk::grid::filter::Filter;
use tabledesk::grid::{Cell, Column, ColumnType, TableId, TableSnapshot};
use tabledesk::identity::{Permission, PermissionResolver, Role};
use tabledesk::storage::postgres::PgStore;
use tabledesk::storage::{Backend, NewUser, SharedStore};

async fn test_pool() -> Result<Option<PgPool>> {
    let Ok(host) = std::env::var("TABLEDESK_TEST_PG_HOST") else {
        eprintln!("TABLEDESK_TEST_PG_HOST not set; skipping");
        return Ok(None);
    };
    let env = |k: &str, d: &str| std::env::var(k).unwrap_or_else(|_| d.to_string());
    let opts = PgConnectOptions::new()
        .host(&host)
        .port(env("PGPORT", "5432").parse()?)
        .username(&env("PGUSER", "postgres"))
        .password(&env("PGPASSWORD", ""))
        .database(&env("PGDATABASE", "postgres"))
        .ssl_mode(PgSslMode::Prefer);
    Ok(Some(PgPoolOptions::new().max_connections(2).connect_with(opts).await?))
}

async fn fresh_schema(pool: &PgPool, schema: &str) -> Result<()> {
    sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", schema)).execute(pool).await?;
    sqlx::query(&format!("CREATE SCHEMA \"{}\"", schema)).execute(pool).await?;
    Ok(())
}

fn items() -> Result<TableSnapshot> {
    let mut t = TableSnapshot::new(vec![
        Column::new("id", ColumnType::Integer),
        Column::new("label", ColumnType::Text),
        Column::new("price", ColumnType::Float),
    ])?;
    t.push_row(vec![Cell::Int(1), Cell::Text("it's".into()), Cell::Float(2.5)])?;
    t.push_row(vec![Cell::Int(2), Cell::Text("plain".into()), Cell::Null])?;
    t.push_row(vec![Cell::Int(3), Cell::Null, Cell::Float(10.0)])?;
    Ok(t)
}

#[tokio::test]
async fn replace_then_filtered_load() -> Result<()> {
    let Some(pool) = test_pool().await? else { return Ok(()) };
    fresh_schema(&pool, "tabledesk_it_load").await?;
    let store = PgStore::from_pool(pool.clone());
    let id = TableId::new("tabledesk_it_load", "items");

    store.replace_table(&id, &items()?).await?;
    assert_eq!(store.list_tables("tabledesk_it_load").await?, vec!["items".to_string()]);
    assert_eq!(store.load_table(&id, None).await?, items()?);

    let f = Filter::parse("price >= 2.5 and label like '%''%'", false)?;
    let got = store.load_table(&id, Some(&f)).await?;
    assert_eq!(got.rows, vec![vec![Cell::Int(1), Cell::Text("it's".into()), Cell::Float(2.5)]]);

    let f = Filter::parse("label is null or price is null", false)?;
    assert_eq!(store.load_table(&id, Some(&f)).await?.height(), 2);

    let missing = store.load_table(&TableId::new("tabledesk_it_load", "nope"), None).await.unwrap_err();
    assert_eq!(missing.code_str(), "no_such_table");

    sqlx::query("DROP SCHEMA tabledesk_it_load CASCADE").execute(&pool).await?;
    Ok(())
}

#[tokio::test]
async fn failed_replace_leaves_table_intact() -> Result<()> {
    let Some(pool) = test_pool().await? else { return Ok(()) };
    fresh_schema(&pool, "tabledesk_it_atomic").await?;
    let store = PgStore::from_pool(pool.clone());
    let id = TableId::new("tabledesk_it_atomic", "items");
    store.replace_table(&id, &items()?).await?;

    // postgres rejects NUL in text, so the insert fails after the drop
    let mut bad = items()?;
    bad.rows[1][1] = Cell::Text("nul\0byte".into());
    let err = store.replace_table(&id, &bad).await.unwrap_err();
    assert_eq!(err.http_status(), 502);
    assert_eq!(store.load_table(&id, None).await?, items()?);

    sqlx::query("DROP SCHEMA tabledesk_it_atomic CASCADE").execute(&pool).await?;
    Ok(())
}

#[tokio::test]
async fn empty_table_round_trips() -> Result<()> {
    let Some(pool) = test_pool().await? else { return Ok(()) };
    fresh_schema(&pool, "tabledesk_it_empty").await?;
    let store = PgStore::from_pool(pool.clone());
    let id = TableId::new("tabledesk_it_empty", "blank");

    let t = TableSnapshot::new(vec![Column::new("only", ColumnType::Date)])?;
    store.replace_table(&id, &t).await?;
    let got = store.load_table(&id, None).await?;
    assert_eq!(got.column_names(), vec!["only".to_string()]);
    assert_eq!(got.height(), 0);

    sqlx::query("DROP SCHEMA tabledesk_it_empty CASCADE").execute(&pool).await?;
    Ok(())
}

const IT_READER: &str = "reader@tabledesk-it.test";
const IT_WRITER: &str = "writer@tabledesk-it.test";
const IT_LONER: &str = "loner@tabledesk-it.test";

/// Creates the auth tables when missing. Concurrent tests take the same
/// advisory lock so only one of them runs the DDL.
async fn auth_tables(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock(910000)").execute(&mut *tx).await?;
    for ddl in [
        "CREATE SCHEMA IF NOT EXISTS auth",
        "CREATE TABLE IF NOT EXISTS auth.users (id bigserial PRIMARY KEY, email text NOT NULL UNIQUE, \
         password_hash text NOT NULL, role text NOT NULL, requested_role text)",
        "CREATE TABLE IF NOT EXISTS auth.user_groups (user_id bigint NOT NULL, group_id bigint NOT NULL)",
        "CREATE TABLE IF NOT EXISTS auth.group_schema_permissions (group_id bigint NOT NULL, \
         schema_name text NOT NULL, permission text NOT NULL)",
    ] {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Removes the given users, their memberships and the grants of `groups`.
async fn clear_auth_rows(pool: &PgPool, emails: &[&str], groups: &[i64]) -> Result<()> {
    let emails: Vec<String> = emails.iter().map(|e| e.to_string()).collect();
    sqlx::query("DELETE FROM auth.user_groups WHERE user_id IN (SELECT id FROM auth.users WHERE email = ANY($1))")
        .bind(&emails)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM auth.group_schema_permissions WHERE group_id = ANY($1)")
        .bind(groups)
        .execute(pool)
        .await?;
    sqlx::query("DELETE FROM auth.users WHERE email = ANY($1)").bind(&emails).execute(pool).await?;
    Ok(())
}

async fn join_group(pool: &PgPool, email: &str, group: i64) -> Result<()> {
    sqlx::query("INSERT INTO auth.user_groups (user_id, group_id) SELECT id, $2 FROM auth.users WHERE email = $1")
        .bind(email)
        .bind(group)
        .execute(pool)
        .await?;
    Ok(())
}

fn new_user(email: &str, role: Role) -> NewUser {
    NewUser {
        email: email.to_string(),
        password_hash: "salt$hash".to_string(),
        role,
        requested_role: role,
    }
}

#[tokio::test]
async fn group_grants_resolve_through_the_auth_tables() -> Result<()> {
    let Some(pool) = test_pool().await? else { return Ok(()) };
    auth_tables(&pool).await?;
    let users = [IT_READER, IT_WRITER, IT_LONER];
    let groups = [910001_i64, 910002];
    clear_auth_rows(&pool, &users, &groups).await?;
    let store = PgStore::from_pool(pool.clone());

    store.insert_user(&new_user(IT_READER, Role::Viewer)).await?;
    store.insert_user(&new_user(IT_WRITER, Role::Editor)).await?;
    store.insert_user(&new_user(IT_LONER, Role::Viewer)).await?;

    // G1 reads sales; G2 writes sales and reads hr
    sqlx::query(
        "INSERT INTO auth.group_schema_permissions (group_id, schema_name, permission) VALUES \
         (910001, 'it_sales', 'read'), (910002, 'it_sales', 'write'), (910002, 'it_hr', 'read')",
    )
    .execute(&pool)
    .await?;
    join_group(&pool, IT_READER, 910001).await?;
    join_group(&pool, IT_WRITER, 910001).await?;
    join_group(&pool, IT_WRITER, 910002).await?;

    let found = store.find_user(IT_WRITER).await?.expect("writer stored");
    assert_eq!(found.role, "editor");
    assert_eq!(found.requested_role.as_deref(), Some("editor"));
    assert_eq!(found.password_hash, "salt$hash");
    assert!(store.find_user("nobody@tabledesk-it.test").await?.is_none());

    assert_eq!(store.visible_schemas(IT_READER).await?, vec!["it_sales".to_string()]);
    // two groups grant it_sales; it still appears once, in order
    assert_eq!(store.visible_schemas(IT_WRITER).await?, vec!["it_hr".to_string(), "it_sales".to_string()]);
    assert!(store.visible_schemas(IT_LONER).await?.is_empty());

    let mut grants = store.schema_permissions(IT_WRITER, "it_sales").await?;
    grants.sort();
    assert_eq!(grants, vec!["read".to_string(), "write".to_string()]);
    assert!(store.schema_permissions(IT_READER, "it_hr").await?.is_empty());

    let resolver = PermissionResolver::new(SharedStore::new(PgStore::from_pool(pool.clone())));
    let sales = TableId::new("it_sales", "orders");
    let hr = TableId::new("it_hr", "staff");
    assert_eq!(resolver.permission_for(IT_WRITER, "it_sales").await?, Some(Permission::Write));
    resolver.ensure_can_write(IT_WRITER, &sales).await?;
    resolver.ensure_can_read(IT_READER, &sales).await?;
    assert_eq!(resolver.ensure_can_write(IT_READER, &sales).await.unwrap_err().code_str(), "write_forbidden");
    assert_eq!(resolver.ensure_can_write(IT_WRITER, &hr).await.unwrap_err().code_str(), "write_forbidden");
    assert_eq!(resolver.ensure_can_read(IT_READER, &hr).await.unwrap_err().code_str(), "schema_forbidden");
    assert_eq!(resolver.list_visible_schemas(IT_LONER).await.unwrap_err().code_str(), "no_access");

    clear_auth_rows(&pool, &users, &groups).await?;
    Ok(())
}

#[tokio::test]
async fn duplicate_email_and_unknown_user_errors() -> Result<()> {
    let Some(pool) = test_pool().await? else { return Ok(()) };
    auth_tables(&pool).await?;
    let store = PgStore::from_pool(pool.clone());
    let email = "dupe@tabledesk-it.test";
    clear_auth_rows(&pool, &[email], &[]).await?;

    store.insert_user(&new_user(email, Role::Viewer)).await?;
    let err = store.insert_user(&new_user(email, Role::Admin)).await.unwrap_err();
    assert_eq!(err.code_str(), "duplicate_user");
    assert_eq!(err.http_status(), 409);
    assert_eq!(store.find_user(email).await?.expect("first insert kept").role, "viewer");

    store.update_password_hash(email, "salt2$hash2").await?;
    assert_eq!(store.find_user(email).await?.expect("user").password_hash, "salt2$hash2");
    let err = store.update_password_hash("ghost@tabledesk-it.test", "x$y").await.unwrap_err();
    assert_eq!(err.code_str(), "no_such_user");

    clear_auth_rows(&pool, &[email], &[]).await?;
    Ok(())
}
