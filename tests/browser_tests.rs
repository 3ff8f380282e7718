//! Table browser flows: permission gating, commit/rollback, the filter state
//! machine, CSV import/export and load failures.

mod common;

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use common::*;
use tabledesk::browser::BrowserState;
use tabledesk::grid::{csv_io, Cell, TableId};
use tabledesk::identity::{LoginRequest, Permission, Session};
use tabledesk::server::AppState;

async fn login(state: &AppState, email: &str) -> Arc<Session> {
    state
        .auth
        .login(&LoginRequest { email: email.into(), password: PASSWORD.into() })
        .await
        .expect("login")
}

fn edited_rows() -> Vec<Vec<serde_json::Value>> {
    vec![
        vec![json!(1), json!("open"), json!(12.5)],
        vec![json!(2), json!("shipped"), json!("250.5")],
        vec![json!(4), json!("new"), json!(null)],
    ]
}

#[tokio::test]
async fn read_only_commit_is_rejected_and_table_unchanged() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, READER).await;
    let mut b = s.browser.lock().await;

    state.browser.open(&s.principal, &mut b, orders_id()).await?;
    assert_eq!(
        state.browser.resolver().permission_for(READER, "sales").await?,
        Some(Permission::Read("read".into()))
    );
    state.browser.edit_rows(&mut b, &edited_rows())?;
    let err = state.browser.commit(&s.principal, &mut b).await.unwrap_err();
    assert!(err.is_authorization());
    assert_eq!(err.http_status(), 403);
    assert_eq!(mem.table(&orders_id()).unwrap(), orders());
    Ok(())
}

#[tokio::test]
async fn write_commit_replaces_table_and_reloads() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, WRITER).await;
    let mut b = s.browser.lock().await;

    state.browser.open(&s.principal, &mut b, orders_id()).await?;
    assert_eq!(state.browser.edit_rows(&mut b, &edited_rows())?, 3);
    state.browser.commit(&s.principal, &mut b).await?;

    let stored = mem.table(&orders_id()).unwrap();
    assert_eq!(stored.height(), 3);
    assert_eq!(stored.rows[1][1], Cell::Text("shipped".into()));
    assert_eq!(stored.rows[2], vec![Cell::Int(4), Cell::Text("new".into()), Cell::Null]);
    assert_eq!(b.buffer.as_ref().unwrap(), &stored);

    // a second reader session sees the committed rows
    let r = login(&state, READER).await;
    let mut rb = r.browser.lock().await;
    state.browser.open(&r.principal, &mut rb, orders_id()).await?;
    assert_eq!(rb.buffer.as_ref().unwrap(), &stored);
    Ok(())
}

#[tokio::test]
async fn rollback_discards_edits() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, WRITER).await;
    let mut b = s.browser.lock().await;

    state.browser.open(&s.principal, &mut b, orders_id()).await?;
    state.browser.edit_rows(&mut b, &[])?;
    assert_eq!(b.buffer.as_ref().unwrap().height(), 0);
    state.browser.rollback(&s.principal, &mut b).await?;
    assert_eq!(b.buffer.as_ref().unwrap(), &orders());
    Ok(())
}

#[tokio::test]
async fn edits_are_coerced_to_column_types() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, WRITER).await;
    let mut b = s.browser.lock().await;
    state.browser.open(&s.principal, &mut b, orders_id()).await?;

    let err = state.browser.edit_rows(&mut b, &[vec![json!("x"), json!("a"), json!(1)]]).unwrap_err();
    assert_eq!(err.code_str(), "cell_type");
    let err = state.browser.edit_rows(&mut b, &[vec![json!(1)]]).unwrap_err();
    assert_eq!(err.code_str(), "row_width");
    // rejected edits leave the buffer alone
    assert_eq!(b.buffer.as_ref().unwrap(), &orders());
    Ok(())
}

#[tokio::test]
async fn filter_lifecycle() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, READER).await;
    let mut b = s.browser.lock().await;
    state.browser.open(&s.principal, &mut b, orders_id()).await?;

    // empty clause is a no-op
    state.browser.apply_filter(&s.principal, &mut b, "   ").await?;
    assert!(!b.is_filtered());

    state.browser.apply_filter(&s.principal, &mut b, "status = 'open'").await?;
    assert!(b.is_filtered());
    assert_eq!(b.buffer.as_ref().unwrap().height(), 2);

    // later loads keep applying the clause
    state.browser.rollback(&s.principal, &mut b).await?;
    assert_eq!(b.buffer.as_ref().unwrap().height(), 2);

    // a bad clause leaves the active filter in place
    let err = state.browser.apply_filter(&s.principal, &mut b, "status = 'open'; DROP TABLE x").await.unwrap_err();
    assert_eq!(err.code_str(), "bad_filter");
    let err = state.browser.apply_filter(&s.principal, &mut b, "missing = 1").await.unwrap_err();
    assert_eq!(err.code_str(), "unknown_column");
    assert_eq!(b.filter.as_ref().unwrap().clause, "status = 'open'");

    state.browser.clear_filter(&s.principal, &mut b).await?;
    assert!(!b.is_filtered());
    assert_eq!(b.buffer.as_ref().unwrap().height(), 3);
    Ok(())
}

#[tokio::test]
async fn commit_is_refused_while_filtered() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, WRITER).await;
    let mut b = s.browser.lock().await;
    state.browser.open(&s.principal, &mut b, orders_id()).await?;
    state.browser.apply_filter(&s.principal, &mut b, "amount > 100").await?;
    assert_eq!(b.buffer.as_ref().unwrap().height(), 1);

    let err = state.browser.commit(&s.principal, &mut b).await.unwrap_err();
    assert_eq!(err.code_str(), "filtered_commit");
    assert_eq!(mem.table(&orders_id()).unwrap(), orders());
    Ok(())
}

#[tokio::test]
async fn opening_another_table_resets_filter_and_preview() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, WRITER).await;
    let mut b = s.browser.lock().await;
    state.browser.open(&s.principal, &mut b, orders_id()).await?;
    state.browser.apply_filter(&s.principal, &mut b, "id = 1").await?;
    state.browser.import_preview(&mut b, b"id\n1\n")?;

    state.browser.open(&s.principal, &mut b, TableId::new("hr", "people")).await?;
    assert!(!b.is_filtered());
    assert!(b.pending_import.is_none());
    assert_eq!(b.buffer.as_ref().unwrap().height(), 1);
    Ok(())
}

#[tokio::test]
async fn reads_are_limited_to_visible_schemas() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let resolver = state.browser.resolver();

    assert_eq!(resolver.list_visible_schemas(WRITER).await?, vec!["hr".to_string(), "sales".to_string()]);
    let err = resolver.list_visible_schemas(OUTSIDER).await.unwrap_err();
    assert_eq!(err.code_str(), "no_access");

    let tables = resolver.list_tables(READER, "sales").await?;
    assert_eq!(tables.get("orders"), Some(&orders_id()));
    assert_eq!(resolver.list_tables(READER, "hr").await.unwrap_err().code_str(), "schema_forbidden");

    mem.grant("G1", "empty", "read");
    assert!(resolver.list_tables(READER, "empty").await?.is_empty());

    let s = login(&state, READER).await;
    let mut b = s.browser.lock().await;
    let err = state.browser.open(&s.principal, &mut b, TableId::new("hr", "people")).await.unwrap_err();
    assert!(err.is_authorization());
    assert!(b.table.is_none());
    Ok(())
}

#[tokio::test]
async fn export_includes_uncommitted_edits() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, READER).await;
    let mut b = s.browser.lock().await;
    state.browser.open(&s.principal, &mut b, orders_id()).await?;
    state.browser.edit_rows(&mut b, &edited_rows())?;

    let file = state.browser.export_csv(&s.principal, &b).await?;
    assert!(file.file_name.starts_with("orders_"));
    assert!(file.file_name.ends_with(".csv"));
    let text = String::from_utf8(file.bytes.clone())?;
    assert_eq!(text, "id,status,amount\n1,open,12.5\n2,shipped,250.5\n4,new,\n");

    let back = csv_io::import_csv(&file.bytes)?;
    assert_eq!(&back, b.buffer.as_ref().unwrap());
    Ok(())
}

#[tokio::test]
async fn import_preview_confirm_is_write_gated() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let csv = b"id,status,amount,note\n7,open,1.5,first\n8,closed,,\n";

    let r = login(&state, READER).await;
    let mut rb = r.browser.lock().await;
    state.browser.open(&r.principal, &mut rb, orders_id()).await?;
    assert_eq!(state.browser.import_preview(&mut rb, csv)?.height(), 2);
    let err = state.browser.confirm_import(&r.principal, &mut rb).await.unwrap_err();
    assert!(err.is_authorization());
    assert!(rb.pending_import.is_some());
    assert_eq!(mem.table(&orders_id()).unwrap(), orders());
    assert!(state.browser.discard_import(&mut rb));
    assert!(!state.browser.discard_import(&mut rb));

    let w = login(&state, WRITER).await;
    let mut wb = w.browser.lock().await;
    state.browser.open(&w.principal, &mut wb, orders_id()).await?;
    let err = state.browser.confirm_import(&w.principal, &mut wb).await.unwrap_err();
    assert_eq!(err.code_str(), "no_pending_import");
    state.browser.import_preview(&mut wb, csv)?;
    state.browser.confirm_import(&w.principal, &mut wb).await?;

    let stored = mem.table(&orders_id()).unwrap();
    assert_eq!(stored.column_names(), vec!["id", "status", "amount", "note"]);
    assert_eq!(stored.rows[1], vec![Cell::Int(8), Cell::Text("closed".into()), Cell::Null, Cell::Null]);
    assert!(wb.pending_import.is_none());
    assert_eq!(wb.buffer.as_ref().unwrap(), &stored);
    Ok(())
}

#[tokio::test]
async fn confirmed_import_clears_filter_on_new_columns() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let w = login(&state, WRITER).await;
    let mut b = w.browser.lock().await;

    state.browser.open(&w.principal, &mut b, orders_id()).await?;
    state.browser.apply_filter(&w.principal, &mut b, "amount > 100").await?;
    assert!(b.is_filtered());
    state.browser.import_preview(&mut b, b"x\n1\n2\n")?;
    state.browser.confirm_import(&w.principal, &mut b).await?;

    assert!(!b.is_filtered());
    assert!(b.pending_import.is_none());
    let stored = mem.table(&orders_id()).unwrap();
    assert_eq!(stored.column_names(), vec!["x"]);
    assert_eq!(b.buffer.as_ref().unwrap(), &stored);
    state.browser.rollback(&w.principal, &mut b).await?;
    assert_eq!(b.buffer.as_ref().unwrap().height(), 2);
    Ok(())
}

#[tokio::test]
async fn load_failure_is_an_error_not_an_empty_table() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, READER).await;
    let mut b = s.browser.lock().await;
    state.browser.open(&s.principal, &mut b, orders_id()).await?;

    mem.set_available(false);
    let err = state.browser.rollback(&s.principal, &mut b).await.unwrap_err();
    assert_eq!(err.http_status(), 502);
    mem.set_available(true);
    // the previous buffer is still there
    assert_eq!(b.buffer.as_ref().unwrap(), &orders());
    Ok(())
}

#[tokio::test]
async fn raw_filters_need_a_database_backend() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, true);
    let s = login(&state, READER).await;
    let mut b = s.browser.lock().await;
    state.browser.open(&s.principal, &mut b, orders_id()).await?;

    // grammar clauses still run in raw mode
    state.browser.apply_filter(&s.principal, &mut b, "id >= 2").await?;
    assert_eq!(b.buffer.as_ref().unwrap().height(), 2);
    let err = state.browser.apply_filter(&s.principal, &mut b, "id IN (1, 2)").await.unwrap_err();
    assert_eq!(err.code_str(), "raw_filter_unsupported");
    assert_eq!(b.filter.as_ref().unwrap().clause, "id >= 2");
    Ok(())
}

#[tokio::test]
async fn actions_need_an_open_table() -> Result<()> {
    let mem = seeded_store();
    let state = app_state(&mem, false);
    let s = login(&state, WRITER).await;
    let mut b: tokio::sync::MutexGuard<'_, BrowserState> = s.browser.lock().await;
    assert_eq!(state.browser.commit(&s.principal, &mut b).await.unwrap_err().code_str(), "no_table");
    assert_eq!(state.browser.apply_filter(&s.principal, &mut b, "id = 1").await.unwrap_err().code_str(), "no_table");
    assert_eq!(state.browser.import_preview(&mut b, b"a\n1\n").unwrap_err().code_str(), "no_table");
    Ok(())
}
