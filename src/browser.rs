//!
//! tabledesk table browser
//! -----------------------
//! Per-session browsing and editing of one table at a time.
//!
//! A session opens a table, which loads it into an edit buffer. Edits replace
//! the buffer's rows in memory only. Commit writes the whole buffer back through
//! the backend's drop-and-recreate path after a write-permission check, then
//! reloads; rollback just reloads. A filter narrows every load until cleared.
//!
//! CSV export serializes the buffer as it stands (uncommitted edits included).
//! CSV import parks a preview in the session; only an explicit confirmation,
//! gated like a commit, replaces the table with it.

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::grid::csv_io;
use crate::grid::filter::Filter;
use crate::grid::{TableId, TableSnapshot};
use crate::identity::{Permission, PermissionResolver, Principal};
use crate::storage::SharedStore;

#[derive(Debug, Clone)]
pub struct ActiveFilter {
    pub clause: String,
    pub filter: Filter,
}

/// What one session is looking at. `filter` set means the Filtered state.
#[derive(Debug, Default)]
pub struct BrowserState {
    pub table: Option<TableId>,
    pub filter: Option<ActiveFilter>,
    pub buffer: Option<TableSnapshot>,
    pub pending_import: Option<TableSnapshot>,
}

impl BrowserState {
    pub fn is_filtered(&self) -> bool { self.filter.is_some() }
}

/// Serializable picture of a session's browser state.
#[derive(Debug, Serialize)]
pub struct BrowserView {
    pub table: Option<TableId>,
    pub filter: Option<String>,
    pub filtered: bool,
    pub permission: Option<Permission>,
    pub data: Option<TableSnapshot>,
    pub pending_import: Option<TableSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ExportFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

fn no_table() -> AppError {
    AppError::validation("no_table", "open a table first")
}

#[derive(Clone)]
pub struct Browser {
    store: SharedStore,
    resolver: PermissionResolver,
    raw_filters: bool,
}

impl Browser {
    pub fn new(store: SharedStore, resolver: PermissionResolver, raw_filters: bool) -> Self {
        Self { store, resolver, raw_filters }
    }

    pub fn resolver(&self) -> &PermissionResolver { &self.resolver }

    async fn load(&self, who: &Principal, id: &TableId, filter: Option<&Filter>) -> AppResult<TableSnapshot> {
        self.resolver.ensure_can_read(&who.email, id).await?;
        self.store.load_table(id, filter).await
    }

    /// Select `id` and load it unfiltered. Any filter or pending import of the
    /// previous table is dropped.
    pub async fn open(&self, who: &Principal, state: &mut BrowserState, id: TableId) -> AppResult<()> {
        let snapshot = self.load(who, &id, None).await?;
        info!(target: "tabledesk::browser", email = %who.email, table = %id, rows = snapshot.height(), "opened table");
        state.table = Some(id);
        state.filter = None;
        state.buffer = Some(snapshot);
        state.pending_import = None;
        Ok(())
    }

    /// Replace the buffer with fresh data, honouring the active filter.
    pub async fn reload(&self, who: &Principal, state: &mut BrowserState) -> AppResult<()> {
        let id = state.table.clone().ok_or_else(no_table)?;
        let filter = state.filter.as_ref().map(|f| f.filter.clone());
        let snapshot = self.load(who, &id, filter.as_ref()).await?;
        state.buffer = Some(snapshot);
        Ok(())
    }

    /// Enter (or change) the Filtered state. An empty clause changes nothing; a
    /// clause that fails to parse or load leaves the previous state in place.
    pub async fn apply_filter(&self, who: &Principal, state: &mut BrowserState, clause: &str) -> AppResult<()> {
        let clause = clause.trim();
        if clause.is_empty() {
            return Ok(());
        }
        let id = state.table.clone().ok_or_else(no_table)?;
        let filter = Filter::parse(clause, self.raw_filters)?;
        let snapshot = self.load(who, &id, Some(&filter)).await?;
        info!(target: "tabledesk::browser", email = %who.email, table = %id, raw = filter.is_raw(), rows = snapshot.height(), "filter applied");
        state.filter = Some(ActiveFilter { clause: clause.to_string(), filter });
        state.buffer = Some(snapshot);
        Ok(())
    }

    pub async fn clear_filter(&self, who: &Principal, state: &mut BrowserState) -> AppResult<()> {
        let id = state.table.clone().ok_or_else(no_table)?;
        let snapshot = self.load(who, &id, None).await?;
        state.filter = None;
        state.buffer = Some(snapshot);
        Ok(())
    }

    /// Replace the buffer's rows with grid input coerced to the buffer's columns.
    pub fn edit_rows(&self, state: &mut BrowserState, rows: &[Vec<Value>]) -> AppResult<usize> {
        let buffer = state.buffer.as_mut().ok_or_else(no_table)?;
        let cells = TableSnapshot::rows_from_json(&buffer.columns, rows)?;
        buffer.rows = cells;
        Ok(buffer.height())
    }

    /// Write the buffer over the table, then reload it.
    pub async fn commit(&self, who: &Principal, state: &mut BrowserState) -> AppResult<()> {
        let id = state.table.clone().ok_or_else(no_table)?;
        if state.is_filtered() {
            // the buffer only holds matching rows; replacing would drop the rest
            return Err(AppError::validation(
                "filtered_commit",
                "clear the filter before committing; a commit replaces the whole table",
            ));
        }
        let buffer = state.buffer.as_ref().ok_or_else(no_table)?;
        self.resolver.ensure_can_write(&who.email, &id).await?;
        self.store.replace_table(&id, buffer).await?;
        info!(target: "tabledesk::browser", email = %who.email, table = %id, rows = buffer.height(), "committed");
        self.reload(who, state).await
    }

    /// Discard edits by reloading from the database.
    pub async fn rollback(&self, who: &Principal, state: &mut BrowserState) -> AppResult<()> {
        self.reload(who, state).await?;
        if let Some(id) = &state.table {
            info!(target: "tabledesk::browser", email = %who.email, table = %id, "rolled back");
        }
        Ok(())
    }

    pub async fn export_csv(&self, who: &Principal, state: &BrowserState) -> AppResult<ExportFile> {
        let id = state.table.as_ref().ok_or_else(no_table)?;
        let buffer = state.buffer.as_ref().ok_or_else(no_table)?;
        self.resolver.ensure_can_read(&who.email, id).await?;
        let bytes = csv_io::export_csv(buffer)?;
        let file_name = csv_io::export_file_name(id, chrono::Local::now().naive_local());
        info!(target: "tabledesk::browser", email = %who.email, table = %id, rows = buffer.height(), "exported csv");
        Ok(ExportFile { file_name, bytes })
    }

    /// Parse an upload and keep it as the pending preview for the open table.
    pub fn import_preview<'a>(&self, state: &'a mut BrowserState, bytes: &[u8]) -> AppResult<&'a TableSnapshot> {
        if state.table.is_none() {
            return Err(no_table());
        }
        let preview = csv_io::import_csv(bytes)?;
        Ok(state.pending_import.insert(preview))
    }

    /// Replace the open table with the pending preview, then reload it
    /// unfiltered: the previous filter may name columns the import dropped.
    pub async fn confirm_import(&self, who: &Principal, state: &mut BrowserState) -> AppResult<()> {
        let id = state.table.clone().ok_or_else(no_table)?;
        let preview = state.pending_import.as_ref().ok_or_else(|| {
            AppError::validation("no_pending_import", "upload a file before confirming")
        })?;
        self.resolver.ensure_can_write(&who.email, &id).await?;
        self.store.replace_table(&id, preview).await?;
        info!(target: "tabledesk::browser", email = %who.email, table = %id, rows = preview.height(), "imported csv");
        state.pending_import = None;
        state.filter = None;
        self.reload(who, state).await
    }

    pub fn discard_import(&self, state: &mut BrowserState) -> bool {
        state.pending_import.take().is_some()
    }

    pub async fn view(&self, who: &Principal, state: &BrowserState) -> AppResult<BrowserView> {
        let permission = match &state.table {
            Some(id) => self.resolver.permission_for(&who.email, &id.schema).await?,
            None => None,
        };
        Ok(BrowserView {
            table: state.table.clone(),
            filter: state.filter.as_ref().map(|f| f.clause.clone()),
            filtered: state.is_filtered(),
            permission,
            data: state.buffer.clone(),
            pending_import: state.pending_import.clone(),
        })
    }
}
