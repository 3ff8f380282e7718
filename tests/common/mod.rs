//! Shared fixtures: an in-process store seeded with the users, groups and
//! tables the integration tests act on.
#![allow(dead_code)]

use std::sync::Arc;

use tabledesk::grid::{Cell, Column, ColumnType, TableId, TableSnapshot};
use tabledesk::identity::Role;
use tabledesk::server::AppState;
use tabledesk::storage::memory::MemoryStore;
use tabledesk::storage::SharedStore;

pub const READER: &str = "a@x.com";
pub const WRITER: &str = "w@x.com";
pub const OUTSIDER: &str = "n@x.com";
pub const PASSWORD: &str = "correct horse";

pub fn orders_id() -> TableId {
    TableId::new("sales", "orders")
}

pub fn orders() -> TableSnapshot {
    let mut t = TableSnapshot::new(vec![
        Column::new("id", ColumnType::Integer),
        Column::new("status", ColumnType::Text),
        Column::new("amount", ColumnType::Float),
    ])
    .unwrap();
    t.push_row(vec![Cell::Int(1), Cell::Text("open".into()), Cell::Float(10.0)]).unwrap();
    t.push_row(vec![Cell::Int(2), Cell::Text("closed".into()), Cell::Float(250.5)]).unwrap();
    t.push_row(vec![Cell::Int(3), Cell::Text("open".into()), Cell::Null]).unwrap();
    t
}

/// G1 reads `sales`, G2 writes `sales` and reads `hr`; the outsider has no groups.
pub fn seeded_store() -> Arc<MemoryStore> {
    let mem = Arc::new(MemoryStore::new());
    mem.add_user(READER, PASSWORD, Role::Viewer).unwrap();
    mem.add_user(WRITER, PASSWORD, Role::Editor).unwrap();
    mem.add_user(OUTSIDER, PASSWORD, Role::Admin).unwrap();
    mem.add_member(READER, "G1");
    mem.add_member(WRITER, "G2");
    mem.grant("G1", "sales", "read");
    mem.grant("G2", "sales", "write");
    mem.grant("G2", "hr", "read");
    mem.put_table(orders_id(), orders());
    let mut people = TableSnapshot::new(vec![Column::new("name", ColumnType::Text)]).unwrap();
    people.push_row(vec![Cell::Text("ann".into())]).unwrap();
    mem.put_table(TableId::new("hr", "people"), people);
    mem
}

pub fn app_state(mem: &Arc<MemoryStore>, raw_filters: bool) -> AppState {
    AppState::new(SharedStore(mem.clone()), raw_filters)
}
