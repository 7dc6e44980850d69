mod common;

use std::sync::Arc;

use common::{MockConnection, block_on, position, unwrap_outcome};
use flushkit::prelude::*;
use flushkit::{InstanceStore, PassiveDeletes, Relationship, RelationshipLoader};

// ============================================================================
// Delete-orphan
// ============================================================================

fn orders_lines_notes() -> Arc<Mappers> {
    MapperRegistry::new()
        .register(
            MapperInfo::new("Order", "orders")
                .column(ColumnInfo::id("id"))
                .relationship(
                    RelationshipInfo::new("lines", "Line", RelationshipKind::OneToMany)
                        .remote_key("order_id")
                        .cascade("all, delete-orphan"),
                ),
        )
        .register(
            MapperInfo::new("Line", "lines")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("order_id"))
                .relationship(
                    RelationshipInfo::new("notes", "Note", RelationshipKind::OneToMany)
                        .remote_key("line_id")
                        .cascade("all, delete-orphan"),
                ),
        )
        .register(
            MapperInfo::new("Note", "notes")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("line_id"))
                .column(ColumnInfo::new("body")),
        )
        .compile()
        .unwrap()
}

#[test]
fn orphaned_line_takes_its_notes_with_it() {
    block_on(|cx| async move {
        let conn = MockConnection::new()
            .with_foreign_key("lines", "order_id", "orders", "id")
            .with_foreign_key("notes", "line_id", "lines", "id");
        let mut session = Session::new(conn.clone(), orders_lines_notes());
        let store = session.store_mut();
        let order = store.create("Order").unwrap();
        let kept = store.create("Line").unwrap();
        let dropped = store.create("Line").unwrap();
        let notes: Vec<InstanceId> = ["fragile", "gift"]
            .into_iter()
            .map(|body| store.create_with("Note", &[("body", Value::from(body))]).unwrap())
            .collect();
        store.append(order, "lines", kept).unwrap();
        store.append(order, "lines", dropped).unwrap();
        for &note in &notes {
            store.append(dropped, "notes", note).unwrap();
        }
        session.add(order).unwrap();
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 5);

        conn.clear_log();
        session.store_mut().remove(order, "lines", dropped).unwrap();
        assert_eq!(session.store().state(dropped), ObjectState::Persistent);
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.deleted, 3);
        assert_eq!(result.updated, 0);

        let statements = conn.statements();
        assert_eq!(statements.len(), 3);
        assert!(position(&statements, "DELETE FROM \"notes\"") < position(&statements, "DELETE FROM \"lines\""));
        assert_eq!(conn.row_count("notes"), 0);
        assert_eq!(conn.row_count("lines"), 1);
        assert_eq!(session.store().state(dropped), ObjectState::Deleted);
        for note in notes {
            assert_eq!(session.store().state(note), ObjectState::Deleted);
        }
        assert_eq!(session.store().state(kept), ObjectState::Persistent);

        // Nothing is left to do once the orphan is gone.
        conn.clear_log();
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.total(), 0);
        assert!(conn.statements().is_empty());
    });
}

#[test]
fn moving_a_line_to_another_order_is_not_an_orphan() {
    block_on(|cx| async move {
        let conn = MockConnection::new().with_foreign_key("lines", "order_id", "orders", "id");
        let mut session = Session::new(conn.clone(), orders_lines_notes());
        let store = session.store_mut();
        let first = store.create("Order").unwrap();
        let second = store.create("Order").unwrap();
        let line = store.create("Line").unwrap();
        store.append(first, "lines", line).unwrap();
        session.add(first).unwrap();
        session.add(second).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        conn.clear_log();
        let store = session.store_mut();
        store.remove(first, "lines", line).unwrap();
        store.append(second, "lines", line).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.statements(),
            vec!["UPDATE \"lines\" SET \"order_id\" = $1 WHERE \"id\" = $2".to_string()]
        );
        assert_eq!(conn.rows("lines")[0]["order_id"], Value::BigInt(2));
        assert_eq!(session.store().state(line), ObjectState::Persistent);
    });
}

// ============================================================================
// Association objects
// ============================================================================

fn orders_items() -> Arc<Mappers> {
    MapperRegistry::new()
        .register(
            MapperInfo::new("Order", "orders")
                .column(ColumnInfo::id("id"))
                .relationship(
                    RelationshipInfo::new("items", "OrderItem", RelationshipKind::OneToMany)
                        .remote_key("order_id")
                        .association(true)
                        .cascade("all, delete-orphan"),
                ),
        )
        .register(
            MapperInfo::new("OrderItem", "order_items")
                .column(ColumnInfo::new("order_id").primary_key(true))
                .column(ColumnInfo::new("item_id").primary_key(true))
                .column(ColumnInfo::new("quantity"))
                .relationship(
                    RelationshipInfo::new("item", "Item", RelationshipKind::ManyToOne).local_key("item_id"),
                ),
        )
        .register(
            MapperInfo::new("Item", "items")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("name")),
        )
        .compile()
        .unwrap()
}

#[test]
fn replacing_an_association_object_updates_the_existing_row() {
    block_on(|cx| async move {
        let conn = MockConnection::new()
            .with_foreign_key("order_items", "order_id", "orders", "id")
            .with_foreign_key("order_items", "item_id", "items", "id");
        let mut session = Session::new(conn.clone(), orders_items());
        let store = session.store_mut();
        let order = store.create("Order").unwrap();
        let item = store.create_with("Item", &[("name", Value::from("lamp"))]).unwrap();
        let old = store.create_with("OrderItem", &[("quantity", Value::BigInt(1))]).unwrap();
        store.set_related(old, "item", Some(item)).unwrap();
        store.append(order, "items", old).unwrap();
        session.add(order).unwrap();

        unwrap_outcome(session.flush(&cx).await);
        let statements = conn.statements();
        assert!(position(&statements, "INSERT INTO \"orders\"") < position(&statements, "INSERT INTO \"order_items\""));
        assert!(position(&statements, "INSERT INTO \"items\"") < position(&statements, "INSERT INTO \"order_items\""));
        assert_eq!(
            session.store().primary_key(old),
            vec![Value::BigInt(1), Value::BigInt(1)]
        );

        conn.clear_log();
        let store = session.store_mut();
        store.remove(order, "items", old).unwrap();
        let replacement = store.create_with("OrderItem", &[("quantity", Value::BigInt(5))]).unwrap();
        store.set_related(replacement, "item", Some(item)).unwrap();
        store.append(order, "items", replacement).unwrap();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.statements(),
            vec!["UPDATE \"order_items\" SET \"quantity\" = $1 WHERE \"order_id\" = $2 AND \"item_id\" = $3".to_string()]
        );
        assert_eq!(result.updated, 1);
        assert_eq!(result.deleted, 0);
        assert_eq!(result.inserted, 0);

        let rows = conn.rows("order_items");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["quantity"], Value::BigInt(5));
        assert_eq!(session.store().state(old), ObjectState::Deleted);
        assert_eq!(session.store().state(replacement), ObjectState::Persistent);
        assert!(session.store().identity(replacement).is_some());
    });
}

// ============================================================================
// Passive deletes
// ============================================================================

/// Loads a user's addresses from the mock database.
struct AddressLoader {
    conn: MockConnection,
}

impl RelationshipLoader for AddressLoader {
    fn load(&self, store: &mut InstanceStore, parent: InstanceId, relationship: &Relationship) -> Result<Vec<InstanceId>> {
        assert_eq!(relationship.name, "addresses");
        let user_id = store.get(parent, "id").clone();
        self.conn
            .rows("addresses")
            .into_iter()
            .filter(|row| row["user_id"] == user_id)
            .map(|row| {
                store.attach(
                    "Address",
                    &[("id", row["id"].clone()), ("user_id", row["user_id"].clone())],
                )
            })
            .collect()
    }
}

fn users_addresses(passive: PassiveDeletes) -> Arc<Mappers> {
    MapperRegistry::new()
        .register(
            MapperInfo::new("User", "users")
                .column(ColumnInfo::id("id"))
                .relationship(
                    RelationshipInfo::new("addresses", "Address", RelationshipKind::OneToMany)
                        .remote_key("user_id")
                        .passive_deletes(passive),
                ),
        )
        .register(
            MapperInfo::new("Address", "addresses")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("user_id")),
        )
        .compile()
        .unwrap()
}

fn seeded(passive: PassiveDeletes) -> (MockConnection, Session<MockConnection>, InstanceId) {
    let conn = MockConnection::new();
    conn.seed("users", &[("id", Value::BigInt(7))]);
    for id in [1, 2] {
        conn.seed("addresses", &[("id", Value::BigInt(id)), ("user_id", Value::BigInt(7))]);
    }
    let mut session = Session::new(conn.clone(), users_addresses(passive));
    session.store_mut().set_loader(AddressLoader { conn: conn.clone() });
    let user = session.store_mut().attach("User", &[("id", Value::BigInt(7))]).unwrap();
    (conn, session, user)
}

#[test]
fn deleting_a_parent_loads_and_detaches_its_children() {
    block_on(|cx| async move {
        let (conn, mut session, user) = seeded(PassiveDeletes::Active);
        session.delete(user).unwrap();
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.statements(),
            vec![
                "UPDATE \"addresses\" SET \"user_id\" = $1 WHERE \"id\" = $2".to_string(),
                "UPDATE \"addresses\" SET \"user_id\" = $1 WHERE \"id\" = $2".to_string(),
                "DELETE FROM \"users\" WHERE \"id\" = $1".to_string(),
            ]
        );
        assert_eq!(result.updated, 2);
        assert!(conn.rows("addresses").iter().all(|r| r["user_id"].is_null()));
    });
}

#[test]
fn passive_deletes_leave_unloaded_children_to_the_database() {
    block_on(|cx| async move {
        let (conn, mut session, user) = seeded(PassiveDeletes::Passive);
        session.delete(user).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.statements(),
            vec!["DELETE FROM \"users\" WHERE \"id\" = $1".to_string()]
        );
        assert_eq!(conn.row_count("addresses"), 2);
    });
}

#[test]
fn passive_deletes_all_never_touches_children() {
    block_on(|cx| async move {
        let (conn, mut session, user) = seeded(PassiveDeletes::All);
        let loaded = session.store_mut().related(user, "addresses").unwrap();
        assert_eq!(loaded.len(), 2);

        session.delete(user).unwrap();
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.statements(),
            vec!["DELETE FROM \"users\" WHERE \"id\" = $1".to_string()]
        );
        assert_eq!(result.updated, 0);
        assert!(conn.rows("addresses").iter().all(|r| r["user_id"] == Value::BigInt(7)));
        for address in loaded {
            assert_eq!(session.store().state(address), ObjectState::Persistent);
        }
    });
}

#[test]
fn passive_deletes_all_keeps_the_key_of_a_removed_child() {
    block_on(|cx| async move {
        let (conn, mut session, user) = seeded(PassiveDeletes::All);
        let loaded = session.store_mut().related(user, "addresses").unwrap();
        session.store_mut().remove(user, "addresses", loaded[0]).unwrap();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.total(), 0);
        assert!(conn.statements().is_empty());
        assert_eq!(session.store().get(loaded[0], "user_id"), &Value::BigInt(7));
    });
}

fn users_owning_addresses() -> Arc<Mappers> {
    MapperRegistry::new()
        .register(
            MapperInfo::new("User", "users")
                .column(ColumnInfo::id("id"))
                .relationship(
                    RelationshipInfo::new("addresses", "Address", RelationshipKind::OneToMany)
                        .remote_key("user_id")
                        .cascade("save-update, delete-orphan"),
                ),
        )
        .register(
            MapperInfo::new("Address", "addresses")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("user_id"))
                .column(ColumnInfo::new("email")),
        )
        .compile()
        .unwrap()
}

#[test]
fn child_of_a_deleted_parent_is_an_orphan_without_delete_cascade() {
    block_on(|cx| async move {
        let conn = MockConnection::new().with_foreign_key("addresses", "user_id", "users", "id");
        let mut session = Session::new(conn.clone(), users_owning_addresses());
        let store = session.store_mut();
        let user = store.create("User").unwrap();
        let quiet = store.create("Address").unwrap();
        let edited = store.create("Address").unwrap();
        store.append(user, "addresses", quiet).unwrap();
        store.append(user, "addresses", edited).unwrap();
        session.add(user).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        conn.clear_log();
        // A pending column change must not keep the address alive.
        session.store_mut().set(edited, "email", "x@example.com").unwrap();
        session.delete(user).unwrap();
        assert!(!session.store().is_pending_delete(quiet));

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.deleted, 3);
        assert_eq!(result.updated, 0);
        let statements = conn.statements();
        assert!(position(&statements, "DELETE FROM \"addresses\"") < position(&statements, "DELETE FROM \"users\""));
        assert_eq!(conn.row_count("addresses"), 0);
        assert_eq!(session.store().state(quiet), ObjectState::Deleted);
        assert_eq!(session.store().state(edited), ObjectState::Deleted);
    });
}

#[test]
fn deleting_an_order_deletes_lines_and_notes_without_clearing_keys() {
    block_on(|cx| async move {
        let conn = MockConnection::new()
            .with_foreign_key("lines", "order_id", "orders", "id")
            .with_foreign_key("notes", "line_id", "lines", "id");
        let mut session = Session::new(conn.clone(), orders_lines_notes());
        let store = session.store_mut();
        let order = store.create("Order").unwrap();
        for _ in 0..2 {
            let line = store.create("Line").unwrap();
            let note = store.create_with("Note", &[("body", Value::from("n"))]).unwrap();
            store.append(order, "lines", line).unwrap();
            store.append(line, "notes", note).unwrap();
        }
        session.add(order).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        conn.clear_log();
        session.delete(order).unwrap();
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.deleted, 5);
        assert_eq!(result.updated, 0);
        let statements = conn.statements();
        assert!(statements.iter().all(|s| s.starts_with("DELETE FROM ")));
        assert!(position(&statements, "DELETE FROM \"notes\"") < position(&statements, "DELETE FROM \"lines\""));
        assert!(position(&statements, "DELETE FROM \"lines\"") < position(&statements, "DELETE FROM \"orders\""));
        for table in ["orders", "lines", "notes"] {
            assert_eq!(conn.row_count(table), 0);
        }
    });
}

#[test]
fn removing_a_child_twice_clears_its_key_once() {
    block_on(|cx| async move {
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone(), users_addresses(PassiveDeletes::Active));
        let store = session.store_mut();
        let user = store.create("User").unwrap();
        let address = store.create("Address").unwrap();
        store.append(user, "addresses", address).unwrap();
        session.add(user).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        conn.clear_log();
        let store = session.store_mut();
        store.remove(user, "addresses", address).unwrap();
        store.remove(user, "addresses", address).unwrap();
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.statements(),
            vec!["UPDATE \"addresses\" SET \"user_id\" = $1 WHERE \"id\" = $2".to_string()]
        );
        assert_eq!(result.updated, 1);
        assert_eq!(session.store().state(address), ObjectState::Persistent);
        assert!(conn.rows("addresses")[0]["user_id"].is_null());
    });
}
