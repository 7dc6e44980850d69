mod common;

use std::sync::Arc;

use common::{MockConnection, block_on, expect_error, unwrap_outcome};
use flushkit::prelude::*;

fn flush_kind(err: &Error) -> FlushErrorKind {
    err.flush_kind()
        .unwrap_or_else(|| std::panic::panic_any(format!("expected a flush error, got {err}")))
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn rows_referencing_each_other_are_a_circular_dependency() {
    block_on(|cx| async move {
        let mappers = MapperRegistry::new()
            .register(
                MapperInfo::new("Node", "nodes")
                    .column(ColumnInfo::id("id"))
                    .column(ColumnInfo::new("next_id"))
                    .relationship(
                        RelationshipInfo::new("next", "Node", RelationshipKind::ManyToOne).local_key("next_id"),
                    ),
            )
            .compile()
            .unwrap();
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone(), mappers);
        let store = session.store_mut();
        let a = store.create("Node").unwrap();
        let b = store.create("Node").unwrap();
        store.set_related(a, "next", Some(b)).unwrap();
        store.set_related(b, "next", Some(a)).unwrap();
        session.add(a).unwrap();

        let err = expect_error(session.flush(&cx).await);
        assert_eq!(flush_kind(&err), FlushErrorKind::CircularDependency);
        assert!(err.to_string().contains("post_update"));
        assert!(conn.statements().is_empty());
        assert_eq!(session.store().state(a), ObjectState::New);
        assert_eq!(session.store().state(b), ObjectState::New);
        assert!(!session.store().is_flushing());
    });
}

#[test]
fn mapping_mistakes_fail_at_compile_time() {
    let unknown_target = MapperRegistry::new()
        .register(
            MapperInfo::new("User", "users")
                .column(ColumnInfo::id("id"))
                .relationship(RelationshipInfo::new("posts", "Post", RelationshipKind::OneToMany).remote_key("user_id")),
        )
        .compile();
    assert!(matches!(unknown_target, Err(Error::Config(_))));

    let not_null_post_update = MapperRegistry::new()
        .register(
            MapperInfo::new("A", "a")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("b_id").nullable(false))
                .relationship(
                    RelationshipInfo::new("b", "B", RelationshipKind::ManyToOne)
                        .local_key("b_id")
                        .post_update(true),
                ),
        )
        .register(MapperInfo::new("B", "b").column(ColumnInfo::id("id")))
        .compile();
    assert!(matches!(not_null_post_update, Err(Error::Config(_))));

    let hard_cycle = MapperRegistry::new()
        .register(
            MapperInfo::new("A", "a")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("b_id").nullable(false))
                .relationship(RelationshipInfo::new("b", "B", RelationshipKind::ManyToOne).local_key("b_id")),
        )
        .register(
            MapperInfo::new("B", "b")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("a_id").nullable(false))
                .relationship(RelationshipInfo::new("a", "A", RelationshipKind::ManyToOne).local_key("a_id")),
        )
        .compile();
    match hard_cycle {
        Err(Error::Config(e)) => assert!(e.to_string().contains("A.b") || e.to_string().contains("B.a")),
        other => std::panic::panic_any(format!("expected a config error, got {other:?}")),
    }
}

// ============================================================================
// Rowcount and versioning
// ============================================================================

fn versioned() -> Arc<Mappers> {
    MapperRegistry::new()
        .register(
            MapperInfo::new("Doc", "docs")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("title"))
                .column(ColumnInfo::new("version"))
                .version_column("version"),
        )
        .compile()
        .unwrap()
}

/// A document whose in-memory version lags behind the database.
fn stale_doc(config: SessionConfig) -> (MockConnection, Session<MockConnection>, InstanceId) {
    let conn = MockConnection::new();
    conn.seed(
        "docs",
        &[("id", Value::BigInt(1)), ("title", Value::from("a")), ("version", Value::BigInt(2))],
    );
    let mut session = Session::with_config(conn.clone(), versioned(), config);
    let store = session.store_mut();
    let doc = store
        .attach(
            "Doc",
            &[("id", Value::BigInt(1)), ("title", Value::from("a")), ("version", Value::BigInt(1))],
        )
        .unwrap();
    store.set(doc, "title", "b").unwrap();
    (conn, session, doc)
}

#[test]
fn stale_version_is_a_concurrent_modification() {
    block_on(|cx| async move {
        let (conn, mut session, doc) = stale_doc(SessionConfig::default());
        match expect_error(session.flush(&cx).await) {
            Error::ConcurrentModification(e) => {
                assert_eq!(e.table, "docs");
                assert_eq!(e.operation, "UPDATE");
                assert_eq!((e.expected, e.actual), (1, 0));
            }
            other => std::panic::panic_any(format!("unexpected error: {other}")),
        }
        assert_eq!(conn.rows("docs")[0]["title"], Value::from("a"));
        assert_eq!(session.store().state(doc), ObjectState::Expired);
    });
}

#[test]
fn rowcount_checks_can_be_disabled() {
    block_on(|cx| async move {
        let (conn, mut session, doc) = stale_doc(SessionConfig::new().check_rowcount(false));
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.statements(),
            vec!["UPDATE \"docs\" SET \"title\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4".to_string()]
        );
        assert_eq!(session.store().state(doc), ObjectState::Persistent);
        assert_eq!(session.store().get(doc, "version"), &Value::BigInt(2));
    });
}

#[test]
fn version_starts_at_one_and_increments() {
    block_on(|cx| async move {
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone(), versioned());
        let doc = session.store_mut().create_with("Doc", &[("title", Value::from("a"))]).unwrap();
        session.add(doc).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        assert_eq!(conn.rows("docs")[0]["version"], Value::BigInt(1));

        session.store_mut().set(doc, "title", "b").unwrap();
        unwrap_outcome(session.flush(&cx).await);
        session.store_mut().set(doc, "title", "c").unwrap();
        unwrap_outcome(session.flush(&cx).await);
        let row = &conn.rows("docs")[0];
        assert_eq!(row["version"], Value::BigInt(3));
        assert_eq!(row["title"], Value::from("c"));
    });
}

// ============================================================================
// Instance errors
// ============================================================================

fn users() -> Arc<Mappers> {
    MapperRegistry::new()
        .register(
            MapperInfo::new("User", "users")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("name"))
                .relationship(
                    RelationshipInfo::new("addresses", "Address", RelationshipKind::OneToMany).remote_key("user_id"),
                ),
        )
        .register(
            MapperInfo::new("Address", "addresses")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("user_id")),
        )
        .register(
            MapperInfo::new("Tag", "tags")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("user_id")),
        )
        .compile()
        .unwrap()
}

#[test]
fn new_instance_with_a_live_key_is_an_identity_conflict() {
    block_on(|cx| async move {
        let conn = MockConnection::new();
        conn.seed("users", &[("id", Value::BigInt(1)), ("name", Value::from("ed"))]);
        let mut session = Session::new(conn.clone(), users());
        let store = session.store_mut();
        store.attach("User", &[("id", Value::BigInt(1)), ("name", Value::from("ed"))]).unwrap();
        let twin = store
            .create_with("User", &[("id", Value::BigInt(1)), ("name", Value::from("eddie"))])
            .unwrap();
        session.add(twin).unwrap();

        let err = expect_error(session.flush(&cx).await);
        assert_eq!(flush_kind(&err), FlushErrorKind::IdentityConflict);
        assert!(conn.statements().is_empty());
        assert_eq!(session.store().state(twin), ObjectState::New);
    });
}

#[test]
fn collection_members_must_match_the_target_mapper() {
    block_on(|cx| async move {
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone(), users());
        let store = session.store_mut();
        let user = store.create("User").unwrap();
        let tag = store.create("Tag").unwrap();
        store.append(user, "addresses", tag).unwrap();
        session.add(user).unwrap();

        let err = expect_error(session.flush(&cx).await);
        assert_eq!(flush_kind(&err), FlushErrorKind::TypeMismatch);
        assert!(err.to_string().contains("Tag"));
    });
}

#[test]
fn typechecks_can_be_disabled() {
    block_on(|cx| async move {
        let conn = MockConnection::new();
        let config = SessionConfig::default().enable_typechecks(false);
        let mut session = Session::with_config(conn.clone(), users(), config);
        let store = session.store_mut();
        let user = store.create("User").unwrap();
        let tag = store.create("Tag").unwrap();
        store.append(user, "addresses", tag).unwrap();
        session.add(user).unwrap();

        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(result.inserted, 2);
        assert_eq!(conn.rows("tags")[0]["user_id"], Value::BigInt(1));
    });
}

#[test]
fn detaching_a_child_keyed_by_its_parent_cannot_null_the_key() {
    block_on(|cx| async move {
        let mappers = MapperRegistry::new()
            .register(
                MapperInfo::new("Order", "orders")
                    .column(ColumnInfo::id("id"))
                    .relationship(
                        RelationshipInfo::new("lines", "OrderLine", RelationshipKind::OneToMany).remote_key("order_id"),
                    ),
            )
            .register(
                MapperInfo::new("OrderLine", "order_lines")
                    .column(ColumnInfo::new("order_id").primary_key(true))
                    .column(ColumnInfo::new("line_no").primary_key(true)),
            )
            .compile()
            .unwrap();
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone(), mappers);
        let store = session.store_mut();
        let order = store.create("Order").unwrap();
        let line = store.create_with("OrderLine", &[("line_no", Value::BigInt(1))]).unwrap();
        store.append(order, "lines", line).unwrap();
        session.add(order).unwrap();
        unwrap_outcome(session.flush(&cx).await);

        conn.clear_log();
        session.store_mut().remove(order, "lines", line).unwrap();
        let err = expect_error(session.flush(&cx).await);
        assert_eq!(flush_kind(&err), FlushErrorKind::BlankOutPrimaryKey);
        assert!(err.to_string().contains("order_id"));
        assert!(conn.statements().is_empty());
    });
}

#[test]
fn handles_from_another_session_are_rejected() {
    let mut other = Session::new(MockConnection::new(), users());
    let store = other.store_mut();
    store.create("User").unwrap();
    let foreign = store.create("Address").unwrap();

    let mut session = Session::new(MockConnection::new(), users());
    let user = session.store_mut().create("User").unwrap();
    assert_eq!(session.store().state(foreign), ObjectState::Detached);
    assert!(session.store().get(foreign, "id").is_null());

    for err in [
        session.add(foreign).unwrap_err(),
        session.delete(foreign).unwrap_err(),
        session.expunge(foreign).unwrap_err(),
        session.store_mut().append(user, "addresses", foreign).unwrap_err(),
        session.store_mut().set(foreign, "user_id", 1).unwrap_err(),
    ] {
        assert_eq!(flush_kind(&err), FlushErrorKind::UnknownInstance, "{err}");
    }
    assert!(session.store().new_instances().is_empty());
}
