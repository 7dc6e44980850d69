//! A person owns many balls and has one favorite ball: the two foreign keys
//! point at each other's tables, so one side has to be written by a
//! trailing UPDATE.

mod common;

use std::sync::Arc;

use common::{MockConnection, block_on, unwrap_outcome};
use flushkit::prelude::*;

fn person_ball(post_update_balls: bool) -> Arc<Mappers> {
    MapperRegistry::new()
        .register(
            MapperInfo::new("Person", "person")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("favorite_ball_id"))
                .relationship(
                    RelationshipInfo::new("balls", "Ball", RelationshipKind::OneToMany)
                        .remote_key("person_id")
                        .cascade("all, delete-orphan")
                        .post_update(post_update_balls),
                )
                .relationship(
                    RelationshipInfo::new("favorite", "Ball", RelationshipKind::ManyToOne)
                        .local_key("favorite_ball_id")
                        .post_update(!post_update_balls),
                ),
        )
        .register(
            MapperInfo::new("Ball", "ball")
                .column(ColumnInfo::id("id"))
                .column(ColumnInfo::new("person_id")),
        )
        .compile()
        .unwrap()
}

fn connection() -> MockConnection {
    MockConnection::new()
        .with_foreign_key("ball", "person_id", "person", "id")
        .with_foreign_key("person", "favorite_ball_id", "ball", "id")
}

/// A person with four balls, the first one being the favorite.
fn populate(session: &mut Session<MockConnection>) -> (InstanceId, Vec<InstanceId>) {
    let store = session.store_mut();
    let person = store.create("Person").unwrap();
    let balls: Vec<InstanceId> = (0..4).map(|_| store.create("Ball").unwrap()).collect();
    for &ball in &balls {
        store.append(person, "balls", ball).unwrap();
    }
    store.set_related(person, "favorite", Some(balls[0])).unwrap();
    session.add(person).unwrap();
    (person, balls)
}

fn repeat(sql: &str, n: usize) -> Vec<String> {
    vec![sql.to_string(); n]
}

#[test]
fn one_to_many_post_update_links_children_after_both_inserts() {
    block_on(|cx| async move {
        let conn = connection();
        let mut session = Session::new(conn.clone(), person_ball(true));
        let (person, balls) = populate(&mut session);

        let result = unwrap_outcome(session.flush(&cx).await);
        let mut expected = repeat("INSERT INTO \"ball\" (\"person_id\") VALUES ($1)", 4);
        expected.push("INSERT INTO \"person\" (\"favorite_ball_id\") VALUES ($1)".to_string());
        expected.extend(repeat("UPDATE \"ball\" SET \"person_id\" = $1 WHERE \"id\" = $2", 4));
        assert_eq!(conn.statements(), expected);
        assert_eq!(result.inserted, 5);
        assert_eq!(result.post_updates, 4);

        let log = conn.log();
        assert_eq!(log[4].1, vec![Value::BigInt(1)]);
        for (i, (_, params)) in log[5..].iter().enumerate() {
            assert_eq!(params, &vec![Value::BigInt(1), Value::BigInt(i as i64 + 1)]);
        }
        for &ball in &balls {
            assert_eq!(session.store().get(ball, "person_id"), &Value::BigInt(1));
        }

        conn.clear_log();
        session.delete(person).unwrap();
        let result = unwrap_outcome(session.flush(&cx).await);
        let mut expected = repeat("UPDATE \"ball\" SET \"person_id\" = $1 WHERE \"id\" = $2", 4);
        expected.push("DELETE FROM \"person\" WHERE \"id\" = $1".to_string());
        expected.extend(repeat("DELETE FROM \"ball\" WHERE \"id\" = $1", 4));
        assert_eq!(conn.statements(), expected);
        assert_eq!(result.deleted, 5);
        assert_eq!(conn.log()[0].1[0], Value::Null);
        assert_eq!(conn.row_count("ball"), 0);
        assert_eq!(conn.row_count("person"), 0);
    });
}

#[test]
fn many_to_one_post_update_sets_the_favorite_last() {
    block_on(|cx| async move {
        let conn = connection();
        let mut session = Session::new(conn.clone(), person_ball(false));
        let (person, _) = populate(&mut session);

        let result = unwrap_outcome(session.flush(&cx).await);
        let mut expected = vec!["INSERT INTO \"person\" (\"favorite_ball_id\") VALUES ($1)".to_string()];
        expected.extend(repeat("INSERT INTO \"ball\" (\"person_id\") VALUES ($1)", 4));
        expected.push("UPDATE \"person\" SET \"favorite_ball_id\" = $1 WHERE \"id\" = $2".to_string());
        assert_eq!(conn.statements(), expected);
        assert_eq!(result.post_updates, 1);
        assert_eq!(conn.log()[5].1, vec![Value::BigInt(1), Value::BigInt(1)]);
        assert_eq!(conn.rows("person")[0]["favorite_ball_id"], Value::BigInt(1));

        conn.clear_log();
        session.delete(person).unwrap();
        unwrap_outcome(session.flush(&cx).await);
        let mut expected = vec!["UPDATE \"person\" SET \"favorite_ball_id\" = $1 WHERE \"id\" = $2".to_string()];
        expected.extend(repeat("DELETE FROM \"ball\" WHERE \"id\" = $1", 4));
        expected.push("DELETE FROM \"person\" WHERE \"id\" = $1".to_string());
        assert_eq!(conn.statements(), expected);
        assert_eq!(conn.log()[0].1, vec![Value::Null, Value::BigInt(1)]);
    });
}

#[test]
fn changing_the_favorite_needs_only_the_post_update() {
    block_on(|cx| async move {
        let conn = connection();
        let mut session = Session::new(conn.clone(), person_ball(false));
        let (person, balls) = populate(&mut session);
        unwrap_outcome(session.flush(&cx).await);

        conn.clear_log();
        session.store_mut().set_related(person, "favorite", Some(balls[2])).unwrap();
        let result = unwrap_outcome(session.flush(&cx).await);
        assert_eq!(
            conn.statements(),
            vec!["UPDATE \"person\" SET \"favorite_ball_id\" = $1 WHERE \"id\" = $2".to_string()]
        );
        assert_eq!(result.updated, 0);
        assert_eq!(result.post_updates, 1);
        assert_eq!(conn.rows("person")[0]["favorite_ball_id"], Value::BigInt(3));
    });
}

#[test]
fn plan_shows_the_post_update_stub_last() {
    let mut session = Session::new(connection(), person_ball(true));
    populate(&mut session);
    let plan = session.plan().unwrap();
    let lines = plan.lines();
    assert!(lines[0].starts_with("save Ball: "));
    let person = lines.iter().position(|l| l.starts_with("save Person: ")).unwrap();
    let balls = lines.iter().position(|l| l == "process OneToMany(Person.balls)").unwrap();
    assert!(person < balls);
}
