//! Behavioural guarantees of the unit of work, exercised end to end against
//! the in-memory backend.

mod common;

use common::{customer, departments, key, open, order, shop, statements};
use sessionkit::{
    Connection, Entity, EntityState, Error, MemoryOptions, Statement, Value,
};

#[test]
fn identity_map_returns_the_same_instance_for_a_key() {
    let registry = shop();
    let (db, mut session) = open(&registry, MemoryOptions::default());
    db.seed(
        "customers",
        &[("id", Value::BigInt(7)), ("name", Value::from("ann"))],
    )
    .unwrap();

    let k = key(&session, "Customer", 7_i64);
    let first = session.get(&k).unwrap().unwrap();
    let second = session.get(&k).unwrap().unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(statements(&session, "SELECT").len(), 1);

    // Integer width does not split identities.
    let narrow = key(&session, "Customer", 7_i32);
    assert!(session.get(&narrow).unwrap().unwrap().ptr_eq(&first));
}

#[test]
fn removed_orphan_is_deleted_at_flush() {
    let registry = shop();
    let (db, mut session) = open(&registry, MemoryOptions::default());
    let ann = customer(&registry, "ann");
    let first = order(&registry, 10);
    let second = order(&registry, 20);
    ann.append("orders", &first).unwrap();
    ann.append("orders", &second).unwrap();
    session.add(&ann).unwrap();
    session.commit().unwrap();

    let orders = session.related(&ann, "orders").unwrap();
    let doomed = orders
        .iter()
        .find(|o| o.ptr_eq(&first))
        .cloned()
        .unwrap();
    ann.remove("orders", &doomed).unwrap();
    let result = session.flush().unwrap();
    assert_eq!(result.deleted, 1);
    assert_eq!(statements(&session, "DELETE FROM orders").len(), 1);
    session.commit().unwrap();

    assert_eq!(doomed.state(), EntityState::Detached);
    let rows = db.rows("orders").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_by_name("total"), Some(&Value::BigInt(20)));
}

#[test]
fn reattached_orphan_moves_to_new_parent() {
    let registry = shop();
    let (db, mut session) = open(&registry, MemoryOptions::default());
    let ann = customer(&registry, "ann");
    let bob = customer(&registry, "bob");
    let item = order(&registry, 10);
    ann.append("orders", &item).unwrap();
    session.add_all(&[ann.clone(), bob.clone()]).unwrap();
    session.commit().unwrap();

    session.related(&ann, "orders").unwrap();
    session.related(&bob, "orders").unwrap();
    ann.remove("orders", &item).unwrap();
    bob.append("orders", &item).unwrap();
    session.commit().unwrap();

    assert!(statements(&session, "DELETE").is_empty());
    assert_eq!(item.state(), EntityState::Persistent);
    let bob_id = session.get_attr(&bob, "id").unwrap();
    let rows = db.find("orders", &[("customer_id", bob_id)]).unwrap();
    assert_eq!(rows.len(), 1);
}

#[test]
fn parent_insert_precedes_child_insert() {
    let registry = shop();
    let (_db, mut session) = open(&registry, MemoryOptions::default());
    let item = order(&registry, 5);
    let ann = customer(&registry, "ann");
    // Adding the child first must not change the statement order.
    item.set_related("customer", Some(&ann)).unwrap();
    session.add(&item).unwrap();
    session.flush().unwrap();

    let log = session.connection().log();
    let parent = log.position("INSERT INTO customers").unwrap();
    let child = log.position("INSERT INTO orders").unwrap();
    assert!(parent < child);
    assert_eq!(
        item.peek("customer_id").unwrap().ready(),
        ann.peek("id").unwrap().ready()
    );
}

#[test]
fn expire_keeps_edits_made_after_it() {
    let registry = shop();
    let (_db, mut session) = open(&registry, MemoryOptions::default());
    let ann = customer(&registry, "ann");
    session.add(&ann).unwrap();
    session.flush().unwrap();

    session.expire(&ann, &[]).unwrap();
    ann.set("name", "X").unwrap();
    let request = session.on_stale_access(&ann, "email").unwrap().unwrap();
    assert_eq!(request.columns, vec!["email"]);

    let log = session.connection().log();
    log.clear();
    let email = session.get_attr(&ann, "email").unwrap();
    assert_eq!(email, Value::from("ann@example.com"));
    assert_eq!(ann.peek("name").unwrap().ready(), Some(Value::from("X")));
    assert_eq!(log.count("SELECT"), 1);
    assert_eq!(session.modified_attributes(&ann), vec!["name"]);
}

#[test]
fn unattached_orphan_fails_flush() {
    let registry = shop();
    let (db, mut session) = open(&registry, MemoryOptions::default());
    let stray = order(&registry, 1);
    session.add(&stray).unwrap();

    let err = session.flush().unwrap_err();
    let Error::Orphan(orphan) = &err else {
        panic!("expected orphan error, got {err:?}");
    };
    assert_eq!(orphan.mapper, "Order");
    assert!(stray.identity_key().is_none());
    assert_eq!(stray.state(), EntityState::Pending);
    assert!(statements(&session, "INSERT").is_empty());

    session.rollback().unwrap();
    assert!(!session.contains(&stray));
    assert_eq!(db.row_count("orders").unwrap(), 0);
}

#[test]
fn savepoint_rollback_keeps_outer_work() {
    let registry = shop();
    let (db, mut session) = open(&registry, MemoryOptions::default());
    session.begin().unwrap();
    let a = customer(&registry, "a");
    session.add(&a).unwrap();
    session.flush().unwrap();

    let savepoint = session.begin_nested().unwrap();
    let b = customer(&registry, "b");
    session.add(&b).unwrap();
    session.flush().unwrap();
    session.rollback_frame(&savepoint).unwrap();

    assert_eq!(session.transaction_depth(), 1);
    assert_eq!(b.state(), EntityState::Transient);
    assert!(b.identity_key().is_none());

    let frame = session.current_frame().unwrap();
    let conn = session.connection_for(&frame).unwrap();
    let select = conn
        .compile(Statement::Select {
            table: "customers",
            columns: vec!["name"],
            filter_columns: vec![],
            filter_values: vec![],
        })
        .unwrap();
    let visible = conn.execute(&frame, &select).unwrap().returned_rows;
    let names: Vec<&Value> = visible.iter().filter_map(|r| r.get_by_name("name")).collect();
    assert_eq!(names, vec![&Value::from("a")]);

    session.commit().unwrap();
    assert_eq!(db.row_count("customers").unwrap(), 1);
    assert_eq!(a.state(), EntityState::Persistent);
}

#[test]
fn key_change_updates_children_one_by_one() {
    let registry = departments(false);
    let (db, mut session) = open(&registry, MemoryOptions::default().deferred_foreign_keys());
    db.seed(
        "departments",
        &[("code", Value::from("ops")), ("title", Value::from("Operations"))],
    )
    .unwrap();
    for (id, name) in [(1_i64, "kim"), (2, "lee")] {
        db.seed(
            "employees",
            &[
                ("id", Value::BigInt(id)),
                ("name", Value::from(name)),
                ("department_code", Value::from("ops")),
            ],
        )
        .unwrap();
    }

    let dept = session.get(&key(&session, "Department", "ops")).unwrap().unwrap();
    dept.set("code", "eng").unwrap();
    let result = session.flush().unwrap();
    assert_eq!(result.updated, 3);

    let updates = statements(&session, "UPDATE");
    assert_eq!(
        updates,
        vec![
            "UPDATE departments SET code = $1 WHERE code = $2",
            "UPDATE employees SET department_code = $1 WHERE id = $2",
            "UPDATE employees SET department_code = $1 WHERE id = $2",
        ]
    );
    session.commit().unwrap();
    assert_eq!(
        db.find("employees", &[("department_code", Value::from("eng"))])
            .unwrap()
            .len(),
        2
    );
    let moved = session.get(&key(&session, "Department", "eng")).unwrap().unwrap();
    assert!(moved.ptr_eq(&dept));
}

#[test]
fn passive_key_change_rewrites_loaded_children_in_memory() {
    let registry = departments(true);
    let (db, mut session) = open(&registry, MemoryOptions::default());
    let dept = Entity::new(&registry, "Department")
        .unwrap()
        .with("code", "ops")
        .unwrap();
    let kim = Entity::new(&registry, "Employee").unwrap().with("name", "kim").unwrap();
    dept.append("staff", &kim).unwrap();
    session.add(&dept).unwrap();
    session.flush().unwrap();

    dept.set("code", "eng").unwrap();
    session.flush().unwrap();
    assert_eq!(statements(&session, "UPDATE").len(), 1);
    assert_eq!(kim.peek("department_code").unwrap().ready(), Some(Value::from("eng")));
    assert!(!kim.is_modified());

    session.commit().unwrap();
    let rows = db.find("employees", &[("name", Value::from("kim"))]).unwrap();
    assert_eq!(rows[0].get_by_name("department_code"), Some(&Value::from("eng")));
}

#[test]
fn clearing_many_to_one_nulls_the_foreign_key() {
    let registry = departments(false);
    let (db, mut session) = open(&registry, MemoryOptions::default());
    db.seed("departments", &[("code", Value::from("ops"))]).unwrap();
    db.seed(
        "employees",
        &[
            ("id", Value::BigInt(1)),
            ("name", Value::from("kim")),
            ("department_code", Value::from("ops")),
        ],
    )
    .unwrap();

    let kim = session.get(&key(&session, "Employee", 1_i64)).unwrap().unwrap();
    kim.set_related("department", None).unwrap();
    assert!(kim.is_modified());
    let result = session.flush().unwrap();
    assert_eq!(result.updated, 1);
    session.commit().unwrap();

    let rows = db.find("employees", &[("id", Value::BigInt(1))]).unwrap();
    assert_eq!(rows[0].get_by_name("department_code"), Some(&Value::Null));
}

#[test]
fn clearing_owned_many_to_one_deletes_the_orphan() {
    let registry = shop();
    let (db, mut session) = open(&registry, MemoryOptions::default());
    db.seed("customers", &[("id", Value::BigInt(1)), ("name", Value::from("ann"))])
        .unwrap();
    db.seed(
        "orders",
        &[
            ("id", Value::BigInt(5)),
            ("total", Value::BigInt(10)),
            ("customer_id", Value::BigInt(1)),
        ],
    )
    .unwrap();

    let item = session.get(&key(&session, "Order", 5_i64)).unwrap().unwrap();
    item.set_related("customer", None).unwrap();
    session.commit().unwrap();

    assert_eq!(statements(&session, "DELETE FROM orders").len(), 1);
    assert_eq!(item.state(), EntityState::Detached);
    assert_eq!(db.row_count("orders").unwrap(), 0);
    assert_eq!(db.row_count("customers").unwrap(), 1);
}
