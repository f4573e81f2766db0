//! Shared mappings for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use sessionkit::{
    Cascade, ColumnDef, Entity, IdentityKey, Mapper, MemoryConnection, MemoryDatabase,
    MemoryOptions, ReferentialAction, Registry, Relationship, Session, Value,
};

/// Customers own their orders through a delete-orphan collection.
pub fn shop() -> Arc<Registry> {
    Registry::builder()
        .mapper(
            Mapper::new("Customer", "customers")
                .column(
                    ColumnDef::new("id")
                        .primary_key(true)
                        .autoincrement(true)
                        .sequence("customers_id_seq"),
                )
                .column(ColumnDef::new("name"))
                .column(ColumnDef::new("email"))
                .relationship(
                    Relationship::one_to_many("orders", "Order")
                        .cascade(Cascade::parse("all, delete-orphan").unwrap())
                        .back_populates("customer"),
                ),
        )
        .mapper(
            Mapper::new("Order", "orders")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("total"))
                .column(
                    ColumnDef::new("customer_id")
                        .foreign_key("customers.id")
                        .nullable(false),
                )
                .relationship(
                    Relationship::many_to_one("customer", "Customer").back_populates("orders"),
                ),
        )
        .build()
        .unwrap()
}

/// Departments keyed by their code; employees follow the code.
pub fn departments(passive_updates: bool) -> Arc<Registry> {
    let on_update = if passive_updates {
        ReferentialAction::Cascade
    } else {
        ReferentialAction::NoAction
    };
    Registry::builder()
        .mapper(
            Mapper::new("Department", "departments")
                .column(ColumnDef::new("code").primary_key(true))
                .column(ColumnDef::new("title"))
                .relationship(
                    Relationship::one_to_many("staff", "Employee")
                        .passive_updates(passive_updates)
                        .back_populates("department"),
                ),
        )
        .mapper(
            Mapper::new("Employee", "employees")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("name"))
                .column(
                    ColumnDef::new("department_code")
                        .foreign_key("departments.code")
                        .on_update(on_update),
                )
                .relationship(
                    Relationship::many_to_one("department", "Department").back_populates("staff"),
                ),
        )
        .build()
        .unwrap()
}

pub fn open(
    registry: &Arc<Registry>,
    options: MemoryOptions,
) -> (MemoryDatabase, Session<MemoryConnection>) {
    sessionkit::memory_session(registry, options)
}

pub fn customer(registry: &Arc<Registry>, name: &str) -> Entity {
    Entity::new(registry, "Customer")
        .unwrap()
        .with("name", name)
        .unwrap()
        .with("email", format!("{name}@example.com"))
        .unwrap()
}

pub fn order(registry: &Arc<Registry>, total: i64) -> Entity {
    Entity::new(registry, "Order").unwrap().with("total", total).unwrap()
}

pub fn key(session: &Session<MemoryConnection>, mapper: &str, pk: impl Into<Value>) -> IdentityKey {
    session.identity_key_for(mapper, vec![pk.into()]).unwrap()
}

/// Statements of one verb, in issue order.
pub fn statements(session: &Session<MemoryConnection>, verb: &str) -> Vec<String> {
    session.connection().log().matching(verb)
}
