//! Mapping fixtures shared by the unit tests.

use std::sync::Arc;

use sessionkit_core::{
    AssociationTable, Cascade, ColumnDef, Mapper, ReferentialAction, Registry, Relationship,
};

/// `Parent` owns `Child` rows through a delete-orphan collection.
pub(crate) fn family() -> Arc<Registry> {
    Registry::builder()
        .mapper(
            Mapper::new("Parent", "parents")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("name"))
                .relationship(
                    Relationship::one_to_many("children", "Child")
                        .cascade(Cascade::ALL | Cascade::DELETE_ORPHAN)
                        .back_populates("parent"),
                ),
        )
        .mapper(
            Mapper::new("Child", "children")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("name"))
                .column(ColumnDef::new("parent_id").foreign_key("parents.id"))
                .relationship(
                    Relationship::many_to_one("parent", "Parent").back_populates("children"),
                ),
        )
        .build()
        .unwrap()
}

/// Self-referential tree.
pub(crate) fn graph() -> Arc<Registry> {
    Registry::builder()
        .mapper(
            Mapper::new("Node", "nodes")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("name"))
                .column(ColumnDef::new("parent_id").foreign_key("nodes.id"))
                .relationship(
                    Relationship::one_to_many("children", "Node")
                        .cascade(Cascade::ALL)
                        .back_populates("parent"),
                )
                .relationship(
                    Relationship::many_to_one("parent", "Node").back_populates("children"),
                ),
        )
        .build()
        .unwrap()
}

/// Posts and tags joined through `post_tags`.
pub(crate) fn blog() -> Arc<Registry> {
    Registry::builder()
        .mapper(
            Mapper::new("Post", "posts")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("title"))
                .relationship(
                    Relationship::many_to_many(
                        "tags",
                        "Tag",
                        AssociationTable::new("post_tags", &["post_id"], &["tag_id"]),
                    )
                    .back_populates("posts"),
                ),
        )
        .mapper(
            Mapper::new("Tag", "tags")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("label"))
                .relationship(
                    Relationship::many_to_many(
                        "posts",
                        "Post",
                        AssociationTable::new("post_tags", &["tag_id"], &["post_id"]),
                    )
                    .back_populates("tags"),
                ),
        )
        .build()
        .unwrap()
}

/// `Owner` keyed by its name; `Pet.owner_name` follows it.
pub(crate) fn natural(passive_updates: bool) -> Arc<Registry> {
    let on_update = if passive_updates {
        ReferentialAction::Cascade
    } else {
        ReferentialAction::NoAction
    };
    Registry::builder()
        .mapper(
            Mapper::new("Owner", "owners")
                .column(ColumnDef::new("name").primary_key(true))
                .column(ColumnDef::new("city"))
                .relationship(
                    Relationship::one_to_many("pets", "Pet")
                        .passive_updates(passive_updates)
                        .back_populates("owner"),
                ),
        )
        .mapper(
            Mapper::new("Pet", "pets")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("name"))
                .column(
                    ColumnDef::new("owner_name")
                        .foreign_key("owners.name")
                        .on_update(on_update),
                )
                .relationship(Relationship::many_to_one("owner", "Owner").back_populates("pets")),
        )
        .build()
        .unwrap()
}

/// Authors and books referencing each other. With `post_update` the
/// author's favorite is written after both rows exist; without it both
/// foreign keys are NOT NULL and the cycle cannot be broken.
pub(crate) fn cyclic_registry(post_update: bool) -> Arc<Registry> {
    Registry::builder()
        .mapper(
            Mapper::new("Author", "authors")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("name"))
                .column(
                    ColumnDef::new("favorite_book_id")
                        .foreign_key("books.id")
                        .nullable(post_update),
                )
                .relationship(Relationship::many_to_one("favorite", "Book").post_update(post_update)),
        )
        .mapper(
            Mapper::new("Book", "books")
                .column(ColumnDef::new("id").primary_key(true).autoincrement(true))
                .column(ColumnDef::new("title"))
                .column(
                    ColumnDef::new("author_id")
                        .foreign_key("authors.id")
                        .nullable(false),
                )
                .relationship(Relationship::many_to_one("author", "Author")),
        )
        .build()
        .unwrap()
}
