#![allow(dead_code)]

use contentmap_core::{
    AggregationKind, DataType, EntityType, LockOwner, ManyToManyDef, MapperSettings, ObjectId,
    OneToManyDef, PersistenceFacade, Schema,
};
use std::path::Path;

/// Library schema: books with nested chapters, authors, publishers and
/// images reachable from chapters through two distinct roles.
pub fn library_schema() -> Schema {
    Schema::builder()
        .entity(
            EntityType::new("Publisher")
                .primary_key("id", DataType::Integer)
                .attribute("name", DataType::Text)
                .sortkey("name"),
        )
        .entity(
            EntityType::new("Author")
                .primary_key("id", DataType::Integer)
                .attribute("name", DataType::Text)
                .sortkey("name"),
        )
        .entity(
            EntityType::new("NMPublisherAuthor")
                .primary_key("id", DataType::Integer)
                .attribute("fk_publisher_id", DataType::Integer)
                .attribute("fk_author_id", DataType::Integer)
                .attribute("sortkey_author", DataType::Integer)
                .attribute("sortkey_publisher", DataType::Integer),
        )
        .entity(
            EntityType::new("Book")
                .primary_key("id", DataType::Integer)
                .attribute("title", DataType::Text)
                .attribute("published", DataType::Integer)
                .sortkey("title"),
        )
        .entity(
            EntityType::new("Chapter")
                .primary_key("id", DataType::Integer)
                .attribute("name", DataType::Text)
                .attribute("sortkey", DataType::Integer)
                .attribute("fk_chapter_id", DataType::Integer)
                .attribute("fk_book_id", DataType::Integer)
                .attribute("fk_author_id", DataType::Integer)
                .reference("author_name", "Author", "name")
                .sortkey("sortkey")
                .version("version"),
        )
        .entity(
            EntityType::new("Image")
                .primary_key("id", DataType::Integer)
                .attribute("filename", DataType::Text)
                .attribute("fk_chapter_id", DataType::Integer)
                .attribute("fk_titlechapter_id", DataType::Integer),
        )
        .entity(
            EntityType::new("NewsItem")
                .primary_key("id", DataType::Integer)
                .attribute("title", DataType::Text)
                .attribute("created", DataType::Integer),
        )
        .entity(
            EntityType::new("EventItem")
                .primary_key("id", DataType::Integer)
                .attribute("title", DataType::Text)
                .attribute("created", DataType::Integer),
        )
        .one_to_many(
            OneToManyDef::new("Book", "Book", "Chapter", "Chapter", "fk_book_id")
                .aggregation(AggregationKind::Composite),
        )
        .one_to_many(
            OneToManyDef::new(
                "Chapter",
                "ParentChapter",
                "Chapter",
                "SubChapter",
                "fk_chapter_id",
            )
            .aggregation(AggregationKind::Composite),
        )
        .one_to_many(OneToManyDef::new(
            "Author",
            "Author",
            "Chapter",
            "Chapter",
            "fk_author_id",
        ))
        .one_to_many(OneToManyDef::new(
            "Chapter",
            "NormalChapter",
            "Image",
            "NormalImage",
            "fk_chapter_id",
        ))
        .one_to_many(OneToManyDef::new(
            "Chapter",
            "TitleChapter",
            "Image",
            "TitleImage",
            "fk_titlechapter_id",
        ))
        .many_to_many(ManyToManyDef::new(
            "Publisher",
            "Publisher",
            "Author",
            "Author",
            "NMPublisherAuthor",
            "fk_publisher_id",
            "fk_author_id",
        ))
        .build()
        .unwrap()
}

/// In-memory facade with every table created and no rows.
pub fn empty_facade() -> PersistenceFacade {
    let facade = PersistenceFacade::open_in_memory(library_schema()).unwrap();
    facade.ensure_schema().unwrap();
    facade
}

/// In-memory facade seeded with a small library.
///
/// - Book 1 "Rust" owns chapters 1, 2 and 3; chapter 3 is a subchapter of 2.
/// - Book 2 "SQL" owns chapter 4.
/// - Chapter 1 has a normal image (1) and a title image (2).
/// - Publisher 1 publishes author 1.
pub fn library_facade() -> PersistenceFacade {
    seed(empty_facade())
}

/// File-backed variant of [`library_facade`], for tests that need a second
/// connection to the same database.
pub fn library_facade_at(path: &Path) -> PersistenceFacade {
    let facade =
        PersistenceFacade::open(path, library_schema(), MapperSettings::default()).unwrap();
    facade.ensure_schema().unwrap();
    seed(facade)
}

fn seed(facade: PersistenceFacade) -> PersistenceFacade {
    facade
        .connection()
        .execute_batch(
            "INSERT INTO Book (id, title, published) VALUES (1, 'Rust', 2021), (2, 'SQL', 2019);
             INSERT INTO Author (id, name) VALUES (1, 'Ann'), (2, 'Bob');
             INSERT INTO Publisher (id, name) VALUES (1, 'Acme');
             INSERT INTO NMPublisherAuthor (id, fk_publisher_id, fk_author_id, sortkey_author, sortkey_publisher)
                 VALUES (1, 1, 1, 1, 1);
             INSERT INTO Chapter (id, name, sortkey, fk_chapter_id, fk_book_id, fk_author_id, version) VALUES
                 (1, 'Intro', 1, NULL, 1, 1, 1),
                 (2, 'Basics', 2, NULL, 1, 2, 1),
                 (3, 'Details', 3, 2, 1, 1, 1),
                 (4, 'Joins', 1, NULL, 2, 2, 1);
             INSERT INTO Image (id, filename, fk_chapter_id, fk_titlechapter_id) VALUES
                 (1, 'intro.png', 1, NULL),
                 (2, 'cover.png', NULL, 1);",
        )
        .unwrap();
    facade
}

pub fn ann() -> LockOwner {
    LockOwner::new("ann", "session-a")
}

pub fn bob() -> LockOwner {
    LockOwner::new("bob", "session-b")
}

pub fn oid(type_name: &str, id: i64) -> ObjectId {
    ObjectId::from_int(type_name, id).unwrap()
}

pub fn count_rows(facade: &PersistenceFacade, table: &str) -> i64 {
    facade
        .connection()
        .query_row(&format!("SELECT COUNT(*) FROM `{table}`"), [], |row| {
            row.get(0)
        })
        .unwrap()
}
