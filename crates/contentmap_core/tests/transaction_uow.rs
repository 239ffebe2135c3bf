mod common;

use common::{ann, bob, count_rows, library_facade, oid};
use contentmap_core::{
    Action, Authorizer, BuildDepth, Criteria, Localization, LockOwner, LockType, ObjectState,
    PagingInfo, PersistenceError, PersistenceResult, PersistentObject, Resource, TransactionState,
    Value,
};
use std::cell::RefCell;

fn chapter_name(facade: &contentmap_core::PersistenceFacade, id: i64) -> Option<String> {
    facade
        .connection()
        .query_row("SELECT name FROM Chapter WHERE id = ?1", [id], |row| row.get(0))
        .unwrap()
}

fn column_i64(facade: &contentmap_core::PersistenceFacade, sql: &str) -> Option<i64> {
    facade
        .connection()
        .query_row(sql, [], |row| row.get(0))
        .unwrap()
}

#[test]
fn each_object_has_one_instance_per_transaction() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();

    let first = tx.load(&oid("Chapter", 1), BuildDepth::Single).unwrap().unwrap();
    tx.set_value(first, "name", "Preface").unwrap();
    let second = tx.load(&oid("Chapter", 1), BuildDepth::Single).unwrap().unwrap();
    assert_eq!(first, second);

    let all = tx
        .load_objects("Chapter", &[], None, None, BuildDepth::Single)
        .unwrap();
    assert_eq!(all.len(), 4);
    assert!(all.contains(&first));
    assert_eq!(tx.cached_count(), 4);
    assert_eq!(
        tx.object(first).unwrap().get_str("name").unwrap(),
        Some("Preface")
    );
    assert_eq!(tx.object(first).unwrap().state(), ObjectState::Dirty);
}

#[test]
fn missing_objects_load_as_none() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    assert!(tx.load(&oid("Chapter", 99), BuildDepth::Single).unwrap().is_none());

    let handle = tx.load(&oid("Chapter", 4), BuildDepth::Single).unwrap().unwrap();
    tx.delete(handle).unwrap();
    assert!(tx.load(&oid("Chapter", 4), BuildDepth::Single).unwrap().is_none());
}

#[test]
fn build_depth_controls_how_far_relations_load() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();

    let chapter = tx.load(&oid("Chapter", 3), BuildDepth::Single).unwrap().unwrap();
    let object = tx.object(chapter).unwrap();
    assert_eq!(object.related("Book"), [oid("Book", 1)]);
    assert_eq!(object.related("ParentChapter"), [oid("Chapter", 2)]);
    assert!(object.related("SubChapter").is_empty());
    assert!(tx.find(&oid("Book", 1)).is_none());

    let book = tx.load(&oid("Book", 1), BuildDepth::Levels(1)).unwrap().unwrap();
    assert_eq!(
        tx.object(book).unwrap().related("Chapter"),
        [oid("Chapter", 1), oid("Chapter", 2), oid("Chapter", 3)]
    );
    assert!(tx.find(&oid("Chapter", 2)).is_some());
    assert!(tx.find(&oid("Image", 1)).is_none());

    tx.rollback().unwrap();
    tx.begin().unwrap();
    let publisher = tx
        .load(&oid("Publisher", 1), BuildDepth::Infinite)
        .unwrap()
        .unwrap();
    assert_eq!(tx.object(publisher).unwrap().related("Author"), [oid("Author", 1)]);
    let author = tx.find(&oid("Author", 1)).unwrap();
    assert_eq!(tx.object(author).unwrap().related("Publisher"), [oid("Publisher", 1)]);
    assert_eq!(
        tx.object(author).unwrap().related("Chapter"),
        [oid("Chapter", 1), oid("Chapter", 3)]
    );
    assert!(tx.find(&oid("Image", 2)).is_some());
}

#[test]
fn commit_inserts_parents_before_children() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();

    let chapter = tx.create("Chapter").unwrap();
    tx.set_value(chapter, "name", "Preface").unwrap();
    let book = tx.create("Book").unwrap();
    tx.set_value(book, "title", "Go").unwrap();
    tx.add_node(book, chapter, None).unwrap();
    let dummy_book = tx.object(book).unwrap().oid().clone();
    assert!(dummy_book.is_dummy());

    let summary = tx.commit().unwrap();
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.id_map[&dummy_book], oid("Book", 3));
    assert_eq!(tx.state(), TransactionState::Committed);

    let chapter_object = tx.object(chapter).unwrap();
    assert_eq!(chapter_object.oid(), &oid("Chapter", 5));
    assert_eq!(chapter_object.related("Book"), [oid("Book", 3)]);
    assert_eq!(chapter_object.get_i64("version").unwrap(), Some(1));
    assert_eq!(chapter_object.state(), ObjectState::Clean);
    assert_eq!(
        column_i64(&facade, "SELECT fk_book_id FROM Chapter WHERE id = 5"),
        Some(3)
    );
}

#[test]
fn commit_updates_dirty_objects_and_bumps_the_version() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let chapter = tx.load(&oid("Chapter", 1), BuildDepth::Single).unwrap().unwrap();
    tx.set_value(chapter, "name", "Preface").unwrap();
    let untouched = tx.load(&oid("Chapter", 2), BuildDepth::Single).unwrap().unwrap();
    tx.set_value(untouched, "name", "Basics").unwrap();

    let summary = tx.commit().unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(chapter_name(&facade, 1).as_deref(), Some("Preface"));
    assert_eq!(
        column_i64(&facade, "SELECT version FROM Chapter WHERE id = 1"),
        Some(2)
    );
    assert_eq!(tx.object(chapter).unwrap().get_i64("version").unwrap(), Some(2));
    assert!(matches!(
        tx.commit().unwrap_err(),
        PersistenceError::InvalidTransactionState { .. }
    ));
}

#[test]
fn rollback_leaves_storage_untouched() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let book = tx.create("Book").unwrap();
    tx.set_value(book, "title", "Draft").unwrap();
    let chapter = tx.load(&oid("Chapter", 1), BuildDepth::Single).unwrap().unwrap();
    tx.set_value(chapter, "name", "Changed").unwrap();
    let doomed = tx.load(&oid("Chapter", 4), BuildDepth::Single).unwrap().unwrap();
    tx.delete(doomed).unwrap();

    tx.rollback().unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(count_rows(&facade, "Book"), 2);
    assert_eq!(count_rows(&facade, "Chapter"), 4);
    assert_eq!(chapter_name(&facade, 1).as_deref(), Some("Intro"));
    assert!(matches!(
        tx.create("Book").unwrap_err(),
        PersistenceError::InvalidTransactionState { .. }
    ));

    tx.begin().unwrap();
    assert_eq!(tx.cached_count(), 0);
    assert!(tx.object(chapter).is_err());
}

#[test]
fn composite_delete_cascades_and_detaches_other_children() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let book = tx.load(&oid("Book", 1), BuildDepth::Single).unwrap().unwrap();
    tx.delete(book).unwrap();

    let summary = tx.commit().unwrap();
    assert_eq!(summary.deleted, 4);
    for id in 1..=3 {
        assert!(summary.deleted_oids.contains(&oid("Chapter", id)));
    }
    assert!(tx.find(&oid("Book", 1)).is_none());
    assert_eq!(count_rows(&facade, "Chapter"), 1);
    assert_eq!(count_rows(&facade, "Image"), 2);
    assert_eq!(
        column_i64(
            &facade,
            "SELECT COUNT(*) FROM Image WHERE fk_chapter_id IS NOT NULL OR fk_titlechapter_id IS NOT NULL"
        ),
        Some(0)
    );
}

#[test]
fn deleting_one_side_of_many_to_many_removes_junction_rows() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let author = tx.load(&oid("Author", 1), BuildDepth::Single).unwrap().unwrap();
    tx.delete(author).unwrap();
    tx.commit().unwrap();

    assert_eq!(count_rows(&facade, "NMPublisherAuthor"), 0);
    assert_eq!(count_rows(&facade, "Publisher"), 1);
    assert_eq!(
        column_i64(&facade, "SELECT COUNT(*) FROM Chapter WHERE fk_author_id IS NULL"),
        Some(2)
    );
}

#[test]
fn many_to_many_association_is_idempotent() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let publisher = tx.load(&oid("Publisher", 1), BuildDepth::Single).unwrap().unwrap();
    let ann_author = tx.load(&oid("Author", 1), BuildDepth::Single).unwrap().unwrap();
    let bob_author = tx.load(&oid("Author", 2), BuildDepth::Single).unwrap().unwrap();

    tx.add_node(publisher, ann_author, None).unwrap();
    tx.add_node(publisher, bob_author, None).unwrap();
    tx.add_node(bob_author, publisher, None).unwrap();
    assert_eq!(
        tx.object(bob_author).unwrap().related("Publisher"),
        [oid("Publisher", 1)]
    );

    let summary = tx.commit().unwrap();
    assert_eq!(summary.linked, 1);
    assert_eq!(count_rows(&facade, "NMPublisherAuthor"), 2);

    tx.begin().unwrap();
    let publisher = tx.load(&oid("Publisher", 1), BuildDepth::Levels(1)).unwrap().unwrap();
    assert_eq!(
        tx.object(publisher).unwrap().related("Author"),
        [oid("Author", 1), oid("Author", 2)]
    );
    let bob_author = tx.find(&oid("Author", 2)).unwrap();
    tx.delete_node(publisher, bob_author, None).unwrap();
    let summary = tx.commit().unwrap();
    assert_eq!(summary.unlinked, 1);
    assert_eq!(count_rows(&facade, "NMPublisherAuthor"), 1);
}

#[test]
fn new_objects_can_be_associated_before_they_have_ids() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let publisher = tx.create("Publisher").unwrap();
    tx.set_value(publisher, "name", "Nova").unwrap();
    let author = tx.load(&oid("Author", 2), BuildDepth::Single).unwrap().unwrap();
    tx.add_node(publisher, author, None).unwrap();

    let summary = tx.commit().unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(summary.linked, 1);
    assert_eq!(
        column_i64(
            &facade,
            "SELECT fk_author_id FROM NMPublisherAuthor WHERE fk_publisher_id = 2"
        ),
        Some(2)
    );
}

#[test]
fn removing_a_one_to_many_node_clears_the_foreign_key() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let parent = tx.load(&oid("Chapter", 2), BuildDepth::Levels(1)).unwrap().unwrap();
    let child = tx.find(&oid("Chapter", 3)).unwrap();
    assert_eq!(tx.object(parent).unwrap().related("SubChapter"), [oid("Chapter", 3)]);

    tx.delete_node(parent, child, Some("SubChapter")).unwrap();
    assert!(tx.object(parent).unwrap().related("SubChapter").is_empty());
    tx.commit().unwrap();
    assert_eq!(
        column_i64(&facade, "SELECT fk_chapter_id FROM Chapter WHERE id = 3"),
        None
    );
}

#[test]
fn unsaved_objects_referencing_each_other_fail_to_commit() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let first = tx.create("Chapter").unwrap();
    let second = tx.create("Chapter").unwrap();
    tx.add_node(first, second, Some("SubChapter")).unwrap();
    tx.add_node(second, first, Some("SubChapter")).unwrap();

    let err = tx.commit().unwrap_err();
    assert!(matches!(err, PersistenceError::InvalidData(_)));
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(count_rows(&facade, "Chapter"), 4);
}

#[test]
fn detached_objects_are_tracked_again_after_save() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let handle = tx.load(&oid("Chapter", 4), BuildDepth::Single).unwrap().unwrap();
    let mut detached = tx.detach(handle).unwrap();
    assert!(tx.find(&oid("Chapter", 4)).is_none());

    detached.set_value("name", "Joins and Unions").unwrap();
    tx.save(detached).unwrap();
    tx.commit().unwrap();
    assert_eq!(chapter_name(&facade, 4).as_deref(), Some("Joins and Unions"));
}

#[test]
fn detached_objects_write_their_updated_foreign_keys() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let handle = tx.load(&oid("Chapter", 4), BuildDepth::Single).unwrap().unwrap();
    assert_eq!(tx.object(handle).unwrap().related("Book"), [oid("Book", 2)]);
    let mut detached = tx.detach(handle).unwrap();

    detached.set_value("fk_book_id", 1_i64).unwrap();
    assert_eq!(detached.related("Book"), [oid("Book", 1)]);
    tx.save(detached).unwrap();
    tx.commit().unwrap();
    assert_eq!(
        column_i64(&facade, "SELECT fk_book_id FROM Chapter WHERE id = 4"),
        Some(1)
    );
}

#[test]
fn deleting_an_unsaved_parent_releases_its_children() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let book = tx.create("Book").unwrap();
    let chapter = tx.create("Chapter").unwrap();
    tx.set_value(chapter, "name", "Orphan").unwrap();
    tx.add_node(book, chapter, None).unwrap();
    assert_eq!(tx.object(chapter).unwrap().related("Book").len(), 1);

    tx.delete(book).unwrap();
    assert!(tx.object(chapter).unwrap().related("Book").is_empty());

    let summary = tx.commit().unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(count_rows(&facade, "Book"), 2);
    assert_eq!(
        column_i64(&facade, "SELECT fk_book_id FROM Chapter WHERE name = 'Orphan'"),
        None
    );
}

#[test]
fn load_objects_filters_and_pages() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let mut paging = PagingInfo::new(2, 1).unwrap();
    let handles = tx
        .load_objects(
            "Chapter",
            &[Criteria::as_value("Chapter", "fk_book_id", 1_i64)],
            None,
            Some(&mut paging),
            BuildDepth::Single,
        )
        .unwrap();

    let ids: Vec<_> = handles
        .iter()
        .map(|handle| tx.object(*handle).unwrap().oid().clone())
        .collect();
    assert_eq!(ids, [oid("Chapter", 1), oid("Chapter", 2)]);
    assert_eq!(paging.total_count(), 3);
    assert_eq!(paging.page_count(), 2);
}

#[test]
fn redirected_transactions_write_to_prefixed_tables() {
    let facade = library_facade();
    let registry = facade.registry().with_table_prefix("Chapter", "draft_");
    facade
        .connection()
        .execute(&registry.mapper("Chapter").unwrap().create_table_sql(), [])
        .unwrap();

    let mut tx = facade.redirected_transaction(ann(), "Chapter", "draft_");
    tx.begin().unwrap();
    let chapter = tx.create("Chapter").unwrap();
    tx.set_value(chapter, "name", "Sketch").unwrap();
    let summary = tx.commit().unwrap();

    assert_eq!(summary.inserted, 1);
    assert_eq!(count_rows(&facade, "draft_Chapter"), 1);
    assert_eq!(count_rows(&facade, "Chapter"), 4);
}

#[test]
fn queries_read_the_tables_of_a_redirected_transaction() {
    let facade = library_facade();
    let registry = facade.registry().with_table_prefix("Chapter", "draft_");
    facade
        .connection()
        .execute(&registry.mapper("Chapter").unwrap().create_table_sql(), [])
        .unwrap();
    let object_query = facade.object_query("Chapter").unwrap();
    let mut string_query = facade.string_query("Chapter").unwrap();

    let mut tx = facade.redirected_transaction(ann(), "Chapter", "draft_");
    tx.begin().unwrap();
    assert!(object_query
        .execute(&mut tx, BuildDepth::Single, None, None)
        .unwrap()
        .is_empty());
    let chapter = tx.create("Chapter").unwrap();
    tx.set_value(chapter, "name", "Sketch").unwrap();
    tx.commit().unwrap();

    tx.begin().unwrap();
    let found = object_query
        .execute(&mut tx, BuildDepth::Single, None, None)
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(
        tx.object(found[0]).unwrap().get_str("name").unwrap(),
        Some("Sketch")
    );

    string_query.set_condition("name = 'Sketch'").unwrap();
    assert_eq!(
        string_query
            .execute(&mut tx, BuildDepth::Single, None, None)
            .unwrap(),
        found
    );
    string_query.set_condition("name = 'Intro'").unwrap();
    assert!(string_query
        .execute(&mut tx, BuildDepth::Single, None, None)
        .unwrap()
        .is_empty());
}

struct NoChapterWrites {
    hidden: Value,
}

impl Authorizer for NoChapterWrites {
    fn authorize(&self, resource: &Resource, _identity: &LockOwner, action: Action) -> bool {
        match resource {
            Resource::Object(oid) if oid.type_name() == "Chapter" => action == Action::Read,
            Resource::Object(oid) if oid.type_name() == "Image" => {
                oid.first_id().to_value() != self.hidden
            }
            _ => true,
        }
    }
}

#[test]
fn authorization_guards_reads_and_commits() {
    let facade = library_facade().with_authorizer(NoChapterWrites {
        hidden: Value::Integer(2),
    });
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();

    let chapter = tx.load(&oid("Chapter", 1), BuildDepth::Levels(1)).unwrap().unwrap();
    assert_eq!(tx.object(chapter).unwrap().related("NormalImage"), [oid("Image", 1)]);
    assert!(tx.object(chapter).unwrap().related("TitleImage").is_empty());
    assert!(matches!(
        tx.load(&oid("Image", 2), BuildDepth::Single).unwrap_err(),
        PersistenceError::AuthorizationDenied { action: Action::Read, .. }
    ));

    tx.set_value(chapter, "name", "Forbidden").unwrap();
    let err = tx.commit().unwrap_err();
    assert!(matches!(
        err,
        PersistenceError::AuthorizationDenied {
            action: Action::Update,
            ..
        }
    ));
    assert_eq!(chapter_name(&facade, 1).as_deref(), Some("Intro"));
}

#[derive(Default)]
struct German {
    saved: RefCell<Vec<String>>,
}

impl Localization for German {
    fn load_translation(
        &self,
        object: &mut PersistentObject,
        language: &str,
    ) -> PersistenceResult<()> {
        if language == "de" && object.type_name() == "Chapter" {
            object.translate_value("name", "Einleitung")?;
        }
        Ok(())
    }

    fn save_translation(&self, object: &PersistentObject, language: &str) -> PersistenceResult<()> {
        let name = object.get_str("name")?.unwrap_or_default();
        self.saved
            .borrow_mut()
            .push(format!("{} {language} {name}", object.oid()));
        Ok(())
    }
}

#[test]
fn translated_copies_leave_the_cached_object_alone() {
    let facade = library_facade();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let chapter = tx.load(&oid("Chapter", 1), BuildDepth::Single).unwrap().unwrap();

    let translated = tx.load_translated(chapter, &German::default(), "de").unwrap();
    assert_eq!(translated.get_str("name").unwrap(), Some("Einleitung"));
    assert_eq!(translated.state(), ObjectState::Clean);
    assert_eq!(tx.object(chapter).unwrap().get_str("name").unwrap(), Some("Intro"));
}

#[test]
fn translated_copies_are_stored_through_the_localization() {
    let facade = library_facade();
    let german = German::default();
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let chapter = tx.load(&oid("Chapter", 1), BuildDepth::Single).unwrap().unwrap();
    let translated = tx.load_translated(chapter, &german, "de").unwrap();

    tx.save_translated(&translated, &german, "de").unwrap();
    assert_eq!(*german.saved.borrow(), ["Chapter:1 de Einleitung"]);
    assert_eq!(tx.object(chapter).unwrap().state(), ObjectState::Clean);

    let unsaved = tx.create("Chapter").unwrap();
    let copy = tx.object(unsaved).unwrap().clone();
    assert!(matches!(
        tx.save_translated(&copy, &german, "de").unwrap_err(),
        PersistenceError::InvalidData(_)
    ));

    let mut other = facade.transaction(bob());
    other.begin().unwrap();
    other
        .acquire_lock(&oid("Chapter", 1), LockType::Pessimistic)
        .unwrap();
    assert!(matches!(
        tx.save_translated(&translated, &german, "de").unwrap_err(),
        PersistenceError::PessimisticLockConflict { .. }
    ));
    assert_eq!(german.saved.borrow().len(), 1);
}
