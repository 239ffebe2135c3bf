mod common;

use common::{ann, library_facade};
use contentmap_core::{BuildDepth, OrderTerm, PersistenceError, PersistenceFacade, StringQuery};

fn run(facade: &PersistenceFacade, query: &StringQuery) -> Vec<String> {
    let mut tx = facade.transaction(ann());
    tx.begin().unwrap();
    let order = [OrderTerm::asc("id")];
    let found = query
        .execute(&mut tx, BuildDepth::Single, Some(&order[..]), None)
        .unwrap();
    found
        .iter()
        .map(|handle| tx.object(*handle).unwrap().oid().to_string())
        .collect()
}

fn chapters(facade: &PersistenceFacade, condition: &str) -> Vec<String> {
    let mut query = facade.string_query("Chapter").unwrap();
    query.set_condition(condition).unwrap();
    run(facade, &query)
}

#[test]
fn unqualified_conditions_address_the_root_table() {
    let facade = library_facade();
    let mut query = facade.string_query("Chapter").unwrap();
    query.set_condition("name = 'Intro' OR sortkey > 2").unwrap();

    let statement = query.build(None).unwrap().to_statement();
    assert!(statement
        .sql
        .contains("WHERE `Chapter`.`name` = ? OR `Chapter`.`sortkey` > ?"));
    assert!(!statement.sql.contains("Intro"));
    assert_eq!(run(&facade, &query), ["Chapter:1", "Chapter:3"]);
}

#[test]
fn and_binds_tighter_than_or() {
    let facade = library_facade();
    assert_eq!(
        chapters(&facade, "fk_book_id = 2 OR name = 'Intro' AND sortkey = 2"),
        ["Chapter:4"]
    );
    assert_eq!(
        chapters(&facade, "(fk_book_id = 2 OR name = 'Intro') AND sortkey = 1"),
        ["Chapter:1", "Chapter:4"]
    );
}

#[test]
fn null_checks_membership_and_negation() {
    let facade = library_facade();
    assert_eq!(
        chapters(&facade, "fk_chapter_id IS NULL AND fk_book_id = 1"),
        ["Chapter:1", "Chapter:2"]
    );
    assert_eq!(chapters(&facade, "id IN (1, 4)"), ["Chapter:1", "Chapter:4"]);
    assert_eq!(chapters(&facade, "NOT (fk_book_id = 1)"), ["Chapter:4"]);
    assert_eq!(chapters(&facade, "`Chapter`.`name` LIKE 'B%'"), ["Chapter:2"]);
}

#[test]
fn role_qualifiers_join_through_the_role() {
    let facade = library_facade();
    let mut query = facade.string_query("Chapter").unwrap();
    query.set_condition("SubChapter.name = 'Details'").unwrap();
    let statement = query.build(None).unwrap().to_statement();
    assert!(statement.sql.starts_with("SELECT DISTINCT "));
    assert!(statement.sql.contains("INNER JOIN `Chapter` AS `SubChapter`"));
    assert_eq!(run(&facade, &query), ["Chapter:2"]);

    assert_eq!(chapters(&facade, "ParentChapter.name = 'Basics'"), ["Chapter:3"]);
    assert_eq!(
        chapters(&facade, "Book.title = 'SQL' OR Author.name = 'Ann'"),
        ["Chapter:1", "Chapter:3", "Chapter:4"]
    );
}

#[test]
fn ambiguous_type_qualifier_is_rejected() {
    let facade = library_facade();
    let mut query = facade.string_query("Chapter").unwrap();
    query.set_condition("Image.filename = 'cover.png'").unwrap();

    let err = query.build(None).unwrap_err();
    match err {
        PersistenceError::AmbiguousRelation {
            type_name,
            qualifier,
            roles,
        } => {
            assert_eq!(type_name, "Chapter");
            assert_eq!(qualifier, "Image");
            assert_eq!(roles.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }

    query
        .set_condition("TitleImage.filename = 'cover.png'")
        .unwrap();
    assert_eq!(run(&facade, &query), ["Chapter:1"]);
}

#[test]
fn unknown_qualifiers_and_fields_are_rejected() {
    let facade = library_facade();
    let mut query = facade.string_query("Chapter").unwrap();

    query.set_condition("Magazine.name = 'x'").unwrap();
    assert!(matches!(
        query.build(None).unwrap_err(),
        PersistenceError::UnknownType(_)
    ));

    query.set_condition("Publisher.name = 'Acme'").unwrap();
    assert!(matches!(
        query.build(None).unwrap_err(),
        PersistenceError::UnknownRole { .. }
    ));

    query.set_condition("isbn = 'x'").unwrap();
    assert!(matches!(
        query.build(None).unwrap_err(),
        PersistenceError::UnknownField { .. }
    ));

    assert!(matches!(
        query.set_condition("name = ").unwrap_err(),
        PersistenceError::InvalidQuery(_)
    ));
}

#[test]
fn rql_conditions_share_the_resolution_rules() {
    let facade = library_facade();
    let mut query = facade.string_query("Chapter").unwrap();

    query.set_rql_condition("fk_book_id=1&name=like=B*").unwrap();
    assert_eq!(run(&facade, &query), ["Chapter:2"]);

    query.set_rql_condition("name=Intro|id=in=(3,4)").unwrap();
    assert_eq!(run(&facade, &query), ["Chapter:1", "Chapter:3", "Chapter:4"]);

    query.set_rql_condition("ParentChapter.name=Basics").unwrap();
    assert_eq!(run(&facade, &query), ["Chapter:3"]);

    query.set_rql_condition("").unwrap();
    assert!(query.condition().is_none());
    assert_eq!(run(&facade, &query).len(), 4);
}

#[test]
fn blank_condition_selects_everything() {
    let facade = library_facade();
    let mut query = facade.string_query("Book").unwrap();
    query.set_condition("   ").unwrap();
    assert!(query.condition().is_none());
    assert_eq!(run(&facade, &query), ["Book:1", "Book:2"]);
}
