//! End-to-end queries over the university model, executed on SQLite

mod support;

use entql::data::{Bindings, IdentityMap, Value};
use entql::query::{ExecuteError, QueryTree};
use entql::schema::Schema;
use entql::translate::{AliasStyle, DistinctMode, TranslatorConfig, Translator};
use rayon::prelude::*;
use std::io::Write;
use std::sync::Arc;
use support::{render, students, University};

fn compile_err(university: &University, text: &str, bindings: &Bindings) -> String {
    let tree = QueryTree::parse(text).unwrap();
    university
        .translator
        .compile(&tree, bindings, DistinctMode::Auto)
        .unwrap_err()
        .to_string()
}

#[test]
fn test_entity_extent() {
    let u = University::new();
    assert_eq!(u.rows("s for s in Student"), students(&[1, 2, 3, 4, 5, 6, 7]));
    assert_eq!(
        render(&u.select("s for s in Student").distinct().fetch().unwrap()),
        students(&[1, 2, 3, 4, 5, 6, 7])
    );
}

#[test]
fn test_many_to_many_collection_is_distinct() {
    let u = University::new();
    let query = u.select("c.students for c in Course");
    let plan = query.plan().unwrap();
    assert!(plan.distinct);
    assert_eq!(query.fetch().unwrap().len(), 7);
    assert_eq!(query.count().unwrap(), 7);
}

#[test]
fn test_nested_count_uses_distinct() {
    let u = University::new();
    let text = "d for d in Department \
                if len(s for c in d.courses for s in c.students) > len(s for s in Student)";
    let query = u.select(text);
    assert!(query.sql().unwrap().contains("DISTINCT"));
    assert!(query.fetch().unwrap().is_empty());
}

#[test]
fn test_one_to_many_chain_count_has_no_distinct() {
    let u = University::new();
    let text = "d for d in Department if len(d.groups.students) > 3";
    let query = u.select(text);
    assert!(!query.sql().unwrap().contains("DISTINCT"));
    assert_eq!(render(&query.fetch().unwrap()), vec!["Department[2]"]);
}

#[test]
fn test_not_in_over_nullable_column() {
    let u = University::new();
    let text = "g for g in Group if '123-45-67' not in g.students.tel and g.dept == Department[1]";
    let query = u.select(text);
    assert!(query
        .sql()
        .unwrap()
        .contains("\"student-1\".\"tel\" IS NOT NULL"));
    assert_eq!(render(&query.fetch().unwrap()), vec!["Group[101]"]);

    let text = "g for g in Group if 'John' not in g.students.name and g.dept == Department[1]";
    let query = u.select(text);
    assert!(!query.sql().unwrap().contains("IS NOT NULL"));
    assert_eq!(render(&query.fetch().unwrap()), vec!["Group[101]"]);
}

#[test]
fn test_generator_over_attribute_chain() {
    let text = "s for d in Department if d.number == 2 for s in d.groups.students";
    let expected = students(&[4, 5, 6, 7]);

    let u = University::new();
    assert_eq!(u.rows(text), expected);

    let path = University::with_config(TranslatorConfig::default().with_alias_style(AliasStyle::Path));
    assert_eq!(path.rows(text), expected);
    assert_ne!(
        u.select(text).sql().unwrap(),
        path.select(text).sql().unwrap()
    );
}

#[test]
fn test_tuple_projection_with_reference_key() {
    let u = University::new();
    assert_eq!(
        u.rows("(s.name, s.group.number) for s in Student if s.name.startswith(\"J\")"),
        vec!["('Jing Xia', 102)", "('John Smith', 101)"]
    );
}

#[test]
fn test_date_part_projection() {
    let u = University::new();
    assert_eq!(
        u.rows("(s.dob.year, s.group.number) for s in Student"),
        vec![
            "(1988, 102)",
            "(1989, 101)",
            "(1990, 101)",
            "(1990, 102)",
            "(1991, 101)",
            "(1991, 102)"
        ]
    );
}

#[test]
fn test_distinct_modes_on_scalar_projection() {
    let u = University::new();
    let query = u.select("s.dob.year for s in Student");

    assert_eq!(
        render(&query.without_distinct().fetch().unwrap()),
        vec!["1991", "1990", "1989", "1990", "1991", "1990", "1988"]
    );
    assert_eq!(
        render(&query.fetch().unwrap()),
        vec!["1988", "1989", "1990", "1991"]
    );
    assert_eq!(query.without_distinct().count().unwrap(), 7);
    assert_eq!(query.count().unwrap(), 4);
}

#[test]
fn test_startswith_filter() {
    let u = University::new();
    assert_eq!(
        u.sorted("s.name for s in Student if s.name.startswith('M')"),
        vec!["'Maria Ionescu'", "'Matthew Reed'"]
    );
}

#[test]
fn test_entity_and_date_tuple() {
    let u = University::new();
    assert_eq!(
        u.sorted("(s.group, s.dob) for s in Student if s.group == Group[101]"),
        vec![
            "(Group[101], date(1989, 2, 5))",
            "(Group[101], date(1990, 11, 26))",
            "(Group[101], date(1991, 3, 20))"
        ]
    );
}

#[test]
fn test_cross_product_of_entities() {
    let u = University::new();
    assert_eq!(
        u.rows("(c, s) for s in Student for c in Course if c.semester == 1 and s.id < 3"),
        vec![
            "(Course['Linear Algebra',1], Student[1])",
            "(Course['Linear Algebra',1], Student[2])",
            "(Course['Web Design',1], Student[1])",
            "(Course['Web Design',1], Student[2])"
        ]
    );
}

#[test]
fn test_tuple_not_in_correlated_subquery() {
    let u = University::new();
    let text = "s for s in Student if (s.name, s.dob) not in \
                ((s2.name, s2.dob) for s2 in Student if s.group.number == 101)";
    assert_eq!(u.rows(text), students(&[4, 5, 6, 7]));
}

#[test]
fn test_identity_map_shares_instances() {
    let u = University::new();
    let first = u.select("s for s in Student").fetch().unwrap();
    let again = u
        .select("s for s in Student if s.gpa > 0")
        .fetch()
        .unwrap();
    let a = first[0].as_entity().unwrap();
    let b = again[0].as_entity().unwrap();
    assert!(Arc::ptr_eq(a, b));
    assert_eq!(a.get("name"), Some(Value::from("John Smith")));
    assert!(!a.is_loaded("picture"));
}

#[test]
fn test_incomparable_types() {
    let u = University::new();
    assert_eq!(
        compile_err(&u, "g for g in Group if g.number == g.students", &Bindings::new()),
        "Incomparable types 'int' and 'Set of Student' in expression: g.number == g.students"
    );
}

#[test]
fn test_external_entity_parameter() {
    let u = University::new();
    let john = u
        .select("s for s in Student if s.id == 1")
        .get()
        .unwrap()
        .unwrap();
    let john = john.as_entity().unwrap().clone();

    let bindings = Bindings::new().with("x", john.clone());
    assert_eq!(
        compile_err(&u, "x for s in Student", &bindings),
        "External parameter 'x' cannot be used as query result"
    );

    let others = u
        .select_with("s for s in Student if s.name != x.name", bindings)
        .fetch()
        .unwrap();
    assert_eq!(render(&others), students(&[2, 3, 4, 5, 6, 7]));

    let unloaded = u.identity.resolve("Student", &[Value::Int64(99)]);
    let query = u.select_with(
        "s for s in Student if s.name != x.name",
        Bindings::new().with("x", unloaded),
    );
    assert!(matches!(
        query.fetch().unwrap_err(),
        ExecuteError::UnboundParameter(_)
    ));
}

#[test]
fn test_get_and_exists() {
    let u = University::new();
    let err = u.select("s for s in Student").get().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Multiple objects were found. Use select(...) to retrieve them"
    );
    assert!(u.select("s for s in Student").exists().unwrap());
    assert!(!u.select("s for s in Student if s.id > 100").exists().unwrap());
    assert!(u
        .select("s for s in Student if s.id > 100")
        .get()
        .unwrap()
        .is_none());
}

#[test]
fn test_unknown_entity_under_db() {
    let u = University::new();
    assert_eq!(
        compile_err(&u, "s for s in db.Student for g in db.FooBar", &Bindings::new()),
        "db.FooBar raises unknown entity 'FooBar'"
    );
}

#[test]
fn test_date_constructor_comparison() {
    let u = University::new();
    assert_eq!(
        u.rows("s for s in Student if s.dob < date(year=1990, month=10, day=20)"),
        students(&[3, 4, 6, 7])
    );
}

#[test]
fn test_chained_comparison() {
    let u = University::new();
    let expected = students(&[1, 2, 4, 5, 6, 7]);
    assert_eq!(u.rows("s for s in Student if 3 <= s.gpa < 4"), expected);
    assert_eq!(u.rows("s for s in db.Student if 3 <= s.gpa < 4"), expected);
}

#[test]
fn test_sibling_collections() {
    let u = University::new();
    assert_eq!(
        u.rows(
            "d for d in Department for g in d.groups for c in d.courses \
             if g.number == 106 and c.name.startswith('T')"
        ),
        vec!["Department[3]"]
    );
}

#[test]
fn test_len_of_unicode_parameter() {
    let u = University::new();
    let query = u.select_with(
        "s for s in Student if len(u2) == 1",
        Bindings::new().with("u2", "ð"),
    );
    assert_eq!(query.fetch().unwrap().len(), 7);
}

#[test]
fn test_translation_is_deterministic() {
    let text = "s for d in Department if d.number == 2 for s in d.groups.students if s.gpa > x";
    let bindings = Bindings::new().with("x", Value::Float64(3.0));

    let a = University::new();
    let b = University::new();
    let tree = QueryTree::parse(text).unwrap();
    let first = a.translator.compile(&tree, &bindings, DistinctMode::Auto).unwrap();
    let second = b
        .translator
        .compile(&QueryTree::parse(text).unwrap(), &bindings, DistinctMode::Auto)
        .unwrap();
    assert_eq!(first.sql, second.sql);
    assert_eq!(first.params, second.params);

    a.translator.invalidate(&tree);
    let recompiled = a.translator.compile(&tree, &bindings, DistinctMode::Auto).unwrap();
    assert!(!Arc::ptr_eq(&first, &recompiled));
    assert_eq!(first.sql, recompiled.sql);
}

#[test]
fn test_plan_cache_reuse() {
    let u = University::new();
    let tree = QueryTree::parse("s for s in Student if s.gpa > 3.5").unwrap();
    let bindings = Bindings::new();

    let first = u.translator.compile(&tree, &bindings, DistinctMode::Auto).unwrap();
    let second = u.translator.compile(&tree, &bindings, DistinctMode::Auto).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let without = u
        .translator
        .compile(&tree, &bindings, DistinctMode::WithoutDistinct)
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &without));

    let stats = u.translator.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.entry_count, 2);

    u.translator.invalidate_all();
    assert_eq!(u.translator.cache_stats().entry_count, 0);
}

#[test]
fn test_concurrent_compilation_shares_one_plan() {
    let u = University::new();
    let tree = QueryTree::parse("c.students for c in Course").unwrap();

    let plans: Vec<_> = (0..32)
        .into_par_iter()
        .map(|_| {
            u.translator
                .compile(&tree, &Bindings::new(), DistinctMode::Auto)
                .unwrap()
        })
        .collect();

    assert!(plans.iter().all(|plan| Arc::ptr_eq(plan, &plans[0])));
}

#[test]
fn test_schema_from_json_file() {
    let json = r#"{
        "entities": [
            {
                "name": "Group",
                "primary_key": ["number"],
                "attributes": [
                    {"name": "number", "kind": "int"},
                    {"name": "students", "collection": "Student", "inverse": "group"}
                ]
            },
            {
                "name": "Student",
                "primary_key": ["id"],
                "attributes": [
                    {"name": "id", "kind": "int"},
                    {"name": "name", "kind": "unicode"},
                    {"name": "group", "reference": "Group", "inverse": "students"}
                ]
            }
        ]
    }"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let schema = Schema::from_path(file.path()).unwrap();
    let translator = Translator::new(Arc::new(schema));
    let tree = QueryTree::parse("s.name for s in Student if s.group.number == 101").unwrap();
    let plan = translator
        .compile(&tree, &Bindings::new(), DistinctMode::Auto)
        .unwrap();
    assert!(plan.sql.contains("\"s\".\"group\" = 101"));
}

#[test]
fn test_endswith_empty_parameter_matches_everything() {
    let u = University::new();
    let bindings = Bindings::new().with("x", "");
    for text in [
        "s for s in Student if s.name.endswith(x)",
        "s for s in Student if s.name.startswith(x)",
    ] {
        let rows = u.select_with(text, bindings.clone()).fetch().unwrap();
        assert_eq!(render(&rows), students(&[1, 2, 3, 4, 5, 6, 7]));
    }

    let rows = u
        .select_with(
            "s for s in Student if s.name.endswith(x)",
            Bindings::new().with("x", "Xia"),
        )
        .fetch()
        .unwrap();
    assert_eq!(render(&rows), students(&[7]));
}

#[test]
fn test_aggregates_over_collections() {
    let u = University::new();

    let query = u.select("d for d in Department if sum(d.courses.credits) > 8");
    assert!(!query.sql().unwrap().contains("DISTINCT"));
    assert_eq!(
        render(&query.fetch().unwrap()),
        vec!["Department[2]", "Department[3]"]
    );

    // Each course counts once however many students of the group attend it
    let query = u.select("g for g in Group if sum(g.students.courses.lect_hours) == 145");
    assert!(query.sql().unwrap().contains("SUM(DISTINCT "));
    assert_eq!(
        render(&query.fetch().unwrap()),
        vec!["Group[101]", "Group[102]"]
    );

    assert_eq!(
        u.rows("g for g in Group if max(g.students.gpa) > 3.95"),
        vec!["Group[101]"]
    );

    let err = compile_err(
        &u,
        "g for g in Group if sum(s.name for s in g.students) > 0",
        &Bindings::new(),
    );
    assert!(err.starts_with("sum() is not applicable to"));
}
