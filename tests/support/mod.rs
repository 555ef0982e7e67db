//! Shared fixtures: the university schema loaded into an in-memory SQLite database

#![allow(dead_code)]

use entql::data::{Bindings, EntityCache, ScalarKind, Value};
use entql::query::{Database, DatabaseError, Query};
use entql::schema::{AttributeDef, EntityDef, Schema};
use entql::translate::{Decoded, Translator, TranslatorConfig};
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use std::sync::Arc;

/// [`Database`] over a single SQLite connection
pub struct Sqlite {
    conn: Mutex<rusqlite::Connection>,
}

impl Sqlite {
    pub fn open_in_memory() -> Self {
        Self {
            conn: Mutex::new(rusqlite::Connection::open_in_memory().unwrap()),
        }
    }

    pub fn execute_batch(&self, sql: &str) {
        self.conn.lock().execute_batch(sql).unwrap();
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Int64(i) => SqlValue::Integer(*i),
        Value::Float64(f) => SqlValue::Real(*f),
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int64(i),
        ValueRef::Real(f) => Value::Float64(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

impl Database for Sqlite {
    fn submit(&self, sql: &str, params: &[Value]) -> Result<Vec<Vec<Value>>, DatabaseError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter().map(to_sql)))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get_ref(i)?));
            }
            out.push(values);
        }
        Ok(out)
    }
}

pub fn university_schema() -> Schema {
    Schema::builder()
        .entity(
            EntityDef::new("Department")
                .key("number", ScalarKind::Int)
                .required("name", ScalarKind::Unicode)
                .set("groups", "Group", "dept")
                .set("courses", "Course", "dept"),
        )
        .entity(
            EntityDef::new("Group")
                .key("number", ScalarKind::Int)
                .required("major", ScalarKind::Unicode)
                .reference("dept", "Department", "groups")
                .set("students", "Student", "group"),
        )
        .entity(
            EntityDef::new("Course")
                .key("name", ScalarKind::Unicode)
                .key("semester", ScalarKind::Int)
                .required("lect_hours", ScalarKind::Int)
                .required("lab_hours", ScalarKind::Int)
                .required("credits", ScalarKind::Int)
                .reference("dept", "Department", "courses")
                .set("students", "Student", "courses"),
        )
        .entity(
            EntityDef::new("Student")
                .key("id", ScalarKind::Int)
                .required("name", ScalarKind::Unicode)
                .required("dob", ScalarKind::Date)
                .optional("tel", ScalarKind::Str)
                .attribute(AttributeDef::scalar("picture", ScalarKind::Bytes).optional().lazy())
                .required("gpa", ScalarKind::Float)
                .reference("group", "Group", "students")
                .set("courses", "Course", "students"),
        )
        .build()
        .unwrap()
}

const COURSES: [(&str, i64); 6] = [
    ("Web Design", 1),
    ("Data Structures and Algorithms", 3),
    ("Linear Algebra", 1),
    ("Statistical Methods", 2),
    ("Thermodynamics", 2),
    ("Quantum Mechanics", 3),
];

const POPULATION: &str = r#"
INSERT INTO "Department" ("number", "name") VALUES
    (1, 'Department of Computer Science'),
    (2, 'Department of Mathematical Sciences'),
    (3, 'Department of Applied Physics');

INSERT INTO "Course" ("name", "semester", "lect_hours", "lab_hours", "credits", "dept") VALUES
    ('Web Design', 1, 30, 30, 3, 1),
    ('Data Structures and Algorithms', 3, 40, 20, 4, 1),
    ('Linear Algebra', 1, 30, 30, 4, 2),
    ('Statistical Methods', 2, 50, 25, 5, 2),
    ('Thermodynamics', 2, 25, 40, 4, 3),
    ('Quantum Mechanics', 3, 40, 30, 5, 3);

INSERT INTO "Group" ("number", "major", "dept") VALUES
    (101, 'B.E. in Computer Engineering', 1),
    (102, 'B.S./M.S. in Computer Science', 2),
    (103, 'B.S. in Applied Mathematics and Statistics', 2),
    (104, 'B.S./M.S. in Pure Mathematics', 2),
    (105, 'B.E in Electronics', 3),
    (106, 'B.S./M.S. in Nuclear Engineering', 3);

INSERT INTO "Student" ("id", "name", "dob", "tel", "gpa", "group") VALUES
    (1, 'John Smith', '1991-03-20', '123-456', 3.0, 101),
    (2, 'Matthew Reed', '1990-11-26', NULL, 3.5, 101),
    (3, 'Chuan Qin', '1989-02-05', NULL, 4.0, 101),
    (4, 'Rebecca Lawson', '1990-04-18', '234-567', 3.3, 102),
    (5, 'Maria Ionescu', '1991-04-23', NULL, 3.9, 102),
    (6, 'Oliver Blakey', '1990-09-08', NULL, 3.1, 102),
    (7, 'Jing Xia', '1988-12-30', NULL, 3.2, 102);
"#;

/// Course indexes (into [`COURSES`]) attended by each student id
const ENROLLMENT: [(i64, &[usize]); 7] = [
    (1, &[0, 1, 3, 5]),
    (2, &[0, 2, 3, 4]),
    (3, &[2, 4, 5]),
    (4, &[0, 3, 4, 5]),
    (5, &[0, 1, 3, 5]),
    (6, &[0, 1, 4]),
    (7, &[0, 2, 4, 5]),
];

/// A populated university database plus the translator and identity map over it
pub struct University {
    pub db: Sqlite,
    pub identity: EntityCache,
    pub translator: Translator,
}

impl University {
    pub fn new() -> Self {
        Self::with_config(TranslatorConfig::default())
    }

    pub fn with_config(config: TranslatorConfig) -> Self {
        let schema = university_schema();
        let db = Sqlite::open_in_memory();
        for statement in schema.create_statements() {
            db.execute_batch(&statement);
        }
        db.execute_batch(POPULATION);

        let mut enrollment = String::new();
        for (student, courses) in ENROLLMENT {
            for &c in courses {
                let (name, semester) = COURSES[c];
                enrollment.push_str(&format!(
                    "INSERT INTO \"Course_Student\" (\"course_name\", \"course_semester\", \"student\") \
                     VALUES ('{}', {}, {});\n",
                    name, semester, student
                ));
            }
        }
        db.execute_batch(&enrollment);

        Self {
            db,
            identity: EntityCache::new(),
            translator: Translator::with_config(Arc::new(schema), config),
        }
    }

    pub fn select(&self, text: &str) -> Query<'_> {
        self.select_with(text, Bindings::new())
    }

    pub fn select_with(&self, text: &str, bindings: Bindings) -> Query<'_> {
        self.translator
            .select_str(&self.db, &self.identity, text, bindings)
            .unwrap()
    }

    /// Rendered results, in the order the database returned them
    pub fn rows(&self, text: &str) -> Vec<String> {
        render(&self.select(text).fetch().unwrap())
    }

    /// Rendered results, sorted
    pub fn sorted(&self, text: &str) -> Vec<String> {
        let mut rows = self.rows(text);
        rows.sort();
        rows
    }
}

pub fn render(items: &[Decoded]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

pub fn students(ids: &[i64]) -> Vec<String> {
    ids.iter().map(|id| format!("Student[{}]", id)).collect()
}
