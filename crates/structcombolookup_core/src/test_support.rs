//! In-memory struct databases for unit tests.

use rusqlite::types::Value;
use rusqlite::{Connection, params};

const STRUCT_BASE_SQL: &str = r#"
CREATE TABLE schemas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tbl TEXT NOT NULL,
    ts INTEGER NOT NULL DEFAULT 0,
    islookup INTEGER NOT NULL DEFAULT 0,
    user TEXT NOT NULL DEFAULT '',
    comment TEXT NOT NULL DEFAULT '',
    config TEXT NOT NULL DEFAULT ''
);
CREATE TABLE types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    class TEXT NOT NULL,
    ismulti INTEGER NOT NULL DEFAULT 0,
    label TEXT NOT NULL DEFAULT '',
    config TEXT NOT NULL DEFAULT ''
);
CREATE TABLE schema_cols (
    sid INTEGER NOT NULL,
    colref INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    tid INTEGER NOT NULL,
    sort INTEGER NOT NULL,
    PRIMARY KEY (sid, colref)
);
CREATE TABLE opts (
    opt TEXT NOT NULL PRIMARY KEY,
    val NOT NULL DEFAULT ''
);
"#;

#[derive(Debug, Clone)]
pub struct TypeSpec {
    pub class: &'static str,
    pub label: &'static str,
    pub multi: bool,
    pub config: &'static str,
}

impl TypeSpec {
    pub fn new(class: &'static str, label: &'static str) -> Self {
        Self {
            class,
            label,
            multi: false,
            config: "",
        }
    }

    pub fn multi(mut self) -> Self {
        self.multi = true;
        self
    }

    pub fn config(mut self, config: &'static str) -> Self {
        self.config = config;
        self
    }
}

pub struct StructFixture {
    pub connection: Connection,
}

impl StructFixture {
    pub fn new() -> Self {
        let connection = Connection::open_in_memory().expect("open in-memory db");
        initialize_struct_tables(&connection);
        Self { connection }
    }

    /// Register schema version `id` and make sure its data and multi tables can hold every column.
    pub fn add_schema(&self, id: i64, table: &str, is_lookup: bool, types: &[TypeSpec]) {
        add_schema_to(&self.connection, id, table, is_lookup, types);
    }

    pub fn insert_data(&self, table: &str, pid: &str, rid: i64, values: &[(i64, &str)]) {
        insert_data_into(&self.connection, table, pid, rid, values);
    }

    pub fn insert_multi(&self, table: &str, pid: &str, rid: i64, colref: i64, row: i64, value: &str) {
        self.connection
            .execute(
                &format!(
                    "INSERT INTO multi_{table} (pid, rid, rev, latest, colref, row, value)
                     VALUES (?1, ?2, 0, 1, ?3, ?4, ?5)"
                ),
                params![pid, rid, colref, row, value],
            )
            .expect("insert multi row");
    }

    /// Values of `colN` in insertion order.
    pub fn data_values(&self, table: &str, colref: i64) -> Vec<String> {
        let mut statement = self
            .connection
            .prepare(&format!(
                "SELECT CAST(col{colref} AS TEXT) FROM data_{table} ORDER BY rowid"
            ))
            .expect("prepare data select");
        statement
            .query_map([], |row| row.get::<_, String>(0))
            .expect("query data")
            .map(|row| row.expect("data row"))
            .collect()
    }

    pub fn multi_values(&self, table: &str, colref: i64) -> Vec<String> {
        let mut statement = self
            .connection
            .prepare(&format!(
                "SELECT CAST(value AS TEXT) FROM multi_{table} WHERE colref = ?1 ORDER BY rowid"
            ))
            .expect("prepare multi select");
        statement
            .query_map([colref], |row| row.get::<_, String>(0))
            .expect("query multi")
            .map(|row| row.expect("multi row"))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<String> {
        snapshot(&self.connection)
    }
}

pub fn initialize_struct_tables(connection: &Connection) {
    connection
        .execute_batch(STRUCT_BASE_SQL)
        .expect("create struct tables");
}

pub fn add_schema_to(
    connection: &Connection,
    id: i64,
    table: &str,
    is_lookup: bool,
    types: &[TypeSpec],
) {
    connection
        .execute(
            "INSERT INTO schemas (id, tbl, islookup) VALUES (?1, ?2, ?3)",
            params![id, table, i64::from(is_lookup)],
        )
        .expect("insert schema");

    for (index, spec) in types.iter().enumerate() {
        let colref = i64::try_from(index).expect("colref") + 1;
        connection
            .execute(
                "INSERT INTO types (class, ismulti, label, config) VALUES (?1, ?2, ?3, ?4)",
                params![spec.class, i64::from(spec.multi), spec.label, spec.config],
            )
            .expect("insert type");
        let tid = connection.last_insert_rowid();
        connection
            .execute(
                "INSERT INTO schema_cols (sid, colref, enabled, tid, sort) VALUES (?1, ?2, 1, ?3, ?4)",
                params![id, colref, tid, colref * 10],
            )
            .expect("insert schema column");
    }

    connection
        .execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS data_{table} (
                pid TEXT DEFAULT '',
                rid INTEGER,
                rev INTEGER,
                latest BOOLEAN NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS multi_{table} (
                colref INTEGER NOT NULL,
                pid TEXT DEFAULT '',
                rid INTEGER,
                rev INTEGER,
                latest INTEGER NOT NULL DEFAULT 0,
                row INTEGER NOT NULL,
                value,
                PRIMARY KEY(colref, pid, rid, rev, row)
            );"
        ))
        .expect("create data tables");

    for colref in 1..=types.len() {
        let exists: i64 = connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
                params![format!("data_{table}"), format!("col{colref}")],
                |row| row.get(0),
            )
            .expect("inspect data columns");
        if exists == 0 {
            connection
                .execute_batch(&format!(
                    "ALTER TABLE data_{table} ADD COLUMN col{colref} DEFAULT ''"
                ))
                .expect("add data column");
        }
    }
}

pub fn insert_data_into(
    connection: &Connection,
    table: &str,
    pid: &str,
    rid: i64,
    values: &[(i64, &str)],
) {
    let mut columns = vec!["pid".to_string(), "rid".to_string(), "rev".to_string(), "latest".to_string()];
    let mut placeholders = vec!["?1".to_string(), "?2".to_string(), "0".to_string(), "1".to_string()];
    let mut bound: Vec<Value> = vec![Value::from(pid.to_string()), Value::from(rid)];
    for (colref, value) in values {
        columns.push(format!("col{colref}"));
        bound.push(Value::from((*value).to_string()));
        placeholders.push(format!("?{}", bound.len()));
    }
    connection
        .execute(
            &format!(
                "INSERT INTO data_{table} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            ),
            rusqlite::params_from_iter(bound),
        )
        .expect("insert data row");
}

/// Every row of every table, rendered for before/after comparisons.
pub fn snapshot(connection: &Connection) -> Vec<String> {
    let mut statement = connection
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .expect("prepare table list");
    let tables: Vec<String> = statement
        .query_map([], |row| row.get(0))
        .expect("list tables")
        .map(|row| row.expect("table name"))
        .collect();

    let mut out = Vec::new();
    for table in tables {
        let mut rows = connection
            .prepare(&format!("SELECT * FROM \"{table}\" ORDER BY rowid"))
            .expect("prepare dump");
        let width = rows.column_count();
        let dumped: Vec<String> = rows
            .query_map([], |row| {
                let mut cells = Vec::with_capacity(width);
                for index in 0..width {
                    cells.push(format!("{:?}", row.get::<_, Value>(index)?));
                }
                Ok(format!("{table}|{}", cells.join("|")))
            })
            .expect("dump table")
            .map(|row| row.expect("dump row"))
            .collect();
        out.extend(dumped);
    }
    out
}
