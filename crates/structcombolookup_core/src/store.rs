use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;

use crate::lookup::{ColumnType, LookupKind};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Latest version of a struct schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaVersion {
    pub id: i64,
    pub table: String,
    pub is_lookup: bool,
}

impl SchemaVersion {
    pub fn data_table(&self) -> String {
        format!("data_{}", self.table)
    }

    pub fn multi_table(&self) -> String {
        format!("multi_{}", self.table)
    }
}

/// A lookup-typed column as seen by the migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupColumn {
    pub colref: i64,
    pub kind: LookupKind,
    pub label: String,
}

impl LookupColumn {
    pub fn column_name(&self) -> String {
        format!("col{}", self.colref)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub schema: SchemaVersion,
    pub colref: i64,
    pub label: String,
    pub is_multi: bool,
    pub column_type: ColumnType,
}

impl ColumnDescriptor {
    pub fn column_name(&self) -> String {
        format!("col{}", self.colref)
    }
}

/// Key/value options shared by struct and its plugins.
pub trait OptionStore {
    fn get_option(&self, key: &str) -> Result<Option<String>>;
    fn set_option(&self, key: &str, value: &str) -> Result<()>;
}

impl OptionStore for Connection {
    fn get_option(&self, key: &str) -> Result<Option<String>> {
        self.query_row(
            "SELECT CAST(val AS TEXT) FROM opts WHERE opt = ?1",
            [key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .with_context(|| format!("failed to read option {key}"))
        .map(Option::flatten)
    }

    fn set_option(&self, key: &str, value: &str) -> Result<()> {
        let updated = self
            .execute("UPDATE opts SET val = ?2 WHERE opt = ?1", params![key, value])
            .with_context(|| format!("failed to update option {key}"))?;
        if updated == 0 {
            self.execute(
                "INSERT INTO opts (opt, val) VALUES (?1, ?2)",
                params![key, value],
            )
            .with_context(|| format!("failed to insert option {key}"))?;
        }
        Ok(())
    }
}

/// Open the struct database. The host owns the file, so it is never created here.
pub fn open_connection(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if !db_path.exists() {
        bail!("struct database not found: {}", db_path.display());
    }
    let connection = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(busy_timeout)
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    ensure_struct_tables(&connection)
        .with_context(|| format!("{} is not a struct database", db_path.display()))?;
    Ok(connection)
}

/// Tables the struct plugin creates and this crate reads.
pub const STRUCT_TABLES: [&str; 4] = ["schemas", "schema_cols", "types", "opts"];

pub fn ensure_struct_tables(connection: &Connection) -> Result<()> {
    for table in STRUCT_TABLES {
        if !table_exists(connection, table)? {
            bail!("missing struct table: {table}");
        }
    }
    Ok(())
}

/// Schema names end up in SQL identifiers; struct only allows `[a-z0-9_]`.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        bail!("invalid struct schema name: {name:?}");
    }
    Ok(())
}

pub fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn column_exists(connection: &Connection, table_name: &str, column: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
            params![table_name, column],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect columns of {table_name}"))?;
    Ok(exists == 1)
}

/// Latest version (max id) of every schema, ordered by table name.
pub fn latest_schemas(connection: &Connection) -> Result<Vec<SchemaVersion>> {
    let islookup = islookup_expression(connection)?;
    let sql = format!(
        "SELECT S.id, S.tbl, {islookup}
         FROM schemas AS S
         JOIN (SELECT MAX(id) AS id FROM schemas GROUP BY tbl) AS L ON L.id = S.id
         ORDER BY S.tbl ASC"
    );
    let mut statement = connection
        .prepare(&sql)
        .context("failed to prepare latest schema query")?;
    let rows = statement
        .query_map([], |row| {
            Ok(SchemaVersion {
                id: row.get(0)?,
                table: row.get(1)?,
                is_lookup: row.get::<_, i64>(2)? != 0,
            })
        })
        .context("failed to run latest schema query")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("failed to read schema row")?);
    }
    Ok(out)
}

pub fn latest_schema(connection: &Connection, table: &str) -> Result<Option<SchemaVersion>> {
    let islookup = islookup_expression(connection)?;
    let sql = format!(
        "SELECT id, tbl, {islookup} FROM schemas WHERE tbl = ?1 ORDER BY id DESC LIMIT 1"
    );
    connection
        .query_row(&sql, [table], |row| {
            Ok(SchemaVersion {
                id: row.get(0)?,
                table: row.get(1)?,
                is_lookup: row.get::<_, i64>(2)? != 0,
            })
        })
        .optional()
        .with_context(|| format!("failed to load latest schema for {table}"))
}

// Older struct databases predate the islookup flag; those schemas are page-based.
fn islookup_expression(connection: &Connection) -> Result<&'static str> {
    if column_exists(connection, "schemas", "islookup")? {
        Ok("COALESCE(islookup, 0)")
    } else {
        Ok("0")
    }
}

/// Columns of schema version `sid` typed ComboLookup or NarrowingLookup.
pub fn lookup_columns(connection: &Connection, sid: i64) -> Result<Vec<LookupColumn>> {
    let mut statement = connection
        .prepare(
            "SELECT C.colref, T.class, COALESCE(T.label, '')
             FROM schema_cols AS C
             LEFT OUTER JOIN types AS T ON C.tid = T.id
             WHERE C.sid = ?1
               AND (T.class = 'ComboLookup' OR T.class = 'NarrowingLookup')
             ORDER BY C.colref ASC",
        )
        .context("failed to prepare lookup column query")?;
    let rows = statement
        .query_map([sid], |row| {
            let colref: i64 = row.get(0)?;
            let class: String = row.get(1)?;
            let label: String = row.get(2)?;
            Ok((colref, class, label))
        })
        .with_context(|| format!("failed to query lookup columns of schema {sid}"))?;

    let mut out = Vec::new();
    for row in rows {
        let (colref, class, label) = row.context("failed to read lookup column row")?;
        let Some(kind) = LookupKind::from_class(&class) else {
            continue;
        };
        out.push(LookupColumn {
            colref,
            kind,
            label,
        });
    }
    Ok(out)
}

/// Enabled column of the latest version of `table` with the given label.
pub fn find_column(
    connection: &Connection,
    table: &str,
    label: &str,
) -> Result<Option<ColumnDescriptor>> {
    let Some(schema) = latest_schema(connection, table)? else {
        return Ok(None);
    };
    column_in_schema(connection, &schema, label)
}

pub fn column_in_schema(
    connection: &Connection,
    schema: &SchemaVersion,
    label: &str,
) -> Result<Option<ColumnDescriptor>> {
    let row = connection
        .query_row(
            "SELECT C.colref, T.class, COALESCE(T.ismulti, 0), T.label, T.config
             FROM schema_cols AS C
             JOIN types AS T ON C.tid = T.id
             WHERE C.sid = ?1 AND T.label = ?2 AND C.enabled = 1
             ORDER BY C.sort ASC
             LIMIT 1",
            params![schema.id, label],
            |row| {
                let colref: i64 = row.get(0)?;
                let class: String = row.get(1)?;
                let is_multi: i64 = row.get(2)?;
                let label: String = row.get(3)?;
                let config: Option<String> = row.get(4)?;
                Ok((colref, class, is_multi != 0, label, config))
            },
        )
        .optional()
        .with_context(|| format!("failed to load column {}.{label}", schema.table))?;

    let Some((colref, class, is_multi, label, config)) = row else {
        return Ok(None);
    };
    let column_type = ColumnType::from_class(&class, config.as_deref())
        .with_context(|| format!("invalid type config for column {}.{label}", schema.table))?;
    Ok(Some(ColumnDescriptor {
        schema: schema.clone(),
        colref,
        label,
        is_multi,
        column_type,
    }))
}

pub fn count_query(
    connection: &Connection,
    sql: &str,
    sql_params: impl rusqlite::Params,
) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, sql_params, |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}
