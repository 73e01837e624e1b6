//! One-time rewrite of legacy lookup values into the composite `[page, row]` encoding.
//!
//! Legacy ComboLookup/NarrowingLookup columns stored either a page id or a bare
//! row id. The runner rewrites every such value in the `data_*` and `multi_*`
//! tables of the latest schema versions, then records `structcombolookup_updated = 1`
//! in `opts`. Everything happens in one IMMEDIATE transaction, so a failure leaves
//! the store untouched and the migration pending.

use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::lookup::LookupKind;
use crate::store::{
    LookupColumn, OptionStore, SchemaVersion, count_query, latest_schemas, lookup_columns,
    validate_table_name,
};

pub const MIGRATION_FLAG: &str = "structcombolookup_updated";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ColumnMigration {
    pub table: String,
    pub colref: i64,
    pub kind: LookupKind,
    pub label: String,
    pub data_pages: usize,
    pub multi_pages: usize,
    pub data_rows: usize,
    pub multi_rows: usize,
}

impl ColumnMigration {
    fn empty(schema: &SchemaVersion, column: &LookupColumn) -> Self {
        Self {
            table: schema.table.clone(),
            colref: column.colref,
            kind: column.kind,
            label: column.label.clone(),
            data_pages: 0,
            multi_pages: 0,
            data_rows: 0,
            multi_rows: 0,
        }
    }

    pub fn rewritten(&self) -> usize {
        self.data_pages + self.multi_pages + self.data_rows + self.multi_rows
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub schemas_scanned: usize,
    pub columns: Vec<ColumnMigration>,
}

impl MigrationReport {
    pub fn rewritten_values(&self) -> usize {
        self.columns.iter().map(ColumnMigration::rewritten).sum()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    AlreadyMigrated,
    Migrated(MigrationReport),
}

/// Read-only preview of what `run_migration` would rewrite.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MigrationPlan {
    pub migrated: bool,
    pub schemas_scanned: usize,
    pub columns: Vec<ColumnMigration>,
}

impl MigrationPlan {
    pub fn pending_values(&self) -> usize {
        self.columns.iter().map(ColumnMigration::rewritten).sum()
    }
}

/// The two rewrite passes. Page references must run first: the numeric test
/// cannot tell a bare row id from an already rewritten value, but a rewritten
/// page reference never looks numeric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    PageReferences,
    RowReferences,
}

impl Pass {
    const ORDER: [Pass; 2] = [Pass::PageReferences, Pass::RowReferences];

    fn predicate(self, expr: &str) -> String {
        let comparison = match self {
            Self::PageReferences => "!=",
            Self::RowReferences => "=",
        };
        format!("{expr} != '' AND CAST({expr} AS DECIMAL) {comparison} {expr}")
    }

    // Row ids are concatenated verbatim so the stored number text is preserved.
    fn rewrite(self, expr: &str) -> String {
        match self {
            Self::PageReferences => format!("json_array({expr}, 0)"),
            Self::RowReferences => format!("'[\"\",' || {expr} || ']'"),
        }
    }

    fn data_update(self, schema: &SchemaVersion, column: &LookupColumn) -> String {
        let col = column.column_name();
        format!(
            "UPDATE \"{}\" SET {col} = {} WHERE {}",
            schema.data_table(),
            self.rewrite(&col),
            self.predicate(&col)
        )
    }

    fn multi_update(self, schema: &SchemaVersion) -> String {
        format!(
            "UPDATE \"{}\" SET value = {} WHERE colref = ?1 AND {}",
            schema.multi_table(),
            self.rewrite("value"),
            self.predicate("value")
        )
    }

    fn data_count(self, schema: &SchemaVersion, column: &LookupColumn) -> String {
        format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE {}",
            schema.data_table(),
            self.predicate(&column.column_name())
        )
    }

    fn multi_count(self, schema: &SchemaVersion) -> String {
        format!(
            "SELECT COUNT(*) FROM \"{}\" WHERE colref = ?1 AND {}",
            schema.multi_table(),
            self.predicate("value")
        )
    }

    fn record(self, migration: &mut ColumnMigration, data: usize, multi: usize) {
        match self {
            Self::PageReferences => {
                migration.data_pages = data;
                migration.multi_pages = multi;
            }
            Self::RowReferences => {
                migration.data_rows = data;
                migration.multi_rows = multi;
            }
        }
    }
}

/// Whether the flag in `opts` marks the migration as done.
pub fn is_migrated(connection: &Connection) -> Result<bool> {
    let value = connection.get_option(MIGRATION_FLAG)?;
    Ok(value
        .as_deref()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .is_some_and(|parsed| parsed == 1.0))
}

/// Run the migration once. Repeated calls after a successful run are no-ops.
pub fn run_migration(connection: &mut Connection) -> Result<MigrationOutcome> {
    let transaction = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start lookup migration transaction")?;

    if is_migrated(&transaction)? {
        debug!("lookup values already migrated");
        return Ok(MigrationOutcome::AlreadyMigrated);
    }

    info!("migrating lookup values to composite encoding");
    match migrate_all(&transaction) {
        Ok(report) => {
            transaction
                .commit()
                .context("failed to commit lookup migration")?;
            info!(
                schemas = report.schemas_scanned,
                columns = report.columns.len(),
                rewritten = report.rewritten_values(),
                "lookup migration committed"
            );
            Ok(MigrationOutcome::Migrated(report))
        }
        Err(err) => {
            if let Err(rollback_err) = transaction.rollback() {
                warn!(error = %rollback_err, "failed to roll back lookup migration");
            }
            Err(err)
        }
    }
}

fn migrate_all(transaction: &Transaction<'_>) -> Result<MigrationReport> {
    let schemas = latest_schemas(transaction)?;
    let mut report = MigrationReport {
        schemas_scanned: schemas.len(),
        columns: Vec::new(),
    };

    for schema in &schemas {
        validate_table_name(&schema.table)?;
        for column in lookup_columns(transaction, schema.id)? {
            let migrated = migrate_column(transaction, schema, &column).with_context(|| {
                format!(
                    "failed to migrate {}.{}",
                    schema.table,
                    column.column_name()
                )
            })?;
            report.columns.push(migrated);
        }
    }

    transaction.set_option(MIGRATION_FLAG, "1")?;
    Ok(report)
}

fn migrate_column(
    connection: &Connection,
    schema: &SchemaVersion,
    column: &LookupColumn,
) -> Result<ColumnMigration> {
    let mut migration = ColumnMigration::empty(schema, column);
    for pass in Pass::ORDER {
        let data_sql = pass.data_update(schema, column);
        debug!(sql = %data_sql, "rewriting lookup data");
        let data = connection
            .execute(&data_sql, [])
            .with_context(|| format!("failed to update {}", schema.data_table()))?;

        let multi_sql = pass.multi_update(schema);
        debug!(sql = %multi_sql, colref = column.colref, "rewriting lookup multi values");
        let multi = connection
            .execute(&multi_sql, [column.colref])
            .with_context(|| format!("failed to update {}", schema.multi_table()))?;

        pass.record(&mut migration, data, multi);
    }
    Ok(migration)
}

/// Count what each pass would rewrite without touching the store.
pub fn plan_migration(connection: &Connection) -> Result<MigrationPlan> {
    let migrated = is_migrated(connection)?;
    let schemas = latest_schemas(connection)?;
    let mut columns = Vec::new();

    if !migrated {
        for schema in &schemas {
            validate_table_name(&schema.table)?;
            for column in lookup_columns(connection, schema.id)? {
                let mut planned = ColumnMigration::empty(schema, &column);
                for pass in Pass::ORDER {
                    let data = count_query(connection, &pass.data_count(schema, &column), [])
                        .with_context(|| format!("failed to inspect {}", schema.data_table()))?;
                    let multi = count_query(connection, &pass.multi_count(schema), [column.colref])
                        .with_context(|| format!("failed to inspect {}", schema.multi_table()))?;
                    pass.record(&mut planned, data, multi);
                }
                columns.push(planned);
            }
        }
    }

    Ok(MigrationPlan {
        migrated,
        schemas_scanned: schemas.len(),
        columns,
    })
}
