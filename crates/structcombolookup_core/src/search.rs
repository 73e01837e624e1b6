use anyhow::{Context, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};
use serde::Serialize;
use tracing::debug;

use crate::lookup::LookupValue;
use crate::store::{ColumnDescriptor, SchemaVersion, column_in_schema, latest_schema, validate_table_name};

/// Equality filter on the row identity of a struct table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    RowId(String),
    PageId(String),
}

impl Filter {
    /// Join key for a reference into `schema`: lookup schemas are keyed by row id.
    pub fn for_schema(schema: &SchemaVersion, value: impl Into<String>) -> Self {
        if schema.is_lookup {
            Self::RowId(value.into())
        } else {
            Self::PageId(value.into())
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Self::RowId(_) => "rid",
            Self::PageId(_) => "pid",
        }
    }

    fn value(&self) -> &str {
        match self {
            Self::RowId(value) | Self::PageId(value) => value,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SearchValue {
    pub label: String,
    pub raw: Vec<String>,
    pub is_lookup: bool,
}

impl SearchValue {
    pub fn display_value(&self) -> String {
        self.raw
            .iter()
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                if self.is_lookup {
                    LookupValue::parse_lenient(raw)
                        .map(|value| value.display())
                        .unwrap_or_else(|| raw.clone())
                } else {
                    raw.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Single-schema search over the latest rows of a struct table.
#[derive(Debug)]
pub struct Search<'conn> {
    connection: &'conn Connection,
    schema: SchemaVersion,
    columns: Vec<String>,
    filters: Vec<Filter>,
}

impl<'conn> Search<'conn> {
    pub fn new(connection: &'conn Connection, schema: SchemaVersion) -> Self {
        Self {
            connection,
            schema,
            columns: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Search the latest version of `table`, or `None` when the schema does not exist.
    pub fn for_table(connection: &'conn Connection, table: &str) -> Result<Option<Self>> {
        Ok(latest_schema(connection, table)?.map(|schema| Self::new(connection, schema)))
    }

    pub fn schema(&self) -> &SchemaVersion {
        &self.schema
    }

    pub fn add_column(mut self, label: impl Into<String>) -> Self {
        self.columns.push(label.into());
        self
    }

    pub fn add_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Rows matching every filter; each row holds one value per known column.
    pub fn execute(&self) -> Result<Vec<Vec<SearchValue>>> {
        validate_table_name(&self.schema.table)?;
        let columns = self.resolve_columns()?;
        if columns.is_empty() {
            return Ok(Vec::new());
        }

        let mut selected = vec!["pid".to_string(), "rid".to_string(), "rev".to_string()];
        selected.extend(columns.iter().map(ColumnDescriptor::column_name));
        let mut conditions = vec!["latest = 1".to_string()];
        conditions.extend(
            self.filters
                .iter()
                .enumerate()
                .map(|(index, filter)| format!("{} = ?{}", filter.column(), index + 1)),
        );
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE {} ORDER BY pid ASC, rid ASC",
            selected.join(", "),
            self.schema.data_table(),
            conditions.join(" AND ")
        );
        debug!(sql = %sql, "executing struct search");

        let mut statement = self
            .connection
            .prepare(&sql)
            .with_context(|| format!("failed to prepare search on {}", self.schema.table))?;
        let rows = statement
            .query_map(params_from_iter(self.filters.iter().map(Filter::value)), |row| {
                let mut values = Vec::with_capacity(selected.len());
                for index in 0..selected.len() {
                    values.push(row.get::<_, Value>(index)?);
                }
                Ok(values)
            })
            .with_context(|| format!("failed to search {}", self.schema.table))?;

        let mut out = Vec::new();
        for row in rows {
            let values = row.context("failed to read search row")?;
            let (identity, cells) = values.split_at(3);
            let mut result = Vec::with_capacity(columns.len());
            for (column, cell) in columns.iter().zip(cells) {
                let raw = if column.is_multi {
                    self.multi_values(column, identity)?
                } else {
                    vec![value_to_text(cell)]
                };
                result.push(SearchValue {
                    label: column.label.clone(),
                    raw,
                    is_lookup: column.column_type.lookup_kind().is_some(),
                });
            }
            out.push(result);
        }
        Ok(out)
    }

    fn resolve_columns(&self) -> Result<Vec<ColumnDescriptor>> {
        let mut out = Vec::new();
        for label in &self.columns {
            match column_in_schema(self.connection, &self.schema, label)? {
                Some(column) => out.push(column),
                None => debug!(schema = %self.schema.table, column = %label, "unknown search column"),
            }
        }
        Ok(out)
    }

    fn multi_values(&self, column: &ColumnDescriptor, identity: &[Value]) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT value FROM \"{}\"
             WHERE colref = ?1 AND pid IS ?2 AND rid IS ?3 AND rev IS ?4 AND latest = 1
             ORDER BY row ASC",
            self.schema.multi_table()
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .with_context(|| format!("failed to prepare multi lookup on {}", self.schema.table))?;
        let rows = statement
            .query_map(
                rusqlite::params![column.colref, identity[0], identity[1], identity[2]],
                |row| row.get::<_, Value>(0),
            )
            .with_context(|| format!("failed to read {}", self.schema.multi_table()))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(value_to_text(&row.context("failed to read multi value")?));
        }
        Ok(out)
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Integer(number) => number.to_string(),
        Value::Real(number) => number.to_string(),
        Value::Text(text) => text.clone(),
        Value::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StructFixture, TypeSpec};

    fn regions_fixture() -> StructFixture {
        let fixture = StructFixture::new();
        fixture.add_schema(
            1,
            "regions",
            true,
            &[
                TypeSpec::new("Text", "name"),
                TypeSpec::new("ComboLookup", "country"),
                TypeSpec::new("Tag", "aliases").multi(),
            ],
        );
        fixture.insert_data("regions", "", 17, &[(1, "Bavaria"), (2, r#"["wiki:germany",0]"#)]);
        fixture.insert_data("regions", "", 18, &[(1, "Tyrol"), (2, r#"["",4]"#)]);
        fixture.insert_multi("regions", "", 17, 3, 2, "Bayern");
        fixture.insert_multi("regions", "", 17, 3, 1, "Freistaat");
        fixture
    }

    #[test]
    fn filter_follows_schema_kind() {
        let lookup = SchemaVersion {
            id: 1,
            table: "regions".to_string(),
            is_lookup: true,
        };
        let pages = SchemaVersion {
            is_lookup: false,
            ..lookup.clone()
        };
        assert_eq!(Filter::for_schema(&lookup, "17"), Filter::RowId("17".to_string()));
        assert_eq!(Filter::for_schema(&pages, "17"), Filter::PageId("17".to_string()));
    }

    #[test]
    fn execute_filters_by_row_id() {
        let fixture = regions_fixture();
        let search = Search::for_table(&fixture.connection, "regions")
            .expect("search")
            .expect("schema exists")
            .add_column("name")
            .add_column("country")
            .add_filter(Filter::RowId("17".to_string()));

        let rows = search.execute().expect("execute");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].display_value(), "Bavaria");
        assert_eq!(rows[0][1].raw, vec![r#"["wiki:germany",0]"#]);
        assert_eq!(rows[0][1].display_value(), "wiki:germany");
    }

    #[test]
    fn execute_reads_multi_values_in_row_order() {
        let fixture = regions_fixture();
        let rows = Search::for_table(&fixture.connection, "regions")
            .expect("search")
            .expect("schema exists")
            .add_column("aliases")
            .add_filter(Filter::RowId("17".to_string()))
            .execute()
            .expect("execute");
        assert_eq!(rows[0][0].display_value(), "Freistaat, Bayern");
    }

    #[test]
    fn unknown_columns_and_schemas_yield_nothing() {
        let fixture = regions_fixture();
        assert!(
            Search::for_table(&fixture.connection, "missing")
                .expect("search")
                .is_none()
        );
        let rows = Search::for_table(&fixture.connection, "regions")
            .expect("search")
            .expect("schema exists")
            .add_column("population")
            .execute()
            .expect("execute");
        assert!(rows.is_empty());
    }

    #[test]
    fn display_value_handles_unmigrated_and_malformed_lookups() {
        let fixture = regions_fixture();
        fixture.insert_data("regions", "", 19, &[(1, "Styria"), (2, " 42")]);
        fixture.insert_data("regions", "", 20, &[(1, "Carinthia"), (2, r#"["",4.50]"#)]);
        fixture.insert_data("regions", "", 21, &[(1, "Salzburg"), (2, "wiki:austria")]);

        let displayed: Vec<String> = [19, 20, 21]
            .into_iter()
            .map(|rid| {
                let rows = Search::for_table(&fixture.connection, "regions")
                    .expect("search")
                    .expect("schema exists")
                    .add_column("country")
                    .add_filter(Filter::RowId(rid.to_string()))
                    .execute()
                    .expect("execute");
                rows[0][0].display_value()
            })
            .collect();
        assert_eq!(displayed, vec!["42", r#"["",4.50]"#, "wiki:austria"]);
    }

    #[test]
    fn execute_combines_filters() {
        let fixture = regions_fixture();
        let search = |pid: &str| {
            Search::for_table(&fixture.connection, "regions")
                .expect("search")
                .expect("schema exists")
                .add_column("name")
                .add_filter(Filter::RowId("17".to_string()))
                .add_filter(Filter::PageId(pid.to_string()))
                .execute()
                .expect("execute")
        };
        assert_eq!(search("").len(), 1);
        assert!(search("wiki:other").is_empty());
    }

    #[test]
    fn execute_skips_outdated_revisions() {
        let fixture = StructFixture::new();
        fixture.add_schema(1, "events", false, &[TypeSpec::new("Text", "title")]);
        fixture.insert_data("events", "wiki:a", 0, &[(1, "current")]);
        fixture
            .connection
            .execute(
                "INSERT INTO data_events (pid, rid, rev, latest, col1) VALUES ('wiki:a', 0, 1, 0, 'old')",
                [],
            )
            .expect("old revision");

        let rows = Search::for_table(&fixture.connection, "events")
            .expect("search")
            .expect("schema exists")
            .add_column("title")
            .add_filter(Filter::PageId("wiki:a".to_string()))
            .execute()
            .expect("execute");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].display_value(), "current");
    }
}
