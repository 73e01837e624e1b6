use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::{NoExpand, Regex};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::lookup::{ColumnType, LookupConfig, LookupKind, LookupValue};
use crate::search::{Filter, Search};
use crate::store::{SchemaVersion, find_column};

/// A struct-backed field of a submitted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructField {
    pub table: String,
    pub label: String,
    pub column_type: ColumnType,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormField {
    Struct(StructField),
    Other { label: String },
}

/// Named template patterns and their replacement values.
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    patterns: BTreeMap<String, Regex>,
    values: BTreeMap<String, String>,
}

impl Substitutions {
    pub fn insert(&mut self, key: String, pattern: Regex, value: String) {
        self.patterns.insert(key.clone(), pattern);
        self.values.insert(key, value);
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Regex, &str)> {
        self.patterns.iter().filter_map(|(key, pattern)| {
            self.values
                .get(key)
                .map(|value| (key.as_str(), pattern, value.as_str()))
        })
    }

    pub fn apply(&self, template: &str) -> String {
        let mut out = template.to_string();
        for (_, pattern, value) in self.iter() {
            out = pattern.replace_all(&out, NoExpand(value)).into_owned();
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemplateSaveEvent {
    pub fields: Vec<FormField>,
    pub substitutions: Substitutions,
}

impl TemplateSaveEvent {
    pub fn new(fields: Vec<FormField>) -> Self {
        Self {
            fields,
            substitutions: Substitutions::default(),
        }
    }
}

/// Build a form field for `table.label` from the store, or `None` if the column is unknown.
pub fn load_struct_field(
    connection: &Connection,
    table: &str,
    label: &str,
    value: &str,
) -> Result<Option<StructField>> {
    Ok(find_column(connection, table, label)?.map(|column| StructField {
        table: column.schema.table,
        label: column.label,
        column_type: column.column_type,
        value: value.to_string(),
    }))
}

pub fn narrow_by_key(table: &str, label: &str) -> String {
    format!("{table}.{label}.narrowBy")
}

/// Matches `@@key@@` or `##key##`.
pub fn narrow_by_pattern(key: &str) -> Result<Regex> {
    let escaped = regex::escape(key);
    Regex::new(&format!("(?:@@{escaped}@@|##{escaped}##)"))
        .with_context(|| format!("failed to compile substitution pattern for {key}"))
}

/// Add a `narrowBy` substitution for every NarrowingLookup field whose parent
/// row can be found. Fields without a match are skipped. Returns the number added.
pub fn resolve_narrowing_fields(
    connection: &Connection,
    event: &mut TemplateSaveEvent,
) -> Result<usize> {
    let mut added = 0;
    for field in &event.fields {
        let FormField::Struct(field) = field else {
            continue;
        };
        let ColumnType::Lookup {
            kind: LookupKind::NarrowingLookup,
            config,
        } = &field.column_type
        else {
            continue;
        };

        let Some(parent) = resolve_parent_value(connection, field, config)? else {
            debug!(table = %field.table, label = %field.label, "cannot determine parent");
            continue;
        };

        let key = narrow_by_key(&field.table, &field.label);
        let pattern = narrow_by_pattern(&key)?;
        event.substitutions.insert(key, pattern, parent);
        added += 1;
    }
    Ok(added)
}

fn resolve_parent_value(
    connection: &Connection,
    field: &StructField,
    config: &LookupConfig,
) -> Result<Option<String>> {
    let Some(narrow_by) = config.narrow_by() else {
        debug!(table = %field.table, label = %field.label, "narrowing lookup has no narrow by column");
        return Ok(None);
    };
    let Some(search) = Search::for_table(connection, &config.schema)? else {
        warn!(schema = %config.schema, label = %field.label, "narrowing lookup references unknown schema");
        return Ok(None);
    };
    let Some(key) = join_value(search.schema(), &field.value) else {
        return Ok(None);
    };

    let filter = Filter::for_schema(search.schema(), key);
    let rows = search
        .add_column(narrow_by)
        .add_filter(filter)
        .execute()
        .with_context(|| format!("failed to resolve parent of {}.{}", field.table, field.label))?;
    Ok(rows
        .first()
        .and_then(|row| row.first())
        .map(|value| value.display_value()))
}

// Raw values may already be composite; take the component matching the join key.
fn join_value(schema: &SchemaVersion, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with('[') {
        return Some(trimmed.to_string());
    }
    let value = LookupValue::parse(trimmed).ok()?;
    if schema.is_lookup {
        (value.row != 0).then(|| value.row.to_string())
    } else {
        value.is_page_reference().then_some(value.page)
    }
}
