use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Host type registry: class name -> fully qualified type identifier.
pub type TypeRegistry = BTreeMap<String, String>;

const TYPE_NAMESPACE: &str = "dokuwiki\\plugin\\structcombolookup\\types\\";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LookupKind {
    ComboLookup,
    NarrowingLookup,
}

impl LookupKind {
    pub const ALL: [LookupKind; 2] = [LookupKind::ComboLookup, LookupKind::NarrowingLookup];

    pub fn from_class(class: &str) -> Option<Self> {
        match class {
            "ComboLookup" => Some(Self::ComboLookup),
            "NarrowingLookup" => Some(Self::NarrowingLookup),
            _ => None,
        }
    }

    pub fn class_name(self) -> &'static str {
        match self {
            Self::ComboLookup => "ComboLookup",
            Self::NarrowingLookup => "NarrowingLookup",
        }
    }

    pub fn type_identifier(self) -> String {
        format!("{TYPE_NAMESPACE}{}", self.class_name())
    }
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// Type configuration stored as JSON in `types.config`.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LookupConfig {
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default, rename = "narrow by")]
    pub narrow_by: Option<String>,
}

impl LookupConfig {
    /// The configured narrow-by column, ignoring blank values.
    pub fn narrow_by(&self) -> Option<&str> {
        self.narrow_by
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Lookup {
        kind: LookupKind,
        config: LookupConfig,
    },
    Other {
        class: String,
    },
}

impl ColumnType {
    /// Build a column type from the host's `types.class` and `types.config`.
    pub fn from_class(class: &str, config_json: Option<&str>) -> Result<Self> {
        let Some(kind) = LookupKind::from_class(class) else {
            return Ok(Self::Other {
                class: class.to_string(),
            });
        };
        let config = match config_json.map(str::trim) {
            None | Some("") => LookupConfig::default(),
            Some(raw) => serde_json::from_str(raw)
                .with_context(|| format!("failed to parse {class} type config: {raw}"))?,
        };
        Ok(Self::Lookup { kind, config })
    }

    pub fn class_name(&self) -> &str {
        match self {
            Self::Lookup { kind, .. } => kind.class_name(),
            Self::Other { class } => class,
        }
    }

    pub fn lookup_kind(&self) -> Option<LookupKind> {
        match self {
            Self::Lookup { kind, .. } => Some(*kind),
            Self::Other { .. } => None,
        }
    }
}

/// Composite lookup value `[page, row]`; `row` is 0 for page references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupValue {
    pub page: String,
    pub row: i64,
}

impl LookupValue {
    pub fn page(page: impl Into<String>) -> Self {
        Self {
            page: page.into(),
            row: 0,
        }
    }

    pub fn row(row: i64) -> Self {
        Self {
            page: String::new(),
            row,
        }
    }

    /// Parse the composite JSON encoding.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw.trim())
            .with_context(|| format!("failed to parse composite lookup value: {raw}"))?;
        let Value::Array(items) = value else {
            bail!("composite lookup value must be a two-element array: {raw}");
        };
        let [page, row] = items.as_slice() else {
            bail!("composite lookup value must be a two-element array: {raw}");
        };
        let page = match page {
            Value::String(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            Value::Null => String::new(),
            other => bail!("unsupported page reference in lookup value: {other}"),
        };
        let row = match row {
            Value::Number(number) => match number.as_i64() {
                Some(row) => row,
                None => number
                    .as_f64()
                    .and_then(integral_row)
                    .with_context(|| format!("row reference is not an integer: {number}"))?,
            },
            Value::String(text) if text.is_empty() => 0,
            Value::String(text) => text
                .trim()
                .parse::<i64>()
                .with_context(|| format!("row reference is not an integer: {text}"))?,
            Value::Null => 0,
            other => bail!("unsupported row reference in lookup value: {other}"),
        };
        Ok(Self { page, row })
    }

    /// Accept either the composite encoding or a legacy bare value. Bare values
    /// are classified like the migration does: numeric text is a row reference.
    /// Numeric text that is not a whole number yields `None`.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('[') {
            return Self::parse(trimmed).ok();
        }
        if !is_numeric_text(trimmed) {
            return Some(Self::page(trimmed));
        }
        match trimmed.parse::<i64>() {
            Ok(row) => Some(Self::row(row)),
            Err(_) => trimmed.parse::<f64>().ok().and_then(integral_row).map(Self::row),
        }
    }

    pub fn is_page_reference(&self) -> bool {
        !self.page.is_empty()
    }

    pub fn display(&self) -> String {
        if self.is_page_reference() {
            self.page.clone()
        } else {
            self.row.to_string()
        }
    }
}

/// Text SQLite turns into a number under NUMERIC affinity: optional sign,
/// digits with an optional fraction, optional exponent.
fn is_numeric_text(text: &str) -> bool {
    let text = text.trim();
    let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(at) => (&unsigned[..at], Some(&unsigned[at + 1..])),
        None => (unsigned, None),
    };
    let all_digits = |part: &str| part.bytes().all(|byte| byte.is_ascii_digit());
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if (whole.is_empty() && fraction.is_empty()) || !all_digits(whole) || !all_digits(fraction) {
        return false;
    }
    match exponent {
        None => true,
        Some(exponent) => {
            let digits = exponent.strip_prefix(['+', '-']).unwrap_or(exponent);
            !digits.is_empty() && all_digits(digits)
        }
    }
}

fn integral_row(value: f64) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
    let in_range = value >= i64::MIN as f64 && value < i64::MAX as f64;
    (value.fract() == 0.0 && in_range).then_some(value as i64)
}

pub fn register_type_classes(registry: &mut TypeRegistry) {
    for kind in LookupKind::ALL {
        registry.insert(kind.class_name().to_string(), kind.type_identifier());
    }
}
