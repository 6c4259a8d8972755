use std::collections::{BTreeMap, HashMap};

use serde_json::{Number, Value};

use crate::error::RowError;
use crate::regions::Region;
use crate::schema::{SchemaMapping, VarType, PLACE_COLUMN, STATE_COLUMN};

pub const STATE_WIDTH: usize = 2;
pub const PLACE_WIDTH: usize = 5;
pub const JOIN_KEY_LEN: usize = STATE_WIDTH + PLACE_WIDTH;

/// ACS annotation codes published in place of an estimate (suppressed,
/// not applicable, too few samples, open-ended median, ...).
const SENTINELS: &[&str] = &[
    "-111111111",
    "-222222222",
    "-333333333",
    "-555555555",
    "-666666666",
    "-888888888",
    "-999999999",
];

const NULL_TOKENS: &[&str] = &["", "NULL", "N/A", "NA"];

/// One place: 7-digit GEOID plus one value per declared output key.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRecord {
    pub join_key: String,
    pub values: BTreeMap<String, Value>,
}

pub fn normalize_row(
    row: &[Option<String>],
    columns: &HashMap<&str, usize>,
    schema: &SchemaMapping,
    region: &Region,
) -> Result<AttributeRecord, RowError> {
    let state = key_part(row, columns, STATE_COLUMN, STATE_WIDTH)?;
    if state != region.code() {
        return Err(RowError::RegionMismatch {
            expected: region.code().to_string(),
            got: state,
        });
    }
    let place = key_part(row, columns, PLACE_COLUMN, PLACE_WIDTH)?;
    let join_key = format!("{state}{place}");

    let values = schema
        .variables()
        .iter()
        .map(|v| {
            let raw = columns
                .get(v.external_code.as_str())
                .and_then(|&i| row.get(i))
                .and_then(|c| c.as_deref());
            (v.output_key.clone(), parse_value(raw, v.kind))
        })
        .collect();

    Ok(AttributeRecord { join_key, values })
}

/// Zero-padded numeric identifier part.
fn key_part(
    row: &[Option<String>],
    columns: &HashMap<&str, usize>,
    column: &'static str,
    width: usize,
) -> Result<String, RowError> {
    let raw = columns
        .get(column)
        .and_then(|&i| row.get(i))
        .and_then(|c| c.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(RowError::MissingKey(column))?;

    if raw.len() > width || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RowError::InvalidKey {
            column,
            value: raw.to_string(),
        });
    }
    Ok(format!("{:0>width$}", raw, width = width))
}

pub fn is_sentinel(s: &str) -> bool {
    SENTINELS.contains(&s)
        || NULL_TOKENS.iter().any(|t| s.eq_ignore_ascii_case(t))
        // "-666666666.0" and friends
        || s.strip_suffix(".0").is_some_and(|base| SENTINELS.contains(&base))
}

/// Coerce one raw cell. Suppressed or unparsable values become null.
pub fn parse_value(raw: Option<&str>, kind: VarType) -> Value {
    let s = match raw.map(str::trim) {
        Some(s) if !is_sentinel(s) => s,
        _ => return Value::Null,
    };

    match kind {
        VarType::Int => match s.parse::<i64>() {
            Ok(n) => Value::from(n),
            // Some estimates arrive as "123.0"
            Err(_) => s
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| Value::from(f.trunc() as i64))
                .unwrap_or(Value::Null),
        },
        VarType::Float => s
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        VarType::Text => Value::String(s.to_string()),
    }
}
