//! Persisted Calculations
//!
//! A model is saved as an ordered list of lines of the form
//! `<name> = <expr> #ENABLED:<0|1>` plus a sparse map from row index to
//! column attributes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;

const NAME_SEPARATOR: char = '=';
const ENABLED_MARKER: &str = "#ENABLED:";

/// Attributes attached to one column, in insertion order.
pub type Attributes = Vec<(String, serde_json::Value)>;

/// Saved state of a model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalcRecords {
    pub calcs: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<usize, Attributes>,
}

impl CalcRecords {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse every line, normalising legacy names.
    pub fn parse(&self) -> Result<Vec<CalcRecord>, RecordError> {
        self.calcs
            .iter()
            .enumerate()
            .map(|(index, line)| CalcRecord::parse(index, line))
            .collect()
    }
}

/// One parsed calculation line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalcRecord {
    pub name: String,
    pub expr: String,
    pub enabled: bool,
}

impl CalcRecord {
    pub fn new(name: impl Into<String>, expr: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            expr: expr.into(),
            enabled,
        }
    }

    /// Parse a saved line. A missing `#ENABLED:` suffix means enabled.
    ///
    /// Only the single spaces written around the separator and before the
    /// marker are stripped, so whitespace inside names and expressions
    /// survives a save. Legacy lines without that padding are trimmed.
    pub fn parse(index: usize, line: &str) -> Result<Self, RecordError> {
        let Some((name, rest)) = line.split_once(NAME_SEPARATOR) else {
            return Err(RecordError::MissingSeparator {
                index,
                line: line.to_string(),
            });
        };
        let (expr, enabled) = match rest.rsplit_once(ENABLED_MARKER) {
            Some((expr, flag)) => (expr, flag.trim() == "1"),
            None => (rest, true),
        };
        let name = name.strip_suffix(' ').unwrap_or_else(|| name.trim());
        let expr = expr.strip_prefix(' ').unwrap_or_else(|| expr.trim_start());
        let expr = expr.strip_suffix(' ').unwrap_or_else(|| expr.trim_end());
        Ok(Self::new(trim_name(name), expr, enabled))
    }
}

impl fmt::Display for CalcRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}{}",
            self.name,
            NAME_SEPARATOR,
            self.expr,
            ENABLED_MARKER,
            u8::from(self.enabled)
        )
    }
}

/// Strip the legacy `res.col(<name>)` and `${<name>}` wrappers.
pub fn trim_name(name: &str) -> &str {
    let name = name
        .strip_prefix("res.col(")
        .and_then(|n| n.strip_suffix(')'))
        .unwrap_or(name);
    name.strip_prefix("${")
        .and_then(|n| n.strip_suffix('}'))
        .unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_enabled_flag() {
        let record = CalcRecord::parse(0, "total = res['a'] + 1 #ENABLED:0").unwrap();
        assert_eq!(record, CalcRecord::new("total", "res['a'] + 1", false));

        let legacy = CalcRecord::parse(0, "total = 1").unwrap();
        assert!(legacy.enabled);
    }

    #[test]
    fn expression_may_contain_separator() {
        let record = CalcRecord::parse(0, "eq = arg['x'] == 1 #ENABLED:1").unwrap();
        assert_eq!(record.name, "eq");
        assert_eq!(record.expr, "arg['x'] == 1");
    }

    #[test]
    fn rejects_line_without_separator() {
        assert_eq!(
            CalcRecord::parse(3, "nothing here"),
            Err(RecordError::MissingSeparator {
                index: 3,
                line: "nothing here".into()
            })
        );
    }

    #[test]
    fn whitespace_inside_fields_survives() {
        for record in [
            CalcRecord::new("c ", "1", true),
            CalcRecord::new("d", "res['a']\n  + 1\n", false),
            CalcRecord::new("e", "  2", true),
            CalcRecord::new("f", "", true),
        ] {
            assert_eq!(CalcRecord::parse(0, &record.to_string()).unwrap(), record);
        }
    }

    #[test]
    fn unpadded_legacy_lines_are_trimmed() {
        assert_eq!(
            CalcRecord::parse(0, "a=res['b']+1").unwrap(),
            CalcRecord::new("a", "res['b']+1", true)
        );
        assert_eq!(
            CalcRecord::parse(0, "a=1#ENABLED:0").unwrap(),
            CalcRecord::new("a", "1", false)
        );
    }

    #[test]
    fn legacy_names_are_trimmed() {
        assert_eq!(trim_name("res.col(a)"), "a");
        assert_eq!(trim_name("${b}"), "b");
        assert_eq!(trim_name("${c"), "${c");
        assert_eq!(
            CalcRecord::parse(0, "${x} = 2").unwrap().name,
            "x"
        );
    }

    #[test]
    fn display_matches_saved_form() {
        let record = CalcRecord::new("a", "1 + 2", true);
        assert_eq!(record.to_string(), "a = 1 + 2 #ENABLED:1");
        assert_eq!(CalcRecord::parse(0, &record.to_string()).unwrap(), record);
    }

    #[test]
    fn records_survive_json() {
        let mut records = CalcRecords {
            calcs: vec!["a = 1 #ENABLED:1".into()],
            ..Default::default()
        };
        records
            .attributes
            .insert(0, vec![("unit".into(), json!("m"))]);

        let json = records.to_json().unwrap();
        assert_eq!(CalcRecords::from_json(&json).unwrap(), records);
    }
}
