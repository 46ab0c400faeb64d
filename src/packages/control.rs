// src/packages/control.rs

//! Debian control stanza parsing
//!
//! A control file is a single RFC-822 style paragraph: `Field: value` lines,
//! with continuation lines starting with a space or tab.

use crate::error::{Error, Result};

/// Ordered fields of one control stanza
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlFields {
    fields: Vec<(String, String)>,
}

impl ControlFields {
    /// Parse the first paragraph of a control file
    pub fn parse(content: &str) -> Result<Self> {
        let mut fields: Vec<(String, String)> = Vec::new();

        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                if fields.is_empty() {
                    continue;
                }
                break;
            }

            // Multi-line fields start with a space
            if line.starts_with(' ') || line.starts_with('\t') {
                let (_, value) = fields.last_mut().ok_or_else(|| {
                    Error::ParseError(format!(
                        "control line {}: continuation line before any field",
                        lineno + 1
                    ))
                })?;
                value.push('\n');
                value.push_str(line[1..].trim_end());
            } else if let Some((field, value)) = line.split_once(':') {
                let field = field.trim();
                if field.is_empty() {
                    return Err(Error::ParseError(format!(
                        "control line {}: empty field name",
                        lineno + 1
                    )));
                }
                fields.push((field.to_string(), value.trim().to_string()));
            } else {
                return Err(Error::ParseError(format!(
                    "control line {}: expected `Field: value`, got {:?}",
                    lineno + 1,
                    line
                )));
            }
        }

        Ok(Self { fields })
    }

    /// Look up a field, ignoring case as dpkg does
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Serialize as a JSON object of field → value
    pub fn to_json(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::Value::Object(map).to_string()
    }
}
