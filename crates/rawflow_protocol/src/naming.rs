//! Raw table naming rules.
//!
//! Raw tables are namespaced by source system and entity: `<source>_api_<entity>`
//! (e.g. `tapd_api_worklogs`). The table name is part of the collection identity
//! and is also used to derive the physical storage table, so it must be a safe
//! SQL identifier.

use std::fmt;

/// Prefix of the physical table backing a raw table.
pub const RAW_TABLE_PREFIX: &str = "_raw_";

const API_INFIX: &str = "_api_";
const MAX_TABLE_NAME_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTableName {
    pub name: String,
    pub reason: &'static str,
}

impl fmt::Display for InvalidTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid raw table name '{}': {}", self.name, self.reason)
    }
}

impl std::error::Error for InvalidTableName {}

/// Returns true if the name only uses lowercase ASCII, digits and underscores.
pub fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Build the conventional raw table name for a source/entity pair.
pub fn raw_table_name(source: &str, entity: &str) -> String {
    format!("{}{}{}", source, API_INFIX, entity)
}

/// Validate a raw table name against the naming convention.
pub fn validate_raw_table_name(name: &str) -> Result<(), InvalidTableName> {
    let invalid = |reason| InvalidTableName {
        name: name.to_string(),
        reason,
    };

    if name.len() > MAX_TABLE_NAME_LEN {
        return Err(invalid("longer than 64 characters"));
    }
    if !is_safe_identifier(name) {
        return Err(invalid("only lowercase ascii, digits and '_' are allowed"));
    }
    match name.find(API_INFIX) {
        Some(idx) if idx > 0 && idx + API_INFIX.len() < name.len() => Ok(()),
        _ => Err(invalid("expected <source>_api_<entity>")),
    }
}

/// Physical table backing a raw table.
pub fn physical_raw_table(name: &str) -> Result<String, InvalidTableName> {
    validate_raw_table_name(name)?;
    Ok(format!("{}{}", RAW_TABLE_PREFIX, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conventional_names_validate() {
        let name = raw_table_name("tapd", "worklogs");
        assert_eq!(name, "tapd_api_worklogs");
        assert!(validate_raw_table_name(&name).is_ok());
        assert_eq!(physical_raw_table(&name).unwrap(), "_raw_tapd_api_worklogs");
    }

    #[test]
    fn missing_source_or_entity_rejected() {
        assert!(validate_raw_table_name("_api_worklogs").is_err());
        assert!(validate_raw_table_name("tapd_api_").is_err());
        assert!(validate_raw_table_name("tapd_worklogs").is_err());
    }

    #[test]
    fn unsafe_identifiers_rejected() {
        assert!(validate_raw_table_name("Tapd_api_worklogs").is_err());
        assert!(validate_raw_table_name("tapd_api_work logs").is_err());
        assert!(validate_raw_table_name("tapd_api_x; DROP TABLE y").is_err());
        assert!(validate_raw_table_name("").is_err());
    }
}
