use rusqlite::Row;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Read a required column, mapping failures to `CorruptRow`.
pub fn get<T: rusqlite::types::FromSql>(
    row: &Row<'_>,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(column).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Read a nullable column.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &Row<'_>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get::<_, Option<T>>(column)
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: e.to_string(),
        })
}

/// Parse a JSON text column into a typed value.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a string column through `FromStr` (used for stored enums).
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unparseable value {raw:?}: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_reports_corrupt_rows() {
        let ok: Vec<u32> = parse_json("[1,2]", "events", "payload").unwrap();
        assert_eq!(ok, vec![1, 2]);

        let err = parse_json::<Vec<u32>>("not json", "events", "payload").unwrap_err();
        match err {
            StoreError::CorruptRow { table, column, .. } => {
                assert_eq!(table, "events");
                assert_eq!(column, "payload");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_enum_reports_value() {
        let err = parse_enum::<u32>("abc", "sessions", "status").unwrap_err();
        assert!(err.to_string().contains("abc"));
    }
}
