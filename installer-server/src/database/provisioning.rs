// Database provisioning helpers (MySQL / MariaDB)
//
// - Database names are validated before they reach any SQL text
// - Identifiers are backtick-quoted with embedded backticks doubled
// - Lookups use bind parameters; only DDL (which cannot bind identifiers) uses quoting

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Longest schema name MySQL accepts.
pub const MAX_DB_NAME_LEN: usize = 64;

const RESERVED_SCHEMAS: [&str; 4] = ["mysql", "information_schema", "performance_schema", "sys"];

/// Result of the `CREATE DATABASE IF NOT EXISTS` sub-step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatabaseResult {
    /// False when the database already existed.
    pub created: bool,
    pub db_name: String,
}

/// Validate a database name (letters, digits, `_`, `$`; 1-64 chars; not all digits).
pub fn validate_db_name(name: &str) -> Result<(), String> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Database name is required.".to_string());
    }
    if name.chars().count() > MAX_DB_NAME_LEN {
        return Err(format!(
            "Database name must be {} characters or fewer.",
            MAX_DB_NAME_LEN
        ));
    }
    let re = Regex::new(r"^[A-Za-z0-9_$]+$")
        .map_err(|e| format!("Internal error: failed to compile name regex: {}", e))?;
    if !re.is_match(name) {
        return Err(
            "Database name may contain only letters, numbers, underscores and '$'.".to_string(),
        );
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return Err("Database name cannot consist only of digits.".to_string());
    }
    if RESERVED_SCHEMAS.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(format!("'{}' is a reserved database name.", name));
    }
    Ok(())
}

/// Backtick-quote a MySQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// `CREATE DATABASE IF NOT EXISTS` with the application's default charset.
pub fn create_db_stmt(db_name: &str) -> String {
    format!(
        "CREATE DATABASE IF NOT EXISTS {} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
        quote_ident(db_name)
    )
}

/// Existence probe; bind the database name as the single parameter.
pub fn db_exists_query() -> &'static str {
    "SELECT COUNT(*) FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?"
}
