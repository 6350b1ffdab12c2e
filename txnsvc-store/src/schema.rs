//! Record table definition and startup initialization modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the table holding transaction records.
pub const TABLE_NAME: &str = "accounts";

pub(crate) const DROP_TABLE: &str = "DROP TABLE IF EXISTS accounts";

pub(crate) const CREATE_TABLE: &str =
    "CREATE TABLE accounts (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), balance INT8 NOT NULL)";

pub(crate) const CREATE_TABLE_IF_MISSING: &str = "CREATE TABLE IF NOT EXISTS accounts \
     (id UUID PRIMARY KEY DEFAULT gen_random_uuid(), balance INT8 NOT NULL)";

/// How the record table is prepared at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// Create the table only if it does not exist. Existing rows survive.
    #[default]
    Ensure,
    /// Drop the table and create it empty. Every existing row is lost.
    Reset,
}

impl SchemaMode {
    /// Returns the statements to run, in order, inside one transaction.
    pub fn statements(&self) -> &'static [&'static str] {
        match self {
            SchemaMode::Ensure => &[CREATE_TABLE_IF_MISSING],
            SchemaMode::Reset => &[DROP_TABLE, CREATE_TABLE],
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(self, SchemaMode::Reset)
    }
}

impl fmt::Display for SchemaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaMode::Ensure => f.write_str("ensure"),
            SchemaMode::Reset => f.write_str("reset"),
        }
    }
}

impl FromStr for SchemaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ensure" => Ok(SchemaMode::Ensure),
            "reset" => Ok(SchemaMode::Reset),
            other => Err(format!("unknown schema mode '{}'", other)),
        }
    }
}
