//! Table definitions and the self-describing schema table.
//!
//! The catalog stores one row per object in the schema table rooted at
//! page 0: type 1 rows describe tables (their DDL and tree root), type 2
//! rows describe primary-key indexes (their root page). The stored `sql`
//! text is the canonical rendering produced by [`render_ddl`]; reading it
//! back goes through [`parse_ddl`], a fixed-format reader rather than a
//! SQL grammar.

use super::column::{Column, ColumnKind};
use super::page::IndexKeyKind;
use crate::errors::Error;
use once_cell::sync::Lazy;

pub const SCHEMA_TABLE_NAME: &str = "microsql_schema";

/// `type` column values in schema rows.
pub const SCHEMA_TYPE_TABLE: i32 = 1;
pub const SCHEMA_TYPE_INDEX: i32 = 2;

/// Cap on stored DDL text: a page minus the schema row's fixed overhead.
/// Anything above the inline threshold occupies the same pointer slot.
pub const SCHEMA_SQL_MAX: u32 = 3836;

/// Columns of the schema table itself. `root_page` is NULL while a CREATE
/// TABLE is still allocating the root.
pub static SCHEMA_COLUMNS: Lazy<Vec<Column>> = Lazy::new(|| {
    vec![
        Column::new("type", ColumnKind::Int4),
        Column::new("name", ColumnKind::Varchar(255)),
        Column::new("root_page", ColumnKind::Int4).nullable(),
        Column::new("sql", ColumnKind::Varchar(SCHEMA_SQL_MAX)),
    ]
});

/// Primary-key descriptor: which column, whether it autoincrements, and
/// where its index tree lives.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKey {
    pub column: usize,
    pub autoincrement: bool,
    pub index_root: u32,
    pub key_kind: IndexKeyKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<Column>,
    pub root_page: u32,
    pub primary_key: Option<PrimaryKey>,
}

impl TableDefinition {
    /// Builds a definition, deriving the primary-key descriptor (with an
    /// unset index root) from the column flags.
    pub fn new(name: &str, columns: Vec<Column>, root_page: u32) -> Result<Self, Error> {
        let mut primary_key = None;
        for (i, column) in columns.iter().enumerate() {
            if !column.primary_key {
                continue;
            }
            if primary_key.is_some() {
                return Err(err!(
                    UnrecognizedStatement,
                    "table '{}' declares more than one primary key",
                    name
                ));
            }
            primary_key = Some(PrimaryKey {
                column: i,
                autoincrement: column.autoincrement,
                index_root: 0,
                key_kind: key_kind_for(column)?,
            });
        }
        Ok(TableDefinition {
            name: name.to_string(),
            columns,
            root_page,
            primary_key,
        })
    }

    pub fn row_size(&self, max_inline: usize) -> usize {
        super::row::row_size(&self.columns, max_inline)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn ddl(&self) -> String {
        render_ddl(&self.name, &self.columns)
    }

    /// Name of the primary-key index object in the catalog.
    pub fn index_name(&self) -> String {
        format!("{}_pk", self.name)
    }

    pub fn index_ddl(&self) -> Result<String, Error> {
        let pk = self.primary_key.as_ref().ok_or_else(|| {
            err!(UnrecognizedStatement, "table '{}' has no primary key", self.name)
        })?;
        Ok(format!(
            "CREATE UNIQUE INDEX {} ON {} ({})",
            self.index_name(),
            self.name,
            self.columns[pk.column].name
        ))
    }
}

/// The built-in definition of the schema table (root fixed at page 0).
pub fn schema_table_definition() -> TableDefinition {
    TableDefinition {
        name: SCHEMA_TABLE_NAME.to_string(),
        columns: SCHEMA_COLUMNS.clone(),
        root_page: 0,
        primary_key: None,
    }
}

/// Index key kind for a primary-key column. TEXT has no fixed width, so it
/// cannot key an index.
pub fn key_kind_for(column: &Column) -> Result<IndexKeyKind, Error> {
    Ok(match column.kind {
        ColumnKind::Boolean => IndexKeyKind::I8,
        ColumnKind::Int4 => IndexKeyKind::I32,
        ColumnKind::Int8 => IndexKeyKind::I64,
        ColumnKind::Real => IndexKeyKind::F32,
        ColumnKind::Double => IndexKeyKind::F64,
        ColumnKind::Varchar(n) => IndexKeyKind::Str(n as usize),
        ColumnKind::Text => {
            return Err(err!(
                UnrecognizedStatement,
                "TEXT column '{}' cannot be a primary key",
                column.name
            ))
        }
    })
}

/// Canonical `CREATE TABLE` rendering stored in the schema table.
pub fn render_ddl(name: &str, columns: &[Column]) -> String {
    let rendered: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut s = format!("{} {}", c.name, c.kind);
            if c.primary_key {
                s.push_str(" PRIMARY KEY");
            }
            if c.autoincrement {
                s.push_str(" AUTOINCREMENT");
            }
            if c.nullable {
                s.push_str(" NULL");
            }
            s
        })
        .collect();
    format!("CREATE TABLE {} ({})", name, rendered.join(", "))
}

/// Reads a canonical `CREATE TABLE` back into a table name and columns.
pub fn parse_ddl(sql: &str) -> Result<(String, Vec<Column>), Error> {
    let rest = sql
        .strip_prefix("CREATE TABLE ")
        .ok_or_else(|| err!(CorruptPage, "stored DDL is not a CREATE TABLE: {}", sql))?;
    let open = rest
        .find('(')
        .ok_or_else(|| err!(CorruptPage, "stored DDL has no column list: {}", sql))?;
    let close = rest
        .rfind(')')
        .ok_or_else(|| err!(CorruptPage, "stored DDL has no closing paren: {}", sql))?;
    let name = rest[..open].trim().to_string();
    if name.is_empty() {
        return Err(err!(CorruptPage, "stored DDL has no table name: {}", sql));
    }

    let mut columns = Vec::new();
    for spec in rest[open + 1..close].split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let mut tokens = spec.split_whitespace();
        let col_name = tokens
            .next()
            .ok_or_else(|| err!(CorruptPage, "column spec '{}' has no name", spec))?;
        let kind_token = tokens
            .next()
            .ok_or_else(|| err!(CorruptPage, "column spec '{}' has no type", spec))?;
        let kind = parse_kind(kind_token)?;

        let mut column = Column::new(col_name, kind);
        let flags: Vec<&str> = tokens.collect();
        let mut i = 0;
        while i < flags.len() {
            match flags[i] {
                "PRIMARY" if flags.get(i + 1) == Some(&"KEY") => {
                    column.primary_key = true;
                    i += 2;
                }
                "AUTOINCREMENT" => {
                    column.autoincrement = true;
                    i += 1;
                }
                "NULL" => {
                    column.nullable = true;
                    i += 1;
                }
                other => {
                    return Err(err!(
                        CorruptPage,
                        "unknown flag '{}' in column spec '{}'",
                        other,
                        spec
                    ))
                }
            }
        }
        columns.push(column);
    }
    if columns.is_empty() {
        return Err(err!(CorruptPage, "stored DDL declares no columns: {}", sql));
    }
    Ok((name, columns))
}

/// Reads a canonical `CREATE UNIQUE INDEX` back into (index name, table
/// name, column name).
pub fn parse_index_ddl(sql: &str) -> Result<(String, String, String), Error> {
    let rest = sql
        .strip_prefix("CREATE UNIQUE INDEX ")
        .ok_or_else(|| err!(CorruptPage, "stored DDL is not a unique index: {}", sql))?;
    let on = rest
        .find(" ON ")
        .ok_or_else(|| err!(CorruptPage, "index DDL has no ON clause: {}", sql))?;
    let index_name = rest[..on].trim().to_string();
    let rest = &rest[on + 4..];
    let open = rest
        .find('(')
        .ok_or_else(|| err!(CorruptPage, "index DDL has no column: {}", sql))?;
    let close = rest
        .rfind(')')
        .ok_or_else(|| err!(CorruptPage, "index DDL has no closing paren: {}", sql))?;
    let table = rest[..open].trim().to_string();
    let column = rest[open + 1..close].trim().to_string();
    if index_name.is_empty() || table.is_empty() || column.is_empty() {
        return Err(err!(CorruptPage, "index DDL is incomplete: {}", sql));
    }
    Ok((index_name, table, column))
}

fn parse_kind(token: &str) -> Result<ColumnKind, Error> {
    if let Some(rest) = token.strip_prefix("VARCHAR(") {
        let n = rest
            .strip_suffix(')')
            .and_then(|s| s.parse::<u32>().ok())
            .ok_or_else(|| err!(CorruptPage, "bad VARCHAR length in '{}'", token))?;
        return Ok(ColumnKind::Varchar(n));
    }
    Ok(match token {
        "BOOLEAN" => ColumnKind::Boolean,
        "INT4" => ColumnKind::Int4,
        "INT8" => ColumnKind::Int8,
        "REAL" => ColumnKind::Real,
        "DOUBLE" => ColumnKind::Double,
        "TEXT" => ColumnKind::Text,
        other => return Err(err!(CorruptPage, "unknown column type '{}'", other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnKind::Int8).primary_key().autoincrement(),
            Column::new("email", ColumnKind::Varchar(255)).nullable(),
            Column::new("bio", ColumnKind::Text).nullable(),
            Column::new("score", ColumnKind::Double),
        ]
    }

    #[test]
    fn test_ddl_roundtrip() {
        let columns = sample_columns();
        let sql = render_ddl("users", &columns);
        assert_eq!(
            sql,
            "CREATE TABLE users (id INT8 PRIMARY KEY AUTOINCREMENT, \
             email VARCHAR(255) NULL, bio TEXT NULL, score DOUBLE)"
        );
        let (name, parsed) = parse_ddl(&sql).unwrap();
        assert_eq!(name, "users");
        assert_eq!(parsed, columns);
    }

    #[test]
    fn test_definition_derives_primary_key() {
        let def = TableDefinition::new("users", sample_columns(), 3).unwrap();
        assert_eq!(def.index_name(), "users_pk");
        let pk = def.primary_key.unwrap();
        assert_eq!(pk.column, 0);
        assert!(pk.autoincrement);
        assert_eq!(pk.key_kind, IndexKeyKind::I64);
    }

    #[test]
    fn test_two_primary_keys_rejected() {
        let columns = vec![
            Column::new("a", ColumnKind::Int4).primary_key(),
            Column::new("b", ColumnKind::Int4).primary_key(),
        ];
        assert!(TableDefinition::new("t", columns, 1).is_err());
    }

    #[test]
    fn test_text_primary_key_rejected() {
        let columns = vec![Column::new("a", ColumnKind::Text).primary_key()];
        assert!(TableDefinition::new("t", columns, 1).is_err());
    }

    #[test]
    fn test_schema_table_shape() {
        let def = schema_table_definition();
        assert_eq!(def.root_page, 0);
        assert!(def.primary_key.is_none());
        // type + name + root_page + sql as fixed slots.
        assert_eq!(def.row_size(255), 4 + 259 + 4 + 259);
    }

    #[test]
    fn test_index_ddl_roundtrip() {
        let def = TableDefinition::new("users", sample_columns(), 3).unwrap();
        let sql = def.index_ddl().unwrap();
        assert_eq!(sql, "CREATE UNIQUE INDEX users_pk ON users (id)");
        let (index_name, table, column) = parse_index_ddl(&sql).unwrap();
        assert_eq!(index_name, "users_pk");
        assert_eq!(table, "users");
        assert_eq!(column, "id");
    }

    #[test]
    fn test_malformed_ddl() {
        assert!(parse_ddl("DROP TABLE x").is_err());
        assert!(parse_ddl("CREATE TABLE x").is_err());
        assert!(parse_ddl("CREATE TABLE x ()").is_err());
        assert!(parse_ddl("CREATE TABLE x (a WIBBLE)").is_err());
        assert!(parse_ddl("CREATE TABLE x (a VARCHAR(abc))").is_err());
    }
}
