//! Inert statement records handed to the engine by its front ends.
//!
//! The SQL text has already been parsed by the time anything here exists;
//! these types carry only the structure the executor needs. WHERE clauses
//! are a disjunction of conjunctions (OR of ANDs) evaluated as a post-filter
//! over candidate rows.

use crate::errors::Error;
use crate::storage::column::{Column, Value};
use crate::storage::row::Row;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Core statement variants the engine consumes.
#[derive(Debug, Clone)]
pub enum Statement {
    CreateTable(CreateTable),
    DropTable(DropTable),
    Insert(Insert),
    Select(Select),
    Update(Update),
    Delete(Delete),
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
}

#[derive(Debug, Clone)]
pub struct CreateTable {
    pub table: String,
    /// Ordered column definitions; order fixes the on-disk row layout.
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone)]
pub struct DropTable {
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct Insert {
    pub table: String,
    /// Columns the value tuples provide; columns absent here get NULL (or
    /// an autoincrement value for the primary key).
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Option<Value>>>,
}

/// Column selection of a `SELECT`.
#[derive(Debug, Clone, Default)]
pub enum Projection {
    #[default]
    All,
    Columns(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Select {
    pub table: String,
    pub projection: Projection,
    pub filter: Filter,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Select {
    pub fn all(table: &str) -> Self {
        Select {
            table: table.to_string(),
            projection: Projection::All,
            filter: Filter::default(),
            limit: None,
            offset: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Update {
    pub table: String,
    /// Field-to-value assignments.
    pub assignments: HashMap<String, Option<Value>>,
    pub filter: Filter,
}

#[derive(Debug, Clone)]
pub struct Delete {
    pub table: String,
    pub filter: Filter,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// Right-hand side of a condition: a literal or another column.
#[derive(Debug, Clone)]
pub enum Operand {
    Literal(Value),
    Field(String),
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub operand: Operand,
}

impl Condition {
    pub fn eq(field: &str, value: Value) -> Self {
        Condition {
            field: field.to_string(),
            op: CompareOp::Eq,
            operand: Operand::Literal(value),
        }
    }

    /// Evaluates this condition against a row. Comparisons involving NULL
    /// are false.
    pub fn matches(&self, columns: &[Column], row: &Row) -> Result<bool, Error> {
        let left = match row.value(columns, &self.field)? {
            None => return Ok(false),
            Some(value) => value,
        };
        let right = match &self.operand {
            Operand::Literal(value) => value,
            Operand::Field(name) => match row.value(columns, name)? {
                None => return Ok(false),
                Some(value) => value,
            },
        };
        Ok(self.op.holds(left.compare(right)?))
    }
}

/// OR of ANDs. An empty disjunction matches every row.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub disjunction: Vec<Vec<Condition>>,
}

impl Filter {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Filter {
            disjunction: vec![conditions],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.disjunction.is_empty()
    }

    pub fn matches(&self, columns: &[Column], row: &Row) -> Result<bool, Error> {
        if self.disjunction.is_empty() {
            return Ok(true);
        }
        for conjunction in &self.disjunction {
            let mut all = true;
            for condition in conjunction {
                if !condition.matches(columns, row)? {
                    all = false;
                    break;
                }
            }
            if all {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// When every branch of the disjunction pins `field` with an equality
    /// against a literal, returns those literals. This is what lets the
    /// planner swap a sequential scan for point lookups on the primary key.
    pub fn equality_literals(&self, field: &str) -> Option<Vec<Value>> {
        if self.disjunction.is_empty() {
            return None;
        }
        let mut literals = Vec::with_capacity(self.disjunction.len());
        for conjunction in &self.disjunction {
            let eq = conjunction.iter().find_map(|c| {
                if c.field == field && c.op == CompareOp::Eq {
                    match &c.operand {
                        Operand::Literal(value) => Some(value.clone()),
                        Operand::Field(_) => None,
                    }
                } else {
                    None
                }
            })?;
            literals.push(eq);
        }
        Some(literals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::column::ColumnKind;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("id", ColumnKind::Int8).primary_key(),
            Column::new("name", ColumnKind::Varchar(32)).nullable(),
            Column::new("age", ColumnKind::Int4).nullable(),
        ]
    }

    fn row(id: i64, name: Option<&str>, age: Option<i32>) -> Row {
        Row::new(
            id as u64,
            vec![
                Some(Value::Int8(id)),
                name.map(|n| Value::Text(n.into())),
                age.map(Value::Int4),
            ],
        )
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = Filter::default();
        assert!(filter.matches(&columns(), &row(1, None, None)).unwrap());
    }

    #[test]
    fn test_conjunction_and_disjunction() {
        let filter = Filter {
            disjunction: vec![
                vec![
                    Condition::eq("name", Value::Text("bob".into())),
                    Condition {
                        field: "age".into(),
                        op: CompareOp::Ge,
                        operand: Operand::Literal(Value::Int4(18)),
                    },
                ],
                vec![Condition::eq("id", Value::Int8(5))],
            ],
        };
        let cols = columns();
        assert!(filter.matches(&cols, &row(1, Some("bob"), Some(20))).unwrap());
        assert!(!filter.matches(&cols, &row(1, Some("bob"), Some(17))).unwrap());
        assert!(filter.matches(&cols, &row(5, Some("eve"), None)).unwrap());
        assert!(!filter.matches(&cols, &row(2, Some("eve"), Some(30))).unwrap());
    }

    #[test]
    fn test_null_comparisons_are_false() {
        let filter = Filter::and(vec![Condition {
            field: "age".into(),
            op: CompareOp::Ne,
            operand: Operand::Literal(Value::Int4(1)),
        }]);
        assert!(!filter.matches(&columns(), &row(1, None, None)).unwrap());
    }

    #[test]
    fn test_field_to_field_comparison() {
        let cols = vec![
            Column::new("a", ColumnKind::Int4),
            Column::new("b", ColumnKind::Int4),
        ];
        let filter = Filter::and(vec![Condition {
            field: "a".into(),
            op: CompareOp::Lt,
            operand: Operand::Field("b".into()),
        }]);
        let lt = Row::new(1, vec![Some(Value::Int4(1)), Some(Value::Int4(2))]);
        let ge = Row::new(2, vec![Some(Value::Int4(3)), Some(Value::Int4(2))]);
        assert!(filter.matches(&cols, &lt).unwrap());
        assert!(!filter.matches(&cols, &ge).unwrap());
    }

    #[test]
    fn test_unknown_field_is_an_error() {
        let filter = Filter::and(vec![Condition::eq("ghost", Value::Int4(1))]);
        assert!(matches!(
            filter.matches(&columns(), &row(1, None, None)),
            Err(Error::FieldUnknown(_))
        ));
    }

    #[test]
    fn test_equality_literals_extraction() {
        let filter = Filter {
            disjunction: vec![
                vec![
                    Condition::eq("id", Value::Int8(1)),
                    Condition::eq("name", Value::Text("a".into())),
                ],
                vec![Condition::eq("id", Value::Int8(2))],
            ],
        };
        assert_eq!(
            filter.equality_literals("id"),
            Some(vec![Value::Int8(1), Value::Int8(2)])
        );

        let partial = Filter {
            disjunction: vec![
                vec![Condition::eq("id", Value::Int8(1))],
                vec![Condition::eq("name", Value::Text("a".into()))],
            ],
        };
        assert_eq!(partial.equality_literals("id"), None);
        assert_eq!(Filter::default().equality_literals("id"), None);
    }
}
