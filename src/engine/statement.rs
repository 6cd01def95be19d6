//! Statement surface consumed by the engine.
//!
//! The SQL front end (an external collaborator) hands the engine one of
//! these already-structured statements; nothing here parses text.
//! Predicates are a conjunction of simple comparisons; disjunction and
//! `IN`/`BETWEEN` are outside the kernel contract.

use crate::catalog::Column;
use crate::common::{Row, Value};
use crate::vacuum::VacuumStats;

/// Comparison operators available in predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// One `column <op> value` comparison.
#[derive(Debug, Clone)]
pub struct Condition {
    pub column: String,
    pub op: ComparisonOp,
    pub value: Value,
}

impl Condition {
    pub fn new(column: impl Into<String>, op: ComparisonOp, value: Value) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    /// Evaluates the condition against a row. Comparisons involving NULL
    /// or incomparable types never match.
    pub fn matches(&self, row: &Row) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };
        let Some(ordering) = actual.compare(&self.value) else {
            return false;
        };
        match self.op {
            ComparisonOp::Eq => ordering.is_eq(),
            ComparisonOp::NotEq => ordering.is_ne(),
            ComparisonOp::Lt => ordering.is_lt(),
            ComparisonOp::LtEq => ordering.is_le(),
            ComparisonOp::Gt => ordering.is_gt(),
            ComparisonOp::GtEq => ordering.is_ge(),
        }
    }
}

/// A conjunction of conditions. An empty predicate matches every row.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    pub conditions: Vec<Condition>,
}

impl Predicate {
    /// Matches every row.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with(condition: Condition) -> Self {
        Self {
            conditions: vec![condition],
        }
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

/// One `SET column = value` in an UPDATE.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub column: String,
    pub value: Value,
}

impl Assignment {
    pub fn new(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// A structured statement, as produced by the parser collaborator.
#[derive(Debug, Clone)]
pub enum Statement {
    CreateDatabase { name: String },
    DropDatabase { name: String },
    UseDatabase { name: String },
    CreateTable { name: String, columns: Vec<Column> },
    DropTable { name: String },
    AlterTableAddColumn { table: String, column: Column },
    Insert { table: String, row: Row },
    Select { table: String, predicate: Predicate },
    Update {
        table: String,
        assignments: Vec<Assignment>,
        predicate: Predicate,
    },
    Delete { table: String, predicate: Predicate },
    Begin,
    Commit,
    Rollback,
    Vacuum { table: Option<String> },
}

/// What a statement produced.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// SELECT output, in heap order.
    Rows(Vec<Row>),
    /// Rows touched by INSERT/UPDATE/DELETE.
    Affected(usize),
    /// Vacuum counters.
    Vacuum(VacuumStats),
    /// DDL and transaction-control acknowledgement.
    Ok,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, name: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::Integer(id));
        row.insert("name".to_string(), Value::String(name.to_string()));
        row
    }

    #[test]
    fn test_condition_operators() {
        let r = row(5, "eve");
        assert!(Condition::new("id", ComparisonOp::Eq, Value::Integer(5)).matches(&r));
        assert!(Condition::new("id", ComparisonOp::NotEq, Value::Integer(6)).matches(&r));
        assert!(Condition::new("id", ComparisonOp::Lt, Value::Integer(6)).matches(&r));
        assert!(Condition::new("id", ComparisonOp::GtEq, Value::Integer(5)).matches(&r));
        assert!(!Condition::new("id", ComparisonOp::Gt, Value::Integer(5)).matches(&r));
        assert!(
            Condition::new("name", ComparisonOp::Eq, Value::String("eve".into())).matches(&r)
        );
    }

    #[test]
    fn test_null_never_matches() {
        let mut r = row(1, "x");
        r.insert("age".to_string(), Value::Null);
        assert!(!Condition::new("age", ComparisonOp::Eq, Value::Null).matches(&r));
        assert!(!Condition::new("age", ComparisonOp::NotEq, Value::Integer(3)).matches(&r));
        assert!(!Condition::new("missing", ComparisonOp::Eq, Value::Integer(1)).matches(&r));
    }

    #[test]
    fn test_predicate_conjunction() {
        let r = row(5, "eve");
        let p = Predicate::with(Condition::new("id", ComparisonOp::GtEq, Value::Integer(1)))
            .and(Condition::new(
                "name",
                ComparisonOp::Eq,
                Value::String("eve".into()),
            ));
        assert!(p.matches(&r));

        let p = p.and(Condition::new("id", ComparisonOp::Lt, Value::Integer(5)));
        assert!(!p.matches(&r));
    }

    #[test]
    fn test_empty_predicate_matches_all() {
        assert!(Predicate::all().matches(&row(1, "a")));
    }

    #[test]
    fn test_numeric_cross_type_comparison() {
        let mut r = Row::new();
        r.insert("score".to_string(), Value::Float(2.5));
        assert!(Condition::new("score", ComparisonOp::Gt, Value::Integer(2)).matches(&r));
    }
}
