use crate::index::{Circle, Rect};
use crate::schema::Value;

pub mod bitmap;
pub mod eval;

pub use bitmap::Bitmap;

/// Operators of the binary condition nodes the parser produces.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    WithinRect,
    WithinCircle,
    Knn,
}

/// Tagged condition tree handed over by the SQL parser. Comparison nodes
/// are `Binary` with a column reference on one side and a literal on the
/// other; `BoolColumn` is the bare-boolean-column shorthand (`WHERE active`).
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Binary {
        op: BinaryOp,
        left: Box<Condition>,
        right: Box<Condition>,
    },
    Between {
        column: String,
        low: Value,
        high: Value,
    },
    Not(Box<Condition>),
    BoolColumn(String),
    Column(String),
    Literal(Value),
    RectLiteral(Rect),
    CircleLiteral(Circle),
    KnnLiteral { x: f32, y: f32, k: usize },
}

impl Condition {
    fn comparison(op: BinaryOp, column: &str, value: Value) -> Condition {
        Condition::Binary {
            op,
            left: Box::new(Condition::Column(column.to_string())),
            right: Box::new(Condition::Literal(value)),
        }
    }

    pub fn eq(column: &str, value: Value) -> Condition {
        Self::comparison(BinaryOp::Eq, column, value)
    }

    pub fn neq(column: &str, value: Value) -> Condition {
        Self::comparison(BinaryOp::Neq, column, value)
    }

    pub fn lt(column: &str, value: Value) -> Condition {
        Self::comparison(BinaryOp::Lt, column, value)
    }

    pub fn le(column: &str, value: Value) -> Condition {
        Self::comparison(BinaryOp::Le, column, value)
    }

    pub fn gt(column: &str, value: Value) -> Condition {
        Self::comparison(BinaryOp::Gt, column, value)
    }

    pub fn ge(column: &str, value: Value) -> Condition {
        Self::comparison(BinaryOp::Ge, column, value)
    }

    pub fn between(column: &str, low: Value, high: Value) -> Condition {
        Condition::Between {
            column: column.to_string(),
            low,
            high,
        }
    }

    pub fn within_rect(column: &str, rect: Rect) -> Condition {
        Condition::Binary {
            op: BinaryOp::WithinRect,
            left: Box::new(Condition::Column(column.to_string())),
            right: Box::new(Condition::RectLiteral(rect)),
        }
    }

    pub fn within_circle(column: &str, circle: Circle) -> Condition {
        Condition::Binary {
            op: BinaryOp::WithinCircle,
            left: Box::new(Condition::Column(column.to_string())),
            right: Box::new(Condition::CircleLiteral(circle)),
        }
    }

    pub fn knn(column: &str, x: f32, y: f32, k: usize) -> Condition {
        Condition::Binary {
            op: BinaryOp::Knn,
            left: Box::new(Condition::Column(column.to_string())),
            right: Box::new(Condition::KnnLiteral { x, y, k }),
        }
    }

    pub fn and(self, other: Condition) -> Condition {
        Condition::Binary {
            op: BinaryOp::And,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn or(self, other: Condition) -> Condition {
        Condition::Binary {
            op: BinaryOp::Or,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn not(self) -> Condition {
        Condition::Not(Box::new(self))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// One SELECT statement, already parsed.
#[derive(Clone, Debug)]
pub struct SelectQuery {
    pub table_name: String,
    pub condition: Option<Condition>,
    /// `None` selects every column in schema order.
    pub columns: Option<Vec<String>>,
    pub order_by: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    pub fn new(table_name: impl Into<String>) -> SelectQuery {
        SelectQuery {
            table_name: table_name.into(),
            condition: None,
            columns: None,
            order_by: None,
            limit: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> SelectQuery {
        self.condition = Some(condition);
        self
    }

    pub fn select_columns(mut self, columns: &[&str]) -> SelectQuery {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn order_by(mut self, column: &str, order: SortOrder) -> SelectQuery {
        self.order_by = Some((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> SelectQuery {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone, Debug)]
pub struct DeleteQuery {
    pub table_name: String,
    pub condition: Option<Condition>,
}

impl DeleteQuery {
    pub fn new(table_name: impl Into<String>) -> DeleteQuery {
        DeleteQuery {
            table_name: table_name.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> DeleteQuery {
        self.condition = Some(condition);
        self
    }
}

/// `{columns, records}` answer shape shared by SELECT and the HTTP surface.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub records: Vec<Vec<Value>>,
}
