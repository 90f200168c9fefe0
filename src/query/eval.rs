use crate::error::RelLiteError;
use crate::heap::RecordFile;
use crate::index::SharedIndex;
use crate::query::{BinaryOp, Bitmap, Condition};
use crate::schema::{Column, DataType, IndexType, TableSchema, Value};
use crate::Result;
use std::cmp::Ordering;

/// Turns a condition tree into a bitmap over record positions: leaves
/// translate to index lookups (or heap scans for unindexed columns), inner
/// nodes compose with the bitmap algebra.
pub(crate) struct Evaluator<'a> {
    schema: &'a TableSchema,
    heap: &'a RecordFile,
    index_of: &'a dyn Fn(&Column) -> Result<SharedIndex>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(
        schema: &'a TableSchema,
        heap: &'a RecordFile,
        index_of: &'a dyn Fn(&Column) -> Result<SharedIndex>,
    ) -> Evaluator<'a> {
        Evaluator {
            schema,
            heap,
            index_of,
        }
    }

    pub(crate) fn eval(&self, condition: &Condition) -> Result<Bitmap> {
        match condition {
            Condition::Binary { op, left, right } => match op {
                BinaryOp::And => Ok(self.eval(left)?.and(&self.eval(right)?)),
                BinaryOp::Or => Ok(self.eval(left)?.or(&self.eval(right)?)),
                _ => self.eval_comparison(*op, left, right),
            },
            Condition::Not(inner) => Ok(self.eval(inner)?.not()),
            Condition::Between { column, low, high } => {
                let column = self.resolve(column)?;
                let low = self.coerce(column, low)?;
                let high = self.coerce(column, high)?;
                self.range_bitmap(column, Some(&low), Some(&high))
            }
            Condition::BoolColumn(name) => {
                let column = self.resolve(name)?;
                if column.data_type != DataType::Bool {
                    return Err(RelLiteError::TypeMismatch {
                        column: column.name.clone(),
                        expected: "BOOL",
                        found: column.data_type.name().to_string(),
                    });
                }
                self.equality_bitmap(column, &Value::Bool(true))
            }
            _ => Err(RelLiteError::Corrupted(
                "malformed condition tree: dangling operand".into(),
            )),
        }
    }

    fn eval_comparison(&self, op: BinaryOp, left: &Condition, right: &Condition) -> Result<Bitmap> {
        // the parser yields `col op literal`; accept the mirrored form too
        let (op, name, operand) = match (left, right) {
            (Condition::Column(name), operand) => (op, name, operand),
            (operand, Condition::Column(name)) => (Self::flip(op), name, operand),
            _ => {
                return Err(RelLiteError::Corrupted(
                    "malformed condition tree: comparison needs a column".into(),
                ))
            }
        };
        let column = self.resolve(name)?;

        match (op, operand) {
            (BinaryOp::WithinRect, Condition::RectLiteral(rect)) => {
                self.check_point(column)?;
                let index = (self.index_of)(column)?;
                let hits = index.lock().unwrap().search_rect(rect)?;
                Ok(Bitmap::from_positions(&hits))
            }
            (BinaryOp::WithinCircle, Condition::CircleLiteral(circle)) => {
                self.check_point(column)?;
                let index = (self.index_of)(column)?;
                let hits = index.lock().unwrap().search_circle(circle)?;
                Ok(Bitmap::from_positions(&hits))
            }
            (BinaryOp::Knn, Condition::KnnLiteral { x, y, k }) => {
                self.check_point(column)?;
                let index = (self.index_of)(column)?;
                let hits = index.lock().unwrap().knn(*x, *y, *k)?;
                Ok(Bitmap::from_positions(&hits))
            }
            (op, Condition::Literal(value)) => {
                let value = self.coerce(column, value)?;
                match op {
                    BinaryOp::Eq => self.equality_bitmap(column, &value),
                    BinaryOp::Neq => Ok(self.equality_bitmap(column, &value)?.not()),
                    BinaryOp::Le => self.range_bitmap(column, None, Some(&value)),
                    BinaryOp::Ge => self.range_bitmap(column, Some(&value), None),
                    BinaryOp::Lt => {
                        let le = self.range_bitmap(column, None, Some(&value))?;
                        Ok(le.difference(&self.equality_bitmap(column, &value)?))
                    }
                    BinaryOp::Gt => {
                        let ge = self.range_bitmap(column, Some(&value), None)?;
                        Ok(ge.difference(&self.equality_bitmap(column, &value)?))
                    }
                    _ => Err(RelLiteError::Corrupted(
                        "malformed condition tree: literal under a spatial operator".into(),
                    )),
                }
            }
            _ => Err(RelLiteError::Corrupted(
                "malformed condition tree: unexpected operand".into(),
            )),
        }
    }

    fn flip(op: BinaryOp) -> BinaryOp {
        match op {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::Le => BinaryOp::Ge,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::Ge => BinaryOp::Le,
            other => other,
        }
    }

    fn resolve(&self, name: &str) -> Result<&Column> {
        self.schema
            .column(name)
            .map(|(_, column)| column)
            .ok_or_else(|| RelLiteError::ColumnMissing(name.to_string()))
    }

    fn check_point(&self, column: &Column) -> Result<()> {
        if column.data_type != DataType::Point {
            return Err(RelLiteError::TypeMismatch {
                column: column.name.clone(),
                expected: "POINT",
                found: column.data_type.name().to_string(),
            });
        }
        Ok(())
    }

    fn coerce(&self, column: &Column, value: &Value) -> Result<Value> {
        value
            .coerce_to(column.data_type)
            .ok_or_else(|| RelLiteError::TypeMismatch {
                column: column.name.clone(),
                expected: column.data_type.name(),
                found: value.type_name().to_string(),
            })
    }

    fn equality_bitmap(&self, column: &Column, value: &Value) -> Result<Bitmap> {
        if column.index_type == IndexType::None {
            return self.scan_bitmap(column, |v| v.compare(value) == Ordering::Equal);
        }
        let index = (self.index_of)(column)?;
        let hits = index.lock().unwrap().search(value)?;
        Ok(Bitmap::from_positions(&hits))
    }

    fn range_bitmap(
        &self,
        column: &Column,
        lo: Option<&Value>,
        hi: Option<&Value>,
    ) -> Result<Bitmap> {
        if column.index_type == IndexType::None {
            return self.scan_bitmap(column, |v| {
                let above = lo.map_or(true, |lo| v.compare(lo) != Ordering::Less);
                let below = hi.map_or(true, |hi| v.compare(hi) != Ordering::Greater);
                above && below
            });
        }
        let index = (self.index_of)(column)?;
        let hits = index.lock().unwrap().range_search(lo, hi)?;
        Ok(Bitmap::from_positions(&hits))
    }

    /// Predicate fallback for unindexed columns: one pass over the live heap.
    fn scan_bitmap(&self, column: &Column, pred: impl Fn(&Value) -> bool) -> Result<Bitmap> {
        let col_idx = self
            .schema
            .column(&column.name)
            .map(|(i, _)| i)
            .ok_or_else(|| RelLiteError::ColumnMissing(column.name.clone()))?;
        let mut positions = Vec::new();
        for item in self.heap.scan()? {
            let (pos, values) = item?;
            if pred(&values[col_idx]) {
                positions.push(pos);
            }
        }
        Ok(Bitmap::from_positions(&positions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::index::open_column_index;
    use crate::schema::TableSchemaBuilder;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn schema() -> TableSchema {
        TableSchemaBuilder::new("t")
            .column("id", DataType::Int, |c| {
                c.is_primary = true;
                c.index_type = IndexType::Btree;
            })
            .column("name", DataType::Varchar, |c| c.varchar_length = 10)
            .build()
    }

    fn populate(dir: &TempDir) -> (TableSchema, Catalog, RecordFile) {
        let schema = schema();
        let catalog = Catalog::new(dir.path());
        std::fs::create_dir_all(catalog.table_dir("t")).unwrap();
        let heap = RecordFile::open(catalog.heap_path("t"), schema.clone()).unwrap();
        let mut id_index =
            open_column_index(&catalog, &schema, &schema.columns[0]).unwrap();
        for (id, name) in [(3, "c"), (1, "a"), (4, "d"), (2, "b")] {
            let pos = heap
                .append(&[Value::Int(id), Value::Varchar(name.into())])
                .unwrap();
            id_index.insert(pos, &Value::Int(id)).unwrap();
        }
        (schema, catalog, heap)
    }

    fn eval(condition: &Condition) -> Result<Vec<u32>> {
        let dir = TempDir::new().unwrap();
        let (schema, catalog, heap) = populate(&dir);
        let provider = |column: &Column| -> Result<SharedIndex> {
            Ok(Arc::new(Mutex::new(open_column_index(
                &catalog, &schema, column,
            )?)))
        };
        let evaluator = Evaluator::new(&schema, &heap, &provider);
        let bitmap = evaluator.eval(condition)?;
        Ok(bitmap.to_positions(heap.max_position()?))
    }

    #[test]
    fn test_indexed_equality_and_not() {
        // ids 3,1,4,2 live at positions 0..4
        assert_eq!(eval(&Condition::eq("id", Value::Int(4))).unwrap(), vec![2]);
        assert_eq!(
            eval(&Condition::neq("id", Value::Int(4))).unwrap(),
            vec![0, 1, 3]
        );
    }

    #[test]
    fn test_ranges_exclude_bounds() {
        assert_eq!(
            eval(&Condition::lt("id", Value::Int(3))).unwrap(),
            vec![1, 3]
        );
        assert_eq!(
            eval(&Condition::ge("id", Value::Int(3))).unwrap(),
            vec![0, 2]
        );
        assert_eq!(
            eval(&Condition::between("id", Value::Int(2), Value::Int(3))).unwrap(),
            vec![0, 3]
        );
    }

    #[test]
    fn test_boolean_composition() {
        let cond = Condition::gt("id", Value::Int(1)).and(Condition::lt("id", Value::Int(4)));
        assert_eq!(eval(&cond).unwrap(), vec![0, 3]);

        let cond = Condition::eq("id", Value::Int(1)).or(Condition::eq("id", Value::Int(4)));
        assert_eq!(eval(&cond).unwrap(), vec![1, 2]);

        let cond = Condition::eq("id", Value::Int(1)).not();
        assert_eq!(eval(&cond).unwrap(), vec![0, 2, 3]);
    }

    #[test]
    fn test_unindexed_column_scans() {
        assert_eq!(
            eval(&Condition::eq("name", Value::Varchar("b".into()))).unwrap(),
            vec![3]
        );
        assert_eq!(
            eval(&Condition::gt("name", Value::Varchar("b".into()))).unwrap(),
            vec![0, 2]
        );
    }

    #[test]
    fn test_unknown_column_and_type_mismatch() {
        assert!(matches!(
            eval(&Condition::eq("ghost", Value::Int(1))),
            Err(RelLiteError::ColumnMissing(_))
        ));
        assert!(matches!(
            eval(&Condition::eq("id", Value::Varchar("x".into()))),
            Err(RelLiteError::TypeMismatch { .. })
        ));
    }
}
