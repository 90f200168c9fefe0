use std::io;

#[derive(thiserror::Error, Debug)]
pub enum RelLiteError {
    #[error("{0}")]
    IOError(#[from] io::Error),

    #[error("{0}")]
    MetadataError(#[from] serde_json::Error),

    #[error("{0}")]
    DirError(#[from] fs_extra::error::Error),

    #[error("{0}")]
    CsvError(#[from] csv::Error),

    #[error("table `{0}` already exists")]
    TableExists(String),

    #[error("table `{0}` doesn't exist")]
    TableMissing(String),

    #[error("column `{0}` doesn't exist")]
    ColumnMissing(String),

    #[error("index `{0}` doesn't exist")]
    IndexMissing(String),

    #[error("column `{0}` is already indexed")]
    ColumnAlreadyIndexed(String),

    #[error("multi-column indexes are not supported")]
    MultiColumnIndex,

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("column `{column}` expects {expected}, got {found}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: String,
    },

    #[error("value for column `{column}` exceeds VARCHAR({limit})")]
    VarcharOverflow { column: String, limit: usize },

    #[error("{index} index doesn't support {op}")]
    UnsupportedOperation {
        index: &'static str,
        op: &'static str,
    },

    #[error("record position {0} out of range")]
    PositionOutOfRange(u32),

    #[error("record at position {0} was already deleted")]
    DeletedSlot(u32),

    #[error("{0}")]
    Corrupted(String),
}

impl PartialEq for RelLiteError {
    fn eq(&self, other: &Self) -> bool {
        use RelLiteError::*;
        match (self, other) {
            (IOError(_), IOError(_))
            | (MetadataError(_), MetadataError(_))
            | (DirError(_), DirError(_))
            | (CsvError(_), CsvError(_))
            | (MultiColumnIndex, MultiColumnIndex) => true,
            (TableExists(a), TableExists(b))
            | (TableMissing(a), TableMissing(b))
            | (ColumnMissing(a), ColumnMissing(b))
            | (IndexMissing(a), IndexMissing(b))
            | (ColumnAlreadyIndexed(a), ColumnAlreadyIndexed(b))
            | (InvalidSchema(a), InvalidSchema(b))
            | (Corrupted(a), Corrupted(b)) => a == b,
            (TypeMismatch { column: c1, .. }, TypeMismatch { column: c2, .. }) => c1 == c2,
            (
                VarcharOverflow {
                    column: c1,
                    limit: l1,
                },
                VarcharOverflow {
                    column: c2,
                    limit: l2,
                },
            ) => c1 == c2 && l1 == l2,
            (
                UnsupportedOperation { index: i1, op: o1 },
                UnsupportedOperation { index: i2, op: o2 },
            ) => i1 == i2 && o1 == o2,
            (PositionOutOfRange(a), PositionOutOfRange(b)) | (DeletedSlot(a), DeletedSlot(b)) => {
                a == b
            }
            _ => false,
        }
    }
}
