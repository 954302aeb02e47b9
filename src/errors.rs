use std::fmt;

/// Builds an [`Error`](crate::errors::Error) variant from a format string.
///
/// ```ignore
/// return Err(err!(CorruptPage, "page {} too short", idx));
/// ```
macro_rules! err {
    ($kind:ident, $($arg:tt)*) => {
        $crate::errors::Error::$kind(format!($($arg)*))
    };
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    TableAlreadyExists(String),
    TableDoesNotExist(String),
    UnrecognizedStatement(String),
    SystemTableProtected(String),
    DuplicateKey(String),
    NullInNonNullable(String),
    FieldUnknown(String),
    InvalidUtf8(String),
    RowTooLarge(String),
    ColumnCountTooLarge(String),
    CorruptPage(String),
    InvalidNodeKind(String),
    KeyNotFound(String),
    /// Terminal marker for row iteration, not an abnormal error.
    NoMoreRows,
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error. {}", e),
            Error::TableAlreadyExists(msg) => write!(f, "Table already exists. {}", msg),
            Error::TableDoesNotExist(msg) => write!(f, "Table does not exist. {}", msg),
            Error::UnrecognizedStatement(msg) => write!(f, "Unrecognized statement. {}", msg),
            Error::SystemTableProtected(msg) => write!(f, "System table is protected. {}", msg),
            Error::DuplicateKey(msg) => write!(f, "Duplicate key. {}", msg),
            Error::NullInNonNullable(msg) => write!(f, "NULL in non-nullable column. {}", msg),
            Error::FieldUnknown(msg) => write!(f, "Unknown field. {}", msg),
            Error::InvalidUtf8(msg) => write!(f, "Invalid UTF-8. {}", msg),
            Error::RowTooLarge(msg) => write!(f, "Row too large. {}", msg),
            Error::ColumnCountTooLarge(msg) => write!(f, "Too many columns. {}", msg),
            Error::CorruptPage(msg) => write!(f, "Corrupt page. {}", msg),
            Error::InvalidNodeKind(msg) => write!(f, "Invalid node kind. {}", msg),
            Error::KeyNotFound(msg) => write!(f, "Key not found. {}", msg),
            Error::NoMoreRows => write!(f, "No more rows."),
            Error::Cancelled => write!(f, "Operation cancelled."),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}
