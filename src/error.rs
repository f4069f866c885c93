//! Error types, one per operation class.
//!
//! Storage failures are always wrapped in [`DriverError`]; arity violations
//! (an operation that must touch exactly one row touched zero or several)
//! get their own variants so callers can tell "not found" from "ambiguous"
//! from "backend unavailable" without looking at backend detail.

/// Failure reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("backend error: {0}")]
    Backend(String),

    /// A live row already holds this value in a unique column.
    #[error("duplicate value for unique field `{0}`")]
    UniqueViolation(&'static str),
}

impl DriverError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::UniqueViolation(_) => true,
            Self::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Errors from read operations.
#[derive(Debug, thiserror::Error)]
pub enum GetError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Zero rows matched.
    #[error("no matching record")]
    TooFewRecords,

    /// More than one row matched where exactly one was expected.
    #[error("more than one matching record")]
    TooManyRecords,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GetError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TooFewRecords)
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::TooManyRecords)
    }
}

/// Errors from insert operations.
#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("insert returned no rows")]
    CreatedTooFewRecords,

    #[error("insert returned more than one row")]
    CreatedTooManyRecords,

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from update operations.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("update matched no rows")]
    UpdatedTooFewRecords,

    #[error("update matched more than one row")]
    UpdatedTooManyRecords,

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from delete operations.
#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("delete matched no rows")]
    DeletedTooFewRecords,

    #[error("delete matched more than one row")]
    DeletedTooManyRecords,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors from connect and disconnect.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,
}

macro_rules! impl_from_sqlx {
    ($($ty:ty),*) => {
        $(
            impl From<sqlx::Error> for $ty {
                fn from(err: sqlx::Error) -> Self {
                    Self::Driver(DriverError::Database(err))
                }
            }
        )*
    };
}

impl_from_sqlx!(GetError, CreateError, UpdateError, DeleteError, ConnectionError);

/// Checks that an operation touched exactly one row.
pub(crate) fn single<T, E>(mut rows: Vec<T>, too_few: E, too_many: E) -> Result<T, E> {
    match rows.len() {
        0 => Err(too_few),
        1 => Ok(rows.remove(0)),
        _ => Err(too_many),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_distinguishes_arity() {
        assert!(matches!(
            single(Vec::<u8>::new(), GetError::TooFewRecords, GetError::TooManyRecords),
            Err(GetError::TooFewRecords)
        ));
        assert_eq!(
            single(vec![7u8], GetError::TooFewRecords, GetError::TooManyRecords).unwrap(),
            7
        );
        assert!(matches!(
            single(vec![1u8, 2], GetError::TooFewRecords, GetError::TooManyRecords),
            Err(GetError::TooManyRecords)
        ));
    }

    #[test]
    fn sqlx_errors_are_wrapped_as_driver_errors() {
        let err: DeleteError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, DeleteError::Driver(DriverError::Database(_))));
        assert!(err.to_string().contains("database error"));
    }
}
