//! Error taxonomy. `JetError` covers every failure mode the engine can
//! surface; callers match on variant rather than parse message text.

use std::fmt;
use thiserror::Error;

/// Where an error occurred, for the `(Db=..;Table=..;Column=..)` decoration
/// attached to every error message. Fields are filled in as the error
/// crosses component boundaries; any may be absent.
#[derive(Debug, Default, Clone)]
pub struct Context {
    pub db: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub index: Option<String>,
    pub relationship: Option<String>,
}

impl Context {
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            column: Some(column.into()),
            ..Default::default()
        }
    }

    pub fn index(name: impl Into<String>) -> Self {
        Self {
            index: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn relationship(name: impl Into<String>) -> Self {
        Self {
            relationship: Some(name.into()),
            ..Default::default()
        }
    }

    fn is_empty(&self) -> bool {
        self.db.is_none()
            && self.table.is_none()
            && self.column.is_none()
            && self.index.is_none()
            && self.relationship.is_none()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "(")?;
        let mut first = true;
        let mut part = |f: &mut fmt::Formatter<'_>, k: &str, v: &Option<String>| -> fmt::Result {
            if let Some(v) = v {
                if !first {
                    write!(f, ";")?;
                }
                write!(f, "{k}={v}")?;
                first = false;
            }
            Ok(())
        };
        part(f, "Db", &self.db)?;
        part(f, "Table", &self.table)?;
        part(f, "Column", &self.column)?;
        part(f, "Index", &self.index)?;
        part(f, "Relationship", &self.relationship)?;
        write!(f, ")")
    }
}

/// The engine's error type. `JetResult<T>` is the crate-wide alias.
#[derive(Error, Debug)]
pub enum JetError {
    /// A caller-supplied value is rejected by type coercion, the column
    /// validator, or a size limit.
    #[error("invalid value: {message} {ctx}")]
    InvalidValue { message: String, ctx: Context },

    /// Unique-index collision, FK parent missing, or null in a required
    /// column.
    #[error("constraint violation: {message} {ctx}")]
    ConstraintViolation { message: String, ctx: Context },

    /// Underlying page-channel read/write failure.
    #[error("io error: {source} {ctx}")]
    Io {
        #[source]
        source: std::io::Error,
        ctx: Context,
    },

    /// A batch `add_rows` partially succeeded.
    #[error("batch update failed after {written} row(s): {source} {ctx}")]
    BatchUpdate {
        written: usize,
        #[source]
        source: Box<JetError>,
        ctx: Context,
    },

    /// Column type, sort order, or index type cannot be written by this
    /// implementation.
    #[error("unsupported: {message} {ctx}")]
    Unsupported { message: String, ctx: Context },
}

impl JetError {
    pub fn invalid_value(message: impl Into<String>, ctx: Context) -> Self {
        Self::InvalidValue {
            message: message.into(),
            ctx,
        }
    }

    pub fn constraint_violation(message: impl Into<String>, ctx: Context) -> Self {
        Self::ConstraintViolation {
            message: message.into(),
            ctx,
        }
    }

    pub fn io(source: std::io::Error, ctx: Context) -> Self {
        Self::Io { source, ctx }
    }

    pub fn batch_update(written: usize, source: JetError, ctx: Context) -> Self {
        Self::BatchUpdate {
            written,
            source: Box::new(source),
            ctx,
        }
    }

    pub fn unsupported(message: impl Into<String>, ctx: Context) -> Self {
        Self::Unsupported {
            message: message.into(),
            ctx,
        }
    }

    /// Whether this failure is a physical I/O failure rather than a logical
    /// (validation/constraint) one. A physical failure resets the
    /// in-memory tdef/index cache state; a logical one does not.
    pub fn is_physical(&self) -> bool {
        matches!(self, JetError::Io { .. })
    }
}

pub type JetResult<T> = std::result::Result<T, JetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_formats_only_present_fields() {
        let ctx = Context::column("Customers", "Email");
        assert_eq!(ctx.to_string(), "(Table=Customers;Column=Email)");
    }

    #[test]
    fn empty_context_formats_empty() {
        assert_eq!(Context::default().to_string(), "");
    }

    #[test]
    fn batch_update_is_not_physical() {
        let e = JetError::batch_update(
            3,
            JetError::constraint_violation("dup", Context::default()),
            Context::default(),
        );
        assert!(!e.is_physical());
    }
}
