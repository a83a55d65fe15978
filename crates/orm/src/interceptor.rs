use crate::meta::EntityMeta;
use crate::query::Query;

/// Kind of statement an [`Interceptor`] is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// A read.
    Select,
    /// An insert.
    Insert,
    /// An update.
    Update,
    /// A delete, whether physical, soft or through a deletion-log table.
    Delete,
}

impl Operation {
    /// Lower-case name used in errors and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Hook run around every generated statement.
///
/// `before` hooks run in registration order; the first to return `false`
/// vetoes the statement with [`crate::Error::InterceptorRejected`]. `after`
/// hooks run in reverse order once the statement has executed.
pub trait Interceptor: Send + Sync {
    /// Inspect a statement before it runs. Return `false` to reject it.
    fn before(&self, operation: Operation, meta: &EntityMeta, query: &Query) -> bool {
        let _ = (operation, meta, query);
        true
    }

    /// Observe a statement after it ran. `affected` is the row count (or rows read).
    fn after(&self, operation: Operation, meta: &EntityMeta, query: &Query, affected: u64) {
        let _ = (operation, meta, query, affected);
    }
}
