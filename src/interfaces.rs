//! External collaborator interfaces. The core consumes these through
//! narrow traits but does not implement the production versions: a host
//! application supplies the page allocator, property decoder, expression
//! evaluator and usage-map bitset.

use crate::error::JetResult;
use crate::value::Value;

/// Allocator-of-pages abstraction. The core never opens a file directly;
/// it reads/writes fixed-size pages and asks for new ones through this
/// trait.
pub trait PageChannel {
    fn page_size(&self) -> usize;
    fn read_page(&self, page_number: u32, buf: &mut [u8]) -> std::io::Result<()>;
    fn write_page(&mut self, page_number: u32, buf: &[u8]) -> std::io::Result<()>;
    fn allocate_new_page(&mut self) -> std::io::Result<u32>;
    /// Acquire an exclusive write lock around a multi-page structural
    /// change. No-op for single-page writes.
    fn start_exclusive_write(&mut self) {}
    fn finish_write(&mut self) {}
    fn create_page_buffer(&self) -> Vec<u8> {
        vec![0u8; self.page_size()]
    }
}

/// Property-name to `(type, value)` mapping; read-only from the core's
/// perspective except for the "default" property, which carries row/column
/// expression and validation text consumed by [`ExpressionEvaluator`].
pub trait PropertyMap {
    fn get(&self, name: &str) -> Option<Value>;
}

/// Supplies "this column value" / "this row values" / identifier lookup
/// to an [`ExpressionEvaluator`] invocation.
pub trait ExpressionContext {
    fn column_value(&self, name: &str) -> Option<Value>;
    fn row_values(&self) -> &[Value];
}

/// Evaluates the validation/default-value/calculated-column expression
/// language. The core provides the context implementations (row
/// validator, column validator, default-value generator, calc column) but
/// not the parser.
pub trait ExpressionEvaluator {
    fn evaluate(&self, expression: &str, ctx: &dyn ExpressionContext) -> JetResult<Value>;
}

/// Opaque page-set used to track which pages belong to a long-value
/// column's fragment chain.
pub trait UsageMap {
    fn contains(&self, page: u32) -> bool;
    fn add(&mut self, page: u32);
    fn remove(&mut self, page: u32);
}
