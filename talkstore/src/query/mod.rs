//! Query - filters and find options shared by every backend.

mod filter;
mod options;

pub use filter::{values_equal, Clause, Filter, Operator};
pub use options::{FindOptions, SortKey, SortOrder};

pub(crate) use options::total_order;
