//! Query engine: predicate AST, textual surface, sort order and paging

mod engine;
mod expr;
mod parser;
mod sort;

pub use engine::{QueryPage, QueryRequest};
pub use expr::{CompareOp, Expr, Field, Literal, Projection, Value};
pub use parser::{parse_filter, parse_sort};
pub use sort::{SortDirection, SortSpec};
