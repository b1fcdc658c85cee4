//! Stream combinators shared by the source and cache layers.

mod joiner;

pub use joiner::{join_each, join_ordered};
