pub mod aggregate;
pub mod filter;

pub use aggregate::aggregate_batch;
pub use filter::should_drop;
