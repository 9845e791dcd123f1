//! Utility modules for the testwatch monitor.
//!
//! # Modules
//!
//! - [`debounce`]: Coalescing of file change bursts into run triggers
//! - [`path_filter`]: Glob-based exclusion of watched paths

pub mod debounce;
pub mod path_filter;

pub use debounce::{ChangeDebouncer, DebouncerError};
pub use path_filter::PathFilter;
