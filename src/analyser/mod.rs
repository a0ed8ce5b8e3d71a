//! The core of ECN flow analysis.
//! Pair plain and ECN-enabled TCP probes to the same destination and classify what each pair shows.
pub mod utils;
pub mod core;
pub mod scan;
pub mod containers;
pub mod metadata;
