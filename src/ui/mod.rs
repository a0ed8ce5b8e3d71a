//! Everything that leaves the process: observation stream, diagnostics and the run summary.
pub mod output;
