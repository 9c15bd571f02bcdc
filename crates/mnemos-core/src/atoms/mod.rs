// Atoms: pure types, constants, configuration and the error enum.
// No I/O, no locks, no database access.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
