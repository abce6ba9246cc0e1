//! Pure logic with no I/O.

pub mod classifier;
pub mod porcelain;
pub mod sanitize;
pub mod shell;
pub mod title;
