//! Decoding of assistant subprocess output.
//!
//! Both supported assistants emit JSON lines on stdout. [`parse`] turns a
//! stream of such lines into a [`Transcript`] of [`ParsedMessage`]s after
//! [`preprocess`] has bounded the size of every line.

pub mod message;
pub mod parse;
pub mod preprocess;

pub use message::ParsedMessage;
pub use parse::{StreamParser, Transcript, parse_file, parse_reader, parse_str};
