//! Core deployment logic: types, parsing, expressions, compilation, ordering, execution.

pub mod compiler;
pub mod error;
pub mod executor;
pub mod expression;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod types;
