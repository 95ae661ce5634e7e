//! Expression Module
//!
//! Variable references and boolean conditions evaluated against an
//! execution context.
//!
//! - [`reference`]: `$input` / `$context` / `$stepN` / `$steps.<var>` resolution
//! - [`condition`]: condition grammar, parse tree and evaluation
//! - [`cache`]: parse-once storage keyed by id and version

pub mod cache;
pub mod condition;
pub mod reference;

pub use cache::{CacheKey, ConditionCache};
pub use condition::{CmpOp, Condition, ConditionAnomaly, ConditionError, Expr, Operand};
pub use reference::{resolve, resolve_value, ResolveError, Source, VariableRef};
