// Formula parsing and evaluation

pub mod eval;
pub mod functions;
pub mod parser;
pub mod refs;

pub use eval::{evaluate, EvalError, ValueLookup};
pub use parser::{parse, Expr};
