pub mod data;
pub mod evaluation;
pub mod fault;
pub mod plan;
pub mod repair;
pub mod result;
pub mod task;

pub use data::*;
pub use evaluation::*;
pub use fault::*;
pub use plan::*;
pub use repair::*;
pub use result::*;
pub use task::*;
