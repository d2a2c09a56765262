//! Plan model and the planning-document parser.

pub mod error;
pub mod model;
pub mod parser;

pub use error::{ParseError, ParseWarning, Violation};
pub use model::{Gate, NodeId, NodeIdParseError, NodeRef, Plan, Slot, Sprint, Task};
pub use parser::parse;
