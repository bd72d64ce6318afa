//! The middle end: the call graph, the 3-address IL, the generic pattern
//! framework, and the IL optimizer built on top of it.

pub mod call_graph;
pub mod il;
pub mod optimize;
pub mod pattern;

pub use call_graph::*;
pub use il::*;
pub use optimize::optimize;
