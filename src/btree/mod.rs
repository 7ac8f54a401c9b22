//! The B-tree over fixed-size records (spec §4.3).

mod cursor;
mod metadata;
mod node;
mod tree;

pub use cursor::Cursor;
pub use metadata::Metadata;
pub use node::NodeLayout;
pub use tree::{BTree, Owner};
