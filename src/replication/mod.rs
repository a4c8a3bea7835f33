pub use node::{ReplicaNode, Role};

pub mod node;
pub mod peer;
