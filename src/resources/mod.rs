//! GPU memory arenas and CPU-side mesh data

mod arena;
mod mesh;

pub use arena::*;
pub use mesh::*;
