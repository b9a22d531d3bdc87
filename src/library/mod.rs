pub mod blog;
pub mod index;

pub use blog::{Blog, BlogKind, BlogUrlError};
pub use index::{BlogIndex, IndexError};
