pub mod runresource;

pub use runresource::*;
