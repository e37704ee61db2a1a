pub mod callbacks;
pub mod store;
