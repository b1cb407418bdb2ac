pub mod locks;
pub mod persistence;
