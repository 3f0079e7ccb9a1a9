pub mod container;
pub mod crypto;
pub mod models;
