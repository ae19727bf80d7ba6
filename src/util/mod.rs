pub mod serde;
pub mod types;
