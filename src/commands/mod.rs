pub mod consolidate;
pub mod migrate;
pub mod path;
pub mod rebuild;
pub mod status;
pub mod strays;
pub mod validate;
