mod models;

pub mod modes;

pub use models::*;
