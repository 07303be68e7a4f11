pub mod repo;
pub mod services;
pub mod store;
