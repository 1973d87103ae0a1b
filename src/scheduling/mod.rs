pub mod conflict;
pub mod lifecycle;
pub mod query;
pub mod service;
