//! Service object shared by request handlers

pub mod data;

pub use data::DataService;
