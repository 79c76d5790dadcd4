pub mod cache;
pub mod config;
pub mod form;
pub mod hooks;
pub mod metadata;
pub mod migrate;
pub mod output;
pub mod page;
pub mod runtime;
pub mod settings;
pub mod summary;
