//! Application server that executes untrusted question packages in
//! isolated workers on behalf of a learning-management host.

pub mod app;
pub mod cache;
pub mod collector;
pub mod hash;
pub mod indexer;
pub mod package;
pub mod repository;
pub mod settings;
pub mod web;
pub mod worker;
