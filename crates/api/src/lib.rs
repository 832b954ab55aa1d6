//! HTTP surface: trivial plumbing over the router and query service.

pub mod app;
