//! Interceptors applied to every request in fixed order: proxy-aware header
//! normalization, then authentication, then (after the handler) response
//! compression.

pub mod auth;
pub mod compress;
pub mod proxy;
