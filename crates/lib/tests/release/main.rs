//! End-to-end tests for the release pipeline against an in-memory registry.

mod cache_tests;
mod common;
mod release_tests;
