pub mod app;
pub mod catalog;
pub mod config;
pub mod dates;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod genotype;
pub mod geometry;
pub mod http;
pub mod output;
pub mod plots;
pub mod sidecar;
pub mod storage;
pub mod traitdb;
pub mod weather;
pub mod workspace;
