#![forbid(unsafe_code)]

//! Shared library for the DotByte server binaries: catalog persistence,
//! runtime configuration and security helpers.

pub mod catalog;
pub mod config;
pub mod security;
