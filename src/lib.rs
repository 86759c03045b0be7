//! Speed test client for Cloudflare-style `__down` / `__up` endpoints.
//!
//! The measurement engine lives in [`speedtest`]; [`settings`] carries every
//! tunable with the defaults of a standard run.

pub mod settings;
pub mod speedtest;
