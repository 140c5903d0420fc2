//! Value objects shared by the fxbatch engine and its front ends.
//!
//! Everything here is plain data: cookies, requests, per-item results, the
//! batch report and the JSONL event log. Nothing in this crate performs
//! network I/O.

pub mod cookies;
pub mod events;
pub mod models;
pub mod runs;
