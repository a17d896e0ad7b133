//! Usage Protection Engine
//!
//! Local-first, time-budget access control for an application: a daily
//! usage budget and a weekly time-of-day schedule, enforced in either a
//! self-managed or a parentally managed mode. The engine only reports a
//! lock reason; the host decides how to honor it.

pub mod config;
pub mod platform;
pub mod protection;
