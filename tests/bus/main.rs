//! Event bus integration tests, run against the in-memory broker.

mod delivery;
mod handlers;
mod lifecycle;
mod retry;
mod support;
