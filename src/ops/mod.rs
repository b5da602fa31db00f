//! Operations and observability.

pub mod observability;
