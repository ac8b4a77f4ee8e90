//! Test-only crate. See `tests/` for the transport and balancer scenarios.
