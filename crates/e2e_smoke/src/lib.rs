//! Test-only crate. The end-to-end smoke scenario lives in `tests/smoke.rs`.
