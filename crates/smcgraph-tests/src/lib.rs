//! Integration test crate for smcgraph; all content lives under `tests/`.
