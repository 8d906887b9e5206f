//! Test utilities for arena-based testing.
//!
//! A [`test::TestContext`] owns the arena a compilation allocates from and
//! runs the front half of the pipeline on S-expression input, so unit
//! tests can start from text instead of hand-built tile lists.
