//! tests/component/mod.rs
//!
//! Groups the component-level test files.

mod session;
