//! Shared bootstrap for the `arch_web` and `arch_import` binaries.

pub mod logging;
