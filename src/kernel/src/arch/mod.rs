//! Architecture-specific implementations.
//!
//! This module provides platform abstractions for different target architectures.
//! Currently supported: x86_64 on bare metal.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
