// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Integration tests for workload-identity-operator
//!
//! These tests require a running Kubernetes cluster accessible via kubeconfig.
//! Tests are marked with #[ignore] and must be run explicitly:
//!
//! ```bash
//! cargo test --test integration -- --ignored --test-threads=1
//! ```
//!
//! All custom resources are cluster-scoped singletons, so the tests must run
//! sequentially. Operand children land in a per-test namespace.

mod cluster;
mod crd;
mod namespace;
mod operator;


pub use cluster::*;
pub use crd::*;
pub use namespace::*;
pub use operator::*;
pub use wait::*;
