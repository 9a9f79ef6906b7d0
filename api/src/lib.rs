#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the versions of the kubeforge CRDs.

pub mod v1;

/// GROUP is the kubernetes API group.
pub static GROUP: &str = "kubeforge.sh";
