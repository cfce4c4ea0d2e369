//! g8s manages generated credentials in Kubernetes.
//!
//! Users declare `Login`, `SSHKeyPair` and `SelfSignedTLSBundle` resources.
//! The controller generates each credential once, keeps it in a backend
//! secret next to a history secret, and guards both with a ClusterRole. The
//! `g8s-master` `Allowlist` mirrors backend secrets into opted-in namespaces
//! and decides which pods the mutating webhook injects them into.
pub mod backoff;
pub mod cache;
pub mod cli;
pub mod client;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod credentials;
pub mod events;
pub mod labels;
pub mod logging;
pub mod reconciler;
pub mod resources;
pub mod selector;
pub mod webhook;
