//! Key Access Service rewrap core.
//!
//! A client presents a wrapped data-encryption key together with a policy,
//! a policy binding and proof of identity. The service verifies the binding
//! and signatures, asks the policy engine for a decision and, only on
//! `allow`, recovers the key (locally through an HSM provider or across
//! federated KAS peers) and rewraps it for the client's ephemeral key.

pub mod audit;
pub mod cache;
pub mod config;
pub mod federation;
pub mod hsm;
pub mod modules;
pub mod policy;
pub mod rewrap;

pub use rewrap::{RewrapError, RewrapRequest, RewrapResponse, RewrapService};
