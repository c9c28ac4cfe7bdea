//! The rewrap protocol: wire types, validation, key combination and the
//! orchestrating service.

pub mod combiner;
mod error;
pub mod retry;
mod service;
pub mod types;
pub mod validation;

pub use error::RewrapError;
pub use service::{KasKeys, RequestMeta, RewrapService, ServiceConfig, ServiceDeps};
pub use types::{
    Classification, ClientJwk, ClientPublicKey, KaoSignature, KeyAccessObject, Policy,
    ResponseMetadata, RewrapRequest, RewrapResponse, SplitMode,
};
