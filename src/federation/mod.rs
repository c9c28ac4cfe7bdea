//! Federation with peer KAS instances: registry lookup, the mTLS client,
//! per-endpoint circuit breakers and allOf/anyOf fan-out.

pub mod breaker;
pub mod client;
mod error;
pub mod registry;
pub mod router;
pub mod types;

pub use breaker::{BreakerConfig, BreakerState, BreakerTable};
pub use client::{ClientIdentity, HttpRemoteKasClient, RemoteKasClient, PEER_UNWRAP_PATH};
pub use error::FederationError;
pub use registry::{FederationRegistry, PeerKas, PeerRecord};
pub use router::{FederationContext, FederationRouter, RequesterIdentity};
pub use types::{PeerUnwrapRequest, PeerUnwrapResponse};
