pub mod crypto;
pub mod dpop;
pub mod http_rewrap;
pub mod ratelimit;
pub mod secure_keys;
pub mod token;
