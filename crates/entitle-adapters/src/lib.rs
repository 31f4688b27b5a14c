//! Provider adapters for the entitlement engine.

#![deny(unsafe_code)]

pub mod fixture;
pub mod http_api;
pub mod mercadopago;
pub mod storage;

pub use fixture::FixtureGateway;
pub use http_api::HttpVerificationApi;
pub use mercadopago::{MercadoPagoGateway, DEFAULT_API_BASE};
pub use storage::StorageApiSigner;
