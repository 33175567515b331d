//! Signed QR ticket credentials and the check-in engine that validates them at the door.

pub mod config;
pub mod credential;
pub mod handlers;
pub mod live;
pub mod models;
pub mod routes;
pub mod scan;
pub mod services;
pub mod store;
pub mod utils;

use std::sync::Arc;

use axum::Router;

use crate::config::{ConfigError, ScanSettings, SigningSecret};
use crate::credential::CredentialCodec;
use crate::scan::ScanEngine;
use crate::services::CheckInService;
use crate::store::Stores;

/// Wires the engine, live totals and HTTP routes over the given stores.
pub fn build_app(
    stores: Stores,
    secret: &SigningSecret,
    settings: ScanSettings,
) -> Result<(Router, Arc<CheckInService>), ConfigError> {
    let codec = CredentialCodec::new(secret)?;
    let engine = ScanEngine::new(codec.clone(), stores.clone(), settings);
    let service = Arc::new(CheckInService::new(engine, codec, stores));

    Ok((routes::create_routes(service.clone()), service))
}
