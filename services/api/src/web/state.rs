//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use crowdpanel_core::ports::{DatabaseService, HostingService, MarketplaceConnector};
use std::sync::Arc;

//=========================================================================================
// AppState (Shared Across All Requests)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
///
/// All workflow state is request-scoped; the only thing shared here are the
/// port implementations and the configuration.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn DatabaseService>,
    pub hosting: Arc<dyn HostingService>,
    pub marketplace: Arc<dyn MarketplaceConnector>,
    pub config: Arc<Config>,
}
