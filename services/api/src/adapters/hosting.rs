//! services/api/src/adapters/hosting.rs
//!
//! This module contains the adapter for the oTree experiment-hosting REST API.
//! It implements the `HostingService` port from the `core` crate. Each Site
//! carries its own base URL and REST key, so one adapter serves all sites.

use async_trait::async_trait;
use crowdpanel_core::domain::{SessionData, Site};
use crowdpanel_core::ports::{HostingService, PortError, PortResult};
use reqwest::Method;
use serde_json::json;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements the `HostingService` port against an oTree
/// site's REST API.
#[derive(Clone)]
pub struct OtreeAdapter {
    http: reqwest::Client,
}

impl OtreeAdapter {
    /// Creates a new `OtreeAdapter`.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// One call against `{site.url}/api/{path}`. The hosting service takes
    /// its parameters as a JSON body on GET as well as POST.
    async fn call(
        &self,
        site: &Site,
        method: Method,
        path: &str,
        params: serde_json::Value,
    ) -> PortResult<reqwest::Response> {
        let url = format!("{}/api/{}", site.url.trim_end_matches('/'), path);

        let response = self
            .http
            .request(method, &url)
            .header("otree-rest-key", &site.rest_key)
            .json(&params)
            .send()
            .await
            .map_err(|_| {
                PortError::Unreachable(format!("Could not reach your oTree site at {}", site.url))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("Request to \"{}\" failed: {}", url, body);
            if status.is_server_error() {
                return Err(PortError::Server {
                    status: status.as_u16(),
                    message,
                });
            }
            return Err(PortError::Client {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

//=========================================================================================
// `HostingService` Trait Implementation
//=========================================================================================

#[async_trait]
impl HostingService for OtreeAdapter {
    async fn fetch_session_data(
        &self,
        site: &Site,
        code: &str,
        participant_labels: &[String],
    ) -> PortResult<SessionData> {
        let params = json!({
            "code": code,
            "participant_labels": participant_labels,
        });
        let response = self.call(site, Method::GET, "session", params).await?;
        response
            .json::<SessionData>()
            .await
            .map_err(|e| PortError::Unexpected(format!("invalid session payload: {}", e)))
    }

    async fn push_session_vars(
        &self,
        site: &Site,
        code: &str,
        vars: serde_json::Value,
    ) -> PortResult<()> {
        let params = json!({
            "code": code,
            "vars": vars,
        });
        self.call(site, Method::POST, "session_vars", params)
            .await?;
        Ok(())
    }
}
