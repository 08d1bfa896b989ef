//! Proxy authentication middleware
//!
//! Handles Basic authentication for the fleet's entry point.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode};
use tracing::{debug, warn};

use crate::config::ProxyAuthConfig;
use crate::error::{FleetError, Result};
use crate::proxy::handler::{empty_body, ProxyBody};

const CHALLENGE: &str = "Basic realm=\"proxyfleet\"";

/// Proxy authentication handler
#[derive(Clone)]
pub struct ProxyAuth {
    /// `(username, password)` when authentication is required
    credentials: Option<(String, String)>,
}

impl ProxyAuth {
    pub fn new(username: String, password: String) -> Self {
        Self {
            credentials: Some((username, password)),
        }
    }

    /// Create a disabled auth handler
    pub fn disabled() -> Self {
        Self { credentials: None }
    }

    pub fn from_config(config: Option<&ProxyAuthConfig>) -> Self {
        match config {
            Some(auth) => Self::new(auth.username.clone(), auth.password.clone()),
            None => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    /// Validate the Proxy-Authorization header
    pub fn validate<T>(&self, req: &Request<T>) -> Result<()> {
        let Some((username, password)) = &self.credentials else {
            return Ok(());
        };

        let auth_str = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .ok_or(FleetError::AuthenticationFailed)?
            .to_str()
            .map_err(|_| FleetError::AuthenticationFailed)?;

        let Some(encoded) = auth_str.strip_prefix("Basic ") else {
            warn!("Invalid auth scheme, expected Basic");
            return Err(FleetError::AuthenticationFailed);
        };

        let decoded = BASE64
            .decode(encoded.trim())
            .map_err(|_| FleetError::AuthenticationFailed)?;
        let credentials =
            String::from_utf8(decoded).map_err(|_| FleetError::AuthenticationFailed)?;
        let (user, pass) = credentials
            .split_once(':')
            .ok_or(FleetError::AuthenticationFailed)?;

        if user == username && pass == password {
            debug!("Proxy authentication successful for user: {}", user);
            Ok(())
        } else {
            warn!("Proxy authentication failed for user: {}", user);
            Err(FleetError::AuthenticationFailed)
        }
    }

    /// Create a 407 Proxy Authentication Required response
    pub fn challenge_response(&self) -> Response<ProxyBody> {
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
        response
            .headers_mut()
            .insert(PROXY_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
        response
    }
}
