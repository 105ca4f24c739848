//! Identity context supplied by the upstream auth service.
//!
//! Authentication and session handling live outside this service; requests
//! arrive with trusted identity headers set by the gateway in front of us.
//! This module only extracts that context and enforces trust-level
//! requirements for high-risk actions.

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Steward,
    Admin,
}

/// Trust level of the current session. HIGH means the user recently
/// re-authenticated; ordering matters for `require_trust_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Low,
    High,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: Uuid,
    pub role: Role,
    pub trust_level: TrustLevel,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Guard for high-risk operations (admin freeze, withdrawal, ...).
///
/// Fails with a distinguishable `StepUpRequired` condition so the caller can
/// prompt re-authentication and retry the identical request. Nothing may have
/// mutated before this guard passes.
pub fn require_trust_level(
    user: &AuthenticatedUser,
    required: TrustLevel,
    action: &str,
) -> AppResult<()> {
    if user.trust_level >= required {
        Ok(())
    } else {
        Err(AppError::StepUpRequired {
            action: action.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header_value(parts, "x-user-id")?
            .parse::<Uuid>()
            .map_err(|_| AppError::Forbidden("Invalid identity context".to_string()))?;

        let role = match header_value(parts, "x-user-role")?.as_str() {
            "client" => Role::Client,
            "steward" => Role::Steward,
            "admin" => Role::Admin,
            other => {
                return Err(AppError::Forbidden(format!("Unknown role: {}", other)));
            }
        };

        let trust_level = match header_value(parts, "x-trust-level")?.as_str() {
            "high" => TrustLevel::High,
            _ => TrustLevel::Low,
        };

        Ok(AuthenticatedUser {
            id,
            role,
            trust_level,
        })
    }
}

fn header_value(parts: &Parts, name: &str) -> AppResult<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| AppError::Forbidden(format!("Missing identity header: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role, trust_level: TrustLevel) -> AuthenticatedUser {
        AuthenticatedUser {
            id: Uuid::new_v4(),
            role,
            trust_level,
        }
    }

    #[test]
    fn test_high_trust_passes() {
        let u = user(Role::Steward, TrustLevel::High);
        assert!(require_trust_level(&u, TrustLevel::High, "withdrawal").is_ok());
    }

    #[test]
    fn test_low_trust_requires_step_up() {
        let u = user(Role::Steward, TrustLevel::Low);
        let err = require_trust_level(&u, TrustLevel::High, "withdrawal").unwrap_err();
        match err {
            AppError::StepUpRequired { action } => assert_eq!(action, "withdrawal"),
            other => panic!("expected StepUpRequired, got {:?}", other),
        }
    }

    #[test]
    fn test_low_requirement_always_passes() {
        let u = user(Role::Client, TrustLevel::Low);
        assert!(require_trust_level(&u, TrustLevel::Low, "view").is_ok());
    }
}
