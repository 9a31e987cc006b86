//! Authentication and authorization chains.
//!
//! Each link returns an [`AuthAction`]: `Ok` accepts and stops the chain,
//! `Ko` rejects and stops the chain, `Continue` defers to the next link.
//! A chain exhausted on `Continue` (or an empty chain) accepts.
//!
//! A link returning an error stops the chain and the error wins over any
//! action. An [`ApiError`] is surfaced as-is; anything else is treated as an
//! infrastructure failure.

use std::sync::Arc;

use async_trait::async_trait;
use tidewire_core::{ApiError, AuthAction};

use super::context::Context;
use crate::push::PushSession;

// ---------------------------------------------------------------------------
// Link traits
// ---------------------------------------------------------------------------

/// Authenticates the caller of a dispatch.
#[async_trait]
pub trait RequestAuthenticator: Send + Sync {
    async fn authenticate_request(&self, ctx: &mut Context) -> anyhow::Result<AuthAction>;
}

/// Decides whether an authenticated caller may perform the operation.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_authorized(&self, ctx: &mut Context) -> anyhow::Result<AuthAction>;
}

/// Authenticates a push session before it is registered.
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn authenticate_session(&self, session: &PushSession) -> anyhow::Result<AuthAction>;
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Authentication,
    Authorization,
}

enum Step {
    Next,
    Accept,
    Reject(ApiError),
}

fn resolve(verdict: anyhow::Result<AuthAction>, gate: Gate, subject: &str) -> Step {
    match verdict {
        Err(err) => Step::Reject(ApiError::from_anyhow(err).unwrap_or_else(|other| {
            tracing::error!(gate = ?gate, error = %other, "auth link failed");
            ApiError::internal(other.to_string(), subject)
        })),
        Ok(AuthAction::Ok) => Step::Accept,
        Ok(AuthAction::Continue) => Step::Next,
        Ok(AuthAction::Ko) => Step::Reject(match gate {
            Gate::Authentication => {
                ApiError::unauthorized("you are not authenticated", subject)
            }
            Gate::Authorization => {
                ApiError::forbidden("you are not allowed to perform this operation", subject)
            }
        }),
    }
}

/// Runs the authenticator chain against `ctx`.
///
/// # Errors
///
/// Returns 401 on rejection, 500 on infrastructure failure, or the
/// `ApiError` produced by a link.
pub async fn authenticate_request(
    chain: &[Arc<dyn RequestAuthenticator>],
    ctx: &mut Context,
    subject: &str,
) -> Result<(), ApiError> {
    for link in chain {
        match resolve(
            link.authenticate_request(ctx).await,
            Gate::Authentication,
            subject,
        ) {
            Step::Next => {}
            Step::Accept => return Ok(()),
            Step::Reject(err) => return Err(err),
        }
    }
    Ok(())
}

/// Runs the authorizer chain against `ctx`.
///
/// # Errors
///
/// Returns 403 on rejection, 500 on infrastructure failure, or the
/// `ApiError` produced by a link.
pub async fn authorize_request(
    chain: &[Arc<dyn Authorizer>],
    ctx: &mut Context,
    subject: &str,
) -> Result<(), ApiError> {
    for link in chain {
        match resolve(link.is_authorized(ctx).await, Gate::Authorization, subject) {
            Step::Next => {}
            Step::Accept => return Ok(()),
            Step::Reject(err) => return Err(err),
        }
    }
    Ok(())
}

/// Runs the session authenticator chain against `session`.
///
/// # Errors
///
/// Returns 401 on rejection, 500 on infrastructure failure, or the
/// `ApiError` produced by a link.
pub async fn authenticate_session(
    chain: &[Arc<dyn SessionAuthenticator>],
    session: &PushSession,
    subject: &str,
) -> Result<(), ApiError> {
    for link in chain {
        match resolve(
            link.authenticate_session(session).await,
            Gate::Authentication,
            subject,
        ) {
            Step::Next => {}
            Step::Accept => return Ok(()),
            Step::Reject(err) => return Err(err),
        }
    }
    Ok(())
}
