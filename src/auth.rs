use actix_web::dev::Payload;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, FromRequest, HttpRequest};
use futures::future::LocalBoxFuture;
use tracing::debug;

use crate::error::AppError;
use crate::models::user::Principal;
use crate::state::AppState;

/// Pulls the token out of `Authorization: Bearer <token>`.
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token.to_string())
    } else {
        None
    }
}

fn resolve(req: &HttpRequest) -> LocalBoxFuture<'static, Result<Option<Principal>, AppError>> {
    let token = bearer_token(req);
    let state = req.app_data::<web::Data<AppState>>().cloned();
    Box::pin(async move {
        let Some(token) = token else {
            return Ok(None);
        };
        let state =
            state.ok_or_else(|| AppError::Internal("application state is not configured".into()))?;
        let principal = state.identity.principal_for_token(&token).await?;
        if principal.is_none() {
            debug!("[AUTH] Rejected unknown or expired token");
        }
        Ok(principal)
    })
}

/// Handlers taking a `Principal` require a valid access token.
impl FromRequest for Principal {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let lookup = resolve(req);
        Box::pin(async move { lookup.await?.ok_or(AppError::Unauthorized) })
    }
}

/// The caller, if they sent a valid token. Public endpoints use this to
/// personalise responses without requiring a login.
#[derive(Debug, Clone)]
pub struct MaybePrincipal(pub Option<Principal>);

impl FromRequest for MaybePrincipal {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let lookup = resolve(req);
        Box::pin(async move { Ok(MaybePrincipal(lookup.await?)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_bearer_token_parsing() {
        let req = TestRequest::default()
            .insert_header((AUTHORIZATION, "Bearer abc123"))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("abc123"));

        let req = TestRequest::default()
            .insert_header((AUTHORIZATION, "bearer   abc123 "))
            .to_http_request();
        assert_eq!(bearer_token(&req).as_deref(), Some("abc123"));

        let req = TestRequest::default()
            .insert_header((AUTHORIZATION, "Basic dXNlcjpwYXNz"))
            .to_http_request();
        assert!(bearer_token(&req).is_none());

        assert!(bearer_token(&TestRequest::default().to_http_request()).is_none());
    }
}
