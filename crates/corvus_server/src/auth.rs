use crate::api::ApiError;
use crate::services::CorvusServices;
use crate::state::AppState;

use corvus_core::prelude::*;
use axum::{extract::FromRequestParts, http::request::Parts};
use std::marker::PhantomData;

/// A wrapper struct indicating a request has been authenticated.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser(pub User);

impl<S> FromRequestParts<AppState<S>> for AuthenticatedUser
where
    S: CorvusServices,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<S>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|auth_header| {
                auth_header
                    .to_str()
                    .map(|header_str| {
                        header_str
                            .strip_prefix("Bearer ")
                            .unwrap_or(header_str)
                            .trim()
                    })
                    .ok()
            })
            .unwrap_or("");

        state
            .auth()
            .verify(token)
            .await
            .map(AuthenticatedUser)
            .map_err(ApiError::from)
    }
}

/// A permission a route requires.
pub trait Scope: Send + Sync + 'static {
    const NAME: &'static str;
}

pub struct JobSubmit;
pub struct JobRead;
pub struct JobCancel;

impl Scope for JobSubmit {
    const NAME: &'static str = scopes::JOB_SUBMIT;
}
impl Scope for JobRead {
    const NAME: &'static str = scopes::JOB_READ;
}
impl Scope for JobCancel {
    const NAME: &'static str = scopes::JOB_CANCEL;
}

/// An authenticated user holding scope `T` (or `admin`).
pub struct ScopedUser<T: Scope> {
    pub user: User,
    _scope: PhantomData<T>,
}

impl<T: Scope> ScopedUser<T> {
    pub fn is_admin(&self) -> bool {
        self.user.scopes.iter().any(|s| s == scopes::ADMIN)
    }
}

impl<S, T> FromRequestParts<AppState<S>> for ScopedUser<T>
where
    S: CorvusServices,
    T: Scope,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<S>,
    ) -> Result<Self, Self::Rejection> {
        let AuthenticatedUser(user) = AuthenticatedUser::from_request_parts(parts, state).await?;
        if !user.has_scope(T::NAME) {
            return Err(ApiError::from(AuthError::Forbidden(format!(
                "missing scope '{}'",
                T::NAME
            ))));
        }
        Ok(Self {
            user,
            _scope: PhantomData,
        })
    }
}

/// Treats the bearer token as the user id and grants every job scope.
///
/// Tokens listed as admins additionally get the `admin` scope.
///
/// **DO NOT use this in production!!!**
#[derive(Clone, Debug, Default)]
pub struct DevAuth {
    admins: Vec<String>,
}

impl DevAuth {
    pub fn with_admins(admins: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }
}

impl AuthProvider for DevAuth {
    async fn verify(&self, token: &str) -> Result<User, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        if token.chars().any(char::is_whitespace) {
            return Err(AuthError::Invalid);
        }

        let mut granted = vec![
            scopes::JOB_SUBMIT.to_string(),
            scopes::JOB_READ.to_string(),
            scopes::JOB_CANCEL.to_string(),
        ];
        if self.admins.iter().any(|a| a == token) {
            granted.push(scopes::ADMIN.to_string());
        }

        Ok(User {
            id: token.to_string(),
            scopes: granted,
        })
    }
}
