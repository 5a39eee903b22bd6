use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;

use crate::repo::RepoError;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ApiErrorBody {
    pub id: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Every failure a handler can report. The `id()` of each variant is stable and
/// forms part of the wire contract.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("authentication required")] Unauthenticated,
    #[error("not authorized")] Unauthorized,
    #[error("invalid credentials")] InvalidCredentials,
    #[error("email address has not been confirmed")] EmailNotConfirmed,
    #[error("user is banned")] UserBanned,
    #[error("user is readonly on this domain")] UserReadonly,
    #[error("bad or expired token")] BadToken,
    #[error("XSRF token is missing or invalid")] XsrfTokenInvalid,
    #[error("invalid input data")] InvalidInputData(Option<String>),
    #[error("invalid property value")] InvalidPropValue(Option<String>),
    #[error("invalid UUID")] InvalidUuid,
    #[error("property cannot be changed")] ImmutableProperty,
    #[error("account cannot be changed")] ImmutableAccount,
    #[error("email address is already registered")] EmailAlreadyExists,
    #[error("host is already registered")] HostAlreadyExists,
    #[error("user must log in locally")] LoginLocally,
    #[error("user must log in using the identity provider")] LoginUsingIdp(Option<String>),
    #[error("user must log in using SSO")] LoginUsingSso,
    #[error("domain is readonly")] DomainReadonly,
    #[error("page is readonly")] PageReadonly,
    #[error("parent comment does not belong to the page")] NoRootComment,
    #[error("you cannot vote for your own comment")] SelfVote,
    #[error("you cannot perform this operation on yourself")] SelfOperation,
    #[error("unknown identity provider")] IdpUnknown,
    #[error("identity provider is not configured")] IdpUnconfigured,
    #[error("SSO is misconfigured")] SsoMisconfigured(Option<String>),
    #[error("new signups are forbidden")] SignupsForbidden,
    #[error("new domain owners are forbidden")] NewOwnersForbidden,
    #[error("feature is disabled")] FeatureDisabled(Option<String>),
    #[error("user is not a local user")] NoLocalUser,
    #[error("superuser privileges required")] NoSuperuser,
    #[error("domain owner privileges required")] NotDomainOwner,
    #[error("moderator privileges required")] NotModerator,
    #[error("unknown host")] UnknownHost,
    #[error("failed to fetch resource")] ResourceFetchFailed,
    #[error("failed to send email")] EmailSendFailure,
    #[error("cannot delete the last owner of a domain")] DeletingLastOwner,
    #[error("cannot delete the last superuser")] DeletingLastSuperuser,
    #[error("too many requests")] TooManyRequests,
    #[error("not found")] NotFound,
    #[error("internal error")] Internal,
}

impl ApiError {
    pub fn invalid_input(details: impl Into<String>) -> Self {
        ApiError::InvalidInputData(Some(details.into()))
    }

    pub fn invalid_prop(details: impl Into<String>) -> Self {
        ApiError::InvalidPropValue(Some(details.into()))
    }

    /// Stable wire identifier.
    pub fn id(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::Unauthorized => "unauthorized",
            ApiError::InvalidCredentials => "invalid-credentials",
            ApiError::EmailNotConfirmed => "email-not-confirmed",
            ApiError::UserBanned => "user-banned",
            ApiError::UserReadonly => "user-readonly",
            ApiError::BadToken => "bad-token",
            ApiError::XsrfTokenInvalid => "xsrf-token-invalid",
            ApiError::InvalidInputData(_) => "invalid-input-data",
            ApiError::InvalidPropValue(_) => "invalid-prop-value",
            ApiError::InvalidUuid => "invalid-uuid",
            ApiError::ImmutableProperty => "immutable-property",
            ApiError::ImmutableAccount => "immutable-account",
            ApiError::EmailAlreadyExists => "email-already-exists",
            ApiError::HostAlreadyExists => "host-already-exists",
            ApiError::LoginLocally => "login-locally",
            ApiError::LoginUsingIdp(_) => "login-using-idp",
            ApiError::LoginUsingSso => "login-using-sso",
            ApiError::DomainReadonly => "domain-readonly",
            ApiError::PageReadonly => "page-readonly",
            ApiError::NoRootComment => "no-root-comment",
            ApiError::SelfVote => "self-vote",
            ApiError::SelfOperation => "self-operation",
            ApiError::IdpUnknown => "idp-unknown",
            ApiError::IdpUnconfigured => "idp-unconfigured",
            ApiError::SsoMisconfigured(_) => "sso-misconfigured",
            ApiError::SignupsForbidden => "signups-forbidden",
            ApiError::NewOwnersForbidden => "new-owners-forbidden",
            ApiError::FeatureDisabled(_) => "feature-disabled",
            ApiError::NoLocalUser => "no-local-user",
            ApiError::NoSuperuser => "no-superuser",
            ApiError::NotDomainOwner => "not-domain-owner",
            ApiError::NotModerator => "not-moderator",
            ApiError::UnknownHost => "unknown-host",
            ApiError::ResourceFetchFailed => "resource-fetch-failed",
            ApiError::EmailSendFailure => "email-send-failure",
            ApiError::DeletingLastOwner => "deleting-last-owner",
            ApiError::DeletingLastSuperuser => "deleting-last-superuser",
            ApiError::TooManyRequests => "too-many-requests",
            ApiError::NotFound => "not-found",
            ApiError::Internal => "internal",
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            ApiError::InvalidInputData(d)
            | ApiError::InvalidPropValue(d)
            | ApiError::LoginUsingIdp(d)
            | ApiError::SsoMisconfigured(d)
            | ApiError::FeatureDisabled(d) => d.clone(),
            _ => None,
        }
    }

    pub fn body(&self) -> ApiErrorBody {
        ApiErrorBody { id: self.id(), message: self.to_string(), details: self.details() }
    }
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound => ApiError::NotFound,
            RepoError::Conflict => ApiError::invalid_input("conflicting record"),
            RepoError::Internal(msg) => {
                tracing::error!(error = %msg, "repository failure");
                ApiError::Internal
            }
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated
            | ApiError::Unauthorized
            | ApiError::InvalidCredentials
            | ApiError::EmailNotConfirmed
            | ApiError::UserBanned
            | ApiError::BadToken => StatusCode::UNAUTHORIZED,
            ApiError::UserReadonly
            | ApiError::XsrfTokenInvalid
            | ApiError::SelfVote
            | ApiError::SelfOperation
            | ApiError::NotDomainOwner
            | ApiError::NotModerator
            | ApiError::NoSuperuser
            | ApiError::SignupsForbidden
            | ApiError::NewOwnersForbidden
            | ApiError::ImmutableAccount
            | ApiError::LoginLocally
            | ApiError::LoginUsingIdp(_)
            | ApiError::LoginUsingSso => StatusCode::FORBIDDEN,
            ApiError::EmailAlreadyExists | ApiError::HostAlreadyExists => StatusCode::CONFLICT,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ResourceFetchFailed | ApiError::EmailSendFailure => StatusCode::BAD_GATEWAY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Internal failures collapse to one opaque body
        let body = match self {
            ApiError::Internal => ApiErrorBody { id: "internal", message: "internal error".into(), details: None },
            _ => self.body(),
        };
        HttpResponse::build(self.status_code()).json(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_ids_and_statuses() {
        assert_eq!(ApiError::SelfVote.id(), "self-vote");
        assert_eq!(ApiError::SelfVote.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::DomainReadonly.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidCredentials.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::EmailAlreadyExists.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn details_are_carried_only_when_present() {
        let b = ApiError::invalid_input("markdown is empty").body();
        assert_eq!(b.id, "invalid-input-data");
        assert_eq!(b.details.as_deref(), Some("markdown is empty"));
        assert!(ApiError::PageReadonly.body().details.is_none());
    }
}
