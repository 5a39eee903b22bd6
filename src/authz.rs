//! Permission rules as pure functions over principal, domain and resource.
//! Superusers pass every per-domain role check; freezes (readonly domain or
//! page) and the self-vote rule still apply to them.

use crate::error::ApiError;
use crate::models::{Comment, Domain, DomainPage, UserAuthKind};
use crate::principal::Principal;

/// Whether the domain accepts this kind of identity at all.
pub fn domain_allows(principal: &Principal, domain: &Domain, idps: &[String]) -> bool {
    if principal.is_superuser() || principal.is_moderator_plus() {
        return true;
    }
    match principal.user() {
        None => domain.auth_anonymous,
        Some(user) => match user.auth_kind() {
            UserAuthKind::Local => domain.auth_local,
            UserAuthKind::Sso => domain.auth_sso,
            UserAuthKind::Federated(idp) => idps.iter().any(|i| *i == idp),
        },
    }
}

pub fn check_post_comment(principal: &Principal, domain: &Domain, idps: &[String], page: &DomainPage) -> Result<(), ApiError> {
    if principal.user().map(|u| u.banned).unwrap_or(false) {
        return Err(ApiError::UserBanned);
    }
    if !domain_allows(principal, domain, idps) {
        return Err(ApiError::Unauthorized);
    }
    if domain.is_readonly {
        return Err(ApiError::DomainReadonly);
    }
    if page.is_readonly {
        return Err(ApiError::PageReadonly);
    }
    if !principal.is_superuser() && principal.domain_user().map(|du| du.is_readonly()).unwrap_or(false) {
        return Err(ApiError::UserReadonly);
    }
    Ok(())
}

fn is_author(principal: &Principal, comment: &Comment) -> bool {
    !principal.is_anonymous() && comment.user_created == Some(principal.user_id())
}

fn is_moderator(principal: &Principal) -> bool {
    principal.is_superuser() || principal.is_moderator_plus()
}

pub fn check_edit_comment(principal: &Principal, domain: &Domain, comment: &Comment) -> Result<(), ApiError> {
    if is_moderator(principal) {
        return Ok(());
    }
    if !is_author(principal, comment) {
        return Err(ApiError::NotModerator);
    }
    if domain.is_readonly {
        return Err(ApiError::DomainReadonly);
    }
    Ok(())
}

pub fn check_delete_comment(principal: &Principal, comment: &Comment) -> Result<(), ApiError> {
    if is_moderator(principal) || is_author(principal, comment) {
        Ok(())
    } else {
        Err(ApiError::NotModerator)
    }
}

pub fn check_moderate(principal: &Principal) -> Result<(), ApiError> {
    if is_moderator(principal) {
        Ok(())
    } else {
        Err(ApiError::NotModerator)
    }
}

pub fn check_vote(principal: &Principal, comment: &Comment) -> Result<(), ApiError> {
    if principal.is_anonymous() {
        return Err(ApiError::Unauthorized);
    }
    if is_author(principal, comment) {
        return Err(ApiError::SelfVote);
    }
    Ok(())
}

/// Settings, members, deletion, export and import of a domain.
pub fn check_manage_domain(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_superuser() || principal.is_owner() {
        Ok(())
    } else {
        Err(ApiError::NotDomainOwner)
    }
}

pub fn check_superuser(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_superuser() {
        Ok(())
    } else {
        Err(ApiError::NoSuperuser)
    }
}

/// Whether a reader may see a non-deleted comment in its current state.
pub fn can_see_comment(principal: &Principal, comment: &Comment) -> bool {
    comment.is_approved || comment.is_deleted || is_moderator(principal) || (comment.is_pending && is_author(principal, comment))
}

/// Moderators and the author see deleted comments in full.
pub fn can_see_deleted_body(principal: &Principal, comment: &Comment) -> bool {
    is_moderator(principal) || is_author(principal, comment)
}

pub fn can_see_emails(principal: &Principal) -> bool {
    is_moderator(principal)
}
