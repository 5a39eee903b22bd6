use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::authz;
use crate::comments::{self, Loaded};
use crate::error::ApiError;
use crate::models::Id;
use crate::principal::Principal;
use crate::repo::Repo;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VoteResult {
    pub score: i32,
    pub direction: i16,
}

pub fn validate_direction(direction: i64) -> Result<i16, ApiError> {
    match direction {
        -1 | 0 | 1 => Ok(direction as i16),
        _ => Err(ApiError::invalid_input("vote direction must be -1, 0 or 1")),
    }
}

/// Records the principal's vote on a comment; `0` withdraws it. The score
/// moves by the difference between the new and the previous direction.
pub async fn set_vote(repo: &dyn Repo, principal: Principal, comment_id: Id, direction: i64) -> Result<VoteResult, ApiError> {
    let direction = validate_direction(direction)?;
    let Loaded { comment, page, domain, principal } = comments::load(repo, principal, comment_id).await?;
    authz::check_vote(&principal, &comment)?;
    if comment.is_deleted {
        return Err(ApiError::invalid_input("comment is deleted"));
    }
    if domain.is_readonly {
        return Err(ApiError::DomainReadonly);
    }
    if page.is_readonly {
        return Err(ApiError::PageReadonly);
    }
    let score = repo.set_vote(comment.id, principal.user_id(), direction).await?;
    info!(comment = %comment.id, voter = %principal.user_id(), direction, score, "vote recorded");
    Ok(VoteResult { score, direction })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions() {
        assert_eq!(validate_direction(-1), Ok(-1));
        assert_eq!(validate_direction(0), Ok(0));
        assert!(validate_direction(2).is_err());
    }
}
