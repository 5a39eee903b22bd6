use utoipa::OpenApi;

use crate::comments::{PageComments, PageInfo, Submitted};
use crate::dynconfig::{DataType, DynConfigItem};
use crate::error::ApiErrorBody;
use crate::models::{CommentState, CommentView, Commenter, Domain, DomainPage, DomainUser, ModNotifyPolicy, PrincipalView};
use crate::routes::{auth, domains, embed, settings, users, SessionResponse};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::embed::login,
        crate::routes::embed::signup,
        crate::routes::embed::comment_list,
        crate::routes::embed::comment_new,
        crate::routes::embed::comment_vote,
        crate::routes::auth::login,
        crate::routes::auth::signup,
        crate::routes::oauth::init,
        crate::routes::domains::list,
        crate::routes::domains::create,
        crate::routes::domains::export,
        crate::routes::domains::import,
        crate::routes::users::list,
        crate::routes::users::upload_avatar,
        crate::routes::settings::get_static,
        crate::routes::settings::get_dynamic,
    ),
    components(schemas(
        ApiErrorBody, PrincipalView, SessionResponse, CommentView, Commenter, CommentState,
        PageComments, PageInfo, Submitted, Domain, DomainPage, DomainUser, ModNotifyPolicy,
        DataType, DynConfigItem,
        embed::EmbedLoginRequest, embed::EmbedSignupRequest, embed::CommentListRequest,
        embed::CommentNewRequest, embed::VoteRequest,
        auth::LoginRequest, auth::SignupRequest, auth::SignupResponse,
        domains::DomainItem, domains::DomainPayload, domains::ExportDoc, domains::ExportPage,
        domains::ExportComment, domains::ImportResult,
        users::UserView, settings::StaticConfig, settings::IdpInfo
    )),
    tags(
        (name = "embed", description = "Widget-facing endpoints"),
        (name = "auth", description = "Admin UI authentication"),
        (name = "domains", description = "Domain management"),
        (name = "users", description = "Instance user administration"),
    )
)]
pub struct ApiDoc;
