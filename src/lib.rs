pub mod authsession;
pub mod authz;
pub mod comments;
pub mod config;
pub mod dynconfig;
pub mod error;
pub mod idp;
pub mod markdown;
pub mod middleware;
pub mod models;
pub mod notify;
pub mod openapi;
pub mod password;
pub mod principal;
pub mod rate_limit; // sliding-window limits for login, signup and comments
pub mod repo;
pub mod routes;
pub mod sso;
pub mod storage; // avatar images
pub mod tokens;
pub mod usersession;
pub mod votes;
pub mod web;

// Re-exported for the binary and integration tests
pub use middleware::{SecurityHeaders, Xsrf};
pub use routes::{config, AppState};
