//! `buskit` Core — wire values, auth model, and bus message schemas shared by
//! callers and callees.

pub mod auth;
pub mod id;
pub mod messages;
pub mod types;

pub use auth::{Administrator, Auth, Token, User, SITE_ADMIN_SCOPE};
pub use id::{DocumentId, IdError};
pub use messages::{ExternalRequest, ExternalResponse, InternalRequest, InternalResponse};
pub use types::{Value, ValueMap};
