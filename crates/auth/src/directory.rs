//! Directory collaborator: the allow-list mapping emails to roles.

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::AuthorizationResponse;

use crate::error::AuthResult;
use crate::provider::AccessToken;

#[async_trait]
pub trait Directory: Send + Sync + 'static {
    /// Look up `email` in the allow-list using `token` for access.
    ///
    /// A user missing from the list is a successful lookup with
    /// `is_authorized = false`, not an error.
    async fn is_user_authorized(
        &self,
        token: &AccessToken,
        email: &str,
    ) -> AuthResult<AuthorizationResponse>;
}

pub type ArcDirectory = Arc<dyn Directory>;
