//! Allow-list directory backed by a SharePoint list read through Microsoft Graph.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use shared_types::AuthorizationResponse;

use crate::config::AuthConfig;
use crate::directory::Directory;
use crate::error::{AuthError, AuthErrorKind, AuthResult};
use crate::provider::AccessToken;

#[derive(Debug, Deserialize)]
struct ListItems {
    #[serde(default)]
    value: Vec<ListItem>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    fields: AllowListFields,
}

/// Columns of the authorized users list.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AllowListFields {
    email: Option<String>,
    role: Option<String>,
    is_active: Option<Value>,
}

impl AllowListFields {
    /// Missing or unreadable `IsActive` counts as active.
    fn is_active(&self) -> bool {
        match &self.is_active {
            Some(Value::Bool(active)) => *active,
            Some(Value::Number(n)) => n.as_i64() != Some(0),
            Some(Value::String(s)) => !matches!(
                s.trim().to_lowercase().as_str(),
                "false" | "no" | "0"
            ),
            _ => true,
        }
    }
}

pub struct GraphDirectory {
    client: reqwest::Client,
    base_url: String,
    site_id: String,
    list: String,
}

impl GraphDirectory {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.graph_base_url.clone(),
            site_id: config.site_id.clone(),
            list: config.authorized_users_list.clone(),
        }
    }

    /// Items query for `email` on the authorized users list.
    pub fn items_url(&self, email: &str) -> String {
        let filter = format!("fields/Email eq '{}'", email.replace('\'', "''"));
        format!(
            "{}/sites/{}/lists/{}/items?expand=fields&$filter={}",
            self.base_url,
            self.site_id,
            urlencoding::encode(&self.list),
            urlencoding::encode(&filter)
        )
    }
}

#[async_trait]
impl Directory for GraphDirectory {
    async fn is_user_authorized(
        &self,
        token: &AccessToken,
        email: &str,
    ) -> AuthResult<AuthorizationResponse> {
        let url = self.items_url(email);
        tracing::debug!("Querying allow-list: {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token.secret())
            .header("Prefer", "HonorNonIndexedQueriesWarningMayFailRandomly")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Allow-list query failed: {} - {}", status, body);
            return Err(classify_status(status.as_u16(), &body));
        }

        let items: ListItems = response
            .json()
            .await
            .map_err(|e| AuthError::unknown(format!("invalid allow-list response: {}", e)))?;

        Ok(resolve_membership(&items.value, email))
    }
}

fn resolve_membership(items: &[ListItem], email: &str) -> AuthorizationResponse {
    let entry = items.iter().map(|item| &item.fields).find(|fields| {
        fields
            .email
            .as_deref()
            .is_some_and(|e| e.trim().eq_ignore_ascii_case(email.trim()))
    });

    match entry {
        Some(fields) if fields.is_active() => AuthorizationResponse {
            is_authorized: true,
            role: fields.role.clone(),
        },
        Some(_) => {
            tracing::info!("Allow-list entry for {} is inactive", email);
            AuthorizationResponse::denied()
        }
        None => AuthorizationResponse::denied(),
    }
}

/// Map a non-success Graph status to an error kind.
pub fn classify_status(status: u16, body: &str) -> AuthError {
    let detail = format!("Graph returned HTTP {}: {}", status, body);
    let kind = match status {
        401 => AuthErrorKind::InteractionRequired,
        403 => AuthErrorKind::AuthorizationDenied,
        408 | 504 => AuthErrorKind::TimeoutError,
        429 | 500..=599 => AuthErrorKind::ServerError,
        _ => AuthErrorKind::Unknown,
    };
    AuthError::new(kind, detail)
}
