//! Resolved authentication data forwarded by the gateway alongside external requests.

use serde::{Deserialize, Serialize};

use crate::id::DocumentId;

/// First scope entry of a user token granting site administration.
pub const SITE_ADMIN_SCOPE: &str = "site_admin";

/// Authentication info passed from the auth service to other services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(rename = "token", default)]
    pub plain_token: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<User>,
    #[serde(rename = "administrator", skip_serializing_if = "Option::is_none", default)]
    pub admin: Option<Administrator>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_token: Option<Token>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub admin_token: Option<Token>,
}

impl Auth {
    /// True when the request carries a site-admin user token issued to a
    /// user flagged as site administrator.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        if self.user_token.is_none() || self.user.is_none() {
            return false;
        }
        self.is_site_admin_token()
    }

    #[must_use]
    pub fn is_site_admin_token(&self) -> bool {
        let scoped = self
            .user_token
            .as_ref()
            .and_then(|token| token.scope.first())
            .is_some_and(|scope| scope == SITE_ADMIN_SCOPE);
        scoped && self.user.as_ref().is_some_and(|user| user.is_site_admin)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<DocumentId>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub email: String,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub email_validation_required: bool,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub image_url: String,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub is_site_admin: bool,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub first_name: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub last_name: String,
}

impl User {
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Administrator {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<DocumentId>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub realm: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub email: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub scope: Vec<String>,
}

/// Scoped access token. `expires` is kept as the issuer's timestamp text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<DocumentId>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub scope: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expires: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub permissions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin_auth() -> Auth {
        Auth {
            plain_token: "t".to_string(),
            user: Some(User {
                is_site_admin: true,
                ..User::default()
            }),
            user_token: Some(Token {
                scope: vec![SITE_ADMIN_SCOPE.to_string(), "read".to_string()],
                ..Token::default()
            }),
            ..Auth::default()
        }
    }

    #[test]
    fn site_admin_token_and_flag_is_admin() {
        assert!(admin_auth().is_admin());
    }

    #[test]
    fn scope_must_be_first_entry() {
        let mut auth = admin_auth();
        auth.user_token.as_mut().unwrap().scope.reverse();
        assert!(!auth.is_admin());
    }

    #[test]
    fn user_flag_required() {
        let mut auth = admin_auth();
        auth.user.as_mut().unwrap().is_site_admin = false;
        assert!(!auth.is_admin());
        assert!(!auth.is_site_admin_token());
    }

    #[test]
    fn missing_token_or_user_is_not_admin() {
        let mut auth = admin_auth();
        auth.user_token = None;
        assert!(!auth.is_admin());

        let mut auth = admin_auth();
        auth.user = None;
        assert!(!auth.is_admin());
    }

    #[test]
    fn decodes_gateway_payload() {
        let json = r#"{
            "token": "abc",
            "user": {"id": "5f1b2c3d4e5f60718293a4b5", "first_name": "Ada", "last_name": "L"},
            "user_token": {"scope": ["user"], "expires": "2030-01-01T00:00:00Z"}
        }"#;
        let auth: Auth = serde_json::from_str(json).unwrap();
        assert_eq!(auth.plain_token, "abc");
        assert_eq!(auth.user.as_ref().unwrap().full_name(), "Ada L");
        assert_eq!(
            auth.user_token.as_ref().unwrap().expires.as_deref(),
            Some("2030-01-01T00:00:00Z")
        );
        assert!(!auth.is_admin());
    }
}
