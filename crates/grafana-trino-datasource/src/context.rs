//! Per-request identity signals and the statement arguments derived from them.
//!
//! A [`RequestContext`] is built fresh for each inbound request and passed by
//! reference to the row source. It is never stored in anything shared between
//! requests, so one request's identity cannot leak into another's statement.

use std::collections::HashMap;

use crate::{
    client::{TRINO_CLIENT_TAGS_HEADER, TRINO_USER_HEADER},
    error::ConfigError,
    settings::DatasourceSettings,
};

/// Name of the argument carrying a forwarded access token.
pub const ACCESS_TOKEN_ARG: &str = "accessToken";

// Grafana forwards the user's token as `Authorization`, or as `http_Authorization`
// when it arrives through the plugin request headers.
const AUTHORIZATION_HEADERS: [&str; 2] = ["http_Authorization", "Authorization"];

/// A named argument sent with a single statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryArg {
    /// The login of the user to run the statement as.
    User(String),
    /// An access token forwarded from Grafana.
    AccessToken(String),
    /// Client tags for the statement.
    ClientTags(String),
}

impl QueryArg {
    /// The argument's name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::User(_) => TRINO_USER_HEADER,
            Self::AccessToken(_) => ACCESS_TOKEN_ARG,
            Self::ClientTags(_) => TRINO_CLIENT_TAGS_HEADER,
        }
    }

    /// The argument's value.
    pub fn value(&self) -> &str {
        match self {
            Self::User(v) | Self::AccessToken(v) | Self::ClientTags(v) => v,
        }
    }
}

/// Identity signals extracted from one inbound request.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    user: Option<String>,
    access_token: Option<String>,
    client_tags: Option<String>,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("user", &self.user)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("client_tags", &self.client_tags)
            .finish()
    }
}

impl RequestContext {
    /// Extract the signals that apply to a request.
    ///
    /// `user_login` is the Grafana user making the request, if any, and
    /// `authorization` the value of its `Authorization` header.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUser`] if impersonation is enabled and the
    /// request carries no user, so the request fails before any SQL runs.
    pub fn from_request(
        settings: &DatasourceSettings,
        user_login: Option<&str>,
        authorization: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let user = if settings.enable_impersonation {
            let login = user_login
                .filter(|login| !login.is_empty())
                .ok_or(ConfigError::MissingUser)?;
            Some(login.to_string())
        } else {
            None
        };
        let access_token = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string);
        Ok(Self {
            user,
            access_token,
            client_tags: settings.client_tags.clone(),
        })
    }

    /// The impersonated user's login, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// The forwarded access token, if any.
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    /// The client tags, if any.
    pub fn client_tags(&self) -> Option<&str> {
        self.client_tags.as_deref()
    }

    /// The arguments to send with every statement run for this request, in the
    /// order user, access token, client tags.
    pub fn query_args(&self) -> Vec<QueryArg> {
        [
            self.user.clone().map(QueryArg::User),
            self.access_token.clone().map(QueryArg::AccessToken),
            self.client_tags.clone().map(QueryArg::ClientTags),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Find the forwarded `Authorization` header among a request's headers.
///
/// Header names are matched case-insensitively.
pub fn authorization_header(headers: &HashMap<String, String>) -> Option<&str> {
    AUTHORIZATION_HEADERS.iter().find_map(|wanted| {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value.as_str())
    })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::settings::{TrinoJsonData, TrinoSecureJsonData};

    fn settings(enable_impersonation: bool, client_tags: &str) -> DatasourceSettings {
        let json = TrinoJsonData {
            enable_impersonation,
            client_tags: client_tags.to_string(),
            ..Default::default()
        };
        DatasourceSettings::load(
            "http://localhost:8080",
            None,
            &json,
            &TrinoSecureJsonData::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn impersonation_requires_user() {
        let err = RequestContext::from_request(&settings(true, ""), None, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingUser));
        let err = RequestContext::from_request(&settings(true, ""), Some(""), None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingUser));
    }

    #[test]
    fn user_ignored_without_impersonation() {
        let ctx = RequestContext::from_request(&settings(false, ""), Some("alice"), None).unwrap();
        assert_eq!(ctx.user(), None);
        assert!(ctx.query_args().is_empty());
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let ctx =
            RequestContext::from_request(&settings(false, ""), None, Some("Bearer abc123")).unwrap();
        assert_eq!(ctx.query_args(), vec![QueryArg::AccessToken("abc123".to_string())]);
    }

    #[test]
    fn other_authorization_schemes_are_ignored() {
        let ctx =
            RequestContext::from_request(&settings(false, ""), None, Some("Basic Zm9vOmJhcg=="))
                .unwrap();
        assert_eq!(ctx.access_token(), None);
    }

    #[test]
    fn all_signals_in_order() {
        let ctx = RequestContext::from_request(
            &settings(true, "grafana,team-a"),
            Some("alice"),
            Some("Bearer tok"),
        )
        .unwrap();
        let args = ctx.query_args();
        assert_eq!(
            args,
            vec![
                QueryArg::User("alice".to_string()),
                QueryArg::AccessToken("tok".to_string()),
                QueryArg::ClientTags("grafana,team-a".to_string()),
            ]
        );
        let names: Vec<_> = args.iter().map(QueryArg::name).collect();
        assert_eq!(names, vec!["X-Trino-User", "accessToken", "X-Trino-Client-Tags"]);
        assert_eq!(args[0].value(), "alice");
    }

    #[test]
    fn finds_authorization_header() {
        let headers = HashMap::from([("authorization".to_string(), "Bearer x".to_string())]);
        assert_eq!(authorization_header(&headers), Some("Bearer x"));

        let headers = HashMap::from([
            ("http_Authorization".to_string(), "Bearer forwarded".to_string()),
            ("X-Grafana-Org-Id".to_string(), "1".to_string()),
        ]);
        assert_eq!(authorization_header(&headers), Some("Bearer forwarded"));

        assert_eq!(authorization_header(&HashMap::new()), None);
    }

    #[test]
    fn debug_redacts_token() {
        let ctx =
            RequestContext::from_request(&settings(false, ""), None, Some("Bearer hunter2")).unwrap();
        assert!(!format!("{ctx:?}").contains("hunter2"));
    }
}
