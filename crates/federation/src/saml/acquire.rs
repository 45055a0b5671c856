//! Assertion acquirer strategies.
//!
//! Every SAML variant reduces to "get me a base64 assertion": statically
//! from configuration, via the system browser and the local callback
//! listener, or by driving an IdP's HTML login form over HTTPS.

use crate::browser;
use crate::config::{PluginConfig, keys};
use crate::core::{FederationError, Result};
use crate::http::validate_idp_url;
use crate::listener::CallbackListener;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// Form/callback field carrying the assertion.
pub const SAML_RESPONSE_FIELD: &str = "SAMLResponse";

/// Strategy producing a base64 SAML assertion.
#[async_trait]
pub trait AssertionAcquirer: Send + Sync {
    /// Obtain the assertion, blocking on user interaction where needed.
    async fn acquire(&self) -> Result<String>;
}

/// Assertion supplied directly as configuration.
pub struct StaticAcquirer {
    assertion: String,
}

impl StaticAcquirer {
    /// Read the `saml_assertion` parameter.
    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        Ok(Self {
            assertion: config.required(keys::SAML_ASSERTION)?.to_string(),
        })
    }
}

#[async_trait]
impl AssertionAcquirer for StaticAcquirer {
    async fn acquire(&self) -> Result<String> {
        Ok(self.assertion.clone())
    }
}

/// Browser-redirect acquisition: local listener + system browser.
pub struct BrowserAcquirer {
    login_url: String,
    listen_port: u16,
    timeout: std::time::Duration,
}

impl BrowserAcquirer {
    /// Read `login_url`, `listen_port` and `idp_response_timeout`.
    pub fn from_config(config: &PluginConfig) -> Result<Self> {
        Ok(Self {
            login_url: config.required(keys::LOGIN_URL)?.to_string(),
            listen_port: config.listen_port()?,
            timeout: config.response_timeout()?,
        })
    }
}

#[async_trait]
impl AssertionAcquirer for BrowserAcquirer {
    async fn acquire(&self) -> Result<String> {
        validate_idp_url(&self.login_url)?;

        let listener = CallbackListener::bind(self.listen_port).await?;
        info!(port = listener.port(), url = %self.login_url, "waiting for IdP to post the assertion");

        // Keep waiting even if no browser could be spawned; the URL is
        // logged and the user may open it by hand.
        if let Err(e) = browser::open(&self.login_url) {
            warn!(error = %e, "could not open a browser for the login URL");
        }
        let params = listener.wait(self.timeout).await?;

        params
            .get(SAML_RESPONSE_FIELD)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| {
                FederationError::ProtocolParse(format!(
                    "callback did not carry a {SAML_RESPONSE_FIELD} field"
                ))
            })
    }
}

/// Form-automation acquisition against an IdP's hosted login pages.
///
/// Sequence: JSON session-token request, fetch the SSO page, reconstruct and
/// resubmit the login form if the page asks for one, then extract the
/// embedded assertion from the final HTML body.
pub struct FormAcquirer {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    user: String,
    password: String,
}

#[derive(Deserialize)]
struct SessionTokenResponse {
    #[serde(rename = "sessionToken")]
    session_token: String,
}

impl FormAcquirer {
    /// Read IdP host/port, credentials and the application id.
    pub fn from_config(config: &PluginConfig, http: reqwest::Client) -> Result<Self> {
        let host = config.required(keys::IDP_HOST)?;
        let port = config
            .get_non_empty(keys::IDP_PORT)
            .unwrap_or("443")
            .to_string();
        Ok(Self {
            http,
            base_url: format!("https://{host}:{port}"),
            app_id: config.required(keys::APP_ID)?.to_string(),
            user: config.required(keys::USER)?.to_string(),
            password: config.required(keys::PASSWORD)?.to_string(),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(http: reqwest::Client, base_url: &str, app_id: &str) -> Self {
        Self {
            http,
            base_url: base_url.to_string(),
            app_id: app_id.to_string(),
            user: "user@example.com".into(),
            password: "password".into(),
        }
    }

    async fn session_token(&self) -> Result<String> {
        let url = format!("{}/api/v1/authn", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "username": self.user,
                "password": self.password,
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(FederationError::AccessDenied(
                "identity provider rejected the login credentials".into(),
            ));
        }
        if !status.is_success() {
            return Err(FederationError::upstream(status.as_u16(), &body));
        }

        let token: SessionTokenResponse = serde_json::from_str(&body)
            .map_err(|e| FederationError::ProtocolParse(format!("session token response: {e}")))?;
        Ok(token.session_token)
    }

    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(FederationError::upstream(status.as_u16(), &body));
        }
        Ok(body)
    }

    /// Resubmit the page's login form, carrying hidden fields along.
    async fn submit_form(&self, page: &str) -> Result<String> {
        let action = form_action(page).ok_or_else(|| {
            FederationError::ProtocolParse("login page has no form action".into())
        })?;
        let action = if action.starts_with("http") {
            action
        } else {
            format!("{}{action}", self.base_url)
        };
        validate_idp_url(&action)?;

        let mut fields = parse_inputs(page);
        for (name, value) in &mut fields {
            let lowered = name.to_ascii_lowercase();
            if lowered.contains("user") || lowered.contains("email") {
                *value = self.user.clone();
            } else if lowered.contains("pass") {
                *value = self.password.clone();
            }
        }

        debug!(%action, fields = fields.len(), "resubmitting IdP login form");
        let response = self.http.post(&action).form(&fields).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(FederationError::upstream(status.as_u16(), &body));
        }
        Ok(body)
    }
}

#[async_trait]
impl AssertionAcquirer for FormAcquirer {
    async fn acquire(&self) -> Result<String> {
        validate_idp_url(&self.base_url)?;

        let session_token = self.session_token().await?;
        let sso_url = format!(
            "{}/app/{}/sso/saml?sessionToken={session_token}",
            self.base_url, self.app_id
        );

        let page = self.fetch(&sso_url).await?;
        if let Some(assertion) = extract_saml_response(&page) {
            return Ok(assertion);
        }

        // The page asked for another form round (ADFS/Ping style).
        let final_page = self.submit_form(&page).await?;
        extract_saml_response(&final_page).ok_or_else(|| {
            FederationError::ProtocolParse(
                "IdP response did not contain an embedded assertion".into(),
            )
        })
    }
}

static INPUT_TAG: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?is)<input([^>]*)>").expect("static regex"));
static NAME_ATTR: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#"(?i)name\s*=\s*["']([^"']*)["']"#).expect("static regex")
});
static VALUE_ATTR: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#"(?i)value\s*=\s*["']([^"']*)["']"#).expect("static regex")
});
static FORM_ACTION: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#"(?is)<form[^>]*action\s*=\s*["']([^"']+)["']"#).expect("static regex")
});
static SAML_INPUT: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r#"(?is)name\s*=\s*["']SAMLResponse["'][^>]*value\s*=\s*["']([^"']+)["']|value\s*=\s*["']([^"']+)["'][^>]*name\s*=\s*["']SAMLResponse["']"#,
    )
    .expect("static regex")
});

/// All `<input>` name/value pairs in document order.
pub(crate) fn parse_inputs(html: &str) -> Vec<(String, String)> {
    INPUT_TAG
        .captures_iter(html)
        .filter_map(|tag| {
            let attrs = tag.get(1)?.as_str();
            let name = NAME_ATTR.captures(attrs)?.get(1)?.as_str().to_string();
            let value = VALUE_ATTR
                .captures(attrs)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Some((name, unescape_html(&value)))
        })
        .collect()
}

/// The first form's action attribute.
pub(crate) fn form_action(html: &str) -> Option<String> {
    FORM_ACTION
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| unescape_html(m.as_str()))
}

/// Pull the embedded assertion out of an HTML body, if present.
pub(crate) fn extract_saml_response(html: &str) -> Option<String> {
    SAML_INPUT.captures(html).and_then(|c| {
        c.get(1)
            .or_else(|| c.get(2))
            .map(|m| unescape_html(m.as_str()))
    })
}

/// Minimal entity unescape for the characters IdPs escape in hidden fields.
fn unescape_html(value: &str) -> String {
    value
        .replace("&#x2b;", "+")
        .replace("&#x3d;", "=")
        .replace("&#43;", "+")
        .replace("&#61;", "=")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn inputs_are_parsed_with_and_without_values() {
        let html = r#"
            <form action="/login">
              <input type="text" name="username" value="">
              <input type="hidden" name="csrf" value="abc123"/>
              <input type="password" NAME='password'>
            </form>"#;
        let inputs = parse_inputs(html);
        assert_eq!(
            inputs,
            vec![
                ("username".to_string(), String::new()),
                ("csrf".to_string(), "abc123".to_string()),
                ("password".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn form_action_is_extracted() {
        let html = r#"<form method="post" action="/idp/sso/post">...</form>"#;
        assert_eq!(form_action(html).as_deref(), Some("/idp/sso/post"));
    }

    #[test]
    fn saml_response_extraction_both_attribute_orders() {
        let name_first = r#"<input type="hidden" name="SAMLResponse" value="QUJD"/>"#;
        let value_first = r#"<input type="hidden" value="QUJD" name="SAMLResponse"/>"#;
        assert_eq!(extract_saml_response(name_first).as_deref(), Some("QUJD"));
        assert_eq!(extract_saml_response(value_first).as_deref(), Some("QUJD"));
    }

    #[test]
    fn escaped_entities_are_unescaped() {
        let html = r#"<input name="SAMLResponse" value="AB&#x2b;CD&#x3d;"/>"#;
        assert_eq!(extract_saml_response(html).as_deref(), Some("AB+CD="));
    }

    #[test]
    fn missing_assertion_yields_none() {
        assert!(extract_saml_response("<html><body>login</body></html>").is_none());
    }

    mod form_automation {
        use super::super::*;
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        async fn mount_authn(server: &MockServer) {
            Mock::given(method("POST"))
                .and(path("/api/v1/authn"))
                .and(body_partial_json(serde_json::json!({
                    "username": "user@example.com",
                })))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "sessionToken": "session-1",
                })))
                .mount(server)
                .await;
        }

        #[tokio::test]
        async fn sso_page_with_embedded_assertion_short_circuits() {
            let server = MockServer::start().await;
            mount_authn(&server).await;
            Mock::given(method("GET"))
                .and(path("/app/app-1/sso/saml"))
                .respond_with(ResponseTemplate::new(200).set_body_string(
                    r#"<form><input name="SAMLResponse" value="QUJD"/></form>"#,
                ))
                .mount(&server)
                .await;

            let acquirer =
                FormAcquirer::for_tests(reqwest::Client::new(), &server.uri(), "app-1");
            assert_eq!(acquirer.acquire().await.unwrap(), "QUJD");
        }

        #[tokio::test]
        async fn login_form_is_resubmitted_when_no_assertion_is_embedded() {
            let server = MockServer::start().await;
            mount_authn(&server).await;
            Mock::given(method("GET"))
                .and(path("/app/app-1/sso/saml"))
                .respond_with(ResponseTemplate::new(200).set_body_string(
                    r#"<form action="/idp/login">
                         <input name="username" value="">
                         <input type="hidden" name="csrf" value="tok">
                       </form>"#,
                ))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/idp/login"))
                .respond_with(ResponseTemplate::new(200).set_body_string(
                    r#"<input name="SAMLResponse" value="REVG"/>"#,
                ))
                .mount(&server)
                .await;

            let acquirer =
                FormAcquirer::for_tests(reqwest::Client::new(), &server.uri(), "app-1");
            assert_eq!(acquirer.acquire().await.unwrap(), "REVG");
        }

        #[tokio::test]
        async fn rejected_login_is_access_denied() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/api/v1/authn"))
                .respond_with(ResponseTemplate::new(401).set_body_string("{}"))
                .mount(&server)
                .await;

            let acquirer =
                FormAcquirer::for_tests(reqwest::Client::new(), &server.uri(), "app-1");
            let err = acquirer.acquire().await.unwrap_err();
            assert!(matches!(err, FederationError::AccessDenied(_)));
        }
    }
}
