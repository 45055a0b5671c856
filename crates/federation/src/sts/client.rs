//! Security-token service client (query protocol over HTTPS).
//!
//! [`StsApi`] is the seam the flows call through; tests substitute a mock,
//! production uses [`HttpStsClient`] against the region's token endpoint or
//! an explicit override.

use crate::core::{FederationError, Result, sanitize_body};
use crate::http::validate_idp_url;
use crate::sts::sign::{SigningCredentials, sign_form_post};
use crate::sts::types::{
    AssumeRoleRequest, AssumeRoleWithSamlRequest, AssumeRoleWithWebIdentityRequest,
    DatabaseCredentials, GetDatabaseCredentialsRequest, StsCredentials,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::HashMap;
use tracing::debug;

const STS_API_VERSION: &str = "2011-06-15";
const WAREHOUSE_API_VERSION: &str = "2012-12-01";

/// Role-assumption and credential-issuance operations.
#[async_trait]
pub trait StsApi: Send + Sync {
    /// Exchange a SAML assertion for temporary session credentials.
    async fn assume_role_with_saml(
        &self,
        request: AssumeRoleWithSamlRequest,
    ) -> Result<StsCredentials>;

    /// Exchange a web-identity token for temporary session credentials.
    async fn assume_role_with_web_identity(
        &self,
        request: AssumeRoleWithWebIdentityRequest,
    ) -> Result<StsCredentials>;

    /// Assume a role using existing credentials (one chain hop).
    async fn assume_role(
        &self,
        credentials: &SigningCredentials,
        request: AssumeRoleRequest,
    ) -> Result<StsCredentials>;

    /// Issue an ephemeral database user/password against the warehouse.
    async fn get_database_credentials(
        &self,
        credentials: &SigningCredentials,
        request: GetDatabaseCredentialsRequest,
    ) -> Result<DatabaseCredentials>;
}

/// HTTP implementation of [`StsApi`].
pub struct HttpStsClient {
    http: reqwest::Client,
    sts_endpoint: url::Url,
    warehouse_endpoint: url::Url,
    region: String,
}

impl HttpStsClient {
    /// Build a client for `region`, with optional endpoint overrides.
    pub fn new(
        http: reqwest::Client,
        region: &str,
        sts_endpoint: Option<&str>,
        warehouse_endpoint: Option<&str>,
    ) -> Result<Self> {
        let sts = match sts_endpoint {
            Some(url) => url.to_string(),
            None => format!("https://sts.{region}.wharf.cloud/"),
        };
        let warehouse = match warehouse_endpoint {
            Some(url) => url.to_string(),
            None => format!("https://warehouse.{region}.wharf.cloud/"),
        };

        Ok(Self {
            http,
            sts_endpoint: validate_idp_url(&sts)?,
            warehouse_endpoint: validate_idp_url(&warehouse)?,
            region: region.to_string(),
        })
    }

    async fn query_call(
        &self,
        endpoint: &url::Url,
        service: &str,
        form: &[(&str, String)],
        signer: Option<&SigningCredentials>,
    ) -> Result<String> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form.iter().map(|(k, v)| (*k, v.as_str())))
            .finish();

        let mut request = self
            .http
            .post(endpoint.clone())
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body.clone());

        if let Some(credentials) = signer {
            let host = endpoint
                .host_str()
                .ok_or_else(|| FederationError::InvalidUrl {
                    url: endpoint.to_string(),
                    reason: "missing host".into(),
                })?;
            let signed = sign_form_post(
                credentials,
                host,
                endpoint.path(),
                &body,
                &self.region,
                service,
                Utc::now(),
            );
            request = request
                .header("authorization", signed.authorization)
                .header("x-amz-date", signed.amz_date);
            if let Some(token) = signed.security_token {
                request = request.header("x-amz-security-token", token);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(map_error_response(status.as_u16(), &text));
        }
        Ok(text)
    }

    fn parse_session_credentials(xml: &str) -> Result<StsCredentials> {
        let fields = extract_text_fields(
            xml,
            &["AccessKeyId", "SecretAccessKey", "SessionToken", "Expiration"],
        )?;
        let field = |name: &str| -> Result<&String> {
            fields.get(name).ok_or_else(|| {
                FederationError::ProtocolParse(format!(
                    "token response is missing element '{name}'"
                ))
            })
        };

        Ok(StsCredentials {
            access_key_id: field("AccessKeyId")?.clone(),
            secret_access_key: field("SecretAccessKey")?.clone().into(),
            session_token: field("SessionToken")?.clone().into(),
            expiration: parse_timestamp(field("Expiration")?)?,
        })
    }
}

#[async_trait]
impl StsApi for HttpStsClient {
    async fn assume_role_with_saml(
        &self,
        request: AssumeRoleWithSamlRequest,
    ) -> Result<StsCredentials> {
        debug!(role = %request.role_arn, "assuming role with SAML assertion");
        let mut form = vec![
            ("Action", "AssumeRoleWithSAML".to_string()),
            ("Version", STS_API_VERSION.to_string()),
            ("RoleArn", request.role_arn),
            ("PrincipalArn", request.principal_arn),
            ("SAMLAssertion", request.saml_assertion),
        ];
        if let Some(duration) = request.duration_seconds {
            form.push(("DurationSeconds", duration.to_string()));
        }

        let xml = self.query_call(&self.sts_endpoint, "sts", &form, None).await?;
        Self::parse_session_credentials(&xml)
    }

    async fn assume_role_with_web_identity(
        &self,
        request: AssumeRoleWithWebIdentityRequest,
    ) -> Result<StsCredentials> {
        debug!(role = %request.role_arn, session = %request.role_session_name, "assuming role with web identity");
        let mut form = vec![
            ("Action", "AssumeRoleWithWebIdentity".to_string()),
            ("Version", STS_API_VERSION.to_string()),
            ("RoleArn", request.role_arn),
            ("RoleSessionName", request.role_session_name),
            (
                "WebIdentityToken",
                request.web_identity_token.expose(str::to_string),
            ),
        ];
        if let Some(duration) = request.duration_seconds {
            form.push(("DurationSeconds", duration.to_string()));
        }

        let xml = self.query_call(&self.sts_endpoint, "sts", &form, None).await?;
        Self::parse_session_credentials(&xml)
    }

    async fn assume_role(
        &self,
        credentials: &SigningCredentials,
        request: AssumeRoleRequest,
    ) -> Result<StsCredentials> {
        debug!(role = %request.role_arn, "assuming role (chain hop)");
        let mut form = vec![
            ("Action", "AssumeRole".to_string()),
            ("Version", STS_API_VERSION.to_string()),
            ("RoleArn", request.role_arn),
            ("RoleSessionName", request.role_session_name),
        ];
        if let Some(duration) = request.duration_seconds {
            form.push(("DurationSeconds", duration.to_string()));
        }

        let xml = self
            .query_call(&self.sts_endpoint, "sts", &form, Some(credentials))
            .await?;
        Self::parse_session_credentials(&xml)
    }

    async fn get_database_credentials(
        &self,
        credentials: &SigningCredentials,
        request: GetDatabaseCredentialsRequest,
    ) -> Result<DatabaseCredentials> {
        debug!(cluster = %request.cluster_id, db_user = %request.db_user, "issuing ephemeral database credentials");
        let mut form = vec![
            ("Action", "GetClusterCredentials".to_string()),
            ("Version", WAREHOUSE_API_VERSION.to_string()),
            ("ClusterIdentifier", request.cluster_id),
            ("DbUser", request.db_user),
            ("AutoCreate", request.auto_create.to_string()),
        ];
        if let Some(database) = request.database {
            form.push(("DbName", database));
        }
        if let Some(duration) = request.duration_seconds {
            form.push(("DurationSeconds", duration.to_string()));
        }
        let groups: Vec<(String, String)> = request
            .db_groups
            .iter()
            .enumerate()
            .map(|(i, group)| (format!("DbGroups.DbGroup.{}", i + 1), group.clone()))
            .collect();
        for (key, value) in &groups {
            form.push((key.as_str(), value.clone()));
        }

        let xml = self
            .query_call(&self.warehouse_endpoint, "warehouse", &form, Some(credentials))
            .await?;

        let fields = extract_text_fields(&xml, &["DbUser", "DbPassword", "Expiration"])?;
        let field = |name: &str| -> Result<&String> {
            fields.get(name).ok_or_else(|| {
                FederationError::ProtocolParse(format!(
                    "credential response is missing element '{name}'"
                ))
            })
        };

        Ok(DatabaseCredentials {
            db_user: field("DbUser")?.clone(),
            db_password: field("DbPassword")?.clone().into(),
            expiration: parse_timestamp(field("Expiration")?)?,
        })
    }
}

/// Map a query-protocol error response onto the shared taxonomy.
fn map_error_response(status: u16, body: &str) -> FederationError {
    let fields = extract_text_fields(body, &["Code", "Message"]).unwrap_or_default();
    let code = fields.get("Code").map(String::as_str).unwrap_or_default();
    let message = fields
        .get("Message")
        .cloned()
        .unwrap_or_else(|| sanitize_body(body));

    match code {
        "AccessDenied" | "AccessDeniedException" | "ExpiredTokenException" => {
            FederationError::AccessDenied(message)
        }
        "Throttling" | "ThrottlingException" | "RequestLimitExceeded" => {
            FederationError::RateLimited(message)
        }
        _ => FederationError::upstream(status, body),
    }
}

/// Collect the text content of the named elements (first occurrence wins).
///
/// DOCTYPE declarations are rejected outright; quick-xml performs no
/// external entity resolution, so entity-expansion input dies here too.
fn extract_text_fields(xml: &str, names: &[&str]) -> Result<HashMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::DocType(_)) => {
                return Err(FederationError::ProtocolParse(
                    "DOCTYPE declarations are not allowed".into(),
                ));
            }
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                let name = std::str::from_utf8(local.as_ref()).unwrap_or_default();
                current = names
                    .iter()
                    .find(|candidate| **candidate == name)
                    .map(|candidate| (*candidate).to_string());
            }
            Ok(Event::Text(e)) => {
                if let Some(name) = current.take() {
                    let value = e
                        .unescape()
                        .map_err(|err| FederationError::ProtocolParse(err.to_string()))?;
                    fields.entry(name).or_insert_with(|| value.into_owned());
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(FederationError::ProtocolParse(e.to_string())),
            _ => {}
        }
    }

    Ok(fields)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FederationError::ProtocolParse(format!("bad expiration '{value}': {e}")))
}
