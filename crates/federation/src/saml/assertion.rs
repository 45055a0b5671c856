//! Defensive SAML assertion parsing.
//!
//! Assertions arrive base64-encoded from an acquirer. Parsing rejects
//! DOCTYPE declarations outright and quick-xml never resolves external
//! entities, which closes the XXE / entity-expansion class of attacks.

use crate::core::{FederationError, IamMetadata, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use quick_xml::Reader;
use quick_xml::events::Event;
use std::sync::LazyLock;
use tracing::warn;

/// Attribute carrying the comma-separated role/provider ARN pairs.
pub const ROLE_ATTRIBUTE: &str = "https://aws.amazon.com/SAML/Attributes/Role";
/// Attribute used as a `db_user` fallback.
pub const SESSION_NAME_ATTRIBUTE: &str = "https://aws.amazon.com/SAML/Attributes/RoleSessionName";

const DB_USER_ATTRIBUTE: &str = "https://wharf.dev/SAML/Attributes/DbUser";
const AUTO_CREATE_ATTRIBUTE: &str = "https://wharf.dev/SAML/Attributes/AutoCreate";
const DB_GROUPS_ATTRIBUTE: &str = "https://wharf.dev/SAML/Attributes/DbGroups";
const FORCE_LOWERCASE_ATTRIBUTE: &str = "https://wharf.dev/SAML/Attributes/ForceLowercase";
const ALLOW_OVERRIDE_ATTRIBUTE: &str = "https://wharf.dev/SAML/Attributes/AllowDbUserOverride";

/// Maximum accepted base64 assertion size (prevents decode bombs).
const MAX_ENCODED_SIZE: usize = 512 * 1024;

static ROLE_ARN_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^arn:[^:\n]*:iam::\d+:role/").expect("static regex"));
static PROVIDER_ARN_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^arn:[^:\n]*:iam::\d+:saml-provider/").expect("static regex")
});

/// A parsed assertion: attribute name → values, in document order.
#[derive(Debug)]
pub struct SamlAssertion {
    attributes: IndexMap<String, Vec<String>>,
    encoded: String,
}

impl SamlAssertion {
    /// Decode and parse a base64 SAML response document.
    pub fn parse(encoded: &str) -> Result<Self> {
        if encoded.len() > MAX_ENCODED_SIZE {
            return Err(FederationError::ProtocolParse(format!(
                "assertion exceeds maximum size ({} > {MAX_ENCODED_SIZE} bytes)",
                encoded.len()
            )));
        }

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| FederationError::ProtocolParse(format!("base64 decode failed: {e}")))?;
        let xml = String::from_utf8(decoded)
            .map_err(|e| FederationError::ProtocolParse(format!("assertion is not UTF-8: {e}")))?;

        let attributes = parse_attributes(&xml)?;

        Ok(Self {
            attributes,
            encoded: encoded.trim().to_string(),
        })
    }

    /// The original base64 document, as role assumption expects it.
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// All values of an attribute.
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes.get(name).map_or(&[], Vec::as_slice)
    }

    /// First value of an attribute.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(String::as_str)
    }

    /// Role ARN → provider ARN, in first-seen order.
    ///
    /// Each Role attribute value is a comma-separated pair where one side
    /// matches the role pattern and the other the provider pattern, in
    /// arbitrary order; a repeated role overwrites its prior provider.
    pub fn roles(&self) -> Result<IndexMap<String, String>> {
        let mut roles: IndexMap<String, String> = IndexMap::new();

        for value in self.values(ROLE_ATTRIBUTE) {
            let (role, provider) = split_role_pair(value)?;
            if let Some(previous) = roles.insert(role.clone(), provider.clone()) {
                if previous != provider {
                    warn!(%role, "role asserted with multiple providers; last one wins");
                }
            }
        }

        Ok(roles)
    }

    /// IdP-asserted database user/group metadata from the custom attributes.
    pub fn metadata(&self) -> IamMetadata {
        let db_user = self
            .first(DB_USER_ATTRIBUTE)
            .or_else(|| self.first(SESSION_NAME_ATTRIBUTE))
            .map(str::to_string);

        let db_groups = self
            .values(DB_GROUPS_ATTRIBUTE)
            .iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .collect();

        let flag = |name: &str| {
            self.first(name)
                .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
        };

        IamMetadata {
            db_user,
            db_groups,
            auto_create: flag(AUTO_CREATE_ATTRIBUTE),
            force_lowercase: flag(FORCE_LOWERCASE_ATTRIBUTE),
            allow_db_user_override: flag(ALLOW_OVERRIDE_ATTRIBUTE),
        }
    }
}

/// Disambiguate one comma-separated ARN pair by pattern, not position.
fn split_role_pair(value: &str) -> Result<(String, String)> {
    let mut role = None;
    let mut provider = None;

    for part in value.split(',') {
        let part = part.trim();
        if ROLE_ARN_PATTERN.is_match(part) {
            role = Some(part.to_string());
        } else if PROVIDER_ARN_PATTERN.is_match(part) {
            provider = Some(part.to_string());
        }
    }

    match (role, provider) {
        (Some(role), Some(provider)) => Ok((role, provider)),
        _ => Err(FederationError::ProtocolParse(format!(
            "role attribute value '{value}' is not a role/provider ARN pair"
        ))),
    }
}

fn parse_attributes(xml: &str) -> Result<IndexMap<String, Vec<String>>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut attributes: IndexMap<String, Vec<String>> = IndexMap::new();
    let mut current_attribute: Option<String> = None;
    let mut in_value = false;

    loop {
        match reader.read_event() {
            Ok(Event::DocType(_)) => {
                return Err(FederationError::ProtocolParse(
                    "DOCTYPE declarations are not allowed in assertions".into(),
                ));
            }
            Ok(Event::Start(e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"Attribute" => {
                        current_attribute = e
                            .attributes()
                            .flatten()
                            .find(|attr| attr.key.local_name().as_ref() == b"Name")
                            .and_then(|attr| attr.unescape_value().ok())
                            .map(|v| v.into_owned());
                    }
                    b"AttributeValue" => in_value = current_attribute.is_some(),
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if in_value {
                    if let Some(name) = &current_attribute {
                        let value = e
                            .unescape()
                            .map_err(|err| FederationError::ProtocolParse(err.to_string()))?;
                        attributes
                            .entry(name.clone())
                            .or_default()
                            .push(value.into_owned());
                    }
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"AttributeValue" => in_value = false,
                b"Attribute" => current_attribute = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(FederationError::ProtocolParse(e.to_string())),
            _ => {}
        }
    }

    Ok(attributes)
}
