//! SAML federation: assertion acquisition, parsing, and role assumption.

mod acquire;
mod assertion;
mod flow;

pub use acquire::{
    AssertionAcquirer, BrowserAcquirer, FormAcquirer, SAML_RESPONSE_FIELD, StaticAcquirer,
};
pub use assertion::{ROLE_ATTRIBUTE, SESSION_NAME_ATTRIBUTE, SamlAssertion};
pub use flow::SamlPlugin;
