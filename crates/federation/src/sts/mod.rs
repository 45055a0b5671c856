//! Security-token and warehouse credential-issuance client.

mod client;
mod sign;
mod types;

pub use client::{HttpStsClient, StsApi};
pub use sign::{SignedHeaders, SigningCredentials, sign_form_post};
pub use types::{
    AssumeRoleRequest, AssumeRoleWithSamlRequest, AssumeRoleWithWebIdentityRequest,
    DatabaseCredentials, GetDatabaseCredentialsRequest, StsCredentials,
};
