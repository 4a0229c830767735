use crate::aws::sdk_config;
use log::debug;
use snafu::{OptionExt, ResultExt, Snafu};
use std::time::Duration;

// Limit the timeout for the ECR GetAuthorizationToken API call
const GET_AUTHORIZATION_TOKEN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub(super) enum Error {
    #[snafu(display("Error retrieving ECR authorization token: {}", source))]
    GetAuthorizationToken {
        source: aws_sdk_ecr::error::SdkError<
            aws_sdk_ecr::operation::get_authorization_token::GetAuthorizationTokenError,
        >,
    },

    #[snafu(display(
        "Timed-out waiting for ECR GetAuthorizationToken API response: {}",
        source
    ))]
    GetAuthorizationTokenTimeout { source: tokio::time::error::Elapsed },

    #[snafu(display("Missing field '{}' in ECR authorization data", field))]
    Missing { field: &'static str },
}

type Result<T> = std::result::Result<T, Error>;

/// One authorization grant returned by ECR: the registry proxy endpoint it
/// applies to and the token to present there. The token is an opaque blob as
/// far as this tool is concerned; it is stored verbatim.
#[derive(Debug, Clone)]
pub(crate) struct AuthorizationRecord {
    pub(crate) proxy_endpoint: String,
    pub(crate) token: String,
    pub(crate) expires_at: Option<aws_smithy_types::DateTime>,
}

/// Calls ECR GetAuthorizationToken and returns the authorization records from
/// the response. The response typically carries one record, but zero or many
/// are passed through as-is; a record missing its endpoint or token is an
/// error rather than a silent skip.
pub(super) async fn get_authorization_token(
    region: Option<&str>,
) -> Result<Vec<AuthorizationRecord>> {
    let config = sdk_config(region).await;
    let client = aws_sdk_ecr::Client::new(&config);

    let output = tokio::time::timeout(
        GET_AUTHORIZATION_TOKEN_TIMEOUT,
        client.get_authorization_token().send(),
    )
    .await
    .context(GetAuthorizationTokenTimeoutSnafu)?
    .context(GetAuthorizationTokenSnafu)?;

    let mut records = Vec::new();
    for data in output.authorization_data.unwrap_or_default() {
        let proxy_endpoint = data.proxy_endpoint.context(MissingSnafu {
            field: "proxyEndpoint",
        })?;
        let token = data.authorization_token.context(MissingSnafu {
            field: "authorizationToken",
        })?;
        if let Some(expires_at) = &data.expires_at {
            debug!("Token for '{}' expires at {:?}", proxy_endpoint, expires_at);
        }
        records.push(AuthorizationRecord {
            proxy_endpoint,
            token,
            expires_at: data.expires_at,
        });
    }

    Ok(records)
}
