//! A small IMDSv2 client used to discover the current AWS region.
//!
//! Requests are session-oriented: a session token is fetched up front and
//! refreshed if a request comes back `401`. The metadata schema date is
//! pinned to guarantee compatibility. Only the one lookup this tool needs is
//! exposed; the region is read out of the instance identity document.

use http::StatusCode;
use log::{debug, info, trace};
use reqwest::Client;
use serde_json::Value;
use snafu::{ensure, ResultExt};
use std::time::Duration;
use tokio::time;

const BASE_URI: &str = "http://169.254.169.254";
const PINNED_SCHEMA: &str = "2021-01-03";

// Session tokens can only be fetched from `latest`
const SESSION_TARGET: &str = "latest/api/token";
const SESSION_TOKEN_TTL_SECS: &str = "60";

const MAX_ATTEMPTS: u8 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A client for making IMDSv2 queries. It obtains a session token when it is
/// first instantiated and reuses it across requests.
pub(crate) struct ImdsClient {
    client: Client,
    imds_base_uri: String,
    session_token: String,
}

impl ImdsClient {
    pub(crate) async fn new() -> Result<Self> {
        Self::new_impl(BASE_URI.to_string()).await
    }

    async fn new_impl(imds_base_uri: String) -> Result<Self> {
        let client = Client::new();
        let session_token = fetch_token(&client, &imds_base_uri).await?;
        Ok(Self {
            client,
            imds_base_uri,
            session_token,
        })
    }

    /// Returns the region described in the instance identity document, or
    /// `None` if IMDS has no identity document to offer.
    pub(crate) async fn fetch_region(&mut self) -> Result<Option<String>> {
        let target = "dynamic/instance-identity/document";
        let response = match self.fetch_imds(target).await? {
            Some(response) => response,
            None => return Ok(None),
        };
        let identity_document: Value =
            serde_json::from_slice(&response).context(error::SerdeSnafu)?;
        let region = identity_document
            .get("region")
            .and_then(|value| value.as_str())
            .map(|region| region.to_string());
        Ok(region)
    }

    /// Fetches `target` from IMDS under the pinned schema date. Returns `None`
    /// on 404, which IMDS uses both for unset data and when it is disabled.
    async fn fetch_imds(&mut self, target: &str) -> Result<Option<Vec<u8>>> {
        let uri = format!("{}/{}/{}", self.imds_base_uri, PINNED_SCHEMA, target);
        debug!("Requesting {}", &uri);
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            ensure!(
                attempt <= MAX_ATTEMPTS,
                error::FailedFetchImdsSnafu { attempt }
            );
            if attempt > 1 {
                time::sleep(RETRY_DELAY).await;
            }
            let response = self
                .client
                .get(&uri)
                .header("X-aws-ec2-metadata-token", &self.session_token)
                .send()
                .await
                .context(error::RequestSnafu {
                    method: "GET",
                    uri: &uri,
                })?;
            trace!("IMDS response: {:?}", &response);

            match response.status() {
                code @ StatusCode::OK => {
                    let response_body = response
                        .bytes()
                        .await
                        .context(error::ResponseBodySnafu {
                            method: "GET",
                            uri: &uri,
                            code,
                        })?
                        .to_vec();
                    return Ok(Some(response_body));
                }

                StatusCode::NOT_FOUND => return Ok(None),

                // The session token is expired or invalid
                StatusCode::UNAUTHORIZED => {
                    info!("IMDS session token is invalid or expired, refreshing");
                    self.refresh_token().await?;
                    continue;
                }

                StatusCode::REQUEST_TIMEOUT => {
                    info!("Retrying IMDS request");
                    continue;
                }

                code => {
                    let response_body = response
                        .bytes()
                        .await
                        .context(error::ResponseBodySnafu {
                            method: "GET",
                            uri: &uri,
                            code,
                        })?
                        .to_vec();
                    return error::ResponseSnafu {
                        method: "GET",
                        uri: &uri,
                        code,
                        response_body: String::from_utf8_lossy(&response_body).to_string(),
                    }
                    .fail();
                }
            }
        }
    }

    /// Fetches a new session token and stores it for following requests.
    async fn refresh_token(&mut self) -> Result<()> {
        self.session_token = fetch_token(&self.client, &self.imds_base_uri).await?;
        Ok(())
    }
}

/// Helper to fetch an IMDSv2 session token.
async fn fetch_token(client: &Client, imds_base_uri: &str) -> Result<String> {
    let uri = format!("{}/{}", imds_base_uri, SESSION_TARGET);
    let mut attempt: u8 = 0;
    loop {
        attempt += 1;
        ensure!(
            attempt <= MAX_ATTEMPTS,
            error::FailedFetchTokenSnafu { attempt }
        );
        if attempt > 1 {
            time::sleep(RETRY_DELAY).await;
        }
        let response = client
            .put(&uri)
            .header(
                "X-aws-ec2-metadata-token-ttl-seconds",
                SESSION_TOKEN_TTL_SECS,
            )
            .send()
            .await
            .context(error::RequestSnafu {
                method: "PUT",
                uri: &uri,
            })?;

        let code = response.status();
        if code == StatusCode::OK {
            return response.text().await.context(error::ResponseBodySnafu {
                method: "PUT",
                uri: &uri,
                code,
            });
        }
        info!("Retrying IMDS token request");
    }
}

mod error {
    use http::StatusCode;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("IMDS fetch failed after {} attempts", attempt))]
        FailedFetchImds { attempt: u8 },

        #[snafu(display("Failed to fetch IMDSv2 session token after {} attempts", attempt))]
        FailedFetchToken { attempt: u8 },

        #[snafu(display("Error {}ing '{}': {}", method, uri, source))]
        Request {
            method: String,
            uri: String,
            source: reqwest::Error,
        },

        #[snafu(display("Error {} when {}ing '{}': {}", code, method, uri, response_body))]
        Response {
            method: String,
            uri: String,
            code: StatusCode,
            response_body: String,
        },

        #[snafu(display(
            "Unable to read response body when {}ing '{}' (code {}) - {}",
            method,
            uri,
            code,
            source
        ))]
        ResponseBody {
            method: String,
            uri: String,
            code: StatusCode,
            source: reqwest::Error,
        },

        #[snafu(display("Error deserializing IMDS response: {}", source))]
        Serde { source: serde_json::Error },
    }
}

pub(crate) use error::Error;
type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;
    use httptest::{matchers::*, responders::*, Expectation, Server};

    const IDENTITY_DOCUMENT_PATH: &str = "/2021-01-03/dynamic/instance-identity/document";

    fn expect_token(server: &Server, token: &'static str, times: usize) {
        server.expect(
            Expectation::matching(request::method_path("PUT", "/latest/api/token"))
                .times(times)
                .respond_with(
                    status_code(200)
                        .append_header("X-aws-ec2-metadata-token-ttl-seconds", "60")
                        .body(token),
                ),
        );
    }

    #[tokio::test]
    async fn new_imds_client() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        let token = "some+token";
        expect_token(&server, token, 1);

        let imds_client = ImdsClient::new_impl(base_uri).await.unwrap();
        assert_eq!(imds_client.session_token, token);
    }

    #[tokio::test]
    async fn fetch_region_from_identity_document() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        expect_token(&server, "some+token", 1);
        server.expect(
            Expectation::matching(request::method_path("GET", IDENTITY_DOCUMENT_PATH))
                .times(1)
                .respond_with(
                    status_code(200).body(r#"{"region": "us-west-2", "instanceId": "i-abc123"}"#),
                ),
        );

        let mut imds_client = ImdsClient::new_impl(base_uri).await.unwrap();
        let region = imds_client.fetch_region().await.unwrap();
        assert_eq!(region, Some("us-west-2".to_string()));
    }

    #[tokio::test]
    async fn fetch_region_not_found() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        expect_token(&server, "some+token", 1);
        server.expect(
            Expectation::matching(request::method_path("GET", IDENTITY_DOCUMENT_PATH))
                .times(1)
                .respond_with(status_code(404)),
        );

        let mut imds_client = ImdsClient::new_impl(base_uri).await.unwrap();
        let region = imds_client.fetch_region().await.unwrap();
        assert_eq!(region, None);
    }

    #[tokio::test]
    async fn session_token_refreshed_on_unauthorized() {
        let server = Server::run();
        let base_uri = format!("http://{}", server.addr());
        expect_token(&server, "some+token", 2);
        server.expect(
            Expectation::matching(request::method_path("GET", IDENTITY_DOCUMENT_PATH))
                .times(2)
                .respond_with(cycle![
                    status_code(401),
                    status_code(200).body(r#"{"region": "eu-central-1"}"#),
                ]),
        );

        let mut imds_client = ImdsClient::new_impl(base_uri).await.unwrap();
        let region = imds_client.fetch_region().await.unwrap();
        assert_eq!(region, Some("eu-central-1".to_string()));
    }
}
