use aws_config::default_provider::credentials::DefaultCredentialsChain;
use aws_config::{imds, BehaviorVersion};
use aws_smithy_types::retry::RetryConfig;
use aws_types::region::Region;
use aws_types::SdkConfig;
use std::time::Duration;

const IMDS_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

fn sdk_imds_client() -> imds::Client {
    imds::Client::builder()
        .connect_timeout(IMDS_CONNECT_TIMEOUT)
        .build()
}

/// Builds an SDK configuration using the default credentials chain, backed by
/// IMDS for instance roles. The region is set only when the caller resolved
/// one; a run without a region is allowed to proceed and fails at the service
/// call instead. Requests are not retried; a failed call is fatal to the run
/// and the whole operation is safe to re-run.
pub(crate) async fn sdk_config(region: Option<&str>) -> SdkConfig {
    let provider = DefaultCredentialsChain::builder()
        .imds_client(sdk_imds_client())
        .build()
        .await;

    let mut loader = aws_config::defaults(BehaviorVersion::v2023_11_09())
        .credentials_provider(provider)
        .retry_config(RetryConfig::disabled());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_owned()));
    }
    loader.load().await
}
