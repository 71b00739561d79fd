use std::sync::Arc;

use aws_config::{BehaviorVersion, Region, SdkConfig};

use crate::Result;

/// Connection settings shared by the AWS-backed transports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwsSettings {
    pub profile: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

pub fn create_runtime() -> Result<Arc<tokio::runtime::Runtime>> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map(Arc::new)
        .map_err(|err| {
            crate::icebox_error!(BackendError {
                description: format!("Failed to create Tokio runtime for AWS operations: {err}"),
            })
        })
}

pub fn load_sdk_config(runtime: &tokio::runtime::Runtime, settings: &AwsSettings) -> SdkConfig {
    runtime.block_on(async {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(profile) = &settings.profile {
            loader = loader.profile_name(profile);
        }

        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }

        loader.load().await
    })
}

pub fn build_s3_client(
    runtime: &tokio::runtime::Runtime,
    settings: &AwsSettings,
) -> aws_sdk_s3::Client {
    let config = load_sdk_config(runtime, settings);
    let mut builder = aws_sdk_s3::config::Builder::from(&config);
    if let Some(endpoint) = &settings.endpoint {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(builder.build())
}

pub fn build_glacier_client(
    runtime: &tokio::runtime::Runtime,
    settings: &AwsSettings,
) -> aws_sdk_glacier::Client {
    let config = load_sdk_config(runtime, settings);
    let mut builder = aws_sdk_glacier::config::Builder::from(&config);
    if let Some(endpoint) = &settings.endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    aws_sdk_glacier::Client::from_conf(builder.build())
}
