use k8s_openapi::api::core::v1::SecretKeySelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Backend configures where a repository lives. Users are expected to set only
/// one storage type.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    /// References a secret key holding the repository password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_password_secret_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Spec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b2: Option<B2Spec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<RestServerSpec>,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalSpec {
    #[serde(default)]
    pub mount_path: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Spec {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsSpec {
    #[serde(default)]
    pub bucket: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureSpec {
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwiftSpec {
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct B2Spec {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestServerSpec {
    #[serde(default)]
    pub url: String,
}

impl Backend {
    /// The repository identity of the first configured storage type (azure, b2,
    /// gcs, local, rest, s3, swift), or an empty string if none is set. Jobs with
    /// equal identities share one repository.
    pub fn repository(&self, config: &Config) -> String {
        if let Some(azure) = &self.azure {
            let path = if azure.path.is_empty() { "/" } else { &azure.path };
            return format!("azure:{}:{}", azure.container, path);
        }
        if let Some(b2) = &self.b2 {
            return format!("b2:{}:{}", b2.bucket, b2.path);
        }
        if let Some(gcs) = &self.gcs {
            return format!("gs:{}:/", gcs.bucket);
        }
        if let Some(local) = &self.local {
            return local.mount_path.clone();
        }
        if let Some(rest) = &self.rest {
            let (protocol, url) = rest.url.split_once("://").unwrap_or((rest.url.as_str(), ""));
            return format!("rest:{}://$(USER):$(PASSWORD)@{}", protocol, url);
        }
        if let Some(s3) = &self.s3 {
            let endpoint = if s3.endpoint.is_empty() {
                &config.global_s3_endpoint
            } else {
                &s3.endpoint
            };
            let bucket = if s3.bucket.is_empty() {
                &config.global_s3_bucket
            } else {
                &s3.bucket
            };
            return format!("s3:{}/{}", endpoint, bucket);
        }
        if let Some(swift) = &self.swift {
            return format!("swift:{}:{}", swift.container, swift.path);
        }
        String::new()
    }
}
