//! Probe image resolution.

use async_trait::async_trait;

use crate::error::Result;

/// Answer from an image source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSpec {
    /// Pull spec of the image containing the probe binary
    Available(String),
    /// The probes cannot run on this cluster; the lifecycle becomes a no-op
    NotSupported(String),
}

/// Supplies the probe container image for a cluster.
#[async_trait]
pub trait ImagePullSpecSource: Send + Sync {
    async fn resolve(&self) -> Result<ImageSpec>;
}

/// A fixed pull spec, as given on the command line or in configuration.
#[derive(Debug, Clone)]
pub struct StaticImage(pub String);

#[async_trait]
impl ImagePullSpecSource for StaticImage {
    async fn resolve(&self) -> Result<ImageSpec> {
        Ok(ImageSpec::Available(self.0.clone()))
    }
}
