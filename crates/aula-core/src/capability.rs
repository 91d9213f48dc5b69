//! Audio capability gate.
//!
//! The platform shell decides whether the microphone may be used (permission
//! prompt plus device acquisition). The signaling layer only ever sees the
//! granted capability, so everything above this seam can run in tests
//! without a real device.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::CapabilityDenied;

/// A live local audio track. Implemented by the platform media layer.
pub trait LocalAudioTrack: Send + Sync {
    /// Enable or disable capture. Disabled is what "muted" means on the wire.
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn close(&self);
}

/// Source of local audio tracks behind a granted capability.
pub trait AudioSource: Send + Sync {
    fn open_track(&self) -> Arc<dyn LocalAudioTrack>;
}

/// A granted microphone capability. Cheap to clone; one track is opened per
/// negotiation and closed with it.
#[derive(Clone)]
pub struct AudioCapability {
    source: Arc<dyn AudioSource>,
}

impl AudioCapability {
    pub fn new(source: Arc<dyn AudioSource>) -> Self {
        Self { source }
    }

    pub fn open_track(&self) -> Arc<dyn LocalAudioTrack> {
        self.source.open_track()
    }
}

#[async_trait]
pub trait AudioCapabilityGate: Send + Sync {
    /// Ask the platform for microphone access. May suspend on a permission
    /// prompt.
    async fn request(&self) -> Result<AudioCapability, CapabilityDenied>;
}

/// Caches a granted capability for the process lifetime. Denials are not
/// cached, so a fresh join asks the platform again.
pub struct CachingGate {
    inner: Arc<dyn AudioCapabilityGate>,
    granted: Mutex<Option<AudioCapability>>,
}

impl CachingGate {
    pub fn new(inner: Arc<dyn AudioCapabilityGate>) -> Self {
        Self {
            inner,
            granted: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AudioCapabilityGate for CachingGate {
    async fn request(&self) -> Result<AudioCapability, CapabilityDenied> {
        let mut granted = self.granted.lock().await;
        if let Some(capability) = granted.as_ref() {
            return Ok(capability.clone());
        }
        let capability = self.inner.request().await?;
        *granted = Some(capability.clone());
        Ok(capability)
    }
}
