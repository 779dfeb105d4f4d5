//! Clients for every external collaborator named in spec §6: the job
//! registry, the local vision model runtime, the image provider, and the
//! notification sink. Each is a trait with an HTTP implementation and a
//! Mock implementation for tests.

pub mod image_provider;
pub mod job_registry;
pub mod notification_sink;
pub mod vision_model;

pub use image_provider::{HttpImageProvider, ImageProvider, ImageProviderError, MockImageProvider};
pub use job_registry::{HttpJobRegistryClient, JobRegistryClient, JobRegistryError, MockJobRegistryClient};
pub use notification_sink::{
    MockNotificationSink, NotificationChannel, NotificationError, NotificationSink,
    WebhookNotificationSink,
};
pub use vision_model::{GenerateParams, GenerateResult, HttpVisionModelClient, MockVisionModelClient, VisionModelClient, VisionModelError};
