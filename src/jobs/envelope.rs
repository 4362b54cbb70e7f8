//! The typed payload carried in a job-runner queue.
//!
//! A [`WorkItem`] declares a stable `type_name`, the same way a
//! [`crate::bus::Message`] does, and the envelope carries that name as an
//! opaque string key rather than a reflected runtime type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serializer::{Serializer, SerializerResult};

/// A payload type a job runner can dispatch. `type_name` is the stable
/// registry key a [`WorkItemEnvelope`] carries on the wire in place of a
/// reflected runtime type name.
pub trait WorkItem: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn type_name() -> &'static str
    where
        Self: Sized;
}

/// Envelope enqueued on the job runner's queue; the decoded payload lives
/// in `payload` as serializer-encoded bytes until a registered handler for
/// `type_name` claims and decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemEnvelope {
    pub work_item_id: Uuid,
    pub type_name: String,
    pub payload: Vec<u8>,
    pub send_progress_reports: bool,
    pub unique_id: Uuid,
    pub sub_metric_name: Option<String>,
}

impl WorkItemEnvelope {
    pub fn new<T: WorkItem>(
        payload: &T,
        serializer: &impl Serializer,
        send_progress_reports: bool,
    ) -> SerializerResult<Self> {
        Ok(Self {
            work_item_id: Uuid::new_v4(),
            type_name: T::type_name().to_string(),
            payload: serializer.serialize(payload)?,
            send_progress_reports,
            unique_id: Uuid::new_v4(),
            sub_metric_name: None,
        })
    }

    pub fn with_sub_metric_name(mut self, name: impl Into<String>) -> Self {
        self.sub_metric_name = Some(name.into());
        self
    }
}

/// A progress status message published on the bus while a work item is
/// processed: `{workItemId, percent, message}` at 0, intermediate, and
/// 100/-1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemStatus {
    pub work_item_id: Uuid,
    /// `0` at start, caller-reported values in between, `100` on success,
    /// `-1` on failure.
    pub progress: i8,
    pub message: String,
    pub type_name: String,
}

impl crate::bus::Message for WorkItemStatus {
    fn type_name() -> &'static str {
        "WorkItemStatus"
    }
}
