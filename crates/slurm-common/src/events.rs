//! Kubernetes Events published by the NodeSet and Cluster controllers
//!
//! Pod and claim writes are reported on the owning NodeSet; Slurm client
//! changes and spec problems on the Cluster. Publishing never fails a
//! reconcile: API errors are logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

/// reportingComponent of events written by the NodeSet controller
pub const NODESET_REPORTER: &str = "nodeset-controller";
/// reportingComponent of events written by the Cluster controller
pub const CLUSTER_REPORTER: &str = "cluster-controller";
/// Environment variable naming the operator pod, used as reportingInstance
const POD_NAME_ENV: &str = "POD_NAME";

/// Sink for controller events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Attach an event to `regarding`. Never fails.
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the API server's events.k8s.io API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `reporter` is one of [`NODESET_REPORTER`] or [`CLUSTER_REPORTER`]
    pub fn new(client: Client, reporter: &str) -> Self {
        let reporter = Reporter {
            controller: reporter.to_string(),
            instance: std::env::var(POD_NAME_ENV).ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            warn!(
                reason,
                object = regarding.name.as_deref().unwrap_or_default(),
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

/// Write applied to a pod or claim on behalf of a NodeSet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// Object creation
    Create,
    /// Object update
    Update,
    /// Object deletion
    Delete,
}

impl Verb {
    /// `SuccessfulCreate`, `FailedUpdate`, ...
    pub fn reason(self, failed: bool) -> &'static str {
        match (self, failed) {
            (Verb::Create, false) => reasons::SUCCESSFUL_CREATE,
            (Verb::Create, true) => reasons::FAILED_CREATE,
            (Verb::Update, false) => reasons::SUCCESSFUL_UPDATE,
            (Verb::Update, true) => reasons::FAILED_UPDATE,
            (Verb::Delete, false) => reasons::SUCCESSFUL_DELETE,
            (Verb::Delete, true) => reasons::FAILED_DELETE,
        }
    }

    /// Action column of the event
    pub fn action(self) -> &'static str {
        match self {
            Verb::Create => actions::CREATE,
            Verb::Update => actions::UPDATE,
            Verb::Delete => actions::DELETE,
        }
    }

    /// Lowercase form used at the start of event notes
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }

    /// Normal on success, Warning on failure
    pub fn event_type(failed: bool) -> EventType {
        if failed {
            EventType::Warning
        } else {
            EventType::Normal
        }
    }
}

/// An event captured by [`RecordingEventPublisher`]
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// Name of the object the event was attached to
    pub object: Option<String>,
    /// True for Warning events
    pub warning: bool,
    /// Event reason
    pub reason: String,
    /// Event action
    pub action: String,
    /// Event message
    pub note: Option<String>,
}

/// Keeps every event in memory, in emission order
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons of everything published so far
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.events.lock().push(RecordedEvent {
            object: regarding.name.clone(),
            warning: matches!(type_, EventType::Warning),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}

/// Event reasons, shown under REASON in `kubectl get events`
pub mod reasons {
    /// Pod or claim created
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    /// Pod or claim creation failed
    pub const FAILED_CREATE: &str = "FailedCreate";
    /// Pod rewritten to match its NodeSet
    pub const SUCCESSFUL_UPDATE: &str = "SuccessfulUpdate";
    /// Pod or claim rewrite failed
    pub const FAILED_UPDATE: &str = "FailedUpdate";
    /// Pod deleted
    pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
    /// Pod deletion failed
    pub const FAILED_DELETE: &str = "FailedDelete";
    /// A claim is controlled by something other than the NodeSet or its pod
    pub const CONFLICTING_CONTROLLER: &str = "ConflictingController";
    /// Cluster spec is unusable
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// Slurm client for a Cluster installed or replaced
    pub const CLIENT_UPDATED: &str = "ClientUpdated";
}

/// Event actions
pub mod actions {
    /// Whole-object reconcile
    pub const RECONCILE: &str = "Reconcile";
    /// Object creation
    pub const CREATE: &str = "Create";
    /// Object update
    pub const UPDATE: &str = "Update";
    /// Object deletion
    pub const DELETE: &str = "Delete";
}
