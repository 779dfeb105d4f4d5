//! Shared domain types for the image-analysis orchestration engine.
//!
//! Every other crate in the workspace consumes these types rather than
//! redefining them: `Process`, `Task`, `QAAttempt`, and `AuditEvent` are the
//! rows persisted by the state store, and the enums here encode the lifecycle
//! invariants enforced at every transition boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Analysis types — the closed set of 21 named variants
// ---------------------------------------------------------------------------

/// The closed set of analysis types a media item can be processed through.
///
/// Every variant must have both an Analysis profile and three Corrective
/// stages (structural, content_quality, domain_expert) defined in the
/// configuration tree; the registry's startup validation is fatal if any
/// are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisType {
    ObjectDetection,
    SceneClassification,
    TextExtraction,
    FaceDetection,
    ColorPalette,
    CompositionAnalysis,
    QualityAssessment,
    BrandLogoDetection,
    ContentModeration,
    AccessibilityAltText,
    EmotionDetection,
    ProductIdentification,
    LandmarkRecognition,
    ArtStyleClassification,
    DocumentLayout,
    TableExtraction,
    CaptionGeneration,
    DuplicateDetection,
    WatermarkDetection,
    AgeEstimation,
    SafetyHazardDetection,
}

impl AnalysisType {
    /// All 21 variants, in a stable order — used by the registry at startup
    /// to verify the closed set is fully covered by configuration.
    pub const ALL: [AnalysisType; 21] = [
        AnalysisType::ObjectDetection,
        AnalysisType::SceneClassification,
        AnalysisType::TextExtraction,
        AnalysisType::FaceDetection,
        AnalysisType::ColorPalette,
        AnalysisType::CompositionAnalysis,
        AnalysisType::QualityAssessment,
        AnalysisType::BrandLogoDetection,
        AnalysisType::ContentModeration,
        AnalysisType::AccessibilityAltText,
        AnalysisType::EmotionDetection,
        AnalysisType::ProductIdentification,
        AnalysisType::LandmarkRecognition,
        AnalysisType::ArtStyleClassification,
        AnalysisType::DocumentLayout,
        AnalysisType::TableExtraction,
        AnalysisType::CaptionGeneration,
        AnalysisType::DuplicateDetection,
        AnalysisType::WatermarkDetection,
        AnalysisType::AgeEstimation,
        AnalysisType::SafetyHazardDetection,
    ];

    /// The slug used as a queue key and as a configuration filename stem.
    pub fn slug(&self) -> &'static str {
        match self {
            AnalysisType::ObjectDetection => "object_detection",
            AnalysisType::SceneClassification => "scene_classification",
            AnalysisType::TextExtraction => "text_extraction",
            AnalysisType::FaceDetection => "face_detection",
            AnalysisType::ColorPalette => "color_palette",
            AnalysisType::CompositionAnalysis => "composition_analysis",
            AnalysisType::QualityAssessment => "quality_assessment",
            AnalysisType::BrandLogoDetection => "brand_logo_detection",
            AnalysisType::ContentModeration => "content_moderation",
            AnalysisType::AccessibilityAltText => "accessibility_alt_text",
            AnalysisType::EmotionDetection => "emotion_detection",
            AnalysisType::ProductIdentification => "product_identification",
            AnalysisType::LandmarkRecognition => "landmark_recognition",
            AnalysisType::ArtStyleClassification => "art_style_classification",
            AnalysisType::DocumentLayout => "document_layout",
            AnalysisType::TableExtraction => "table_extraction",
            AnalysisType::CaptionGeneration => "caption_generation",
            AnalysisType::DuplicateDetection => "duplicate_detection",
            AnalysisType::WatermarkDetection => "watermark_detection",
            AnalysisType::AgeEstimation => "age_estimation",
            AnalysisType::SafetyHazardDetection => "safety_hazard_detection",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.slug() == slug)
    }
}

// ---------------------------------------------------------------------------
// QA tiers
// ---------------------------------------------------------------------------

/// One of the three QA stages run in order against a task's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaTier {
    Structural,
    ContentQuality,
    DomainExpert,
}

impl QaTier {
    pub const ORDER: [QaTier; 3] = [QaTier::Structural, QaTier::ContentQuality, QaTier::DomainExpert];

    pub fn slug(&self) -> &'static str {
        match self {
            QaTier::Structural => "structural",
            QaTier::ContentQuality => "content_quality",
            QaTier::DomainExpert => "domain_expert",
        }
    }

    /// The tier that follows this one, if any.
    pub fn next(&self) -> Option<QaTier> {
        match self {
            QaTier::Structural => Some(QaTier::ContentQuality),
            QaTier::ContentQuality => Some(QaTier::DomainExpert),
            QaTier::DomainExpert => None,
        }
    }
}

/// Maximum QA attempts allowed per tier, per Task invariant #4.
pub const MAX_QA_ATTEMPTS_PER_TIER: u32 = 3;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Initializing,
    Processing,
    Completed,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Completed | ProcessStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTotals {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub manual_review: u32,
}

impl TaskTotals {
    pub fn new(total: u32) -> Self {
        Self { total, completed: 0, failed: 0, manual_review: 0 }
    }

    /// Invariant #3: completed + failed + manual_review <= total.
    pub fn is_consistent(&self) -> bool {
        self.completed + self.failed + self.manual_review <= self.total
    }

    pub fn is_exhausted(&self) -> bool {
        self.completed + self.failed + self.manual_review == self.total
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    pub external_client_id: String,
    pub external_project_id: String,
    pub status: ProcessStatus,
    pub totals: TaskTotals,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// JSON-serialized snapshot of the profile set active at acquisition time.
    pub config_snapshot: String,
    /// JSON-serialized `Vec<MediaRef>` from the job that created this
    /// process, kept so a worker resolving a lone `task.media_id` can look
    /// up the image source paths without re-querying the job registry.
    pub media_refs: String,
    /// Set once the `processing` status update has been submitted to the
    /// registry, so the ordering guarantee in spec §4.F ("exactly one
    /// processing update") can be enforced idempotently.
    pub processing_status_sent: bool,
    pub completed_status_sent: bool,
}

impl Process {
    pub fn new(
        external_client_id: String,
        external_project_id: String,
        total_tasks: u32,
        config_snapshot: String,
        media_refs: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_client_id,
            external_project_id,
            status: ProcessStatus::Initializing,
            totals: TaskTotals::new(total_tasks),
            created_at: Utc::now(),
            completed_at: None,
            config_snapshot,
            media_refs,
            processing_status_sent: false,
            completed_status_sent: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A task's lifecycle status. Terminal states are absorbing (invariant #2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    AwaitingQa,
    Completed,
    Failed,
    ManualReview,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::ManualReview)
    }

    /// Whether `self -> to` is a legal transition. Mirrors the state machine
    /// in spec §4.E plus the worker/lease transitions from §4.B/§4.D.
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, to),
            (Pending, Running)
                | (Running, AwaitingQa)
                | (Running, Failed)
                | (Running, Pending) // reclaimed lease
                | (AwaitingQa, AwaitingQa) // QA replaces output, stays in-tier
                | (AwaitingQa, Completed)
                | (AwaitingQa, ManualReview)
                | (AwaitingQa, Pending) // reclaimed lease mid-QA
                | (AwaitingQa, Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub process_id: Uuid,
    pub media_id: String,
    pub analysis_type: AnalysisType,
    pub status: TaskStatus,
    /// Attempt counter per tier, indexed by `QaTier::ORDER` position.
    pub qa_attempts_by_tier: [u32; 3],
    pub confidence: Option<f64>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Path (or store key) of the raw analysis artifact, replaced on every
    /// corrective rewrite.
    pub raw_output_path: Option<String>,
    /// The structured output that passed (or is currently working through)
    /// QA — what `on_task_completed` submits as `analysisResult`.
    pub result: Option<serde_json::Value>,
    /// The profile version pinned for this task at QA entry (invariant:
    /// "tasks already in T2 with the old list complete under the old
    /// rules" — profile version is pinned per-task at QA entry).
    pub profile_version: Option<u64>,
    pub lease_owner: Option<String>,
    pub lease_deadline: Option<DateTime<Utc>>,
    /// Whether this task's result has already been submitted to the
    /// registry — makes `on_task_completed` idempotent per spec §4.F.
    pub submission_sent: bool,
    /// Number of times this task's lease has expired and been reclaimed
    /// back to `pending`.
    pub attempt_count: u32,
}

impl Task {
    pub fn new(process_id: Uuid, media_id: String, analysis_type: AnalysisType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            process_id,
            media_id,
            analysis_type,
            status: TaskStatus::Pending,
            qa_attempts_by_tier: [0, 0, 0],
            confidence: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            raw_output_path: None,
            result: None,
            profile_version: None,
            lease_owner: None,
            lease_deadline: None,
            submission_sent: false,
            attempt_count: 0,
        }
    }

    pub fn attempts_for(&self, tier: QaTier) -> u32 {
        self.qa_attempts_by_tier[QaTier::ORDER.iter().position(|t| *t == tier).unwrap()]
    }

    pub fn queue_key(&self) -> String {
        self.analysis_type.slug().to_string()
    }
}

// ---------------------------------------------------------------------------
// QAAttempt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaOutcome {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaAttempt {
    pub id: Uuid,
    pub task_id: Uuid,
    pub tier: QaTier,
    /// 1-indexed, monotonic per (task, tier), capped at `MAX_QA_ATTEMPTS_PER_TIER`.
    pub attempt_index: u32,
    pub outcome: QaOutcome,
    pub failure_categories: Vec<String>,
    /// Corrective prompt id applied to produce the output that was *checked
    /// by* this attempt — nullable for the first attempt of a tier.
    pub corrective_prompt_id: Option<String>,
    pub confidence: Option<f64>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl QaAttempt {
    pub fn new(task_id: Uuid, tier: QaTier, attempt_index: u32, outcome: QaOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            tier,
            attempt_index,
            outcome,
            failure_categories: Vec::new(),
            corrective_prompt_id: None,
            confidence: None,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub process_id: Uuid,
    pub task_id: Option<Uuid>,
    pub kind: String,
    pub severity: AuditSeverity,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Monotonic per-process sequence number; total ordering per invariant #6.
    pub sequence: u64,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    High,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
