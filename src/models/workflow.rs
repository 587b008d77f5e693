// src/models/workflow.rs
//! Multi-signer routing workflow aggregate.
//!
//! A [`Workflow`] owns its [`Signer`]s, and each signer owns its [`Field`]s.
//! They are plain values inside the aggregate: every mutation goes through the
//! parent and is persisted by one conditional save of the whole workflow.
//!
//! Signers are grouped into cohorts by `seq`. A cohort becomes actionable only
//! once every signer with a lower `seq` has completed.

use crate::models::document::DocumentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-signer progress. One-way: `Pending -> Completed`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignerStatus {
    #[default]
    Pending,
    Completed,
}

/// Derived workflow state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Complete,
}

/// What a placed field asks the signer for.
///
/// Signature capture modes sent by the signing page (`draw`, `type`,
/// `upload`) are all signatures as far as routing and rendering go.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[serde(alias = "draw", alias = "type", alias = "upload")]
    Signature,
    Text,
    Initials,
    Date,
}

impl FieldKind {
    /// Signature-like fields are drawn with the signer's chosen style.
    pub fn is_handwritten(self) -> bool {
        matches!(self, FieldKind::Signature | FieldKind::Initials)
    }
}

fn default_page() -> u32 {
    1
}

fn default_required() -> bool {
    true
}

/// A placed placeholder owned by one signer.
///
/// Coordinates are in the viewport reference scale of the placement UI, with
/// the origin at the top-left corner of the page.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Field {
    /// Client-assigned id (e.g. `f-1712345678`)
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// 1-based page number
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub font: Option<String>,
}

impl Field {
    /// Overwrites the captured value and styling from a submission.
    fn apply(&mut self, input: &FieldInput) {
        self.value = Some(input.value.clone());
        self.color = input.color.clone();
        self.font = input.font.clone();
        if let Some(kind) = input.kind {
            self.kind = kind;
        }
    }

    fn clear_captured(&mut self) {
        self.value = None;
        self.color = None;
        self.font = None;
    }
}

/// One submitted field value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FieldInput {
    pub field_id: String,
    pub value: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub font: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<FieldKind>,
}

/// A routed participant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Signer {
    /// Server-assigned, stable across saves
    pub id: String,
    pub name: String,
    pub email: String,
    /// Step number; signers sharing a seq form a parallel cohort
    pub seq: u32,
    #[serde(default)]
    pub status: SignerStatus,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
}

impl Signer {
    pub fn is_completed(&self) -> bool {
        self.status == SignerStatus::Completed
    }

    /// Merges submitted values into this signer's fields.
    ///
    /// Inputs naming a field this signer does not own are ignored.
    ///
    /// # Returns
    /// Number of inputs that matched a field.
    pub fn apply_fields(&mut self, inputs: &[FieldInput]) -> usize {
        let mut matched = 0;
        for input in inputs {
            if let Some(field) = self.fields.iter_mut().find(|f| f.id == input.field_id) {
                field.apply(input);
                matched += 1;
            }
        }
        matched
    }

    /// Flips the signer to `Completed`.
    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.status = SignerStatus::Completed;
        self.signed_at = Some(at);
    }
}

/// Signer as supplied when a workflow is created.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewSigner {
    pub name: String,
    pub email: String,
    pub seq: u32,
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// A single document's routing instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Workflow {
    pub id: String,
    pub title: String,
    pub source_pdf_path: String,
    pub document_hash: DocumentHash,
    pub signers: Vec<Signer>,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Builds a fresh workflow, assigning ids to the workflow and each signer.
    ///
    /// Seq values are taken as given. Any field values present in the input
    /// are discarded: values only appear once their signer completes.
    pub fn new(
        title: String,
        source_pdf_path: String,
        document_hash: DocumentHash,
        signers: Vec<NewSigner>,
    ) -> Self {
        let signers = signers
            .into_iter()
            .map(|s| {
                let mut fields = s.fields;
                fields.iter_mut().for_each(Field::clear_captured);
                Signer {
                    id: Uuid::new_v4().to_string(),
                    name: s.name,
                    email: s.email,
                    seq: s.seq,
                    status: SignerStatus::Pending,
                    fields,
                    signed_at: None,
                }
            })
            .collect();

        Workflow {
            id: Uuid::new_v4().to_string(),
            title,
            source_pdf_path,
            document_hash,
            signers,
            created_at: Utc::now(),
        }
    }

    pub fn signer(&self, signer_id: &str) -> Option<&Signer> {
        self.signers.iter().find(|s| s.id == signer_id)
    }

    pub fn signer_mut(&mut self, signer_id: &str) -> Option<&mut Signer> {
        self.signers.iter_mut().find(|s| s.id == signer_id)
    }

    /// `Complete` once every signer has completed.
    pub fn status(&self) -> WorkflowStatus {
        if self.signers.iter().all(Signer::is_completed) {
            WorkflowStatus::Complete
        } else {
            WorkflowStatus::InProgress
        }
    }

    /// Lowest seq that still has a pending signer.
    pub fn active_seq(&self) -> Option<u32> {
        self.signers
            .iter()
            .filter(|s| !s.is_completed())
            .map(|s| s.seq)
            .min()
    }

    /// The completed step whose successor cohort is currently waiting.
    ///
    /// `None` when the workflow is complete or the waiting cohort sits behind
    /// a gap, since routing never reached it.
    pub fn resume_point(&self) -> Option<u32> {
        let previous = self.active_seq()?.checked_sub(1)?;
        if previous == 0 || self.signers.iter().any(|s| s.seq == previous) {
            Some(previous)
        } else {
            None
        }
    }

    /// Whether every signer ahead of `seq` has completed.
    pub fn is_seq_unlocked(&self, seq: u32) -> bool {
        self.signers
            .iter()
            .filter(|s| s.seq < seq)
            .all(Signer::is_completed)
    }

    /// Signers in cohort `seq` that have not completed yet.
    pub fn pending_in_cohort(&self, seq: u32) -> impl Iterator<Item = &Signer> {
        self.signers
            .iter()
            .filter(move |s| s.seq == seq && !s.is_completed())
    }

    /// Pending signers of the cohort that follows `completed_seq`.
    pub fn next_cohort(&self, completed_seq: u32) -> Vec<&Signer> {
        match completed_seq.checked_add(1) {
            Some(target) => self.pending_in_cohort(target).collect(),
            None => Vec::new(),
        }
    }

    /// Signers whose marks may be drawn.
    pub fn completed_signers(&self) -> Vec<Signer> {
        self.signers
            .iter()
            .filter(|s| s.is_completed())
            .cloned()
            .collect()
    }

    /// True when the distinct seq values are not exactly `1..=k`.
    ///
    /// Routing never jumps a gap, so such a workflow stalls at the gap.
    pub fn has_seq_gap(&self) -> bool {
        let mut seqs: Vec<u32> = self.signers.iter().map(|s| s.seq).collect();
        seqs.sort_unstable();
        seqs.dedup();
        seqs.iter().enumerate().any(|(i, seq)| *seq != i as u32 + 1)
    }
}

/// Workflow as returned to clients, with its derived state.
#[derive(Serialize, Debug, Clone)]
pub struct WorkflowView {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub status: WorkflowStatus,
    pub active_seq: Option<u32>,
}

impl From<Workflow> for WorkflowView {
    fn from(workflow: Workflow) -> Self {
        let status = workflow.status();
        let active_seq = workflow.active_seq();
        WorkflowView { workflow, status, active_seq }
    }
}
