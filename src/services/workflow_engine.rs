// src/services/workflow_engine.rs
//! Sequential multi-signer workflow engine.
//!
//! Handlers are stateless: every operation loads the workflow aggregate from
//! the store, mutates it in memory and writes it back with a version-checked
//! save. A save that loses a race is retried from a fresh load, so cohort
//! members completing at the same time never overwrite each other, and only
//! the save that empties a cohort triggers the next step's invitations.
//!
//! Invitations are queued only after the save. If they are lost (crash or
//! restart before delivery) the stored state is unchanged and
//! [`WorkflowEngine::resend_invitations`] queues them again.

use crate::models::document::DocumentHash;
use crate::models::workflow::{FieldInput, NewSigner, Workflow, WorkflowStatus};
use crate::services::error::ServiceError;
use crate::services::notification::Notifier;
use crate::services::renderer::DocumentRenderer;
use crate::storage::sqlite_store::{SqliteStore, VersionedWorkflow};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Acknowledgement for a completed sign step.
#[derive(Debug, Clone, Serialize)]
pub struct SignStepReceipt {
    pub workflow_id: String,
    pub signer_id: String,
    /// Submitted values that matched one of the signer's fields
    pub fields_applied: usize,
    /// True when this submission completed the signer's cohort
    pub step_complete: bool,
    pub workflow_status: WorkflowStatus,
}

/// Routes documents through ordered cohorts of signers.
pub struct WorkflowEngine {
    store: Arc<SqliteStore>,
    notifier: Notifier,
    renderer: Arc<dyn DocumentRenderer>,
    conflict_retries: u32,
}

impl WorkflowEngine {
    /// # Arguments
    /// * `store` - Workflow document store
    /// * `notifier` - Queue for signing invitations
    /// * `renderer` - Backend for `render_current_state`
    /// * `conflict_retries` - Extra attempts after a lost version check
    pub fn new(
        store: Arc<SqliteStore>,
        notifier: Notifier,
        renderer: Arc<dyn DocumentRenderer>,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            notifier,
            renderer,
            conflict_retries,
        }
    }

    /// Creates and persists a workflow, then invites the first cohort.
    ///
    /// Seq values are taken as given. A gap in the sequence is accepted but
    /// routing will stop at it.
    ///
    /// # Errors
    /// `Validation` for an empty title, no signers, or a signer without name,
    /// email or a positive seq.
    pub fn create_workflow(
        &self,
        title: &str,
        source_pdf_path: &str,
        document_hash: DocumentHash,
        signers: Vec<NewSigner>,
    ) -> Result<Workflow, ServiceError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ServiceError::Validation("title is required".into()));
        }
        if source_pdf_path.trim().is_empty() {
            return Err(ServiceError::Validation("source pdf path is required".into()));
        }
        if signers.is_empty() {
            return Err(ServiceError::Validation("at least one signer is required".into()));
        }
        for signer in &signers {
            if signer.name.trim().is_empty() || !signer.email.contains('@') {
                return Err(ServiceError::Validation(format!(
                    "signer {:?} needs a name and a valid email",
                    signer.name
                )));
            }
            if signer.seq == 0 {
                return Err(ServiceError::Validation(format!(
                    "signer {} has seq 0; steps start at 1",
                    signer.email
                )));
            }
        }

        let workflow = Workflow::new(
            title.to_string(),
            source_pdf_path.to_string(),
            document_hash,
            signers,
        );
        if workflow.has_seq_gap() {
            warn!(
                "Workflow {} has non-contiguous steps; routing will stop at the first gap",
                workflow.id
            );
        }

        self.store.insert_workflow(&workflow)?;
        info!(
            "Created workflow {} \"{}\" with {} signers",
            workflow.id,
            workflow.title,
            workflow.signers.len()
        );

        if let Err(e) = self.notify_step(&workflow.id, 0) {
            warn!("Could not invite first step of workflow {}: {}", workflow.id, e);
        }
        Ok(workflow)
    }

    /// Invites the pending signers of step `completed_seq + 1`.
    ///
    /// # Returns
    /// Number of invitations queued; zero is not an error.
    pub fn notify_step(&self, workflow_id: &str, completed_seq: u32) -> Result<usize, ServiceError> {
        let workflow = self.load(workflow_id)?.workflow;
        Ok(self.invite_next(&workflow, completed_seq))
    }

    /// Re-queues invitations for the cohort the workflow is waiting on.
    ///
    /// # Returns
    /// Number of invitations queued. Zero for a complete workflow or one
    /// stalled behind a seq gap.
    pub fn resend_invitations(&self, workflow_id: &str) -> Result<usize, ServiceError> {
        let workflow = self.load(workflow_id)?.workflow;
        match workflow.resume_point() {
            Some(completed_seq) => {
                info!("Resending invitations for workflow {}", workflow.id);
                Ok(self.invite_next(&workflow, completed_seq))
            }
            None => {
                debug!("Workflow {} has no reachable pending step", workflow.id);
                Ok(0)
            }
        }
    }

    fn invite_next(&self, workflow: &Workflow, completed_seq: u32) -> usize {
        let cohort = workflow.next_cohort(completed_seq);
        for signer in &cohort {
            self.notifier.invite(workflow, signer);
        }

        if !cohort.is_empty() {
            info!(
                "Workflow {} advanced to step {} ({} signers)",
                workflow.id,
                completed_seq.saturating_add(1),
                cohort.len()
            );
        } else if workflow.status() == WorkflowStatus::Complete {
            info!("Workflow {} complete", workflow.id);
        } else {
            debug!(
                "Workflow {} has no pending signers at step {}",
                workflow.id,
                completed_seq.saturating_add(1)
            );
        }
        cohort.len()
    }

    fn load(&self, workflow_id: &str) -> Result<VersionedWorkflow, ServiceError> {
        self.store
            .load_workflow(workflow_id)?
            .ok_or_else(|| ServiceError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Records a signer's field values and completes their step.
    ///
    /// Inputs naming fields the signer does not own are ignored. The workflow
    /// is saved before any invitation is queued.
    ///
    /// # Errors
    /// - `WorkflowNotFound` / `SignerNotFound`
    /// - `SignerAlreadyCompleted` when the signer already submitted
    /// - `StepNotActive` while an earlier cohort is still pending
    /// - `Conflict` when every retry lost the version check
    pub fn submit_sign_step(
        &self,
        workflow_id: &str,
        signer_id: &str,
        fields: &[FieldInput],
    ) -> Result<SignStepReceipt, ServiceError> {
        for attempt in 0..=self.conflict_retries {
            let VersionedWorkflow { mut workflow, version } = self.load(workflow_id)?;

            let signer = workflow.signer(signer_id).ok_or_else(|| ServiceError::SignerNotFound {
                workflow_id: workflow_id.to_string(),
                signer_id: signer_id.to_string(),
            })?;
            if signer.is_completed() {
                return Err(ServiceError::SignerAlreadyCompleted(signer_id.to_string()));
            }
            let seq = signer.seq;
            if !workflow.is_seq_unlocked(seq) {
                return Err(ServiceError::StepNotActive {
                    signer_id: signer_id.to_string(),
                    seq,
                });
            }

            let mut fields_applied = 0;
            if let Some(signer) = workflow.signer_mut(signer_id) {
                fields_applied = signer.apply_fields(fields);
                signer.complete(Utc::now());
            }
            if fields_applied < fields.len() {
                debug!(
                    "Ignored {} unmatched field values from signer {}",
                    fields.len() - fields_applied,
                    signer_id
                );
            }

            if !self.store.save_workflow(&workflow, version)? {
                warn!(
                    "Workflow {} changed during sign step (attempt {}), reloading",
                    workflow_id,
                    attempt + 1
                );
                continue;
            }
            info!("Signer {} completed step {} of workflow {}", signer_id, seq, workflow_id);

            let step_complete = workflow.pending_in_cohort(seq).next().is_none();
            if step_complete {
                self.invite_next(&workflow, seq);
            }

            return Ok(SignStepReceipt {
                workflow_id: workflow.id.clone(),
                signer_id: signer_id.to_string(),
                fields_applied,
                step_complete,
                workflow_status: workflow.status(),
            });
        }

        Err(ServiceError::Conflict(format!(
            "workflow {} kept changing; refresh and retry",
            workflow_id
        )))
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, ServiceError> {
        Ok(self.load(workflow_id)?.workflow)
    }

    /// Workflows created for a document, oldest first.
    pub fn workflows_for_document(&self, document_hash: &DocumentHash) -> Result<Vec<Workflow>, ServiceError> {
        Ok(self.store.workflows_for_document(document_hash)?)
    }

    /// Composites the source PDF with every completed signer's marks.
    pub fn render_current_state(&self, workflow_id: &str) -> Result<Vec<u8>, ServiceError> {
        let workflow = self.get_workflow(workflow_id)?;
        let signers = workflow.completed_signers();

        self.renderer
            .render(Path::new(&workflow.source_pdf_path), &signers, &workflow.id)
            .map_err(|e| {
                error!("Rendering workflow {} failed: {}", workflow_id, e);
                ServiceError::Render(e.to_string())
            })
    }

    /// The unmodified source PDF.
    pub fn source_pdf(&self, workflow_id: &str) -> Result<Vec<u8>, ServiceError> {
        let workflow = self.get_workflow(workflow_id)?;
        Ok(std::fs::read(&workflow.source_pdf_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::{Field, FieldKind, SignerStatus};
    use crate::services::error::ErrorKind;
    use crate::services::notification::SigningInvitation;
    use crate::services::renderer::PassthroughRenderer;
    use std::sync::Barrier;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn engine() -> (Arc<WorkflowEngine>, UnboundedReceiver<SigningInvitation>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (notifier, rx) = Notifier::channel("http://localhost:3000");
        let engine = WorkflowEngine::new(store, notifier, Arc::new(PassthroughRenderer), 3);
        (Arc::new(engine), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<SigningInvitation>) -> Vec<SigningInvitation> {
        let mut out = Vec::new();
        while let Ok(invitation) = rx.try_recv() {
            out.push(invitation);
        }
        out
    }

    fn signer(name: &str, seq: u32) -> NewSigner {
        NewSigner {
            name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            seq,
            fields: vec![Field {
                id: format!("sig-{}", name),
                kind: FieldKind::Signature,
                x: 50.0,
                y: 600.0,
                width: 140.0,
                height: 40.0,
                page: 1,
                required: true,
                value: None,
                color: None,
                font: None,
            }],
        }
    }

    fn value(field_id: &str, value: &str) -> FieldInput {
        FieldInput {
            field_id: field_id.to_string(),
            value: value.to_string(),
            color: Some("#000080".into()),
            font: None,
            kind: None,
        }
    }

    fn create(engine: &WorkflowEngine, signers: Vec<NewSigner>) -> Workflow {
        engine
            .create_workflow("Lease", "uploads/lease.pdf", DocumentHash::of(b"lease"), signers)
            .unwrap()
    }

    fn id_of(workflow: &Workflow, name: &str) -> String {
        workflow.signers.iter().find(|s| s.name == name).unwrap().id.clone()
    }

    #[test]
    fn test_create_invites_first_cohort() {
        let (engine, mut rx) = engine();
        let wf = create(&engine, vec![signer("A", 1), signer("B", 1), signer("C", 2)]);

        let invited: Vec<String> = drain(&mut rx).into_iter().map(|i| i.signer_name).collect();
        assert_eq!(invited, vec!["A", "B"]);
        assert_eq!(engine.get_workflow(&wf.id).unwrap().status(), WorkflowStatus::InProgress);
    }

    #[test]
    fn test_cohort_gates_next_step() {
        let (engine, mut rx) = engine();
        let wf = create(&engine, vec![signer("A", 1), signer("B", 1), signer("C", 2)]);
        drain(&mut rx);

        let receipt = engine
            .submit_sign_step(&wf.id, &id_of(&wf, "A"), &[value("sig-A", "Alice")])
            .unwrap();
        assert!(!receipt.step_complete);
        assert!(drain(&mut rx).is_empty());

        let err = engine
            .submit_sign_step(&wf.id, &id_of(&wf, "C"), &[value("sig-C", "Carol")])
            .unwrap_err();
        assert!(matches!(err, ServiceError::StepNotActive { seq: 2, .. }));

        let receipt = engine
            .submit_sign_step(&wf.id, &id_of(&wf, "B"), &[value("sig-B", "Bob")])
            .unwrap();
        assert!(receipt.step_complete);
        let invited = drain(&mut rx);
        assert_eq!(invited.len(), 1);
        assert_eq!(invited[0].signer_name, "C");
        assert_eq!(invited[0].link, format!("http://localhost:3000/sign/{}/{}", wf.id, id_of(&wf, "C")));
        assert_eq!(engine.get_workflow(&wf.id).unwrap().status(), WorkflowStatus::InProgress);

        let receipt = engine
            .submit_sign_step(&wf.id, &id_of(&wf, "C"), &[value("sig-C", "Carol")])
            .unwrap();
        assert_eq!(receipt.workflow_status, WorkflowStatus::Complete);
        assert!(drain(&mut rx).is_empty());

        let stored = engine.get_workflow(&wf.id).unwrap();
        assert!(stored.signers.iter().all(|s| s.status == SignerStatus::Completed));
        assert!(stored.signers.iter().all(|s| s.signed_at.is_some()));
    }

    #[test]
    fn test_second_submission_is_rejected() {
        let (engine, mut rx) = engine();
        let wf = create(&engine, vec![signer("A", 1), signer("B", 2)]);
        let a = id_of(&wf, "A");
        drain(&mut rx);

        engine.submit_sign_step(&wf.id, &a, &[value("sig-A", "first")]).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);

        let err = engine
            .submit_sign_step(&wf.id, &a, &[value("sig-A", "second")])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(drain(&mut rx).is_empty());

        let stored = engine.get_workflow(&wf.id).unwrap();
        let field = &stored.signer(&a).unwrap().fields[0];
        assert_eq!(field.value.as_deref(), Some("first"));
    }

    #[test]
    fn test_unmatched_fields_are_ignored() {
        let (engine, _rx) = engine();
        let wf = create(&engine, vec![signer("A", 1)]);
        let receipt = engine
            .submit_sign_step(
                &wf.id,
                &id_of(&wf, "A"),
                &[value("sig-A", "Alice"), value("sig-unknown", "x")],
            )
            .unwrap();
        assert_eq!(receipt.fields_applied, 1);
        assert_eq!(receipt.workflow_status, WorkflowStatus::Complete);
    }

    #[test]
    fn test_unknown_workflow_and_signer() {
        let (engine, _rx) = engine();
        let wf = create(&engine, vec![signer("A", 1)]);

        let err = engine.submit_sign_step("missing", "x", &[]).unwrap_err();
        assert!(matches!(err, ServiceError::WorkflowNotFound(_)));

        let err = engine.submit_sign_step(&wf.id, "nobody", &[]).unwrap_err();
        assert!(matches!(err, ServiceError::SignerNotFound { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(matches!(engine.get_workflow("missing"), Err(ServiceError::WorkflowNotFound(_))));
    }

    #[test]
    fn test_create_validation() {
        let (engine, mut rx) = engine();
        let hash = DocumentHash::of(b"x");
        assert!(engine.create_workflow(" ", "p.pdf", hash.clone(), vec![signer("A", 1)]).is_err());
        assert!(engine.create_workflow("T", "p.pdf", hash.clone(), vec![]).is_err());
        assert!(engine.create_workflow("T", "p.pdf", hash, vec![signer("A", 0)]).is_err());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_seq_gap_stalls() {
        let (engine, mut rx) = engine();
        let wf = create(&engine, vec![signer("A", 1), signer("C", 3)]);
        drain(&mut rx);

        let receipt = engine
            .submit_sign_step(&wf.id, &id_of(&wf, "A"), &[value("sig-A", "Alice")])
            .unwrap();
        assert!(receipt.step_complete);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(engine.notify_step(&wf.id, 1).unwrap(), 0);
        assert_eq!(engine.get_workflow(&wf.id).unwrap().active_seq(), Some(3));
    }

    #[test]
    fn test_lost_invitations_can_be_resent() {
        let (engine, mut rx) = engine();
        let wf = create(&engine, vec![signer("A", 1), signer("B", 1), signer("C", 2)]);
        drain(&mut rx);

        assert_eq!(engine.resend_invitations(&wf.id).unwrap(), 2);
        let resent: Vec<String> = drain(&mut rx).into_iter().map(|i| i.signer_name).collect();
        assert_eq!(resent, vec!["A", "B"]);

        engine
            .submit_sign_step(&wf.id, &id_of(&wf, "A"), &[value("sig-A", "Alice")])
            .unwrap();
        engine
            .submit_sign_step(&wf.id, &id_of(&wf, "B"), &[value("sig-B", "Bob")])
            .unwrap();
        drain(&mut rx);

        assert_eq!(engine.resend_invitations(&wf.id).unwrap(), 1);
        let invited = drain(&mut rx);
        assert_eq!(invited[0].signer_name, "C");
        assert_eq!(invited[0].seq, 2);
        assert_eq!(engine.get_workflow(&wf.id).unwrap().status(), WorkflowStatus::InProgress);

        engine
            .submit_sign_step(&wf.id, &id_of(&wf, "C"), &[value("sig-C", "Carol")])
            .unwrap();
        assert_eq!(engine.resend_invitations(&wf.id).unwrap(), 0);
        assert!(matches!(
            engine.resend_invitations("missing"),
            Err(ServiceError::WorkflowNotFound(_))
        ));
    }

    #[test]
    fn test_resend_does_not_jump_a_gap() {
        let (engine, mut rx) = engine();
        let wf = create(&engine, vec![signer("A", 1), signer("C", 3)]);
        engine
            .submit_sign_step(&wf.id, &id_of(&wf, "A"), &[value("sig-A", "Alice")])
            .unwrap();
        drain(&mut rx);

        assert_eq!(engine.resend_invitations(&wf.id).unwrap(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_concurrent_cohort_triggers_exactly_one_advance() {
        for _ in 0..10 {
            let (engine, mut rx) = engine();
            let wf = create(&engine, vec![signer("A", 1), signer("B", 1), signer("C", 2)]);
            drain(&mut rx);

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = ["A", "B"]
                .iter()
                .map(|name| {
                    let engine = Arc::clone(&engine);
                    let barrier = Arc::clone(&barrier);
                    let wf_id = wf.id.clone();
                    let signer_id = id_of(&wf, name);
                    let field = value(&format!("sig-{}", name), name);
                    std::thread::spawn(move || {
                        barrier.wait();
                        engine.submit_sign_step(&wf_id, &signer_id, &[field])
                    })
                })
                .collect();

            let receipts: Vec<SignStepReceipt> = handles
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect();

            assert_eq!(receipts.iter().filter(|r| r.step_complete).count(), 1);
            let invited = drain(&mut rx);
            assert_eq!(invited.len(), 1);
            assert_eq!(invited[0].signer_name, "C");

            let stored = engine.get_workflow(&wf.id).unwrap();
            assert_eq!(stored.pending_in_cohort(1).count(), 0);
        }
    }

    #[test]
    fn test_render_hands_over_completed_signers_only() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("lease.pdf");
        std::fs::write(&pdf, b"%PDF-1.4 lease").unwrap();

        let (engine, _rx) = engine();
        let wf = engine
            .create_workflow(
                "Lease",
                &pdf.to_string_lossy(),
                DocumentHash::of(b"%PDF-1.4 lease"),
                vec![signer("A", 1), signer("B", 2)],
            )
            .unwrap();
        engine
            .submit_sign_step(&wf.id, &id_of(&wf, "A"), &[value("sig-A", "Alice")])
            .unwrap();

        let first = engine.render_current_state(&wf.id).unwrap();
        let second = engine.render_current_state(&wf.id).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.source_pdf(&wf.id).unwrap(), b"%PDF-1.4 lease".to_vec());

        let stored = engine.get_workflow(&wf.id).unwrap();
        let completed = stored.completed_signers();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].name, "A");
        assert!(matches!(
            engine.render_current_state("missing"),
            Err(ServiceError::WorkflowNotFound(_))
        ));
    }
}
