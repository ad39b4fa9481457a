//! Expands experiment patch templates into per-trial patch operations

use serde_json::Value;
use tracing::debug;

use crate::domain::error::PatchError;
use crate::domain::models::{Experiment, ObjectReference, PatchOperation, PatchTemplate, PatchType, Trial};
use crate::services::jobs::is_trial_job_reference;
use crate::services::template::TemplateEngine;
use crate::services::validation::check_assignments;

/// Renders patch templates against trial assignments
#[derive(Debug, Clone)]
pub struct PatchEvaluator {
    engine: TemplateEngine,
    default_attempts: u32,
}

impl PatchEvaluator {
    pub fn new(engine: TemplateEngine, default_attempts: u32) -> Self {
        Self {
            engine,
            default_attempts,
        }
    }

    /// Produces one operation per patch template
    ///
    /// Templates that render to nothing and carry no resolvable target are
    /// dropped. Operations aimed at the trial job are kept with zero attempts
    /// so they are merged into the job instead of applied to the cluster.
    pub fn evaluate(&self, experiment: &Experiment, trial: &Trial) -> Result<Vec<PatchOperation>, PatchError> {
        check_assignments(trial, experiment)?;

        let mut operations = Vec::with_capacity(experiment.spec.patches.len());
        for template in &experiment.spec.patches {
            if let Some(op) = self.create_operation(trial, template)? {
                debug!(target_ref = %op.target_ref, patch_type = op.patch_type.as_str(), "evaluated patch");
                operations.push(op);
            }
        }
        Ok(operations)
    }

    /// Renders a single template into an operation
    pub fn create_operation(
        &self,
        trial: &Trial,
        template: &PatchTemplate,
    ) -> Result<Option<PatchOperation>, PatchError> {
        let data = self.engine.render_patch(template, trial)?;

        let target_ref = match &template.target_ref {
            Some(target) => Some(self.render_reference(trial, target)?),
            None if template.patch_type == PatchType::Strategic => reference_from_document(&data)?,
            None => None,
        };
        let Some(mut target_ref) = target_ref else {
            if data == "null" {
                return Ok(None);
            }
            return Err(PatchError::InvalidReference);
        };

        if target_ref.namespace.is_empty() {
            target_ref.namespace = trial.target_namespace().to_string();
        }
        if target_ref.kind.is_empty() || target_ref.name.is_empty() {
            return Err(PatchError::InvalidReference);
        }

        let mut op = PatchOperation {
            target_ref,
            patch_type: template.patch_type,
            data,
            attempts_remaining: self.default_attempts,
            wait: true,
        };

        if is_trial_job_reference(trial, &op.target_ref) {
            if op.patch_type != PatchType::Strategic {
                return Err(PatchError::TrialJobPatchType);
            }
            op.attempts_remaining = 0;
            op.wait = false;
        } else if op.data == "null" {
            op.attempts_remaining = 0;
            op.wait = false;
        }

        Ok(Some(op))
    }

    fn render_reference(&self, trial: &Trial, target: &ObjectReference) -> Result<ObjectReference, PatchError> {
        Ok(ObjectReference {
            api_version: target.api_version.clone(),
            kind: target.kind.clone(),
            name: self.engine.render_patch_value("targetRef.name", &target.name, trial)?,
            namespace: self
                .engine
                .render_patch_value("targetRef.namespace", &target.namespace, trial)?,
        })
    }
}

fn reference_from_document(data: &str) -> Result<Option<ObjectReference>, PatchError> {
    let document: Value = serde_json::from_str(data).map_err(|e| PatchError::Decode(e.to_string()))?;
    if !document.is_object() {
        return Ok(None);
    }
    let reference = ObjectReference::from_object(&document);
    if reference.kind.is_empty() && reference.name.is_empty() {
        return Ok(None);
    }
    Ok(Some(reference))
}
