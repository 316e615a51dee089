//! Kubestate reconciliation core: the present/absent decision machine.
//!
//! One generic path handles every kind; behavior differences live in the
//! `KindPolicy` table. Each call performs at most one read and one mutating
//! call against the injected accessor and resolves every failure into a
//! `StateResult` the caller can branch on.

#![forbid(unsafe_code)]

mod labels;
mod report;
mod validate;

use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::{json, Map, Value as Json};
use tracing::{info, warn};

use kubestate_core::{
    ClusterAccessor, DeleteOutcome, DesiredState, Error, Kind, ReplaceStrategy, ResourceRef,
    StateResult,
};
use kubestate_manifest::{resolve, ManifestArgs, Renderer};

pub use validate::check_immutable;

const POD_REPLACE_COMMENT: &str = "kubestate is currently unable to replace a pod without \
     deleting it. Please perform the removal of the pod requiring \
     the 'pod_absent' state if this is the desired behaviour.";

/// Reconciliation engine over an injected cluster accessor. Holds no state of
/// its own; every call is derivable from its inputs plus the observed cluster.
pub struct Engine<'a> {
    accessor: &'a dyn ClusterAccessor,
}

impl<'a> Engine<'a> {
    pub fn new(accessor: &'a dyn ClusterAccessor) -> Self {
        Self { accessor }
    }

    /// Resolves the desired state from raw arguments (explicit or templated)
    /// and converges. Resolution failures surface as failed results before
    /// any cluster call.
    pub async fn present_rendered(
        &self,
        reference: &ResourceRef,
        args: &ManifestArgs,
        renderer: &dyn Renderer,
        test: bool,
    ) -> Result<StateResult, Error> {
        match resolve(reference.kind, args, renderer) {
            Ok(desired) => self.present(reference, &desired, test).await,
            Err(e) => Ok(StateResult::failed(&reference.name, e.to_string())),
        }
    }

    /// Ensures the referenced resource exists with the desired configuration.
    ///
    /// Returns `Err` only for an accessor failure during a validated
    /// (PersistentVolumeClaim) replace, where the caller needs the cluster's
    /// own diagnostic verbatim; every other failure resolves into
    /// `Outcome::Failed`.
    pub async fn present(
        &self,
        reference: &ResourceRef,
        desired: &DesiredState,
        test: bool,
    ) -> Result<StateResult, Error> {
        let t0 = Instant::now();
        counter!("state_apply_attempts", 1u64);
        let kind = reference.kind;
        let name = reference.name.clone();

        let observed = match self.accessor.get(reference).await {
            Ok(o) => o,
            Err(e) => return Ok(StateResult::failed(name, e.to_string())),
        };

        let result = match observed {
            None => self.create(reference, desired, test).await,
            Some(observed) => match kind.policy().replace {
                ReplaceStrategy::Never => {
                    // Hard policy; not attempted even in dry-run.
                    StateResult::failed(name, POD_REPLACE_COMMENT)
                }
                ReplaceStrategy::ExistsOk => {
                    // Existence alone satisfies the state; no diff against
                    // the desired configuration.
                    let comment = format!("The {} already exists", kind.display());
                    if test {
                        StateResult::simulated(name, comment)
                    } else {
                        StateResult::applied(name, comment, Map::new())
                    }
                }
                ReplaceStrategy::Recreate => self.recreate(reference, desired, test).await,
                ReplaceStrategy::ValidatedReplace => {
                    self.replace_validated(reference, desired, &observed, test).await?
                }
            },
        };

        if result.result.is_applied() {
            counter!("state_apply_ok", 1u64);
        }
        histogram!("state_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(result)
    }

    async fn create(&self, reference: &ResourceRef, desired: &DesiredState, test: bool) -> StateResult {
        let kind = reference.kind;
        if test {
            return StateResult::simulated(
                &reference.name,
                format!("The {} is going to be created", kind.display()),
            );
        }
        match self.accessor.create(reference, desired).await {
            Ok(created) => {
                let changes = report::convergence_changes(reference, desired, &created);
                StateResult::applied(&reference.name, "", changes)
            }
            Err(e) => StateResult::failed(&reference.name, e.to_string()),
        }
    }

    async fn recreate(&self, reference: &ResourceRef, desired: &DesiredState, test: bool) -> StateResult {
        let kind = reference.kind;
        if test {
            return StateResult::simulated(
                &reference.name,
                format!("The {} is going to be replaced", kind.display()),
            );
        }
        info!(kind = kind.title(), name = %reference.name, "forcing recreation");
        match self.accessor.replace(reference, desired).await {
            Ok(replaced) => {
                let changes = report::convergence_changes(reference, desired, &replaced);
                StateResult::applied(
                    &reference.name,
                    format!("The {} is already present. Forcing recreation", kind.display()),
                    changes,
                )
            }
            Err(e) => StateResult::failed(&reference.name, e.to_string()),
        }
    }

    async fn replace_validated(
        &self,
        reference: &ResourceRef,
        desired: &DesiredState,
        observed: &Json,
        test: bool,
    ) -> Result<StateResult, Error> {
        let kind = reference.kind;
        let name = reference.name.clone();
        let observed_spec = observed
            .get("spec")
            .and_then(Json::as_object)
            .cloned()
            .unwrap_or_default();

        if let Err(e) =
            validate::check_immutable(&observed_spec, &desired.spec, kind.policy().immutable_fields)
        {
            return Ok(StateResult::failed(name, e.to_string()));
        }

        if !validate::specs_differ(&desired.spec, &observed_spec) {
            let comment = format!("The {} already exists", kind.display());
            return Ok(if test {
                StateResult::simulated(name, comment)
            } else {
                StateResult::applied(name, comment, Map::new())
            });
        }

        if test {
            return Ok(StateResult::simulated(
                name,
                format!("The {} is going to be replaced", kind.display()),
            ));
        }

        // Deliberate passthrough: a rejected replace carries the cluster's
        // definitive immutability diagnostic, which local spec inspection
        // cannot always reproduce.
        let replaced = self.accessor.replace(reference, desired).await?;
        let new_spec = replaced
            .get("spec")
            .cloned()
            .unwrap_or_else(|| Json::Object(desired.spec.clone()));
        let mut changes = Map::new();
        changes.insert(
            reference.change_key(),
            json!({ "old": observed_spec, "new": new_spec }),
        );
        Ok(StateResult::applied(
            name,
            format!("The {} is already present. Forcing recreation", kind.display()),
            changes,
        ))
    }

    /// Ensures the referenced resource does not exist.
    pub async fn absent(&self, reference: &ResourceRef, test: bool) -> StateResult {
        counter!("state_apply_attempts", 1u64);
        let kind = reference.kind;
        let name = reference.name.clone();

        let observed = match self.accessor.get(reference).await {
            Ok(o) => o,
            Err(e) => return StateResult::failed(name, e.to_string()),
        };

        if observed.is_none() {
            let comment = format!("The {} does not exist", kind.display());
            return if test {
                StateResult::simulated(name, comment)
            } else {
                StateResult::applied(name, comment, Map::new())
            };
        }

        if test {
            return StateResult::simulated(
                name,
                format!("The {} is going to be deleted", kind.display()),
            );
        }

        match self.accessor.delete(reference).await {
            Ok(outcome) => {
                if kind == Kind::Namespace {
                    namespace_delete_result(&name, &outcome)
                } else {
                    let mut changes = Map::new();
                    changes.insert(
                        kind.changes_key().to_string(),
                        json!({ "new": "absent", "old": "present" }),
                    );
                    counter!("state_apply_ok", 1u64);
                    StateResult::applied(name, format!("{} deleted", kind.title()), changes)
                }
            }
            Err(e) => StateResult::failed(name, e.to_string()),
        }
    }
}

/// Namespace deletion is asynchronous: the delete call may answer with a
/// still-terminating object instead of a hard success. Interpreted in
/// priority order: code 200, then a status string, then a terminating phase;
/// anything else is a failure carrying the raw response.
fn namespace_delete_result(name: &str, outcome: &DeleteOutcome) -> StateResult {
    let terminating = |comment: String| {
        let mut changes = Map::new();
        changes.insert(
            Kind::Namespace.changes_key().to_string(),
            json!({ "new": "absent", "old": "present" }),
        );
        StateResult::applied(name, comment, changes)
    };

    if outcome.code == Some(200) {
        return terminating("Terminating".to_string());
    }
    match &outcome.status {
        Some(Json::String(s)) if !s.is_empty() => terminating(s.clone()),
        Some(Json::Object(map))
            if map.get("phase").and_then(Json::as_str) == Some("Terminating") =>
        {
            terminating("Terminating".to_string())
        }
        _ => {
            warn!(name = %name, response = %outcome.raw, "unexpected namespace delete response");
            StateResult::failed(
                name,
                format!("Something went wrong, response: {}", outcome.raw),
            )
        }
    }
}
