//! Decide whether pre-existing VM state blocks a create, and tear it down
//! when the deletion policy allows.
//!
//! The decision (`decide`) is pure and shared between live and dry runs —
//! a dry run must reach exactly the conclusions a live run would, it just
//! skips the mutating calls.

use crate::backend::{PresenceResult, ProvisionBackend};
use crate::error::ForgeError;
use crate::spec::InstanceIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeOutcome {
    /// Nothing of the same name exists; proceed.
    Clean,
    /// Pre-existing state was (or, in a dry run, would have been) removed.
    Deleted,
    /// Pre-existing state found and the deletion policy forbids removal.
    Aborted,
}

/// The deletion-policy decision table.
pub fn decide(presence: &PresenceResult, delete_if_exists: bool) -> NormalizeOutcome {
    if !presence.any() {
        NormalizeOutcome::Clean
    } else if delete_if_exists {
        NormalizeOutcome::Deleted
    } else {
        NormalizeOutcome::Aborted
    }
}

/// Probe the backend for the instance and enforce the deletion policy.
/// Each teardown sub-step failure is fatal; the caller re-runs against a
/// clean environment.
pub async fn normalize<B: ProvisionBackend>(
    backend: &B,
    identity: &InstanceIdentity,
    delete_if_exists: bool,
    dry_run: bool,
) -> Result<NormalizeOutcome, ForgeError> {
    tracing::info!(vm = %identity.fqdn, "checking for pre-existing VM state");
    let presence = backend.probe(identity).await?;
    let outcome = decide(&presence, delete_if_exists);

    match outcome {
        NormalizeOutcome::Clean => {
            tracing::info!(vm = %identity.fqdn, "no pre-existing VM or disk image");
        }
        NormalizeOutcome::Aborted => {
            tracing::error!(
                vm = %identity.fqdn,
                "existing VM or disk image found and --delete-if-exists not passed"
            );
        }
        NormalizeOutcome::Deleted => {
            if dry_run {
                if presence.vm_active {
                    tracing::info!(vm = %identity.fqdn, "DRY RUN: would have stopped the running VM");
                }
                if presence.vm_defined {
                    tracing::info!(vm = %identity.fqdn, "DRY RUN: would have deleted the VM");
                }
                tracing::info!(vm = %identity.fqdn, "DRY RUN: would have deleted its disk image and data directory");
            } else {
                if presence.vm_active {
                    if let Some(ref vm) = presence.vm_ref {
                        backend.stop_vm(vm).await?;
                    }
                }
                if presence.vm_defined {
                    if let Some(ref vm) = presence.vm_ref {
                        backend.delete_vm(vm).await?;
                    }
                }
                backend.delete_storage(identity).await?;
                tracing::info!(vm = %identity.fqdn, "pre-existing VM state deleted");
            }
        }
    }

    Ok(outcome)
}
