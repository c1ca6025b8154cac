use chrono::Utc;
use tracing::{Level, event};

use super::{EntityOutcome, RestoreProgress, RestoreReport, RestoreWarning};
use crate::core::Result;
use crate::schema::{EntityKind, EntityRegistry};
use crate::snapshot::{SectionKind, SnapshotManifest};
use crate::storage::Store;

/// Turns restore progress into the final report.
///
/// Every manifest section gets an outcome, even when nothing was restored
/// for it; any type whose restored count falls below the manifest count gets
/// its own `Shortfall` warning carrying the policy-skip and failure
/// breakdown. No I/O.
pub fn finalize(manifest: &SnapshotManifest, mut progress: RestoreProgress) -> RestoreReport {
    for (kind, entry) in manifest.sections() {
        if !progress.outcomes.contains_key(&entry.name) {
            progress.record(EntityOutcome::new(
                &entry.name,
                kind == SectionKind::Association,
            ));
        }
        if let Some(outcome) = progress.outcome_mut(&entry.name) {
            outcome.expected = entry.expected_count;
        }
    }

    let mut entities = Vec::with_capacity(progress.order.len());
    let mut shortfalls = Vec::new();
    for name in &progress.order {
        let Some(outcome) = progress.outcomes.remove(name) else {
            continue;
        };
        let restored = outcome.restored();
        if outcome.expected > restored {
            shortfalls.push(RestoreWarning::Shortfall {
                entity_type: name.clone(),
                expected: outcome.expected,
                restored,
                shortfall: outcome.expected - restored,
                skipped_by_policy: outcome.skipped,
                failed: outcome.failed,
            });
        }
        entities.push(outcome);
    }

    let mut warnings = progress.warnings;
    warnings.extend(shortfalls);

    RestoreReport {
        snapshot_id: progress.snapshot_id,
        policy: progress.policy,
        started_at: progress.started_at,
        finished_at: Utc::now(),
        entities,
        warnings,
    }
}

/// Post-hoc audit: counts the target's rows for every manifest type.
///
/// Seed records are not counted, since a restore never counts them as
/// restored either.
pub async fn validate_completeness<S>(
    registry: &EntityRegistry,
    manifest: &SnapshotManifest,
    store: &S,
) -> Result<RestoreReport>
where
    S: Store + ?Sized,
{
    let scope = store.read_scope().await?;
    let mut progress = RestoreProgress::new(manifest.snapshot_id, None);

    for (kind, entry) in manifest.sections() {
        let entity = registry.get(&entry.name)?;
        let rows = scope.scan(entity.table()).await?;
        let mut observed = 0;
        for row in &rows {
            let seed = match entity.kind() {
                EntityKind::Entity => entity
                    .extract_key(&row.fields)?
                    .is_some_and(|key| entity.is_seed(&key)),
                EntityKind::Association => false,
            };
            if !seed {
                observed += 1;
            }
        }

        let mut outcome = EntityOutcome::new(&entry.name, kind == SectionKind::Association);
        outcome.observed = Some(observed);
        progress.record(outcome);
    }

    let report = finalize(manifest, progress);
    event!(
        Level::INFO,
        snapshot_id = %report.snapshot_id,
        complete = report.is_complete(),
        "completeness audit finished"
    );
    Ok(report)
}
