use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::cli::{PendingSelector, RecomputeArgs};
use crate::composer::{Composer, ComposerConfig, LeadOutcome, SweepOutcome, SweepReport};
use crate::model::{
    ComponentKind, ComponentWeight, FlagClear, RecomputeRunManifest, SweepCheckpoint,
    SweepCounts,
};
use crate::retry::RetryPolicy;
use crate::store::open_store;
use crate::util::{
    ensure_directory, now_utc_string, read_json_optional, utc_compact_string, write_json_pretty,
};

const MANIFEST_VERSION: u32 = 1;

pub fn run(args: RecomputeArgs) -> Result<()> {
    let manifest_dir = args.store.cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let config = composer_config(&args);
    let mut store = open_store(&args.store)?;
    let backend = store.backend_name();
    let started_at = now_utc_string();
    let started = Instant::now();
    let run_stamp = run_stamp(Utc::now());
    let run_id = format!("recompute-{run_stamp}");

    let report = match args.lead_id.as_deref() {
        Some(lead_id) => {
            let outcome = Composer::new(store.as_mut(), config.clone())
                .recompute_final(lead_id)
                .with_context(|| format!("failed to recompute final vector for {lead_id}"))?;
            single_lead_report(lead_id, &outcome)
        }
        None => {
            let checkpoint_path = checkpoint_path(&manifest_dir, args.selector);
            let checkpoint = read_json_optional::<SweepCheckpoint>(&checkpoint_path)?;
            if args.resume && checkpoint.is_none() {
                warn!(path = %checkpoint_path.display(), "no sweep checkpoint, starting from the beginning");
            }
            let start_cursor = resume_cursor(checkpoint.as_ref(), args.resume);

            let report = Composer::new(store.as_mut(), config.clone())
                .recompute_batch(args.max_count, start_cursor);

            let checkpoint = SweepCheckpoint {
                manifest_version: MANIFEST_VERSION,
                run_id: run_id.clone(),
                selector: args.selector.as_str().to_string(),
                cursor: match report.outcome {
                    SweepOutcome::Completed => None,
                    SweepOutcome::LimitReached | SweepOutcome::Aborted => report.cursor.clone(),
                },
                status: report.outcome.as_str().to_string(),
                updated_at: now_utc_string(),
            };
            write_json_pretty(&checkpoint_path, &checkpoint)?;
            report
        }
    };

    let manifest = RecomputeRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id,
        generated_at: started_at,
        backend: backend.to_string(),
        selector: args.selector.as_str().to_string(),
        lead_id: args.lead_id.clone(),
        embedding_dim: config.dimensions,
        weights: ComponentKind::ALL
            .iter()
            .map(|component| ComponentWeight {
                component: *component,
                weight: component.weight(),
            })
            .collect(),
        config_checksum: config_checksum(config.dimensions, args.selector, backend),
        page_size: config.page_size,
        write_chunk_size: config.write_chunk_size,
        max_count: args.max_count,
        start_cursor: report.start_cursor.clone(),
        end_cursor: report.cursor.clone(),
        pages: report.pages,
        retries: report.retries,
        counts: report.counts,
        outcome: report.outcome.as_str().to_string(),
        duration_ms: started.elapsed().as_millis(),
        warnings: report.warnings.clone(),
    };

    let manifest_path = manifest_dir.join(format!("recompute_run_{run_stamp}.json"));
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        backend,
        outcome = report.outcome.as_str(),
        read = report.counts.read,
        computed = report.counts.computed,
        errors = report.counts.errors,
        "recompute run recorded"
    );

    if report.outcome == SweepOutcome::Aborted {
        bail!(
            "recompute sweep aborted after {}: {}",
            report.cursor.as_deref().unwrap_or("<start>"),
            report.abort_reason.as_deref().unwrap_or("unknown error")
        );
    }
    if report.counts.errors > 0 {
        bail!(
            "{} leads could not be recomputed and remain pending",
            report.counts.errors
        );
    }

    Ok(())
}

fn composer_config(args: &RecomputeArgs) -> ComposerConfig {
    ComposerConfig {
        dimensions: args.dimensions,
        selector: args.selector,
        page_size: args.page_size.max(1),
        write_chunk_size: args.write_chunk_size.max(1),
        retry: RetryPolicy {
            max_attempts: args.max_attempts.max(1),
            base_delay: Duration::from_millis(args.retry_base_delay_ms),
            max_delay: Duration::from_millis(args.retry_max_delay_ms),
        },
    }
}

pub fn checkpoint_path(manifest_dir: &Path, selector: PendingSelector) -> PathBuf {
    manifest_dir.join(format!("sweep_checkpoint_{}.json", selector.as_str()))
}

/// UTC second plus milliseconds and process id, so concurrent or back to
/// back runs never share a manifest file.
fn run_stamp(now: DateTime<Utc>) -> String {
    format!(
        "{}-{:03}-{}",
        utc_compact_string(now),
        now.timestamp_subsec_millis(),
        std::process::id()
    )
}

/// An aborted sweep always continues from its cursor. A limit-bounded one
/// continues only when `--resume` is given.
fn resume_cursor(checkpoint: Option<&SweepCheckpoint>, resume: bool) -> Option<String> {
    let checkpoint = checkpoint?;
    if checkpoint.status == SweepOutcome::Completed.as_str() {
        if resume {
            info!(run_id = %checkpoint.run_id, "previous sweep completed, starting a new pass");
        }
        return None;
    }
    if !resume && checkpoint.status != SweepOutcome::Aborted.as_str() {
        return None;
    }

    info!(
        run_id = %checkpoint.run_id,
        status = %checkpoint.status,
        cursor = checkpoint.cursor.as_deref().unwrap_or(""),
        "resuming sweep from checkpoint"
    );
    checkpoint.cursor.clone()
}

fn config_checksum(dimensions: usize, selector: PendingSelector, backend: &str) -> String {
    let weights = ComponentKind::ALL
        .iter()
        .map(|component| format!("{}={}", component.as_str(), component.weight()))
        .collect::<Vec<String>>()
        .join(",");
    let checksum_input = format!("{}|{}|{}|{}", dimensions, weights, selector.as_str(), backend);

    let mut hasher = Sha256::new();
    hasher.update(checksum_input.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn single_lead_report(lead_id: &str, outcome: &LeadOutcome) -> SweepReport {
    let mut counts = SweepCounts {
        read: 1,
        ..SweepCounts::default()
    };
    match outcome {
        LeadOutcome::Computed(flag) => {
            counts.computed = 1;
            if *flag == FlagClear::Superseded {
                counts.flag_superseded = 1;
            }
        }
        LeadOutcome::NoComponents => counts.skipped_no_component = 1,
        LeadOutcome::Malformed { .. } => counts.errors = 1,
    }

    let warnings = match outcome {
        LeadOutcome::Malformed { component, error } => vec![format!(
            "{lead_id}: malformed {} vector: {error}",
            component.as_str()
        )],
        _ => Vec::new(),
    };

    SweepReport {
        counts,
        start_cursor: None,
        cursor: Some(lead_id.to_string()),
        pages: 0,
        retries: 0,
        warnings,
        outcome: SweepOutcome::Completed,
        abort_reason: None,
    }
}
