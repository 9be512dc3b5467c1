use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::recompute::checkpoint_path;
use crate::model::SweepCheckpoint;
use crate::store::open_store;
use crate::util::read_json_optional;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.store.cache_root.join("manifests");
    let checkpoint_path = checkpoint_path(&manifest_dir, args.selector);

    info!(
        cache_root = %args.store.cache_root.display(),
        backend = args.store.backend.as_str(),
        "status requested"
    );

    match read_json_optional::<SweepCheckpoint>(&checkpoint_path)? {
        Some(checkpoint) => info!(
            run_id = %checkpoint.run_id,
            selector = %checkpoint.selector,
            status = %checkpoint.status,
            cursor = %checkpoint.cursor.unwrap_or_default(),
            updated_at = %checkpoint.updated_at,
            "loaded sweep checkpoint"
        ),
        None => warn!(path = %checkpoint_path.display(), "sweep checkpoint missing"),
    }

    let mut store = open_store(&args.store)?;
    let summary = store
        .summary()
        .with_context(|| format!("failed to summarize {} store", store.backend_name()))?;

    info!(
        backend = store.backend_name(),
        total_leads = summary.total_leads,
        dirty_leads = summary.dirty_leads,
        leads_with_final = summary.leads_with_final,
        leads_without_components = summary.leads_without_components,
        "store status"
    );

    Ok(())
}
