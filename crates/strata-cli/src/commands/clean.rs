use super::{humanize, json_pretty, EXIT_SUCCESS};
use strata_core::Store;

pub fn run(store: &Store, threshold: u64, keep_images: &[String], json: bool) -> Result<u8, String> {
    let report = store
        .cleaner()
        .clean(threshold, keep_images)
        .map_err(|e| humanize(&e, None))?;

    if json {
        let payload = serde_json::json!({
            "skipped": report.skipped,
            "unreferenced": report.gc.unreferenced,
            "removed": report.gc.removed,
            "removed_staging": report.gc.removed_staging,
            "purged_trash": report.gc.purged_trash,
        });
        println!("{}", json_pretty(&payload)?);
    } else if report.skipped {
        println!("clean: skipped, store usage is within {threshold} bytes");
    } else {
        println!(
            "clean: removed {} volumes, {} stale staging entries",
            report.gc.removed.len(),
            report.gc.removed_staging
        );
    }
    Ok(EXIT_SUCCESS)
}
