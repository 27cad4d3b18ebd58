use super::{humanize, json_pretty, EXIT_SUCCESS};
use strata_core::{CreateSpec, Store};

pub fn run(store: &Store, spec: &CreateSpec, json: bool) -> Result<u8, String> {
    let image = store
        .creator()
        .create(spec)
        .map_err(|e| humanize(&e, Some(&spec.base_image)))?;

    if json {
        println!("{}", json_pretty(&image)?);
    } else {
        println!("{}", image.rootfs.display());
    }
    Ok(EXIT_SUCCESS)
}
