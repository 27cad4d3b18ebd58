use super::{humanize, json_pretty, EXIT_SUCCESS};
use strata_core::Store;

pub fn run(store: &Store, id_or_path: &str, json: bool) -> Result<u8, String> {
    let deleter = store.deleter();
    let id = deleter
        .resolve_id(id_or_path)
        .map_err(|e| humanize(&e, None))?;
    deleter.delete(&id).map_err(|e| humanize(&e, None))?;

    if json {
        let payload = serde_json::json!({ "deleted": id });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("Image {id} deleted");
    }
    Ok(EXIT_SUCCESS)
}
