use super::{humanize, json_pretty, EXIT_SUCCESS};
use strata_core::{CoreError, Store};
use strata_store::{IdMapping, NamespaceRecord, StoreOwner, GLOBAL_LOCK_KEY};

pub fn run(
    store: &Store,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
    json: bool,
) -> Result<u8, String> {
    init(store, uid_mappings, gid_mappings).map_err(|e| humanize(&e, None))?;

    let root = store.layout().root();
    if json {
        let payload = serde_json::json!({ "store": root });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("store initialized at {}", root.display());
    }
    Ok(EXIT_SUCCESS)
}

fn init(
    store: &Store,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> Result<(), CoreError> {
    let owner = StoreOwner::from_mappings(uid_mappings, gid_mappings)?;
    store.initialize(Some(owner))?;

    let lock = store.locksmith().lock(GLOBAL_LOCK_KEY)?;
    NamespaceRecord::new(uid_mappings, gid_mappings).check_or_record(store.layout())?;
    lock.unlock()?;
    Ok(())
}
