use std::path::Path;

use freight_core::Registry;
use serde_json::json;

use crate::manifest::Manifest;
use crate::output::{print_json, print_table};

/// Build the manifest's store without calling anything and list its deeds.
pub fn run(manifest_path: &Path, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let registry = Registry::new();
    let store = manifest.build(&registry)?;

    if json {
        let deeds: Vec<_> = manifest
            .deeds
            .iter()
            .map(|d| json!({ "name": d.name(), "kind": d.kind(), "detail": d.detail() }))
            .collect();
        print_json(&json!({
            "store": store.name(),
            "merge_mode": store.merge_mode(),
            "batch_window_ms": store.batch_window().as_millis() as u64,
            "deeds": deeds,
            "registered": store.deeds().names(),
        }))?;
        return Ok(());
    }

    println!(
        "store: {} (merge: {}, window: {}ms)",
        store.name(),
        store.merge_mode().as_str(),
        store.batch_window().as_millis()
    );
    let rows: Vec<Vec<String>> = manifest
        .deeds
        .iter()
        .map(|d| vec![d.name().to_string(), d.kind().to_string(), d.detail()])
        .collect();
    print_table(&["NAME", "KIND", "DETAIL"], &rows);
    Ok(())
}
