use std::path::Path;

use anyhow::Context;
use freight_core::Registry;
use serde_json::json;

use crate::cmd::parse_args;
use crate::manifest::Manifest;
use crate::output::{print_json, print_table};

/// Call one deed and print the cargo once its shipment has gone out.
pub fn run(
    manifest_path: &Path,
    deed: &str,
    raw_args: &[String],
    show_processes: bool,
    json: bool,
) -> anyhow::Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    let args = parse_args(raw_args);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let registry = Registry::new();
        let store = manifest.build(&registry)?;

        if !store.deeds().contains(deed) {
            anyhow::bail!("no deed named '{deed}' in {}", manifest_path.display());
        }

        tracing::debug!(deed, store = store.name(), "calling deed");
        let result = store
            .call(deed, args)
            .await
            .with_context(|| format!("deed '{deed}' failed"))?;
        store.flush();

        let cargo = store.cargo().unwrap_or_default();
        if json {
            let mut out = json!({ "result": result, "cargo": cargo });
            if show_processes {
                out["processes"] = json!(process_rows(&store)
                    .into_iter()
                    .map(|row| json!({ "deed": row[0], "state": row[1], "runs": row[2] }))
                    .collect::<Vec<_>>());
            }
            print_json(&out)?;
        } else {
            print_json(&cargo)?;
            if show_processes {
                println!();
                print_table(&["DEED", "STATE", "RUNS"], &process_rows(&store));
            }
        }
        store.disconnect();
        Ok(())
    })
}

fn process_rows(store: &freight_core::Store) -> Vec<Vec<String>> {
    store
        .processes()
        .iter()
        .map(|px| {
            vec![
                px.deed_name().to_string(),
                px.state().to_string(),
                px.run_count().to_string(),
            ]
        })
        .collect()
}
