use crate::output::{print_json, print_table};
use hostforge_core::stage::StageId;
use serde::Serialize;

#[derive(Serialize)]
struct StageEntry {
    ordinal: u8,
    name: &'static str,
    description: &'static str,
    depends_on: Vec<&'static str>,
}

pub fn run(json: bool) -> anyhow::Result<()> {
    let entries: Vec<StageEntry> = StageId::ALL
        .iter()
        .map(|id| StageEntry {
            ordinal: id.ordinal(),
            name: id.name(),
            description: id.description(),
            depends_on: id.depends_on().iter().map(|d| d.name()).collect(),
        })
        .collect();

    if json {
        return print_json(&entries);
    }

    let rows = entries
        .into_iter()
        .map(|e| {
            let deps = if e.depends_on.is_empty() {
                "-".to_string()
            } else {
                e.depends_on.join(", ")
            };
            vec![e.ordinal.to_string(), e.name.to_string(), deps, e.description.to_string()]
        })
        .collect();
    print_table(&["#", "STAGE", "DEPENDS ON", "DESCRIPTION"], rows);
    Ok(())
}
