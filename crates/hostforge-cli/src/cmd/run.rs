use crate::output::{print_json, print_pairs, print_table};
use hostforge_core::action::Outcome;
use hostforge_core::config::{Config, WarnLevel};
use hostforge_core::exec::SystemRunner;
use hostforge_core::fetch::HttpFetcher;
use hostforge_core::host::Host;
use hostforge_core::pipeline::{self, Pipeline, PipelineReport, SummaryItem};
use hostforge_core::stage::StageId;
use serde::Serialize;
use std::path::Path;
use tracing::warn;

#[derive(Serialize)]
struct RunOutput<'a> {
    report: &'a PipelineReport,
    summary: Vec<SummaryItem>,
}

pub fn run(config_path: &Path, only: Option<StageId>, json: bool) -> anyhow::Result<()> {
    let config = super::load_or_scaffold(config_path)?;
    for w in config.validate() {
        if w.level == WarnLevel::Warning {
            warn!("{}", w.message);
        }
    }

    let runner = SystemRunner;
    let fetcher = HttpFetcher::new()?;
    let host = Host::new(&runner, &fetcher);
    let pipeline = Pipeline::new(&host, &config);

    let report = match only {
        Some(id) => pipeline.run_single(id)?,
        None => pipeline.run_all()?,
    };
    render(&config, &report, json)
}

pub fn run_stage(config_path: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let id: StageId = name.parse().map_err(anyhow::Error::msg)?;
    run(config_path, Some(id), json)
}

fn render(config: &Config, report: &PipelineReport, json: bool) -> anyhow::Result<()> {
    let summary = pipeline::summary(config, report);
    if json {
        return print_json(&RunOutput { report, summary });
    }

    let rows = report
        .stages
        .iter()
        .map(|r| {
            vec![
                r.stage.ordinal().to_string(),
                r.stage.to_string(),
                r.count(Outcome::Applied).to_string(),
                r.count(Outcome::Skipped).to_string(),
                r.warnings.len().to_string(),
            ]
        })
        .collect();
    println!();
    print_table(&["#", "STAGE", "APPLIED", "SKIPPED", "WARNINGS"], rows);

    let warnings: Vec<_> = report.warnings().collect();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for (stage, message) in warnings {
            println!("  [{stage}] {message}");
        }
    }

    if !summary.is_empty() {
        println!("\nConnection details:");
        let pairs: Vec<(String, String)> =
            summary.into_iter().map(|i| (i.label, i.value)).collect();
        print_pairs(&pairs);
    }
    Ok(())
}
