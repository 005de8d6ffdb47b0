use anyhow::Context;
use clap::Parser;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{CellAlignment, ContentArrangement, Table};
use log::debug;
use safetensors_inspect::{AggregateReport, InspectConfig, Inspector, ModelRef, TensorDescriptor};
use std::time::Duration;
use url::Url;

/// List the tensors of a safetensors checkpoint on the Hugging Face hub
/// without downloading the weights.
#[derive(Parser, Debug)]
#[command(name = "safetensors-inspect", version)]
struct Args {
    /// Model identifier, e.g. `openai-community/gpt2`
    model: String,

    /// Branch, tag or commit
    #[arg(long, default_value = safetensors_inspect::DEFAULT_REVISION)]
    revision: String,

    /// Mirror to use instead of huggingface.co
    #[arg(long)]
    endpoint: Option<Url>,

    /// Access token for private or gated models
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Shards fetched concurrently
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    /// Per-request timeout, in seconds
    #[arg(long, default_value_t = 30.0)]
    timeout: f64,

    /// Attempts per request on transient failures
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Base delay between attempts, in seconds
    #[arg(long, default_value_t = 1.0)]
    backoff: f64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let timeout = Duration::try_from_secs_f64(args.timeout)
        .with_context(|| format!("invalid timeout {}", args.timeout))?;
    let config = InspectConfig::default()
        .with_concurrency(args.jobs)
        .with_timeout(timeout)
        .with_retries(args.retries)
        .with_backoff(args.backoff);

    let mut model = ModelRef::new(args.model).with_revision(args.revision);
    if let Some(endpoint) = args.endpoint {
        model = model.with_endpoint(endpoint);
    }
    if let Some(token) = args.token {
        model = model.with_token(token);
    }
    debug!("{model:?} with {config:?}");

    let report = Inspector::new(config)?
        .inspect(&model)
        .await
        .with_context(|| format!("inspecting {} failed", model.id()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", render_table(report.tensors()));
        println!();
        println!("Total Layers: {}", report.total_count());
        println!(
            "Total Parameters Size: {} bytes ({:.2} MB)",
            thousands(report.total_bytes()),
            report.total_bytes() as f64 / (1024.0 * 1024.0)
        );
    }
    print_warnings(&report);
    Ok(())
}

fn print_warnings(report: &AggregateReport) {
    if report.is_partial() {
        eprintln!();
        eprintln!(
            "warning: {} shard(s) could not be inspected and are left out of the totals:",
            report.failures().len()
        );
        for failure in report.failures() {
            eprintln!("  {} ({}): {}", failure.filename, failure.kind, failure.message);
        }
    }
    for inconsistency in report.inconsistencies() {
        eprintln!("warning: {inconsistency}");
    }
}

fn render_table(tensors: &[TensorDescriptor]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Layer Name", "Shape", "Data Type", "Size (bytes)"]);
    for tensor in tensors {
        table.add_row(vec![
            tensor.name().to_string(),
            format_shape(tensor.shape()),
            format!("{:?}", tensor.dtype()),
            thousands(tensor.byte_size()),
        ]);
    }
    if let Some(column) = table.column_mut(0) {
        column.set_cell_alignment(CellAlignment::Left);
    }
    if let Some(column) = table.column_mut(3) {
        column.set_cell_alignment(CellAlignment::Right);
    }
    table
}

/// `(a, b)`, with the trailing comma of a one-element tuple.
fn format_shape(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_string(),
        [n] => format!("({n},)"),
        dims => {
            let dims: Vec<String> = dims.iter().map(usize::to_string).collect();
            format!("({})", dims.join(", "))
        }
    }
}

fn thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
