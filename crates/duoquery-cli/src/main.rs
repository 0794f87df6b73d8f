use clap::{Parser, Subcommand};
use duoquery_cli::{explain, load_dataset, load_request, run, BackendChoice, Formatter, RunOutput};
use duoquery_core::DuoConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "duoquery")]
#[command(author = "ITSTUDIO")]
#[command(version)]
#[command(about = "duoquery - compile one query request for a search engine and a relational database")]
struct Args {
    #[arg(short, long, env = "DUOQUERY_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the compiled search body and SQL statements without touching a backend
    Explain {
        #[arg(short, long)]
        dataset: PathBuf,

        #[arg(short, long)]
        request: PathBuf,
    },

    /// Load a dataset into the embedded backends and execute a request
    Run {
        #[arg(short, long)]
        dataset: PathBuf,

        #[arg(short, long)]
        request: PathBuf,

        #[arg(short, long, default_value = "declared")]
        backend: String,

        #[arg(long)]
        timeout_ms: Option<u64>,

        #[arg(long, default_value = "table")]
        format: String,

        #[arg(long)]
        no_color: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => DuoConfig::from_file(path)?,
        None => DuoConfig::default(),
    };
    let level = args.log_level.as_deref().unwrap_or(&config.log.level);
    duoquery_core::init_logging(level, config.log.json);
    if let Some(path) = &args.config {
        info!("Loaded config from {:?}", path);
    }

    match args.command {
        Command::Explain { dataset, request } => {
            let dataset = load_dataset(&dataset)?;
            let request = load_request(&request)?;
            let explained = explain(&config, &dataset, &request)?;
            println!("{}", duoquery_cli::formatter::render_json(&explained, true));
        }
        Command::Run {
            dataset,
            request,
            backend,
            timeout_ms,
            format,
            no_color,
        } => {
            let choice = BackendChoice::parse(&backend)?;
            let dataset = load_dataset(&dataset)?;
            let request = load_request(&request)?;
            let formatter = Formatter::new(&format, !no_color);
            let results = run(
                &config,
                &dataset,
                &request,
                choice,
                timeout_ms.map(Duration::from_millis),
            )?;
            let labelled = results.len() > 1;
            for (kind, output) in results {
                if labelled {
                    println!("== {} ==", kind);
                }
                match output {
                    RunOutput::Rows(rows) => println!("{}", formatter.render_rows(&rows)),
                    RunOutput::Count(n) => println!("{}", formatter.render_count(n)),
                }
            }
        }
    }
    Ok(())
}
