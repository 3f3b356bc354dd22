use anyhow::Context;
use clap::{Parser, Subcommand};
use procpanel::{Config, ProcessService, QueryParams, Signal, SignalRequest};
use serde::Serialize;
use std::path::PathBuf;

mod processes;
mod tree_view;

#[derive(clap::Parser, Debug)]
#[clap(version, about = "Inspect and signal local processes")]
struct Args {
    /// Path to a procpanel.toml (falls back to $PROCPANEL_CONFIG, then /etc/procpanel)
    #[clap(long)]
    config: Option<PathBuf>,

    /// Print JSON instead of tables
    #[clap(long, global = true)]
    json: bool,

    /// Disable colorized output
    #[clap(long, global = true)]
    no_color: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// List processes, filtered, sorted and paginated
    List {
        #[clap(long, allow_negative_numbers = true)]
        page: Option<i64>,
        #[clap(long, allow_negative_numbers = true)]
        limit: Option<i64>,
        /// pid, cpu_percent, memory_bytes, username, status, start_time or name
        #[clap(long)]
        sort_by: Option<String>,
        /// asc or desc
        #[clap(long)]
        sort_dir: Option<String>,
        /// running, sleeping, stopped, zombie or unknown
        #[clap(long)]
        status: Option<String>,
        /// Case-insensitive match on name and command line
        #[clap(long)]
        search: Option<String>,
        #[clap(long)]
        username: Option<String>,
    },
    /// Show the process forest, or the subtree under one pid
    Tree {
        #[clap(long)]
        pid: Option<u32>,
    },
    /// Show everything known about one process
    Detail { pid: u32 },
    /// Send the configured kill signal (SIGKILL unless overridden)
    Kill { pid: u32 },
    /// Send a named signal, e.g. TERM, SIGHUP or usr1
    Signal {
        pid: u32,
        signal: String,
        /// Refuse unless the target's start time (epoch seconds) matches
        #[clap(long)]
        expect_start: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = Config::discover(args.config.as_deref())?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cfg.logging.level.as_str()),
    )
    .init();

    if args.no_color {
        colored::control::set_override(false);
    }

    let service = ProcessService::new(&cfg);
    let json = args.json;

    match args.command {
        Command::List {
            page,
            limit,
            sort_by,
            sort_dir,
            status,
            search,
            username,
        } => {
            let params = QueryParams {
                page,
                limit,
                sort_by,
                sort_dir,
                status,
                search,
                username,
            };
            let page = service.list_params(&params).await?;
            output(json, &page, processes::print_page)?;
        }
        Command::Tree { pid: Some(pid) } => {
            let node = service.subtree(pid).await?;
            output(json, &node, |n| tree_view::print_forest(std::slice::from_ref(n)))?;
        }
        Command::Tree { pid: None } => {
            let roots = service.tree().await?;
            output(json, &roots, |r| tree_view::print_forest(r))?;
        }
        Command::Detail { pid } => {
            let detail = service.detail(pid).await?;
            output(json, &detail, processes::print_detail)?;
        }
        Command::Kill { pid } => {
            let ack = service.kill(pid).await?;
            output(json, &ack, processes::print_ack)?;
        }
        Command::Signal {
            pid,
            signal,
            expect_start,
        } => {
            let ack = match expect_start {
                Some(start) => {
                    let signal: Signal = signal.parse()?;
                    let mut req = SignalRequest::new(pid, signal);
                    req.expected_start_time = Some(start);
                    service.signal_request(req).await?
                }
                None => service.signal(pid, &signal).await?,
            };
            output(json, &ack, processes::print_ack)?;
        }
    }

    Ok(())
}

fn output<T: Serialize + ?Sized>(json: bool, value: &T, table: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        let text = serde_json::to_string_pretty(value).context("failed to encode JSON")?;
        println!("{text}");
    } else {
        table(value);
    }
    Ok(())
}
