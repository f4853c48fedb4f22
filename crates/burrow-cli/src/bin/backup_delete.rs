use clap::Parser;

use burrow_core::delete::{self, DeleteRequest};
use burrow_core::progress::Progress;

/// The short `-h` historically selects the host, so the help flag is
/// long-only.
#[derive(Parser)]
#[command(
    name = "backupDelete",
    version,
    disable_help_flag = true,
    about = "Delete a backup, or paths within it, maintaining pool reference counts"
)]
struct Cli {
    /// Path to configuration file (overrides BURROW_CONFIG and the default search)
    #[arg(long)]
    config: Option<String>,

    /// Host whose backup is being deleted
    #[arg(short = 'h', long = "host")]
    host: String,

    /// Backup number to delete
    #[arg(short = 'n', long = "num")]
    num: u32,

    /// Override the backup's keep flag
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Retain XferLOG/SmbLOG files on whole-backup delete
    #[arg(short = 'l', long = "keep-logs")]
    keep_logs: bool,

    /// Tee output to the per-host log
    #[arg(short = 'L', long = "host-log")]
    host_log: bool,

    /// Skip the server-held host mutex
    #[arg(short = 'm', long = "no-mutex")]
    skip_mutex: bool,

    /// Suppress progress output
    #[arg(short = 'p', long = "no-progress")]
    no_progress: bool,

    /// Force a refcount reconciliation pass at the end
    #[arg(short = 'r', long = "refcount-update")]
    refcount_update: bool,

    /// Scope the delete to one share
    #[arg(short = 's', long = "share")]
    share: Option<String>,

    /// Sub-paths within the share (default: the whole share)
    paths: Vec<String>,

    #[arg(long, action = clap::ArgAction::Help, help = "Print help")]
    help: Option<bool>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    if !cli.paths.is_empty() && cli.share.is_none() {
        eprintln!("Error: sub-paths require a share (-s)");
        std::process::exit(1);
    }

    let config = burrow_cli::load_config(cli.config.as_deref());
    burrow_cli::init_logging(config.xfer_log_level);

    let mut progress = Progress::new(cli.no_progress);
    if cli.host_log {
        progress = progress.with_host_log(&config, &cli.host);
    }
    progress.pid_start();

    let req = DeleteRequest {
        host: cli.host.clone(),
        num: cli.num,
        force: cli.force,
        keep_logs: cli.keep_logs,
        skip_mutex: cli.skip_mutex,
        refcount_update: cli.refcount_update,
        share: cli.share.clone(),
        paths: cli.paths.clone(),
    };

    let code = match delete::run(&config, &req, &mut progress) {
        Ok(stats) => {
            let what = match (&cli.share, stats.merged) {
                (Some(share), true) => format!("merged and deleted paths under {share}"),
                (Some(share), false) => format!("deleted paths under {share}"),
                (None, true) => format!("merged and deleted backup #{}", cli.num),
                (None, false) => format!("deleted backup #{}", cli.num),
            };
            progress.note(&format!(
                "{what}: {} files, {} dirs, {} errors",
                stats.file_cnt, stats.dir_cnt, stats.errors
            ));
            if stats.errors > 0 {
                1
            } else {
                0
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };

    progress.pid_end();
    std::process::exit(code);
}
