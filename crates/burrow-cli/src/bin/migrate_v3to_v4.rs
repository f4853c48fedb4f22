use clap::Parser;

use burrow_core::layout::Layout;
use burrow_core::migrate::{self, MigrateRequest};
use burrow_core::progress::Progress;
use burrow_core::walk;

/// The short `-h` historically selects the host, so the help flag is
/// long-only.
#[derive(Parser)]
#[command(
    name = "migrateV3toV4",
    version,
    disable_help_flag = true,
    about = "Convert legacy V3 backups to the V4 layout with refcount journals"
)]
struct Cli {
    /// Path to configuration file (overrides BURROW_CONFIG and the default search)
    #[arg(long)]
    config: Option<String>,

    /// Migrate every host
    #[arg(short = 'a', long = "all", conflicts_with_all = ["host", "num"])]
    all: bool,

    /// Host to migrate
    #[arg(short = 'h', long = "host")]
    host: Option<String>,

    /// Backup number (default: every pre-V4 backup of the host)
    #[arg(short = 'n', long = "num", requires = "host")]
    num: Option<u32>,

    /// Announce what would be migrated without doing it
    #[arg(short = 'm', long = "dry-run")]
    dry_run: bool,

    /// Suppress progress output
    #[arg(short = 'p', long = "no-progress")]
    no_progress: bool,

    /// Raise the log level (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

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

    if !cli.all && cli.host.is_none() {
        eprintln!("Error: pass a host (-h) or migrate all hosts (-a)");
        std::process::exit(1);
    }

    let config = burrow_cli::load_config(cli.config.as_deref());
    burrow_cli::init_logging(config.xfer_log_level.max(cli.verbose as u32));

    let hosts: Vec<String> = if cli.all {
        let pc = Layout::new(&config.top_dir).pc_dir();
        match walk::subdirs(&pc) {
            Ok(hosts) => hosts,
            Err(e) => {
                eprintln!("Error: cannot list hosts under {}: {e}", pc.display());
                std::process::exit(1);
            }
        }
    } else {
        vec![cli.host.clone().expect("validated above")]
    };

    let mut errors = 0u64;
    for host in &hosts {
        let mut progress = Progress::new(cli.no_progress);
        let req = MigrateRequest {
            host: host.clone(),
            num: cli.num,
            dry_run: cli.dry_run,
        };
        match migrate::run(&config, &req, &mut progress) {
            Ok(stats) => {
                progress.note(&format!(
                    "{host}: {} migrated, {} skipped, {} files, {} errors",
                    stats.migrated, stats.skipped, stats.file_cnt, stats.errors
                ));
                errors += stats.errors;
            }
            Err(e) => {
                eprintln!("Error: {host}: {e}");
                errors += 1;
            }
        }
    }

    std::process::exit(if errors > 0 { 1 } else { 0 });
}
