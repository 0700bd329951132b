use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use time::macros::format_description;
use tracing_appender::non_blocking;
use tracing_subscriber::fmt::time::LocalTime;

use piecemeal::{Config, Error, SchedulerError, download, parse_torrent};

#[derive(Parser, Debug)]
#[command(name = "piecemeal", version)]
struct Args {
    #[arg(short, long, help = "Print contents of torrent file")]
    inspect: bool,

    #[arg(short, long, help = "Where to write the downloaded file (defaults to the name in the torrent)")]
    output: Option<PathBuf>,

    #[arg(short, long, default_value_t = 6881, help = "Port reported to the tracker")]
    port: u16,

    #[arg(long, default_value_t = 30, help = "Maximum number of peers to download from at once")]
    max_peers: usize,

    #[arg(long, default_value = "logs", help = "Directory for the log file")]
    log_dir: PathBuf,

    file: PathBuf,
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    if let Ok(style) = ProgressStyle::with_template("{spinner} [{elapsed_precise}] {wide_bar} {pos}/{len} pieces") {
        bar.set_style(style);
    }
    bar
}

fn report(error: &Error) {
    eprintln!("{error}");
    if let Error::Scheduler(SchedulerError::Incomplete { missing }) = error {
        for (index, reason) in missing {
            eprintln!("  piece {index}: {reason}");
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let file_appender = tracing_appender::rolling::never(&args.log_dir, "piecemeal.log");
    let (non_blocking, _guard) = non_blocking(file_appender);
    let timer = LocalTime::new(format_description!(
        "[month]/[day]/[year] [hour repr:24]:[minute]:[second].[subsecond digits:4]"
    ));
    tracing_subscriber::fmt().with_writer(non_blocking).with_ansi(false).with_timer(timer).init();

    if args.inspect {
        return match parse_torrent(&args.file) {
            Ok(metainfo) => {
                println!("Contents of {}:\n{}", args.file.display(), metainfo);
                ExitCode::SUCCESS
            },
            Err(e) => {
                report(&e);
                ExitCode::FAILURE
            },
        };
    }

    let config = Config { port: args.port, max_peers: args.max_peers, ..Config::default() };
    match download(&args.file, args.output, &config, progress_bar()).await {
        Ok(path) => {
            println!("Downloaded {} to {}", args.file.display(), path.display());
            ExitCode::SUCCESS
        },
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        },
    }
}
