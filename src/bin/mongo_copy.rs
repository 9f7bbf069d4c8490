use chrono::{DateTime, Utc};
use clap::Parser;
use mongo_copy::{CancelToken, CopierConfig, MongoCopier};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// configuration file path.
    #[clap(short, long, default_value = "config.toml")]
    conf: String,
    /// only copy this source collection, destination database is not emptied in this mode.
    #[clap(long)]
    container: Option<String>,
    /// destination collection name, default to the source collection name.
    #[clap(long, requires = "container")]
    dest_container: Option<String>,
    /// override global cutoff, in RFC 3339 format.
    #[clap(long)]
    cutoff: Option<DateTime<Utc>>,
    /// override how many upserts are kept in flight per collection.
    #[clap(long)]
    concurrency: Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let mut conf = CopierConfig::from_file(&opts.conf)?;
    if let Some(cutoff) = opts.cutoff {
        conf.set_cutoff(cutoff);
    }
    if let Some(concurrency) = opts.concurrency {
        conf.set_concurrency(concurrency);
    }
    conf.validate()?;

    // keep the guard alive, or buffered file logs are lost.
    let _guard = match conf.get_log_dir() {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "mongo_copy.log"));
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env().add_directive("mongo_copy=info".parse()?))
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env().add_directive("mongo_copy=info".parse()?))
                .init();
            None
        }
    };

    let copier = MongoCopier::with_page_size(conf.get_page_size());
    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone())?;
    let (src, dst) = (conf.get_src(), conf.get_dst());

    let result = match &opts.container {
        Some(src_coll) => {
            let dst_coll = opts.dest_container.as_deref().unwrap_or(src_coll);
            info!(src_db = conf.get_src_db(), %src_coll, dst_db = conf.get_dst_db(), %dst_coll, "Begin to copy collection.");
            copier
                .copy_container(
                    &src,
                    conf.get_src_db(),
                    src_coll,
                    &dst,
                    conf.get_dst_db(),
                    dst_coll,
                    conf.get_cutoff(),
                    conf.get_concurrency(),
                    &cancel,
                )
                .map(|progress| info!(copied = progress.items_written, duration = ?progress.duration, "Copy collection complete."))
        }
        None => {
            info!(src_db = conf.get_src_db(), dst_db = conf.get_dst_db(), "Begin to copy database.");
            copier
                .copy_database(
                    &src,
                    conf.get_src_db(),
                    &dst,
                    conf.get_dst_db(),
                    conf.get_cutoff(),
                    conf.get_concurrency(),
                    conf.get_containers(),
                    &cancel,
                )
                .map(|report| info!(copied = report.copied.len(), skipped = report.skipped.len(), written = report.items_written(), "Copy database complete."))
        }
    };

    if let Err(e) = result {
        error!("Copy failed, error message: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Cancel `cancel` on Ctrl-C, a running copy returns once its dispatched upserts complete.
fn cancel_on_ctrl_c(cancel: CancelToken) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    std::thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        warn!("Received Ctrl-C, stop copying after in-flight upserts complete.");
                        cancel.cancel();
                    }
                    Err(e) => error!(error = %e, "Can't listen for Ctrl-C."),
                }
            })
        })?;
    Ok(())
}
