// atl-daemon: the external copier process for the Daemon backend (spec §4.6).
//
// Takes a control directory as its only argument (defaulting to the current
// directory), derives the transfer and PID file paths the same way
// `ControlPaths::new` does on the library side, and runs the copier loop
// until `COMMAND=EXIT`.

use std::path::PathBuf;

use atl::model::ControlPaths;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let control_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let control = ControlPaths::new(control_dir);
    let config = atl::config::GlobalConfig::default();

    let mut copier = atl::daemon_copier::DaemonCopier::with_config(
        control.transfer_file_path.clone(),
        control.pid_file_path(),
        &config,
    );

    copier.run().await?;
    Ok(())
}
