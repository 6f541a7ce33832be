use clap::Parser;
use obsdeck_daemon::mock::{MockConfig, MockModel, MockObs};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mock_obs", about = "Local stand-in for the remote application")]
struct Args {
    #[arg(long, env = "OBSDECK_MOCK_ADDR", default_value = "127.0.0.1:4455")]
    addr: String,

    /// Write the bound address here once listening.
    #[arg(long, value_name = "PATH")]
    addr_file: Option<PathBuf>,

    /// Require this password from clients.
    #[arg(long)]
    password: Option<String>,

    #[arg(long)]
    run_for_ms: Option<u64>,

    /// Toggle studio mode every this many milliseconds.
    #[arg(long)]
    studio_every_ms: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = MockConfig {
        password: args.password.clone(),
        silent: Vec::new(),
    };
    let mock = MockObs::spawn(&args.addr, config, MockModel::demo())?;

    if let Some(path) = &args.addr_file {
        fs::write(path, mock.listen_addr().to_string())?;
    }
    println!("mock_obs listening on ws://{}", mock.listen_addr());

    let run_for = args.run_for_ms.map(Duration::from_millis);
    let studio_every = args.studio_every_ms.map(Duration::from_millis);
    let start = Instant::now();
    let mut last_toggle = start;
    let mut studio = false;
    loop {
        thread::sleep(Duration::from_millis(50));
        if let Some(every) = studio_every {
            if last_toggle.elapsed() >= every {
                last_toggle = Instant::now();
                studio = !studio;
                info!(studio, "toggling studio mode");
                mock.operate("SetStudioModeEnabled", json!({ "studioModeEnabled": studio }));
            }
        }
        if let Some(max) = run_for {
            if start.elapsed() >= max {
                break;
            }
        }
    }

    mock.shutdown();
    Ok(())
}
