use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use installer_server::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "installer-server")]
#[command(version, about = "First-run installation service for the setup wizard", long_about = None)]
struct Cli {
    /// TOML settings file (missing file = defaults)
    #[arg(long, default_value = "./installer.toml")]
    config: PathBuf,

    /// Override `bind_addr`
    #[arg(long)]
    bind: Option<String>,

    /// Override `app_root`
    #[arg(long)]
    app_root: Option<PathBuf>,

    /// Keep logs in files only
    #[arg(long)]
    no_stdout_log: bool,

    /// Print the effective settings as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(Some(&cli.config))?;
    if let Some(bind) = &cli.bind {
        settings.bind_addr = bind.clone();
    }
    if let Some(root) = &cli.app_root {
        settings.app_root = root.clone();
    }
    Ok(settings)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("installer-server: {:#}", e);
            return ExitCode::from(2);
        }
    };

    if cli.print_config {
        return match toml::to_string_pretty(&settings) {
            Ok(text) => {
                print!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("installer-server: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    if let Err(e) = installer_server::init_logging(&settings, !cli.no_stdout_log) {
        eprintln!("installer-server: failed to initialize logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("[PHASE: initialization] Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(installer_server::run_server(settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("[PHASE: shutdown] {:#}", e);
            ExitCode::FAILURE
        }
    }
}
