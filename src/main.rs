mod args;

use android_adb_host::adb::{AdbBackend, AdbConfig, AdbError, AdbResult, ErrorKind};
use args::{Args, Command};
use serde::Serialize;
use std::process::ExitCode;
use std::time::Duration;

const DEFAULT_WAIT: Duration = Duration::from_secs(60);
const USAGE_ERROR: u8 = 1;

fn main() -> ExitCode {
    let args = match Args::parse() {
        Ok(Some(args)) => args,
        Ok(None) => return ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("❌ {msg}");
            args::print_help();
            return ExitCode::from(USAGE_ERROR);
        }
    };

    let default_level = if args.debug_mode { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = AdbConfig::from_env();
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if let Some(secs) = args.timeout_secs {
        config = config.with_read_timeout(Some(Duration::from_secs(secs)));
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("❌ Failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(&args, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

// Distinct exit status per failure bucket so scripts can branch on it.
fn exit_code(err: &AdbError) -> u8 {
    match err.kind() {
        ErrorKind::Connection => 2,
        ErrorKind::Protocol => 3,
        ErrorKind::RemoteFailure => 4,
        ErrorKind::Target => 5,
        ErrorKind::Io => 6,
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("❌ JSON encoding failed: {e}"),
    }
}

async fn run(args: &Args, config: AdbConfig) -> AdbResult<()> {
    match &args.command {
        Command::Devices => {
            let devices = AdbBackend::list_devices(config).await?;
            if args.json {
                print_json(&devices);
            } else if devices.is_empty() {
                println!("📱 No devices attached");
            } else {
                for device in devices {
                    println!("{}\t{}", device.serial, device.state);
                }
            }
            return Ok(());
        }
        Command::Version => {
            let version = AdbBackend::server_version(config).await?;
            println!("adb daemon protocol version {version}");
            return Ok(());
        }
        _ => {}
    }

    let backend = match (&args.serial, &args.command) {
        (Some(serial), Command::WaitForDevice) => AdbBackend::new(config, serial),
        (None, Command::WaitForDevice) => {
            return Err(AdbError::Target {
                path: "--serial".into(),
                reason: "wait-for-device needs --serial".into(),
            });
        }
        (Some(serial), _) => AdbBackend::new_with_device(config, serial).await?,
        (None, _) => AdbBackend::connect_first(config).await?,
    };
    log::debug!("Using device {}", backend.device_name());

    match &args.command {
        Command::Devices | Command::Version => {}
        Command::State => println!("{}", backend.state().await?),
        Command::Shell(command) => print!("{}", backend.shell(command).await?),
        Command::Push { local, remote } => {
            let sent = backend.push(local.clone(), remote).await?;
            println!("✅ {} -> {remote}: {sent} bytes", local.display());
        }
        Command::Pull { remote, local } => {
            let received = backend
                .pull(remote, local.clone(), args.preserve_mtime)
                .await?;
            println!("✅ {remote} -> {}: {received} bytes", local.display());
        }
        Command::Stat(path) => {
            let stat = backend.stat(path).await?;
            if args.json {
                print_json(&stat);
            } else if !stat.exists() {
                println!("{path}: does not exist");
            } else {
                println!(
                    "{path}: mode {:o} size {} mtime {}",
                    stat.mode, stat.size, stat.mtime
                );
            }
        }
        Command::Forward { local, remote } => {
            // Left registered on purpose: the forward outlives this process.
            let forward = backend.forward_tcp_port(*local, *remote).await?;
            println!("✅ tcp:{} -> tcp:{}", forward.local, forward.remote);
        }
        Command::Forwards => {
            let forwards = backend.list_forwards().await?;
            if args.json {
                print_json(&forwards);
            } else {
                for f in forwards {
                    println!("{} {} {}", f.serial, f.local, f.remote);
                }
            }
        }
        Command::KillForwards => {
            backend.disable_all_forwards().await?;
            println!("✅ All forwards removed");
        }
        Command::Root => {
            backend.restart_shell_as_root().await?;
            println!("✅ adbd running as root");
        }
        Command::Remount => {
            backend.remount_system_partition().await?;
            println!("✅ System partition remounted");
        }
        Command::Reboot(target) => {
            backend.reboot(target.as_deref()).await?;
            println!("🔄 Reboot requested");
        }
        Command::WaitForDevice => {
            let timeout = args
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_WAIT);
            backend.wait_for_device(timeout).await?;
            println!("✅ {} is online", backend.device_name());
        }
    }
    Ok(())
}
