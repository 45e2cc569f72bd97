use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Devices,
    Version,
    State,
    Shell(String),
    Push { local: PathBuf, remote: String },
    Pull { remote: String, local: PathBuf },
    Stat(String),
    Forward { local: u16, remote: u16 },
    Forwards,
    KillForwards,
    Root,
    Remount,
    Reboot(Option<String>),
    WaitForDevice,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Args {
    pub command: Command,
    pub serial: Option<String>,
    pub port: Option<u16>,
    pub json: bool,
    pub debug_mode: bool,
    pub preserve_mtime: bool,
    pub timeout_secs: Option<u64>,
}

impl Args {
    /// `Err` carries a usage error for the caller to report.
    pub fn parse() -> Result<Option<Self>, String> {
        let args: Vec<String> = env::args().skip(1).collect();
        Self::parse_from(&args)
    }

    /// `Ok(None)` means help or version was printed and there is nothing to run.
    pub fn parse_from(args: &[String]) -> Result<Option<Self>, String> {
        let mut serial = None;
        let mut port = None;
        let mut json = false;
        let mut debug_mode = false;
        let mut preserve_mtime = false;
        let mut timeout_secs = None;
        let mut positional: Vec<&str> = Vec::new();

        for arg in args {
            if arg == "--help" || arg == "-h" {
                print_help();
                return Ok(None);
            } else if arg == "--version" || arg == "-v" {
                println!("adb-host v{}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            } else if arg == "--json" {
                json = true;
            } else if arg == "--debug" {
                debug_mode = true;
            } else if arg == "--preserve-mtime" || arg == "-a" {
                preserve_mtime = true;
            } else if let Some(val) = arg.strip_prefix("--serial=") {
                serial = Some(val.to_string());
            } else if let Some(val) = arg.strip_prefix("--port=") {
                port = Some(
                    val.parse::<u16>()
                        .map_err(|_| format!("Invalid port value: {val}"))?,
                );
            } else if let Some(val) = arg.strip_prefix("--timeout=") {
                timeout_secs = Some(
                    val.parse::<u64>()
                        .map_err(|_| format!("Invalid timeout value: {val}"))?,
                );
            } else if arg.starts_with("--") {
                return Err(format!("Unknown argument: {arg}"));
            } else {
                positional.push(arg);
            }
        }

        let command = parse_command(&positional)?;
        Ok(Some(Args {
            command,
            serial,
            port,
            json,
            debug_mode,
            preserve_mtime,
            timeout_secs,
        }))
    }
}

fn parse_port(raw: &str) -> Result<u16, String> {
    raw.strip_prefix("tcp:")
        .unwrap_or(raw)
        .parse::<u16>()
        .map_err(|_| format!("Invalid port: {raw}"))
}

fn parse_command(words: &[&str]) -> Result<Command, String> {
    let Some((&name, rest)) = words.split_first() else {
        return Err("Missing command".to_string());
    };
    let command = match (name, rest) {
        ("devices", []) => Command::Devices,
        ("version", []) => Command::Version,
        ("get-state", []) => Command::State,
        ("shell", words) if !words.is_empty() => Command::Shell(words.join(" ")),
        ("push", [local, remote]) => Command::Push {
            local: PathBuf::from(local),
            remote: remote.to_string(),
        },
        ("pull", [remote, local]) => Command::Pull {
            remote: remote.to_string(),
            local: PathBuf::from(local),
        },
        ("stat", [path]) => Command::Stat(path.to_string()),
        ("forward", [local, remote]) => Command::Forward {
            local: parse_port(local)?,
            remote: parse_port(remote)?,
        },
        ("forward-list", []) => Command::Forwards,
        ("forward-remove-all", []) => Command::KillForwards,
        ("root", []) => Command::Root,
        ("remount", []) => Command::Remount,
        ("reboot", []) => Command::Reboot(None),
        ("reboot", [target]) => Command::Reboot(Some(target.to_string())),
        ("wait-for-device", []) => Command::WaitForDevice,
        _ => return Err(format!("Unknown or malformed command: {}", words.join(" "))),
    };
    Ok(command)
}

pub fn print_help() {
    println!("🤖 adb-host - talk to the local adb daemon without the adb binary");
    println!();
    println!("USAGE:");
    println!("    adb-host [FLAGS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    devices                     List devices known to the daemon");
    println!("    version                     Print the daemon protocol version");
    println!("    get-state                   Print the device state");
    println!("    shell <cmd...>              Run a shell command on the device");
    println!("    push <local> <remote>       Upload a regular file");
    println!("    pull <remote> <local>       Download a regular file");
    println!("    stat <remote>               Show mode, size and mtime of a remote path");
    println!("    forward <local> <remote>    Forward host tcp:<local> to device tcp:<remote>");
    println!("    forward-list                List active forwards for the device");
    println!("    forward-remove-all          Remove every forward for the device");
    println!("    root                        Restart adbd as root");
    println!("    remount                     Remount the system partition read-write");
    println!("    reboot [target]             Reboot (optionally into bootloader/recovery)");
    println!("    wait-for-device             Block until the device is online");
    println!();
    println!("FLAGS:");
    println!("    --serial=<serial>   Device to use (default: first online device)");
    println!("    --port=<port>       Daemon port (default: $ANDROID_ADB_SERVER_PORT or 5037)");
    println!("    --timeout=N         Read timeout in seconds; also bounds wait-for-device");
    println!("    --preserve-mtime, -a  Keep the remote mtime on pull");
    println!("    --json              Print results as JSON");
    println!("    --debug             Enable debug logging");
    println!("    --help, -h          Show this help message");
    println!("    --version, -v       Show version information");
    println!();
    println!("EXAMPLES:");
    println!("    adb-host devices --json");
    println!("    adb-host --serial=emulator-5554 shell getprop ro.product.model");
    println!("    adb-host push build/app.apk /data/local/tmp/app.apk");
    println!("    adb-host -a pull /sdcard/DCIM/photo.jpg photo.jpg");
}
