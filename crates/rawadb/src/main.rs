//! rawadb
//!
//! Command-line client speaking the ADB protocol directly to a device.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use adb_protocol::{AuthSigner, DirEntry};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rawadb::config::{default_key_path, Config};
use rawadb::device::AdbDevice;
use rawadb::keys;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// rawadb - talk to Android devices without the adb server.
#[derive(Parser, Debug)]
#[command(name = "rawadb")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Device address as host[:port]
    #[arg(short, long, global = true, value_name = "HOST[:PORT]")]
    pub serial: Option<String>,

    /// Per-call timeout in milliseconds (overrides the config file)
    #[arg(long, global = true, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a shell command and stream its output
    Shell {
        /// Command and arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Stream the device log
    Logcat {
        /// Options passed to logcat
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        options: Vec<String>,
    },

    /// Copy a local file or directory to the device
    Push {
        /// Local file or directory
        local: PathBuf,

        /// Destination path on the device
        remote: String,
    },

    /// Copy a file from the device
    Pull {
        /// Path on the device
        remote: String,

        /// Local destination (defaults to the remote file name)
        local: Option<PathBuf>,
    },

    /// Show mode, size, and mtime of a device path
    Stat {
        /// Path on the device
        path: String,
    },

    /// List a device directory
    Ls {
        /// Directory on the device
        #[arg(default_value = "/sdcard")]
        path: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Include `.` and `..`
        #[arg(long, short)]
        all: bool,
    },

    /// Reboot the device
    Reboot {
        /// Reboot target, e.g. bootloader or recovery
        target: Option<String>,
    },

    /// Restart adbd as root
    Root,

    /// Remount system partitions read-write
    Remount,

    /// Install an APK
    Install {
        /// Local APK file
        apk: PathBuf,

        /// Staging directory on the device
        #[arg(long, value_name = "DIR")]
        dest_dir: Option<String>,

        /// Fail instead of replacing an installed package
        #[arg(long)]
        no_replace: bool,
    },

    /// Remove a package
    Uninstall {
        /// Package name
        package: String,

        /// Keep the data and cache directories
        #[arg(long, short)]
        keep_data: bool,
    },

    /// Print the device state and banner
    State,

    /// Generate a new RSA key pair
    Keygen {
        /// Private key path (defaults to ~/.android/adbkey)
        path: Option<PathBuf>,

        /// Modulus size in bits
        #[arg(long, default_value_t = keys::DEFAULT_KEY_BITS)]
        bits: usize,
    },

    /// Show the fingerprint of a key pair
    KeyInfo {
        /// Private key path (defaults to the first configured key)
        path: Option<PathBuf>,
    },
}

/// logcat can stay silent for long stretches.
const LOGCAT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// One `ls` line in JSON output.
#[derive(Debug, Serialize)]
struct ListEntry {
    name: String,
    mode: String,
    size: u32,
    mtime: u32,
}

impl From<&DirEntry> for ListEntry {
    fn from(entry: &DirEntry) -> Self {
        Self {
            name: entry.name.clone(),
            mode: format!("{:o}", entry.mode),
            size: entry.size,
            mtime: entry.mtime,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment and command-line overrides
    config.apply_env_overrides();
    if let Some(timeout_ms) = cli.timeout_ms {
        config.connection.default_timeout_ms = timeout_ms;
    }

    config.validate()?;

    // Initialize tracing; RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Keygen { path, bits } => {
            let path = path.unwrap_or_else(default_key_path);
            let signer = keys::generate(&path, bits)?;
            let public = String::from_utf8_lossy(&signer.public_key()).into_owned();
            println!("Wrote {}", path.display());
            println!("Wrote {}", keys::public_key_path(&path).display());
            println!("Fingerprint: {}", keys::fingerprint(&public)?);
        }
        Commands::KeyInfo { path } => {
            let path = match path.or_else(|| config.auth.key_paths.first().cloned()) {
                Some(path) => path,
                None => bail!("No key configured"),
            };
            let signer = keys::load_signer(&path)?;
            let public = String::from_utf8_lossy(&signer.public_key()).into_owned();
            let comment = public.split_once(' ').map(|(_, c)| c).unwrap_or("");
            println!("Key:         {}", path.display());
            println!("Bits:        {}", signer.modulus_len() * 8);
            println!("Comment:     {}", comment);
            println!("Fingerprint: {}", keys::fingerprint(&public)?);
        }
        command => {
            let serial = match &cli.serial {
                Some(serial) => serial.clone(),
                None => bail!("No device given; pass --serial HOST[:PORT]"),
            };
            let signers = keys::load_signers(&config.auth.key_paths);
            if signers.is_empty() {
                tracing::warn!("No usable keys found; authentication will fail if the device asks");
            }

            let mut device = AdbDevice::connect_tcp(&serial, &signers, &config)
                .with_context(|| format!("Failed to connect to {}", serial))?;
            let result = run_device_command(&mut device, command);
            if let Err(e) = device.close() {
                tracing::debug!("Failed to close connection: {}", e);
            }
            result?;
        }
    }

    Ok(())
}

fn run_device_command(device: &mut AdbDevice, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Shell { command } => stream_to_stdout(device.streaming_shell(&command.join(" "))?)?,
        Commands::Logcat { options } => {
            device.set_timeout(LOGCAT_IDLE_TIMEOUT);
            stream_to_stdout(device.logcat(&options.join(" "))?)?
        }
        Commands::Push { local, remote } => {
            let bytes = device.push_file(&local, &remote)?;
            println!("{}: {} bytes pushed", local.display(), bytes);
        }
        Commands::Pull { remote, local } => {
            let local = match local {
                Some(local) => local,
                None => default_pull_target(&remote)?,
            };
            let bytes = device.pull_file(&remote, &local)?;
            println!("{}: {} bytes pulled", remote, bytes);
        }
        Commands::Stat { path } => {
            let stat = device.stat(&path)?;
            if !stat.exists() {
                bail!("{}: no such file or directory", path);
            }
            println!("mode:  {:o}", stat.mode);
            println!("size:  {}", stat.size);
            println!("mtime: {}", stat.mtime);
        }
        Commands::Ls { path, json, all } => {
            let entries: Vec<DirEntry> = device
                .list(&path)?
                .into_iter()
                .filter(|e| all || (e.name != "." && e.name != ".."))
                .collect();
            if json {
                let out: Vec<ListEntry> = entries.iter().map(ListEntry::from).collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for entry in &entries {
                    println!("{:>7o} {:>10} {:>10} {}", entry.mode, entry.size, entry.mtime, entry.name);
                }
            }
        }
        Commands::Reboot { target } => {
            device.reboot(target.as_deref())?;
            println!("Reboot requested");
        }
        Commands::Root => print!("{}", device.root()?),
        Commands::Remount => print!("{}", device.remount()?),
        Commands::Install {
            apk,
            dest_dir,
            no_replace,
        } => print!("{}", device.install(&apk, dest_dir.as_deref(), !no_replace)?),
        Commands::Uninstall { package, keep_data } => {
            print!("{}", device.uninstall(&package, keep_data)?)
        }
        Commands::State => {
            println!("{}", device.state());
            println!("{}", device.banner().raw());
        }
        Commands::Keygen { .. } | Commands::KeyInfo { .. } => {
            bail!("Key commands do not take a device")
        }
    }
    Ok(())
}

fn stream_to_stdout<I>(chunks: I) -> anyhow::Result<()>
where
    I: Iterator<Item = adb_protocol::Result<Vec<u8>>>,
{
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for chunk in chunks {
        let data = chunk?;
        out.write_all(&data)?;
        out.flush()?;
    }
    Ok(())
}

fn default_pull_target(remote: &str) -> anyhow::Result<PathBuf> {
    match Path::new(remote.trim_end_matches('/')).file_name() {
        Some(name) => Ok(PathBuf::from(name)),
        None => bail!("Cannot derive a local file name from {:?}", remote),
    }
}
