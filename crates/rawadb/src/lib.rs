//! # rawadb
//!
//! Talks to Android devices over the raw ADB protocol without the host
//! server. The protocol engine lives in [`adb_protocol`]; this crate adds
//! what it needs from the outside world:
//!
//! - [`transport`]: TCP transport for devices in `adb tcpip` mode
//! - [`keys`]: loading, deriving, and generating `adbkey` RSA key pairs
//! - [`config`]: TOML configuration with environment overrides
//! - [`device`]: the [`AdbDevice`](device::AdbDevice) convenience façade
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  AdbDevice                   │
//! │  shell · push · pull · install · reboot ...  │
//! ├──────────────────────────────────────────────┤
//! │     AdbConnection / SyncSession (engine)     │
//! ├──────────────────────┬───────────────────────┤
//! │     TcpTransport     │   RsaSigner (keys)    │
//! └──────────────────────┴───────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use rawadb::config::Config;
//! use rawadb::device::AdbDevice;
//! use rawadb::keys;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load_default()?;
//! let signers = keys::load_signers(&config.auth.key_paths);
//!
//! let mut device = AdbDevice::connect_tcp("192.168.1.20", &signers, &config)?;
//! println!("{}", device.shell("getprop ro.product.model")?);
//! device.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod keys;
pub mod transport;

pub use config::Config;
pub use device::AdbDevice;
pub use transport::TcpTransport;
