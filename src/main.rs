use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use kboot_loader::{pad_image, FlashPolicy, Options, Programmer, PropertyTag, Transport};

/// Images are padded to this alignment before upload
const IMAGE_ALIGNMENT: usize = 16;

type BoxedTransport = Box<dyn Transport<Error = IoErrorKind>>;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    interface: Interface,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Interface {
    /// Communicate with the target over a serial port
    Serial {
        /// Serial port to connect to
        #[structopt(long, default_value = "/dev/ttyUSB0")]
        port: String,

        /// Serial port baud rate
        #[structopt(long, default_value = "57600")]
        baud: usize,

        #[structopt(subcommand)]
        operation: Operation,
    },
    /// Communicate with the target over SocketCAN
    Can {
        /// CAN interface to use
        #[structopt(long, alias = "channel", default_value = "can0")]
        interface: String,

        /// Arbitration id the target transmits on (hex)
        #[structopt(long, parse(try_from_str = parse_hex))]
        tx_id: u32,

        /// Arbitration id the target listens to (hex)
        #[structopt(long, parse(try_from_str = parse_hex))]
        rx_id: u32,

        /// Use extended (29-bit) arbitration ids, ids up to 0x7FF stay standard
        #[structopt(long)]
        extended_id: bool,

        /// Bus bitrate, must match the interface configuration
        #[structopt(long, default_value = "500000")]
        bitrate: u32,

        #[structopt(subcommand)]
        operation: Operation,
    },
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Erase then write a binary to flash
    Upload {
        /// Binary image to write
        #[structopt(long)]
        binary: PathBuf,

        /// Address to write the image to (hex)
        #[structopt(long, parse(try_from_str = parse_hex))]
        start_address: u32,

        /// Number of bytes to erase (hex), defaults to the padded image length
        #[structopt(long, parse(try_from_str = parse_hex))]
        byte_count: Option<u32>,

        /// Do not reset the target after a successful upload, a failed upload always resets
        #[structopt(long)]
        no_reset: bool,

        /// Treat a missing final response as success, once all data is acknowledged
        #[structopt(long)]
        assume_success: bool,
    },
    /// Read memory into a file
    Read {
        /// File to write memory contents to
        #[structopt(long)]
        binary: PathBuf,

        /// Address to read from (hex)
        #[structopt(long, parse(try_from_str = parse_hex))]
        start_address: u32,

        /// Number of bytes to read (hex)
        #[structopt(long, parse(try_from_str = parse_hex))]
        byte_count: u32,
    },
    /// Check the bootloader is responding
    Ping,
    /// Reset the target
    Reset,
    /// Fetch a bootloader property
    GetProperty {
        /// Property name or tag
        #[structopt(long, default_value = "bootloader-version")]
        property: PropertyTag,

        /// Memory identifier, 0 for internal flash
        #[structopt(long, default_value = "0")]
        memory_id: u32,
    },
}

fn parse_hex(s: &str) -> Result<u32, std::num::ParseIntError> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16)
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let (transport, operation) = match &o.interface {
        Interface::Serial {
            port,
            baud,
            operation,
        } => (open_serial(port, *baud, &o.options)?, operation),
        Interface::Can {
            interface,
            tx_id,
            rx_id,
            extended_id,
            bitrate,
            operation,
        } => (
            open_can(interface, *tx_id, *rx_id, *extended_id, *bitrate)?,
            operation,
        ),
    };

    let mut p = Programmer::new(transport, o.options.clone());

    let res = execute(&mut p, operation);

    let _ = p.close();

    res
}

fn open_serial(port: &str, baud: usize, options: &Options) -> anyhow::Result<BoxedTransport> {
    info!("Connecting to serial port {}", port);

    let t = kboot_loader::linux::open_serial(port, baud, options.poll_delay_ms)
        .with_context(|| format!("Error connecting to serial port {}", port))?;

    Ok(Box::new(t))
}

#[cfg(feature = "can")]
fn open_can(
    interface: &str,
    tx_id: u32,
    rx_id: u32,
    extended: bool,
    bitrate: u32,
) -> anyhow::Result<BoxedTransport> {
    use kboot_loader::linux::{CanConfig, CanTransport};

    info!("Connecting to CAN interface {}", interface);

    let t = CanTransport::open(CanConfig {
        interface: interface.to_string(),
        tx_id,
        rx_id,
        extended,
        bitrate,
    })
    .with_context(|| format!("Error opening CAN interface {}", interface))?;

    Ok(Box::new(t))
}

#[cfg(not(feature = "can"))]
fn open_can(
    _interface: &str,
    _tx_id: u32,
    _rx_id: u32,
    _extended: bool,
    _bitrate: u32,
) -> anyhow::Result<BoxedTransport> {
    bail!("CAN support requires the `can` feature")
}

fn execute(p: &mut Programmer<BoxedTransport>, operation: &Operation) -> anyhow::Result<()> {
    match operation {
        Operation::Ping => {
            let r = p.ping().context("Error connecting to bootloader")?;
            info!("Bootloader {} (options: 0x{:04x})", r.version, r.options);
        }
        Operation::Reset => {
            p.reset_repeat().context("Error resetting target")?;
            info!("Target reset");
        }
        Operation::GetProperty {
            property,
            memory_id,
        } => {
            let values = p
                .get_property(*property, *memory_id)
                .with_context(|| format!("Error reading property {:?}", property))?;

            let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect();
            info!("{:?}: {:08x?}", property, values);
            println!("{}", hex::encode(raw));
        }
        Operation::Read {
            binary,
            start_address,
            byte_count,
        } => {
            let len = *byte_count as usize;
            info!(
                "Reading {} from 0x{:08x}",
                bytefmt::format(len as u64),
                start_address
            );

            let bar = progress_bar(len);
            let data = p
                .read(*start_address, len, |v| {
                    bar.set_position(v.bytes_complete as u64)
                })
                .map_err(|e| {
                    bar.abandon();
                    e
                })
                .context("Error reading memory")?;
            bar.finish_with_message("read complete");

            std::fs::write(binary, &data)
                .with_context(|| format!("Error writing file {}", binary.display()))?;
        }
        Operation::Upload {
            binary,
            start_address,
            byte_count,
            no_reset,
            assume_success,
        } => {
            let mut data = std::fs::read(binary)
                .with_context(|| format!("Error reading file {}", binary.display()))?;
            pad_image(&mut data, IMAGE_ALIGNMENT);

            let erase = byte_count.unwrap_or(data.len() as u32);
            if (erase as usize) < data.len() {
                bail!(
                    "Erase count 0x{:x} is smaller than the image (0x{:x} bytes)",
                    erase,
                    data.len()
                );
            }

            info!(
                "Uploading {} to 0x{:08x}",
                bytefmt::format(data.len() as u64),
                start_address
            );

            let policy = FlashPolicy {
                erase: Some(erase),
                reset: !*no_reset,
                assume_success: *assume_success,
            };

            let bar = progress_bar(data.len());
            match p.flash_image(*start_address, &data, &policy, |v| {
                bar.set_position(v.bytes_complete as u64)
            }) {
                Ok(()) => bar.finish_with_message("upload complete"),
                Err(e) => {
                    bar.abandon();
                    return Err(e).context("Error uploading image");
                }
            }
        }
    }

    Ok(())
}

fn progress_bar(len: usize) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes} ({eta}) {msg}")
            .progress_chars("=>-"),
    );
    bar
}
