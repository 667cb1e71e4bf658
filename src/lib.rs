//! NXP Kinetis (KBOOT / MCUBOOT) Bootloader host.
//!
//! Based on the Kinetis Bootloader v2.0.0 Reference Manual.
//!
//! The [`Programmer`] drives a [`session::Session`] over any [`Transport`],
//! which may be a serial port (see [`transport::SerialTransport`]), a CAN bus
//! (see `linux::CanTransport`, feature `can`) or a simulated device.

use core::fmt::Debug;
use std::time::Duration;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod command;
pub mod frame;
pub mod programmer;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(feature = "linux")]
pub mod linux;

pub use command::{Command, Response};
pub use frame::{CodecError, Frame, PingResponse, ProtocolError};
pub use programmer::{FlashPolicy, Programmer};
pub use protocol::{CommandTag, PropertyTag, Status, StatusCode};
pub use session::{Session, State};
pub use transport::Transport;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E: Debug> {
    #[error("transport error: {0:?}")]
    Transport(E),
    #[error("frame checksum mismatch, received 0x{received:04x} computed 0x{computed:04x}")]
    Checksum { received: u16, computed: u16 },
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),
    #[error("timeout awaiting bootloader response")]
    Timeout,
    #[error("frame rejected by the bootloader")]
    Nak,
    #[error("bootloader aborted the exchange")]
    AckAbort,
    #[error("bootloader reported status {0}")]
    Status(Status),
    #[error("no ping response from the bootloader")]
    Connection,
    #[error("data chunk rejected by the bootloader")]
    Transfer,
    #[error("upload failed with status {0}")]
    Upload(Status),
}

impl<E: Debug> From<ProtocolError> for Error<E> {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl<E: Debug> From<CodecError> for Error<E> {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Checksum { received, computed } => Self::Checksum { received, computed },
            CodecError::Protocol(p) => Self::Protocol(p),
        }
    }
}

/// Session options
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub timeout_ms: u32,

    /// Number of times to ping the bootloader before giving up
    #[cfg_attr(feature = "structopt", structopt(long = "cmd-repeat", default_value = "3"))]
    pub ping_repeat: u32,

    /// Number of times a frame is sent before a nak is fatal
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "2"))]
    pub send_attempts: u32,

    /// Size of data chunks sent while writing memory
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "32"))]
    pub chunk_size: usize,

    /// Period to poll for bootloader responses on polled links
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,
}

impl Options {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms as u64)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            ping_repeat: 3,
            send_attempts: 2,
            chunk_size: protocol::DEFAULT_CHUNK,
            poll_delay_ms: 1,
        }
    }
}

/// Progress information provided to transfer callbacks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    /// Number of bytes that have been transferred
    pub bytes_complete: usize,
    /// The total number of bytes to transfer
    pub bytes_total: usize,
}

impl Progress {
    pub fn percent(&self) -> f32 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        self.bytes_complete as f32 * 100.0 / self.bytes_total as f32
    }
}

/// Pad an image with the flash erase pattern (0xFF) to a multiple of `alignment`.
///
/// The manual asks for 4 byte alignment, however some parts (MK66FX1M0) need 16.
pub fn pad_image(image: &mut Vec<u8>, alignment: usize) {
    if alignment == 0 {
        return;
    }
    let rem = image.len() % alignment;
    if rem != 0 {
        image.resize(image.len() + alignment - rem, 0xFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_to_alignment() {
        let mut d = b"test_data".to_vec();
        pad_image(&mut d, 16);
        assert_eq!(d.len(), 16);
        assert_eq!(&d[9..], &[0xFF; 7]);

        let mut d = vec![0u8; 32];
        pad_image(&mut d, 16);
        assert_eq!(d.len(), 32);
    }

    #[test]
    fn codec_errors_map_to_taxonomy() {
        let e: Error<()> = CodecError::Checksum {
            received: 1,
            computed: 2,
        }
        .into();
        assert_eq!(
            e,
            Error::Checksum {
                received: 1,
                computed: 2
            }
        );

        let e: Error<()> = ProtocolError::UnknownFrameType(0x42).into();
        assert_eq!(e, Error::Protocol(ProtocolError::UnknownFrameType(0x42)));
    }

    #[test]
    fn progress_percent() {
        let p = Progress {
            bytes_complete: 16,
            bytes_total: 64,
        };
        assert_eq!(p.percent(), 25.0);
    }
}
