//! Linux transports for the bootloader.

use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::transport::SerialTransport;
use crate::{Options, Programmer};

/// Serial interface configuration
#[derive(Clone, PartialEq, Debug)]
pub struct SerialConfig {
    pub port: String,
    pub baud: usize,
}

/// Open and configure a linux serial port (8N1, no flow control)
pub fn open_serial<P: AsRef<Path>>(
    port: P,
    baud: usize,
    poll_delay_ms: u32,
) -> Result<SerialTransport<Serial, Delay>, SerialError> {
    debug!("Opening serial port {}", port.as_ref().display());

    let mut port = Serial::open(port.as_ref())?;

    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)?;

    // Reads become non-blocking polls, the session owns the timeout
    port.0.set_timeout(Duration::from_millis(1))?;

    Ok(SerialTransport::new(port, Delay {}, poll_delay_ms))
}

impl Programmer<SerialTransport<Serial, Delay>> {
    /// Create a new linux serial port programmer instance
    pub fn linux(config: &SerialConfig, options: Options) -> Result<Self, SerialError> {
        let t = open_serial(&config.port, config.baud, options.poll_delay_ms)?;
        Ok(Self::new(t, options))
    }
}

#[cfg(feature = "can")]
pub use self::can::{CanConfig, CanTransport};

#[cfg(feature = "can")]
mod can {
    use std::io::ErrorKind as IoErrorKind;
    use std::time::{Duration, Instant};

    use socketcan::{CANFrame, CANSocket, CANSocketOpenError, SFF_MASK};

    use crate::transport::Transport;

    /// Maximum payload of a classic CAN frame
    pub const CAN_FRAME_LEN: usize = 8;

    /// CAN interface configuration
    ///
    /// `tx_id` is the arbitration id the target transmits on, `rx_id` the id
    /// it listens to.
    #[derive(Clone, PartialEq, Debug)]
    pub struct CanConfig {
        pub interface: String,
        pub tx_id: u32,
        pub rx_id: u32,
        pub extended: bool,
        /// Expected bus bitrate, SocketCAN interfaces are configured with `ip link`
        pub bitrate: u32,
    }

    impl CanConfig {
        /// Configured ids that socketcan will put on the bus in standard format
        /// despite `extended`, the frame format follows the id range
        pub fn standard_ids(&self) -> Vec<u32> {
            if !self.extended {
                return vec![];
            }
            [self.tx_id, self.rx_id]
                .iter()
                .copied()
                .filter(|id| *id <= SFF_MASK)
                .collect()
        }
    }

    /// SocketCAN transport, segmenting frames into 8 byte CAN messages
    pub struct CanTransport {
        socket: CANSocket,
        config: CanConfig,
    }

    impl CanTransport {
        pub fn open(config: CanConfig) -> Result<Self, CANSocketOpenError> {
            debug!(
                "Opening CAN interface {} at {} bit/s (tx: 0x{:x} rx: 0x{:x})",
                config.interface, config.bitrate, config.tx_id, config.rx_id
            );

            for id in config.standard_ids() {
                warn!(
                    "CAN id 0x{:x} is in the standard range and is handled as a standard id",
                    id
                );
            }

            let socket = CANSocket::open(&config.interface)?;
            Ok(Self { socket, config })
        }

        fn accepts(&self, frame: &CANFrame) -> bool {
            // The frame format follows the id range in both directions
            let extended = self.config.tx_id > SFF_MASK;

            !frame.is_error()
                && !frame.is_rtr()
                && frame.is_extended() == extended
                && frame.id() == self.config.tx_id
        }
    }

    impl Transport for CanTransport {
        type Error = IoErrorKind;

        fn send(&mut self, data: &[u8]) -> Result<(), IoErrorKind> {
            for segment in data.chunks(CAN_FRAME_LEN) {
                let f = CANFrame::new(self.config.rx_id, segment, false, false)
                    .map_err(|_| IoErrorKind::InvalidInput)?;
                self.socket.write_frame(&f).map_err(|e| e.kind())?;
            }
            Ok(())
        }

        fn receive(&mut self, timeout: Duration) -> nb::Result<Vec<u8>, IoErrorKind> {
            let deadline = Instant::now() + timeout;

            loop {
                let now = Instant::now();
                if now >= deadline {
                    return Err(nb::Error::WouldBlock);
                }

                // A zero timeout would block forever
                let wait = (deadline - now).max(Duration::from_millis(1));
                self.socket
                    .set_read_timeout(wait)
                    .map_err(|e| nb::Error::Other(e.kind()))?;

                match self.socket.read_frame() {
                    Ok(f) if self.accepts(&f) => return Ok(f.data().to_vec()),
                    Ok(f) => trace!("Ignoring CAN frame with id 0x{:x}", f.id()),
                    Err(e) => match e.kind() {
                        IoErrorKind::WouldBlock | IoErrorKind::TimedOut => {
                            return Err(nb::Error::WouldBlock)
                        }
                        IoErrorKind::Interrupted => (),
                        k => return Err(nb::Error::Other(k)),
                    },
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn config(tx_id: u32, rx_id: u32, extended: bool) -> CanConfig {
            CanConfig {
                interface: "vcan0".to_string(),
                tx_id,
                rx_id,
                extended,
                bitrate: 500_000,
            }
        }

        #[test]
        fn standard_ids_with_extended_format() {
            assert_eq!(config(0x123, 0x1234_5678, true).standard_ids(), vec![0x123]);
            assert_eq!(config(0x123, 0x7FF, true).standard_ids(), vec![0x123, 0x7FF]);
            assert!(config(0x800, 0x1234_5678, true).standard_ids().is_empty());
            assert!(config(0x123, 0x321, false).standard_ids().is_empty());
        }
    }
}
