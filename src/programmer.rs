//! High level bootloader operations.

use core::convert::TryFrom;
use core::fmt::Debug;

use retry::{delay::Fixed, retry, OperationResult};

use crate::command::{Command, Response};
use crate::frame::{PingResponse, ProtocolError};
use crate::protocol::{CommandTag, PropertyTag};
use crate::session::{from_retry, Session, State};
use crate::transport::Transport;
use crate::{Error, Options, Progress};

/// Policy applied by [`Programmer::flash_image`]
#[derive(Clone, PartialEq, Debug)]
pub struct FlashPolicy {
    /// Bytes to erase before writing, defaults to the image length
    pub erase: Option<u32>,
    /// Reset the target after a successful upload.
    /// A failed upload always resets so the target does not stay in the bootloader.
    pub reset: bool,
    /// Treat a missing final write response as success, once all data is acknowledged
    pub assume_success: bool,
}

impl Default for FlashPolicy {
    fn default() -> Self {
        Self {
            erase: None,
            reset: true,
            assume_success: false,
        }
    }
}

/// Bootloader programmer, executes commands over a [`Session`]
pub struct Programmer<T> {
    session: Session<T>,
    chunk_size: usize,
}

impl<T, E> Programmer<T>
where
    T: Transport<Error = E>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(transport: T, options: Options) -> Self {
        Self::from_session(Session::new(transport, options))
    }

    /// Create a programmer over an existing session
    pub fn from_session(session: Session<T>) -> Self {
        let chunk_size = session.options().chunk_size.max(1);
        Self {
            session,
            chunk_size,
        }
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<T> {
        &mut self.session
    }

    /// Size of data chunks used when writing memory
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Close the session and release the transport
    pub fn close(mut self) -> T {
        self.session.close();
        self.session.into_inner()
    }

    /// Ping the bootloader, returning the reported version and options
    pub fn ping(&mut self) -> Result<PingResponse, Error<E>> {
        self.session.ping()
    }

    fn connect(&mut self) -> Result<(), Error<E>> {
        if self.session.state() != State::Connected {
            self.session.ping()?;
        }
        Ok(())
    }

    /// Execute a command, requiring a successful status
    fn command(&mut self, command: &Command) -> Result<Response, Error<E>> {
        self.connect()?;

        let r = self.session.send_command(command)?;
        if !r.status().is_success() {
            error!("{:?} failed: {}", command.tag(), r.status());
            return Err(Error::Status(r.status()));
        }

        Ok(r)
    }

    /// Fetch the value words of a bootloader property
    pub fn get_property(
        &mut self,
        property: PropertyTag,
        memory_id: u32,
    ) -> Result<Vec<u32>, Error<E>> {
        debug!("Reading property {:?}", property);

        match self.command(&Command::get_property(property, memory_id))? {
            Response::GetProperty { values, .. } => Ok(values),
            r => Err(ProtocolError::TagMismatch {
                expected: CommandTag::GetProperty,
                actual: r.response_tag() as u32,
            }
            .into()),
        }
    }

    /// Reduce the chunk size to the maximum packet size reported by the device
    pub fn negotiate_chunk_size(&mut self) -> Result<usize, Error<E>> {
        let values = self.get_property(PropertyTag::MaxPacketSize, 0)?;

        match values.first() {
            Some(&max) if max > 0 && (max as usize) < self.chunk_size => {
                info!(
                    "Reducing chunk size from {} to {} bytes",
                    self.chunk_size, max
                );
                self.chunk_size = max as usize;
            }
            Some(&max) => debug!("Device max packet size: {} bytes", max),
            None => warn!("Empty max packet size response"),
        }

        Ok(self.chunk_size)
    }

    pub fn flash_erase_all(&mut self) -> Result<(), Error<E>> {
        info!("Erasing all flash");
        self.command(&Command::flash_erase_all())?;
        Ok(())
    }

    pub fn flash_erase_region(&mut self, address: u32, count: u32) -> Result<(), Error<E>> {
        info!("Erasing {} bytes at 0x{:08x}", count, address);
        self.command(&Command::flash_erase_region(address, count))?;
        Ok(())
    }

    /// Erase and write `data` to flash at `address`
    pub fn upload(
        &mut self,
        address: u32,
        data: &[u8],
        progress: impl FnMut(Progress),
    ) -> Result<(), Error<E>> {
        let erase = u32::try_from(data.len()).ok();
        self.upload_with(address, data, erase, progress)
    }

    /// Write `data` to memory at `address`, first erasing `erase` bytes if provided
    pub fn upload_with(
        &mut self,
        address: u32,
        data: &[u8],
        erase: Option<u32>,
        mut progress: impl FnMut(Progress),
    ) -> Result<(), Error<E>> {
        if data.is_empty() {
            warn!("Nothing to upload");
            return Ok(());
        }
        let len =
            u32::try_from(data.len()).map_err(|_| ProtocolError::PayloadTooLong(data.len()))?;

        self.connect()?;

        if let Some(count) = erase {
            self.flash_erase_region(address, count)?;
        }

        info!("Writing {} bytes at 0x{:08x}", len, address);
        self.command(&Command::write_memory(address, len))?;

        let mut sent = 0;
        for chunk in data.chunks(self.chunk_size) {
            self.session.send_data(chunk)?;
            sent += chunk.len();

            progress(Progress {
                bytes_complete: sent,
                bytes_total: data.len(),
            });
        }

        let r = self.session.receive_response(CommandTag::WriteMemory)?;
        if !r.status().is_success() {
            error!("Upload failed: {}", r.status());
            return Err(Error::Upload(r.status()));
        }

        info!("Upload complete");
        Ok(())
    }

    /// Upload an image under `policy`
    ///
    /// On failure the erased region is erased again and the target is reset,
    /// the original error is returned.
    pub fn flash_image(
        &mut self,
        address: u32,
        data: &[u8],
        policy: &FlashPolicy,
        mut progress: impl FnMut(Progress),
    ) -> Result<(), Error<E>> {
        let erase = match policy.erase {
            Some(n) => n,
            None => u32::try_from(data.len())
                .map_err(|_| ProtocolError::PayloadTooLong(data.len()))?,
        };

        let mut sent = 0;
        let r = self.upload_with(address, data, Some(erase), |v| {
            sent = v.bytes_complete;
            progress(v)
        });

        match r {
            Ok(()) => (),
            Err(Error::Timeout) if policy.assume_success && sent == data.len() => {
                warn!("No final response from bootloader, assuming success");
            }
            Err(e) => {
                self.recover(address, erase);
                return Err(e);
            }
        }

        if policy.reset {
            self.reset_repeat()?;
        }

        Ok(())
    }

    /// Erase a partially written region and reset the target
    fn recover(&mut self, address: u32, erase: u32) {
        self.session.reopen();

        warn!("Erasing partially written image");
        if let Err(e) = self.flash_erase_region(address, erase) {
            error!("Error erasing flash: {}", e);
        }

        if let Err(e) = self.reset_repeat() {
            error!("Error resetting target, it may remain in the bootloader: {}", e);
        }
    }

    /// Read `length` bytes of memory from `address`
    pub fn read(
        &mut self,
        address: u32,
        length: usize,
        progress: impl FnMut(Progress),
    ) -> Result<Vec<u8>, Error<E>> {
        if length == 0 {
            warn!("Nothing to read");
            return Ok(vec![]);
        }
        let len = u32::try_from(length).map_err(|_| ProtocolError::PayloadTooLong(length))?;

        info!("Reading {} bytes at 0x{:08x}", len, address);
        match self.command(&Command::read_memory(address, len))? {
            Response::ReadMemory {
                data_byte_count, ..
            } if data_byte_count != len => {
                error!(
                    "Device will send {} bytes, {} requested",
                    data_byte_count, len
                );
                return Err(ProtocolError::ByteCountMismatch {
                    expected: len,
                    actual: data_byte_count,
                }
                .into());
            }
            Response::ReadMemory { .. } => (),
            r => {
                return Err(ProtocolError::TagMismatch {
                    expected: CommandTag::ReadMemory,
                    actual: r.response_tag() as u32,
                }
                .into())
            }
        }

        let data = self.session.receive_data(length, progress)?;

        let r = self.session.receive_response(CommandTag::ReadMemory)?;
        if !r.status().is_success() {
            error!("Read failed: {}", r.status());
            return Err(Error::Status(r.status()));
        }

        info!("Read complete");
        Ok(data)
    }

    /// Reset the target
    ///
    /// The device may restart before it responds, so once the command is
    /// acknowledged a missing response is treated as success.
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        self.connect()?;

        info!("Resetting target");
        self.session.transmit_command(&Command::reset())?;

        match self.session.receive_response(CommandTag::Reset) {
            Ok(r) if !r.status().is_success() => {
                error!("Reset failed: {}", r.status());
                return Err(Error::Status(r.status()));
            }
            Ok(_) => (),
            Err(Error::Timeout) => debug!("No response to reset"),
            Err(Error::Transport(e)) => debug!("Link dropped after reset: {:?}", e),
            Err(e) => return Err(e),
        }

        self.session.disconnect();
        Ok(())
    }

    /// Reset the target, resending while the command is not acknowledged
    /// up to `ping_repeat` times
    pub fn reset_repeat(&mut self) -> Result<(), Error<E>> {
        let attempts = self.session.options().ping_repeat.max(1);

        let r = retry(Fixed::from_millis(0).take(attempts as usize - 1), || {
            match self.reset() {
                Ok(()) => OperationResult::Ok(()),
                Err(Error::Timeout) => {
                    warn!("Reset command was not acknowledged");
                    OperationResult::Retry(Error::Timeout)
                }
                Err(e) => OperationResult::Err(e),
            }
        });

        r.map_err(from_retry)
    }
}
