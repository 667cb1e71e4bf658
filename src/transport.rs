//! Transport abstraction used by the bootloader session.

use std::time::{Duration, Instant};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

/// Raw duplex channel to the bootloader
pub trait Transport {
    type Error: core::fmt::Debug;

    /// Send all of `data` to the device
    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receive whatever the device has sent, waiting up to `timeout`.
    ///
    /// Returns `nb::Error::WouldBlock` if nothing arrived before the deadline.
    fn receive(&mut self, timeout: Duration) -> nb::Result<Vec<u8>, Self::Error>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    type Error = T::Error;

    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        (**self).send(data)
    }

    fn receive(&mut self, timeout: Duration) -> nb::Result<Vec<u8>, Self::Error> {
        (**self).receive(timeout)
    }
}

/// Byte stream transport over an embedded-hal serial port
pub struct SerialTransport<P, D> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
}

impl<P, D, E> SerialTransport<P, D>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new serial transport, polling the port every `poll_delay_ms`
    /// while waiting for data
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms,
        }
    }

    /// Release the underlying port
    pub fn free(self) -> (P, D) {
        (self.port, self.delay)
    }
}

impl<P, D, E> Transport for SerialTransport<P, D>
where
    P: Write<u8, Error = E> + Read<u8, Error = E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    type Error = E;

    fn send(&mut self, data: &[u8]) -> Result<(), E> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        block!(self.port.flush())?;

        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> nb::Result<Vec<u8>, E> {
        let start = Instant::now();
        let mut buff = vec![];

        loop {
            match self.port.read() {
                Ok(v) => {
                    buff.push(v);
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(nb::Error::Other(e)),
            }

            // Hand back what we have once the line goes quiet
            if !buff.is_empty() {
                return Ok(buff);
            }

            if start.elapsed() >= timeout {
                return Err(nb::Error::WouldBlock);
            }

            self.delay.delay_ms(self.poll_delay_ms);
        }
    }
}
