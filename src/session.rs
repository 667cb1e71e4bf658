//! Bootloader link session.
//!
//! A session owns one transport connected to one device and drives the
//! half-duplex request / acknowledge / response exchange over it:
//!
//! ```text
//! Idle --ping--> Connecting --ping response--> Connected
//!                    |                             |
//!                    '--no response--> Idle        '--ack abort--> Aborted
//! ```
//!
//! `close()` moves any state to `Closed`, after which nothing is sent. An
//! aborted session sends nothing until `reopen()` returns it to `Idle`.

use std::time::Instant;

use retry::{delay::Fixed, retry, OperationResult};

use crate::command::{Command, Response};
use crate::frame::{frame_length, Frame, PingResponse, ProtocolError, CONTROL_FRAME_LEN};
use crate::protocol::{CommandTag, START_BYTE, SUPPORTED_VERSION};
use crate::transport::Transport;
use crate::{Error, Options, Progress};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    Idle,
    Connecting,
    Connected,
    Aborted,
    Closed,
}

pub struct Session<T> {
    transport: T,
    options: Options,
    state: State,
    name: String,
    rx: Vec<u8>,
    ping_response: Option<PingResponse>,
}

impl<T, E> Session<T>
where
    T: Transport<Error = E>,
    E: core::fmt::Debug,
{
    /// Create a new session over an open transport
    pub fn new(transport: T, options: Options) -> Self {
        Self::named(transport, options, "kboot")
    }

    /// Create a new session, logging under the target `name`
    pub fn named(transport: T, options: Options, name: &str) -> Self {
        Self {
            transport,
            options,
            state: State::Idle,
            name: name.to_string(),
            rx: vec![],
            ping_response: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Version and options reported by the last successful ping
    pub fn ping_response(&self) -> Option<&PingResponse> {
        self.ping_response.as_ref()
    }

    /// Close the session, no further frames will be sent
    pub fn close(&mut self) {
        debug!(target: self.name.as_str(), "Closing session");
        self.state = State::Closed;
        self.rx.clear();
    }

    /// Release the transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Mark the link as dropped by the device, a new ping is required
    pub fn disconnect(&mut self) {
        if self.state == State::Connected {
            self.state = State::Idle;
        }
        self.rx.clear();
    }

    /// Return an aborted session to `Idle` so it may ping again
    pub fn reopen(&mut self) {
        if self.state == State::Aborted {
            debug!(target: self.name.as_str(), "Reopening aborted session");
            self.state = State::Idle;
            self.rx.clear();
        }
    }

    /// Ping the bootloader, retrying up to `ping_repeat` times
    pub fn ping(&mut self) -> Result<PingResponse, Error<E>> {
        self.check_state()?;
        self.state = State::Connecting;
        self.rx.clear();

        let attempts = self.options.ping_repeat.max(1);
        let mut attempt = 0;

        let r = retry(Fixed::from_millis(0).take(attempts as usize - 1), || {
            attempt += 1;
            debug!(target: self.name.as_str(), "Sending ping ({}/{})", attempt, attempts);

            match self.ping_once() {
                Ok(p) => OperationResult::Ok(p),
                Err(Error::Timeout) => {
                    warn!(target: self.name.as_str(), "No ping response");
                    OperationResult::Retry(Error::Timeout)
                }
                Err(e) => OperationResult::Err(e),
            }
        });

        match r.map_err(from_retry) {
            Ok(p) => {
                info!(
                    target: self.name.as_str(),
                    "Ping responded in {} attempt(s), version: {}, options: 0x{:04x}",
                    attempt,
                    p.version,
                    p.options
                );
                if p.version.name != SUPPORTED_VERSION.name
                    || p.version.major != SUPPORTED_VERSION.major
                {
                    warn!(
                        target: self.name.as_str(),
                        "Unsupported protocol version: {}", p.version
                    );
                }

                self.state = State::Connected;
                self.ping_response = Some(p);
                Ok(p)
            }
            Err(Error::Timeout) => {
                error!(target: self.name.as_str(), "Target did not respond to ping");
                self.state = State::Idle;
                Err(Error::Connection)
            }
            Err(e) => {
                self.state = State::Idle;
                Err(e)
            }
        }
    }

    fn ping_once(&mut self) -> Result<PingResponse, Error<E>> {
        self.send_frame(&Frame::Ping)?;

        let deadline = Instant::now() + self.options.timeout();
        loop {
            match self.receive_frame_until(deadline)? {
                Frame::PingResponse(p) => return Ok(p),
                f => debug!(
                    target: self.name.as_str(),
                    "Ignoring {:?} frame while awaiting ping response",
                    f.frame_type()
                ),
            }
        }
    }

    /// Send a command and return the device response
    pub fn send_command(&mut self, command: &Command) -> Result<Response, Error<E>> {
        self.transmit_command(command)?;
        self.receive_response(command.tag())
    }

    /// Send a command and wait only for it to be acknowledged
    pub fn transmit_command(&mut self, command: &Command) -> Result<(), Error<E>> {
        self.check_state()?;
        debug!(
            target: self.name.as_str(),
            "Sending command {:?} {:x?}",
            command.tag(),
            command.params()
        );

        let raw = Frame::Command(command.encode()).encode()?;
        self.transmit(&raw)
    }

    /// Send a chunk of data in the data phase of a command
    pub fn send_data(&mut self, chunk: &[u8]) -> Result<(), Error<E>> {
        self.check_state()?;

        let raw = Frame::Data(chunk.to_vec()).encode()?;
        match self.transmit(&raw) {
            Err(Error::Nak) => {
                error!(target: self.name.as_str(), "Data chunk rejected");
                Err(Error::Transfer)
            }
            r => r,
        }
    }

    /// Wait for the response to a command with tag `tag`, acknowledging it
    pub fn receive_response(&mut self, tag: CommandTag) -> Result<Response, Error<E>> {
        self.check_state()?;

        let payload = match self.receive_frame()? {
            Frame::Command(p) => p,
            Frame::AckAbort => return Err(self.aborted()),
            f => return Err(ProtocolError::UnexpectedFrame(f.frame_type()).into()),
        };

        let response = Response::decode(&payload, tag)?;
        self.send_frame(&Frame::Ack)?;

        let level = if response.status().is_success() {
            log::Level::Debug
        } else {
            log::Level::Warn
        };
        log!(
            target: self.name.as_str(),
            level,
            "{:?} response: {:?} status: {}",
            tag,
            response.response_tag(),
            response.status()
        );

        Ok(response)
    }

    /// Receive `expected` bytes from the data phase of a command
    pub fn receive_data(
        &mut self,
        expected: usize,
        mut progress: impl FnMut(Progress),
    ) -> Result<Vec<u8>, Error<E>> {
        self.check_state()?;

        let mut buff = Vec::with_capacity(expected);
        while buff.len() < expected {
            let d = match self.receive_frame()? {
                Frame::Data(d) => d,
                Frame::AckAbort => return Err(self.aborted()),
                f => return Err(ProtocolError::UnexpectedFrame(f.frame_type()).into()),
            };

            if buff.len() + d.len() > expected {
                return Err(ProtocolError::Overrun {
                    expected,
                    received: buff.len() + d.len(),
                }
                .into());
            }

            self.send_frame(&Frame::Ack)?;
            buff.extend_from_slice(&d);

            progress(Progress {
                bytes_complete: buff.len(),
                bytes_total: expected,
            });
        }

        Ok(buff)
    }

    /// Send an encoded frame and await acknowledgement, resending the same
    /// frame on nak while attempts remain
    fn transmit(&mut self, raw: &[u8]) -> Result<(), Error<E>> {
        let attempts = self.options.send_attempts.max(1);

        let r = retry(Fixed::from_millis(0).take(attempts as usize - 1), || {
            trace!(target: self.name.as_str(), "tx {:02x?}", raw);
            if let Err(e) = self.transport.send(raw) {
                return OperationResult::Err(Error::Transport(e));
            }

            match self.receive_frame() {
                Ok(Frame::Ack) => OperationResult::Ok(()),
                Ok(Frame::Nak) => {
                    warn!(target: self.name.as_str(), "Received nak");
                    OperationResult::Retry(Error::Nak)
                }
                Ok(Frame::AckAbort) => OperationResult::Err(Error::AckAbort),
                Ok(f) => OperationResult::Err(ProtocolError::UnexpectedFrame(f.frame_type()).into()),
                Err(e) => OperationResult::Err(e),
            }
        });

        match r.map_err(from_retry) {
            Err(Error::AckAbort) => Err(self.aborted()),
            r => r,
        }
    }

    fn aborted(&mut self) -> Error<E> {
        error!(target: self.name.as_str(), "Received ack abort");
        self.state = State::Aborted;
        Error::AckAbort
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<(), Error<E>> {
        let raw = frame.encode()?;
        trace!(target: self.name.as_str(), "tx {:02x?}", raw);
        self.transport.send(&raw).map_err(Error::Transport)
    }

    fn receive_frame(&mut self) -> Result<Frame, Error<E>> {
        let deadline = Instant::now() + self.options.timeout();
        self.receive_frame_until(deadline)
    }

    fn receive_frame_until(&mut self, deadline: Instant) -> Result<Frame, Error<E>> {
        loop {
            // Discard anything preceding a start byte
            let skip = self
                .rx
                .iter()
                .position(|b| *b == START_BYTE)
                .unwrap_or_else(|| self.rx.len());
            if skip > 0 {
                warn!(
                    target: self.name.as_str(),
                    "Discarding {} bytes before start byte", skip
                );
                self.rx.drain(..skip);
            }

            let len = match frame_length(&self.rx) {
                Ok(l) => l,
                Err(e) => {
                    let n = CONTROL_FRAME_LEN.min(self.rx.len());
                    self.rx.drain(..n);
                    return Err(e.into());
                }
            };

            if let Some(n) = len {
                let raw: Vec<u8> = self.rx.drain(..n).collect();
                trace!(target: self.name.as_str(), "rx {:02x?}", raw);

                match Frame::decode(&raw)? {
                    // Only the host should be pinging, someone else is on the link
                    Frame::Ping => {
                        warn!(target: self.name.as_str(), "Ignoring ping from device");
                        continue;
                    }
                    f => return Ok(f),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }

            match self.transport.receive(deadline - now) {
                Ok(d) => self.rx.extend_from_slice(&d),
                Err(nb::Error::WouldBlock) => return Err(Error::Timeout),
                Err(nb::Error::Other(e)) => return Err(Error::Transport(e)),
            }
        }
    }

    fn check_state(&self) -> Result<(), Error<E>> {
        match self.state {
            State::Aborted | State::Closed => Err(ProtocolError::InvalidState(self.state).into()),
            _ => Ok(()),
        }
    }
}

pub(crate) fn from_retry<E: core::fmt::Debug>(e: retry::Error<Error<E>>) -> Error<E> {
    match e {
        retry::Error::Operation { error, .. } => error,
        retry::Error::Internal(m) => Error::Protocol(ProtocolError::Retry(m)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use crate::protocol::Status;

    /// Transport replaying scripted device bursts, one per receive call
    struct Script {
        rx: VecDeque<Vec<u8>>,
        tx: Vec<Vec<u8>>,
    }

    impl Transport for Script {
        type Error = ();

        fn send(&mut self, data: &[u8]) -> Result<(), ()> {
            self.tx.push(data.to_vec());
            Ok(())
        }

        fn receive(&mut self, _timeout: Duration) -> nb::Result<Vec<u8>, ()> {
            self.rx.pop_front().ok_or(nb::Error::WouldBlock)
        }
    }

    fn session(rx: Vec<Vec<u8>>) -> Session<Script> {
        let t = Script {
            rx: rx.into(),
            tx: vec![],
        };
        Session::new(t, Options::default())
    }

    fn enc(f: Frame) -> Vec<u8> {
        f.encode().unwrap()
    }

    fn ping_response() -> Frame {
        Frame::PingResponse(PingResponse {
            version: SUPPORTED_VERSION,
            options: 0,
        })
    }

    fn generic(tag: CommandTag) -> Frame {
        Frame::Command(
            Response::Generic {
                status: Status::SUCCESS,
                tag: tag as u32,
            }
            .encode(),
        )
    }

    #[test]
    fn ping_connects() {
        let mut s = session(vec![enc(ping_response())]);

        assert_eq!(s.state(), State::Idle);
        let p = s.ping().unwrap();
        assert_eq!(p.version, SUPPORTED_VERSION);
        assert_eq!(s.state(), State::Connected);
        assert_eq!(s.ping_response(), Some(&p));

        let t = s.into_inner();
        assert_eq!(t.tx, vec![vec![0x5A, 0xA6]]);
    }

    #[test]
    fn reassembles_split_frames() {
        let raw = enc(ping_response());
        let (a, b) = raw.split_at(3);

        // Leading noise and a stray device ping are skipped
        let mut first = vec![0x00, 0xFF];
        first.extend_from_slice(&enc(Frame::Ping));
        first.extend_from_slice(a);

        let mut s = session(vec![first, b.to_vec()]);
        assert!(s.ping().is_ok());
    }

    #[test]
    fn command_exchange() {
        let mut s = session(vec![
            enc(ping_response()),
            enc(Frame::Ack),
            enc(generic(CommandTag::Reset)),
        ]);
        s.ping().unwrap();

        let r = s.send_command(&Command::reset()).unwrap();
        assert_eq!(r.status(), Status::SUCCESS);

        let t = s.into_inner();
        assert_eq!(t.tx.len(), 3);
        assert_eq!(t.tx[1], enc(Frame::Command(Command::reset().encode())));
        assert_eq!(t.tx[2], enc(Frame::Ack));
    }

    #[test]
    fn nak_resends_identical_frame() {
        let mut s = session(vec![
            enc(Frame::Nak),
            enc(Frame::Ack),
            enc(generic(CommandTag::Reset)),
        ]);

        assert!(s.send_command(&Command::reset()).is_ok());

        let t = s.into_inner();
        assert_eq!(t.tx[0], t.tx[1]);
    }

    #[test]
    fn repeated_nak_fails() {
        let mut s = session(vec![enc(Frame::Nak), enc(Frame::Nak)]);
        assert_eq!(s.send_command(&Command::reset()), Err(Error::Nak));

        let mut s = session(vec![enc(Frame::Nak), enc(Frame::Nak)]);
        assert_eq!(s.send_data(&[1, 2, 3]), Err(Error::Transfer));
        assert_eq!(s.into_inner().tx.len(), 2);
    }

    #[test]
    fn abort_stops_session() {
        let mut s = session(vec![enc(Frame::AckAbort)]);

        assert_eq!(s.send_data(&[1, 2, 3]), Err(Error::AckAbort));
        assert_eq!(s.state(), State::Aborted);

        assert_eq!(
            s.send_data(&[4, 5, 6]),
            Err(Error::Protocol(ProtocolError::InvalidState(State::Aborted)))
        );
        assert_eq!(s.into_inner().tx.len(), 1);
    }

    #[test]
    fn command_timeout_is_not_retried() {
        let mut s = session(vec![]);
        assert_eq!(s.send_command(&Command::reset()), Err(Error::Timeout));
        assert_eq!(s.into_inner().tx.len(), 1);
    }

    #[test]
    fn corrupt_response_is_checksum_error() {
        let mut bad = enc(generic(CommandTag::Reset));
        let n = bad.len();
        bad[n - 1] ^= 0x01;

        let mut s = session(vec![enc(Frame::Ack), bad]);
        assert!(matches!(
            s.send_command(&Command::reset()),
            Err(Error::Checksum { .. })
        ));
    }

    #[test]
    fn receive_data_overrun() {
        let mut s = session(vec![
            enc(Frame::Data(vec![0; 4])),
            enc(Frame::Data(vec![0; 4])),
        ]);

        assert_eq!(
            s.receive_data(6, |_| ()),
            Err(Error::Protocol(ProtocolError::Overrun {
                expected: 6,
                received: 8
            }))
        );
    }

    #[test]
    fn receive_data_early_response() {
        let mut s = session(vec![
            enc(Frame::Data(vec![0; 4])),
            enc(generic(CommandTag::ReadMemory)),
        ]);

        assert_eq!(
            s.receive_data(8, |_| ()),
            Err(Error::Protocol(ProtocolError::UnexpectedFrame(
                crate::protocol::FrameType::Command
            )))
        );
    }

    #[test]
    fn receive_data_abort() {
        let mut s = session(vec![enc(Frame::Data(vec![0; 4])), enc(Frame::AckAbort)]);

        assert_eq!(s.receive_data(8, |_| ()), Err(Error::AckAbort));
        assert_eq!(s.state(), State::Aborted);
        assert_eq!(s.into_inner().tx, vec![enc(Frame::Ack)]);
    }

    #[test]
    fn receive_response_abort() {
        let mut s = session(vec![enc(Frame::AckAbort)]);

        assert_eq!(s.receive_response(CommandTag::WriteMemory), Err(Error::AckAbort));
        assert_eq!(s.state(), State::Aborted);
        assert!(s.into_inner().tx.is_empty());
    }

    #[test]
    fn reopen_after_abort() {
        let mut s = session(vec![enc(Frame::AckAbort), enc(ping_response())]);

        assert_eq!(s.send_data(&[1]), Err(Error::AckAbort));
        s.reopen();
        assert_eq!(s.state(), State::Idle);
        assert!(s.ping().is_ok());

        // Closed sessions stay closed
        s.close();
        s.reopen();
        assert_eq!(s.state(), State::Closed);
    }

    #[test]
    fn receive_data_acks_each_frame() {
        let mut s = session(vec![
            enc(Frame::Data(vec![1, 2])),
            enc(Frame::Data(vec![3, 4])),
        ]);

        let mut seen = vec![];
        let d = s.receive_data(4, |p| seen.push(p.bytes_complete)).unwrap();
        assert_eq!(d, vec![1, 2, 3, 4]);
        assert_eq!(seen, vec![2, 4]);
        assert_eq!(s.into_inner().tx, vec![enc(Frame::Ack), enc(Frame::Ack)]);
    }
}
