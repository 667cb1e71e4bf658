//! Simulated KBOOT device for exercising the host over a fake link.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use kboot_loader::protocol::{CommandTag, PropertyTag, Status, SUPPORTED_VERSION};
use kboot_loader::{Frame, PingResponse, Response, Transport};

/// Device behaviour knobs
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Nak this many command or data frames before accepting them
    pub naks: usize,
    /// Ignore this many pings
    pub drop_pings: usize,
    /// Abort when this data chunk (zero indexed) arrives
    pub abort_at_chunk: Option<usize>,
    /// Size of data frames sent while reading
    pub read_chunk: usize,
    /// Byte count reported in read responses, defaults to the request
    pub read_count: Option<u32>,
    /// Final status of a write
    pub write_status: Status,
    /// Respond to reset before restarting
    pub reply_to_reset: bool,
    /// Send the final response once all write data arrived
    pub reply_to_write: bool,
    /// Answer pings only, ignore every command
    pub mute: bool,
    pub properties: BTreeMap<u8, Vec<u32>>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(PropertyTag::BootloaderVersion as u8, vec![0x4B02_0100]);
        properties.insert(PropertyTag::MaxPacketSize as u8, vec![32]);
        properties.insert(PropertyTag::FlashSizeInBytes as u8, vec![0x10_0000]);

        Self {
            naks: 0,
            drop_pings: 0,
            abort_at_chunk: None,
            read_chunk: 32,
            read_count: None,
            write_status: Status::SUCCESS,
            reply_to_reset: true,
            reply_to_write: true,
            mute: false,
            properties,
        }
    }
}

/// Bootloader simulation implementing the device side of the link
pub struct Device {
    pub config: DeviceConfig,

    /// Frames received from the host
    pub received: Vec<Frame>,
    /// Payloads of data frames accepted during writes
    pub chunks: Vec<Vec<u8>>,
    /// Regions erased
    pub erased: Vec<(u32, u32)>,
    /// Host frames arriving after the device aborted, before the next ping
    pub after_abort: usize,
    pub pings: usize,
    pub resets: usize,

    rx: VecDeque<Vec<u8>>,
    outbox: VecDeque<Frame>,
    writing: Option<(u32, usize)>,
    data_index: usize,
    aborted: bool,
}

/// Contents of simulated memory at `address`
pub fn memory_at(address: u32) -> u8 {
    (address as u8) ^ ((address >> 8) as u8)
}

pub fn memory(address: u32, len: usize) -> Vec<u8> {
    (0..len as u32).map(|i| memory_at(address + i)).collect()
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            received: vec![],
            chunks: vec![],
            erased: vec![],
            after_abort: 0,
            pings: 0,
            resets: 0,
            rx: VecDeque::new(),
            outbox: VecDeque::new(),
            writing: None,
            data_index: 0,
            aborted: false,
        }
    }

    /// Data written to the device, in order
    pub fn written(&self) -> Vec<u8> {
        self.chunks.concat()
    }

    fn queue(&mut self, f: Frame) {
        self.rx.push_back(f.encode().unwrap());
    }

    fn generic(&mut self, status: Status, tag: u8) {
        self.queue(Frame::Command(
            Response::Generic {
                status,
                tag: tag as u32,
            }
            .encode(),
        ));
    }

    /// Nak the frame if configured to
    fn nak(&mut self) -> bool {
        if self.config.naks > 0 {
            self.config.naks -= 1;
            self.queue(Frame::Nak);
            true
        } else {
            false
        }
    }

    fn command(&mut self, payload: &[u8]) {
        let tag = payload[0];
        let count = payload[3] as usize;
        let params: Vec<u32> = payload[4..4 + count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        self.queue(Frame::Ack);

        match tag {
            t if t == CommandTag::FlashEraseRegion as u8 => {
                self.erased.push((params[0], params[1]));
                self.generic(Status::SUCCESS, tag);
            }
            t if t == CommandTag::FlashEraseAll as u8 => {
                self.erased.push((0, u32::MAX));
                self.generic(Status::SUCCESS, tag);
            }
            t if t == CommandTag::WriteMemory as u8 => {
                self.writing = Some((params[0], params[1] as usize));
                self.data_index = 0;
                self.generic(Status::SUCCESS, tag);
            }
            t if t == CommandTag::ReadMemory as u8 => {
                let (address, len) = (params[0], params[1]);
                let reported = self.config.read_count.unwrap_or(len);

                self.queue(Frame::Command(
                    Response::ReadMemory {
                        status: Status::SUCCESS,
                        data_byte_count: reported,
                    }
                    .encode(),
                ));

                // Data frames follow once the response is acknowledged
                let data = memory(address, reported as usize);
                for c in data.chunks(self.config.read_chunk) {
                    self.outbox.push_back(Frame::Data(c.to_vec()));
                }
                self.outbox.push_back(Frame::Command(
                    Response::Generic {
                        status: Status::SUCCESS,
                        tag: tag as u32,
                    }
                    .encode(),
                ));
            }
            t if t == CommandTag::GetProperty as u8 => {
                let r = match self.config.properties.get(&(params[0] as u8)) {
                    Some(v) => Response::GetProperty {
                        status: Status::SUCCESS,
                        values: v.clone(),
                    },
                    None => Response::GetProperty {
                        status: Status(10300),
                        values: vec![],
                    },
                };
                self.queue(Frame::Command(r.encode()));
            }
            t if t == CommandTag::Reset as u8 => {
                self.resets += 1;
                if self.config.reply_to_reset {
                    self.generic(Status::SUCCESS, tag);
                }
            }
            _ => self.generic(Status(10000), tag),
        }
    }

    fn data(&mut self, d: Vec<u8>) {
        let index = self.data_index;
        self.data_index += 1;

        if self.config.abort_at_chunk == Some(index) {
            self.aborted = true;
            self.queue(Frame::AckAbort);
            return;
        }

        if self.nak() {
            return;
        }
        self.queue(Frame::Ack);

        let len = d.len();
        self.chunks.push(d);

        if let Some((address, remaining)) = self.writing.take() {
            let remaining = remaining.saturating_sub(len);
            if remaining == 0 {
                if self.config.reply_to_write {
                    let status = self.config.write_status;
                    self.generic(status, CommandTag::WriteMemory as u8);
                }
            } else {
                self.writing = Some((address, remaining));
            }
        }
    }

    fn handle(&mut self, frame: Frame) {
        // An aborted transfer ends when the host reconnects
        if self.aborted {
            if frame != Frame::Ping {
                self.after_abort += 1;
                return;
            }
            self.aborted = false;
            self.writing = None;
            self.rx.clear();
            self.outbox.clear();
        }

        match frame {
            Frame::Ping => {
                self.pings += 1;
                if self.config.drop_pings > 0 {
                    self.config.drop_pings -= 1;
                    return;
                }
                self.queue(Frame::PingResponse(PingResponse {
                    version: SUPPORTED_VERSION,
                    options: 0,
                }));
            }
            Frame::Ack => {
                if let Some(f) = self.outbox.pop_front() {
                    self.queue(f);
                }
            }
            Frame::Command(_) if self.config.mute => (),
            Frame::Command(p) => {
                if !self.nak() {
                    self.command(&p);
                }
            }
            Frame::Data(d) => self.data(d),
            f => panic!("unexpected frame from host: {:?}", f),
        }
    }
}

impl Transport for Device {
    type Error = ();

    fn send(&mut self, data: &[u8]) -> Result<(), ()> {
        let frame = Frame::decode(data).expect("host sent invalid frame");
        self.received.push(frame.clone());
        self.handle(frame);
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> nb::Result<Vec<u8>, ()> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}
