//! Protocol constants and lookup tables.
//!
//! Values from the Kinetis Bootloader v2.0.0 Reference Manual, chapters 4
//! (framing) and 13 (status codes).

use core::fmt;

/// Leading byte of every frame
pub const START_BYTE: u8 = 0x5A;

/// Maximum number of 32-bit parameters carried by one command packet
pub const MAX_PARAMETERS: usize = 7;

/// Default data chunk size, the minimum packet size every bootloader supports
pub const DEFAULT_CHUNK: usize = 32;

/// Protocol version this host implementation was written against
pub const SUPPORTED_VERSION: Version = Version {
    name: b'P',
    major: 1,
    minor: 2,
    bugfix: 0,
};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum FrameType {
    /// The previous packet was received successfully
    Ack = 0xA1,
    /// The previous packet was corrupted and must be re-sent
    Nak = 0xA2,
    /// The data phase is being aborted
    AckAbort = 0xA3,
    Command = 0xA4,
    Data = 0xA5,
    Ping = 0xA6,
    PingResponse = 0xA7,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0xA1 => Some(Self::Ack),
            0xA2 => Some(Self::Nak),
            0xA3 => Some(Self::AckAbort),
            0xA4 => Some(Self::Command),
            0xA5 => Some(Self::Data),
            0xA6 => Some(Self::Ping),
            0xA7 => Some(Self::PingResponse),
            _ => None,
        }
    }

    /// Control frames are the bare start byte + type pair
    pub fn is_control(self) -> bool {
        matches!(self, Self::Ack | Self::Nak | Self::AckAbort | Self::Ping)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CommandTag {
    FlashEraseAll = 0x01,
    FlashEraseRegion = 0x02,
    /// Reads memory, data is returned in a data phase
    ReadMemory = 0x03,
    /// Writes memory, data is supplied in a data phase
    WriteMemory = 0x04,
    FillMemory = 0x05,
    FlashSecurityDisable = 0x06,
    GetProperty = 0x07,
    ReceiveSbFile = 0x08,
    Execute = 0x09,
    Call = 0x0A,
    /// Resets the chip, the bootloader usually drops the link immediately
    Reset = 0x0B,
    SetProperty = 0x0C,
    FlashEraseAllUnsecure = 0x0D,
    FlashProgramOnce = 0x0E,
    FlashReadOnce = 0x0F,
    FlashReadResource = 0x10,
    ConfigureQuadSpi = 0x11,
    ReliableUpdate = 0x12,
}

impl CommandTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        use CommandTag::*;

        let tag = match v {
            0x01 => FlashEraseAll,
            0x02 => FlashEraseRegion,
            0x03 => ReadMemory,
            0x04 => WriteMemory,
            0x05 => FillMemory,
            0x06 => FlashSecurityDisable,
            0x07 => GetProperty,
            0x08 => ReceiveSbFile,
            0x09 => Execute,
            0x0A => Call,
            0x0B => Reset,
            0x0C => SetProperty,
            0x0D => FlashEraseAllUnsecure,
            0x0E => FlashProgramOnce,
            0x0F => FlashReadOnce,
            0x10 => FlashReadResource,
            0x11 => ConfigureQuadSpi,
            0x12 => ReliableUpdate,
            _ => return None,
        };

        Some(tag)
    }
}

/// Tags carried in the header of device responses
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ResponseTag {
    GenericResponse = 0xA0,
    ReadMemoryResponse = 0xA3,
    GetPropertyResponse = 0xA7,
    FlashReadOnceResponse = 0xAF,
    FlashReadResourceResponse = 0xB0,
}

impl ResponseTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0xA0 => Some(Self::GenericResponse),
            0xA3 => Some(Self::ReadMemoryResponse),
            0xA7 => Some(Self::GetPropertyResponse),
            0xAF => Some(Self::FlashReadOnceResponse),
            0xB0 => Some(Self::FlashReadResourceResponse),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum PropertyTag {
    BootloaderVersion = 0x01,
    AvailablePeripherals = 0x02,
    FlashStartAddress = 0x03,
    FlashSizeInBytes = 0x04,
    FlashSectorSize = 0x05,
    FlashBlockCount = 0x06,
    /// Bitmask of supported commands, bit n is command tag n + 1
    AvailableCommands = 0x07,
    CrcCheckStatus = 0x08,
    VerifyWrites = 0x0A,
    /// Maximum supported packet payload size in bytes
    MaxPacketSize = 0x0B,
    ReservedRegions = 0x0C,
    RamStartAddress = 0x0E,
    RamSizeInBytes = 0x0F,
    SystemDeviceId = 0x10,
    FlashSecurityState = 0x11,
    UniqueDeviceId = 0x12,
    FacSupport = 0x13,
    FlashAccessSegmentSize = 0x14,
    FlashAccessSegmentCount = 0x15,
    FlashReadMargin = 0x16,
    QspiInitStatus = 0x17,
    TargetVersion = 0x18,
    ExternalMemoryAttributes = 0x19,
    ReliableUpdateStatus = 0x1A,
}

impl PropertyTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        use PropertyTag::*;

        let tag = match v {
            0x01 => BootloaderVersion,
            0x02 => AvailablePeripherals,
            0x03 => FlashStartAddress,
            0x04 => FlashSizeInBytes,
            0x05 => FlashSectorSize,
            0x06 => FlashBlockCount,
            0x07 => AvailableCommands,
            0x08 => CrcCheckStatus,
            0x0A => VerifyWrites,
            0x0B => MaxPacketSize,
            0x0C => ReservedRegions,
            0x0E => RamStartAddress,
            0x0F => RamSizeInBytes,
            0x10 => SystemDeviceId,
            0x11 => FlashSecurityState,
            0x12 => UniqueDeviceId,
            0x13 => FacSupport,
            0x14 => FlashAccessSegmentSize,
            0x15 => FlashAccessSegmentCount,
            0x16 => FlashReadMargin,
            0x17 => QspiInitStatus,
            0x18 => TargetVersion,
            0x19 => ExternalMemoryAttributes,
            0x1A => ReliableUpdateStatus,
            _ => return None,
        };

        Some(tag)
    }
}

impl core::str::FromStr for PropertyTag {
    type Err = String;

    /// Parse a property from its name (case insensitive) or tag value
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use PropertyTag::*;

        let v = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u8::from_str_radix(hex, 16).ok()
        } else {
            s.parse::<u8>().ok()
        };
        if let Some(tag) = v.and_then(Self::from_u8) {
            return Ok(tag);
        }

        let tag = match s.to_ascii_lowercase().replace(&['-', '_'][..], "").as_str() {
            "bootloaderversion" | "version" => BootloaderVersion,
            "availableperipherals" => AvailablePeripherals,
            "flashstartaddress" => FlashStartAddress,
            "flashsizeinbytes" | "flashsize" => FlashSizeInBytes,
            "flashsectorsize" => FlashSectorSize,
            "flashblockcount" => FlashBlockCount,
            "availablecommands" => AvailableCommands,
            "crccheckstatus" => CrcCheckStatus,
            "verifywrites" => VerifyWrites,
            "maxpacketsize" => MaxPacketSize,
            "reservedregions" => ReservedRegions,
            "ramstartaddress" => RamStartAddress,
            "ramsizeinbytes" | "ramsize" => RamSizeInBytes,
            "systemdeviceid" => SystemDeviceId,
            "flashsecuritystate" => FlashSecurityState,
            "uniquedeviceid" => UniqueDeviceId,
            "facsupport" => FacSupport,
            "flashaccesssegmentsize" => FlashAccessSegmentSize,
            "flashaccesssegmentcount" => FlashAccessSegmentCount,
            "flashreadmargin" => FlashReadMargin,
            "qspiinitstatus" => QspiInitStatus,
            "targetversion" => TargetVersion,
            "externalmemoryattributes" => ExternalMemoryAttributes,
            "reliableupdatestatus" => ReliableUpdateStatus,
            _ => return Err(format!("unknown property '{}'", s)),
        };

        Ok(tag)
    }
}

/// Known bootloader status codes
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum StatusCode {
    Success = 0,
    Fail = 1,
    ReadOnly = 2,
    OutOfRange = 3,
    InvalidArgument = 4,
    Timeout = 5,
    NoTransferInProgress = 6,

    FlashSizeError = 100,
    FlashAlignmentError = 101,
    FlashAddressError = 102,
    FlashAccessError = 103,
    FlashProtectionViolation = 104,
    FlashCommandFailure = 105,
    FlashUnknownProperty = 106,
    FlashEraseKeyError = 107,
    FlashRegionExecuteOnly = 108,
    FlashExecuteInRamFunctionNotReady = 109,

    MemoryRangeInvalid = 10200,
    MemoryReadFailed = 10201,
    MemoryWriteFailed = 10202,
    MemoryCumulativeWrite = 10203,
    MemoryAppOverlapWithExecuteOnlyRegion = 10204,

    UnknownProperty = 10300,
    ReadOnlyProperty = 10301,
    InvalidPropertyValue = 10302,

    AppCrcCheckPassed = 10400,
    AppCrcCheckFailed = 10401,
    AppCrcCheckInactive = 10402,
    AppCrcCheckInvalid = 10403,
    AppCrcCheckOutOfRange = 10404,

    ReliableUpdateSuccess = 10600,
    ReliableUpdateFail = 10601,
    ReliableUpdateInactive = 10602,
    ReliableUpdateBackupApplicationInvalid = 10603,
    ReliableUpdateStillInMainApplication = 10604,
    ReliableUpdateSwapSystemNotReady = 10605,
    ReliableUpdateBackupBootloaderNotReady = 10606,
    ReliableUpdateSwapIndicatorAddressInvalid = 10607,
}

/// Status lookup table, kept sorted by code
const STATUS_TABLE: &[StatusCode] = {
    use StatusCode::*;
    &[
        Success,
        Fail,
        ReadOnly,
        OutOfRange,
        InvalidArgument,
        Timeout,
        NoTransferInProgress,
        FlashSizeError,
        FlashAlignmentError,
        FlashAddressError,
        FlashAccessError,
        FlashProtectionViolation,
        FlashCommandFailure,
        FlashUnknownProperty,
        FlashEraseKeyError,
        FlashRegionExecuteOnly,
        FlashExecuteInRamFunctionNotReady,
        MemoryRangeInvalid,
        MemoryReadFailed,
        MemoryWriteFailed,
        MemoryCumulativeWrite,
        MemoryAppOverlapWithExecuteOnlyRegion,
        UnknownProperty,
        ReadOnlyProperty,
        InvalidPropertyValue,
        AppCrcCheckPassed,
        AppCrcCheckFailed,
        AppCrcCheckInactive,
        AppCrcCheckInvalid,
        AppCrcCheckOutOfRange,
        ReliableUpdateSuccess,
        ReliableUpdateFail,
        ReliableUpdateInactive,
        ReliableUpdateBackupApplicationInvalid,
        ReliableUpdateStillInMainApplication,
        ReliableUpdateSwapSystemNotReady,
        ReliableUpdateBackupBootloaderNotReady,
        ReliableUpdateSwapIndicatorAddressInvalid,
    ]
};

impl StatusCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        STATUS_TABLE
            .binary_search_by_key(&code, |s| *s as u32)
            .ok()
            .map(|i| STATUS_TABLE[i])
    }
}

/// Raw status word returned by the bootloader
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0);

    pub fn is_success(&self) -> bool {
        self.0 == StatusCode::Success as u32
    }

    /// Look up the status in the known status table
    pub fn code(&self) -> Option<StatusCode> {
        StatusCode::from_u32(self.0)
    }
}

impl From<StatusCode> for Status {
    fn from(c: StatusCode) -> Self {
        Status(c as u32)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(c) => write!(f, "{:?} ({})", c, self.0),
            None => write!(f, "unknown status ({})", self.0),
        }
    }
}

/// Bootloader protocol version, as reported in the ping response
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Version {
    pub name: u8,
    pub major: u8,
    pub minor: u8,
    pub bugfix: u8,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}.{}.{}",
            self.name as char, self.major, self.minor, self.bugfix
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_table_is_sorted() {
        for w in STATUS_TABLE.windows(2) {
            assert!((w[0] as u32) < (w[1] as u32), "{:?} >= {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn status_lookup() {
        assert_eq!(StatusCode::from_u32(0), Some(StatusCode::Success));
        assert_eq!(
            StatusCode::from_u32(10203),
            Some(StatusCode::MemoryCumulativeWrite)
        );
        assert_eq!(StatusCode::from_u32(7), None);

        assert!(Status(0).is_success());
        assert!(!Status(105).is_success());
        assert_eq!(Status(105).to_string(), "FlashCommandFailure (105)");
        assert_eq!(Status(12345).to_string(), "unknown status (12345)");
    }

    #[test]
    fn frame_types() {
        for t in 0xA1..=0xA7 {
            let ft = FrameType::from_u8(t).unwrap();
            assert_eq!(ft as u8, t);
        }
        assert_eq!(FrameType::from_u8(0xA8), None);
        assert!(FrameType::Ping.is_control());
        assert!(!FrameType::PingResponse.is_control());
    }

    #[test]
    fn parse_property() {
        assert_eq!("0x0b".parse(), Ok(PropertyTag::MaxPacketSize));
        assert_eq!("1".parse(), Ok(PropertyTag::BootloaderVersion));
        assert_eq!("max-packet-size".parse(), Ok(PropertyTag::MaxPacketSize));
        assert_eq!("FlashSizeInBytes".parse(), Ok(PropertyTag::FlashSizeInBytes));
        assert!("0x09".parse::<PropertyTag>().is_err());
        assert!("nonsense".parse::<PropertyTag>().is_err());
    }

    #[test]
    fn version_display() {
        assert_eq!(SUPPORTED_VERSION.to_string(), "P1.2.0");
    }
}
