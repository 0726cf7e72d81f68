//! Structures related to application protocol data units (APDUs).
//!
//! DESFire frames fit in short APDUs, so only the short cases of
//! ISO/IEC 7816-3 § 12.1.3 are modelled.


use std::fmt;
use std::io::{self, Write};


#[derive(Debug)]
pub enum WriteError {
    Io(io::Error),
    EmptyData,
    DataTooLong { maximum: usize, obtained: usize },
}
impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::EmptyData => write!(f, "data is, but must not be, empty"),
            Self::DataTooLong { maximum, obtained } => write!(f, "too much data: obtained {} bytes, expected maximum {} bytes", obtained, maximum),
        }
    }
}
impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::EmptyData => None,
            Self::DataTooLong { .. } => None,
        }
    }
}
impl From<io::Error> for WriteError {
    fn from(value: io::Error) -> Self { Self::Io(value) }
}


#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}
impl CommandHeader {
    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes)?;
        Ok(())
    }
}
impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandHeader {} cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X} {}",
            '{', self.cla, self.ins, self.p1, self.p2, '}',
        )
    }
}

#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResponseTrailer {
    pub sw1: u8,
    pub sw2: u8,
}
impl ResponseTrailer {
    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self {
            sw1,
            sw2,
        }
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }
}
impl fmt::Debug for ResponseTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseTrailer {} sw1: 0x{:02X}, sw2: 0x{:02X} {}", '{', self.sw1, self.sw2, '}')
    }
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Data {
    NoData,
    RequestData {
        request_data: Vec<u8>,
    },
    ResponseData {
        response_data_length: u8,
    },
    BothData {
        request_data: Vec<u8>,
        response_data_length: u8,
    },
}
impl Data {
    pub fn request_data(&self) -> Option<&[u8]> {
        match self {
            Self::NoData => None,
            Self::RequestData { request_data } => Some(request_data.as_slice()),
            Self::ResponseData { .. } => None,
            Self::BothData { request_data, .. } => Some(request_data.as_slice()),
        }
    }

    pub fn response_data_length(&self) -> Option<usize> {
        match self {
            Self::NoData => None,
            Self::RequestData { .. } => None,
            Self::ResponseData { response_data_length } => Some(usize::from(*response_data_length)),
            Self::BothData { response_data_length, .. } => Some(usize::from(*response_data_length)),
        }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        fn ensure_sendable(request_data: &Vec<u8>) -> Result<u8, WriteError> {
            if request_data.len() == 0 {
                return Err(WriteError::EmptyData);
            }
            if request_data.len() > 256 {
                return Err(WriteError::DataTooLong { maximum: 256, obtained: request_data.len() });
            }
            // Lc of 0x00 encodes 256 bytes
            let length_byte = if request_data.len() == 256 {
                0x00
            } else {
                request_data.len().try_into().unwrap()
            };
            Ok(length_byte)
        }

        match self {
            // "case" refers to the cases in ISO/IEC 7816-3:2006 § 12.1.3
            Data::NoData => {
                // case 1
                Ok(())
            },
            Data::RequestData { request_data } => {
                // case 3S: [Lc] [Data]
                let length_byte = ensure_sendable(request_data)?;
                writer.write_all(&[length_byte])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::ResponseData { response_data_length } => {
                // case 2S: [Le]
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::BothData { request_data, response_data_length } => {
                // case 4S: [Lc] [Data] [Le]
                let length_byte = ensure_sendable(request_data)?;
                writer.write_all(&[length_byte])?;
                writer.write_all(request_data)?;
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Apdu {
    pub header: CommandHeader,
    pub data: Data,
}
impl Apdu {
    /// Wrap a native DESFire instruction in an ISO 7816 APDU:
    /// `CLA=0x90 INS=<ins> P1=P2=0 [Lc data] Le=0x00`.
    pub fn wrap_native(ins: u8, data: &[u8]) -> Self {
        let wrapped_data = if data.is_empty() {
            Data::ResponseData { response_data_length: 0x00 }
        } else {
            Data::BothData {
                request_data: data.to_vec(),
                response_data_length: 0x00,
            }
        };
        Self {
            header: CommandHeader {
                cla: super::NATIVE_WRAP_CLA,
                ins,
                p1: 0x00,
                p2: 0x00,
            },
            data: wrapped_data,
        }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        self.header.write_bytes(writer)?;
        self.data.write_bytes(writer)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut buf = Vec::with_capacity(4 + 2 + self.data.request_data().map_or(0, |d| d.len()));
        self.write_bytes(&mut buf)?;
        Ok(buf)
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Response {
    pub data: Vec<u8>,
    pub trailer: ResponseTrailer,
}
impl Response {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }

        let data = bytes[..bytes.len() - 2].to_vec();
        let trailer = ResponseTrailer {
            sw1: bytes[bytes.len() - 2],
            sw2: bytes[bytes.len() - 1],
        };
        Some(Self {
            data,
            trailer,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::{Apdu, Data, Response};

    #[test]
    fn test_wrap_native_with_data() {
        let apdu = Apdu::wrap_native(0x5A, &[0x01, 0x02, 0x03]);
        let bytes = apdu.to_bytes().unwrap();
        assert_eq!(bytes, vec![0x90, 0x5A, 0x00, 0x00, 0x03, 0x01, 0x02, 0x03, 0x00]);
    }

    #[test]
    fn test_wrap_native_no_data() {
        let apdu = Apdu::wrap_native(0x6A, &[]);
        let bytes = apdu.to_bytes().unwrap();
        assert_eq!(bytes, vec![0x90, 0x6A, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_empty_request_data_rejected() {
        let apdu = Apdu {
            header: Default::default(),
            data: Data::RequestData { request_data: Vec::new() },
        };
        assert!(apdu.to_bytes().is_err());
    }

    #[test]
    fn test_response_from_slice() {
        let response = Response::from_slice(&[0x01, 0x02, 0x91, 0xAF]).unwrap();
        assert_eq!(response.data, vec![0x01, 0x02]);
        assert_eq!(response.trailer.to_word(), 0x91AF);

        assert!(Response::from_slice(&[0x91]).is_none());
    }
}
