//! The transport boundary towards the RF reader.


use std::fmt;
use std::time::Duration;

use tracing::debug;

use crate::iso7816::apdu::{self, Apdu, Response};


/// Settle time after dropping and re-powering the RF field.
const FIELD_SETTLE_DELAY: Duration = Duration::from_millis(50);


#[derive(Debug)]
pub enum TransportError {
    Write(apdu::WriteError),
    Pcsc(pcsc::Error),
    ShortResponse,
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write(e) => write!(f, "APDU write error: {}", e),
            Self::Pcsc(e) => write!(f, "PCSC error: {}", e),
            Self::ShortResponse => write!(f, "response too short"),
        }
    }
}
impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Write(e) => Some(e),
            Self::Pcsc(e) => Some(e),
            Self::ShortResponse => None,
        }
    }
}
impl From<apdu::WriteError> for TransportError {
    fn from(value: apdu::WriteError) -> Self { Self::Write(value) }
}
impl From<pcsc::Error> for TransportError {
    fn from(value: pcsc::Error) -> Self { Self::Pcsc(value) }
}


/// A contactless card reachable over ISO 14443-A.
///
/// Both exchange primitives block until the card answers or the reader gives
/// up; they are the only suspension points of the protocol core. When
/// `activate_field` is set the implementation drops and re-powers the RF
/// field before transmitting, so the card reverts to its idle state.
pub trait SmartCard {
    /// Exchange an ISO 7816 APDU; the trailer carries the raw status word.
    fn exchange_apdu(&mut self, request: &Apdu, activate_field: bool) -> Result<Response, TransportError>;

    /// Exchange a native frame. The reply starts with the status byte,
    /// followed by response data; link-layer CRC is already stripped.
    fn exchange_raw(&mut self, data: &[u8], activate_field: bool) -> Result<Vec<u8>, TransportError>;
}

impl SmartCard for pcsc::Card {
    fn exchange_apdu(&mut self, request: &Apdu, activate_field: bool) -> Result<Response, TransportError> {
        if activate_field {
            self.reconnect(pcsc::ShareMode::Shared, pcsc::Protocols::ANY, pcsc::Disposition::ResetCard)?;
            std::thread::sleep(FIELD_SETTLE_DELAY);
        }

        let mut out_buf = Vec::new();
        request.write_bytes(&mut out_buf)?;
        debug!("apdu >> {}", crate::hex_str(&out_buf));

        let mut in_buf = [0u8; pcsc::MAX_BUFFER_SIZE];
        let in_slice = self.transmit(&out_buf, &mut in_buf)?;
        debug!("apdu << {}", crate::hex_str(in_slice));

        Response::from_slice(in_slice)
            .ok_or(TransportError::ShortResponse)
    }

    fn exchange_raw(&mut self, data: &[u8], activate_field: bool) -> Result<Vec<u8>, TransportError> {
        if activate_field {
            self.reconnect(pcsc::ShareMode::Shared, pcsc::Protocols::ANY, pcsc::Disposition::ResetCard)?;
            std::thread::sleep(FIELD_SETTLE_DELAY);
        }

        debug!("raw >> {}", crate::hex_str(data));
        let mut in_buf = [0u8; pcsc::MAX_BUFFER_SIZE];
        let in_slice = self.transmit(data, &mut in_buf)?;
        debug!("raw << {}", crate::hex_str(in_slice));

        if in_slice.is_empty() {
            return Err(TransportError::ShortResponse);
        }
        Ok(in_slice.to_vec())
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::{SmartCard, TransportError};
    use crate::iso7816::apdu::{Apdu, Response};

    /// One scripted request/response pair. A `None` expectation accepts any
    /// request.
    pub struct Exchange {
        pub expect: Option<Vec<u8>>,
        pub reply: Vec<u8>,
    }

    /// A card that replays a fixed script, asserting on what the core sends.
    pub struct ScriptedCard {
        script: VecDeque<Exchange>,
    }
    impl ScriptedCard {
        pub fn new(script: Vec<Exchange>) -> Self {
            Self {
                script: script.into(),
            }
        }

        /// Script entry for a native exchange: request `ins || payload`,
        /// reply `status || payload`.
        pub fn native(expect: impl Into<Vec<u8>>, status: u8, reply: impl Into<Vec<u8>>) -> Exchange {
            let mut full_reply = vec![status];
            full_reply.extend(reply.into());
            Exchange {
                expect: Some(expect.into()),
                reply: full_reply,
            }
        }

        /// Script entry for an ISO exchange: request is the serialised APDU,
        /// reply is response data followed by `SW1 SW2`.
        pub fn iso(expect: impl Into<Vec<u8>>, reply: impl Into<Vec<u8>>, sw: u16) -> Exchange {
            let mut full_reply = reply.into();
            full_reply.extend_from_slice(&sw.to_be_bytes());
            Exchange {
                expect: Some(expect.into()),
                reply: full_reply,
            }
        }

        /// Script entry accepting any request.
        pub fn any(status: u8, reply: impl Into<Vec<u8>>) -> Exchange {
            let mut full_reply = vec![status];
            full_reply.extend(reply.into());
            Exchange {
                expect: None,
                reply: full_reply,
            }
        }

        fn next(&mut self, request: &[u8]) -> Vec<u8> {
            let entry = self.script.pop_front()
                .unwrap_or_else(|| panic!("unexpected exchange: {}", crate::hex_str(request)));
            if let Some(expected) = &entry.expect {
                assert_eq!(
                    request, expected.as_slice(),
                    "request mismatch: got {}, expected {}",
                    crate::hex_str(request), crate::hex_str(expected),
                );
            }
            entry.reply
        }
    }
    impl SmartCard for ScriptedCard {
        fn exchange_apdu(&mut self, request: &Apdu, _activate_field: bool) -> Result<Response, TransportError> {
            let out = request.to_bytes()?;
            let reply = self.next(&out);
            // scripted APDU replies carry data followed by SW1 SW2
            Response::from_slice(&reply).ok_or(TransportError::ShortResponse)
        }

        fn exchange_raw(&mut self, data: &[u8], _activate_field: bool) -> Result<Vec<u8>, TransportError> {
            Ok(self.next(data))
        }
    }
}
