//! Framing and checksum primitives shared by the serial protocols.
//!
//! Two frame families live here:
//!
//! - **MK frames** carried on the VE.Bus interface:
//!   `<Length> 0xFF <Command> <Data 0> .. <Data n-1> <Checksum>`, where
//!   `Length` counts the bytes between itself (exclusive) and the checksum
//!   (exclusive) and `Checksum = (256 - sum) mod 256` over everything before
//!   it. If the MSB of `Length` is set the device appended LED status bytes.
//! - **HDLC frames** from the DLMS smart meter, delimited by `0x7E` flags and
//!   protected by the X.25 CRC-16 (reflected polynomial 0x1021, init 0xFFFF,
//!   final complement, transmitted LSB first).
//!
//! The VE.Direct text protocol closes each record with a `Checksum` field
//! chosen so the byte-wise running sum of the whole record is 0 mod 256;
//! [`running_sum`] computes that sum.

use crate::Error;

/// Wake frame for a sleeping Multiplus. Not an MK frame; sent verbatim.
pub const WAKE_FRAME: [u8; 7] = [0x05, 0x3F, 0x07, 0x00, 0x00, 0x00, 0xC2];

/// Sleep command. Standby consumption is roughly 1.3 W on the DC side.
pub const SLEEP_FRAME: [u8; 7] = [0x05, 0x3F, 0x04, 0x00, 0x00, 0x00, 0xC5];

/// Frame marker byte of regular MK frames (second byte, after the length).
pub const MK_MARKER: u8 = 0xFF;

/// Computes the MK frame checksum `(256 - sum(data)) mod 256`.
pub fn frame_checksum(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// Builds a complete MK frame for `cmd` with the given payload.
pub fn build_frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(payload.len() as u8 + 2);
    frame.push(MK_MARKER);
    frame.push(cmd);
    frame.extend_from_slice(payload);
    frame.push(frame_checksum(&frame));
    frame
}

/// Parses a complete MK frame, returning the command byte and the payload.
///
/// A declared length that exceeds the buffer is reported as a protocol error;
/// the caller resynchronizes by discarding the leading byte and retrying.
pub fn parse_frame(buf: &[u8]) -> Result<(u8, &[u8]), Error> {
    if buf.len() < 4 {
        return Err(Error::protocol(format!("frame too short: {} bytes", buf.len())));
    }
    let length = (buf[0] & 0x7F) as usize;
    if length < 2 || buf.len() < length + 2 {
        return Err(Error::protocol(format!(
            "declared length {} exceeds buffer of {} bytes",
            length,
            buf.len()
        )));
    }
    if buf[1] != MK_MARKER {
        return Err(Error::protocol(format!("missing frame marker: {:#04x}", buf[1])));
    }
    let crc = buf[length + 1];
    let expected = frame_checksum(&buf[..length + 1]);
    if crc != expected {
        return Err(Error::protocol(format!(
            "frame checksum mismatch: got {crc:#04x}, expected {expected:#04x}"
        )));
    }
    Ok((buf[2], &buf[3..length + 1]))
}

/// Whether the sender appended LED status bytes to this frame.
pub fn has_led_status(buf: &[u8]) -> bool {
    !buf.is_empty() && buf[0] & 0x80 != 0
}

/// Receive-side state machine for framed serial replies.
///
/// Fed one byte at a time; yields a frame once its checksum byte arrived.
/// The marker is `0xFF` for regular MK frames and `0x20` for the AC info
/// reply, whose leading byte is the length in both cases. A checksum mismatch
/// is reported on the returned frame but the frame is still surfaced, which
/// matches the device behavior observed on the wire.
#[derive(Debug)]
pub struct FrameReceiver {
    marker: u8,
    state: RxState,
    length: u8,
    frame: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    WaitLength,
    InLength,
    InBody,
    InChecksum,
}

/// A frame assembled by [`FrameReceiver`], starting at the length byte and
/// including the trailing checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub bytes: Vec<u8>,
    pub crc_ok: bool,
}

impl FrameReceiver {
    pub fn new(marker: u8) -> Self {
        Self {
            marker,
            state: RxState::WaitLength,
            length: 0,
            frame: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = RxState::WaitLength;
        self.frame.clear();
    }

    /// Advances the state machine by one byte, returning a frame when its
    /// checksum byte has been consumed.
    pub fn feed(&mut self, byte: u8) -> Option<ReceivedFrame> {
        match self.state {
            RxState::WaitLength => {
                self.length = byte;
                self.state = RxState::InLength;
                None
            }
            RxState::InLength => {
                if byte == self.marker {
                    self.frame.clear();
                    self.frame.push(self.length);
                    self.frame.push(byte);
                    // the marker itself counts towards the declared length
                    self.state = if (self.length & 0x7F) <= 1 {
                        RxState::InChecksum
                    } else {
                        RxState::InBody
                    };
                } else {
                    // any byte may turn out to be the length preceding the marker
                    self.length = byte;
                }
                None
            }
            RxState::InBody => {
                self.frame.push(byte);
                if self.frame.len() == (self.length & 0x7F) as usize + 1 {
                    self.state = RxState::InChecksum;
                }
                None
            }
            RxState::InChecksum => {
                let crc_ok = frame_checksum(&self.frame) == byte;
                self.frame.push(byte);
                let bytes = std::mem::take(&mut self.frame);
                self.state = RxState::WaitLength;
                Some(ReceivedFrame { bytes, crc_ok })
            }
        }
    }
}

/// Computes the HDLC CRC-16 used by the smart-meter frames.
///
/// X.25 parameterization: reflected polynomial 0x1021, initial value 0xFFFF,
/// final complement. The meter transmits the result LSB first, so a frame
/// verifies when this value equals the little-endian read of the two bytes
/// preceding the closing flag.
pub fn hdlc_crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::X_25>::calculate(data)
}

/// Byte-wise running sum of a VE.Direct record.
///
/// A record is intact when the sum over all of its bytes, including the
/// checksum byte itself, is 0 mod 256.
pub fn running_sum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Renders bytes as spaced uppercase hex for trace output.
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
