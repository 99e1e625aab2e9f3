use crate::types::{
    Capabilities, ColorMode, DepthMode, Modality, RawFrame, Resolution, StreamMode, StreamProfile,
};

// -- USB identifiers --
pub const VID: u16 = 0x1D27;
pub const PID: u16 = 0x0600;

// -- Packet geometry --
/// Control report payload size (SET_REPORT / GET_REPORT).
pub const REPORT_SIZE: usize = 63;
/// Interrupt frame report size (header and chunk reports alike).
pub const FRAME_REPORT_SIZE: usize = 1024;
/// Pixel bytes carried per chunk report after the 4-byte chunk prelude.
pub const CHUNK_PAYLOAD: usize = FRAME_REPORT_SIZE - 4;

// -- Command direction prefixes --
pub const PREFIX_HOST_TO_DEVICE: u8 = 0x02;
pub const PREFIX_DEVICE_TO_HOST: u8 = 0x01;

// -- Command bytes (after the 0x02 prefix) --
pub const CMD_SERIAL: &[u8] = &[0xB1, 0x04];
pub const CMD_FIRMWARE: &[u8] = &[0xB1, 0x05];
pub const CMD_CAPABILITIES: &[u8] = &[0xB2, 0x10];
pub const CMD_CAPABILITY_TABLE: &[u8] = &[0xB2, 0x11];
pub const CMD_STREAM_START: &[u8] = &[0xC0, 0x21];
pub const CMD_STREAM_STOP: &[u8] = &[0xC0, 0x22];

// -- Frame report markers (byte [1] after the 0x01 prefix) --
pub const FRAME_HEADER_MAGIC: u8 = 0x5A;
pub const FRAME_CHUNK_MAGIC: u8 = 0x5B;

// -- Modality bits on the wire (capability table and frame headers) --
pub const WIRE_DEPTH: u8 = 0x01;
pub const WIRE_COLOR: u8 = 0x02;

/// Build a 63-byte HID command buffer.
/// Format: [0x02, cmd_bytes..., 0x00 padding...]
pub fn build_command(cmd: &[u8]) -> [u8; REPORT_SIZE] {
    let mut buf = [0u8; REPORT_SIZE];
    buf[0] = PREFIX_HOST_TO_DEVICE;
    let len = cmd.len().min(REPORT_SIZE - 1);
    buf[1..1 + len].copy_from_slice(&cmd[..len]);
    buf
}

/// Build the stream start command for a negotiated profile.
/// Layout after the echo bytes:
/// [depth_mode, color_mode, width u16 LE, height u16 LE, fps]
pub fn build_stream_start_cmd(profile: &StreamProfile) -> [u8; REPORT_SIZE] {
    let mut cmd_bytes = [0u8; 9];
    cmd_bytes[0..2].copy_from_slice(CMD_STREAM_START);
    cmd_bytes[2] = match profile.depth_mode {
        DepthMode::Off => 0,
        DepthMode::Raw16 => 1,
        DepthMode::Registered16 => 2,
    };
    cmd_bytes[3] = match profile.color_mode {
        ColorMode::Off => 0,
        ColorMode::Rgb8 => 1,
        ColorMode::Yuv422 => 2,
    };
    cmd_bytes[4..6].copy_from_slice(&(profile.resolution.width as u16).to_le_bytes());
    cmd_bytes[6..8].copy_from_slice(&(profile.resolution.height as u16).to_le_bytes());
    cmd_bytes[8] = profile.frame_rate as u8;
    build_command(&cmd_bytes)
}

/// Build the stream stop command.
pub fn build_stream_stop_cmd() -> [u8; REPORT_SIZE] {
    build_command(CMD_STREAM_STOP)
}

/// Extract the command echo from a response and return the payload start offset.
/// Response format: [0x01, cmd_echo..., payload...]
pub fn validate_response(response: &[u8], expected_cmd: &[u8]) -> crate::Result<usize> {
    if response.is_empty() || response[0] != PREFIX_DEVICE_TO_HOST {
        return Err(crate::CaptureError::InvalidResponse(
            response.first().copied().unwrap_or(0),
        ));
    }
    let cmd_len = expected_cmd.len();
    if response.len() < 1 + cmd_len {
        return Err(crate::CaptureError::CommandMismatch);
    }
    if &response[1..1 + cmd_len] != expected_cmd {
        return Err(crate::CaptureError::CommandMismatch);
    }
    Ok(1 + cmd_len)
}

/// Extract a null-terminated string from a byte slice.
pub fn extract_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

/// Parse the capabilities bitmap from a response payload (little-endian u32).
pub fn parse_capabilities(payload: &[u8]) -> Capabilities {
    if payload.len() < 4 {
        return Capabilities::empty();
    }
    let bits = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Capabilities::from_bits_truncate(bits)
}

/// Parse the capability table from a response payload.
///
/// Layout: [count, entries...] with 6-byte entries
/// [width u16 LE, height u16 LE, fps, modality_bits].
/// An entry with both modality bits set expands to one mode per modality.
pub fn parse_capability_table(payload: &[u8]) -> Vec<StreamMode> {
    let Some(&count) = payload.first() else {
        return Vec::new();
    };
    let mut modes = Vec::new();
    for i in 0..count as usize {
        let off = 1 + i * 6;
        let Some(entry) = payload.get(off..off + 6) else {
            log::warn!("Capability table truncated at entry {}", i);
            break;
        };
        let resolution = Resolution::new(
            u16::from_le_bytes([entry[0], entry[1]]) as u32,
            u16::from_le_bytes([entry[2], entry[3]]) as u32,
        );
        let frame_rate = entry[4] as u32;
        for (bit, modality) in [(WIRE_DEPTH, Modality::Depth), (WIRE_COLOR, Modality::Color)] {
            if entry[5] & bit != 0 {
                modes.push(StreamMode {
                    resolution,
                    frame_rate,
                    modality,
                });
            }
        }
    }
    modes
}

/// Metadata from a frame header report.
///
/// Header layout:
/// - `[0]`: 0x01 (device-to-host prefix)
/// - `[1]`: 0x5A (frame header magic)
/// - `[2]`: modality bit (0x01 depth, 0x02 color)
/// - `[3]`: reserved
/// - `[4..12]`: uint64 LE capture timestamp (microseconds since stream start)
/// - `[12..16]`: uint32 LE total payload length
/// - `[16..18]`: uint16 LE chunk count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub modality: Modality,
    pub timestamp_us: u64,
    pub payload_len: u32,
    pub chunk_count: u16,
}

/// Parse a frame header report. Returns None for anything that is not a
/// well-formed header (control responses, chunk reports, noise).
pub fn parse_frame_header(data: &[u8]) -> Option<FrameHeader> {
    if data.len() < 18 || data[0] != PREFIX_DEVICE_TO_HOST || data[1] != FRAME_HEADER_MAGIC {
        return None;
    }
    let modality = match data[2] {
        WIRE_DEPTH => Modality::Depth,
        WIRE_COLOR => Modality::Color,
        other => {
            log::warn!("Frame header with unknown modality 0x{:02x}", other);
            return None;
        }
    };
    let timestamp_us = u64::from_le_bytes(data[4..12].try_into().ok()?);
    let payload_len = u32::from_le_bytes(data[12..16].try_into().ok()?);
    let chunk_count = u16::from_le_bytes(data[16..18].try_into().ok()?);
    Some(FrameHeader {
        modality,
        timestamp_us,
        payload_len,
        chunk_count,
    })
}

/// Parse a frame chunk report into (chunk index, pixel bytes).
///
/// Chunk layout: [0x01, 0x5B, index u16 LE, payload...]
pub fn parse_frame_chunk(data: &[u8]) -> Option<(u16, &[u8])> {
    if data.len() < 4 || data[0] != PREFIX_DEVICE_TO_HOST || data[1] != FRAME_CHUNK_MAGIC {
        return None;
    }
    let index = u16::from_le_bytes([data[2], data[3]]);
    Some((index, &data[4..]))
}

/// Reassembles chunked interrupt reports into whole [`RawFrame`]s.
///
/// The sensor interleaves depth and color frames but never interleaves chunks
/// of two frames, so a single in-progress buffer suffices. A header arriving
/// mid-frame or an out-of-sequence chunk abandons the partial frame.
pub struct FrameAssembler {
    header: Option<FrameHeader>,
    buf: Vec<u8>,
    next_chunk: u16,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            header: None,
            buf: Vec::new(),
            next_chunk: 0,
        }
    }

    /// Feed one interrupt report. Returns a frame when its last chunk lands.
    pub fn feed(&mut self, report: &[u8]) -> Option<RawFrame> {
        if let Some(header) = parse_frame_header(report) {
            if self.header.is_some() {
                log::warn!(
                    "Frame header arrived mid-frame, dropping partial {:?} frame",
                    self.header.map(|h| h.modality)
                );
            }
            self.header = Some(header);
            self.buf.clear();
            self.buf.reserve(header.payload_len as usize);
            self.next_chunk = 0;
            // Zero-chunk frame: header only, empty payload.
            if header.chunk_count == 0 {
                return self.finish();
            }
            return None;
        }

        if let Some((index, payload)) = parse_frame_chunk(report) {
            let Some(header) = self.header else {
                // Chunk without a header, typically the tail of a frame that
                // started before we began reading. Skip.
                return None;
            };
            if index != self.next_chunk {
                log::warn!(
                    "Chunk {} out of sequence (expected {}), dropping partial {:?} frame",
                    index,
                    self.next_chunk,
                    header.modality
                );
                self.reset();
                return None;
            }
            self.buf.extend_from_slice(payload);
            self.next_chunk += 1;
            if self.next_chunk == header.chunk_count {
                return self.finish();
            }
        }

        None
    }

    fn finish(&mut self) -> Option<RawFrame> {
        let header = self.header.take()?;
        let mut data = std::mem::take(&mut self.buf);
        if data.len() < header.payload_len as usize {
            log::warn!(
                "Frame payload short ({} of {} bytes), dropping {:?} frame",
                data.len(),
                header.payload_len,
                header.modality
            );
            self.reset();
            return None;
        }
        // The final chunk is padded to the report size.
        data.truncate(header.payload_len as usize);
        self.next_chunk = 0;
        Some(RawFrame {
            modality: header.modality,
            timestamp_us: header.timestamp_us,
            data,
        })
    }

    fn reset(&mut self) {
        self.header = None;
        self.buf.clear();
        self.next_chunk = 0;
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColorMode, DepthMode};

    fn header_report(modality: u8, timestamp_us: u64, payload_len: u32, chunks: u16) -> Vec<u8> {
        let mut r = vec![0u8; FRAME_REPORT_SIZE];
        r[0] = PREFIX_DEVICE_TO_HOST;
        r[1] = FRAME_HEADER_MAGIC;
        r[2] = modality;
        r[4..12].copy_from_slice(&timestamp_us.to_le_bytes());
        r[12..16].copy_from_slice(&payload_len.to_le_bytes());
        r[16..18].copy_from_slice(&chunks.to_le_bytes());
        r
    }

    fn chunk_report(index: u16, fill: u8) -> Vec<u8> {
        let mut r = vec![fill; FRAME_REPORT_SIZE];
        r[0] = PREFIX_DEVICE_TO_HOST;
        r[1] = FRAME_CHUNK_MAGIC;
        r[2..4].copy_from_slice(&index.to_le_bytes());
        r
    }

    #[test]
    fn test_build_command() {
        let buf = build_command(CMD_SERIAL);
        assert_eq!(buf[0], 0x02);
        assert_eq!(&buf[1..3], CMD_SERIAL);
        assert_eq!(buf[3], 0);
    }

    #[test]
    fn test_build_stream_start_cmd() {
        let profile = StreamProfile {
            resolution: Resolution::SXGA,
            frame_rate: 15,
            depth_mode: DepthMode::Registered16,
            color_mode: ColorMode::Yuv422,
        };
        let buf = build_stream_start_cmd(&profile);
        assert_eq!(&buf[1..3], CMD_STREAM_START);
        assert_eq!(buf[3], 2); // Registered16
        assert_eq!(buf[4], 2); // Yuv422
        assert_eq!(u16::from_le_bytes([buf[5], buf[6]]), 1280);
        assert_eq!(u16::from_le_bytes([buf[7], buf[8]]), 1024);
        assert_eq!(buf[9], 15);
    }

    #[test]
    fn test_validate_response() {
        let mut resp = [0u8; 63];
        resp[0] = 0x01;
        resp[1..3].copy_from_slice(CMD_SERIAL);
        resp[3] = b'S';
        let offset = validate_response(&resp, CMD_SERIAL).unwrap();
        assert_eq!(offset, 3);
    }

    #[test]
    fn test_validate_response_rejects_wrong_echo() {
        let mut resp = [0u8; 63];
        resp[0] = 0x01;
        resp[1..3].copy_from_slice(CMD_FIRMWARE);
        assert!(validate_response(&resp, CMD_SERIAL).is_err());
    }

    #[test]
    fn test_parse_capability_table() {
        // Two entries: 640x480@30 depth+color, 1280x1024@15 depth only.
        let mut payload = vec![2u8];
        payload.extend_from_slice(&640u16.to_le_bytes());
        payload.extend_from_slice(&480u16.to_le_bytes());
        payload.push(30);
        payload.push(WIRE_DEPTH | WIRE_COLOR);
        payload.extend_from_slice(&1280u16.to_le_bytes());
        payload.extend_from_slice(&1024u16.to_le_bytes());
        payload.push(15);
        payload.push(WIRE_DEPTH);

        let modes = parse_capability_table(&payload);
        assert_eq!(modes.len(), 3);
        assert_eq!(modes[0].resolution, Resolution::VGA);
        assert_eq!(modes[0].modality, Modality::Depth);
        assert_eq!(modes[1].modality, Modality::Color);
        assert_eq!(modes[2].resolution, Resolution::SXGA);
        assert_eq!(modes[2].frame_rate, 15);
    }

    #[test]
    fn test_parse_frame_header() {
        let report = header_report(WIRE_DEPTH, 100_000, 4096, 4);
        let header = parse_frame_header(&report).unwrap();
        assert_eq!(header.modality, Modality::Depth);
        assert_eq!(header.timestamp_us, 100_000);
        assert_eq!(header.payload_len, 4096);
        assert_eq!(header.chunk_count, 4);

        // Control responses must not parse as headers.
        let mut control = [0u8; REPORT_SIZE];
        control[0] = PREFIX_DEVICE_TO_HOST;
        control[1] = CMD_SERIAL[0];
        assert!(parse_frame_header(&control).is_none());
    }

    #[test]
    fn test_assembler_reassembles_two_chunks() {
        let payload_len = (CHUNK_PAYLOAD + 100) as u32;
        let mut asm = FrameAssembler::new();
        assert!(asm
            .feed(&header_report(WIRE_COLOR, 42, payload_len, 2))
            .is_none());
        assert!(asm.feed(&chunk_report(0, 0xAA)).is_none());
        let frame = asm.feed(&chunk_report(1, 0xBB)).unwrap();
        assert_eq!(frame.modality, Modality::Color);
        assert_eq!(frame.timestamp_us, 42);
        assert_eq!(frame.data.len(), payload_len as usize);
        assert_eq!(frame.data[0], 0xAA);
        assert_eq!(frame.data[CHUNK_PAYLOAD], 0xBB);
    }

    #[test]
    fn test_assembler_drops_out_of_sequence_chunk() {
        let mut asm = FrameAssembler::new();
        assert!(asm
            .feed(&header_report(WIRE_DEPTH, 7, (2 * CHUNK_PAYLOAD) as u32, 2))
            .is_none());
        // Chunk 1 before chunk 0: partial frame abandoned.
        assert!(asm.feed(&chunk_report(1, 0xCC)).is_none());
        // The next complete frame still assembles.
        assert!(asm
            .feed(&header_report(WIRE_DEPTH, 8, CHUNK_PAYLOAD as u32, 1))
            .is_none());
        let frame = asm.feed(&chunk_report(0, 0xDD)).unwrap();
        assert_eq!(frame.timestamp_us, 8);
    }

    #[test]
    fn test_assembler_ignores_orphan_chunk() {
        let mut asm = FrameAssembler::new();
        assert!(asm.feed(&chunk_report(3, 0xEE)).is_none());
    }
}
