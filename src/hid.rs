use crate::protocol::{self, PREFIX_DEVICE_TO_HOST, REPORT_SIZE};
use crate::types::{Capabilities, StreamMode, StreamProfile};
use crate::{CaptureError, Result};
use hidapi::HidDevice;

/// HID transport layer using hidapi for SET_REPORT / GET_REPORT and
/// interrupt frame reads.
///
/// On Windows, hidapi's `write()` uses byte[0] as the HID report ID.
/// The protocol prefix 0x02 (host-to-device) doubles as the output report ID,
/// so `build_command()` output (63 bytes starting with 0x02) can be passed
/// directly to `write()`.
pub struct HidTransport {
    device: HidDevice,
}

impl HidTransport {
    pub fn new(device: HidDevice) -> Self {
        Self { device }
    }

    /// Send a HID command and receive the response.
    ///
    /// 1. Builds a 63-byte buffer: [0x02, cmd_bytes..., padding]
    /// 2. Sends via `write()` — byte[0]=0x02 serves as both report ID and protocol prefix
    /// 3. Reads via `get_input_report()` — report ID 0x01 = device-to-host prefix
    /// 4. Validates the response prefix; callers validate the command echo
    pub fn transaction(&self, cmd: &[u8]) -> Result<Vec<u8>> {
        let send_buf = protocol::build_command(cmd);

        self.device
            .write(&send_buf)
            .map_err(|e| CaptureError::InternalFailure(format!("write failed: {}", e)))?;

        // Small delay to let the sensor process the command
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut recv_buf = [0u8; REPORT_SIZE + 1];
        recv_buf[0] = PREFIX_DEVICE_TO_HOST; // report ID = 0x01
        let len = self
            .device
            .get_input_report(&mut recv_buf)
            .map_err(|e| CaptureError::InternalFailure(format!("get_input_report failed: {}", e)))?;

        let response = recv_buf[..len].to_vec();

        if response.is_empty() || response[0] != PREFIX_DEVICE_TO_HOST {
            return Err(CaptureError::InvalidResponse(
                response.first().copied().unwrap_or(0),
            ));
        }

        Ok(response)
    }

    /// Read the serial string from the sensor.
    pub fn read_serial(&self) -> Result<String> {
        let response = self.transaction(protocol::CMD_SERIAL)?;
        let offset = protocol::validate_response(&response, protocol::CMD_SERIAL)?;
        Ok(protocol::extract_string(&response[offset..]))
    }

    /// Read the firmware version string from the sensor.
    pub fn read_firmware(&self) -> Result<String> {
        let response = self.transaction(protocol::CMD_FIRMWARE)?;
        let offset = protocol::validate_response(&response, protocol::CMD_FIRMWARE)?;
        Ok(protocol::extract_string(&response[offset..]))
    }

    /// Read the capabilities bitmap from the sensor.
    pub fn read_capabilities(&self) -> Result<Capabilities> {
        let response = self.transaction(protocol::CMD_CAPABILITIES)?;
        let offset = protocol::validate_response(&response, protocol::CMD_CAPABILITIES)?;
        Ok(protocol::parse_capabilities(&response[offset..]))
    }

    /// Read the capability table (supported resolution / frame-rate modes).
    pub fn read_capability_table(&self) -> Result<Vec<StreamMode>> {
        let response = self.transaction(protocol::CMD_CAPABILITY_TABLE)?;
        let offset = protocol::validate_response(&response, protocol::CMD_CAPABILITY_TABLE)?;
        Ok(protocol::parse_capability_table(&response[offset..]))
    }

    /// Send the stream start command for a negotiated profile.
    pub fn start_streams(&self, profile: &StreamProfile) -> Result<()> {
        let cmd_buf = protocol::build_stream_start_cmd(profile);

        self.device
            .write(&cmd_buf)
            .map_err(|e| CaptureError::InternalFailure(format!("stream start failed: {}", e)))?;

        std::thread::sleep(std::time::Duration::from_millis(20));

        // Read the ack (may be all zeros on some firmware revisions, that's OK)
        let mut recv_buf = [0u8; REPORT_SIZE + 1];
        recv_buf[0] = PREFIX_DEVICE_TO_HOST;
        let _ = self.device.get_input_report(&mut recv_buf);

        Ok(())
    }

    /// Send the stream stop command.
    pub fn stop_streams(&self) -> Result<()> {
        let cmd_buf = protocol::build_stream_stop_cmd();

        self.device
            .write(&cmd_buf)
            .map_err(|e| CaptureError::InternalFailure(format!("stream stop failed: {}", e)))?;

        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut recv_buf = [0u8; REPORT_SIZE + 1];
        recv_buf[0] = PREFIX_DEVICE_TO_HOST;
        let _ = self.device.get_input_report(&mut recv_buf);

        Ok(())
    }

    /// Read one interrupt frame report with a timeout.
    ///
    /// Returns the raw report bytes, `None` on timeout, or
    /// `SensorDisconnected` when the device drops off the bus.
    pub fn read_frame_report(
        &self,
        buf: &mut [u8; protocol::FRAME_REPORT_SIZE],
        timeout_ms: i32,
    ) -> Result<Option<usize>> {
        match self.device.read_timeout(buf, timeout_ms) {
            Ok(0) => Ok(None), // timeout, no data
            Ok(n) => Ok(Some(n)),
            Err(e) => {
                let msg = e.to_string().to_ascii_lowercase();
                if msg.contains("disconnected")
                    || msg.contains("no such device")
                    || msg.contains("not found")
                {
                    Err(CaptureError::SensorDisconnected)
                } else {
                    Err(CaptureError::Hid(e))
                }
            }
        }
    }
}
