//! Stateful client for the VE.Bus MK serial interface.
//!
//! [`VeBus`] owns the serial link to the MK3 adapter (2400 baud, 8-N-1,
//! polled reads) and implements the request/response operations used by the
//! controller: version handshake, address init, assistant scan, snapshots,
//! AC info, setting and RAM variable access, the per-phase ESS setpoint
//! write, and the sleep/wake commands.
//!
//! All traffic is strictly request-response; the engine never retries
//! internally. An I/O error closes the port and the next operation reopens
//! it. A failing version probe additionally drops the assistant scan result,
//! forcing a fresh handshake before the next setpoint write.

use std::time::{Duration, Instant};

use crate::codec::{self, format_hex, FrameReceiver, MK_MARKER};
use crate::controller::InverterBridge;
use crate::link::ByteLink;
use crate::protocol::{
    f_request, w, AcInfo, LedStatus, PhaseData, RamVar, RamVarInfo, AC_INFO_MARKER, CMD_ADDRESS,
    CMD_INFO, CMD_LED, CMD_VERSION, CMD_W, CMD_W_ADDRESSED, SNAPSHOT_VARS,
};
use crate::Error;

/// Default reply deadline for one request.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between polls of the non-blocking serial read.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Stateful MK protocol client over a byte link.
pub struct VeBus<L> {
    link: L,
    ess_setpoint_ram_id: Option<u8>,
    receive_timeout: Duration,
}

impl<L: ByteLink> VeBus<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            ess_setpoint_ram_id: None,
            receive_timeout: RECEIVE_TIMEOUT,
        }
    }

    /// Overrides the reply deadline. Mostly useful for tests.
    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }

    /// RAM id of the ESS assistant setpoint slot, once scanned.
    pub fn ess_setpoint_ram_id(&self) -> Option<u8> {
        self.ess_setpoint_ram_id
    }

    fn send_frame(&mut self, cmd: u8, payload: &[u8]) -> Result<(), Error> {
        if !self.link.is_open() {
            self.link.open()?;
        }
        let frame = codec::build_frame(cmd, payload);
        log::debug!("TX: cmd={:#04x} frame={}", cmd, format_hex(&frame));
        self.link.clear_input()?;
        self.link.write_all(&frame)?;
        self.link.flush()
    }

    /// Receives one frame whose marker byte is `marker`, honoring the reply
    /// deadline. A checksum mismatch is logged but the frame is surfaced
    /// anyway, matching the observed device behavior.
    fn receive_generic(&mut self, marker: u8) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + self.receive_timeout;
        let mut receiver = FrameReceiver::new(marker);
        let mut byte = [0u8; 1];
        loop {
            if Instant::now() >= deadline {
                return Err(Error::Timeout(self.receive_timeout));
            }
            let n = self.link.read(&mut byte)?;
            if n == 0 {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            if let Some(frame) = receiver.feed(byte[0]) {
                if !frame.crc_ok {
                    log::error!("invalid frame checksum: {}", format_hex(&frame.bytes));
                }
                log::debug!("RX: frame={}", format_hex(&frame.bytes));
                return Ok(frame.bytes);
            }
        }
    }

    fn receive_mk2(&mut self) -> Result<Vec<u8>, Error> {
        self.receive_generic(MK_MARKER)
    }

    /// Receives an MK frame and checks that it answers a `W` command.
    fn receive_w_frame(&mut self) -> Result<Vec<u8>, Error> {
        let frame = self.receive_mk2()?;
        if frame.len() < 5 || frame[2] != CMD_W {
            return Err(Error::protocol(format!("invalid frame {}", format_hex(&frame))));
        }
        Ok(frame)
    }

    /// Reads the MK2 firmware id. Doubles as the liveness probe: a failure
    /// tears down the session, including the assistant scan result.
    pub fn get_version(&mut self) -> Result<u32, Error> {
        let result = self.request_version();
        if let Err(e) = &result {
            log::error!("get_version: {e}");
            self.link.close();
            self.ess_setpoint_ram_id = None;
        }
        result
    }

    fn request_version(&mut self) -> Result<u32, Error> {
        self.send_frame(CMD_VERSION, &[])?;
        let frame = self.receive_mk2()?;
        if frame.len() < 8 || frame[2] != CMD_VERSION {
            return Err(Error::protocol(format!(
                "unexpected version reply {}",
                format_hex(&frame)
            )));
        }
        let version = u32::from_le_bytes([frame[3], frame[4], frame[5], frame[6]]);
        log::info!("mk2_version={version}");
        Ok(version)
    }

    /// Selects the device address. A single Multiplus on the bus is 0x00;
    /// success is the device echoing the address back.
    pub fn init_address(&mut self, addr: u8) -> Result<(), Error> {
        self.send_frame(CMD_ADDRESS, &[0x01, addr])?;
        let frame = self.receive_mk2()?;
        if frame.len() >= 6 && frame[2] == CMD_ADDRESS && frame[4] == addr {
            log::info!("init_address {addr} successful");
            Ok(())
        } else {
            Err(Error::protocol(format!(
                "init_address {addr} failed: {}",
                format_hex(&frame)
            )))
        }
    }

    /// Reads the LED bitmasks (low byte steady, high byte blinking).
    pub fn get_led(&mut self) -> Result<LedStatus, Error> {
        self.send_frame(CMD_LED, &[])?;
        let frame = self.receive_mk2()?;
        if frame.len() < 6 || frame[2] != CMD_LED {
            return Err(Error::protocol(format!(
                "unexpected led reply {}",
                format_hex(&frame)
            )));
        }
        let led = LedStatus {
            light: frame[3],
            blink: frame[4],
        };
        log::info!("led_light={:#04x} led_blink={:#04x}", led.light, led.blink);
        Ok(led)
    }

    /// Reads the AC info record for a phase (1-based towards the caller).
    pub fn get_ac_info(&mut self, phase: u8) -> Result<AcInfo, Error> {
        self.send_frame(CMD_INFO, &[phase])?;
        let frame = self.receive_generic(AC_INFO_MARKER)?;
        AcInfo::parse(&frame)
    }

    /// Triggers a snapshot of up to six RAM variables. The device captures
    /// the values atomically; there is no reply.
    pub fn send_snapshot_request(&mut self, vars: &[RamVar]) -> Result<(), Error> {
        if vars.is_empty() || vars.len() > 6 {
            return Err(Error::protocol(format!(
                "snapshot supports 1..=6 ram ids, got {}",
                vars.len()
            )));
        }
        let mut payload = vec![f_request::SNAPSHOT];
        payload.extend(vars.iter().map(|v| v.id()));
        self.send_frame(CMD_INFO, &payload)
    }

    /// Reads back the snapshot values, scaled per variable. The snapshot and
    /// setpoint addressing is 0-based on the wire, so `phase` is decremented
    /// here while [`VeBus::get_ac_info`] passes its argument through.
    pub fn read_snapshot(
        &mut self,
        vars: &[RamVar],
        phase: Option<u8>,
    ) -> Result<Vec<(RamVar, f64)>, Error> {
        match phase {
            Some(p) => self.send_frame(CMD_W_ADDRESSED, &[w::CMD_READ_SNAPSHOT, p - 1])?,
            None => self.send_frame(CMD_W, &[w::CMD_READ_SNAPSHOT])?,
        }
        let frame = self.receive_w_frame()?;
        if frame[3] != w::REPLY_READ_SNAPSHOT_OK {
            return Err(Error::protocol(format!("invalid response {:#04x}", frame[3])));
        }
        if frame.len() < 4 + vars.len() * 2 + 1 {
            return Err(Error::protocol(format!(
                "snapshot reply too short for {} ids: {}",
                vars.len(),
                format_hex(&frame)
            )));
        }
        let values = vars
            .iter()
            .enumerate()
            .map(|(i, var)| {
                let raw = i16::from_le_bytes([frame[4 + i * 2], frame[5 + i * 2]]);
                (*var, var.scaled(raw))
            })
            .collect();
        Ok(values)
    }

    /// Reads a setting word. `Ok(None)` when the device reports the setting
    /// as unsupported.
    pub fn read_setting(&mut self, setting_id: u8, phase: Option<u8>) -> Result<Option<u16>, Error> {
        match phase {
            Some(p) => self.send_frame(CMD_W_ADDRESSED, &[w::CMD_READ_SETTING, setting_id, p - 1])?,
            None => self.send_frame(CMD_W, &[w::CMD_READ_SETTING, setting_id])?,
        }
        let frame = self.receive_w_frame()?;
        match frame[3] {
            w::REPLY_SETTING_NOT_SUPPORTED => {
                log::warn!("read_setting: setting {setting_id} not supported");
                Ok(None)
            }
            w::REPLY_READ_SETTING_OK => {
                let n = frame.len();
                let value = u16::from_le_bytes([frame[n - 3], frame[n - 2]]);
                log::info!("read_setting: {setting_id}={value}");
                Ok(Some(value))
            }
            other => Err(Error::protocol(format!("invalid response {other:#04x}"))),
        }
    }

    /// Reads the raw 16-bit value of a RAM variable (16-bit id form, used by
    /// the assistant scan).
    pub fn read_ram_var(&mut self, ram_id: u16) -> Result<u16, Error> {
        let id = ram_id.to_le_bytes();
        self.send_frame(CMD_W, &[w::CMD_READ_RAM_VAR, id[0], id[1]])?;
        let frame = self.receive_w_frame()?;
        if frame[3] != w::REPLY_READ_RAM_OK || frame.len() < 7 {
            return Err(Error::protocol(format!(
                "unexpected ram read reply {}",
                format_hex(&frame)
            )));
        }
        Ok(u16::from_le_bytes([frame[4], frame[5]]))
    }

    /// Reads the scale/offset record of a RAM variable.
    pub fn read_ram_var_info(&mut self, ram_id: u8) -> Result<RamVarInfo, Error> {
        self.send_frame(CMD_W, &[w::CMD_GET_RAM_VAR_INFO, ram_id])?;
        let frame = self.receive_w_frame()?;
        if frame[3] != w::REPLY_RAM_VAR_INFO || frame.len() < 10 {
            return Err(Error::protocol(format!("invalid response {:#04x}", frame[3])));
        }
        let scale = u16::from_le_bytes([frame[5], frame[6]]);
        let offset = u16::from_le_bytes([frame[7], frame[8]]);
        let info = RamVarInfo::from_raw(scale, offset);
        log::info!("read_ram_var_info: {ram_id} scale={} offset={}", info.scale, info.offset);
        Ok(info)
    }

    /// Writes a 16-bit value into a RAM variable.
    pub fn write_ram_var(&mut self, ram_id: u8, value: u16) -> Result<(), Error> {
        let data = value.to_le_bytes();
        self.send_frame(CMD_W, &[w::CMD_WRITE_RAM_VAR, ram_id])?;
        self.send_frame(CMD_W, &[w::CMD_WRITE_DATA, data[0], data[1]])?;
        let frame = self.receive_w_frame()?;
        if frame[3] != w::REPLY_WRITE_RAM_OK {
            return Err(Error::protocol(format!("invalid response {:#04x}", frame[3])));
        }
        Ok(())
    }

    /// Walks RAM ids from 128 looking for the ESS assistant and records its
    /// setpoint slot (assistant id word + 1). The low nibble of each
    /// assistant header word is the number of RAM ids it owns, so non-ESS
    /// assistants are skipped by `1 + (word & 0x000F)`.
    pub fn scan_ess_assistant(&mut self) -> Result<u8, Error> {
        let mut ram_id: u16 = 128;
        for _ in 0..8 {
            let word = self.read_ram_var(ram_id)?;
            log::debug!("scan_ess_assistant ramid={ram_id} value={word:#06x}");
            if word & 0xFFF0 == 0x0050 {
                log::info!("found ess assistant at ramid={ram_id}");
                let setpoint_id = (ram_id + 1) as u8;
                self.ess_setpoint_ram_id = Some(setpoint_id);
                return Ok(setpoint_id);
            }
            ram_id += 1 + (word & 0x000F);
        }
        Err(Error::protocol("ess assistant not found"))
    }

    /// Writes the ESS power setpoint for one phase. Positive watts charge the
    /// battery; the value is sign-inverted on the wire. Refused until the
    /// assistant scan succeeded.
    pub fn set_power_phase(&mut self, power: i32, phase: u8) -> Result<(), Error> {
        let ram_id = self.ess_setpoint_ram_id.ok_or(Error::AssistantNotScanned)?;
        let wire = i16::try_from(-power)
            .map_err(|_| Error::protocol(format!("setpoint {power} W out of range")))?;
        let data = wire.to_le_bytes();
        self.send_frame(
            CMD_W_ADDRESSED,
            &[w::CMD_WRITE_VIA_ID, 0x00, ram_id, data[0], data[1], phase - 1],
        )?;
        self.check_ram_write_reply()?;
        log::info!("set_ess_power to {power}W on phase {phase} done");
        Ok(())
    }

    /// Writes the ESS module flags next to the setpoint slot: bit 0 disables
    /// charging, bit 1 disables feed-in.
    pub fn set_ess_modules(
        &mut self,
        disable_feed: bool,
        disable_charge: bool,
        phase: u8,
    ) -> Result<(), Error> {
        let ram_id = self.ess_setpoint_ram_id.ok_or(Error::AssistantNotScanned)?;
        let mut flags: u16 = 0;
        if disable_charge {
            flags |= 0x1;
        }
        if disable_feed {
            flags |= 0x2;
        }
        let data = flags.to_le_bytes();
        self.send_frame(
            CMD_W_ADDRESSED,
            &[w::CMD_WRITE_VIA_ID, 0x00, ram_id + 1, data[0], data[1], phase],
        )?;
        self.check_ram_write_reply()?;
        log::info!("set_ess_modules flags={flags:#04x} done");
        Ok(())
    }

    fn check_ram_write_reply(&mut self) -> Result<(), Error> {
        let frame = self.receive_w_frame()?;
        if frame[3] == w::REPLY_WRITE_RAM_OK {
            Ok(())
        } else {
            Err(Error::protocol(format!("ram write rejected: {:#04x}", frame[3])))
        }
    }

    /// Resets VE.Bus devices; device 0 addresses all of them. No reply.
    pub fn reset_device(&mut self, device: u8) -> Result<(), Error> {
        self.send_frame(CMD_INFO, &[f_request::RESET_VEBUS_DEVICES, 0, 0, device, 0])?;
        log::info!("reset done");
        Ok(())
    }

    /// Puts the device into sleep mode.
    pub fn sleep(&mut self) -> Result<(), Error> {
        if !self.link.is_open() {
            self.link.open()?;
        }
        self.link.write_all(&codec::SLEEP_FRAME)?;
        log::info!("SLEEP !!!");
        Ok(())
    }

    /// Wakes the device from sleep mode.
    pub fn wakeup(&mut self) -> Result<(), Error> {
        if !self.link.is_open() {
            self.link.open()?;
        }
        self.link.write_all(&codec::WAKE_FRAME)?;
        log::info!("WAKEUP !!!");
        Ok(())
    }

    /// Runs the handshake when no assistant scan result is held: version
    /// probe, address init, assistant scan.
    fn ensure_session(&mut self) -> Result<(), Error> {
        if self.ess_setpoint_ram_id.is_some() {
            return Ok(());
        }
        self.get_version()?;
        self.init_address(0x00)?;
        self.scan_ess_assistant()?;
        Ok(())
    }

    /// Refreshes the telemetry for one phase: triggers the standard snapshot
    /// group, reads the AC info record and the snapshot values.
    pub fn get_data(&mut self, phase: u8) -> Result<PhaseData, Error> {
        self.ensure_session()?;
        self.send_snapshot_request(&SNAPSHOT_VARS)?;
        let ac = self.get_ac_info(phase)?;
        let snapshot = self.read_snapshot(&SNAPSHOT_VARS, Some(phase))?;
        Ok(PhaseData::from_parts(&ac, &snapshot))
    }

    /// Collects the full diagnostic dump: per-phase AC info, all readable
    /// RAM variables in snapshot pages, the two flag words and a handful of
    /// interesting settings.
    pub fn fetch_dump(&mut self) -> Result<serde_json::Value, Error> {
        self.ensure_session()?;
        let mut phases: Vec<serde_json::Map<String, serde_json::Value>> =
            vec![serde_json::Map::new(), serde_json::Map::new(), serde_json::Map::new()];

        for phase in 1..=3u8 {
            match self.get_ac_info(phase) {
                Ok(ac) => {
                    if let Ok(value) = serde_json::to_value(&ac) {
                        phases[phase as usize - 1].insert("ac_info".into(), value);
                    }
                }
                Err(e) => log::warn!("fetch_dump: ac info phase {phase}: {e}"),
            }
        }

        for page in 0..4u8 {
            // id 10 is the virtual switch and cannot be read
            let vars: Vec<RamVar> = (page * 5..page * 5 + 5)
                .filter(|id| *id != 10)
                .filter_map(RamVar::from_id)
                .collect();
            self.send_snapshot_request(&vars)?;
            for phase in 1..=3u8 {
                match self.read_snapshot(&vars, Some(phase)) {
                    Ok(values) => {
                        for (var, value) in values {
                            phases[phase as usize - 1].insert(var.name().into(), value.into());
                        }
                    }
                    Err(e) => log::warn!("fetch_dump: snapshot page {page} phase {phase}: {e}"),
                }
            }
        }

        for phase in 1..=3u8 {
            if let Ok(Some(flags)) = self.read_setting(0, Some(phase)) {
                phases[phase as usize - 1].insert("flags_0_15".into(), format!("{flags:016b}").into());
            }
            if let Ok(Some(flags)) = self.read_setting(1, Some(phase)) {
                phases[phase as usize - 1]
                    .insert("flags_16_31".into(), format!("{flags:016b}").into());
            }
        }

        for setting_id in [2u8, 11, 15, 64] {
            if let Ok(Some(value)) = self.read_setting(setting_id, Some(1)) {
                phases[0].insert(format!("setting_{setting_id}"), value.into());
            }
        }

        let mut dump = serde_json::Map::new();
        for (i, phase) in phases.into_iter().enumerate() {
            dump.insert((i + 1).to_string(), serde_json::Value::Object(phase));
        }
        Ok(serde_json::Value::Object(dump))
    }
}

impl<L: ByteLink> InverterBridge for VeBus<L> {
    fn get_data(&mut self, phase: u8) -> Result<PhaseData, Error> {
        VeBus::get_data(self, phase)
    }

    fn set_power_phase(&mut self, watts: i32, phase: u8) -> Result<(), Error> {
        VeBus::set_power_phase(self, watts, phase)
    }

    fn sleep(&mut self) -> Result<(), Error> {
        VeBus::sleep(self)
    }

    fn wakeup(&mut self) -> Result<(), Error> {
        VeBus::wakeup(self)
    }

    fn reset_device(&mut self) -> Result<(), Error> {
        VeBus::reset_device(self, 0)
    }

    fn fetch_dump(&mut self) -> Result<serde_json::Value, Error> {
        VeBus::fetch_dump(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build_frame;
    use std::collections::VecDeque;

    /// Scripted link: every write dequeues the next canned reply into the
    /// read buffer, mimicking the strict request-response discipline.
    struct ScriptedLink {
        open: bool,
        replies: VecDeque<Vec<u8>>,
        rx: VecDeque<u8>,
        writes: Vec<Vec<u8>>,
        fail_reads: bool,
    }

    impl ScriptedLink {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                open: false,
                replies: replies.into(),
                rx: VecDeque::new(),
                writes: Vec::new(),
                fail_reads: false,
            }
        }
    }

    impl ByteLink for ScriptedLink {
        fn open(&mut self) -> Result<(), Error> {
            self.open = true;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
            if self.fail_reads {
                return Err(Error::Io(std::io::Error::other("scripted failure")));
            }
            match self.rx.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => Ok(0),
            }
        }

        fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
            self.writes.push(data.to_vec());
            // wake/sleep and snapshot requests have no reply; only queue one
            // when the script provides it
            if data.len() >= 3 && data[1] == MK_MARKER {
                if let Some(reply) = self.replies.pop_front() {
                    self.rx.extend(reply);
                }
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn clear_input(&mut self) -> Result<(), Error> {
            self.rx.clear();
            Ok(())
        }
    }

    fn fast_bus(replies: Vec<Vec<u8>>) -> VeBus<ScriptedLink> {
        let mut bus = VeBus::new(ScriptedLink::new(replies));
        bus.set_receive_timeout(Duration::from_millis(30));
        bus
    }

    fn ram_read_reply(value: u16) -> Vec<u8> {
        let v = value.to_le_bytes();
        build_frame(CMD_W, &[w::REPLY_READ_RAM_OK, v[0], v[1], 0x61, 0x59])
    }

    #[test]
    fn version_handshake() {
        // RX: 07 FF 56 24 DB 11 00 42 52
        let reply = vec![0x07, 0xFF, 0x56, 0x24, 0xDB, 0x11, 0x00, 0x42, 0x52];
        let mut bus = fast_bus(vec![reply]);
        assert_eq!(bus.get_version().unwrap(), 1170212);
    }

    #[test]
    fn version_failure_clears_scan_state() {
        let mut bus = fast_bus(vec![]);
        bus.ess_setpoint_ram_id = Some(131);
        assert!(matches!(bus.get_version(), Err(Error::Timeout(_))));
        assert_eq!(bus.ess_setpoint_ram_id(), None);
        assert!(!bus.link.open);
    }

    #[test]
    fn init_address_echo() {
        let reply = build_frame(CMD_ADDRESS, &[0x01, 0x00]);
        let mut bus = fast_bus(vec![reply]);
        bus.init_address(0x00).unwrap();
    }

    #[test]
    fn assistant_scan_finds_setpoint_slot() {
        // 128 -> 0x0090, 129 -> 0x8800, 130 -> 0x0054 (ESS, 4 RAM ids)
        let replies = vec![ram_read_reply(0x0090), ram_read_reply(0x8800), ram_read_reply(0x0054)];
        let mut bus = fast_bus(replies);
        assert_eq!(bus.scan_ess_assistant().unwrap(), 131);
        assert_eq!(bus.ess_setpoint_ram_id(), Some(131));
    }

    #[test]
    fn setpoint_write_targets_scanned_slot() {
        let replies = vec![
            ram_read_reply(0x0090),
            ram_read_reply(0x8800),
            ram_read_reply(0x0054),
            build_frame(CMD_W, &[w::REPLY_WRITE_RAM_OK]),
        ];
        let mut bus = fast_bus(replies);
        bus.scan_ess_assistant().unwrap();
        bus.set_power_phase(0, 1).unwrap();
        let write = bus.link.writes.last().unwrap();
        // x | 37 00 <ram id> <power lsb> <power msb> <phase-1>
        assert_eq!(write[2], CMD_W_ADDRESSED);
        assert_eq!(write[3], w::CMD_WRITE_VIA_ID);
        assert_eq!(write[5], 131);
        assert_eq!(&write[6..9], &[0x00, 0x00, 0x00]);
    }

    #[test]
    fn setpoint_sign_is_inverted_on_wire() {
        let replies = vec![build_frame(CMD_W, &[w::REPLY_WRITE_RAM_OK])];
        let mut bus = fast_bus(replies);
        bus.ess_setpoint_ram_id = Some(131);
        bus.set_power_phase(370, 2).unwrap();
        let write = bus.link.writes.last().unwrap();
        let wire = i16::from_le_bytes([write[6], write[7]]);
        assert_eq!(wire, -370);
        assert_eq!(write[8], 1);
    }

    #[test]
    fn ess_module_flags_target_slot_after_setpoint() {
        let replies = vec![build_frame(CMD_W, &[w::REPLY_WRITE_RAM_OK])];
        let mut bus = fast_bus(replies);
        bus.ess_setpoint_ram_id = Some(131);
        bus.set_ess_modules(true, false, 1).unwrap();
        let write = bus.link.writes.last().unwrap();
        assert_eq!(write[5], 132);
        // bit 1 disables feed-in
        assert_eq!(u16::from_le_bytes([write[6], write[7]]), 0x2);
    }

    #[test]
    fn setpoint_refused_without_scan() {
        let mut bus = fast_bus(vec![]);
        assert!(matches!(
            bus.set_power_phase(100, 1),
            Err(Error::AssistantNotScanned)
        ));
        assert!(bus.link.writes.is_empty());
    }

    #[test]
    fn snapshot_read_scales_values() {
        // ids: InverterPower2, OutputPower, UBat, IBat, ChargeState, InverterPower1
        let mut payload = vec![w::REPLY_READ_SNAPSHOT_OK];
        for raw in [-375i16, 370, 5220, -700, 161, -370] {
            payload.extend_from_slice(&raw.to_le_bytes());
        }
        let replies = vec![build_frame(CMD_W, &payload)];
        let mut bus = fast_bus(replies);
        let values = bus.read_snapshot(&SNAPSHOT_VARS, Some(1)).unwrap();
        let lookup = |var: RamVar| values.iter().find(|(v, _)| *v == var).unwrap().1;
        assert_eq!(lookup(RamVar::InverterPower2), -375.0);
        assert_eq!(lookup(RamVar::UBat), 52.2);
        assert_eq!(lookup(RamVar::IBat), -7.0);
        assert_eq!(lookup(RamVar::ChargeState), 80.5);
        // request carried the 0-based device address
        let request = &bus.link.writes[0];
        assert_eq!(request[2], CMD_W_ADDRESSED);
        assert_eq!(&request[3..5], &[w::CMD_READ_SNAPSHOT, 0]);
    }

    #[test]
    fn read_setting_reports_unsupported() {
        let replies = vec![
            build_frame(CMD_W, &[w::REPLY_SETTING_NOT_SUPPORTED, 0x00]),
            build_frame(CMD_W, &[w::REPLY_READ_SETTING_OK, 0x00, 0x34, 0x12]),
        ];
        let mut bus = fast_bus(replies);
        assert_eq!(bus.read_setting(7, None).unwrap(), None);
        assert_eq!(bus.read_setting(2, Some(1)).unwrap(), Some(0x1234));
    }

    #[test]
    fn sleep_and_wake_use_raw_frames() {
        let mut bus = fast_bus(vec![]);
        bus.sleep().unwrap();
        bus.wakeup().unwrap();
        assert_eq!(bus.link.writes[0], codec::SLEEP_FRAME.to_vec());
        assert_eq!(bus.link.writes[1], codec::WAKE_FRAME.to_vec());
    }

    #[test]
    fn io_error_propagates() {
        let mut bus = fast_bus(vec![]);
        bus.link.open = true;
        bus.link.fail_reads = true;
        assert!(matches!(bus.read_setting(0, None), Err(Error::Io(_))));
    }
}
