//! This module defines the data structures and constants of the VE.Bus MK
//! protocol spoken by the Multiplus inverter/charger.
//!
//! It covers the frame command bytes, the `F`-request identifiers, the `W`
//! command and reply codes, the RAM variable registry with its per-variable
//! scale functions, and the typed records decoded from device replies.
//!
//! The documentation for this module is based on the "Interfacing with VE.Bus
//! products - MK2 Protocol" technical information and on bus captures between
//! Venus OS and an MK3 interface.

use serde::Serialize;

use crate::Error;

/// Version request / reply command byte.
pub const CMD_VERSION: u8 = b'V';
/// Address selection command byte.
pub const CMD_ADDRESS: u8 = b'A';
/// LED status request command byte.
pub const CMD_LED: u8 = b'L';
/// `F`-request command byte (DC/AC info, snapshot trigger, reset).
pub const CMD_INFO: u8 = b'F';
/// `W`-command frame addressed to the master (replies also carry this byte).
pub const CMD_W: u8 = b'X';
/// `W`-command frame carrying a trailing device address.
pub const CMD_W_ADDRESSED: u8 = b'x';

/// Frame marker of the AC info reply (no `0xFF` marker on this one).
pub const AC_INFO_MARKER: u8 = 0x20;

/// `F`-request identifiers (first payload byte of a `F` frame).
pub mod f_request {
    pub const DC: u8 = 0;
    pub const AC_L1: u8 = 1;
    pub const AC_L2: u8 = 2;
    pub const AC_L3: u8 = 3;
    pub const AC_L4: u8 = 4;
    pub const MASTER_MULTI_LED: u8 = 5;
    pub const SNAPSHOT: u8 = 6;
    pub const RESET_VEBUS_DEVICES: u8 = 8;
    pub const SEND_BOL: u8 = 9;
}

/// `W`-command and reply codes (first payload byte of a `X`/`x` frame).
pub mod w {
    pub const CMD_READ_RAM_VAR: u8 = 0x30;
    pub const CMD_READ_SETTING: u8 = 0x31;
    pub const CMD_WRITE_RAM_VAR: u8 = 0x32;
    pub const CMD_WRITE_SETTING: u8 = 0x33;
    pub const CMD_WRITE_DATA: u8 = 0x34;
    pub const CMD_GET_RAM_VAR_INFO: u8 = 0x36;
    pub const CMD_WRITE_VIA_ID: u8 = 0x37;
    pub const CMD_READ_SNAPSHOT: u8 = 0x38;

    pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x80;
    pub const REPLY_READ_RAM_OK: u8 = 0x85;
    pub const REPLY_READ_SETTING_OK: u8 = 0x86;
    pub const REPLY_WRITE_RAM_OK: u8 = 0x87;
    pub const REPLY_WRITE_SETTING_OK: u8 = 0x88;
    pub const REPLY_RAM_VAR_INFO: u8 = 0x8E;
    pub const REPLY_VARIABLE_NOT_SUPPORTED: u8 = 0x90;
    pub const REPLY_SETTING_NOT_SUPPORTED: u8 = 0x91;
    pub const REPLY_ACCESS_LEVEL_REQUIRED: u8 = 0x9B;
    pub const REPLY_READ_SNAPSHOT_OK: u8 = 0x99;
}

/// RAM variables of the VE.Bus register file.
///
/// Each variable carries an 8-bit id and a scale function mapping the raw
/// signed 16-bit wire value to engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum RamVar {
    UMainsRms = 0,
    IMainsRms = 1,
    UInverterRms = 2,
    IInverterRms = 3,
    UBat = 4,
    IBat = 5,
    /// RMS value of the battery ripple voltage.
    UBatRms = 6,
    /// Time base 0.1; scales to frequency, not linearly.
    InverterPeriodTime = 7,
    MainsPeriodTime = 8,
    SignedAcLoadCurrent = 9,
    /// Cannot be read through snapshots.
    VirtualSwitchPosition = 10,
    IgnoreAcInputState = 11,
    MultiFunctionalRelayState = 12,
    /// Battery monitor state of charge.
    ChargeState = 13,
    /// Filtered. Positive AC->DC, negative DC->AC.
    InverterPower1 = 14,
    InverterPower2 = 15,
    /// AC output power, filtered.
    OutputPower = 16,
    InverterPower1Unfiltered = 17,
    InverterPower2Unfiltered = 18,
    OutputPowerUnfiltered = 19,
}

impl RamVar {
    pub const fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        use RamVar::*;
        Some(match id {
            0 => UMainsRms,
            1 => IMainsRms,
            2 => UInverterRms,
            3 => IInverterRms,
            4 => UBat,
            5 => IBat,
            6 => UBatRms,
            7 => InverterPeriodTime,
            8 => MainsPeriodTime,
            9 => SignedAcLoadCurrent,
            10 => VirtualSwitchPosition,
            11 => IgnoreAcInputState,
            12 => MultiFunctionalRelayState,
            13 => ChargeState,
            14 => InverterPower1,
            15 => InverterPower2,
            16 => OutputPower,
            17 => InverterPower1Unfiltered,
            18 => InverterPower2Unfiltered,
            19 => OutputPowerUnfiltered,
            _ => return None,
        })
    }

    /// Key used for this variable in published telemetry.
    pub fn name(self) -> &'static str {
        use RamVar::*;
        match self {
            UMainsRms => "UMainsRMS",
            IMainsRms => "IMainsRMS",
            UInverterRms => "UInverterRMS",
            IInverterRms => "IInverterRMS",
            UBat => "UBat",
            IBat => "IBat",
            UBatRms => "UBatRMS",
            InverterPeriodTime => "InverterPeriodTime",
            MainsPeriodTime => "MainsPeriodTime",
            SignedAcLoadCurrent => "SignedACLoadCurrent",
            VirtualSwitchPosition => "VirtualSwitchPosition",
            IgnoreAcInputState => "IgnoreACInputState",
            MultiFunctionalRelayState => "MultiFunctionalRelayState",
            ChargeState => "ChargeState",
            InverterPower1 => "InverterPower1",
            InverterPower2 => "InverterPower2",
            OutputPower => "OutputPower",
            InverterPower1Unfiltered => "InverterPower1Unfiltered",
            InverterPower2Unfiltered => "InverterPower2Unfiltered",
            OutputPowerUnfiltered => "OutputPowerUnfiltered",
        }
    }

    /// Applies the per-variable scale function to a raw wire value.
    ///
    /// Voltages and currents scale by 0.01, the charge state by 0.5, the
    /// period times map to frequency via `10 / raw`, powers and relay states
    /// pass through unchanged.
    pub fn scaled(self, raw: i16) -> f64 {
        use RamVar::*;
        match self {
            UMainsRms | IMainsRms | UInverterRms | IInverterRms | UBat | IBat | UBatRms
            | SignedAcLoadCurrent => f64::from(raw) / 100.0,
            ChargeState => f64::from(raw) * 0.5,
            InverterPeriodTime | MainsPeriodTime => {
                if raw == 0 {
                    0.0
                } else {
                    10.0 / f64::from(raw)
                }
            }
            _ => f64::from(raw),
        }
    }
}

/// Snapshot group captured for every phase telemetry refresh.
pub const SNAPSHOT_VARS: [RamVar; 6] = [
    RamVar::InverterPower2,
    RamVar::OutputPower,
    RamVar::UBat,
    RamVar::IBat,
    RamVar::ChargeState,
    RamVar::InverterPower1,
];

/// Operating state of a VE.Bus device, as reported in the AC info record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Down,
    Startup,
    Off,
    Slave,
    InvertFull,
    InvertHalf,
    InvertAes,
    PowerAssist,
    Bypass,
    StateCharge,
}

impl DeviceState {
    pub fn from_id(id: u8) -> Option<Self> {
        use DeviceState::*;
        Some(match id {
            0 => Down,
            1 => Startup,
            2 => Off,
            3 => Slave,
            4 => InvertFull,
            5 => InvertHalf,
            6 => InvertAes,
            7 => PowerAssist,
            8 => Bypass,
            9 => StateCharge,
            _ => return None,
        })
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceState::Down => "Down",
            DeviceState::Startup => "Startup",
            DeviceState::Off => "Off",
            DeviceState::Slave => "Slave",
            DeviceState::InvertFull => "InvertFull",
            DeviceState::InvertHalf => "InvertHalf",
            DeviceState::InvertAes => "InvertAES",
            DeviceState::PowerAssist => "PowerAssist",
            DeviceState::Bypass => "Bypass",
            DeviceState::StateCharge => "StateCharge",
        };
        write!(f, "{name}")
    }
}

/// Phase topology reported in the AC info record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhaseInfo {
    L4,
    L3,
    L2,
    /// L1 of a single-phase system.
    L1OnePhase,
    L1TwoPhase,
    L1ThreePhase,
    L1FourPhase,
    Dc,
}

impl PhaseInfo {
    pub fn from_id(id: u8) -> Option<Self> {
        use PhaseInfo::*;
        Some(match id {
            5 => L4,
            6 => L3,
            7 => L2,
            8 => L1OnePhase,
            9 => L1TwoPhase,
            10 => L1ThreePhase,
            11 => L1FourPhase,
            12 => Dc,
            _ => return None,
        })
    }
}

impl std::fmt::Display for PhaseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PhaseInfo::L4 => "L4",
            PhaseInfo::L3 => "L3",
            PhaseInfo::L2 => "L2",
            PhaseInfo::L1OnePhase => "L1_1ph",
            PhaseInfo::L1TwoPhase => "L1_2ph",
            PhaseInfo::L1ThreePhase => "L1_3ph",
            PhaseInfo::L1FourPhase => "L1_4ph",
            PhaseInfo::Dc => "DC",
        };
        write!(f, "{name}")
    }
}

/// LED bitmask names, bit 0 first.
const LED_NAMES: [&str; 8] = [
    "mains",
    "absorption",
    "bulk",
    "float",
    "inverter",
    "overload",
    "low_bat",
    "temperature",
];

/// LED status reply: one mask for steady lights, one for blinking ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedStatus {
    pub light: u8,
    pub blink: u8,
}

impl LedStatus {
    /// Names of all LEDs that are lit or blinking.
    pub fn names(&self) -> Vec<&'static str> {
        let mask = self.light | self.blink;
        LED_NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Decoded AC info record for one phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcInfo {
    pub bf_factor: u8,
    pub inv_factor: u8,
    pub device_state_id: u8,
    pub phase_info_id: u8,
    /// Mains period time base; 0xFF when no mains are connected.
    pub mains_period: u8,
    pub mains_u: f64,
    pub mains_i: f64,
    pub inv_u: f64,
    pub inv_i: f64,
}

impl AcInfo {
    /// Parses the 0x20 reply frame `[LEN, 0x20, bf, inv, _, state, phase,
    /// mains_u, mains_i, inv_u, inv_i, period, CRC]` with the 16-bit fields
    /// little-endian.
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        if frame.len() < 17 {
            return Err(Error::protocol(format!(
                "ac info frame too short: {} bytes",
                frame.len()
            )));
        }
        let i16_at = |i: usize| i16::from_le_bytes([frame[i], frame[i + 1]]);
        Ok(Self {
            bf_factor: frame[2],
            inv_factor: frame[3],
            device_state_id: frame[5],
            phase_info_id: frame[6],
            mains_u: f64::from(i16_at(7)) / 100.0,
            mains_i: f64::from(i16_at(9)) / 100.0,
            inv_u: f64::from(i16_at(11)) / 100.0,
            inv_i: f64::from(i16_at(13)) / 100.0,
            mains_period: frame[15],
        })
    }

    pub fn device_state(&self) -> Option<DeviceState> {
        DeviceState::from_id(self.device_state_id)
    }

    pub fn phase_info(&self) -> Option<PhaseInfo> {
        PhaseInfo::from_id(self.phase_info_id)
    }

    pub fn mains_p(&self) -> f64 {
        (self.mains_u * self.mains_i).round()
    }

    pub fn inv_p(&self) -> f64 {
        (self.inv_u * self.inv_i).round()
    }
}

/// Scale and offset of a RAM variable as reported by `GetRAMVarInfo`.
///
/// Bit 15 of the raw scale is the sign; if bit 14 is set the effective scale
/// is `1 / (0x8000 - (raw & 0x7FFF))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RamVarInfo {
    pub scale: f64,
    pub offset: u16,
    pub signed: bool,
}

impl RamVarInfo {
    pub fn from_raw(raw_scale: u16, offset: u16) -> Self {
        let signed = raw_scale & 0x8000 != 0;
        let abs = raw_scale & 0x7FFF;
        let scale = if raw_scale & 0x4000 != 0 {
            1.0 / f64::from(0x8000 - abs)
        } else {
            f64::from(abs)
        };
        Self {
            scale,
            offset,
            signed,
        }
    }
}

/// Merged AC info and snapshot telemetry for one phase.
///
/// `inv_p` is `InverterPower2` with the sign flipped so that positive means
/// feeding the AC side; `soc` comes from the device's own battery monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseData {
    pub device_state_id: u8,
    pub device_state_name: String,
    pub phase_info: u8,
    pub phase_info_name: String,
    pub mains_period: u8,
    pub mains_u: f64,
    pub mains_i: f64,
    pub mains_p_calc: f64,
    pub inv_u: f64,
    pub inv_i: f64,
    pub inv_p_calc: f64,
    pub own_p_calc: f64,
    pub bf_factor: u8,
    pub inv_factor: u8,
    pub bat_u: f64,
    pub bat_i: f64,
    pub bat_p: f64,
    pub soc: f64,
    pub inv_p: f64,
    pub inv_p1: f64,
    pub out_p: f64,
}

impl PhaseData {
    /// Combines an AC info record with the scaled [`SNAPSHOT_VARS`] values.
    pub fn from_parts(ac: &AcInfo, snapshot: &[(RamVar, f64)]) -> Self {
        let value_of = |var: RamVar| {
            snapshot
                .iter()
                .find(|(v, _)| *v == var)
                .map(|(_, value)| *value)
                .unwrap_or(0.0)
        };
        let bat_u = value_of(RamVar::UBat);
        let bat_i = value_of(RamVar::IBat);
        let mains_p_calc = ac.mains_p();
        let inv_p_calc = ac.inv_p();
        let device_state_name = match ac.device_state() {
            Some(state) => state.to_string(),
            None => format!("unknown_{}", ac.device_state_id),
        };
        let phase_info_name = match ac.phase_info() {
            Some(info) => info.to_string(),
            None => format!("unknown_{}", ac.phase_info_id),
        };
        Self {
            device_state_id: ac.device_state_id,
            device_state_name,
            phase_info: ac.phase_info_id,
            phase_info_name,
            mains_period: ac.mains_period,
            mains_u: ac.mains_u,
            mains_i: ac.mains_i,
            mains_p_calc,
            inv_u: ac.inv_u,
            inv_i: ac.inv_i,
            inv_p_calc,
            own_p_calc: mains_p_calc - inv_p_calc,
            bf_factor: ac.bf_factor,
            inv_factor: ac.inv_factor,
            bat_u,
            bat_i,
            bat_p: (bat_u * bat_i).round(),
            soc: value_of(RamVar::ChargeState),
            inv_p: -value_of(RamVar::InverterPower2),
            inv_p1: value_of(RamVar::InverterPower1),
            out_p: value_of(RamVar::OutputPower),
        }
    }

    pub fn device_state(&self) -> Option<DeviceState> {
        DeviceState::from_id(self.device_state_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_var_scaling() {
        assert_eq!(RamVar::UBat.scaled(5220), 52.2);
        assert_eq!(RamVar::IBat.scaled(-150), -1.5);
        assert_eq!(RamVar::ChargeState.scaled(161), 80.5);
        assert_eq!(RamVar::OutputPower.scaled(-375), -375.0);
        assert_eq!(RamVar::MainsPeriodTime.scaled(200), 0.05);
        assert_eq!(RamVar::MainsPeriodTime.scaled(0), 0.0);
    }

    #[test]
    fn ram_var_ids_round_trip() {
        for id in 0..=19u8 {
            let var = RamVar::from_id(id).unwrap();
            assert_eq!(var.id(), id);
        }
        assert!(RamVar::from_id(20).is_none());
    }

    #[test]
    fn ac_info_parses_wire_capture() {
        // RX: 0F 20 01 01 01 09 08 EC 5A 5F FF EC 5A 08 00 C3 08
        let frame = [
            0x0F, 0x20, 0x01, 0x01, 0x01, 0x09, 0x08, 0xEC, 0x5A, 0x5F, 0xFF, 0xEC, 0x5A, 0x08,
            0x00, 0xC3, 0x08,
        ];
        let info = AcInfo::parse(&frame).unwrap();
        assert_eq!(info.device_state(), Some(DeviceState::StateCharge));
        assert_eq!(info.phase_info(), Some(PhaseInfo::L1OnePhase));
        assert_eq!(info.mains_u, 232.76);
        assert_eq!(info.mains_i, -1.61);
        assert_eq!(info.inv_u, 232.76);
        assert_eq!(info.inv_i, 0.08);
        assert_eq!(info.mains_period, 195);
    }

    #[test]
    fn ram_var_info_scale_convention() {
        // Bit 14 set: scale becomes 1 / (0x8000 - abs).
        let info = RamVarInfo::from_raw(0x7FFE, 0);
        assert_eq!(info.scale, 0.5);
        assert!(!info.signed);
        // Bit 15 set, bit 14 clear: plain magnitude with sign flag.
        let info = RamVarInfo::from_raw(0x8064, 10);
        assert_eq!(info.scale, 100.0);
        assert!(info.signed);
        assert_eq!(info.offset, 10);
    }

    #[test]
    fn led_names_follow_bitmask() {
        let led = LedStatus {
            light: 0b0000_0001,
            blink: 0b0000_1100,
        };
        assert_eq!(led.names(), vec!["mains", "bulk", "float"]);
    }

    #[test]
    fn phase_data_merges_snapshot_and_ac_info() {
        let frame = [
            0x0F, 0x20, 0x01, 0x01, 0x01, 0x09, 0x08, 0xEC, 0x5A, 0x5F, 0xFF, 0xEC, 0x5A, 0x08,
            0x00, 0xC3, 0x08,
        ];
        let ac = AcInfo::parse(&frame).unwrap();
        let snapshot = vec![
            (RamVar::InverterPower2, -375.0),
            (RamVar::OutputPower, 370.0),
            (RamVar::UBat, 52.2),
            (RamVar::IBat, -7.0),
            (RamVar::ChargeState, 80.5),
            (RamVar::InverterPower1, -370.0),
        ];
        let data = PhaseData::from_parts(&ac, &snapshot);
        assert_eq!(data.inv_p, 375.0);
        assert_eq!(data.soc, 80.5);
        assert_eq!(data.bat_p, (52.2f64 * -7.0).round());
        assert_eq!(data.device_state_name, "StateCharge");
        assert_eq!(data.own_p_calc, data.mains_p_calc - data.inv_p_calc);
    }
}
