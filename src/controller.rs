//! Event-driven setpoint regulator.
//!
//! The controller consumes grid readings, BMS state and solar power from the
//! message bus, refreshes the inverter telemetry for one phase per cycle and
//! drives the ESS setpoint towards zero grid exchange. Its state machine
//! enforces the hard limits: a 400 W ramp per cycle, the configured charge
//! ceiling, a SoC-dependent discharge floor, hysteresis bands around the SoC
//! cutoffs and an optional sleep mode once the battery stayed empty long
//! enough.
//!
//! Everything runs on the bus consumer thread; one event is fully serviced
//! (read, compute, write, publish) before the next one is taken.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::ConfigHandle;
use crate::protocol::{DeviceState, PhaseData};
use crate::Error;

/// Largest allowed setpoint change per meter cycle, in watts.
pub const MAX_RAMP: i32 = 400;

/// BMS readings older than this fall back to the inverter's own SoC.
const BMS_STALE_AFTER: Duration = Duration::from_secs(60);

/// Solar readings older than this no longer lift the discharge floor.
const MPPT_FRESH_FOR: Duration = Duration::from_secs(20);

/// Power reserved for local consumption before solar lifts the floor.
const MPPT_FLOOR_MARGIN: f64 = 160.0;

/// Lower bound of the dynamic discharge floor, in watts.
const MIN_INVERT_FLOOR: f64 = 300.0;

/// Meter cycles between watchdog touches.
const WATCHDOG_EVERY: u32 = 10;

/// Inverter operations the controller needs. Implemented by
/// [`crate::vebus::VeBus`]; mocked in tests.
pub trait InverterBridge {
    /// Refreshes AC info plus the standard snapshot for a phase (1-based).
    fn get_data(&mut self, phase: u8) -> Result<PhaseData, Error>;
    /// Writes the ESS setpoint for a phase. Positive watts charge.
    fn set_power_phase(&mut self, watts: i32, phase: u8) -> Result<(), Error>;
    fn sleep(&mut self) -> Result<(), Error>;
    fn wakeup(&mut self) -> Result<(), Error>;
    fn reset_device(&mut self) -> Result<(), Error>;
    fn fetch_dump(&mut self) -> Result<serde_json::Value, Error>;
}

/// Message bus publish seam. Failures are logged, never retried.
pub trait BusPublisher {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), Error>;
}

/// The regulator. One instance per process; lives as long as the bus loop.
pub struct Controller<B, P> {
    bridge: B,
    bus: P,
    config: ConfigHandle,
    setpoint_w: i32,
    prev_setpoint_w: i32,
    charging: bool,
    inverting: bool,
    bms_soc: Option<f64>,
    bms_updated: Option<Instant>,
    mppt_power_w: f64,
    mppt_updated: Option<Instant>,
    battery_empty_since: Option<Instant>,
    standby: bool,
    device_state: Option<DeviceState>,
    current_phase: u8,
    per_phase: [Option<PhaseData>; 3],
    watchdog_counter: u32,
    watchdog_path: PathBuf,
}

impl<B: InverterBridge, P: BusPublisher> Controller<B, P> {
    pub fn new(bridge: B, bus: P, config: ConfigHandle) -> Result<Self, Error> {
        // fail early when the controller section is absent
        config.read().victron()?;
        Ok(Self {
            bridge,
            bus,
            config,
            setpoint_w: 0,
            prev_setpoint_w: 0,
            charging: false,
            inverting: false,
            bms_soc: None,
            bms_updated: None,
            mppt_power_w: 0.0,
            mppt_updated: None,
            battery_empty_since: None,
            standby: false,
            device_state: None,
            current_phase: 1,
            per_phase: [None, None, None],
            watchdog_counter: 0,
            watchdog_path: PathBuf::from("watchdog.txt"),
        })
    }

    /// Commanded setpoint in watts; positive charges the battery.
    pub fn setpoint(&self) -> i32 {
        self.setpoint_w
    }

    pub fn is_standby(&self) -> bool {
        self.standby
    }

    /// Handles a BMS update: `{soc, voltage}`.
    pub fn handle_bms(&mut self, soc: f64, voltage: Option<f64>) {
        log::info!("update from bms: soc={soc}, voltage={voltage:?}");
        self.bms_soc = Some(soc);
        self.bms_updated = Some(Instant::now());
    }

    /// Handles a solar update (`PPV` in watts).
    pub fn handle_mppt(&mut self, ppv: f64) {
        log::info!("mppt power: {ppv}");
        self.mppt_power_w = ppv;
        self.mppt_updated = Some(Instant::now());
    }

    /// Handles a control command from the bus.
    pub fn handle_cmd(&mut self, cmd: &str) {
        log::info!("got cmd: {cmd}");
        let result = match cmd {
            "reset" => self.bridge.reset_device(),
            "sleep" => self.bridge.sleep(),
            "wakeup" => self.bridge.wakeup(),
            "fetch_data" => self.fetch_data(),
            other => {
                log::warn!("unknown cmd {other}");
                Ok(())
            }
        };
        if let Err(e) = result {
            log::error!("cmd {cmd} failed: {e}");
        }
    }

    fn fetch_data(&mut self) -> Result<(), Error> {
        let dump = self.bridge.fetch_dump()?;
        let topic = self.config.read().topics.fetch_data.clone();
        match topic {
            Some(topic) => self.publish(&topic, &dump.to_string()),
            None => log::warn!("no fetch_data_topic configured, dropping dump"),
        }
        Ok(())
    }

    /// Rebinds the lower SoC cutoff at runtime.
    pub fn set_min_soc(&mut self, value: f64) {
        log::warn!("update soc_min: {value}");
        self.config.update(|c| {
            if let Some(v) = c.victron.as_mut() {
                v.min_soc = value;
            }
        });
    }

    /// Rebinds the upper SoC cutoff at runtime.
    pub fn set_max_soc(&mut self, value: f64) {
        log::warn!("update soc_max: {value}");
        self.config.update(|c| {
            if let Some(v) = c.victron.as_mut() {
                v.max_soc = value;
            }
        });
    }

    /// Services one meter event. `sm_power` is the negated grid power as
    /// dispatched from the bus: negative while the house imports, so a
    /// negative value pushes the setpoint towards discharge.
    pub fn handle_meter(&mut self, sm_power: f64) {
        let Ok(cfg) = self.config.read().victron().map(|v| v.clone()) else {
            log::error!("no [VICTRON] configuration, skipping meter event");
            return;
        };
        let phase = self.current_phase;

        let victron_ok = match self.bridge.get_data(phase) {
            Ok(data) => {
                self.device_state = data.device_state();
                self.per_phase[phase as usize - 1] = Some(data);
                true
            }
            Err(e) => {
                log::error!("victron not ok: {e}");
                false
            }
        };

        // without fresh BMS data fall back to the inverter's battery monitor
        let bms_stale = self
            .bms_updated
            .map(|t| t.elapsed() > BMS_STALE_AFTER)
            .unwrap_or(true);
        if bms_stale {
            if let Some(data) = &self.per_phase[phase as usize - 1] {
                log::debug!("no bms data, use inverter soc {}", data.soc);
                self.bms_soc = Some(data.soc);
            }
        }

        self.prev_setpoint_w = self.setpoint_w;

        let gain = if self.setpoint_w.abs() > 100 { 0.3 } else { 0.1 };
        self.setpoint_w += (sm_power * gain).round() as i32;

        self.setpoint_w = self.setpoint_w.clamp(
            self.prev_setpoint_w - MAX_RAMP,
            self.prev_setpoint_w + MAX_RAMP,
        );
        log::info!(
            "setpoint={}, old: {} meter: {sm_power}",
            self.setpoint_w,
            self.prev_setpoint_w
        );

        let max_invert = self.max_invert_dynamic(&cfg);
        if f64::from(self.setpoint_w) > cfg.max_charge {
            self.setpoint_w = cfg.max_charge as i32;
        }
        if f64::from(self.setpoint_w) < -max_invert {
            self.setpoint_w = -max_invert as i32;
        }

        // exporting heavily while asleep: a positive nudge must not wake the
        // device for nothing
        if self.standby && self.setpoint_w > 0 && sm_power < -50.0 {
            log::info!("standby and exporting, holding setpoint at 0");
            self.setpoint_w = 0;
        }

        self.publish_telemetry();

        let soc = self.bms_soc.unwrap_or(0.0);
        if self.setpoint_w > 0 {
            let max_soc_eff = cfg.max_soc + if self.charging { cfg.soc_hysteresis } else { 0.0 };
            if soc < max_soc_eff {
                log::info!("set charge power {}", self.setpoint_w);
                self.set_mp2_setpoint(self.setpoint_w, false, &cfg);
            } else {
                log::info!("battery full, {soc} >= {max_soc_eff}");
                self.set_mp2_setpoint(0, false, &cfg);
            }
        } else {
            let min_soc_eff = cfg.min_soc - if self.inverting { cfg.soc_hysteresis } else { 0.0 };
            if soc > min_soc_eff {
                log::info!("set discharge power {}", self.setpoint_w);
                self.set_mp2_setpoint(self.setpoint_w, false, &cfg);
            } else {
                log::info!("battery empty, {soc} <= {min_soc_eff}");
                self.set_mp2_setpoint(0, true, &cfg);
            }
        }

        self.publish_display();

        if victron_ok {
            self.watchdog_counter += 1;
            if self.watchdog_counter >= WATCHDOG_EVERY {
                self.touch_watchdog();
                self.watchdog_counter = 0;
            }
        }

        self.current_phase = if phase == 3 { 1 } else { phase + 1 };
    }

    /// Discharge limit for the current cycle: shrinks near the lower SoC
    /// cutoff via tanh, is lifted when fresh solar power could cover the
    /// feed-in, and never drops below the 300 W floor.
    fn max_invert_dynamic(&self, cfg: &crate::config::VictronSection) -> f64 {
        let soc = self.bms_soc.unwrap_or(0.0);
        let mut limit = ((soc - cfg.min_soc) / 10.0).tanh() * cfg.max_invert;
        let mppt_fresh = self
            .mppt_updated
            .map(|t| t.elapsed() < MPPT_FRESH_FOR)
            .unwrap_or(false);
        if mppt_fresh && self.mppt_power_w - MPPT_FLOOR_MARGIN > limit {
            log::debug!(
                "raising invert limit to {} from solar power {}",
                self.mppt_power_w - MPPT_FLOOR_MARGIN,
                self.mppt_power_w
            );
            limit = self.mppt_power_w - MPPT_FLOOR_MARGIN;
        }
        limit.max(MIN_INVERT_FLOOR)
    }

    /// Applies a setpoint or, in standby, tracks how long the battery has
    /// been empty and puts the inverter to sleep once the timeout passes.
    fn set_mp2_setpoint(&mut self, watts: i32, standby: bool, cfg: &crate::config::VictronSection) {
        if standby {
            let since = *self.battery_empty_since.get_or_insert_with(Instant::now);
            if cfg.sleep_enabled && since.elapsed() > Duration::from_secs(cfg.sleep_timeout) {
                log::warn!("battery empty for {}s, going to standby", cfg.sleep_timeout);
                if let Err(e) = self.bridge.sleep() {
                    log::error!("sleep failed: {e}");
                }
                self.standby = true;
                self.setpoint_w = 0;
                self.battery_empty_since = None;
            }
        } else {
            if self.standby {
                log::warn!("waking from standby");
                if let Err(e) = self.bridge.wakeup() {
                    log::error!("wakeup failed: {e}");
                }
                self.standby = false;
            }
            if self.device_state == Some(DeviceState::Off) {
                log::warn!("device is off, waking up");
                if let Err(e) = self.bridge.wakeup() {
                    log::error!("wakeup failed: {e}");
                }
            }
            if let Err(e) = self.bridge.set_power_phase(watts / 3, self.current_phase) {
                log::error!("setpoint write failed: {e}");
            }
        }

        self.charging = watts > 0;
        self.inverting = watts < 0;
    }

    /// Sums the power-like fields over all cached phases; everything else is
    /// carried over from the first populated phase.
    fn accumulated(&self) -> Option<serde_json::Value> {
        let slots: Vec<&PhaseData> = self.per_phase.iter().flatten().collect();
        let first = slots.first()?;
        let mut value = serde_json::to_value(first).ok()?;
        let object = value.as_object_mut()?;
        let sum = |get: fn(&PhaseData) -> f64| -> f64 { slots.iter().map(|d| get(d)).sum() };
        let totals: [(&str, f64); 9] = [
            ("bat_i", sum(|d| d.bat_i)),
            ("bat_p", sum(|d| d.bat_p)),
            ("inv_p", sum(|d| d.inv_p)),
            ("inv_p1", sum(|d| d.inv_p1)),
            ("inv_p_calc", sum(|d| d.inv_p_calc)),
            ("mains_i", sum(|d| d.mains_i)),
            ("mains_p_calc", sum(|d| d.mains_p_calc)),
            ("out_p", sum(|d| d.out_p)),
            ("own_p_calc", sum(|d| d.own_p_calc)),
        ];
        for (key, total) in totals {
            object.insert(key.into(), json!(total));
        }
        let inv_p = sum(|d| d.inv_p);
        object.insert("inv_p_in".into(), json!(inv_p.max(0.0)));
        object.insert("inv_p_out".into(), json!((-inv_p).max(0.0)));
        object.insert("setpoint".into(), json!(self.setpoint_w));
        Some(value)
    }

    fn publish(&mut self, topic: &str, payload: &str) {
        if let Err(e) = self.bus.publish(topic, payload) {
            log::error!("publish to {topic} failed: {e}");
        }
    }

    fn publish_telemetry(&mut self) {
        let Some(base_topic) = self.config.read().topics.victron.clone() else {
            return;
        };
        for phase in 1..=3usize {
            if let Some(data) = self.per_phase[phase - 1].clone() {
                if let Ok(payload) = serde_json::to_string(&data) {
                    self.publish(&format!("{base_topic}/{phase}"), &payload);
                }
            }
        }
        if let Some(accumulated) = self.accumulated() {
            self.publish(&base_topic, &accumulated.to_string());
        }
    }

    fn publish_display(&mut self) {
        let Some(accumulated) = self.accumulated() else {
            return;
        };
        let state = accumulated
            .get("device_state_name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let state_id = accumulated
            .get("device_state_id")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let widget = json!({
            "title": "Victron",
            "color": 22142,
            "main": {"unit": "%", "Bat": self.bms_soc},
            "stand0": {"unit": "", "State": format!("{state}/{state_id}")},
            "stand1": {"unit": "W", "Bat": format!("{:.1}", accumulated.get("bat_p").and_then(|v| v.as_f64()).unwrap_or(0.0))},
            "stand2": {"unit": "A", "Bat": format!("{:.1}", accumulated.get("bat_i").and_then(|v| v.as_f64()).unwrap_or(0.0))},
        });
        self.publish("display", &widget.to_string());
    }

    fn touch_watchdog(&self) {
        let body = format!("Watchdog on {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        if let Err(e) = std::fs::write(&self.watchdog_path, body) {
            log::error!("cannot touch watchdog file: {e}");
        }
    }
}
