#![cfg_attr(docsrs, feature(doc_cfg))]
//! A library for zero-export battery control around a Victron Multiplus.
//!
//! The crate decodes three serial devices and closes the control loop between
//! them over an MQTT bus:
//!
//! 1. **VE.Bus inverter/charger** ([`vebus`]): a stateful request/response
//!    client for the MK serial protocol, including the ESS assistant scan
//!    that locates the external setpoint RAM slot.
//! 2. **DLMS smart meter** ([`meter`]): HDLC-framed, AES-128-CTR encrypted
//!    push telegrams from the grid meter, with per-country register layouts.
//! 3. **VE.Direct MPPT charger** ([`vedirect`]): the line-oriented text
//!    protocol with its running-sum checksum.
//!
//! The [`controller`] module ties the decoded readings together: it computes
//!    a rate-limited power setpoint from the grid power, honors the SoC
//!    hysteresis bands and the dynamic discharge floor, distributes the
//!    setpoint across phases round robin and puts the inverter to sleep when
//!    the battery stays empty.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//! use victron_ess_lib::link::SerialLink;
//! use victron_ess_lib::vebus::VeBus;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = SerialLink::new("/dev/ttyUSB0", 2400, Duration::from_millis(10));
//!     let mut bus = VeBus::new(link);
//!
//!     let version = bus.get_version()?;
//!     println!("MK2 firmware {version}");
//!
//!     bus.init_address(0x00)?;
//!     bus.scan_ess_assistant()?;
//!     bus.set_power_phase(-300, 1)?; // discharge 300 W on L1
//!     Ok(())
//! }
//! ```
//!
//! Serial links are exclusively owned by their decoders and all traffic is
//! strictly request-response; the engines never retry internally.

pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod link;
pub mod meter;
pub mod protocol;
pub mod vebus;
pub mod vedirect;

pub use error::Error;
