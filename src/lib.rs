//! User-space CCID interface-device driver.
//!
//! A smart-card resource manager opens channels through [`Driver`], powers
//! cards on and off, exchanges APDUs and runs secure PIN entry; this crate
//! provides everything underneath: the CCID bulk message framing (USB via
//! `rusb`, or the serial SYNC/ACK/NAK/LRC variant of the GemPC Twin
//! family), the T=0 and T=1 transmission protocols, ATR parsing, PPS
//! negotiation, and the per-reader firmware workarounds collected over the
//! years.

pub mod atr;
pub mod ccid;
pub mod commands;
pub mod config;
pub mod descriptor;
pub mod driver;
mod error;
pub mod pps;
pub mod quirks;
pub mod secure_pin;
pub mod serial_port;
pub mod t0;
pub mod t1;
pub mod transport;
pub mod usb_port;

pub use config::Config;
pub use driver::{Driver, PowerAction};
pub use error::{IfdError, IfdResult};
