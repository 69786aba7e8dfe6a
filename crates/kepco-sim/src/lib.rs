//! Kepco BIT 802E simulator.
//!
//! Serves the interface card's SCPI dialect on a Telnet port (negotiation
//! burst, command echo) and a raw socket port, backed by one shared device
//! model. Used for end-to-end tests and for bench work without hardware.
//!
//! ```no_run
//! use kepco_sim::{SimConfig, Simulator};
//!
//! # async fn demo() -> std::io::Result<()> {
//! let sim = Simulator::start(SimConfig::default()).await?;
//! println!("telnet on {:?}", sim.telnet_addr());
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod faults;
pub mod server;

pub use device::{Device, DeviceError, Snapshot, IDN};
pub use faults::Faults;
pub use server::{Framing, LoggedCommand, SimConfig, Simulator};
