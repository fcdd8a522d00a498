//! Controller subsystem for the Wii remote
//!
//! Owns the remote from pairing to teardown:
//!
//! 1. [`driver`] - Driver boundary and the owned report model
//! 2. [`gilrs_driver`] - Driver backed by the kernel input device
//! 3. [`sysfs`] - Player LEDs and Bluetooth address of that device
//! 4. [`bluez`] - Disconnecting the remote on release
//! 5. [`edge_tracker`] - Held-button flags and press-edge detection
//! 6. [`session`] - Connection lifecycle as a typestate machine
//! 7. [`controller_handle`] - Unified API and thread lifecycle
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────── controller-session thread ────────────┐
//! Wii remote ──►  │ Driver ──► Report ──► ButtonEdgeTracker ──► Press │ ──► dispatcher
//!                 │   ▲                                               │
//!                 │   └── Disconnected → Connecting → Configuring     │
//!                 │                          → Connected ──┘          │
//!                 └───────────────────────────────────────────────────┘
//!                         ▲ SessionSignal::Teardown
//! ```
//!
//! Presses are produced only on the released→held edge. A report of any other
//! kind while connected, a device error or a teardown signal all end the
//! connection, after which pairing starts over.

pub mod bluez;
pub mod controller_handle;
pub mod driver;
pub mod edge_tracker;
pub mod gilrs_driver;
pub mod session;
pub mod sysfs;

pub use controller_handle::{ControllerError, ControllerHandle, ControllerSettings};
pub use driver::WiimoteButton;
pub use edge_tracker::PressEvent;
pub use gilrs_driver::GilrsDriver;
pub use session::SessionSignal;
