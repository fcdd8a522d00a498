//! Network side of the bridge
//!
//! [`link`] keeps one TCP text session to the playback application's control
//! port alive and pushes commands through it. [`protocol`] knows just enough
//! about the line format to tell status notifications apart from replies.
//!
//! # Architecture
//!
//! ```text
//! dispatcher ──Command──► RemoteLink ──line──► frontend :6546
//!     ▲                      │   ▲
//!     └──── status line ─────┘   └── reader task (one per connection)
//! ```

pub mod link;
pub mod protocol;

pub use link::{LinkError, LinkSettings, Outbound, RemoteLinkHandle};
pub use protocol::StatusLine;
