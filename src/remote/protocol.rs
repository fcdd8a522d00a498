//! Line classification for the frontend control port
//!
//! After connecting, the frontend prints a short banner and a `#` prompt.
//! Playback notifications are pushed as lines starting with `#`, everything
//! else is the answer to the last command that was written.

/// Port the frontend listens on for network control
pub const DEFAULT_PORT: u16 = 6546;

/// Longest inbound line accepted before the connection is considered broken
pub const MAX_LINE_LENGTH: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusLine {
    /// Banner printed once after connecting
    Greeting,
    /// Unsolicited playback status, e.g. `# Playback Recorded foo`
    Notification,
    /// Answer to a command or query
    Reply,
}

impl StatusLine {
    /// Classifies one inbound line; prompts and blank lines yield `None`
    pub fn classify(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line == "#" {
            return None;
        }

        if line.starts_with("MythFrontend")
            || line.starts_with("Type 'help'")
            || line.chars().all(|c| c == '-')
        {
            return Some(StatusLine::Greeting);
        }

        if line.starts_with('#') {
            Some(StatusLine::Notification)
        } else {
            Some(StatusLine::Reply)
        }
    }
}
