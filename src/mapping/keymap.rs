use std::fmt;

use crate::controller::WiimoteButton;

/// One line of text understood by the playback application's control port
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Command(&'static str);

impl Command {
    /// Neutral query used as keepalive; answered without side effects
    pub const STATUS_QUERY: Command = Command("query location");

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Maps a button to the key it stands for on the frontend
pub fn command_for(button: WiimoteButton) -> Command {
    let line = match button {
        WiimoteButton::A => "key enter",
        WiimoteButton::B => "key z",
        WiimoteButton::One => "key i",
        WiimoteButton::Two => "key m",
        WiimoteButton::Minus => "key d",
        WiimoteButton::Home => "key escape",
        WiimoteButton::Left => "key left",
        WiimoteButton::Right => "key right",
        WiimoteButton::Down => "key down",
        WiimoteButton::Up => "key up",
        WiimoteButton::Plus => "key p",
    };
    Command(line)
}
