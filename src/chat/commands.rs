//! `:`-prefixed chat commands typed into the input box

use std::fmt;
use std::str::FromStr;

pub const COMMAND_PREFIX: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatCommand {
    /// Start a new session
    New,
    /// Switch to the previous session
    Prev,
    /// Switch to the next session
    Next,
    /// Toggle the clear-context boundary
    Clear,
    /// Delete the current session
    Del,
}

impl ChatCommand {
    pub const ALL: [ChatCommand; 5] = [
        ChatCommand::New,
        ChatCommand::Prev,
        ChatCommand::Next,
        ChatCommand::Clear,
        ChatCommand::Del,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChatCommand::New => "new",
            ChatCommand::Prev => "prev",
            ChatCommand::Next => "next",
            ChatCommand::Clear => "clear",
            ChatCommand::Del => "del",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ChatCommand::New => "Start a new chat",
            ChatCommand::Prev => "Previous chat",
            ChatCommand::Next => "Next chat",
            ChatCommand::Clear => "Clear context",
            ChatCommand::Del => "Delete chat",
        }
    }

    /// Parse user input; `None` means the input is a regular message
    pub fn parse(input: &str) -> Option<Self> {
        input
            .trim()
            .strip_prefix(COMMAND_PREFIX)
            .and_then(|name| name.parse().ok())
    }
}

impl FromStr for ChatCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown command: {}", s))
    }
}

impl fmt::Display for ChatCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", COMMAND_PREFIX, self.as_str())
    }
}
