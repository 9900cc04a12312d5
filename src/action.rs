use std::str::FromStr;

use strum::Display;
use thiserror::Error;

use crate::{
    ids::{GroupId, MemoId, UserId},
    memo::Tags,
};

/// Something the user asked the editor to do, one per input line.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Action {
    New,
    Open(MemoId),
    Title(String),
    Body(String),
    Append(String),
    Tags(Tags),
    Private(bool),
    Group(Option<GroupId>),
    Join(GroupId),
    Save,
    Close,
    Delete,
    List,
    Versions,
    /// Raw version numbers, validated by the editor.
    Diff {
        from: String,
        to: String,
    },
    Restore(String),
    Login(UserId),
    Logout,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseActionError {
    #[error("empty input")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("{command} needs {what}")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },
    #[error("{command}: {reason}")]
    InvalidArgument {
        command: &'static str,
        reason: String,
    },
}

impl FromStr for Action {
    type Err = ParseActionError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (command, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(command, rest)| (command, rest.trim()));
        let action = match command {
            "" => return Err(ParseActionError::Empty),
            "new" => Action::New,
            "open" => Action::Open(parse_id("open", rest)?),
            "title" => Action::Title(rest.to_string()),
            "body" => Action::Body(unescape(rest)),
            "append" => Action::Append(unescape(rest)),
            "tags" => Action::Tags(Tags::parse_list(rest)),
            "private" => Action::Private(match rest {
                "on" | "yes" | "true" => true,
                "off" | "no" | "false" => false,
                "" => {
                    return Err(ParseActionError::MissingArgument {
                        command: "private",
                        what: "on or off",
                    });
                }
                other => {
                    return Err(ParseActionError::InvalidArgument {
                        command: "private",
                        reason: format!("expected on or off, got {other:?}"),
                    });
                }
            }),
            "group" => Action::Group(match rest {
                "none" => None,
                _ => Some(parse_id("group", rest)?),
            }),
            "join" => Action::Join(parse_id("join", rest)?),
            "save" => Action::Save,
            "close" => Action::Close,
            "delete" => Action::Delete,
            "list" => Action::List,
            "versions" => Action::Versions,
            "diff" => {
                let mut numbers = rest.split_whitespace();
                match (numbers.next(), numbers.next()) {
                    (Some(from), Some(to)) => Action::Diff {
                        from: from.to_string(),
                        to: to.to_string(),
                    },
                    _ => {
                        return Err(ParseActionError::MissingArgument {
                            command: "diff",
                            what: "two version numbers",
                        });
                    }
                }
            }
            "restore" if rest.is_empty() => {
                return Err(ParseActionError::MissingArgument {
                    command: "restore",
                    what: "a version number",
                });
            }
            "restore" => Action::Restore(rest.to_string()),
            "login" => Action::Login(parse_id("login", rest)?),
            "logout" => Action::Logout,
            "quit" | "exit" => Action::Quit,
            other => return Err(ParseActionError::Unknown(other.to_string())),
        };
        Ok(action)
    }
}

/// One input line: an action for the active session, or a command for the
/// program hosting the sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Editor(Action),
    /// 1-based, as typed.
    SwitchSession(usize),
    /// Drops every realtime link abnormally, like a server restart.
    RestartHub,
}

impl FromStr for Input {
    type Err = ParseActionError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (command, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(command, rest)| (command, rest.trim()));
        match (command, rest) {
            ("session", "") => Err(ParseActionError::MissingArgument {
                command: "session",
                what: "a session number",
            }),
            ("session", number) => match number.parse::<usize>() {
                Ok(number) if number > 0 => Ok(Input::SwitchSession(number)),
                _ => Err(ParseActionError::InvalidArgument {
                    command: "session",
                    reason: format!("expected a number from 1, got {number:?}"),
                }),
            },
            ("hub", "restart") => Ok(Input::RestartHub),
            _ => line.parse().map(Input::Editor),
        }
    }
}

fn parse_id<T>(command: &'static str, raw: &str) -> Result<T, ParseActionError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if raw.is_empty() {
        return Err(ParseActionError::MissingArgument {
            command,
            what: "an id",
        });
    }
    raw.parse().map_err(|err| ParseActionError::InvalidArgument {
        command,
        reason: format!("{err}"),
    })
}

// Lets a single input line carry multi-line content.
fn unescape(text: &str) -> String {
    text.replace("\\n", "\n")
}
