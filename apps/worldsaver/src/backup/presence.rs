use regex::Regex;

use worldsaver_core::{CoreError, Result, ServerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Login,
    Logout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerEvent {
    pub container: String,
    pub kind: PresenceKind,
    pub player: String,
}

/// Recognizes player join/leave lines in console output.
#[derive(Debug, Clone)]
pub struct PresenceParser {
    login: Regex,
    logout: Regex,
}

impl PresenceParser {
    pub fn new(kind: ServerKind) -> Result<Self> {
        let (login, logout) = match kind {
            ServerKind::Bedrock => (
                r"Player connected:\s*([^,\r\n]+)",
                r"Player disconnected:\s*([^,\r\n]+)",
            ),
            ServerKind::Java => (
                r"]:\s*(\S+) joined the game",
                r"]:\s*(\S+) left the game",
            ),
        };
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|err| CoreError::config(format!("invalid presence pattern: {err}")))
        };
        Ok(Self {
            login: compile(login)?,
            logout: compile(logout)?,
        })
    }

    pub fn parse_line(&self, line: &str) -> Option<(PresenceKind, String)> {
        if let Some(caps) = self.login.captures(line) {
            return Some((PresenceKind::Login, caps[1].trim().to_string()));
        }
        if let Some(caps) = self.logout.captures(line) {
            return Some((PresenceKind::Logout, caps[1].trim().to_string()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bedrock_lines() {
        let parser = PresenceParser::new(ServerKind::Bedrock).unwrap();
        assert_eq!(
            parser.parse_line("[2024-05-20 03:30:00:123 INFO] Player connected: Steve, xuid: 2535"),
            Some((PresenceKind::Login, "Steve".into()))
        );
        assert_eq!(
            parser.parse_line("[INFO] Player disconnected: Alex Smith, xuid: 2535, pfid: abc"),
            Some((PresenceKind::Logout, "Alex Smith".into()))
        );
        assert_eq!(parser.parse_line("[INFO] Running AutoCompaction..."), None);
    }

    #[test]
    fn java_lines() {
        let parser = PresenceParser::new(ServerKind::Java).unwrap();
        assert_eq!(
            parser.parse_line("[12:00:01] [Server thread/INFO]: Notch joined the game"),
            Some((PresenceKind::Login, "Notch".into()))
        );
        assert_eq!(
            parser.parse_line("[12:10:44] [Server thread/INFO]: Notch left the game"),
            Some((PresenceKind::Logout, "Notch".into()))
        );
        assert_eq!(
            parser.parse_line("[12:11:00] [Server thread/INFO]: <Notch> I joined the game late"),
            None
        );
    }
}
