//! Per-connection admission state machine.
//!
//! ```text
//! Connecting ──token──► Authenticating ──valid──► Admitted
//!     │                       │                      │
//!     └──no token──┐          └──invalid──┐          │
//!                  ▼                      ▼          ▼
//!                 Closed ◄────────────────┴──────────┘
//! ```
//!
//! Transport-free: the WebSocket server drives it, tests drive it directly.
//! Only an `Admitted` connection may touch a room.

use uuid::Uuid;

use stemroom_core::{Identity, TokenCodec, TokenError};

/// Close code sent when admission fails.
pub const AUTH_FAILED_CLOSE_CODE: u16 = 1002;
pub const AUTH_FAILED_REASON: &str = "authentication failed";

/// Longest accepted track id.
pub const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    MissingToken,
    InvalidToken(TokenError),
    ClientClosed,
    Transport(String),
}

impl CloseReason {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, CloseReason::MissingToken | CloseReason::InvalidToken(_))
    }

    /// WebSocket close code for this reason.
    pub fn close_code(&self) -> u16 {
        if self.is_auth_failure() {
            AUTH_FAILED_CLOSE_CODE
        } else {
            1000
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating { token: String },
    Admitted(Identity),
    Closed(CloseReason),
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::Authenticating { .. } => f.write_str("Authenticating"),
            ConnectionState::Admitted(identity) => {
                f.debug_tuple("Admitted").field(&identity.subject_id).finish()
            }
            ConnectionState::Closed(reason) => f.debug_tuple("Closed").field(reason).finish(),
        }
    }
}

/// One realtime connection to one room.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    room: String,
    state: ConnectionState,
}

impl Connection {
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: room.into(),
            state: ConnectionState::Connecting,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// `Connecting → Authenticating` with a token, `→ Closed` without one.
    /// Ignored in any other state.
    pub fn open(&mut self, token: Option<&str>) -> &ConnectionState {
        if self.state == ConnectionState::Connecting {
            self.state = match token.filter(|t| !t.is_empty()) {
                Some(token) => ConnectionState::Authenticating {
                    token: token.to_string(),
                },
                None => ConnectionState::Closed(CloseReason::MissingToken),
            };
        }
        &self.state
    }

    /// `Authenticating → Admitted | Closed`.
    pub fn authenticate(&mut self, codec: &TokenCodec, now: u64) -> Result<&Identity, CloseReason> {
        let token = match &self.state {
            ConnectionState::Authenticating { token } => token,
            ConnectionState::Admitted(_) => return self.identity().ok_or(CloseReason::ClientClosed),
            ConnectionState::Closed(reason) => return Err(reason.clone()),
            ConnectionState::Connecting => return Err(CloseReason::MissingToken),
        };

        match codec.verify_at(token, now) {
            Ok(claims) => {
                self.state = ConnectionState::Admitted(claims.identity());
                self.identity().ok_or(CloseReason::ClientClosed)
            }
            Err(e) => {
                let reason = CloseReason::InvalidToken(e);
                self.state = ConnectionState::Closed(reason.clone());
                Err(reason)
            }
        }
    }

    /// Run `open` then `authenticate` in one step.
    pub fn admit(
        &mut self,
        token: Option<&str>,
        codec: &TokenCodec,
        now: u64,
    ) -> Result<Identity, CloseReason> {
        if let ConnectionState::Closed(reason) = self.open(token) {
            return Err(reason.clone());
        }
        self.authenticate(codec, now).cloned()
    }

    /// Move to `Closed`. The first close reason sticks.
    pub fn close(&mut self, reason: CloseReason) {
        if !matches!(self.state, ConnectionState::Closed(_)) {
            self.state = ConnectionState::Closed(reason);
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            ConnectionState::Admitted(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self.state, ConnectionState::Admitted(_))
    }
}

/// Value of the `token` query parameter.
pub fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Track id from a request path such as `/track-42`.
pub fn room_from_path(path: &str) -> Option<String> {
    let room = path.trim_matches('/');
    let valid = !room.is_empty()
        && room.len() <= MAX_ROOM_ID_LEN
        && room
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    valid.then(|| room.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stemroom_core::{SessionClaims, TokenSecret};

    const NOW: u64 = 1_700_000_000;

    fn codec() -> TokenCodec {
        TokenCodec::new(TokenSecret::new("gateway-test-secret"))
    }

    fn valid_token() -> String {
        codec()
            .issue(&SessionClaims::new("42", "alice", NOW - 10, 3600))
            .unwrap()
    }

    #[test]
    fn test_missing_token_closes_immediately() {
        let mut conn = Connection::new("track-42");
        assert_eq!(
            conn.open(None),
            &ConnectionState::Closed(CloseReason::MissingToken)
        );
        assert!(!conn.is_admitted());
        assert_eq!(
            conn.authenticate(&codec(), NOW).unwrap_err().close_code(),
            AUTH_FAILED_CLOSE_CODE
        );
    }

    #[test]
    fn test_empty_token_counts_as_missing() {
        let mut conn = Connection::new("track-42");
        assert_eq!(
            conn.open(Some("")),
            &ConnectionState::Closed(CloseReason::MissingToken)
        );
    }

    #[test]
    fn test_valid_token_admits() {
        let mut conn = Connection::new("track-42");
        let token = valid_token();
        assert!(matches!(
            conn.open(Some(&token)),
            ConnectionState::Authenticating { .. }
        ));
        let identity = conn.authenticate(&codec(), NOW).unwrap().clone();
        assert_eq!(identity.subject_id, "42");
        assert_eq!(identity.username, "alice");
        assert!(conn.is_admitted());
        assert_eq!(conn.identity(), Some(&identity));
    }

    #[test]
    fn test_invalid_token_closes_with_auth_code() {
        let mut conn = Connection::new("track-42");
        let other = TokenCodec::new(TokenSecret::new("some-other-secret"));
        let forged = other
            .issue(&SessionClaims::new("42", "alice", NOW, 3600))
            .unwrap();

        let reason = conn.admit(Some(&forged), &codec(), NOW).unwrap_err();
        assert_eq!(reason, CloseReason::InvalidToken(TokenError::BadSignature));
        assert_eq!(reason.close_code(), 1002);
        assert!(conn.identity().is_none());
    }

    #[test]
    fn test_expired_token_closes() {
        let mut conn = Connection::new("track-42");
        let reason = conn
            .admit(Some(&valid_token()), &codec(), NOW + 7200)
            .unwrap_err();
        assert_eq!(reason, CloseReason::InvalidToken(TokenError::Expired));
    }

    #[test]
    fn test_close_is_terminal() {
        let mut conn = Connection::new("track-42");
        conn.admit(Some(&valid_token()), &codec(), NOW).unwrap();
        conn.close(CloseReason::ClientClosed);
        conn.close(CloseReason::Transport("reset".into()));

        assert_eq!(
            conn.state(),
            &ConnectionState::Closed(CloseReason::ClientClosed)
        );
        assert!(conn.identity().is_none());
        assert!(conn.open(Some("again")).eq(&ConnectionState::Closed(CloseReason::ClientClosed)));
    }

    #[test]
    fn test_debug_never_prints_token() {
        let mut conn = Connection::new("track-42");
        let token = valid_token();
        conn.open(Some(&token));
        assert!(!format!("{conn:?}").contains(&token));
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query(Some("token=abc.def.ghi")).as_deref(), Some("abc.def.ghi"));
        assert_eq!(token_from_query(Some("x=1&token=t&y=2")).as_deref(), Some("t"));
        assert_eq!(token_from_query(Some("token=")), None);
        assert_eq!(token_from_query(Some("tokens=t")), None);
        assert_eq!(token_from_query(None), None);
    }

    #[test]
    fn test_room_from_path() {
        assert_eq!(room_from_path("/track-42").as_deref(), Some("track-42"));
        assert_eq!(room_from_path("/track_1.v2/").as_deref(), Some("track_1.v2"));
        assert_eq!(room_from_path("/"), None);
        assert_eq!(room_from_path("/a/b"), None);
        assert_eq!(room_from_path(&format!("/{}", "x".repeat(200))), None);
    }
}
