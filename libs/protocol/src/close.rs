//! WebSocket close codes used by the hub.
//!
//! Close codes are part of the protocol contract: agents key their
//! reconnect/re-auth behavior off them.

/// Authentication failed: token missing, unknown, or revoked.
pub const CLOSE_AUTH_FAILED: u16 = 4001;

/// Handshake failed: hello deadline expired or the first frame was not a
/// hello.
pub const CLOSE_HANDSHAKE_FAILED: u16 = 4002;

/// The hello frame was present but could not be parsed.
pub const CLOSE_MALFORMED_HELLO: u16 = 4003;

/// The connection went silent past the heartbeat ceiling and was reaped.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4004;
