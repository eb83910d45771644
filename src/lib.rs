//! voice-stream: microphone capture, speech gating and chunk streaming
//! over a persistent WebSocket.
//!
//! | module        | role                                                    |
//! |---------------|---------------------------------------------------------|
//! | [`audio`]     | cpal capture, chunk encoder, capture session, VAD       |
//! | [`transport`] | connection manager, reconnect policy, WebSocket link    |
//! | [`stream`]    | the coordinator state machine, event queue, status      |
//! | [`config`]    | TOML settings                                           |
//! | [`hotkey`]    | global toggles via rdev                                 |

pub mod audio;
pub mod config;
pub mod hotkey;
pub mod stream;
pub mod transport;
