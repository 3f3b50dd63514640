//! # Arena Game Server
//!
//! Server side of the arena installation. Heterogeneous devices connect over
//! three transports and everything funnels through one routing substrate:
//!
//! - wall arduinos over framed TCP,
//! - wearable sensors over datagram UDP,
//! - admin tablets and player simulators over WebSocket.
//!
//! ## Architecture
//!
//! The [`inbox`](crate::inbox) owns every live connection and multiplexes
//! them behind a single send/receive surface keyed by logical address. One
//! reader task per connection feeds a channel consumed by the
//! [`dispatcher`](crate::dispatcher), a single task that owns all mutable
//! application state: the player and arduino controller registries, the
//! waiting [`queue`](crate::queue) of teams, and the registry of running
//! matches. Because only that task mutates, none of that state is locked.
//!
//! Outbound traffic flows the other way: the dispatcher hands a message and
//! a set of target addresses to the inbox, which asks each connection
//! whether it accepts each address and writes to the ones that do, each
//! write on its own task so a slow client never stalls dispatch.
//!
//! Matches are black boxes behind [`game`](crate::game) handles: commands
//! in, update/end events out. Match rows persist through
//! [`db`](crate::db); the [`http`](crate::http) router covers the front
//! desk; [`options`](crate::options) is loaded once at startup and shared.

pub mod connection;
pub mod controllers;
pub mod db;
pub mod dispatcher;
pub mod game;
pub mod http;
pub mod inbox;
pub mod options;
pub mod queue;
