//! # Beymax
//!
//! Dispatch core for a chat bot: inbound chat messages become command
//! invocations and events, recurring tasks run on a self-adjusting cadence,
//! and all state lives in a lock-protected, file-persisted scoped store.
//!
//! ## Architecture
//!
//! ```text
//! Platform ──► Client::handle_message ──► EventBus.dispatch("message")
//!                                             │
//!                     before:message ─────────┤
//!                     reserved handler ───────┤──► Router
//!                     message ────────────────┤      │
//!                     after:message ──────────┘      ├─► "!cmd" ──► permissions ─► args ─► handler
//!                                                    ├─► wait_for_message interceptor
//!                                                    └─► "special:name"
//!
//! Scheduler ─── every ≤30 s ──► "task:name" ──► handler ──► tasks scope
//! FutureDispatch ─ drain task ─► scheduled events
//!
//! handlers ──► Store::transaction(scopes) ──► commit (durable) / drop (discard)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Scopes are the unit of locking** - transactions lock declared scopes
//!    in sorted order and may only write those scopes
//! 2. **Commit or nothing** - a transaction dropped without commit leaves
//!    memory and disk untouched
//! 3. **Listeners are isolated** - a failing listener is logged and never
//!    affects its siblings or the dispatcher
//! 4. **Phases are ordered** - `before:x` is scheduled before the reserved
//!    handler, `x`, and `after:x`
//! 5. **Future events never fire early** - and at most one task ceiling late
//!
//! ## Example
//!
//! ```ignore
//! use beymax::{Arg, Client, Command, CommandSuite, Config};
//!
//! let client = Client::builder(platform)
//!     .config(Config::from_env()?)
//!     .build()?;
//!
//! CommandSuite::new("Basics")
//!     .command(Command::new("ping", |client, message, _args| async move {
//!         client.send_message(&message.channel, "pong").detach();
//!         Ok(())
//!     }))
//!     .attach(&client)?;
//!
//! client.start().await?;
//! ```

pub mod args;
pub mod bus;
pub mod client;
pub mod clock;
pub mod config;
pub mod debounce;
pub mod error;
pub mod future;
pub mod perms;
pub mod platform;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod suite;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use args::{Arg, ArgError, Argspec, ParsedArgs};
pub use bus::{BusError, Dispatched, Event, EventArgs, EventBus, Listener, SubscribeOptions, Subscription};
pub use client::{Client, ClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{ClientError, CommandOutcome, FailureKind};
pub use future::{FutureDispatch, FutureEvent, When};
pub use perms::{MatchingPolicy, Permissions};
pub use platform::{Author, ChannelId, Message, Platform, PlatformError, UserId};
pub use scheduler::{Scheduler, SchedulerError};
pub use store::{Frozen, Store, StoreError, Transaction};
pub use suite::{Command, CommandSuite};
