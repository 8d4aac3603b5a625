//! Terminal session orchestration for containers.
//!
//! Provides:
//! - `BackendChannel` - Byte stream to one container execution
//! - `AutomationEngine` - Send/expect on top of a channel
//! - `Session` - Channel, subscribers, and relay loop for one terminal
//! - `SessionRegistry` - Bounded set of live sessions
//! - `spawn_reaper` - Periodic idle-session eviction

pub mod automation;
pub mod channel;
pub mod error;
pub mod fanout;
pub mod reaper;
pub mod registry;
pub mod script;
pub mod session;
pub mod template;

pub use automation::{AutomationEngine, AutomationError, AutomationSettings, Pattern};
pub use channel::BackendChannel;
pub use error::SessionError;
pub use fanout::{RelaySettings, SubscriberId};
pub use reaper::{ReaperHandle, spawn_reaper};
pub use registry::{RegistrySettings, SessionRegistry};
pub use script::{ExpectResult, ScriptStep};
pub use session::{Session, SessionDescriptor};
pub use template::{ScriptTemplate, TemplateError, builtin_templates, find_template};
