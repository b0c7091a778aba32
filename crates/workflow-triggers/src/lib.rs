//! Chat and webhook trigger ingress (spec.md §4.7): listeners normalize
//! inbound messages, a matcher picks the first trigger rule whose pattern
//! fires, and the dispatcher runs the matched workflow.
//!
//! [`service::TriggerService`] wires it all together: each [`Listener`]
//! runs its own receive loop and feeds a bounded, drop-oldest mailbox; a
//! single consumer matches and dispatches, so trigger processing is
//! strictly ordered even though listeners run concurrently.

pub mod debounce;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod listeners;
pub mod matcher;
pub mod model;
pub mod service;
pub mod template;

pub use debounce::{ChangeKind, Debouncer, FileChange};
pub use dispatcher::{Dispatcher, WorkflowDispatcher};
pub use error::{TriggerError, TriggerResult};
pub use listener::Listener;
pub use matcher::Matcher;
pub use model::{IncomingMessage, MatchKind, MatchResult, Source, TriggerFile, TriggerRule};
pub use service::{EventSink, TriggerEvent, TriggerService};
