//! lazywatch kubehub: lazily started, self-debouncing watchers over kube collections.
//!
//! A [`Watcher`] owns a local cache of one resource collection. Its stream starts on
//! first demand; change bursts are coalesced into one settle notification; stream
//! errors are classified and may cancel the watcher (e.g. on access denial).

#![forbid(unsafe_code)]

pub mod config;
pub mod debounce;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod kube_engine;
pub mod listeners;
pub mod process;
pub mod watcher;

pub use config::WatchConfig;
pub use debounce::{SettleFanIn, SettleSignal};
pub use discovery::{dynamic_equals, dynamic_watcher, parse_gvk_key};
pub use engine::{EngineHandlers, StreamEngine, SyncFlag};
pub use errors::{classify, set_unhandled_error_hook, ErrorHandler, Verdict};
pub use kube_engine::KubeEngine;
pub use listeners::{ListenerRegistry, StateListener};
pub use process::{DeltaProcessor, EqualsFn};
pub use watcher::{Watcher, WatcherBuilder, WatcherError, WatcherState};

pub use lazywatch_core::{ApiStatus, Delta, DeltaKind, ObjectKey, StoreError, WatchError, WatchScope};
