//! Test support for vigil: an in-memory queue store, a scripted scan engine
//! and a harness wiring every component against one shared store.

pub mod harness;
pub mod job;
pub mod mock;
pub mod store;

pub use harness::TestHarness;
pub use job::*;
pub use mock::{RecordingReporter, ScriptedEngine};
pub use store::MemoryQueueStore;
