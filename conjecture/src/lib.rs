#![allow(clippy::result_large_err)]
#![allow(clippy::type_complexity)]

//! # Conjecture - Byte-Buffer Driven Test Case Generation and Shrinking
//!
//! Conjecture runs a test function against byte buffers. The test draws
//! everything it needs from a [`ConjectureData`], so any value it builds is
//! determined by the bytes it consumed. Shrinking a failing value therefore
//! means shrinking a buffer, and a buffer that is shorter, or equally long
//! and lexicographically smaller, is considered simpler.
//!
//! A [`ConjectureRunner`] replays saved examples, generates new buffers
//! guided by a choice tree, optionally hill-climbs on target scores and
//! finally shrinks every distinct failure it found.
//!
//! ## Quick Start
//!
//! ```rust
//! use conjecture::{ConjectureData, ConjectureRunner, DrawResult, RunnerSettings};
//!
//! fn test(data: &mut ConjectureData) -> DrawResult<()> {
//!     let n = data.draw_bits(8, None)?;
//!     if n >= 100 {
//!         match data.mark_interesting(None)? {}
//!     }
//!     Ok(())
//! }
//!
//! let settings = RunnerSettings::default().with_seed(0);
//! let mut runner = ConjectureRunner::new(settings, test).unwrap();
//! let outcome = runner.run().unwrap();
//! assert_eq!(outcome.smallest_interesting().unwrap().buffer, vec![100]);
//! ```

pub mod cache;
pub mod config;
pub mod data;
pub mod database;
pub mod datatree;
pub mod dfa;
pub mod engine;
pub mod error;
pub mod optimiser;
pub mod parallel;
pub mod pareto;
pub mod primitives;
pub mod priority;
pub mod rng;
pub mod sampler;
pub mod shrinker;
pub mod shrinking;
pub mod source;
pub mod statistics;
pub mod utils;

// Re-export the main public API
pub use cache::{CachePolicy, GenericCache, Lfu, Lru, LruReused, ValueScored};
pub use config::{
    ConfigError, IntegerRangeBias, ParallelSettings, Phase, RunnerSettings, ShrinkSettings,
};
pub use data::{
    Block, ConjectureData, ConjectureResult, DataObserver, Example, InterestingOrigin,
    NoopObserver, Status,
};
#[cfg(feature = "persistence")]
pub use database::DirectoryBasedExampleDatabase;
pub use database::{ExampleDatabase, InMemoryExampleDatabase};
pub use datatree::DataTree;
pub use dfa::{ConcreteDfa, Indexer};
pub use engine::{ConjectureRunner, ExitReason, Halt, RunOutcome};
pub use error::{ConjectureError, DataError, DrawResult};
pub use parallel::{merge_outcomes, run_sharded};
pub use pareto::{DominanceRelation, ParetoFront, dominance};
pub use rng::{create_rng, create_seeded_rng};
pub use sampler::Sampler;
pub use shrinker::{ShrinkPass, TestCaseShrinker};
pub use source::{ByteSource, GenerationParameters};
pub use statistics::{PhaseStatistics, RunStatistics};
