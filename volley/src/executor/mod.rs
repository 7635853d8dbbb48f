//! Executor: scheduling of repeated asynchronous work
//!
//! The building block is the [`Loop`], which calls a [`Step`] over and over at a
//! target rate for as long as its [`Condition`]s hold. A [`MultiLoop`] drives a
//! varying number of loops that share one step, following a concurrency [`Profile`]
//! and an aggregate rate [`Profile`].
//!
//! # High-level flow
//! 1. The [`MultiLoop`] supervisor evaluates both profiles at whole elapsed seconds.
//! 2. When the concurrency goes up it creates new loops at rate 0, when it goes down
//!    it stops the most recently created ones.
//! 3. Whenever the concurrency or the rate changes, every loop is reassigned
//!    `floor(rate / concurrency)` iterations per second.
//! 4. The supervisor then sleeps until the earliest time either profile can change
//!    again. Flat profiles never wake it up.
//!
//! # Loop scheduling
//! A loop with rate `r` starts an iteration, awaits the step, then waits until
//! `floor(1000 / r)` milliseconds have passed since that iteration started. Steps
//! that take longer than the delay are never overlapped: the next iteration starts as
//! soon as the slow one completes. This means a loop can fall below its target rate
//! but never exceeds it.
//!
//! ```text
//! rate = 4/s        |--step--|....|--step--|....|--step-------|--step--|
//!                   0       250ms 250      500  500          800   800
//! ```
//!
//! Every loop and multi-loop reports its lifecycle through an `mpsc` channel handed
//! to `start`, see [`LoopEvent`] and [`MultiLoopEvent`]. Monitors subscribe to
//! those events to time each iteration.
//!
//! # Termination
//! - A loop ends when any condition evaluates to `false` before an iteration, or when
//!   [`Loop::stop`] is called. An iteration already in flight always completes.
//! - A multi-loop ends on [`MultiLoop::stop`], when its duration elapses, or when all
//!   of its loops ended on their own (for instance once a shared `number_of_times`
//!   budget is spent).
pub mod condition;
pub mod multi;
pub mod profile;
pub mod single;

pub use condition::{Condition, condition, max_executions, time_limit};
pub use multi::{MultiLoop, MultiLoopEvent, MultiLoopSpec};
pub use profile::Profile;
pub use single::{ArgSource, Loop, LoopEvent, LoopId, LoopSpec, Step, fun_loop, loop_wrapper};
