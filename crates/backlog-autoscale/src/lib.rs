//! backlog-autoscale — backlog-per-member scaling policy.
//!
//! Reads the queue depth and the scaling group size, compares the
//! backlog per member against a threshold, and asks the group for one
//! more or one fewer member.
//!
//! # Scaling Algorithm
//!
//! ```text
//! members == 0:
//!     depth > 0 → ScaleTo(1)          // cold start, threshold undefined
//!
//! members > 0:
//!     backlog = depth / members
//!     backlog > threshold → ScaleTo(min(members + 1, max))   if it grows
//!     backlog < threshold → ScaleTo(max(members - 1, floor))  if it shrinks
//!         floor = max(min, 1) while depth > 0, else min
//!     backlog == threshold → NoChange  // dead-band
//! ```
//!
//! `members` is the live count. A target is only requested when it moves
//! past the group's desired capacity in the same direction, so a group
//! still converging upwards is never asked for less.
//!
//! Changes are at most one member per evaluation. The worker loop gates
//! evaluations behind a cooldown so the group has time to converge.

pub mod scaler;

pub use scaler::{Autoscaler, ScaleDecision, ScalingPolicy};
