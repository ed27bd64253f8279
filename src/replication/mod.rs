//! Leader/follower replication (§4.4).
//!
//! [`leader::Leader`] owns the serialization point every mutation on a
//! group's leader passes through, plus the bookkeeping for the followers
//! currently attached to it. [`follower::Follower`] is the mirror image:
//! it runs on a non-leader replica, joins a leader, replays its commit log,
//! then applies whatever the leader streams afterward.

pub mod follower;
pub mod leader;

pub use follower::{Follower, FollowerConnState};
pub use leader::Leader;

/// Bound on a live follower's outbound queue before the leader gives up on
/// it and requires a fresh join (§9 design note: "a bounded channel per
/// follower with a policy... drop the follower above a high-water mark").
pub const FOLLOWER_QUEUE_CAPACITY: usize = 1024;
