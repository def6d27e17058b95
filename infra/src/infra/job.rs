pub mod queue;
pub mod rows;

/// extra lease time after the handler timeout before a leased job is
/// considered stalled and becomes fetchable again
pub const GRAB_MERGIN_MILLISEC: i64 = 10000;
