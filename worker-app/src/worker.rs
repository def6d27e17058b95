pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod step_buffer;
pub mod sweep;
