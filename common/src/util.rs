pub mod datetime;
pub mod id_generator;
pub mod result;
pub mod shutdown;
pub mod tracing;
