pub mod infra;
pub mod util;
