use anyhow::Result;
use snowflake::SnowflakeIdGenerator;

#[derive(Debug)]
pub struct MockIdGenerator {
    next: i64,
}

impl MockIdGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }
    pub fn generate(&mut self) -> i64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for MockIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub enum IDGenerator {
    Snowflake(SnowflakeIdGenerator),
    Mock(MockIdGenerator),
}

impl IDGenerator {
    pub fn generate(&mut self) -> Result<i64> {
        match self {
            IDGenerator::Snowflake(g) => Ok(g.real_time_generate()),
            IDGenerator::Mock(g) => Ok(g.generate()),
        }
    }
}

/// machine id / node id are 5bit values.
/// (ID_MACHINE_ID, ID_NODE_ID env or derived from the process id)
pub fn new_generator_by_env() -> IDGenerator {
    let machine_id = std::env::var("ID_MACHINE_ID")
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or((std::process::id() % 32) as i32);
    let node_id = std::env::var("ID_NODE_ID")
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or(1);
    tracing::debug!("id generator: machine_id={machine_id}, node_id={node_id}");
    IDGenerator::Snowflake(SnowflakeIdGenerator::new(machine_id & 31, node_id & 31))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_snowflake_ids_are_unique_and_increasing() {
        let mut g = new_generator_by_env();
        let ids = (0..1000).map(|_| g.generate().unwrap()).collect::<Vec<_>>();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), ids.len());
    }

    #[test]
    fn test_mock_generator() {
        let mut g = IDGenerator::Mock(MockIdGenerator::new());
        assert_eq!(g.generate().unwrap(), 1);
        assert_eq!(g.generate().unwrap(), 2);
    }
}
