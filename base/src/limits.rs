/// Validation limits for list and stream endpoints
///
/// Maximum number of items to return in a single list request
pub const MAX_LIMIT: i32 = 1000;

/// Default number of items when the request does not specify a limit
pub const DEFAULT_LIMIT: i32 = 100;

/// Maximum offset value for pagination
pub const MAX_OFFSET: i64 = 100_000;

/// Maximum length of an agent name
pub const MAX_AGENT_NAME_LENGTH: usize = 255;

/// Maximum length of a step name
pub const MAX_STEP_NAME_LENGTH: usize = 255;

/// Clamp a requested page to the limits above.
pub fn clamp_page(limit: Option<i32>, offset: Option<i64>) -> (i32, i64) {
    let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = offset.unwrap_or(0).clamp(0, MAX_OFFSET);
    (limit, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_page() {
        assert_eq!(clamp_page(None, None), (DEFAULT_LIMIT, 0));
        assert_eq!(clamp_page(Some(0), Some(-3)), (1, 0));
        assert_eq!(clamp_page(Some(5000), Some(10)), (MAX_LIMIT, 10));
        assert_eq!(clamp_page(Some(20), Some(MAX_OFFSET + 1)), (20, MAX_OFFSET));
    }
}
