use chrono::{DateTime, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn from_epoch_milli(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_epoch_milli() {
        let now = now_millis();
        assert_eq!(from_epoch_milli(now).timestamp_millis(), now);
        assert_eq!(from_epoch_milli(0).timestamp_millis(), 0);
    }
}
