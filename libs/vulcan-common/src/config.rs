use std::str::FromStr;

/// Read an environment variable with a fallback.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable, falling back to `default` when
/// the variable is unset or unparseable.
pub fn env_parse_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub fn redis_url() -> String {
    env_or("REDIS_URL", "redis://127.0.0.1:6379")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_falls_back_on_garbage() {
        std::env::set_var("VULCAN_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse_or::<u64>("VULCAN_TEST_PARSE", 4), 4);
        std::env::set_var("VULCAN_TEST_PARSE", "9");
        assert_eq!(env_parse_or::<u64>("VULCAN_TEST_PARSE", 4), 9);
        std::env::remove_var("VULCAN_TEST_PARSE");
    }
}
