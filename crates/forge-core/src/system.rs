use std::{sync::OnceLock, time::Instant};

static NODE_ID: OnceLock<String> = OnceLock::new();
static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Environment variable overriding the node id.
pub const NODE_ID_ENV: &str = "FORGE_NODE_ID";

/// Initialize process start time.
pub fn init_uptime() {
    START_TIME.get_or_init(Instant::now);
}

/// Process uptime in seconds.
pub fn uptime_seconds() -> u64 {
    let start = START_TIME.get_or_init(Instant::now);
    start.elapsed().as_secs()
}

/// Stable id of this process, used to name claim holders.
///
/// `FORGE_NODE_ID` wins, then the hostname, then a random uuid.
pub fn node_id() -> &'static str {
    NODE_ID.get_or_init(|| {
        if let Ok(id) = std::env::var(NODE_ID_ENV)
            && !id.trim().is_empty()
        {
            return id.trim().to_string();
        }
        if let Ok(hostname) = hostname::get()
            && let Some(name) = hostname.to_str()
            && !name.is_empty()
        {
            return name.to_string();
        }
        uuid::Uuid::new_v4().to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_stable() {
        let a = node_id();
        let b = node_id();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn uptime_starts_near_zero() {
        init_uptime();
        assert!(uptime_seconds() < 60);
    }
}
