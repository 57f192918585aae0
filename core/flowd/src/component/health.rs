use std::fmt;
use std::time::SystemTime;

use serde::Serialize;

/// Health of a unit, or of the node that manages it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub health: HealthType,
    pub message: String,
    #[serde(with = "unix_millis")]
    pub update_time: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthType {
    /// The health is not known yet, for instance because the unit has not been built.
    Unknown,
    Healthy,
    Unhealthy,
    /// The unit has stopped: its run method returned.
    Exited,
}

impl HealthType {
    pub const ALL: [HealthType; 4] = [
        HealthType::Unknown,
        HealthType::Healthy,
        HealthType::Unhealthy,
        HealthType::Exited,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HealthType::Unknown => "unknown",
            HealthType::Healthy => "healthy",
            HealthType::Unhealthy => "unhealthy",
            HealthType::Exited => "exited",
        }
    }

    /// Higher is worse.
    fn priority(self) -> u8 {
        match self {
            HealthType::Healthy => 0,
            HealthType::Unknown => 1,
            HealthType::Exited => 2,
            HealthType::Unhealthy => 3,
        }
    }
}

impl fmt::Display for HealthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Health {
    pub fn new(health: HealthType, message: impl Into<String>) -> Self {
        Self {
            health,
            message: message.into(),
            update_time: SystemTime::now(),
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthType::Healthy, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthType::Unhealthy, message)
    }

    pub fn unknown() -> Self {
        Self::new(HealthType::Unknown, "")
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthType::Healthy
    }

    /// Returns the least healthy of two health records.
    ///
    /// When both have the same [`HealthType`], the most recent one wins.
    pub fn least_healthy(a: Health, b: Health) -> Health {
        let (pa, pb) = (a.health.priority(), b.health.priority());
        if pa > pb || (pa == pb && a.update_time >= b.update_time) {
            a
        } else {
            b
        }
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::unknown()
    }
}

mod unix_millis {
    use std::time::{SystemTime, UNIX_EPOCH};

    use serde::Serializer;

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let millis = t.duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
        s.serialize_u64(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::{Health, HealthType};

    fn at(health: HealthType, secs: u64) -> Health {
        Health {
            health,
            message: format!("{health}@{secs}"),
            update_time: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        }
    }

    #[test]
    fn least_healthy_priority() {
        let h = Health::least_healthy(at(HealthType::Healthy, 5), at(HealthType::Unknown, 1));
        assert_eq!(h.health, HealthType::Unknown);
        let h = Health::least_healthy(at(HealthType::Unhealthy, 1), at(HealthType::Exited, 5));
        assert_eq!(h.health, HealthType::Unhealthy);
        let h = Health::least_healthy(at(HealthType::Exited, 1), at(HealthType::Unknown, 5));
        assert_eq!(h.health, HealthType::Exited);
    }

    #[test]
    fn least_healthy_tie_is_most_recent() {
        let h = Health::least_healthy(at(HealthType::Unhealthy, 1), at(HealthType::Unhealthy, 9));
        assert_eq!(h.message, "unhealthy@9");
        let h = Health::least_healthy(at(HealthType::Healthy, 9), at(HealthType::Healthy, 1));
        assert_eq!(h.message, "healthy@9");
    }
}
